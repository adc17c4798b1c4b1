//! Snapshot-to-delta translation.
//!
//! The agent only ever reports "the full answer so far". Streaming consumers
//! want append-only deltas, so each snapshot is diffed against the previous one
//! and only the suffix past the longest common prefix is forwarded.

use tracing::warn;

/// Suffix of `new` past the longest prefix it shares with `previous`.
///
/// Comparison is per `char`, so the returned slice always starts on a char
/// boundary. If `new` is shorter than `previous` the source re-rendered or
/// truncated; no prefix match is attempted and all of `new` is returned.
pub fn compute_delta<'a>(previous: &str, new: &'a str) -> &'a str {
    if previous.is_empty() || is_shrink(previous, new) {
        return new;
    }
    &new[common_prefix_len(previous, new)..]
}

/// Whether `new` has fewer characters than `previous`.
pub fn is_shrink(previous: &str, new: &str) -> bool {
    new.chars().count() < previous.chars().count()
}

/// Byte length of the longest shared prefix. Identical prefixes are identical
/// bytes, so the offset is a char boundary in both strings.
fn common_prefix_len(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, ca), cb)| ca != cb)
        .map_or_else(|| a.len().min(b.len()), |((i, _), _)| i)
}

/// Per-exchange diff baseline.
///
/// Trimming is fixed at construction so every snapshot of an exchange is
/// compared the same way.
#[derive(Debug, Clone)]
pub struct DeltaState {
    baseline: String,
    trim: bool,
}

impl DeltaState {
    pub fn new(trim: bool) -> Self {
        Self {
            baseline: String::new(),
            trim,
        }
    }

    /// Diff `snapshot` against the baseline, then make it the new baseline.
    pub fn advance(&mut self, snapshot: &str) -> String {
        let snapshot = if self.trim { snapshot.trim() } else { snapshot };
        if !self.baseline.is_empty() && is_shrink(&self.baseline, snapshot) {
            warn!(
                previous_len = self.baseline.len(),
                new_len = snapshot.len(),
                "Snapshot shrank, replacing baseline and re-sending full text"
            );
        }
        let delta = compute_delta(&self.baseline, snapshot).to_string();
        snapshot.clone_into(&mut self.baseline);
        delta
    }

    /// Last snapshot seen (post-trim).
    pub fn baseline(&self) -> &str {
        &self.baseline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_previous_yields_everything() {
        assert_eq!(compute_delta("", "Hello"), "Hello");
        assert_eq!(compute_delta("", ""), "");
    }

    #[test]
    fn test_extension_yields_suffix() {
        for (a, b) in [("Hel", "Hello"), ("Hello", "Hello!"), ("x", "x"), ("ab", "abc def")] {
            assert_eq!(compute_delta(a, b), &b[a.len()..]);
        }
    }

    #[test]
    fn test_shrink_yields_full_new_snapshot() {
        assert_eq!(compute_delta("Hello world", "Help"), "Help");
        assert_eq!(compute_delta("Hello", "Hell"), "Hell");
    }

    #[test]
    fn test_divergence_yields_suffix_after_mismatch() {
        // Same length, edited in the middle: re-send from the first difference.
        assert_eq!(compute_delta("Hello", "Help!"), "p!");
        assert_eq!(compute_delta("abc", "xyzw"), "xyzw");
    }

    #[test]
    fn test_multibyte_boundaries() {
        assert_eq!(compute_delta("héllo", "héllo wörld"), " wörld");
        assert_eq!(compute_delta("日本", "日本語"), "語");
        assert_eq!(compute_delta("日本", "日x語"), "x語");
        // Fewer chars even though more bytes.
        assert_eq!(compute_delta("abcd", "日本語"), "日本語");
    }

    #[test]
    fn test_state_sequence() {
        let mut state = DeltaState::new(true);
        assert_eq!(state.advance("Hel"), "Hel");
        assert_eq!(state.advance("Hello"), "lo");
        assert_eq!(state.advance("Hello!"), "!");
        assert_eq!(state.advance("Hello!"), "");
        assert_eq!(state.baseline(), "Hello!");
    }

    #[test]
    fn test_state_trims_consistently() {
        let mut state = DeltaState::new(true);
        assert_eq!(state.advance("  Hi   "), "Hi");
        assert_eq!(state.advance("Hi there     "), " there");
        assert_eq!(state.baseline(), "Hi there");
    }

    #[test]
    fn test_state_without_trim_keeps_whitespace() {
        let mut state = DeltaState::new(false);
        assert_eq!(state.advance("Hi "), "Hi ");
        assert_eq!(state.advance("Hi there"), "there");
    }

    #[test]
    fn test_state_shrink_replaces_baseline() {
        let mut state = DeltaState::new(true);
        state.advance("Hello world");
        assert_eq!(state.advance("Hello"), "Hello");
        assert_eq!(state.baseline(), "Hello");
        assert_eq!(state.advance("Hello again"), " again");
    }
}
