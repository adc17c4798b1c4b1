//! Prompt framing for the chat UI.
//!
//! The browser agent types one message into the page, so the whole
//! conversation is serialized as JSON inside a fixed instruction.

use serde_json::Value;

const PREAMBLE: &str = "Now you must play the role of system and answer the user.\n\n";
const SUFFIX: &str = "\n\nYour answer:";

/// Wrap the serialized conversation in the instruction the chat UI receives.
pub fn build(messages: &[Value]) -> String {
    let conversation = serde_json::to_string(messages).unwrap_or_default();
    format!("{PREAMBLE}{conversation}{SUFFIX}")
}

/// Recover the conversation from a framed prompt.
pub fn messages(prompt: &str) -> Option<Vec<Value>> {
    let body = prompt.strip_prefix(PREAMBLE)?.strip_suffix(SUFFIX)?;
    serde_json::from_str(body).ok()
}

/// Text content of the last message in a framed prompt.
pub fn last_content(prompt: &str) -> Option<String> {
    messages(prompt)?
        .last()?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_framing() {
        let messages = vec![json!({"role": "user", "content": "hi"})];
        let prompt = build(&messages);
        assert!(prompt.starts_with("Now you must play the role of system and answer the user.\n\n["));
        assert!(prompt.ends_with("]\n\nYour answer:"));
        assert!(prompt.contains(r#""content":"hi""#));
    }

    #[test]
    fn test_recover_last_content() {
        let prompt = build(&[
            json!({"role": "system", "content": "be brief"}),
            json!({"role": "user", "content": "what is 2+2?"}),
        ]);
        assert_eq!(last_content(&prompt).as_deref(), Some("what is 2+2?"));
        assert_eq!(messages(&prompt).map(|m| m.len()), Some(2));
    }

    #[test]
    fn test_unframed_text() {
        assert_eq!(last_content("just text"), None);
        assert_eq!(last_content(&build(&[])), None);
    }
}
