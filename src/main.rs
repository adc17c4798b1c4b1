#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! chat-relay: OpenAI-compatible chat completions served by a browser agent.
//!
//! A browser script drives a chat web UI and holds one WebSocket to this
//! process. API clients call `POST /v1/chat/completions`; each call is relayed
//! over that socket and the agent's reply snapshots come back as deltas.
//!
//! # Usage
//!
//! ```bash
//! chat-relay                          # serve with default config
//! chat-relay serve --config relay.toml
//! chat-relay agent --url ws://127.0.0.1:8765   # reference echo agent
//! ```

use std::process::ExitCode;

use axum::Router;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use chat_relay::config::Config;
use chat_relay::routes;
use chat_relay::AppState;

#[derive(Parser)]
#[command(name = "chat-relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay (default).
    Serve {
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the reference echo agent against a relay.
    Agent {
        #[arg(long)]
        config: Option<String>,
        /// Relay agent socket URL (overrides config).
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Agent { config, url }) => run_agent(config.as_deref(), url).await,
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Config errors happen before the subscriber is installed.
            eprintln!("chat-relay: {e}");
            ExitCode::FAILURE
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn init_logging(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn run_agent(config_path: Option<&str>, url: Option<String>) -> Result<(), BoxError> {
    let mut config = Config::load(config_path)?;
    if let Some(url) = url {
        config.agent.url = url;
    }
    init_logging(&config);

    info!("chat-relay v{} agent starting", env!("CARGO_PKG_VERSION"));
    tokio::select! {
        () = chat_relay::agent::run(config.agent) => {}
        () = shutdown_signal() => {}
    }
    info!("Goodbye");
    Ok(())
}

async fn run_server(config_path: Option<&str>) -> Result<(), BoxError> {
    let config = Config::load(config_path)?;
    init_logging(&config);

    info!("chat-relay v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        busy_policy = ?config.relay.busy_policy,
        idle_timeout_secs = config.relay.idle_timeout_secs,
        "Relay configured"
    );

    let state = AppState::new(config);
    let listen = state.config.server.listen.clone();
    let agent_listen = state.config.server.agent_listen.clone();
    let shared = listen == agent_listen;

    let mut api = routes::api_routes();
    if shared {
        api = api.merge(routes::agent_routes(routes::SHARED_AGENT_PATH));
    }
    let api: Router = api
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&listen).await?;
    info!("API listening on {listen}");

    let agent_task = if shared {
        info!("Agent socket at ws://{listen}{}", routes::SHARED_AGENT_PATH);
        None
    } else {
        let agent_app: Router = routes::agent_routes("/")
            .layer(TraceLayer::new_for_http())
            .with_state(state.clone());
        let agent_listener = TcpListener::bind(&agent_listen).await?;
        info!("Agent socket listening on ws://{agent_listen}");
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(agent_listener, agent_app)
                .with_graceful_shutdown(shutdown_signal())
                .await
            {
                error!("Agent listener error: {e}");
            }
        }))
    };

    info!("Server ready");

    let channel = state.channel.clone();
    axum::serve(listener, api)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Fail the in-flight exchange so its response can finish.
            channel.shutdown("relay shutting down");
        })
        .await?;

    info!("Shutting down...");
    if let Some(task) = agent_task {
        task.abort();
    }
    state.channel.shutdown("relay shutting down");
    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Failed to register SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received SIGINT");
    }
}
