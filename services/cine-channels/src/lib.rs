//! Cine Channels - Slack relay in front of an LLM completion API.
//!
//! ## Architecture
//!
//! ```text
//! Slack ── Socket Mode ──→ SlackChannel ──mpsc──→ RelayBridge
//!                                                   │  ContextStore (per-channel turns)
//!                                                   │  CompletionInvoker ──→ OpenAI
//! Slack ←── chat.postMessage ←── SlackChannel ←─────┘
//! ```
//!
//! A small axum server exposes `/` and `/health` for liveness probes.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod bridge;
pub mod completion;
pub mod context;
pub mod message;
pub mod routes;
pub mod slack;
pub mod traits;

// Re-export commonly used types
pub use bridge::RelayBridge;
pub use completion::{
    CompletionClient, CompletionError, CompletionInvoker, OpenAiClient, FALLBACK_REPLY,
};
pub use context::{
    ContextStore, ConversationGuard, ConversationId, KeepLatest, PreservePersona, Role, Turn,
    TrimPolicy,
};
pub use message::{ChatMessage, EventKind, InboundEvent, OutgoingMessage, Sender};
pub use routes::build_router;
pub use slack::SlackChannel;
pub use traits::{Channel, ChannelError, ChannelResult};

use cine_common::config::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Capacity of the listener → bridge queue.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Build the relay bridge from configuration around an outbound channel.
pub fn build_bridge(config: &Config, outbound: Arc<dyn Channel>) -> anyhow::Result<RelayBridge> {
    let api_key = config
        .openai
        .api_key
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY is not set"))?;
    let timeout = Duration::from_secs(config.openai.request_timeout_secs);

    let client = Arc::new(OpenAiClient::with_base_url(
        api_key,
        config.openai.base_url.clone(),
        timeout,
    ));
    let invoker = CompletionInvoker::new(client, config.openai.model.clone()).with_timeout(timeout);
    let store = Arc::new(ContextStore::from_config(&config.context));

    tracing::info!(
        model = %config.openai.model,
        max_turns = store.max_turns(),
        trim_policy = store.policy_name(),
        "Relay bridge configured"
    );

    Ok(RelayBridge::new(store, invoker, outbound))
}

/// Start the Slack listener, the relay processor, and the liveness server.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    config.validate()?;

    let mut slack = SlackChannel::from_config(&config.slack)?;
    slack.init().await?;
    let slack = Arc::new(slack);

    let bridge = Arc::new(build_bridge(config, slack.clone())?);
    let (tx, rx) = tokio::sync::mpsc::channel(EVENT_QUEUE_CAPACITY);
    let processor_handle = RelayBridge::spawn_processor(bridge, rx);

    let listener_handle = {
        let slack = slack.clone();
        tokio::spawn(async move {
            if let Err(e) = slack.listen(tx).await {
                tracing::error!(error = %e, "Slack listener exited");
            }
        })
    };

    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));
    tracing::info!("Starting liveness server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, build_router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    slack.shutdown().await?;
    listener_handle.abort();
    processor_handle.abort();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
