//! Relay bridge between the chat channel and the completion API.
//!
//! Handles the complete message flow:
//! 1. Drop messages authored by the bot itself
//! 2. Append the user turn to the conversation
//! 3. Ask the completion API for a reply using the bounded context
//! 4. Append the assistant turn (the reply, or the fallback on failure)
//! 5. Send the reply back to the originating channel
//!
//! Steps 2-4 run under the conversation's lock, so two messages in the same
//! channel can never interleave. The processor additionally routes each
//! channel through its own queue so messages are handled in arrival order.

use crate::completion::CompletionInvoker;
use crate::context::{ContextStore, Turn};
use crate::message::{EventKind, InboundEvent, OutgoingMessage};
use crate::traits::{Channel, ChannelResult};
use cine_common::logging::generate_trace_id;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Bridge between a chat channel and the completion API.
pub struct RelayBridge {
    store: Arc<ContextStore>,
    invoker: CompletionInvoker,
    outbound: Arc<dyn Channel>,
}

impl RelayBridge {
    /// Create a new bridge.
    pub fn new(store: Arc<ContextStore>, invoker: CompletionInvoker, outbound: Arc<dyn Channel>) -> Self {
        Self {
            store,
            invoker,
            outbound,
        }
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    /// Record `text` as a user turn and return the assistant reply.
    ///
    /// The reply is always recorded, including the fallback text when the
    /// completion call fails.
    pub async fn converse(&self, conversation_id: &str, text: &str) -> String {
        let mut conversation = self.store.lock(conversation_id).await;
        conversation.append(Turn::user(text));

        let reply = self.invoker.reply(conversation.turns()).await;

        conversation.append(Turn::assistant(reply.clone()));
        tracing::debug!(
            conversation_id,
            turns = conversation.turns().len(),
            "Conversation updated"
        );
        reply
    }

    /// Process one inbound event and send the reply.
    ///
    /// Returns the reply text, or `None` when the event was not answered.
    pub async fn process(&self, event: InboundEvent) -> ChannelResult<Option<String>> {
        if event.is_from_bot() {
            tracing::debug!(channel_id = %event.channel_id(), "Ignoring message from the bot itself");
            return Ok(None);
        }

        let channel_id = event.channel_id();
        tracing::info!(
            kind = event.kind().as_str(),
            channel_id = %channel_id,
            text = %event.text(),
            "Processing message"
        );

        let reply = self.converse(channel_id, event.text()).await;

        tracing::info!(channel_id = %channel_id, reply = %reply, "Sending response");
        self.outbound
            .send(OutgoingMessage::text(channel_id, reply.clone()))
            .await?;

        Ok(Some(reply))
    }

    /// Process an event, answering with an apology if anything goes wrong.
    ///
    /// Panics inside processing are contained here as well.
    pub async fn handle(self: &Arc<Self>, event: InboundEvent) {
        let trace_id = generate_trace_id();
        let kind = event.kind();
        let channel_id = event.channel_id().to_string();

        let worker = {
            let bridge = self.clone();
            tokio::spawn(async move { bridge.process(event).await })
        };

        let failure = match worker.await {
            Ok(Ok(_)) => return,
            Ok(Err(e)) => e.to_string(),
            Err(join_error) => format!("handler panicked: {join_error}"),
        };

        tracing::error!(
            trace_id = %trace_id,
            kind = kind.as_str(),
            channel_id = %channel_id,
            error = %failure,
            "Error handling {}",
            kind.as_str()
        );
        self.apologize(&channel_id, kind).await;
    }

    async fn apologize(&self, channel_id: &str, kind: EventKind) {
        if let Err(e) = self
            .outbound
            .send(OutgoingMessage::text(channel_id, kind.apology()))
            .await
        {
            tracing::error!(channel_id, error = %e, "Failed to send apology");
        }
    }

    /// Start a background processor for events from a channel listener.
    ///
    /// Each conversation gets its own queue and worker; conversations run in
    /// parallel, messages within one conversation run one at a time in order.
    pub fn spawn_processor(
        bridge: Arc<Self>,
        mut rx: mpsc::Receiver<InboundEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Relay processor started");
            let mut lanes: HashMap<String, mpsc::UnboundedSender<InboundEvent>> = HashMap::new();

            while let Some(event) = rx.recv().await {
                if event.is_from_bot() {
                    continue;
                }

                let lane = lanes
                    .entry(event.channel_id().to_string())
                    .or_insert_with(|| Self::spawn_lane(bridge.clone()));

                if let Err(mpsc::error::SendError(event)) = lane.send(event) {
                    tracing::warn!(channel_id = %event.channel_id(), "Conversation worker gone, restarting");
                    let lane = Self::spawn_lane(bridge.clone());
                    let channel_id = event.channel_id().to_string();
                    let _ = lane.send(event);
                    lanes.insert(channel_id, lane);
                }
            }

            tracing::info!("Relay processor stopped");
        })
    }

    fn spawn_lane(bridge: Arc<Self>) -> mpsc::UnboundedSender<InboundEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                bridge.handle(event).await;
            }
        });
        tx
    }
}
