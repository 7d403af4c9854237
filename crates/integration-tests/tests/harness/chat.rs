//! Conversation fixture wiring a [`ChatState`] to an in-process event hub

use std::sync::Arc;
use std::time::Duration;

use synapse_config::Config;
use synapse_llm::{ChatState, ClientEvent, CompletionRequest, EventHub, Message, StreamingHandler, TurnRequest};
use tokio::sync::broadcast;

/// Shared chat state plus the hub its events are published to
pub struct TestChat {
    state: ChatState,
    hub: Arc<EventHub>,
}

impl TestChat {
    pub fn new(config: &Config) -> Self {
        let hub = Arc::new(EventHub::new(config.llm.chat.event_buffer));
        let state = ChatState::from_config(&config.llm, hub.clone()).expect("chat state builds from config");
        Self { state, hub }
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn streaming(&self) -> StreamingHandler {
        StreamingHandler::new(self.state.clone())
    }

    /// Subscribe to a conversation before starting a turn on it
    pub fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<ClientEvent> {
        self.hub.subscribe(conversation_id)
    }
}

/// Single-message turn against `provider`
pub fn user_turn(conversation_id: &str, provider: &str, text: &str) -> TurnRequest {
    TurnRequest::new(
        conversation_id,
        provider,
        CompletionRequest::new("mock-model", vec![Message::user(text)]),
    )
}

/// Every event received up to and including the first `done`
pub async fn events_until_done(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();

    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("turn finished in time")
            .expect("event channel open");

        let done = event.is_terminal();
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Events still buffered in the channel, without waiting
pub fn drain(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}
