use async_trait::async_trait;
use thiserror::Error;

use crate::message::ChannelMessage;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("recipient `{0}` is not reachable")]
    Unreachable(String),
    #[error("transport is closed")]
    Closed,
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// The real-time delivery side of a channel.
///
/// Delivery is fire-and-forget from the engine's point of view: a failed
/// delivery is logged by the caller and never changes conversation state.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> String;

    async fn deliver(&self, conversation_id: &str, msg: ChannelMessage) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageContent, MessageDirection, Participant};
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<String>>);

    #[async_trait]
    impl Transport for Recording {
        fn name(&self) -> String {
            "recording".into()
        }

        async fn deliver(&self, conversation_id: &str, _msg: ChannelMessage) -> Result<(), TransportError> {
            self.0.lock().unwrap().push(conversation_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn transport_is_object_safe() {
        let t: Box<dyn Transport> = Box::new(Recording(Mutex::new(vec![])));
        let msg = ChannelMessage::new(
            "conv",
            "web",
            MessageDirection::Outgoing,
            Participant::bot(),
            Participant::client("c"),
            MessageContent::Text("hello".into()),
        );
        t.deliver("conv", msg).await.unwrap();
        assert_eq!(t.name(), "recording");
    }
}
