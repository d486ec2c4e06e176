//! Host side transports. Real channel connectors live outside this crate
//! and implement [`Transport`] from `flowdesk_channel`.

use std::sync::Arc;

use async_trait::async_trait;
use flowdesk_channel::{
    message::{ChannelMessage, MessageContent, Role},
    transport::{Transport, TransportError},
};
use tokio::{
    io::AsyncWriteExt,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tracing::info;

/// Render a message the way a plain text channel would show it.
pub fn render_plain(msg: &ChannelMessage) -> String {
    let who = match msg.from.role {
        Role::Bot => "bot".to_string(),
        Role::Agent => format!("agent {}", msg.from.id),
        Role::Client => format!("client {}", msg.from.id),
        Role::Team => format!("team {}", msg.from.id),
        Role::System => "system".to_string(),
    };
    match &msg.content {
        MessageContent::Text(t) => format!("[{who}] {t}"),
        MessageContent::Menu { prompt, options } => {
            let mut out = format!("[{who}] {prompt}");
            for (i, option) in options.iter().enumerate() {
                out.push_str(&format!("\n  {}. {}", i + 1, option));
            }
            out
        }
        MessageContent::Event(e) => match &e.event_payload {
            Some(p) => format!("[{who}] ({}) {}", e.event_type, p),
            None => format!("[{who}] ({})", e.event_type),
        },
    }
}

/// Writes every delivery to the log.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    fn name(&self) -> String {
        "log".into()
    }

    async fn deliver(&self, conversation_id: &str, msg: ChannelMessage) -> Result<(), TransportError> {
        info!(conversation = conversation_id, to = %msg.to.id, "{}", render_plain(&msg));
        Ok(())
    }
}

/// Prints deliveries addressed to clients on stdout; everything else is
/// shown indented so the operator can follow the agent side.
#[derive(Debug, Clone, Default)]
pub struct ConsoleTransport;

#[async_trait]
impl Transport for ConsoleTransport {
    fn name(&self) -> String {
        "console".into()
    }

    async fn deliver(&self, _conversation_id: &str, msg: ChannelMessage) -> Result<(), TransportError> {
        let mut line = render_plain(&msg);
        if msg.to.role != Role::Client {
            line = format!("    -> {} {}: {}", role_name(msg.to.role), msg.to.id, line);
        }
        line.push('\n');
        let mut out = tokio::io::stdout();
        out.write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Failed(e.to_string()))?;
        out.flush().await.map_err(|e| TransportError::Failed(e.to_string()))
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Client => "client",
        Role::Bot => "bot",
        Role::Agent => "agent",
        Role::Team => "team",
        Role::System => "system",
    }
}

/// Hands every delivery to a channel receiver. Used by tests and by
/// embedders that pump messages into their own connectors.
pub struct RecordingTransport {
    tx: UnboundedSender<ChannelMessage>,
}

impl RecordingTransport {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<ChannelMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> String {
        "recording".into()
    }

    async fn deliver(&self, _conversation_id: &str, msg: ChannelMessage) -> Result<(), TransportError> {
        self.tx.send(msg).map_err(|_| TransportError::Closed)
    }
}
