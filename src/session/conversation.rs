use chrono::{DateTime, Utc};
use flowdesk_channel::message::{MessageContent, Participant};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::flow::engine::{Awaiting, FlowInstance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    /// driven by the flow engine
    Bot,
    /// queued for a team
    Waiting,
    /// assigned to an agent
    Active,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    FlowFinished,
    IdleTimeout,
    ClosedByAgent,
    ClosedBySystem,
    NoAgentAvailable,
    ExecutionError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub at: DateTime<Utc>,
    pub from: Participant,
    pub content: MessageContent,
}

/// One client's conversation on one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub channel_id: String,
    pub client_id: String,
    pub flow: FlowInstance,
    pub status: ConversationStatus,
    pub team_id: Option<String>,
    pub agent_id: Option<String>,
    /// an agent claimed this conversation at some point
    pub ever_assigned: bool,
    pub last_client_activity_at: DateTime<Utc>,
    /// monotonic twin of `last_client_activity_at`, what idle expiry counts from
    #[serde(skip, default = "Instant::now")]
    pub last_client_instant: Instant,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub finish_reason: Option<FinishReason>,
    pub transcript: Vec<TranscriptEntry>,
    /// flow notes meant for the agent who picks the conversation up
    pub notes: Vec<String>,
}

impl Conversation {
    pub fn new(
        channel_id: impl Into<String>,
        client_id: impl Into<String>,
        flow_id: impl Into<String>,
        flow_version: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            client_id: client_id.into(),
            flow: FlowInstance::new(flow_id, flow_version),
            status: ConversationStatus::Bot,
            team_id: None,
            agent_id: None,
            ever_assigned: false,
            last_client_activity_at: now,
            last_client_instant: Instant::now(),
            created_at: now,
            finished_at: None,
            finish_reason: None,
            transcript: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == ConversationStatus::Finished
    }

    /// Id of the external call the flow is suspended on.
    pub fn pending_request(&self) -> Option<&str> {
        match &self.flow.awaiting {
            Some(Awaiting::External { request_id }) => Some(request_id),
            _ => None,
        }
    }

    pub fn touch(&mut self) {
        self.last_client_activity_at = Utc::now();
        self.last_client_instant = Instant::now();
    }

    pub fn record(&mut self, from: Participant, content: MessageContent) {
        self.transcript.push(TranscriptEntry { at: Utc::now(), from, content });
    }

    /// Returns false when the conversation was already finished.
    pub fn finish(&mut self, reason: FinishReason) -> bool {
        if self.is_finished() {
            return false;
        }
        self.status = ConversationStatus::Finished;
        self.finished_at = Some(Utc::now());
        self.finish_reason = Some(reason);
        true
    }
}
