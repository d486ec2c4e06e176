use std::sync::Arc;

use flowdesk_channel::{
    message::{ChannelMessage, Event, MessageContent, MessageDirection, Participant, Role},
    transport::Transport,
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::directory::{AgentDirectory, Team};
use crate::flow::engine::{Awaiting, ControlEffect, ExecutionError, ExecutionResult, ExternalRequest};
use crate::flow::manager::FlowStore;
use crate::logger::lifecycle_event;
use crate::session::conversation::{Conversation, ConversationStatus, FinishReason};
use crate::session::queue::{TeamQueues, WaitingQueueEntry};
use crate::session::store::ConversationStore;
use crate::session::timer::{Scheduler, TimerKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("conversation `{conversation_id}` is not waiting to be claimed")]
    QueueAssignmentConflict { conversation_id: String },
    #[error("agent `{agent_id}` is not a member of team `{team_id}`")]
    NotTeamMember { agent_id: String, team_id: String },
    #[error("unknown team `{0}`")]
    UnknownTeam(String),
    #[error("agent `{0}` cannot take more conversations")]
    AgentUnavailable(String),
    #[error("agent `{agent_id}` is not assigned to conversation `{conversation_id}`")]
    NotAssigned { agent_id: String, conversation_id: String },
    #[error("unknown conversation `{0}`")]
    UnknownConversation(String),
    #[error("conversation `{0}` is finished")]
    Finished(String),
}

/// Who closes a conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum Closer {
    Agent(String),
    System(FinishReason),
}

/// Owns the conversation lifecycle: hand-off into team queues, agent
/// assignment, closing and idle expiry. Every method expects the caller to
/// hold the conversation lock.
pub struct SessionManager {
    store: ConversationStore,
    flows: Arc<dyn FlowStore>,
    queues: TeamQueues,
    scheduler: Arc<Scheduler>,
    directory: Arc<dyn AgentDirectory>,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
}

pub(crate) fn event(event_type: &str, payload: serde_json::Value) -> MessageContent {
    MessageContent::Event(Event {
        event_type: event_type.to_string(),
        event_payload: Some(payload),
    })
}

impl SessionManager {
    pub fn new(
        store: ConversationStore,
        flows: Arc<dyn FlowStore>,
        scheduler: Arc<Scheduler>,
        directory: Arc<dyn AgentDirectory>,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            flows,
            queues: TeamQueues::new(),
            scheduler,
            directory,
            transport,
            config,
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn waiting(&self, team_id: &str) -> Vec<WaitingQueueEntry> {
        self.queues.snapshot(team_id).await
    }

    async fn team_of(&self, conv: &Conversation) -> Option<Team> {
        match &conv.team_id {
            Some(id) => self.directory.team(id).await,
            None => None,
        }
    }

    /// Record `content` in the transcript and deliver it. Delivery failures
    /// are logged; they never change the conversation.
    pub async fn send(&self, conv: &mut Conversation, from: Participant, to: Participant, content: MessageContent) {
        conv.record(from.clone(), content.clone());
        self.deliver(conv, from, to, content).await;
    }

    /// Deliver without recording; used for client messages that were
    /// recorded on arrival.
    pub async fn relay(&self, conv: &Conversation, from: Participant, to: Participant, content: MessageContent) {
        self.deliver(conv, from, to, content).await;
    }

    async fn deliver(&self, conv: &Conversation, from: Participant, to: Participant, content: MessageContent) {
        let direction = if from.role == Role::Client {
            MessageDirection::Incoming
        } else {
            MessageDirection::Outgoing
        };
        let msg = ChannelMessage::new(conv.id.clone(), conv.channel_id.clone(), direction, from, to, content);
        if let Err(e) = self.transport.deliver(&conv.id, msg).await {
            warn!(conversation = %conv.id, transport = %self.transport.name(), "delivery failed: {}", e);
        }
    }

    fn client(conv: &Conversation) -> Participant {
        Participant::client(conv.client_id.clone())
    }

    /// Arm the idle timer to fire once the client has been silent for the
    /// team timeout, or the configured default when there is no team.
    /// Re-arming only changes which timeout applies, never when silence
    /// started.
    pub async fn arm_idle(&self, conv: &Conversation) {
        let timeout = match self.team_of(conv).await {
            Some(team) => team.session_timeout(),
            None => self.config.session_timeout,
        };
        let remaining = timeout.saturating_sub(conv.last_client_instant.elapsed());
        self.scheduler.schedule(&conv.id, TimerKind::Idle, remaining);
    }

    /// Apply a step result and carry out its effect. Returns the external
    /// request the flow now waits for, if any.
    pub async fn apply_execution(&self, conv: &mut Conversation, result: ExecutionResult) -> Option<ExternalRequest> {
        if result.effect == ControlEffect::Ignored {
            debug!(conversation = %conv.id, "event ignored by the flow");
            return None;
        }
        for w in &result.warnings {
            warn!(conversation = %conv.id, flow = %result.flow_id, "{}", w);
        }
        if (result.flow_id.as_str(), result.flow_version) != (conv.flow.flow_id.as_str(), conv.flow.flow_version) {
            if !self.flows.acquire(&result.flow_id, result.flow_version) {
                let err = ExecutionError::UnknownFlowVersion {
                    flow_id: result.flow_id.clone(),
                    version: result.flow_version,
                };
                self.fail(conv, err).await;
                return None;
            }
            self.flows.release(&conv.flow.flow_id, conv.flow.flow_version);
        }
        conv.flow.apply(&result);
        conv.notes.extend(result.notes);
        let client = Self::client(conv);
        for content in result.outbound {
            self.send(conv, Participant::bot(), client.clone(), content).await;
        }

        if !matches!(conv.flow.awaiting, Some(Awaiting::External { .. })) {
            self.scheduler.cancel(&conv.id, TimerKind::External);
        }
        if conv.flow.awaiting != Some(Awaiting::Timer) {
            self.scheduler.cancel(&conv.id, TimerKind::Delay);
        }

        match result.effect {
            ControlEffect::Continue | ControlEffect::Ignored => None,
            ControlEffect::HandOff { team_id } => {
                self.hand_off(conv, &team_id).await;
                None
            }
            ControlEffect::Finish => {
                self.finish(conv, FinishReason::FlowFinished, None).await;
                None
            }
            ControlEffect::AwaitExternal { request } => {
                self.scheduler
                    .schedule(&conv.id, TimerKind::External, self.config.external_timeout);
                Some(request)
            }
            ControlEffect::ScheduleTimer { delay } => {
                self.scheduler.schedule(&conv.id, TimerKind::Delay, delay);
                None
            }
        }
    }

    /// A step failed: apologise and close.
    pub async fn fail(&self, conv: &mut Conversation, err: ExecutionError) {
        error!(conversation = %conv.id, flow = %conv.flow.flow_id, "flow execution failed: {}", err);
        let apology = self.config.apology_message.clone();
        self.finish(conv, FinishReason::ExecutionError, Some(apology)).await;
    }

    #[tracing::instrument(skip(self, conv), fields(conversation = %conv.id))]
    pub async fn hand_off(&self, conv: &mut Conversation, team_id: &str) {
        let Some(team) = self.directory.team(team_id).await else {
            warn!("hand-off to unknown team");
            let msg = self.config.no_team_message.clone();
            self.finish(conv, FinishReason::NoAgentAvailable, Some(msg)).await;
            return;
        };
        conv.team_id = Some(team.id.clone());
        if team.member_agent_ids.is_empty() {
            info!("team has no members");
            self.finish(conv, FinishReason::NoAgentAvailable, Some(team.no_agent_message))
                .await;
            return;
        }

        conv.status = ConversationStatus::Waiting;
        let position = self.queues.enqueue(&team.id, &conv.id).await;
        self.arm_idle(conv).await;

        let client = Self::client(conv);
        self.send(conv, Participant::system(), client, event("queued", json!({ "team": team.id, "position": position })))
            .await;
        let notice = event(
            "waiting",
            json!({
                "conversation_id": conv.id,
                "client_id": conv.client_id,
                "position": position,
                "notes": conv.notes,
                "available_agents": self.directory.list_available_agents(&team.id).await,
            }),
        );
        self.relay(conv, Participant::system(), Participant::team(team.id.clone()), notice)
            .await;
        lifecycle_event(&conv.id, "queued", &team.id);
    }

    /// Assign a waiting conversation to `agent_id`.
    #[tracing::instrument(skip(self, conv), fields(conversation = %conv.id))]
    pub async fn claim(&self, conv: &mut Conversation, agent_id: &str) -> Result<(), SessionError> {
        match conv.status {
            ConversationStatus::Waiting => {}
            ConversationStatus::Finished => return Err(SessionError::Finished(conv.id.clone())),
            _ => {
                return Err(SessionError::QueueAssignmentConflict {
                    conversation_id: conv.id.clone(),
                })
            }
        }
        let team_id = conv.team_id.clone().unwrap_or_default();
        let team = self
            .directory
            .team(&team_id)
            .await
            .ok_or_else(|| SessionError::UnknownTeam(team_id.clone()))?;
        if !team.has_member(agent_id) {
            return Err(SessionError::NotTeamMember {
                agent_id: agent_id.to_string(),
                team_id,
            });
        }
        if !self.directory.claim(agent_id, &conv.id).await {
            return Err(SessionError::AgentUnavailable(agent_id.to_string()));
        }

        self.queues.remove(&team.id, &conv.id).await;
        conv.status = ConversationStatus::Active;
        conv.agent_id = Some(agent_id.to_string());
        conv.ever_assigned = true;
        self.arm_idle(conv).await;

        let client = Self::client(conv);
        self.send(conv, Participant::system(), client, event("agent_joined", json!({ "agent": agent_id })))
            .await;
        let briefing = event(
            "assigned",
            json!({
                "conversation_id": conv.id,
                "client_id": conv.client_id,
                "notes": conv.notes,
                "variables": conv.flow.variables.to_json(),
            }),
        );
        self.relay(conv, Participant::system(), Participant::agent(agent_id), briefing)
            .await;
        info!(agent = agent_id, "conversation assigned");
        lifecycle_event(&conv.id, "assigned", agent_id);
        Ok(())
    }

    /// Take the oldest claimable conversation of the team. Heads that can no
    /// longer be claimed are dropped and the next one is tried.
    #[tracing::instrument(skip(self))]
    pub async fn accept_next(&self, agent_id: &str, team_id: &str) -> Result<Option<String>, SessionError> {
        let team = self
            .directory
            .team(team_id)
            .await
            .ok_or_else(|| SessionError::UnknownTeam(team_id.to_string()))?;
        if !team.has_member(agent_id) {
            return Err(SessionError::NotTeamMember {
                agent_id: agent_id.to_string(),
                team_id: team_id.to_string(),
            });
        }

        while let Some(entry) = self.queues.pop_front(team_id).await {
            let Some(handle) = self.store.get(&entry.conversation_id).await else {
                continue;
            };
            let mut conv = handle.lock().await;
            match self.claim(&mut conv, agent_id).await {
                Ok(()) => return Ok(Some(conv.id.clone())),
                Err(SessionError::QueueAssignmentConflict { .. }) | Err(SessionError::Finished(_)) => {
                    debug!(conversation = %entry.conversation_id, "queue head no longer claimable");
                }
                Err(e) => {
                    drop(conv);
                    self.queues.requeue_front(entry).await;
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    /// A message typed by the assigned agent.
    pub async fn agent_message(&self, conv: &mut Conversation, agent_id: &str, text: String) -> Result<(), SessionError> {
        if conv.is_finished() {
            return Err(SessionError::Finished(conv.id.clone()));
        }
        if conv.status != ConversationStatus::Active || conv.agent_id.as_deref() != Some(agent_id) {
            return Err(SessionError::NotAssigned {
                agent_id: agent_id.to_string(),
                conversation_id: conv.id.clone(),
            });
        }
        let client = Self::client(conv);
        self.send(conv, Participant::agent(agent_id), client, MessageContent::Text(text))
            .await;
        Ok(())
    }

    /// Close the conversation. Closing twice is a no-op that returns false.
    #[tracing::instrument(skip(self, conv), fields(conversation = %conv.id))]
    pub async fn close(&self, conv: &mut Conversation, closer: Closer) -> Result<bool, SessionError> {
        if conv.is_finished() {
            return Ok(false);
        }
        let reason = match closer {
            Closer::Agent(agent_id) => {
                if conv.agent_id.as_deref() != Some(agent_id.as_str()) {
                    return Err(SessionError::NotAssigned {
                        agent_id,
                        conversation_id: conv.id.clone(),
                    });
                }
                FinishReason::ClosedByAgent
            }
            Closer::System(reason) => reason,
        };
        let message = match conv.status {
            ConversationStatus::Active => self.team_of(conv).await.map(|t| t.finish_message),
            _ => None,
        };
        self.finish(conv, reason, message).await;
        Ok(true)
    }

    /// The idle timer fired.
    #[tracing::instrument(skip(self, conv), fields(conversation = %conv.id))]
    pub async fn expire(&self, conv: &mut Conversation) {
        let message = match conv.status {
            ConversationStatus::Finished => return,
            ConversationStatus::Active => self.team_of(conv).await.map(|t| t.finish_message),
            ConversationStatus::Waiting if !conv.ever_assigned => self.team_of(conv).await.map(|t| t.no_agent_message),
            ConversationStatus::Waiting => None,
            ConversationStatus::Bot => self.config.bot_timeout_message.clone(),
        };
        info!(status = ?conv.status, "conversation idle for too long");
        self.finish(conv, FinishReason::IdleTimeout, message).await;
    }

    /// Move to Finished and tear down everything the conversation holds.
    pub async fn finish(&self, conv: &mut Conversation, reason: FinishReason, message: Option<String>) {
        if !conv.finish(reason.clone()) {
            return;
        }
        self.flows.release(&conv.flow.flow_id, conv.flow.flow_version);
        self.scheduler.cancel_all(&conv.id);
        if let Some(team_id) = &conv.team_id {
            self.queues.remove(team_id, &conv.id).await;
        }
        if let Some(agent_id) = conv.agent_id.clone() {
            self.directory.release(&agent_id, &conv.id).await;
            let notice = event("closed", json!({ "conversation_id": conv.id, "reason": reason }));
            self.relay(conv, Participant::system(), Participant::agent(agent_id), notice)
                .await;
        }
        self.store
            .release(&conv.channel_id, &conv.client_id, &conv.id)
            .await;
        if let Some(text) = message {
            let client = Self::client(conv);
            self.send(conv, Participant::system(), client, MessageContent::Text(text))
                .await;
        }
        info!(conversation = %conv.id, ?reason, "conversation finished");
        lifecycle_event(&conv.id, "finished", &format!("{:?}", reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RecordingTransport;
    use crate::directory::{Agent, InMemoryAgentDirectory};
    use crate::flow::manager::FlowManager;
    use crate::session::store::InMemoryConversationStore;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn team(id: &str, members: &[&str]) -> Team {
        Team {
            id: id.into(),
            name: id.into(),
            session_timeout_seconds: 60,
            finish_message: "Bye from support".into(),
            no_agent_message: "Nobody is around".into(),
            member_agent_ids: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn agent(id: &str) -> Agent {
        Agent { id: id.into(), name: id.into(), max_conversations: 2, online: true }
    }

    struct Fixture {
        manager: SessionManager,
        outbox: UnboundedReceiver<ChannelMessage>,
        directory: Arc<InMemoryAgentDirectory>,
    }

    fn fixture() -> Fixture {
        let directory = InMemoryAgentDirectory::new();
        directory.upsert_team(team("support", &["ana", "rui"]));
        directory.upsert_team(team("empty", &[]));
        directory.upsert_agent(agent("ana"));
        directory.upsert_agent(agent("rui"));
        let (transport, outbox) = RecordingTransport::new();
        let (scheduler, _timers) = Scheduler::new();
        let manager = SessionManager::new(
            InMemoryConversationStore::new(),
            FlowManager::new(),
            Arc::new(scheduler),
            directory.clone(),
            transport,
            EngineConfig::default(),
        );
        Fixture { manager, outbox, directory }
    }

    fn to_client(outbox: &mut UnboundedReceiver<ChannelMessage>) -> Vec<MessageContent> {
        let mut out = vec![];
        while let Ok(m) = outbox.try_recv() {
            if m.to.role == Role::Client {
                out.push(m.content);
            }
        }
        out
    }

    async fn waiting_conversation(f: &Fixture) -> crate::session::store::ConversationHandle {
        let (handle, _) = f.manager.store().get_or_create("web", "alice", "flow", 1).await;
        f.manager.hand_off(&mut *handle.lock().await, "support").await;
        handle
    }

    #[tokio::test]
    async fn zero_member_team_sends_only_its_no_agent_message() {
        let mut f = fixture();
        let mut conv = Conversation::new("web", "alice", "flow", 1);
        f.manager.hand_off(&mut conv, "empty").await;
        assert_eq!(conv.status, ConversationStatus::Finished);
        assert_eq!(conv.finish_reason, Some(FinishReason::NoAgentAvailable));
        assert_eq!(to_client(&mut f.outbox), vec![MessageContent::Text("Nobody is around".into())]);
    }

    #[tokio::test]
    async fn unknown_team_uses_configured_fallback() {
        let mut f = fixture();
        let mut conv = Conversation::new("web", "alice", "flow", 1);
        f.manager.hand_off(&mut conv, "ghosts").await;
        assert!(conv.is_finished());
        assert_eq!(
            to_client(&mut f.outbox),
            vec![MessageContent::Text(EngineConfig::default().no_team_message)]
        );
    }

    #[tokio::test]
    async fn hand_off_queues_and_claim_assigns_once() {
        let f = fixture();
        let handle = waiting_conversation(&f).await;
        let id = handle.lock().await.id.clone();
        assert_eq!(f.manager.waiting("support").await.len(), 1);

        let mut conv = handle.lock().await;
        assert_eq!(conv.status, ConversationStatus::Waiting);
        f.manager.claim(&mut conv, "ana").await.unwrap();
        assert_eq!(conv.status, ConversationStatus::Active);
        assert!(conv.ever_assigned);
        assert!(f.manager.waiting("support").await.is_empty());
        assert_eq!(f.directory.load_of("ana").await, 1);

        let err = f.manager.claim(&mut conv, "rui").await.unwrap_err();
        assert_eq!(err, SessionError::QueueAssignmentConflict { conversation_id: id });
    }

    #[tokio::test]
    async fn outsiders_cannot_claim() {
        let f = fixture();
        f.directory.upsert_agent(agent("eve"));
        let handle = waiting_conversation(&f).await;
        let mut conv = handle.lock().await;
        assert!(matches!(
            f.manager.claim(&mut conv, "eve").await,
            Err(SessionError::NotTeamMember { .. })
        ));
        assert_eq!(conv.status, ConversationStatus::Waiting);
    }

    #[tokio::test]
    async fn accept_next_skips_closed_heads() {
        let f = fixture();
        let first = waiting_conversation(&f).await;
        let (second, _) = f.manager.store().get_or_create("web", "bob", "flow", 1).await;
        f.manager.hand_off(&mut *second.lock().await, "support").await;

        // closing removes it from the queue; simulate a stale entry by
        // re-adding the finished conversation at the head
        let first_id = first.lock().await.id.clone();
        f.manager
            .close(&mut *first.lock().await, Closer::System(FinishReason::ClosedBySystem))
            .await
            .unwrap();
        f.manager
            .queues
            .requeue_front(WaitingQueueEntry {
                conversation_id: first_id,
                team_id: "support".into(),
                enqueued_at: chrono::Utc::now(),
            })
            .await;

        let picked = f.manager.accept_next("ana", "support").await.unwrap();
        assert_eq!(picked, Some(second.lock().await.id.clone()));
        assert_eq!(f.manager.accept_next("ana", "support").await.unwrap(), None);
    }

    #[tokio::test]
    async fn accept_next_keeps_head_when_agent_is_full() {
        let f = fixture();
        f.directory.upsert_agent(Agent { max_conversations: 0, ..agent("rui") });
        waiting_conversation(&f).await;
        assert_eq!(
            f.manager.accept_next("rui", "support").await,
            Err(SessionError::AgentUnavailable("rui".into()))
        );
        assert_eq!(f.manager.waiting("support").await.len(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_says_goodbye_when_active() {
        let mut f = fixture();
        let handle = waiting_conversation(&f).await;
        let mut conv = handle.lock().await;
        f.manager.claim(&mut conv, "ana").await.unwrap();
        to_client(&mut f.outbox);

        assert!(matches!(
            f.manager.close(&mut conv, Closer::Agent("rui".into())).await,
            Err(SessionError::NotAssigned { .. })
        ));
        assert!(f.manager.close(&mut conv, Closer::Agent("ana".into())).await.unwrap());
        assert!(!f.manager.close(&mut conv, Closer::Agent("ana".into())).await.unwrap());
        assert_eq!(conv.finish_reason, Some(FinishReason::ClosedByAgent));
        assert_eq!(to_client(&mut f.outbox), vec![MessageContent::Text("Bye from support".into())]);
        assert_eq!(f.directory.load_of("ana").await, 0);
        assert!(f.manager.store().find_open("web", "alice").await.is_none());
    }

    #[tokio::test]
    async fn expiry_message_depends_on_status() {
        let mut f = fixture();

        let handle = waiting_conversation(&f).await;
        to_client(&mut f.outbox);
        f.manager.expire(&mut *handle.lock().await).await;
        assert_eq!(to_client(&mut f.outbox), vec![MessageContent::Text("Nobody is around".into())]);

        let mut bot = Conversation::new("web", "carol", "flow", 1);
        f.manager.expire(&mut bot).await;
        assert_eq!(bot.finish_reason, Some(FinishReason::IdleTimeout));
        assert!(to_client(&mut f.outbox).is_empty());
    }

    #[tokio::test]
    async fn waiting_notice_lists_available_agents() {
        let mut f = fixture();
        f.directory.upsert_agent(Agent { online: false, ..agent("rui") });
        waiting_conversation(&f).await;

        let mut notice = None;
        while let Ok(m) = f.outbox.try_recv() {
            if m.to.role == Role::Team {
                notice = Some(m.content);
            }
        }
        let Some(MessageContent::Event(Event { event_type, event_payload: Some(payload) })) = notice else {
            panic!("no waiting notice for the team");
        };
        assert_eq!(event_type, "waiting");
        assert_eq!(payload["available_agents"], json!(["ana"]));
    }

    #[tokio::test]
    async fn agent_messages_need_the_assignment() {
        let mut f = fixture();
        let handle = waiting_conversation(&f).await;
        let mut conv = handle.lock().await;
        assert!(f.manager.agent_message(&mut conv, "ana", "hi".into()).await.is_err());
        f.manager.claim(&mut conv, "ana").await.unwrap();
        to_client(&mut f.outbox);
        f.manager.agent_message(&mut conv, "ana", "hi".into()).await.unwrap();
        assert_eq!(to_client(&mut f.outbox), vec![MessageContent::Text("hi".into())]);
        assert_eq!(conv.transcript.last().unwrap().from, Participant::agent("ana"));
    }
}
