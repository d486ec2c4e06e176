use std::sync::{Arc, Weak};

use flowdesk_channel::{
    message::{MessageContent, Participant},
    transport::Transport,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::directory::AgentDirectory;
use crate::external::ExternalResolver;
use crate::flow::engine::{ExternalRequest, ExternalResult, FlowEngine, InboundEvent};
use crate::flow::manager::FlowStore;
use crate::logger::lifecycle_event;
use crate::session::{
    conversation::{Conversation, ConversationStatus, FinishReason},
    manager::{event, Closer, SessionError, SessionManager},
    queue::WaitingQueueEntry,
    store::{ConversationStore, InMemoryConversationStore},
    timer::{Scheduler, TimerEvent, TimerKind},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("no published flow for channel `{0}`")]
    NoFlowForChannel(String),
    #[error("unknown conversation `{0}`")]
    UnknownConversation(String),
    #[error("conversation of `{0}` kept closing under us")]
    Contended(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Returned to the channel for every client event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub conversation_id: String,
    pub status: ConversationStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentAction {
    Claim,
    Send(String),
    Close,
}

#[derive(Debug)]
struct ExternalCompletion {
    conversation_id: String,
    request_id: String,
    result: ExternalResult,
}

/// Entry point for channels and agents. Client events go to the flow engine
/// or to people depending on where the conversation is; timers and external
/// results come back through an internal event loop.
pub struct Router {
    flows: Arc<dyn FlowStore>,
    engine: FlowEngine,
    sessions: SessionManager,
    resolver: Arc<dyn ExternalResolver>,
    completions: UnboundedSender<ExternalCompletion>,
}

// a conversation closing between lookup and lock is retried this often
const OPEN_ATTEMPTS: usize = 3;

impl Router {
    /// Must be called inside a tokio runtime; the event loop is spawned here
    /// and stops once the router is dropped.
    pub fn new(
        flows: Arc<dyn FlowStore>,
        directory: Arc<dyn AgentDirectory>,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn ExternalResolver>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Self::with_store(flows, InMemoryConversationStore::new(), directory, transport, resolver, config)
    }

    pub fn with_store(
        flows: Arc<dyn FlowStore>,
        store: ConversationStore,
        directory: Arc<dyn AgentDirectory>,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn ExternalResolver>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let (scheduler, timers) = Scheduler::new();
        let (completions, completed) = mpsc::unbounded_channel();
        let router = Arc::new(Self {
            engine: FlowEngine::new(&config),
            sessions: SessionManager::new(store, flows.clone(), Arc::new(scheduler), directory, transport, config),
            flows,
            resolver,
            completions,
        });
        tokio::spawn(event_loop(Arc::downgrade(&router), timers, completed));
        router
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// A copy of the conversation as it is now.
    pub async fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        let handle = self.sessions.store().get(conversation_id).await?;
        let conv = handle.lock().await;
        Some(conv.clone())
    }

    pub async fn waiting(&self, team_id: &str) -> Vec<WaitingQueueEntry> {
        self.sessions.waiting(team_id).await
    }

    pub async fn post_client_message(&self, channel_id: &str, client_id: &str, text: &str) -> Result<Ack, RouterError> {
        self.client_event(
            channel_id,
            client_id,
            InboundEvent::ClientMessage(text.to_string()),
            MessageContent::Text(text.to_string()),
        )
        .await
    }

    /// `index` is zero-based.
    pub async fn post_menu_selection(&self, channel_id: &str, client_id: &str, index: usize) -> Result<Ack, RouterError> {
        self.client_event(
            channel_id,
            client_id,
            InboundEvent::MenuSelection(index),
            MessageContent::Text((index + 1).to_string()),
        )
        .await
    }

    #[tracing::instrument(skip(self, event, content))]
    async fn client_event(
        &self,
        channel_id: &str,
        client_id: &str,
        event: InboundEvent,
        content: MessageContent,
    ) -> Result<Ack, RouterError> {
        for _ in 0..OPEN_ATTEMPTS {
            let handle = match self.sessions.store().find_open(channel_id, client_id).await {
                Some(handle) => handle,
                None => {
                    let flow = self
                        .flows
                        .published_flow_for_channel(channel_id)
                        .ok_or_else(|| RouterError::NoFlowForChannel(channel_id.to_string()))?;
                    // republished between lookup and lease; look again
                    if !self.flows.acquire(flow.id(), flow.version()) {
                        continue;
                    }
                    let (handle, created) = self
                        .sessions
                        .store()
                        .get_or_create(channel_id, client_id, flow.id(), flow.version())
                        .await;
                    if created {
                        let id = handle.lock().await.id.clone();
                        lifecycle_event(&id, "created", channel_id);
                    } else {
                        self.flows.release(flow.id(), flow.version());
                    }
                    handle
                }
            };

            let mut conv = handle.lock().await;
            if conv.is_finished() {
                continue;
            }

            conv.touch();
            conv.record(Participant::client(client_id), content.clone());
            self.sessions.arm_idle(&conv).await;

            match conv.status {
                ConversationStatus::Bot => self.run_step(&mut conv, event).await,
                ConversationStatus::Waiting => {
                    let team = Participant::team(conv.team_id.clone().unwrap_or_default());
                    self.sessions
                        .relay(&conv, Participant::client(client_id), team, content)
                        .await;
                }
                ConversationStatus::Active => {
                    let agent = Participant::agent(conv.agent_id.clone().unwrap_or_default());
                    self.sessions
                        .relay(&conv, Participant::client(client_id), agent, content)
                        .await;
                }
                ConversationStatus::Finished => {}
            }
            return Ok(Ack {
                conversation_id: conv.id.clone(),
                status: conv.status,
            });
        }
        Err(RouterError::Contended(client_id.to_string()))
    }

    async fn run_step(&self, conv: &mut Conversation, event: InboundEvent) {
        match self.engine.step(self.flows.as_ref(), &conv.flow, event) {
            Ok(result) => {
                if let Some(request) = self.sessions.apply_execution(conv, result).await {
                    self.dispatch_external(conv, request).await;
                }
            }
            Err(e) => self.sessions.fail(conv, e).await,
        }
    }

    /// Hand the request to a built-in resolver, if one takes it. Otherwise it
    /// is published as an `external_request` event on the transport and a
    /// collaborator answers through [`Router::external_callback`].
    async fn dispatch_external(&self, conv: &Conversation, request: ExternalRequest) {
        if !self.resolver.handles(&request.call) {
            debug!(conversation = %conv.id, request = %request.id, "waiting for external callback");
            let published = event("external_request", json!({ "request_id": request.id, "call": request.call }));
            self.sessions
                .relay(conv, Participant::bot(), Participant::system(), published)
                .await;
            return;
        }
        let resolver = self.resolver.clone();
        let completions = self.completions.clone();
        let timeout = self.sessions.config().external_timeout;
        let conversation_id = conv.id.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, resolver.resolve(&request.call)).await {
                Ok(Ok(value)) => ExternalResult::Completed(value),
                Ok(Err(e)) => ExternalResult::Failed(e.to_string()),
                Err(_) => ExternalResult::TimedOut,
            };
            let _ = completions.send(ExternalCompletion {
                conversation_id,
                request_id: request.id,
                result,
            });
        });
    }

    /// Deliver the outcome of an external call. Returns false when the
    /// conversation is no longer waiting for `request_id`.
    pub async fn external_callback(
        &self,
        conversation_id: &str,
        request_id: &str,
        result: ExternalResult,
    ) -> Result<bool, RouterError> {
        let handle = self
            .sessions
            .store()
            .get(conversation_id)
            .await
            .ok_or_else(|| RouterError::UnknownConversation(conversation_id.to_string()))?;
        let mut conv = handle.lock().await;
        if conv.is_finished() || conv.pending_request() != Some(request_id) {
            debug!(conversation = conversation_id, request = request_id, "stale external result dropped");
            return Ok(false);
        }
        self.run_step(&mut conv, InboundEvent::ExternalCallback(result)).await;
        Ok(true)
    }

    async fn handle_timer(&self, event: TimerEvent) {
        let Some(handle) = self.sessions.store().get(&event.conversation_id).await else {
            return;
        };
        let mut conv = handle.lock().await;
        if !self.sessions.scheduler().fired(&event) {
            trace!(conversation = %event.conversation_id, kind = ?event.kind, "stale timer dropped");
            return;
        }
        if conv.is_finished() {
            return;
        }
        match event.kind {
            TimerKind::Idle => self.sessions.expire(&mut conv).await,
            TimerKind::Delay => self.run_step(&mut conv, InboundEvent::TimerFired).await,
            TimerKind::External => {
                warn!(conversation = %conv.id, "external call timed out");
                self.run_step(&mut conv, InboundEvent::ExternalCallback(ExternalResult::TimedOut))
                    .await
            }
        }
    }

    #[tracing::instrument(skip(self, action))]
    pub async fn agent_action(
        &self,
        agent_id: &str,
        conversation_id: &str,
        action: AgentAction,
    ) -> Result<ConversationStatus, RouterError> {
        let handle = self
            .sessions
            .store()
            .get(conversation_id)
            .await
            .ok_or_else(|| RouterError::UnknownConversation(conversation_id.to_string()))?;
        let mut conv = handle.lock().await;
        match action {
            AgentAction::Claim => self.sessions.claim(&mut conv, agent_id).await?,
            AgentAction::Send(text) => self.sessions.agent_message(&mut conv, agent_id, text).await?,
            AgentAction::Close => {
                self.sessions
                    .close(&mut conv, Closer::Agent(agent_id.to_string()))
                    .await?;
            }
        }
        Ok(conv.status)
    }

    /// Returns the id of the conversation the agent now holds, if the queue
    /// had one.
    pub async fn accept_next(&self, agent_id: &str, team_id: &str) -> Result<Option<String>, RouterError> {
        Ok(self.sessions.accept_next(agent_id, team_id).await?)
    }

    /// Close from outside any agent seat (administration, shutdown).
    pub async fn close(&self, conversation_id: &str) -> Result<bool, RouterError> {
        let handle = self
            .sessions
            .store()
            .get(conversation_id)
            .await
            .ok_or_else(|| RouterError::UnknownConversation(conversation_id.to_string()))?;
        let mut conv = handle.lock().await;
        Ok(self
            .sessions
            .close(&mut conv, Closer::System(FinishReason::ClosedBySystem))
            .await?)
    }
}

async fn event_loop(
    router: Weak<Router>,
    mut timers: UnboundedReceiver<TimerEvent>,
    mut completed: UnboundedReceiver<ExternalCompletion>,
) {
    loop {
        tokio::select! {
            Some(event) = timers.recv() => {
                let Some(router) = router.upgrade() else { break };
                tokio::spawn(async move { router.handle_timer(event).await });
            }
            Some(done) = completed.recv() => {
                let Some(router) = router.upgrade() else { break };
                tokio::spawn(async move {
                    let ExternalCompletion { conversation_id, request_id, result } = done;
                    if let Err(e) = router.external_callback(&conversation_id, &request_id, result).await {
                        warn!("external result for {} not applied: {}", conversation_id, e);
                    }
                });
            }
            else => break,
        }
    }
    info!("router event loop stopped");
}
