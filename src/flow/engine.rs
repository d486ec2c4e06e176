use std::{collections::BTreeMap, sync::Arc, time::Duration};

use flowdesk_channel::message::MessageContent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::flow::input::{match_menu_option, parse_and_validate, parse_attachment};
use crate::flow::manager::FlowStore;
use crate::flow::model::{Flow, HttpMethod, Node, NodeId, NodeKind};
use crate::state::{flatten_json, StateValue, VariableContext};

/// Variable holding the text of the latest client message.
pub const LAST_MESSAGE: &str = "last_message";

/// What a suspended flow is waiting for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Awaiting {
    Input,
    External { request_id: String },
    Timer,
}

/// Execution position of one conversation inside its flow. The flow is
/// pinned by id and version, so republishing never changes the graph under
/// a running conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInstance {
    pub flow_id: String,
    pub flow_version: u32,
    pub current_node: Option<NodeId>,
    pub awaiting: Option<Awaiting>,
    pub retries: u32,
    /// external calls issued so far; seeds the next request id
    #[serde(default)]
    pub external_seq: u64,
    pub variables: VariableContext,
}

impl FlowInstance {
    /// A flow that has not run yet; the first client event starts it at
    /// the entry node.
    pub fn new(flow_id: impl Into<String>, flow_version: u32) -> Self {
        Self {
            flow_id: flow_id.into(),
            flow_version,
            current_node: None,
            awaiting: None,
            retries: 0,
            external_seq: 0,
            variables: VariableContext::new(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.current_node.is_some()
    }

    /// Write the result of a step. Every field is set to an absolute value,
    /// so applying the same result twice changes nothing.
    pub fn apply(&mut self, result: &ExecutionResult) {
        if result.effect == ControlEffect::Ignored {
            return;
        }
        self.flow_id = result.flow_id.clone();
        self.flow_version = result.flow_version;
        self.current_node = result.next_node.clone();
        self.awaiting = result.awaiting.clone();
        self.retries = result.retries;
        self.external_seq = result.external_seq;
        for (name, value) in &result.variable_deltas {
            self.variables.set(name.clone(), value.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExternalResult {
    Completed(Value),
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    ClientMessage(String),
    /// zero-based option index picked from a rendered menu
    MenuSelection(usize),
    TimerFired,
    ExternalCallback(ExternalResult),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExternalCall {
    Http {
        method: HttpMethod,
        url: String,
        headers: BTreeMap<String, String>,
        body: Option<String>,
    },
    Script {
        source: String,
        variables: VariableContext,
    },
    Nlp {
        text: String,
    },
}

/// A fully interpolated call to an outside capability. The id is derived
/// from the flow position, so stepping the same snapshot twice yields the
/// same request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRequest {
    pub id: String,
    pub call: ExternalCall,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEffect {
    /// the flow waits for the client (or nothing happened worth reporting)
    Continue,
    HandOff { team_id: String },
    Finish,
    AwaitExternal { request: ExternalRequest },
    ScheduleTimer { delay: Duration },
    /// the event did not fit the current suspension
    Ignored,
}

/// Everything one step produced. The caller applies it to the instance
/// and performs the effect.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub outbound: Vec<MessageContent>,
    pub flow_id: String,
    pub flow_version: u32,
    pub next_node: Option<NodeId>,
    pub awaiting: Option<Awaiting>,
    pub retries: u32,
    pub external_seq: u64,
    pub variable_deltas: Vec<(String, StateValue)>,
    /// internal notes for agents, never sent to the client
    pub notes: Vec<String>,
    pub warnings: Vec<String>,
    pub effect: ControlEffect,
}

impl ExecutionResult {
    fn ignored(instance: &FlowInstance) -> Self {
        Self {
            outbound: vec![],
            flow_id: instance.flow_id.clone(),
            flow_version: instance.flow_version,
            next_node: instance.current_node.clone(),
            awaiting: instance.awaiting.clone(),
            retries: instance.retries,
            external_seq: instance.external_seq,
            variable_deltas: vec![],
            notes: vec![],
            warnings: vec![],
            effect: ControlEffect::Ignored,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.effect, ControlEffect::Finish | ControlEffect::HandOff { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("flow `{flow_id}` visited more than {limit} nodes in one step")]
    StepLimitExceeded { flow_id: String, limit: u32 },
    #[error("no branch of condition `{node}` matched and it has no default")]
    NoMatchingBranch { node: NodeId },
    #[error("flow `{flow_id}` has no node `{node}`")]
    UnknownNode { flow_id: String, node: NodeId },
    #[error("unknown flow `{0}`")]
    UnknownFlow(String),
    #[error("version {version} of flow `{flow_id}` is no longer stored")]
    UnknownFlowVersion { flow_id: String, version: u32 },
}

/// Interprets flow graphs. Holds no conversation state; every call to
/// [`FlowEngine::step`] works on a copy and returns a delta.
#[derive(Debug, Clone)]
pub struct FlowEngine {
    step_limit: u32,
    menu_retry_limit: u32,
    input_retry_limit: u32,
}

impl FlowEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            step_limit: config.step_limit,
            menu_retry_limit: config.menu_retry_limit,
            input_retry_limit: config.input_retry_limit,
        }
    }

    #[tracing::instrument(skip(self, flows, instance), fields(flow = %instance.flow_id, node = ?instance.current_node))]
    pub fn step(
        &self,
        flows: &dyn FlowStore,
        instance: &FlowInstance,
        event: InboundEvent,
    ) -> Result<ExecutionResult, ExecutionError> {
        let flow = flows
            .flow_version(&instance.flow_id, instance.flow_version)
            .ok_or_else(|| ExecutionError::UnknownFlowVersion {
                flow_id: instance.flow_id.clone(),
                version: instance.flow_version,
            })?;
        let mut run = Run::new(self, flows, flow, instance);
        if let InboundEvent::ClientMessage(text) = &event {
            run.set_var(LAST_MESSAGE.to_string(), StateValue::String(text.clone()));
        }

        let current = match (&instance.current_node, &instance.awaiting) {
            (None, _) => {
                return match event {
                    InboundEvent::ClientMessage(_) | InboundEvent::MenuSelection(_) => {
                        let entry = run.flow.entry().to_string();
                        run.traverse(entry)
                    }
                    _ => Ok(ExecutionResult::ignored(instance)),
                };
            }
            (Some(_), None) => return Ok(ExecutionResult::ignored(instance)),
            (Some(node), Some(_)) => node.clone(),
        };

        let node = run.lookup(&current)?.clone();
        match (&node.kind, instance.awaiting.as_ref(), event) {
            (NodeKind::Menu { .. }, Some(Awaiting::Input), ev @ (InboundEvent::ClientMessage(_) | InboundEvent::MenuSelection(_))) => {
                run.answer_menu(&node, ev)
            }
            (NodeKind::DataInput { .. }, Some(Awaiting::Input), InboundEvent::ClientMessage(text)) => {
                run.answer_data_input(&node, &text)
            }
            (NodeKind::ReceiveAttachment { .. }, Some(Awaiting::Input), InboundEvent::ClientMessage(text)) => {
                run.answer_attachment(&node, &text)
            }
            (
                NodeKind::Nlp { result_variable, next, on_error, .. }
                | NodeKind::UrlRequest { result_variable, next, on_error, .. }
                | NodeKind::Script { result_variable, next, on_error, .. },
                Some(Awaiting::External { .. }),
                InboundEvent::ExternalCallback(result),
            ) => match result {
                ExternalResult::Completed(value) => {
                    for (name, v) in flatten_json(result_variable, &value) {
                        run.set_var(name, v);
                    }
                    run.continue_at(next.clone())
                }
                ExternalResult::Failed(reason) => {
                    run.warn(format!("external call at `{}` failed: {}", node.id, reason));
                    run.continue_at(on_error.clone())
                }
                ExternalResult::TimedOut => {
                    run.warn(format!("external call at `{}` timed out", node.id));
                    run.continue_at(on_error.clone())
                }
            },
            (NodeKind::SmartDelay { next, .. }, Some(Awaiting::Timer), InboundEvent::TimerFired) => {
                run.continue_at(next.clone())
            }
            (_, _, ev) => {
                debug!(node = %node.id, event = ?ev, "event does not fit the suspended node");
                Ok(ExecutionResult::ignored(instance))
            }
        }
    }
}

/// One step in progress.
struct Run<'a> {
    engine: &'a FlowEngine,
    flows: &'a dyn FlowStore,
    flow: Arc<Flow>,
    vars: VariableContext,
    retries: u32,
    external_seq: u64,
    result: ExecutionResult,
}

impl<'a> Run<'a> {
    fn new(engine: &'a FlowEngine, flows: &'a dyn FlowStore, flow: Arc<Flow>, instance: &FlowInstance) -> Self {
        let mut result = ExecutionResult::ignored(instance);
        result.effect = ControlEffect::Continue;
        Self {
            engine,
            flows,
            flow,
            vars: instance.variables.clone(),
            retries: instance.retries,
            external_seq: instance.external_seq,
            result,
        }
    }

    fn lookup(&self, id: &str) -> Result<&Node, ExecutionError> {
        self.flow.node(id).ok_or_else(|| ExecutionError::UnknownNode {
            flow_id: self.flow.id().to_string(),
            node: id.to_string(),
        })
    }

    fn render(&mut self, template: &str) -> String {
        let rendered = self.vars.interpolate(template);
        for name in rendered.unresolved {
            self.warn(format!("unresolved placeholder `{}`", name));
        }
        rendered.text
    }

    fn say(&mut self, template: &str) {
        let text = self.render(template);
        self.result.outbound.push(MessageContent::Text(text));
    }

    fn warn(&mut self, warning: String) {
        warn!(flow = %self.flow.id(), "{}", warning);
        self.result.warnings.push(warning);
    }

    fn set_var(&mut self, name: String, value: StateValue) {
        self.vars.set(name.clone(), value.clone());
        self.result.variable_deltas.push((name, value));
    }

    fn pin_flow(&mut self) {
        self.result.flow_id = self.flow.id().to_string();
        self.result.flow_version = self.flow.version();
        self.result.external_seq = self.external_seq;
    }

    fn finish(mut self, at: NodeId, effect: ControlEffect) -> Result<ExecutionResult, ExecutionError> {
        self.pin_flow();
        self.result.next_node = Some(at);
        self.result.awaiting = None;
        self.result.retries = 0;
        self.result.effect = effect;
        Ok(self.result)
    }

    fn suspend(mut self, at: NodeId, awaiting: Awaiting, effect: ControlEffect) -> Result<ExecutionResult, ExecutionError> {
        self.pin_flow();
        self.result.next_node = Some(at);
        self.result.awaiting = Some(awaiting);
        self.result.retries = self.retries;
        self.result.effect = effect;
        Ok(self.result)
    }

    /// Advance to `next`, or end the flow when the path stops here.
    fn continue_at(mut self, next: Option<NodeId>) -> Result<ExecutionResult, ExecutionError> {
        self.retries = 0;
        match next {
            Some(n) => self.traverse(n),
            None => {
                let here = self.result.next_node.clone().unwrap_or_default();
                self.finish(here, ControlEffect::Finish)
            }
        }
    }

    fn render_menu(&mut self, prompt: &str, labels: Vec<String>) {
        let prompt = self.render(prompt);
        self.result.outbound.push(MessageContent::Menu { prompt, options: labels });
    }

    fn answer_menu(mut self, node: &Node, event: InboundEvent) -> Result<ExecutionResult, ExecutionError> {
        let NodeKind::Menu { prompt, options, retry_limit, default, invalid_message } = &node.kind else {
            return self.finish(node.id.clone(), ControlEffect::Finish);
        };
        let picked = match event {
            InboundEvent::MenuSelection(i) if i < options.len() => Some(i),
            InboundEvent::ClientMessage(text) => {
                match_menu_option(options.iter().map(|o| o.label.as_str()), &text)
            }
            _ => None,
        };
        if let Some(i) = picked {
            self.retries = 0;
            return self.traverse(options[i].target.clone());
        }

        self.retries += 1;
        let limit = retry_limit.unwrap_or(self.engine.menu_retry_limit);
        if self.retries > limit {
            debug!(node = %node.id, retries = self.retries, "menu retries exhausted");
            self.retries = 0;
            return match default {
                Some(d) => self.traverse(d.clone()),
                None => self.finish(node.id.clone(), ControlEffect::Finish),
            };
        }
        if let Some(m) = invalid_message {
            self.say(m);
        }
        self.render_menu(prompt, options.iter().map(|o| o.label.clone()).collect());
        self.suspend(node.id.clone(), Awaiting::Input, ControlEffect::Continue)
    }

    fn answer_data_input(mut self, node: &Node, text: &str) -> Result<ExecutionResult, ExecutionError> {
        let NodeKind::DataInput { prompt, variable, format, retry_limit, invalid_message, on_invalid, next } = &node.kind else {
            return self.finish(node.id.clone(), ControlEffect::Finish);
        };
        match parse_and_validate(text, format.as_ref()) {
            Ok(value) => {
                self.set_var(variable.clone(), value);
                self.continue_at(next.clone())
            }
            Err(mismatch) => {
                self.retries += 1;
                if self.retries > retry_limit.unwrap_or(self.engine.input_retry_limit) {
                    return self.continue_at(on_invalid.clone());
                }
                match invalid_message {
                    Some(m) => self.say(m),
                    None => self.result.outbound.push(MessageContent::Text(format!("I didn't understand: {}", mismatch))),
                }
                self.say(prompt);
                self.suspend(node.id.clone(), Awaiting::Input, ControlEffect::Continue)
            }
        }
    }

    fn answer_attachment(mut self, node: &Node, text: &str) -> Result<ExecutionResult, ExecutionError> {
        let NodeKind::ReceiveAttachment { prompt, variable, retry_limit, next } = &node.kind else {
            return self.finish(node.id.clone(), ControlEffect::Finish);
        };
        match parse_attachment(text) {
            Ok(url) => {
                self.set_var(variable.clone(), StateValue::String(url.to_string()));
                self.continue_at(next.clone())
            }
            Err(mismatch) => {
                self.retries += 1;
                if self.retries > retry_limit.unwrap_or(self.engine.input_retry_limit) {
                    return self.continue_at(None);
                }
                self.result.outbound.push(MessageContent::Text(mismatch.to_string()));
                self.say(prompt);
                self.suspend(node.id.clone(), Awaiting::Input, ControlEffect::Continue)
            }
        }
    }

    fn external(mut self, at: NodeId, call: ExternalCall) -> Result<ExecutionResult, ExecutionError> {
        self.external_seq += 1;
        let name = format!("{}/{}/{}/{}", self.flow.id(), self.flow.version(), at, self.external_seq);
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string();
        let request = ExternalRequest { id, call };
        let awaiting = Awaiting::External { request_id: request.id.clone() };
        self.suspend(at, awaiting, ControlEffect::AwaitExternal { request })
    }

    /// Walk auto-advancing nodes from `start` until the flow suspends or ends.
    fn traverse(mut self, start: NodeId) -> Result<ExecutionResult, ExecutionError> {
        let mut current = start;
        let mut visits = 0u32;
        loop {
            visits += 1;
            if visits > self.engine.step_limit {
                return Err(ExecutionError::StepLimitExceeded {
                    flow_id: self.flow.id().to_string(),
                    limit: self.engine.step_limit,
                });
            }
            let node = self.lookup(&current)?.clone();
            // remembered so a node without `next` can finish in place
            self.result.next_node = Some(node.id.clone());
            self.retries = 0;

            let next: Option<NodeId> = match &node.kind {
                NodeKind::Message { text, next } => {
                    self.say(text);
                    next.clone()
                }
                NodeKind::Menu { prompt, options, .. } => {
                    self.render_menu(prompt, options.iter().map(|o| o.label.clone()).collect());
                    return self.suspend(node.id, Awaiting::Input, ControlEffect::Continue);
                }
                NodeKind::Condition { branches, default } => {
                    let mut chosen = None;
                    for branch in branches {
                        match branch.when.evaluate(&self.vars) {
                            Ok(true) => {
                                chosen = Some(branch.target.clone());
                                break;
                            }
                            Ok(false) => {}
                            Err(e) => debug!(node = %node.id, error = %e, "predicate counted as no match"),
                        }
                    }
                    match chosen.or_else(|| default.clone()) {
                        Some(target) => Some(target),
                        None => return Err(ExecutionError::NoMatchingBranch { node: node.id }),
                    }
                }
                NodeKind::SetValue { variable, value, next } => {
                    let value = match value {
                        StateValue::String(s) => StateValue::String(self.render(s)),
                        other => other.clone(),
                    };
                    self.set_var(variable.clone(), value);
                    next.clone()
                }
                NodeKind::DataInput { prompt, .. } | NodeKind::ReceiveAttachment { prompt, .. } => {
                    self.say(prompt);
                    return self.suspend(node.id, Awaiting::Input, ControlEffect::Continue);
                }
                NodeKind::Anchor { next } => next.clone(),
                NodeKind::Note { text, next } => {
                    let note = self.render(text);
                    self.result.notes.push(note);
                    next.clone()
                }
                NodeKind::Goto { target } => Some(target.clone()),
                NodeKind::GotoFlow { flow_id, node: target } => {
                    let flow = self
                        .flows
                        .flow(flow_id)
                        .ok_or_else(|| ExecutionError::UnknownFlow(flow_id.clone()))?;
                    let start = target.clone().unwrap_or_else(|| flow.entry().to_string());
                    debug!(from = %self.flow.id(), to = %flow.id(), "switching flow");
                    self.flow = flow;
                    self.pin_flow();
                    Some(start)
                }
                NodeKind::TeamHandoff { team_id, message } => {
                    if let Some(m) = message {
                        self.say(m);
                    }
                    let effect = ControlEffect::HandOff { team_id: team_id.clone() };
                    return self.finish(node.id, effect);
                }
                NodeKind::Finish { message } => {
                    if let Some(m) = message {
                        self.say(m);
                    }
                    return self.finish(node.id, ControlEffect::Finish);
                }
                NodeKind::Nlp { text, .. } => {
                    let call = ExternalCall::Nlp { text: self.render(text) };
                    return self.external(node.id, call);
                }
                NodeKind::UrlRequest { method, url, headers, body, .. } => {
                    let url = self.render(url);
                    let headers: BTreeMap<String, String> = headers
                        .iter()
                        .map(|(k, v)| (k.clone(), self.render(v)))
                        .collect();
                    let body = body.as_deref().map(|b| self.render(b));
                    let call = ExternalCall::Http { method: *method, url, headers, body };
                    return self.external(node.id, call);
                }
                NodeKind::Script { source, .. } => {
                    let call = ExternalCall::Script { source: source.clone(), variables: self.vars.clone() };
                    return self.external(node.id, call);
                }
                NodeKind::SmartDelay { seconds, .. } => {
                    let delay = Duration::from_secs(*seconds);
                    return self.suspend(node.id, Awaiting::Timer, ControlEffect::ScheduleTimer { delay });
                }
            };

            match next {
                Some(n) => current = n,
                None => return self.finish(node.id, ControlEffect::Finish),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::condition::{Branch, Predicate};
    use crate::flow::model::{validate, FlowDocument, MenuOption};
    use std::collections::HashMap;

    struct Flows(HashMap<String, Arc<Flow>>);

    impl FlowStore for Flows {
        fn flow(&self, flow_id: &str) -> Option<Arc<Flow>> {
            self.0.get(flow_id).cloned()
        }
        fn flow_version(&self, flow_id: &str, version: u32) -> Option<Arc<Flow>> {
            self.flow(flow_id).filter(|f| f.version() == version)
        }
        fn published_flow_for_channel(&self, _channel_id: &str) -> Option<Arc<Flow>> {
            self.0.values().next().cloned()
        }
    }

    fn flows(docs: Vec<(&str, Vec<Node>)>) -> Flows {
        let mut map = HashMap::new();
        for (id, nodes) in docs {
            let doc = FlowDocument {
                id: Some(id.to_string()),
                name: id.to_string(),
                version: None,
                entry: None,
                nodes,
                edges: vec![],
            };
            map.insert(id.to_string(), Arc::new(validate(doc).unwrap()));
        }
        Flows(map)
    }

    fn engine() -> FlowEngine {
        FlowEngine::new(&EngineConfig::default())
    }

    fn texts(r: &ExecutionResult) -> Vec<String> {
        r.outbound
            .iter()
            .map(|c| match c {
                MessageContent::Text(t) => t.clone(),
                MessageContent::Menu { prompt, .. } => prompt.clone(),
                MessageContent::Event(e) => e.event_type.clone(),
            })
            .collect()
    }

    fn say(id: &str, text: &str, next: Option<&str>) -> Node {
        Node::new(id, NodeKind::Message { text: text.into(), next: next.map(String::from) })
    }

    fn menu(id: &str, options: &[(&str, &str)], retry_limit: Option<u32>, default: Option<&str>) -> Node {
        Node::new(
            id,
            NodeKind::Menu {
                prompt: "Pick one".into(),
                options: options
                    .iter()
                    .map(|(l, t)| MenuOption { label: l.to_string(), target: t.to_string() })
                    .collect(),
                retry_limit,
                default: default.map(String::from),
                invalid_message: Some("Not an option".into()),
            },
        )
    }

    fn run(
        engine: &FlowEngine,
        store: &Flows,
        inst: &mut FlowInstance,
        ev: InboundEvent,
    ) -> ExecutionResult {
        let r = engine.step(store, inst, ev).unwrap();
        inst.apply(&r);
        r
    }

    #[test]
    fn message_chain_runs_to_menu() {
        let store = flows(vec![(
            "f",
            vec![
                say("hello", "Hello {{name}}!", Some("menu")),
                menu("menu", &[("Sales", "bye"), ("Support", "bye")], None, None),
                Node::new("bye", NodeKind::Finish { message: Some("Bye".into()) }),
            ],
        )]);
        let mut inst = FlowInstance::new("f", 1);
        let r = run(&engine(), &store, &mut inst, InboundEvent::ClientMessage("hi".into()));
        assert_eq!(texts(&r), vec!["Hello !", "Pick one"]);
        assert_eq!(r.warnings.len(), 1);
        assert_eq!(r.effect, ControlEffect::Continue);
        assert_eq!(inst.current_node.as_deref(), Some("menu"));
        assert_eq!(inst.awaiting, Some(Awaiting::Input));

        let r = run(&engine(), &store, &mut inst, InboundEvent::MenuSelection(1));
        assert_eq!(texts(&r), vec!["Bye"]);
        assert_eq!(r.effect, ControlEffect::Finish);
    }

    #[test]
    fn menu_retry_limit_then_finish() {
        let store = flows(vec![(
            "f",
            vec![
                menu("menu", &[("Yes", "done")], Some(2), None),
                Node::new("done", NodeKind::Finish { message: None }),
            ],
        )]);
        let e = engine();
        let mut inst = FlowInstance::new("f", 1);
        run(&e, &store, &mut inst, InboundEvent::ClientMessage("start".into()));

        let first = run(&e, &store, &mut inst, InboundEvent::ClientMessage("maybe".into()));
        assert_eq!(texts(&first), vec!["Not an option", "Pick one"]);
        assert_eq!(inst.retries, 1);
        let second = run(&e, &store, &mut inst, InboundEvent::ClientMessage("perhaps".into()));
        assert_eq!(second.effect, ControlEffect::Continue);
        assert_eq!(inst.retries, 2);
        let third = run(&e, &store, &mut inst, InboundEvent::MenuSelection(7));
        assert_eq!(third.effect, ControlEffect::Finish);
        assert!(third.outbound.is_empty());
    }

    #[test]
    fn menu_exhaustion_takes_default() {
        let store = flows(vec![(
            "f",
            vec![
                menu("menu", &[("Yes", "done")], Some(0), Some("fallback")),
                Node::new("done", NodeKind::Finish { message: None }),
                Node::new("fallback", NodeKind::Finish { message: Some("Fallback".into()) }),
            ],
        )]);
        let mut inst = FlowInstance::new("f", 1);
        run(&engine(), &store, &mut inst, InboundEvent::ClientMessage("start".into()));
        let r = run(&engine(), &store, &mut inst, InboundEvent::ClientMessage("no".into()));
        assert_eq!(texts(&r), vec!["Fallback"]);
        assert_eq!(r.effect, ControlEffect::Finish);
    }

    #[test]
    fn condition_first_match_and_default() {
        let cond = |default: Option<&str>| {
            Node::new(
                "check",
                NodeKind::Condition {
                    branches: vec![
                        Branch {
                            when: Predicate::GreaterThan { variable: "age".into(), value: 17.0 },
                            target: "adult".into(),
                        },
                        Branch {
                            when: Predicate::Matches { variable: "age".into(), pattern: "(".into() },
                            target: "adult".into(),
                        },
                    ],
                    default: default.map(String::from),
                },
            )
        };
        let nodes = |default| {
            vec![
                Node::new("set", NodeKind::SetValue { variable: "age".into(), value: "12".into(), next: Some("check".into()) }),
                cond(default),
                say("adult", "adult", None),
                say("minor", "minor", None),
            ]
        };

        let store = flows(vec![("f", nodes(Some("minor")))]);
        let r = engine().step(&store, &FlowInstance::new("f", 1), InboundEvent::ClientMessage("x".into())).unwrap();
        assert_eq!(texts(&r), vec!["minor"]);
        assert_eq!(r.effect, ControlEffect::Finish);

        let mut nodes_without_default = nodes(None);
        nodes_without_default.pop();
        let store = flows(vec![("f", nodes_without_default)]);
        let err = engine().step(&store, &FlowInstance::new("f", 1), InboundEvent::ClientMessage("x".into())).unwrap_err();
        assert_eq!(err, ExecutionError::NoMatchingBranch { node: "check".into() });
    }

    #[test]
    fn data_input_validates_and_stores() {
        let store = flows(vec![(
            "f",
            vec![
                Node::new(
                    "ask",
                    NodeKind::DataInput {
                        prompt: "Your e-mail?".into(),
                        variable: "email".into(),
                        format: Some(crate::flow::input::InputFormat::Email),
                        retry_limit: Some(1),
                        invalid_message: None,
                        on_invalid: Some("human".into()),
                        next: Some("thanks".into()),
                    },
                ),
                say("thanks", "Thanks {{email}}", None),
                Node::new("human", NodeKind::TeamHandoff { team_id: "support".into(), message: None }),
            ],
        )]);
        let e = engine();
        let mut inst = FlowInstance::new("f", 1);
        run(&e, &store, &mut inst, InboundEvent::ClientMessage("hi".into()));

        let bad = run(&e, &store, &mut inst, InboundEvent::ClientMessage("nope".into()));
        assert_eq!(texts(&bad), vec!["I didn't understand: please enter a valid e-mail address", "Your e-mail?"]);

        let ok = e.step(&store, &inst, InboundEvent::ClientMessage("a@b.io".into())).unwrap();
        assert_eq!(texts(&ok), vec!["Thanks a@b.io"]);
        assert_eq!(
            ok.variable_deltas,
            vec![
                (LAST_MESSAGE.to_string(), StateValue::from("a@b.io")),
                ("email".to_string(), StateValue::from("a@b.io")),
            ]
        );

        let handed = e.step(&store, &inst, InboundEvent::ClientMessage("still bad".into())).unwrap();
        assert_eq!(handed.effect, ControlEffect::HandOff { team_id: "support".into() });
    }

    #[test]
    fn step_is_pure_and_apply_is_idempotent() {
        let store = flows(vec![(
            "f",
            vec![
                Node::new("set", NodeKind::SetValue { variable: "n".into(), value: StateValue::Number(1.0), next: Some("menu".into()) }),
                menu("menu", &[("A", "end")], None, None),
                Node::new("end", NodeKind::Finish { message: None }),
            ],
        )]);
        let inst = FlowInstance::new("f", 1);
        let before = inst.clone();
        let r = engine().step(&store, &inst, InboundEvent::ClientMessage("go".into())).unwrap();
        assert_eq!(inst, before);

        let mut once = inst.clone();
        once.apply(&r);
        let mut twice = once.clone();
        twice.apply(&r);
        assert_eq!(once, twice);
        assert_eq!(once.variables.get("n"), Some(&StateValue::Number(1.0)));
        assert_eq!(once.variables.get(LAST_MESSAGE), Some(&StateValue::from("go")));
    }

    #[test]
    fn external_request_ids_are_stable_for_a_snapshot() {
        let store = flows(vec![(
            "f",
            vec![
                Node::new(
                    "classify",
                    NodeKind::Nlp {
                        text: "{{last_message}}".into(),
                        result_variable: "intent".into(),
                        next: Some("again".into()),
                        on_error: None,
                    },
                ),
                Node::new("again", NodeKind::Goto { target: "classify".into() }),
            ],
        )]);
        let e = engine();
        let inst = FlowInstance::new("f", 1);
        let ev = InboundEvent::ClientMessage("where is my parcel".into());
        let first = e.step(&store, &inst, ev.clone()).unwrap();
        let retried = e.step(&store, &inst, ev).unwrap();
        assert_eq!(first, retried);
        let ControlEffect::AwaitExternal { request } = &first.effect else {
            panic!("expected external call, got {:?}", first.effect);
        };
        assert_eq!(request.call, ExternalCall::Nlp { text: "where is my parcel".into() });

        let mut inst = inst;
        inst.apply(&first);
        assert_eq!(inst.external_seq, 1);
        let looped = e
            .step(&store, &inst, InboundEvent::ExternalCallback(ExternalResult::Completed(serde_json::json!({}))))
            .unwrap();
        let ControlEffect::AwaitExternal { request: second } = &looped.effect else {
            panic!("expected external call, got {:?}", looped.effect);
        };
        assert_ne!(second.id, request.id);
        assert_eq!(looped.external_seq, 2);
    }

    #[test]
    fn attachment_accepts_links_and_gives_up_after_retries() {
        let store = flows(vec![(
            "f",
            vec![
                Node::new(
                    "photo",
                    NodeKind::ReceiveAttachment {
                        prompt: "Send a photo".into(),
                        variable: "photo".into(),
                        retry_limit: Some(1),
                        next: Some("thanks".into()),
                    },
                ),
                say("thanks", "Got {{photo}}", None),
            ],
        )]);
        let e = engine();
        let mut inst = FlowInstance::new("f", 1);
        let r = run(&e, &store, &mut inst, InboundEvent::ClientMessage("hi".into()));
        assert_eq!(texts(&r), vec!["Send a photo"]);

        let ok = e
            .step(&store, &inst, InboundEvent::ClientMessage("https://files.example/p.jpg".into()))
            .unwrap();
        assert_eq!(texts(&ok), vec!["Got https://files.example/p.jpg"]);
        assert_eq!(ok.effect, ControlEffect::Finish);

        let retry = run(&e, &store, &mut inst, InboundEvent::ClientMessage("a cat".into()));
        assert_eq!(texts(&retry).len(), 2);
        assert_eq!(texts(&retry)[1], "Send a photo");
        assert_eq!(inst.retries, 1);
        assert_eq!(inst.awaiting, Some(Awaiting::Input));

        let gave_up = run(&e, &store, &mut inst, InboundEvent::ClientMessage("no".into()));
        assert_eq!(gave_up.effect, ControlEffect::Finish);
        assert!(gave_up.outbound.is_empty());
        assert!(inst.variables.get("photo").is_none());
    }

    #[test]
    fn goto_loop_hits_step_limit() {
        let store = flows(vec![(
            "f",
            vec![
                Node::new("a", NodeKind::Anchor { next: Some("jump".into()) }),
                Node::new("jump", NodeKind::Goto { target: "a".into() }),
            ],
        )]);
        let err = engine().step(&store, &FlowInstance::new("f", 1), InboundEvent::ClientMessage("x".into())).unwrap_err();
        assert_eq!(err, ExecutionError::StepLimitExceeded { flow_id: "f".into(), limit: 50 });
    }

    #[test]
    fn goto_flow_keeps_variables() {
        let store = flows(vec![
            (
                "main",
                vec![
                    Node::new("set", NodeKind::SetValue { variable: "name".into(), value: "Ana".into(), next: Some("jump".into()) }),
                    Node::new("jump", NodeKind::GotoFlow { flow_id: "other".into(), node: None }),
                ],
            ),
            ("other", vec![say("greet", "Hi {{name}}", None)]),
        ]);
        let mut inst = FlowInstance::new("main", 1);
        let r = run(&engine(), &store, &mut inst, InboundEvent::ClientMessage("x".into()));
        assert_eq!(texts(&r), vec!["Hi Ana"]);
        assert_eq!(inst.flow_id, "other");

        let missing = flows(vec![(
            "main",
            vec![Node::new("jump", NodeKind::GotoFlow { flow_id: "ghost".into(), node: None })],
        )]);
        let err = engine().step(&missing, &FlowInstance::new("main", 1), InboundEvent::ClientMessage("x".into())).unwrap_err();
        assert_eq!(err, ExecutionError::UnknownFlow("ghost".into()));
    }

    #[test]
    fn external_call_suspends_and_resumes() {
        let store = flows(vec![(
            "f",
            vec![
                Node::new(
                    "fetch",
                    NodeKind::UrlRequest {
                        method: HttpMethod::Get,
                        url: "https://api.example.com/orders/{{order}}".into(),
                        headers: BTreeMap::new(),
                        body: None,
                        result_variable: "order_info".into(),
                        next: Some("show".into()),
                        on_error: Some("oops".into()),
                    },
                ),
                say("show", "Status: {{order_info.status}}", None),
                say("oops", "Could not check", None),
            ],
        )]);
        let e = engine();
        let mut inst = FlowInstance::new("f", 1);
        inst.variables.set("order", "42".into());
        let r = run(&e, &store, &mut inst, InboundEvent::ClientMessage("x".into()));
        let ControlEffect::AwaitExternal { request } = &r.effect else {
            panic!("expected external call, got {:?}", r.effect);
        };
        assert!(matches!(&request.call, ExternalCall::Http { url, .. } if url == "https://api.example.com/orders/42"));
        assert_eq!(inst.awaiting, Some(Awaiting::External { request_id: request.id.clone() }));

        // a client message does not resume an external wait
        let ignored = e.step(&store, &inst, InboundEvent::ClientMessage("hello?".into())).unwrap();
        assert_eq!(ignored.effect, ControlEffect::Ignored);

        let done = e
            .step(&store, &inst, InboundEvent::ExternalCallback(ExternalResult::Completed(serde_json::json!({"status": "shipped"}))))
            .unwrap();
        assert_eq!(texts(&done), vec!["Status: shipped"]);

        let failed = e.step(&store, &inst, InboundEvent::ExternalCallback(ExternalResult::TimedOut)).unwrap();
        assert_eq!(texts(&failed), vec!["Could not check"]);
        assert_eq!(failed.warnings.len(), 1);
    }

    #[test]
    fn smart_delay_waits_for_timer() {
        let store = flows(vec![(
            "f",
            vec![
                Node::new("wait", NodeKind::SmartDelay { seconds: 5, next: Some("after".into()) }),
                say("after", "Done waiting", None),
            ],
        )]);
        let e = engine();
        let mut inst = FlowInstance::new("f", 1);
        let r = run(&e, &store, &mut inst, InboundEvent::ClientMessage("x".into()));
        assert_eq!(r.effect, ControlEffect::ScheduleTimer { delay: Duration::from_secs(5) });

        let early = e.step(&store, &inst, InboundEvent::ClientMessage("?".into())).unwrap();
        assert_eq!(early.effect, ControlEffect::Ignored);
        assert!(early.outbound.is_empty());

        let fired = e.step(&store, &inst, InboundEvent::TimerFired).unwrap();
        assert_eq!(texts(&fired), vec!["Done waiting"]);
    }

    #[test]
    fn notes_never_reach_the_client() {
        let store = flows(vec![(
            "f",
            vec![
                Node::new("note", NodeKind::Note { text: "VIP {{name}}".into(), next: Some("end".into()) }),
                Node::new("end", NodeKind::TeamHandoff { team_id: "vip".into(), message: Some("Connecting you".into()) }),
            ],
        )]);
        let mut inst = FlowInstance::new("f", 1);
        inst.variables.set("name", "Rui".into());
        let r = engine().step(&store, &inst, InboundEvent::ClientMessage("x".into())).unwrap();
        assert_eq!(r.notes, vec!["VIP Rui".to_string()]);
        assert_eq!(texts(&r), vec!["Connecting you"]);
        assert!(r.is_terminal());
    }
}
