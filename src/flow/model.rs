use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::{
    algo::toposort,
    prelude::StableDiGraph,
    graph::NodeIndex,
    visit::Dfs,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flow::condition::Branch;
use crate::flow::input::InputFormat;
use crate::state::StateValue;

pub type NodeId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MenuOption {
    pub label: String,
    pub target: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// Node payloads. Targets embedded here drive execution; document edges
/// are only checked for consistency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Message {
        text: String,
        next: Option<NodeId>,
    },
    Menu {
        prompt: String,
        options: Vec<MenuOption>,
        retry_limit: Option<u32>,
        default: Option<NodeId>,
        invalid_message: Option<String>,
    },
    Condition {
        branches: Vec<Branch>,
        default: Option<NodeId>,
    },
    SetValue {
        variable: String,
        value: StateValue,
        next: Option<NodeId>,
    },
    DataInput {
        prompt: String,
        variable: String,
        format: Option<InputFormat>,
        retry_limit: Option<u32>,
        invalid_message: Option<String>,
        on_invalid: Option<NodeId>,
        next: Option<NodeId>,
    },
    Anchor {
        next: Option<NodeId>,
    },
    Goto {
        target: NodeId,
    },
    GotoFlow {
        flow_id: String,
        node: Option<NodeId>,
    },
    #[serde(rename = "team")]
    TeamHandoff {
        team_id: String,
        message: Option<String>,
    },
    Finish {
        message: Option<String>,
    },
    Nlp {
        text: String,
        result_variable: String,
        next: Option<NodeId>,
        on_error: Option<NodeId>,
    },
    UrlRequest {
        #[serde(default)]
        method: HttpMethod,
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        body: Option<String>,
        result_variable: String,
        next: Option<NodeId>,
        on_error: Option<NodeId>,
    },
    Script {
        source: String,
        result_variable: String,
        next: Option<NodeId>,
        on_error: Option<NodeId>,
    },
    SmartDelay {
        seconds: u64,
        next: Option<NodeId>,
    },
    ReceiveAttachment {
        prompt: String,
        variable: String,
        retry_limit: Option<u32>,
        next: Option<NodeId>,
    },
    Note {
        text: String,
        next: Option<NodeId>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Node {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self { id: id.into(), label: None, kind }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Every node id this node may continue at.
    pub fn targets(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        match &self.kind {
            NodeKind::Message { next, .. }
            | NodeKind::SetValue { next, .. }
            | NodeKind::Anchor { next }
            | NodeKind::SmartDelay { next, .. }
            | NodeKind::ReceiveAttachment { next, .. }
            | NodeKind::Note { next, .. } => out.extend(next.as_deref()),
            NodeKind::Menu { options, default, .. } => {
                out.extend(options.iter().map(|o| o.target.as_str()));
                out.extend(default.as_deref());
            }
            NodeKind::Condition { branches, default } => {
                out.extend(branches.iter().map(|b| b.target.as_str()));
                out.extend(default.as_deref());
            }
            NodeKind::DataInput { on_invalid, next, .. } => {
                out.extend(next.as_deref());
                out.extend(on_invalid.as_deref());
            }
            NodeKind::Goto { target } => out.push(target.as_str()),
            NodeKind::Nlp { next, on_error, .. }
            | NodeKind::UrlRequest { next, on_error, .. }
            | NodeKind::Script { next, on_error, .. } => {
                out.extend(next.as_deref());
                out.extend(on_error.as_deref());
            }
            // targets in other flows are checked when the jump happens
            NodeKind::GotoFlow { .. } | NodeKind::TeamHandoff { .. } | NodeKind::Finish { .. } => {}
        }
        out
    }

    pub fn is_goto(&self) -> bool {
        matches!(self.kind, NodeKind::Goto { .. })
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Message { .. } => "message",
            NodeKind::Menu { .. } => "menu",
            NodeKind::Condition { .. } => "condition",
            NodeKind::SetValue { .. } => "set_value",
            NodeKind::DataInput { .. } => "data_input",
            NodeKind::Anchor { .. } => "anchor",
            NodeKind::Goto { .. } => "goto",
            NodeKind::GotoFlow { .. } => "goto_flow",
            NodeKind::TeamHandoff { .. } => "team",
            NodeKind::Finish { .. } => "finish",
            NodeKind::Nlp { .. } => "nlp",
            NodeKind::UrlRequest { .. } => "url_request",
            NodeKind::Script { .. } => "script",
            NodeKind::SmartDelay { .. } => "smart_delay",
            NodeKind::ReceiveAttachment { .. } => "receive_attachment",
            NodeKind::Note { .. } => "note",
        }
    }
}

/// Editor connection between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// The import/export shape of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    /// defaults to the first node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<NodeId>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("node `{node}` references unknown node `{target}`")]
    DanglingReference { node: NodeId, target: NodeId },
    #[error("flow has no entry node")]
    NoEntryNode,
    #[error("node `{0}` is not reachable from the entry node")]
    UnreachableNode(NodeId),
    #[error("node id `{0}` is used more than once")]
    DuplicateNodeId(NodeId),
    #[error("cycle through node `{0}` does not pass through a goto node")]
    IllegalCycle(NodeId),
}

/// A validated, immutable flow. Node lookup is by hash map; the original
/// node order is kept for export.
#[derive(Debug, Clone)]
pub struct Flow {
    id: String,
    name: String,
    version: u32,
    entry: NodeId,
    nodes: Vec<Node>,
    index_of: HashMap<NodeId, usize>,
    edges: Vec<Edge>,
}

impl PartialEq for Flow {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.version == other.version
            && self.entry == other.entry
            && self.nodes == other.nodes
            && self.edges == other.edges
        // index_of is derived
    }
}

impl Flow {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index_of.get(id).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub(crate) fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn to_document(&self) -> FlowDocument {
        FlowDocument {
            id: Some(self.id.clone()),
            name: self.name.clone(),
            version: Some(self.version),
            entry: Some(self.entry.clone()),
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        }
    }
}

/// Check the structure of `doc` and build a [`Flow`].
///
/// Runs once when a flow is imported or published; the engine relies on it
/// and never re-checks references per step.
pub fn validate(doc: FlowDocument) -> Result<Flow, GraphError> {
    let mut index_of = HashMap::with_capacity(doc.nodes.len());
    for (i, node) in doc.nodes.iter().enumerate() {
        if index_of.insert(node.id.clone(), i).is_some() {
            return Err(GraphError::DuplicateNodeId(node.id.clone()));
        }
    }

    let entry = match doc.entry.clone().or_else(|| doc.nodes.first().map(|n| n.id.clone())) {
        Some(e) if index_of.contains_key(&e) => e,
        _ => return Err(GraphError::NoEntryNode),
    };

    for node in &doc.nodes {
        for target in node.targets() {
            if !index_of.contains_key(target) {
                return Err(GraphError::DanglingReference {
                    node: node.id.clone(),
                    target: target.to_string(),
                });
            }
        }
    }
    for edge in &doc.edges {
        for end in [&edge.from, &edge.to] {
            if !index_of.contains_key(end) {
                return Err(GraphError::DanglingReference {
                    node: edge.from.clone(),
                    target: end.clone(),
                });
            }
        }
    }

    // 1) full graph for reachability
    let mut graph: StableDiGraph<&str, ()> = StableDiGraph::new();
    let idx: Vec<NodeIndex> = doc.nodes.iter().map(|n| graph.add_node(n.id.as_str())).collect();
    let mut jump_free: StableDiGraph<&str, ()> = graph.clone();

    let mut connect = |from: &str, to: &str, from_goto: bool| {
        let (i, j) = (idx[index_of[from]], idx[index_of[to]]);
        graph.add_edge(i, j, ());
        if !from_goto {
            jump_free.add_edge(i, j, ());
        }
    };
    for node in &doc.nodes {
        for target in node.targets() {
            connect(&node.id, target, node.is_goto());
        }
    }
    for edge in &doc.edges {
        let from_goto = doc.nodes[index_of[&edge.from]].is_goto();
        connect(&edge.from, &edge.to, from_goto);
    }

    let mut reachable = HashSet::new();
    let mut dfs = Dfs::new(&graph, idx[index_of[&entry]]);
    while let Some(n) = dfs.next(&graph) {
        reachable.insert(n);
    }
    if let Some(pos) = idx.iter().position(|i| !reachable.contains(i)) {
        return Err(GraphError::UnreachableNode(doc.nodes[pos].id.clone()));
    }

    // 2) loops are only allowed through explicit goto jumps
    if let Err(cycle) = toposort(&jump_free, None) {
        let at = jump_free[cycle.node_id()].to_string();
        return Err(GraphError::IllegalCycle(at));
    }

    Ok(Flow {
        id: doc.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        name: doc.name,
        version: doc.version.unwrap_or(1),
        entry,
        nodes: doc.nodes,
        index_of,
        edges: doc.edges,
    })
}
