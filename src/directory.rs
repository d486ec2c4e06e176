use std::{
    collections::{HashMap, HashSet},
    fs,
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Routing policy of one team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub session_timeout_seconds: u64,
    pub finish_message: String,
    pub no_agent_message: String,
    #[serde(default)]
    pub member_agent_ids: Vec<String>,
}

impl Team {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_seconds)
    }

    pub fn has_member(&self, agent_id: &str) -> bool {
        self.member_agent_ids.iter().any(|a| a == agent_id)
    }
}

fn default_capacity() -> usize {
    5
}

fn default_online() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Agent {
    pub id: String,
    pub name: String,
    /// conversations the agent may hold at once
    #[serde(default = "default_capacity")]
    pub max_conversations: usize,
    #[serde(default = "default_online")]
    pub online: bool,
}

/// Teams and agents as read from a YAML or JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DirectoryFile {
    #[serde(default)]
    pub teams: Vec<Team>,
    #[serde(default)]
    pub agents: Vec<Agent>,
}

/// Who works where, and who is free. Administration of teams and agents
/// happens elsewhere; the engine only reads and reserves.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn team(&self, team_id: &str) -> Option<Team>;
    async fn list_available_agents(&self, team_id: &str) -> Vec<String>;
    /// Reserve the agent for the conversation; false when not possible.
    async fn claim(&self, agent_id: &str, conversation_id: &str) -> bool;
    async fn release(&self, agent_id: &str, conversation_id: &str);
}

#[derive(Default)]
pub struct InMemoryAgentDirectory {
    teams: DashMap<String, Team>,
    agents: DashMap<String, Agent>,
    // agent id → conversations held
    assignments: Mutex<HashMap<String, HashSet<String>>>,
}

impl InMemoryAgentDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn from_file_contents(file: DirectoryFile) -> Arc<Self> {
        let dir = Self::default();
        for team in file.teams {
            dir.teams.insert(team.id.clone(), team);
        }
        for agent in file.agents {
            dir.agents.insert(agent.id.clone(), agent);
        }
        Arc::new(dir)
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Arc<Self>> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading directory file {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let file: DirectoryFile = match ext {
            "json" => serde_json::from_str(&contents)?,
            _ => serde_yaml_bw::from_str(&contents)?,
        };
        info!(teams = file.teams.len(), agents = file.agents.len(), "Loaded directory from {}", path.display());
        Ok(Self::from_file_contents(file))
    }

    pub fn upsert_team(&self, team: Team) {
        self.teams.insert(team.id.clone(), team);
    }

    pub fn upsert_agent(&self, agent: Agent) {
        self.agents.insert(agent.id.clone(), agent);
    }

    pub fn set_online(&self, agent_id: &str, online: bool) {
        if let Some(mut agent) = self.agents.get_mut(agent_id) {
            agent.online = online;
        }
    }

    pub async fn load_of(&self, agent_id: &str) -> usize {
        self.assignments
            .lock()
            .await
            .get(agent_id)
            .map_or(0, |held| held.len())
    }
}

#[async_trait]
impl AgentDirectory for InMemoryAgentDirectory {
    async fn team(&self, team_id: &str) -> Option<Team> {
        self.teams.get(team_id).map(|t| t.clone())
    }

    async fn list_available_agents(&self, team_id: &str) -> Vec<String> {
        let Some(team) = self.team(team_id).await else {
            return Vec::new();
        };
        let assignments = self.assignments.lock().await;
        team.member_agent_ids
            .into_iter()
            .filter(|id| {
                self.agents.get(id).is_some_and(|a| {
                    let held = assignments.get(id).map_or(0, |h| h.len());
                    a.online && held < a.max_conversations
                })
            })
            .collect()
    }

    async fn claim(&self, agent_id: &str, conversation_id: &str) -> bool {
        let Some(agent) = self.agents.get(agent_id).map(|a| a.clone()) else {
            debug!(agent = agent_id, "claim by unknown agent");
            return false;
        };
        let mut assignments = self.assignments.lock().await;
        let held = assignments.entry(agent_id.to_string()).or_default();
        if held.contains(conversation_id) {
            return true;
        }
        if !agent.online || held.len() >= agent.max_conversations {
            return false;
        }
        held.insert(conversation_id.to_string());
        true
    }

    async fn release(&self, agent_id: &str, conversation_id: &str) {
        if let Some(held) = self.assignments.lock().await.get_mut(agent_id) {
            held.remove(conversation_id);
        }
    }
}
