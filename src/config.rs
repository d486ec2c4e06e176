use async_trait::async_trait;
use dashmap::DashMap;
use std::{env, fs, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not persist `{key}`: {source}")]
    Persist {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Key/value settings source.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                pairs.push((key, value));
            }
        }
        pairs
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded from a `.env` file which `set`/`del` keep
/// in sync.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        match dotenvy::from_path(&env_file) {
            Ok(()) => info!("Loaded .env from {}", env_file.display()),
            Err(e) => warn!("could not load .env from {}: {}", env_file.display(), e),
        }
        Box::new(Self { env_file })
    }

    // replace (or drop, when `value` is None) the `key=` line
    fn rewrite_file(&self, key: &str, value: Option<&str>) -> std::io::Result<()> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut replaced = false;
        let mut lines: Vec<String> = Vec::new();
        for line in content.lines() {
            let is_key = line
                .split_once('=')
                .is_some_and(|(k, _)| k.trim() == key);
            if !is_key {
                lines.push(line.to_string());
            } else if let Some(v) = value {
                lines.push(format!("{key}={v}"));
                replaced = true;
            }
        }
        if let (Some(v), false) = (value, replaced) {
            lines.push(format!("{key}={v}"));
        }
        fs::write(&self.env_file, lines.join("\n"))
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        unsafe {
            env::set_var(key, value);
        }
        self.rewrite_file(key, Some(value))
            .map_err(|source| ConfigError::Persist { key: key.to_string(), source })
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        }
        if self.env_file.exists() {
            if let Err(e) = self.rewrite_file(key, None) {
                warn!("could not remove {} from {}: {}", key, self.env_file.display(), e);
            }
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory settings, used by tests and embedders.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with(pairs: &[(&str, &str)]) -> Box<Self> {
        let mgr = Self::default();
        for (k, v) in pairs {
            mgr.map.insert(k.to_string(), v.to_string());
        }
        Box::new(mgr)
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

pub const STEP_LIMIT: &str = "FLOWDESK_STEP_LIMIT";
pub const MENU_RETRY_LIMIT: &str = "FLOWDESK_MENU_RETRY_LIMIT";
pub const INPUT_RETRY_LIMIT: &str = "FLOWDESK_INPUT_RETRY_LIMIT";
pub const EXTERNAL_TIMEOUT_SECS: &str = "FLOWDESK_EXTERNAL_TIMEOUT_SECS";
pub const SESSION_TIMEOUT_SECS: &str = "FLOWDESK_SESSION_TIMEOUT_SECS";
pub const APOLOGY_MESSAGE: &str = "FLOWDESK_APOLOGY_MESSAGE";
pub const NO_TEAM_MESSAGE: &str = "FLOWDESK_NO_TEAM_MESSAGE";
pub const BOT_TIMEOUT_MESSAGE: &str = "FLOWDESK_BOT_TIMEOUT_MESSAGE";

/// Tunables of the engine and the session manager.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// node visits allowed per engine step
    pub step_limit: u32,
    pub menu_retry_limit: u32,
    pub input_retry_limit: u32,
    pub external_timeout: Duration,
    /// idle timeout for conversations without a team
    pub session_timeout: Duration,
    /// sent when a step fails and the conversation is closed
    pub apology_message: String,
    /// sent when a hand-off names a team that does not exist
    pub no_team_message: String,
    pub bot_timeout_message: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_limit: 50,
            menu_retry_limit: 2,
            input_retry_limit: 3,
            external_timeout: Duration::from_secs(30),
            session_timeout: Duration::from_secs(1800),
            apology_message: "Sorry, something went wrong. Please try again later.".to_string(),
            no_team_message: "Sorry, no one is available to help you right now.".to_string(),
            bot_timeout_message: None,
        }
    }
}

impl EngineConfig {
    pub async fn load(config: &ConfigManager) -> Self {
        let defaults = Self::default();
        let src = config.0.as_ref();
        Self {
            step_limit: number(src, STEP_LIMIT, defaults.step_limit).await,
            menu_retry_limit: number(src, MENU_RETRY_LIMIT, defaults.menu_retry_limit).await,
            input_retry_limit: number(src, INPUT_RETRY_LIMIT, defaults.input_retry_limit).await,
            external_timeout: Duration::from_secs(
                number(src, EXTERNAL_TIMEOUT_SECS, defaults.external_timeout.as_secs()).await,
            ),
            session_timeout: Duration::from_secs(
                number(src, SESSION_TIMEOUT_SECS, defaults.session_timeout.as_secs()).await,
            ),
            apology_message: src.get(APOLOGY_MESSAGE).await.unwrap_or(defaults.apology_message),
            no_team_message: src.get(NO_TEAM_MESSAGE).await.unwrap_or(defaults.no_team_message),
            bot_timeout_message: src
                .get(BOT_TIMEOUT_MESSAGE)
                .await
                .filter(|m| !m.trim().is_empty()),
        }
    }
}

async fn number<T>(src: &dyn ConfigManagerType, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    match src.get(key).await {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value `{}`, using {}", key, raw, default);
            default
        }),
    }
}
