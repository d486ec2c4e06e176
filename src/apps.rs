use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use flowdesk_channel::{message::LogLevel, transport::Transport};
use tracing::{info, warn};

use crate::{
    config::{ConfigManager, EngineConfig},
    directory::{AgentDirectory, InMemoryAgentDirectory},
    external::Resolvers,
    flow::manager::FlowManager,
    logger::Logger,
    router::Router,
    watcher::DirectoryWatcher,
};

/// Where things live under the root directory.
#[derive(Debug, Clone)]
pub struct Layout {
    pub root: PathBuf,
}

impl Layout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn env_file(&self) -> PathBuf {
        self.root.join("config").join(".env")
    }

    pub fn directory_file(&self) -> PathBuf {
        self.root.join("config").join("directory.yaml")
    }

    pub fn channels_file(&self) -> PathBuf {
        self.root.join("config").join("channels.yaml")
    }

    pub fn flows_dir(&self) -> PathBuf {
        self.root.join("flows")
    }
}

pub struct App {
    watcher: Option<DirectoryWatcher>,
    flow_manager: Option<Arc<FlowManager>>,
    router: Option<Arc<Router>>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        Self {
            watcher: None,
            flow_manager: None,
            router: None,
        }
    }

    /// Bootstraps flowdesk:
    ///   - reads the engine settings
    ///   - loads and watches the flows directory
    ///   - binds channels to flows
    ///   - loads the team/agent directory
    ///   - starts the router
    pub async fn bootstrap(
        &mut self,
        layout: &Layout,
        config: ConfigManager,
        session_timeout: Option<u64>,
        transport: Arc<dyn Transport>,
        logger: Logger,
    ) -> Result<Arc<Router>> {
        let mut engine_config = EngineConfig::load(&config).await;
        if let Some(secs) = session_timeout {
            engine_config.session_timeout = Duration::from_secs(secs);
        }

        let flows_dir = layout.flows_dir();
        fs::create_dir_all(&flows_dir)
            .with_context(|| format!("failed to create {}", flows_dir.display()))?;
        let flow_manager = FlowManager::new();
        let watcher = flow_manager.clone().watch_flow_dir(flows_dir).await?;
        logger.log(
            LogLevel::Info,
            "bootstrap",
            &format!("{} flow(s) published", flow_manager.flow_ids().len()),
        );

        let channels = layout.channels_file();
        if channels.exists() {
            let bound = flow_manager.bind_channels_from_file(&channels)?;
            info!("{} channel binding(s) loaded", bound);
        } else {
            warn!("No channel bindings at {}; clients will be refused", channels.display());
        }

        let directory: Arc<dyn AgentDirectory> = if layout.directory_file().exists() {
            InMemoryAgentDirectory::load_from_file(&layout.directory_file())?
        } else {
            warn!("No directory file; hand-offs will find no teams");
            InMemoryAgentDirectory::new()
        };

        let router = Router::new(
            flow_manager.clone(),
            directory,
            transport,
            Arc::new(Resolvers::builtin()),
            engine_config,
        );

        self.watcher = Some(watcher);
        self.flow_manager = Some(flow_manager);
        self.router = Some(router.clone());
        Ok(router)
    }

    pub fn flow_manager(&self) -> Option<Arc<FlowManager>> {
        self.flow_manager.clone()
    }

    pub async fn shutdown(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.shutdown();
        }
        if let Some(router) = self.router.take() {
            let mut closed = 0;
            for handle in router.sessions().store().all().await {
                let id = handle.lock().await.id.clone();
                if let Ok(true) = router.close(&id).await {
                    closed += 1;
                }
            }
            info!("Closed {} open conversation(s)", closed);
        }
    }
}

const SAMPLE_FLOW: &str = r#"id: welcome
name: Welcome
nodes:
  - id: greet
    type: message
    text: "Hi! I'm the flowdesk demo bot."
    next: ask_name
  - id: ask_name
    type: data_input
    prompt: "What's your name?"
    variable: name
    next: menu
  - id: menu
    type: menu
    prompt: "Nice to meet you, {{name}}. What do you need?"
    options:
      - label: Talk to support
        target: handoff
      - label: Nothing, thanks
        target: bye
  - id: handoff
    type: team
    team_id: support
  - id: bye
    type: finish
    message: "Bye {{name}}!"
"#;

const SAMPLE_DIRECTORY: &str = r#"teams:
  - id: support
    name: Support
    session_timeout_seconds: 900
    finish_message: "Thanks for contacting support."
    no_agent_message: "No agents are available right now. Please try again later."
    member_agent_ids: [agent1]
agents:
  - id: agent1
    name: First agent
"#;

const SAMPLE_CHANNELS: &str = "console: welcome\n";

fn write_if_missing(path: &Path, contents: &str) -> Result<()> {
    if path.exists() {
        println!("Skipping {}, already exists", path.display());
        return Ok(());
    }
    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    Ok(())
}

/// Create the root layout with a sample flow, directory and binding.
pub fn cmd_init(layout: &Layout) -> Result<()> {
    for dir in [layout.root.join("config"), layout.root.join("logs"), layout.flows_dir()] {
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    write_if_missing(&layout.env_file(), "")?;
    write_if_missing(&layout.directory_file(), SAMPLE_DIRECTORY)?;
    write_if_missing(&layout.channels_file(), SAMPLE_CHANNELS)?;
    write_if_missing(&layout.flows_dir().join("welcome.yaml"), SAMPLE_FLOW)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RecordingTransport;
    use crate::config::MapConfigManager;
    use crate::flow::manager::FlowStore;
    use crate::logger::TracingLogger;
    use tempfile::tempdir;

    #[tokio::test]
    async fn init_then_bootstrap_serves_the_sample_flow() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path().to_path_buf());
        cmd_init(&layout).unwrap();
        // a second init leaves files alone
        cmd_init(&layout).unwrap();

        let (transport, _outbox) = RecordingTransport::new();
        let mut app = App::new();
        let router = app
            .bootstrap(
                &layout,
                ConfigManager(MapConfigManager::new()),
                Some(60),
                transport,
                Logger(Box::new(TracingLogger)),
            )
            .await
            .unwrap();

        let flows = app.flow_manager().unwrap();
        assert_eq!(flows.published_flow_for_channel("console").unwrap().id(), "welcome");

        let ack = router.post_client_message("console", "me", "hello").await.unwrap();
        let conv = router.conversation(&ack.conversation_id).await.unwrap();
        assert_eq!(conv.flow.current_node.as_deref(), Some("ask_name"));

        app.shutdown().await;
        assert!(router.conversation(&ack.conversation_id).await.unwrap().is_finished());
    }
}
