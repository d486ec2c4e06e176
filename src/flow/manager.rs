use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::flow::model::{validate, Flow, FlowDocument, GraphError};
use crate::watcher::{DirectoryWatcher, WatchedType};

/// Read access to published flows, as needed by the engine and the router.
pub trait FlowStore: Send + Sync {
    /// Latest published version.
    fn flow(&self, flow_id: &str) -> Option<Arc<Flow>>;
    /// One exact version, superseded ones included while they are leased.
    fn flow_version(&self, flow_id: &str, version: u32) -> Option<Arc<Flow>>;
    fn published_flow_for_channel(&self, channel_id: &str) -> Option<Arc<Flow>>;

    /// Lease a version for an open conversation. False when that version is
    /// no longer stored.
    fn acquire(&self, _flow_id: &str, _version: u32) -> bool {
        true
    }

    fn release(&self, _flow_id: &str, _version: u32) {}
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse flow: {0}")]
    Parse(String),
    #[error("unsupported extension `{0}` (expected .json, .yaml or .yml)")]
    UnsupportedExtension(String),
    #[error("invalid flow: {0}")]
    Graph(#[from] GraphError),
    #[error("unknown flow `{0}`")]
    UnknownFlow(String),
    #[error("flow `{flow_id}` is in use by channel `{channel_id}`")]
    InUse { flow_id: String, channel_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowFormat {
    Json,
    Yaml,
}

impl FlowFormat {
    pub fn from_path(path: &Path) -> Result<Self, FlowError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();
        match ext.as_str() {
            "json" => Ok(FlowFormat::Json),
            "yaml" | "yml" => Ok(FlowFormat::Yaml),
            other => Err(FlowError::UnsupportedExtension(other.to_string())),
        }
    }

    pub fn parse(self, contents: &str) -> Result<FlowDocument, FlowError> {
        match self {
            FlowFormat::Json => serde_json::from_str(contents)
                .map_err(|e| FlowError::Parse(format!("JSON parse error: {}", e))),
            FlowFormat::Yaml => serde_yaml_bw::from_str(contents)
                .map_err(|e| FlowError::Parse(format!("YAML parse error: {}", e))),
        }
    }

    pub fn render(self, doc: &FlowDocument) -> Result<String, FlowError> {
        match self {
            FlowFormat::Json => {
                serde_json::to_string_pretty(doc).map_err(|e| FlowError::Parse(e.to_string()))
            }
            FlowFormat::Yaml => {
                serde_yaml_bw::to_string(doc).map_err(|e| FlowError::Parse(e.to_string()))
            }
        }
    }
}

/// Every stored version of one flow id.
#[derive(Default)]
struct Versions {
    /// what new conversations start on; None once the flow was removed
    current: Option<Arc<Flow>>,
    /// superseded versions that open conversations still run
    retired: BTreeMap<u32, Arc<Flow>>,
    leases: HashMap<u32, usize>,
}

impl Versions {
    fn get(&self, version: u32) -> Option<Arc<Flow>> {
        match &self.current {
            Some(flow) if flow.version() == version => Some(flow.clone()),
            _ => self.retired.get(&version).cloned(),
        }
    }

    fn latest_version(&self) -> Option<u32> {
        let current = self.current.as_ref().map(|f| f.version());
        current.into_iter().chain(self.retired.keys().copied()).max()
    }

    /// Keep the current version only while somebody leases it.
    fn retire_current(&mut self) {
        if let Some(old) = self.current.take() {
            if self.leases.contains_key(&old.version()) {
                self.retired.insert(old.version(), old);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.current.is_none() && self.retired.is_empty()
    }
}

/// Published flows and the channel bindings that select them.
///
/// Flows are immutable once published. Publishing the same id again stores
/// a new version for new conversations; open conversations lease the
/// version they started on and keep running it until they finish.
#[derive(Default)]
pub struct FlowManager {
    flows: DashMap<String, Versions>,
    channels: DashMap<String, String>,
    sources: DashMap<PathBuf, String>,
}

impl FlowManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Validate and publish an imported document.
    pub fn publish(&self, doc: FlowDocument) -> Result<Arc<Flow>, FlowError> {
        let flow = validate(doc)?;
        Ok(self.register_flow(flow))
    }

    pub fn register_flow(&self, flow: Flow) -> Arc<Flow> {
        let mut versions = self.flows.entry(flow.id().to_string()).or_default();
        let flow = match versions.latest_version() {
            Some(latest) if latest >= flow.version() => flow.with_version(latest + 1),
            _ => flow,
        };
        let flow = Arc::new(flow);
        versions.retire_current();
        versions.current = Some(flow.clone());
        info!(flow = %flow.id(), version = flow.version(), "Registered flow");
        flow
    }

    pub fn flow_ids(&self) -> Vec<String> {
        self.flows
            .iter()
            .filter(|e| e.current.is_some())
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn bind_channel(&self, channel_id: &str, flow_id: &str) -> Result<(), FlowError> {
        if self.flow(flow_id).is_none() {
            return Err(FlowError::UnknownFlow(flow_id.to_string()));
        }
        self.channels.insert(channel_id.to_string(), flow_id.to_string());
        info!(channel = channel_id, flow = flow_id, "Bound channel");
        Ok(())
    }

    /// Read a `channel: flow_id` map from a YAML or JSON file and bind each
    /// entry. Bindings to unknown flows are logged and skipped.
    pub fn bind_channels_from_file(&self, path: &Path) -> anyhow::Result<usize> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading channel bindings {}", path.display()))?;
        let bindings: BTreeMap<String, String> = match FlowFormat::from_path(path)? {
            FlowFormat::Json => serde_json::from_str(&contents)?,
            FlowFormat::Yaml => serde_yaml_bw::from_str(&contents)?,
        };
        let mut bound = 0;
        for (channel_id, flow_id) in bindings {
            match self.bind_channel(&channel_id, &flow_id) {
                Ok(()) => bound += 1,
                Err(e) => warn!("Skipping binding of channel {}: {}", channel_id, e),
            }
        }
        Ok(bound)
    }

    pub fn unbind_channel(&self, channel_id: &str) {
        self.channels.remove(channel_id);
    }

    /// Refuses while any channel still publishes the flow.
    pub fn remove_flow(&self, flow_id: &str) -> Result<(), FlowError> {
        if let Some(binding) = self.channels.iter().find(|b| b.value() == flow_id) {
            return Err(FlowError::InUse {
                flow_id: flow_id.to_string(),
                channel_id: binding.key().clone(),
            });
        }
        {
            let mut versions = self
                .flows
                .get_mut(flow_id)
                .filter(|v| v.current.is_some())
                .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;
            versions.retire_current();
        }
        self.flows.remove_if(flow_id, |_, v| v.is_empty());
        info!(flow = flow_id, "Removed flow");
        Ok(())
    }

    pub fn export(&self, flow_id: &str, format: FlowFormat) -> Result<String, FlowError> {
        let flow = self
            .flow(flow_id)
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;
        format.render(&flow.to_document())
    }

    pub fn import(&self, contents: &str, format: FlowFormat) -> Result<Arc<Flow>, FlowError> {
        self.publish(format.parse(contents)?)
    }

    pub fn load_flow_from_file(path: &Path) -> Result<Flow, FlowError> {
        let format = FlowFormat::from_path(path)?;
        let contents = fs::read_to_string(path).map_err(|source| FlowError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(validate(format.parse(&contents)?)?)
    }

    pub fn save_flow_to_file(path: &Path, flow: &Flow) -> Result<(), FlowError> {
        let contents = FlowFormat::from_path(path)?.render(&flow.to_document())?;
        fs::write(path, contents).map_err(|source| FlowError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_file(&self, path: &Path) -> Result<Arc<Flow>, FlowError> {
        let flow = self.register_flow(Self::load_flow_from_file(path)?);
        self.sources.insert(path.to_path_buf(), flow.id().to_string());
        Ok(flow)
    }

    /// Load every flow file in `dir`; bad files are logged and skipped.
    pub fn load_all_flows_from_dir(&self, dir: &Path) -> anyhow::Result<usize> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let mut loaded = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if FlowFormat::from_path(&path).is_err() {
                continue;
            }
            match self.load_file(&path) {
                Ok(_) => loaded += 1,
                Err(e) => error!("Failed to load {}: {}", path.display(), e),
            }
        }
        Ok(loaded)
    }

    pub async fn watch_flow_dir(self: Arc<Self>, dir: PathBuf) -> anyhow::Result<DirectoryWatcher> {
        let watcher = FlowWatcher { manager: self.clone() };
        DirectoryWatcher::new(dir, Arc::new(watcher), &["json", "yaml", "yml"], true, true).await
    }

    fn forget_file(&self, path: &Path) {
        let Some((_, flow_id)) = self.sources.remove(path) else {
            return;
        };
        if let Err(e) = self.remove_flow(&flow_id) {
            warn!("Flow file {} removed but flow kept: {}", path.display(), e);
        }
    }
}

impl FlowStore for FlowManager {
    fn flow(&self, flow_id: &str) -> Option<Arc<Flow>> {
        self.flows.get(flow_id)?.current.clone()
    }

    fn flow_version(&self, flow_id: &str, version: u32) -> Option<Arc<Flow>> {
        self.flows.get(flow_id)?.get(version)
    }

    fn published_flow_for_channel(&self, channel_id: &str) -> Option<Arc<Flow>> {
        let flow_id = self.channels.get(channel_id)?.clone();
        self.flow(&flow_id)
    }

    fn acquire(&self, flow_id: &str, version: u32) -> bool {
        let Some(mut versions) = self.flows.get_mut(flow_id) else {
            return false;
        };
        if versions.get(version).is_none() {
            return false;
        }
        *versions.leases.entry(version).or_default() += 1;
        true
    }

    fn release(&self, flow_id: &str, version: u32) {
        {
            let Some(mut versions) = self.flows.get_mut(flow_id) else {
                return;
            };
            let Some(held) = versions.leases.get_mut(&version) else {
                return;
            };
            *held -= 1;
            if *held > 0 {
                return;
            }
            versions.leases.remove(&version);
            if versions.retired.remove(&version).is_some() {
                debug!(flow = flow_id, version, "Dropped superseded flow version");
            }
        }
        self.flows.remove_if(flow_id, |_, v| v.is_empty());
    }
}

/// Hot reload of a flow directory.
struct FlowWatcher {
    manager: Arc<FlowManager>,
}

#[async_trait]
impl WatchedType for FlowWatcher {
    fn is_relevant(&self, path: &Path) -> bool {
        FlowFormat::from_path(path).is_ok()
    }

    async fn on_create_or_modify(&self, path: &Path) -> anyhow::Result<()> {
        self.manager.load_file(path)?;
        Ok(())
    }

    async fn on_remove(&self, path: &Path) -> anyhow::Result<()> {
        info!("Flow file removed: {:?}", path);
        self.manager.forget_file(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::model::{Node, NodeKind};
    use tempfile::tempdir;

    const SUPPORT_YAML: &str = r#"
id: support
name: Support
nodes:
  - id: hello
    type: message
    text: "Hi there"
    next: bye
  - id: bye
    type: finish
    message: "Bye"
"#;

    fn doc(id: &str) -> FlowDocument {
        FlowDocument {
            id: Some(id.into()),
            name: id.into(),
            version: None,
            entry: None,
            nodes: vec![Node::new("end", NodeKind::Finish { message: None })],
            edges: vec![],
        }
    }

    #[test]
    fn republish_bumps_version() {
        let mgr = FlowManager::new();
        assert_eq!(mgr.publish(doc("a")).unwrap().version(), 1);
        let old = mgr.flow("a").unwrap();
        assert_eq!(mgr.publish(doc("a")).unwrap().version(), 2);
        // holders of the old version are unaffected
        assert_eq!(old.version(), 1);
        assert_eq!(mgr.flow("a").unwrap().version(), 2);
    }

    #[test]
    fn leased_versions_outlive_republishing() {
        let mgr = FlowManager::new();
        mgr.publish(doc("a")).unwrap();
        assert!(mgr.acquire("a", 1));
        assert!(!mgr.acquire("a", 7));

        mgr.publish(doc("a")).unwrap();
        assert_eq!(mgr.flow("a").unwrap().version(), 2);
        assert_eq!(mgr.flow_version("a", 1).unwrap().version(), 1);

        mgr.release("a", 1);
        assert!(mgr.flow_version("a", 1).is_none());
        assert!(mgr.flow_version("a", 2).is_some());

        // an unleased version goes as soon as it is superseded
        mgr.publish(doc("a")).unwrap();
        assert!(mgr.flow_version("a", 2).is_none());
    }

    #[test]
    fn removed_flow_stays_readable_for_its_leases() {
        let mgr = FlowManager::new();
        mgr.publish(doc("a")).unwrap();
        assert!(mgr.acquire("a", 1));
        mgr.remove_flow("a").unwrap();
        assert!(mgr.flow("a").is_none());
        assert!(mgr.flow_ids().is_empty());
        assert!(mgr.flow_version("a", 1).is_some());
        assert!(matches!(mgr.remove_flow("a"), Err(FlowError::UnknownFlow(_))));

        mgr.release("a", 1);
        assert!(mgr.flow_version("a", 1).is_none());
        // a later publish continues the numbering from scratch
        assert_eq!(mgr.publish(doc("a")).unwrap().version(), 1);
    }

    #[test]
    fn channel_binding_blocks_removal() {
        let mgr = FlowManager::new();
        mgr.publish(doc("a")).unwrap();
        assert!(matches!(mgr.bind_channel("web", "nope"), Err(FlowError::UnknownFlow(_))));
        mgr.bind_channel("web", "a").unwrap();
        assert_eq!(mgr.published_flow_for_channel("web").unwrap().id(), "a");

        assert!(matches!(mgr.remove_flow("a"), Err(FlowError::InUse { .. })));
        mgr.unbind_channel("web");
        mgr.remove_flow("a").unwrap();
        assert!(mgr.flow("a").is_none());
    }

    #[test]
    fn import_rejects_invalid_graph() {
        let mgr = FlowManager::new();
        let bad = r#"{"name": "x", "nodes": [{"id": "a", "type": "goto", "target": "b"}]}"#;
        assert!(matches!(mgr.import(bad, FlowFormat::Json), Err(FlowError::Graph(_))));
        assert!(mgr.flow_ids().is_empty());
    }

    #[test]
    fn export_import_round_trip_through_yaml() {
        let mgr = FlowManager::new();
        let flow = mgr.import(SUPPORT_YAML, FlowFormat::Yaml).unwrap();
        let json = mgr.export("support", FlowFormat::Json).unwrap();

        let other = FlowManager::new();
        let again = other.import(&json, FlowFormat::Json).unwrap();
        assert_eq!(*flow, *again);
    }

    #[test]
    fn files_load_and_save() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("support.yaml"), SUPPORT_YAML).unwrap();
        fs::write(dir.path().join("README.txt"), "not a flow").unwrap();
        fs::write(dir.path().join("broken.json"), "{").unwrap();

        let mgr = FlowManager::new();
        assert_eq!(mgr.load_all_flows_from_dir(dir.path()).unwrap(), 1);
        let flow = mgr.flow("support").unwrap();

        let out = dir.path().join("copy.json");
        FlowManager::save_flow_to_file(&out, &flow).unwrap();
        let loaded = FlowManager::load_flow_from_file(&out).unwrap();
        assert_eq!(loaded, *flow);

        assert!(matches!(
            FlowManager::save_flow_to_file(&dir.path().join("x.txt"), &flow),
            Err(FlowError::UnsupportedExtension(_))
        ));
    }

    #[test]
    fn channel_bindings_file_skips_unknown_flows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("channels.yaml");
        fs::write(&path, "web: a\nwhatsapp: missing\n").unwrap();

        let mgr = FlowManager::new();
        mgr.publish(doc("a")).unwrap();
        assert_eq!(mgr.bind_channels_from_file(&path).unwrap(), 1);
        assert_eq!(mgr.published_flow_for_channel("web").unwrap().id(), "a");
        assert!(mgr.published_flow_for_channel("whatsapp").is_none());
    }

    #[tokio::test]
    async fn removed_file_unpublishes_unbound_flow() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("support.yaml");
        fs::write(&path, SUPPORT_YAML).unwrap();

        let mgr = FlowManager::new();
        let watcher = FlowWatcher { manager: mgr.clone() };
        watcher.on_create_or_modify(&path).await.unwrap();
        assert!(mgr.flow("support").is_some());

        watcher.on_remove(&path).await.unwrap();
        assert!(mgr.flow("support").is_none());
    }
}
