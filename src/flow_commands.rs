use std::{fs, path::Path};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::flow::manager::FlowManager;
use crate::flow::model::Flow;

/// Parse and validate a `.json`/`.yaml` flow file.
pub fn validate_flow_file(path: &Path) -> Result<Flow> {
    if !path.exists() {
        bail!("File does not exist: {}", path.display());
    }
    let flow = FlowManager::load_flow_from_file(path)
        .with_context(|| format!("Validation of {} failed", path.display()))?;
    info!(flow = %flow.id(), nodes = flow.nodes().len(), "Valid flow: {}", path.display());
    Ok(flow)
}

/// Rewrite a flow file in the format implied by `to`'s extension.
pub fn export_flow_file(from: &Path, to: &Path) -> Result<Flow> {
    let flow = validate_flow_file(from)?;
    FlowManager::save_flow_to_file(to, &flow)
        .with_context(|| format!("Failed to write {}", to.display()))?;
    info!("Exported {} to {}", from.display(), to.display());
    Ok(flow)
}

/// Validate a flow file and copy it into the flows directory, where a
/// running instance picks it up.
pub fn import_flow_file(path: &Path, flows_dir: &Path) -> Result<Flow> {
    let flow = validate_flow_file(path)?;
    let Some(file_name) = path.file_name() else {
        bail!("{} has no file name", path.display());
    };
    fs::create_dir_all(flows_dir)?;
    let dest = flows_dir.join(file_name);
    fs::copy(path, &dest)
        .with_context(|| format!("Failed to copy {} to {}", path.display(), dest.display()))?;
    info!("Flow `{}` deployed to {}", flow.id(), dest.display());
    Ok(flow)
}
