use std::{fs, path::Path};

use anyhow::Result;
use flowdesk_channel::message::ChannelMessage;
use schemars::schema_for;
use tracing::info;

use crate::directory::DirectoryFile;
use crate::flow::model::FlowDocument;

/// Write JSON Schemas for flow documents, directory files and channel
/// messages into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>> {
    fs::create_dir_all(out_dir)?;
    let schemas = [
        ("flow.schema.json", serde_json::to_string_pretty(&schema_for!(FlowDocument))?),
        ("directory.schema.json", serde_json::to_string_pretty(&schema_for!(DirectoryFile))?),
        ("channel_message.schema.json", serde_json::to_string_pretty(&schema_for!(ChannelMessage))?),
    ];
    let mut written = Vec::new();
    for (name, json) in schemas {
        fs::write(out_dir.join(name), json)?;
        info!("Wrote {}", name);
        written.push(name.to_string());
    }
    Ok(written)
}
