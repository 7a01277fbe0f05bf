use crate::error::{Result, TagError};
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Registry entry for one machine. The facts document lives next to the
/// manifest as raw XML, written by commissioning and never interpreted here
/// beyond generic XPath evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub system_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub facts_updated_at: DateTime<Utc>,
}

impl Node {
    pub fn new(system_id: impl Into<String>, hostname: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            system_id: system_id.into(),
            hostname,
            registered_at: now,
            facts_updated_at: now,
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn exists(root: &Path, system_id: &str) -> bool {
        paths::node_manifest(root, system_id).exists()
    }

    pub fn load(root: &Path, system_id: &str) -> Result<Self> {
        let manifest = paths::node_manifest(root, system_id);
        if !manifest.exists() {
            return Err(TagError::NodeNotFound(system_id.to_string()));
        }
        let data = std::fs::read_to_string(&manifest)?;
        let node: Node = serde_yaml::from_str(&data)?;
        Ok(node)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let manifest = paths::node_manifest(root, &self.system_id);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&manifest, data.as_bytes())
    }

    pub fn list(root: &Path) -> Result<Vec<Self>> {
        let nodes_dir = root.join(paths::NODES_DIR);
        if !nodes_dir.exists() {
            return Ok(Vec::new());
        }

        let mut nodes = Vec::new();
        for entry in std::fs::read_dir(&nodes_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let system_id = entry.file_name().to_string_lossy().into_owned();
                match Self::load(root, &system_id) {
                    Ok(n) => nodes.push(n),
                    Err(TagError::NodeNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        nodes.sort_by(|a, b| a.system_id.cmp(&b.system_id));
        Ok(nodes)
    }

    // -----------------------------------------------------------------------
    // Facts
    // -----------------------------------------------------------------------

    pub fn facts(root: &Path, system_id: &str) -> Result<String> {
        let path = paths::node_facts(root, system_id);
        if !path.exists() {
            return Err(TagError::NodeNotFound(system_id.to_string()));
        }
        Ok(std::fs::read_to_string(&path)?)
    }

    /// Replace this node's facts document and stamp the refresh time.
    pub fn set_facts(&mut self, root: &Path, facts_xml: &str) -> Result<()> {
        crate::io::atomic_write(&paths::node_facts(root, &self.system_id), facts_xml.as_bytes())?;
        self.facts_updated_at = Utc::now();
        self.save(root)
    }
}
