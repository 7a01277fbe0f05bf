use crate::error::{Result, TagError};
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Tag
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    /// XPath expression evaluated against node facts. Empty means the tag is
    /// manual: membership is only ever set explicitly and rebuild skips it.
    #[serde(default)]
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Kernel command-line options handed to the deploy pipeline for tagged
    /// nodes. Stored and served; nothing in this subsystem interprets it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_opts: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field updates for `TagStore::update_tag`. `None` leaves a field alone;
/// `definition: Some("")` clears it, turning the tag manual.
#[derive(Debug, Clone, Default)]
pub struct TagChanges {
    pub name: Option<String>,
    pub definition: Option<String>,
    pub comment: Option<String>,
    pub kernel_opts: Option<String>,
}

impl Tag {
    pub fn new(
        name: impl Into<String>,
        definition: impl Into<String>,
        comment: Option<String>,
        kernel_opts: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            definition: definition.into(),
            comment,
            kernel_opts,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_manual(&self) -> bool {
        self.definition.is_empty()
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn exists(root: &Path, name: &str) -> bool {
        paths::tag_manifest(root, name).exists()
    }

    pub fn load(root: &Path, name: &str) -> Result<Self> {
        let manifest = paths::tag_manifest(root, name);
        if !manifest.exists() {
            return Err(TagError::TagNotFound(name.to_string()));
        }
        let data = std::fs::read_to_string(&manifest)?;
        let tag: Tag = serde_yaml::from_str(&data)?;
        Ok(tag)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let manifest = paths::tag_manifest(root, &self.name);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&manifest, data.as_bytes())
    }

    pub fn list(root: &Path) -> Result<Vec<Self>> {
        let tags_dir = root.join(paths::TAGS_DIR);
        if !tags_dir.exists() {
            return Ok(Vec::new());
        }

        let mut tags = Vec::new();
        for entry in std::fs::read_dir(&tags_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name().to_string_lossy().into_owned();
                match Self::load(root, &name) {
                    Ok(t) => tags.push(t),
                    // A directory without a manifest is a tag deleted mid-scan.
                    Err(TagError::TagNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }
}
