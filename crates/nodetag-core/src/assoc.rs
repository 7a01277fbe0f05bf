use crate::error::{Result, TagError};
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

// ---------------------------------------------------------------------------
// Members
// ---------------------------------------------------------------------------

/// The association set for one tag: which system_ids carry it.
///
/// One file per tag (`nodes.yaml`), replaced atomically as a whole and
/// versioned on every committed change. The whole-file replace is what makes
/// a rebuild racing a manual call land on one caller's intent instead of a
/// torn mix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Members {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub nodes: BTreeSet<String>,
}

impl Default for Members {
    fn default() -> Self {
        Self {
            version: 0,
            updated_at: Utc::now(),
            nodes: BTreeSet::new(),
        }
    }
}

impl Members {
    /// Load the member set for `tag`, or an empty set if none has been
    /// written yet. The tag's existence is the caller's concern.
    pub fn load(root: &Path, tag: &str) -> Result<Self> {
        let path = paths::tag_members(root, tag);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let members: Members = serde_yaml::from_str(&data)?;
        Ok(members)
    }

    /// Persist the set, bumping the version. Call only when the set actually
    /// changed; an unchanged commit would advance the version for nothing.
    pub fn commit(&mut self, root: &Path, tag: &str) -> Result<()> {
        self.version += 1;
        self.updated_at = Utc::now();
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&paths::tag_members(root, tag), data.as_bytes())
    }

    pub fn contains(&self, system_id: &str) -> bool {
        self.nodes.contains(system_id)
    }
}

/// Tags that currently carry `system_id`, in name order.
pub fn tags_for_node(root: &Path, system_id: &str) -> Result<Vec<String>> {
    let mut tags = Vec::new();
    for tag in crate::tag::Tag::list(root)? {
        if Members::load(root, &tag.name)?.contains(system_id) {
            tags.push(tag.name);
        }
    }
    Ok(tags)
}

/// Member set for `tag`, erroring if the tag itself is gone. Reads that
/// should surface `TagNotFound` for deleted tags go through this.
pub fn members_for_existing(root: &Path, tag: &str) -> Result<Members> {
    if !crate::tag::Tag::exists(root, tag) {
        return Err(TagError::TagNotFound(tag.to_string()));
    }
    Members::load(root, tag)
}
