use crate::error::{Result, TagError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const NODETAG_DIR: &str = ".nodetag";
pub const TAGS_DIR: &str = ".nodetag/tags";
pub const NODES_DIR: &str = ".nodetag/nodes";

pub const CONFIG_FILE: &str = ".nodetag/config.yaml";

pub const MANIFEST_FILE: &str = "manifest.yaml";
pub const MEMBERS_FILE: &str = "nodes.yaml";
pub const FACTS_FILE: &str = "facts.xml";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn nodetag_dir(root: &Path) -> PathBuf {
    root.join(NODETAG_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn tag_dir(root: &Path, name: &str) -> PathBuf {
    root.join(TAGS_DIR).join(name)
}

pub fn tag_manifest(root: &Path, name: &str) -> PathBuf {
    tag_dir(root, name).join(MANIFEST_FILE)
}

pub fn tag_members(root: &Path, name: &str) -> PathBuf {
    tag_dir(root, name).join(MEMBERS_FILE)
}

pub fn node_dir(root: &Path, system_id: &str) -> PathBuf {
    root.join(NODES_DIR).join(system_id)
}

pub fn node_manifest(root: &Path, system_id: &str) -> PathBuf {
    node_dir(root, system_id).join(MANIFEST_FILE)
}

pub fn node_facts(root: &Path, system_id: &str) -> PathBuf {
    node_dir(root, system_id).join(FACTS_FILE)
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap())
}

/// Validate a tag name or node system_id. Both share the same rule: non-empty,
/// at most 256 bytes, letters/digits/hyphen/underscore only. Names double as
/// directory names on disk, so anything looser would be a traversal hazard.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 256 || !name_re().is_match(name) {
        return Err(TagError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
