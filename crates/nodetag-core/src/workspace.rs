use crate::config::Config;
use crate::error::Result;
use crate::io::ensure_dir;
use crate::paths;
use std::path::Path;

/// Initialize the `.nodetag/` tree under `root`. Idempotent: an existing
/// config is kept, not overwritten.
pub fn init(root: &Path, cluster_name: &str) -> Result<Config> {
    ensure_dir(&root.join(paths::TAGS_DIR))?;
    ensure_dir(&root.join(paths::NODES_DIR))?;

    if paths::config_path(root).exists() {
        return Config::load(root);
    }
    let config = Config::new(cluster_name);
    config.save(root)?;
    Ok(config)
}

pub fn is_initialized(root: &Path) -> bool {
    paths::config_path(root).exists()
}
