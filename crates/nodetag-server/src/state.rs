use crate::jobs::RebuildRegistry;
use nodetag_core::TagStore;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Shared application state passed to all route handlers.
///
/// The store is shared (not per-request) so its per-tag locks actually
/// serialize concurrent handlers touching the same tag.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TagStore>,
    pub jobs: Arc<Mutex<RebuildRegistry>>,
}

impl AppState {
    pub fn new(root: PathBuf) -> nodetag_core::Result<Self> {
        let store = TagStore::open(root)?;
        Ok(Self {
            store: Arc::new(store),
            jobs: Arc::new(Mutex::new(RebuildRegistry::new())),
        })
    }
}
