use crate::assoc::{self, Members};
use crate::config::Config;
use crate::error::{Result, TagError};
use crate::matcher::XpathMatcher;
use crate::node::Node;
use crate::paths;
use crate::tag::{Tag, TagChanges};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

// ---------------------------------------------------------------------------
// UpdateCounts
// ---------------------------------------------------------------------------

/// Net membership changes applied by a batch `update_nodes` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpdateCounts {
    pub added: usize,
    pub removed: usize,
}

// ---------------------------------------------------------------------------
// TagStore
// ---------------------------------------------------------------------------

/// Durable tag/node registry rooted at a project directory.
///
/// Tags are independent units: every mutation of one tag's files runs under
/// that tag's mutex, and the member file is replaced whole, so concurrent
/// writers (a rebuild racing a manual call) always land on one caller's
/// intent. There is no global lock.
pub struct TagStore {
    root: PathBuf,
    matcher: XpathMatcher,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TagStore {
    /// Store over an initialized project root; loads the config so XPath
    /// namespace prefixes from `config.yaml` apply to definitions.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let config = Config::load(&root)?;
        Ok(Self::with_matcher(
            root,
            XpathMatcher::with_namespaces(config.namespaces),
        ))
    }

    pub fn with_matcher(root: impl Into<PathBuf>, matcher: XpathMatcher) -> Self {
        Self {
            root: root.into(),
            matcher,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn matcher(&self) -> &XpathMatcher {
        &self.matcher
    }

    fn tag_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // -----------------------------------------------------------------------
    // Tag CRUD
    // -----------------------------------------------------------------------

    pub fn create_tag(
        &self,
        name: &str,
        definition: &str,
        comment: Option<String>,
        kernel_opts: Option<String>,
    ) -> Result<Tag> {
        paths::validate_name(name)?;
        if !definition.is_empty() {
            self.matcher.validate(definition)?;
        }

        let lock = self.tag_lock(name);
        let _guard = hold(&lock);

        if Tag::exists(&self.root, name) {
            return Err(TagError::TagExists(name.to_string()));
        }
        let tag = Tag::new(name, definition, comment, kernel_opts);
        tag.save(&self.root)?;
        Ok(tag)
    }

    /// Update tag fields in place, including rename. An invalid new
    /// definition is rejected before anything touches disk, so the stored
    /// tag is unchanged on failure. Clearing the definition to "" turns the
    /// tag manual; its current associations are left exactly as they are.
    pub fn update_tag(&self, name: &str, changes: TagChanges) -> Result<Tag> {
        if let Some(new_definition) = changes.definition.as_deref() {
            if !new_definition.is_empty() {
                self.matcher.validate(new_definition)?;
            }
        }
        if let Some(new_name) = changes.name.as_deref() {
            paths::validate_name(new_name)?;
        }

        let lock = self.tag_lock(name);
        let _guard = hold(&lock);

        let mut tag = Tag::load(&self.root, name)?;

        if let Some(new_name) = changes.name {
            if new_name != tag.name {
                if Tag::exists(&self.root, &new_name) {
                    return Err(TagError::TagExists(new_name));
                }
                // Move the whole tag directory so the member set travels
                // with the rename.
                std::fs::rename(
                    paths::tag_dir(&self.root, &tag.name),
                    paths::tag_dir(&self.root, &new_name),
                )?;
                tag.name = new_name;
            }
        }
        if let Some(definition) = changes.definition {
            tag.definition = definition;
        }
        if let Some(comment) = changes.comment {
            tag.comment = if comment.is_empty() { None } else { Some(comment) };
        }
        if let Some(kernel_opts) = changes.kernel_opts {
            tag.kernel_opts = if kernel_opts.is_empty() {
                None
            } else {
                Some(kernel_opts)
            };
        }
        tag.updated_at = Utc::now();
        tag.save(&self.root)?;
        Ok(tag)
    }

    /// Delete a tag and every association it holds. The whole tag directory
    /// goes at once, so no node can end up referencing a deleted tag.
    pub fn delete_tag(&self, name: &str) -> Result<()> {
        let lock = self.tag_lock(name);
        let _guard = hold(&lock);

        if !Tag::exists(&self.root, name) {
            return Err(TagError::TagNotFound(name.to_string()));
        }
        std::fs::remove_dir_all(paths::tag_dir(&self.root, name))?;
        Ok(())
    }

    pub fn get_tag(&self, name: &str) -> Result<Tag> {
        Tag::load(&self.root, name)
    }

    pub fn list_tags(&self) -> Result<Vec<Tag>> {
        Tag::list(&self.root)
    }

    // -----------------------------------------------------------------------
    // Associations
    // -----------------------------------------------------------------------

    pub fn nodes_for(&self, name: &str) -> Result<Vec<String>> {
        let members = assoc::members_for_existing(&self.root, name)?;
        Ok(members.nodes.into_iter().collect())
    }

    pub fn tags_for_node(&self, system_id: &str) -> Result<Vec<String>> {
        assoc::tags_for_node(&self.root, system_id)
    }

    /// Explicitly associate a node with a tag. Idempotent: re-adding an
    /// existing member is not an error and changes nothing.
    pub fn add_node(&self, name: &str, system_id: &str) -> Result<()> {
        if !Node::exists(&self.root, system_id) {
            return Err(TagError::NodeNotFound(system_id.to_string()));
        }

        let lock = self.tag_lock(name);
        let _guard = hold(&lock);

        if !Tag::exists(&self.root, name) {
            return Err(TagError::TagNotFound(name.to_string()));
        }
        let mut members = Members::load(&self.root, name)?;
        if members.nodes.insert(system_id.to_string()) {
            members.commit(&self.root, name)?;
        }
        Ok(())
    }

    /// Explicitly dissociate a node from a tag. Idempotent: removing a
    /// non-member is not an error.
    pub fn remove_node(&self, name: &str, system_id: &str) -> Result<()> {
        let lock = self.tag_lock(name);
        let _guard = hold(&lock);

        if !Tag::exists(&self.root, name) {
            return Err(TagError::TagNotFound(name.to_string()));
        }
        let mut members = Members::load(&self.root, name)?;
        if members.nodes.remove(system_id) {
            members.commit(&self.root, name)?;
        }
        Ok(())
    }

    /// Batch add/remove. Adds are processed before removes, so a system_id
    /// named in both lists ends up without the tag. Unknown system_ids in
    /// either list are skipped, not errors. When `expected_definition` is
    /// given and no longer matches the stored definition, the call fails
    /// with `DefinitionChanged` and alters nothing — the caller was working
    /// against a stale definition.
    pub fn update_nodes(
        &self,
        name: &str,
        add: &[String],
        remove: &[String],
        expected_definition: Option<&str>,
    ) -> Result<UpdateCounts> {
        let lock = self.tag_lock(name);
        let _guard = hold(&lock);

        let tag = Tag::load(&self.root, name)?;
        if let Some(expected) = expected_definition {
            if expected != tag.definition {
                return Err(TagError::DefinitionChanged {
                    expected: expected.to_string(),
                    actual: tag.definition,
                });
            }
        }

        let mut members = Members::load(&self.root, name)?;
        let mut counts = UpdateCounts { added: 0, removed: 0 };

        for system_id in add {
            if !Node::exists(&self.root, system_id) {
                continue;
            }
            if members.nodes.insert(system_id.clone()) {
                counts.added += 1;
            }
        }
        for system_id in remove {
            if members.nodes.remove(system_id) {
                counts.removed += 1;
            }
        }

        if counts.added > 0 || counts.removed > 0 {
            members.commit(&self.root, name)?;
        }
        Ok(counts)
    }

    /// Set one node's membership of one tag to a computed value. Used by the
    /// per-node refresh path. Returns whether anything changed.
    pub fn set_membership(&self, name: &str, system_id: &str, member: bool) -> Result<bool> {
        let lock = self.tag_lock(name);
        let _guard = hold(&lock);

        if !Tag::exists(&self.root, name) {
            return Err(TagError::TagNotFound(name.to_string()));
        }
        let mut members = Members::load(&self.root, name)?;
        let changed = if member {
            members.nodes.insert(system_id.to_string())
        } else {
            members.nodes.remove(system_id)
        };
        if changed {
            members.commit(&self.root, name)?;
        }
        Ok(changed)
    }

    /// Replace a tag's member set with a freshly computed one, returning how
    /// many system_ids were added and removed. No-op (and no version bump)
    /// when the desired set equals the stored set — this is what makes a
    /// repeated rebuild report zero changes.
    pub fn replace_members(&self, name: &str, desired: &BTreeSet<String>) -> Result<UpdateCounts> {
        let lock = self.tag_lock(name);
        let _guard = hold(&lock);

        if !Tag::exists(&self.root, name) {
            return Err(TagError::TagNotFound(name.to_string()));
        }
        let mut members = Members::load(&self.root, name)?;
        let added = desired.difference(&members.nodes).count();
        let removed = members.nodes.difference(desired).count();
        if added > 0 || removed > 0 {
            members.nodes = desired.clone();
            members.commit(&self.root, name)?;
        }
        Ok(UpdateCounts { added, removed })
    }

    // -----------------------------------------------------------------------
    // Node registry (hardware fact provider boundary)
    // -----------------------------------------------------------------------

    pub fn register_node(
        &self,
        system_id: &str,
        hostname: Option<String>,
        facts_xml: &str,
    ) -> Result<Node> {
        paths::validate_name(system_id)?;
        if Node::exists(&self.root, system_id) {
            return Err(TagError::NodeExists(system_id.to_string()));
        }
        let mut node = Node::new(system_id, hostname);
        node.save(&self.root)?;
        node.set_facts(&self.root, facts_xml)?;
        Ok(node)
    }

    pub fn get_node(&self, system_id: &str) -> Result<Node> {
        Node::load(&self.root, system_id)
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        Node::list(&self.root)
    }

    pub fn node_facts(&self, system_id: &str) -> Result<String> {
        Node::facts(&self.root, system_id)
    }

    pub fn set_node_facts(&self, system_id: &str, facts_xml: &str) -> Result<Node> {
        let mut node = Node::load(&self.root, system_id)?;
        node.set_facts(&self.root, facts_xml)?;
        Ok(node)
    }

    /// Remove a node and scrub its membership from every tag, each under
    /// that tag's lock. Returns the tags it was scrubbed from.
    pub fn deregister_node(&self, system_id: &str) -> Result<Vec<String>> {
        if !Node::exists(&self.root, system_id) {
            return Err(TagError::NodeNotFound(system_id.to_string()));
        }
        std::fs::remove_dir_all(paths::node_dir(&self.root, system_id))?;

        let mut scrubbed = Vec::new();
        for tag in Tag::list(&self.root)? {
            match self.set_membership(&tag.name, system_id, false) {
                Ok(true) => scrubbed.push(tag.name),
                Ok(false) => {}
                // Tag deleted between the listing and the scrub; nothing
                // left to clean for it.
                Err(TagError::TagNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(scrubbed)
    }
}

fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> TagStore {
        crate::workspace::init(dir.path(), "test-cluster").unwrap();
        TagStore::open(dir.path()).unwrap()
    }

    fn register(store: &TagStore, system_id: &str) {
        store
            .register_node(system_id, None, "<list/>")
            .unwrap();
    }

    #[test]
    fn create_and_get_tag() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.create_tag("gpu", "//display", Some("has a GPU".to_string()), None)
            .unwrap();
        let tag = s.get_tag("gpu").unwrap();
        assert_eq!(tag.definition, "//display");
    }

    #[test]
    fn create_duplicate_tag_fails() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.create_tag("gpu", "", None, None).unwrap();
        assert!(matches!(
            s.create_tag("gpu", "", None, None),
            Err(TagError::TagExists(_))
        ));
    }

    #[test]
    fn create_with_invalid_name_fails() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        for name in ["invalid:name", "bad tag", ""] {
            assert!(matches!(
                s.create_tag(name, "", None, None),
                Err(TagError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn create_with_invalid_definition_fails_before_persisting() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        assert!(matches!(
            s.create_tag("gpu", "invalid::tag", None, None),
            Err(TagError::InvalidDefinition { .. })
        ));
        assert!(matches!(
            s.get_tag("gpu"),
            Err(TagError::TagNotFound(_))
        ));
    }

    #[test]
    fn update_with_invalid_definition_leaves_tag_unchanged() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.create_tag("gpu", "//child", None, None).unwrap();
        let err = s.update_tag(
            "gpu",
            TagChanges {
                name: Some("bad tag".to_string()),
                definition: Some("invalid::tag".to_string()),
                ..Default::default()
            },
        );
        assert!(err.is_err());
        let tag = s.get_tag("gpu").unwrap();
        assert_eq!(tag.definition, "//child");
    }

    #[test]
    fn rename_preserves_associations() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        register(&s, "node-01");
        s.create_tag("gpu", "", None, None).unwrap();
        s.add_node("gpu", "node-01").unwrap();

        s.update_tag(
            "gpu",
            TagChanges {
                name: Some("graphics".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(matches!(s.get_tag("gpu"), Err(TagError::TagNotFound(_))));
        assert_eq!(s.nodes_for("graphics").unwrap(), vec!["node-01"]);
    }

    #[test]
    fn rename_to_existing_tag_fails() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.create_tag("gpu", "", None, None).unwrap();
        s.create_tag("ssd", "", None, None).unwrap();
        assert!(matches!(
            s.update_tag(
                "gpu",
                TagChanges {
                    name: Some("ssd".to_string()),
                    ..Default::default()
                }
            ),
            Err(TagError::TagExists(_))
        ));
    }

    #[test]
    fn clearing_definition_keeps_associations() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        register(&s, "node-01");
        s.create_tag("gpu", "//display", None, None).unwrap();
        s.add_node("gpu", "node-01").unwrap();

        s.update_tag(
            "gpu",
            TagChanges {
                definition: Some(String::new()),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(s.get_tag("gpu").unwrap().is_manual());
        assert_eq!(s.nodes_for("gpu").unwrap(), vec!["node-01"]);
    }

    #[test]
    fn delete_cascades_associations() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        register(&s, "node-01");
        s.create_tag("gpu", "", None, None).unwrap();
        s.add_node("gpu", "node-01").unwrap();

        s.delete_tag("gpu").unwrap();
        assert!(matches!(
            s.nodes_for("gpu"),
            Err(TagError::TagNotFound(_))
        ));
        assert!(s.tags_for_node("node-01").unwrap().is_empty());
    }

    #[test]
    fn add_node_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        register(&s, "node-01");
        s.create_tag("gpu", "", None, None).unwrap();
        s.add_node("gpu", "node-01").unwrap();
        s.add_node("gpu", "node-01").unwrap();
        assert_eq!(s.nodes_for("gpu").unwrap(), vec!["node-01"]);
    }

    #[test]
    fn add_node_requires_both_sides() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        register(&s, "node-01");
        s.create_tag("gpu", "", None, None).unwrap();
        assert!(matches!(
            s.add_node("gpu", "ghost"),
            Err(TagError::NodeNotFound(_))
        ));
        assert!(matches!(
            s.add_node("ghost", "node-01"),
            Err(TagError::TagNotFound(_))
        ));
    }

    #[test]
    fn remove_node_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.create_tag("gpu", "", None, None).unwrap();
        s.remove_node("gpu", "never-added").unwrap();
    }

    #[test]
    fn update_nodes_counts_changes() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        register(&s, "node-01");
        register(&s, "node-02");
        s.create_tag("gpu", "", None, None).unwrap();
        s.add_node("gpu", "node-01").unwrap();

        let counts = s
            .update_nodes(
                "gpu",
                &["node-02".to_string()],
                &["node-01".to_string()],
                None,
            )
            .unwrap();
        assert_eq!(counts, UpdateCounts { added: 1, removed: 1 });
        assert_eq!(s.nodes_for("gpu").unwrap(), vec!["node-02"]);
    }

    #[test]
    fn update_nodes_add_then_remove_same_node() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        register(&s, "node-01");
        s.create_tag("gpu", "", None, None).unwrap();

        let counts = s
            .update_nodes(
                "gpu",
                &["node-01".to_string()],
                &["node-01".to_string()],
                None,
            )
            .unwrap();
        // Added, then removed again within the same batch.
        assert_eq!(counts, UpdateCounts { added: 1, removed: 1 });
        assert!(s.nodes_for("gpu").unwrap().is_empty());
    }

    #[test]
    fn update_nodes_ignores_unknown_nodes() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.create_tag("gpu", "", None, None).unwrap();

        let counts = s
            .update_nodes(
                "gpu",
                &["ghost-add".to_string()],
                &["ghost-remove".to_string()],
                None,
            )
            .unwrap();
        assert_eq!(counts, UpdateCounts { added: 0, removed: 0 });
        assert!(s.nodes_for("gpu").unwrap().is_empty());
    }

    #[test]
    fn update_nodes_unknown_tag_fails() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        assert!(matches!(
            s.update_nodes("ghost", &[], &[], None),
            Err(TagError::TagNotFound(_))
        ));
    }

    #[test]
    fn update_nodes_with_stale_definition_is_refused() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        register(&s, "node-01");
        s.create_tag("gpu", "//old", None, None).unwrap();
        s.update_tag(
            "gpu",
            TagChanges {
                definition: Some("//new".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        let err = s
            .update_nodes("gpu", &["node-01".to_string()], &[], Some("//old"))
            .unwrap_err();
        assert!(matches!(err, TagError::DefinitionChanged { .. }));
        assert!(s.nodes_for("gpu").unwrap().is_empty());
    }

    #[test]
    fn manual_batch_scenario() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        for id in ["a", "b", "c", "d"] {
            register(&s, id);
        }
        s.create_tag("my_tag", "", None, None).unwrap();

        s.update_nodes(
            "my_tag",
            &["a".to_string(), "b".to_string(), "c".to_string()],
            &["d".to_string()],
            None,
        )
        .unwrap();
        s.update_nodes("my_tag", &["d".to_string()], &["a".to_string()], None)
            .unwrap();

        assert_eq!(s.nodes_for("my_tag").unwrap(), vec!["b", "c", "d"]);
    }

    #[test]
    fn replace_members_is_a_noop_when_unchanged() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        register(&s, "node-01");
        s.create_tag("gpu", "//display", None, None).unwrap();

        let desired: BTreeSet<String> = ["node-01".to_string()].into_iter().collect();
        let first = s.replace_members("gpu", &desired).unwrap();
        assert_eq!(first, UpdateCounts { added: 1, removed: 0 });
        let version_after_first = Members::load(s.root(), "gpu").unwrap().version;

        let second = s.replace_members("gpu", &desired).unwrap();
        assert_eq!(second, UpdateCounts { added: 0, removed: 0 });
        assert_eq!(
            Members::load(s.root(), "gpu").unwrap().version,
            version_after_first
        );
    }

    #[test]
    fn register_node_twice_fails() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        register(&s, "node-01");
        assert!(matches!(
            s.register_node("node-01", None, "<list/>"),
            Err(TagError::NodeExists(_))
        ));
    }

    #[test]
    fn deregister_scrubs_memberships() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        register(&s, "node-01");
        s.create_tag("gpu", "", None, None).unwrap();
        s.create_tag("ssd", "", None, None).unwrap();
        s.add_node("gpu", "node-01").unwrap();
        s.add_node("ssd", "node-01").unwrap();

        let scrubbed = s.deregister_node("node-01").unwrap();
        assert_eq!(scrubbed, vec!["gpu", "ssd"]);
        assert!(s.nodes_for("gpu").unwrap().is_empty());
        assert!(matches!(
            s.get_node("node-01"),
            Err(TagError::NodeNotFound(_))
        ));
    }
}
