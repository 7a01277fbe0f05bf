use crate::error::{Result, TagError};
use crate::matcher::Matcher;
use crate::store::TagStore;
use crate::tag::Tag;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// One (tag, node) pair that could not be evaluated. The pair counts as
/// no-match; nothing else in the batch is affected.
#[derive(Debug, Clone, Serialize)]
pub struct EvalFailure {
    pub system_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagRebuild {
    pub tag: String,
    pub manual: bool,
    pub added: usize,
    pub removed: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<EvalFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tags: Vec<TagRebuild>,
}

impl RebuildReport {
    pub fn total_added(&self) -> usize {
        self.tags.iter().map(|t| t.added).sum()
    }

    pub fn total_removed(&self) -> usize {
        self.tags.iter().map(|t| t.removed).sum()
    }

    pub fn total_failures(&self) -> usize {
        self.tags.iter().map(|t| t.failures.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TagEvalFailure {
    pub tag: String,
    pub reason: String,
}

/// Outcome of re-evaluating one node against every definition-bearing tag
/// after a facts refresh.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRefresh {
    pub system_id: String,
    pub tagged: Vec<String>,
    pub untagged: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<TagEvalFailure>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Full recomputation of associations for every definition-bearing tag.
///
/// Manual tags are skipped entirely. A definition that fails to evaluate
/// against some node counts as no-match for that pair and is recorded in
/// the report; the batch always runs to completion and commits whatever
/// succeeded. Running twice over unchanged inputs reports zero changes on
/// the second pass, which is also the recovery story for an interrupted
/// run: the next rebuild reconverges, no rollback needed.
pub fn rebuild_all(store: &TagStore, matcher: &dyn Matcher) -> Result<RebuildReport> {
    let started_at = Utc::now();
    let tags = store.list_tags()?;
    let facts = load_facts(store)?;

    let mut results = Vec::new();
    for tag in tags {
        if tag.is_manual() {
            continue;
        }
        if let Some(result) = apply_tag(store, matcher, &tag, &facts)? {
            results.push(result);
        }
    }

    Ok(RebuildReport {
        started_at,
        finished_at: Utc::now(),
        tags: results,
    })
}

/// Recompute a single tag's associations (`op=rebuild` granularity).
/// A manual tag is reported untouched rather than being an error.
pub fn rebuild_tag(store: &TagStore, matcher: &dyn Matcher, name: &str) -> Result<TagRebuild> {
    let tag = store.get_tag(name)?;
    if tag.is_manual() {
        return Ok(TagRebuild {
            tag: tag.name,
            manual: true,
            added: 0,
            removed: 0,
            failures: Vec::new(),
        });
    }
    let facts = load_facts(store)?;
    apply_tag(store, matcher, &tag, &facts)?
        .ok_or_else(|| TagError::TagNotFound(name.to_string()))
}

/// Re-evaluate one node against every definition-bearing tag, patching its
/// membership per tag. Lands the same end state a global rebuild would for
/// this node; used after a facts refresh instead of the full batch.
pub fn refresh_node(store: &TagStore, matcher: &dyn Matcher, system_id: &str) -> Result<NodeRefresh> {
    let facts = store.node_facts(system_id)?;

    let mut refresh = NodeRefresh {
        system_id: system_id.to_string(),
        tagged: Vec::new(),
        untagged: Vec::new(),
        failures: Vec::new(),
    };

    for tag in store.list_tags()? {
        if tag.is_manual() {
            continue;
        }
        let member = match matcher.evaluate(&tag.definition, &facts) {
            Ok(member) => member,
            Err(e) => {
                refresh.failures.push(TagEvalFailure {
                    tag: tag.name.clone(),
                    reason: e.to_string(),
                });
                false
            }
        };
        match store.set_membership(&tag.name, system_id, member) {
            Ok(true) if member => refresh.tagged.push(tag.name),
            Ok(true) => refresh.untagged.push(tag.name),
            Ok(false) => {}
            // Tag deleted while we were iterating; skip it.
            Err(TagError::TagNotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(refresh)
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

/// Per-node facts, or the reason they could not be read. A node whose facts
/// are unreadable counts as no-match for every tag, with a failure recorded
/// per pair.
fn load_facts(store: &TagStore) -> Result<Vec<(String, std::result::Result<String, String>)>> {
    let mut facts = Vec::new();
    for node in store.list_nodes()? {
        let outcome = store
            .node_facts(&node.system_id)
            .map_err(|e| e.to_string());
        facts.push((node.system_id, outcome));
    }
    Ok(facts)
}

/// Compute and commit the desired member set for one tag. Returns `None`
/// when the tag vanished under us (deleted concurrently).
fn apply_tag(
    store: &TagStore,
    matcher: &dyn Matcher,
    tag: &Tag,
    facts: &[(String, std::result::Result<String, String>)],
) -> Result<Option<TagRebuild>> {
    let mut desired = BTreeSet::new();
    let mut failures = Vec::new();

    for (system_id, outcome) in facts {
        let facts_xml = match outcome {
            Ok(xml) => xml,
            Err(reason) => {
                failures.push(EvalFailure {
                    system_id: system_id.clone(),
                    reason: reason.clone(),
                });
                continue;
            }
        };
        match matcher.evaluate(&tag.definition, facts_xml) {
            Ok(true) => {
                desired.insert(system_id.clone());
            }
            Ok(false) => {}
            Err(e) => failures.push(EvalFailure {
                system_id: system_id.clone(),
                reason: e.to_string(),
            }),
        }
    }

    match store.replace_members(&tag.name, &desired) {
        Ok(counts) => Ok(Some(TagRebuild {
            tag: tag.name.clone(),
            manual: false,
            added: counts.added,
            removed: counts.removed,
            failures,
        })),
        Err(TagError::TagNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::XpathMatcher;
    use crate::tag::TagChanges;
    use tempfile::TempDir;

    /// Closure-backed matcher so membership can be decided without XML.
    struct FnMatcher<F>(F);

    impl<F> Matcher for FnMatcher<F>
    where
        F: Fn(&str, &str) -> Result<bool> + Send + Sync,
    {
        fn evaluate(&self, definition: &str, facts_xml: &str) -> Result<bool> {
            (self.0)(definition, facts_xml)
        }
    }

    fn store(dir: &TempDir) -> TagStore {
        crate::workspace::init(dir.path(), "test-cluster").unwrap();
        TagStore::open(dir.path()).unwrap()
    }

    fn display_facts(clock: u64) -> String {
        format!(
            r#"<list><node id="display"><clock>{clock}</clock><vendor>acme</vendor></node></list>"#
        )
    }

    #[test]
    fn gpu_scenario_tags_only_the_fast_node() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.register_node("a", None, &display_facts(1_500_000_000))
            .unwrap();
        s.register_node("b", None, &display_facts(800_000_000))
            .unwrap();
        s.create_tag(
            "gpu",
            r#"//node[@id="display"]/clock > 1000000000"#,
            None,
            None,
        )
        .unwrap();

        let report = rebuild_all(&s, &XpathMatcher::new()).unwrap();
        assert_eq!(report.total_added(), 1);
        assert_eq!(report.total_failures(), 0);
        assert_eq!(s.nodes_for("gpu").unwrap(), vec!["a"]);
    }

    #[test]
    fn rebuild_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.register_node("a", None, "<foo/>").unwrap();
        s.register_node("b", None, "<bar/>").unwrap();
        s.create_tag("foo", "/foo", None, None).unwrap();

        let first = rebuild_all(&s, &XpathMatcher::new()).unwrap();
        assert_eq!(first.total_added(), 1);

        let second = rebuild_all(&s, &XpathMatcher::new()).unwrap();
        assert_eq!(second.total_added(), 0);
        assert_eq!(second.total_removed(), 0);
        assert_eq!(s.nodes_for("foo").unwrap(), vec!["a"]);
    }

    #[test]
    fn manual_tags_are_never_touched() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.register_node("a", None, "<foo/>").unwrap();
        s.create_tag("my_tag", "", None, None).unwrap();
        s.add_node("my_tag", "a").unwrap();

        let report = rebuild_all(&s, &XpathMatcher::new()).unwrap();
        assert!(report.tags.is_empty());
        assert_eq!(s.nodes_for("my_tag").unwrap(), vec!["a"]);

        let single = rebuild_tag(&s, &XpathMatcher::new(), "my_tag").unwrap();
        assert!(single.manual);
        assert_eq!(s.nodes_for("my_tag").unwrap(), vec!["a"]);
    }

    #[test]
    fn manual_override_on_definition_tag_is_transient() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.register_node("a", None, "<bar/>").unwrap();
        s.create_tag("foo", "/foo", None, None).unwrap();
        s.add_node("foo", "a").unwrap();

        rebuild_all(&s, &XpathMatcher::new()).unwrap();
        // Node "a" does not satisfy /foo, so the manual add is gone.
        assert!(s.nodes_for("foo").unwrap().is_empty());
    }

    #[test]
    fn clearing_definition_freezes_members_across_rebuild() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.register_node("a", None, "<foo/>").unwrap();
        s.create_tag("foo", "/foo", None, None).unwrap();
        rebuild_all(&s, &XpathMatcher::new()).unwrap();
        assert_eq!(s.nodes_for("foo").unwrap(), vec!["a"]);

        s.update_tag(
            "foo",
            TagChanges {
                definition: Some(String::new()),
                ..Default::default()
            },
        )
        .unwrap();
        // Now manual; even though "a" facts no longer matter, the frozen
        // association survives the next rebuild.
        s.set_node_facts("a", "<bar/>").unwrap();
        rebuild_all(&s, &XpathMatcher::new()).unwrap();
        assert_eq!(s.nodes_for("foo").unwrap(), vec!["a"]);
    }

    #[test]
    fn one_bad_definition_does_not_abort_the_batch() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.register_node("a", None, "<foo/>").unwrap();
        // Syntactically valid, fails at evaluation on every node.
        s.create_tag("broken", "//hw:thing", None, None).unwrap();
        s.create_tag("foo", "/foo", None, None).unwrap();

        let report = rebuild_all(&s, &XpathMatcher::new()).unwrap();
        assert_eq!(s.nodes_for("foo").unwrap(), vec!["a"]);
        assert!(s.nodes_for("broken").unwrap().is_empty());

        let broken = report.tags.iter().find(|t| t.tag == "broken").unwrap();
        assert_eq!(broken.failures.len(), 1);
        assert_eq!(broken.failures[0].system_id, "a");
    }

    #[test]
    fn failing_pair_converges_to_no_match() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.register_node("a", None, "<foo/>").unwrap();
        s.create_tag("flaky", "/foo", None, None).unwrap();
        s.add_node("flaky", "a").unwrap();

        // Matcher that errors for every pair: existing membership is
        // dropped, since an unevaluable pair counts as no-match.
        let failing = FnMatcher(|definition: &str, _: &str| {
            Err(TagError::Evaluation {
                expression: definition.to_string(),
                reason: "boom".to_string(),
            })
        });
        let report = rebuild_all(&s, &failing).unwrap();
        assert_eq!(report.total_failures(), 1);
        assert!(s.nodes_for("flaky").unwrap().is_empty());
    }

    #[test]
    fn rebuild_tag_only_touches_that_tag() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.register_node("a", None, "<foo/>").unwrap();
        s.create_tag("foo", "/foo", None, None).unwrap();
        s.create_tag("bar", "/bar", None, None).unwrap();
        s.add_node("bar", "a").unwrap();

        let result = rebuild_tag(&s, &XpathMatcher::new(), "foo").unwrap();
        assert_eq!(result.added, 1);
        // "bar" was not rebuilt, so its stale manual member is still there.
        assert_eq!(s.nodes_for("bar").unwrap(), vec!["a"]);
    }

    #[test]
    fn rebuild_tag_unknown_tag_errors() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        assert!(matches!(
            rebuild_tag(&s, &XpathMatcher::new(), "ghost"),
            Err(TagError::TagNotFound(_))
        ));
    }

    #[test]
    fn refresh_node_matches_global_rebuild_for_that_node() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.register_node("a", None, "<foo/>").unwrap();
        s.create_tag("foo", "/foo", None, None).unwrap();
        s.create_tag("bar", "/bar", None, None).unwrap();
        rebuild_all(&s, &XpathMatcher::new()).unwrap();
        assert_eq!(s.nodes_for("foo").unwrap(), vec!["a"]);

        s.set_node_facts("a", "<bar/>").unwrap();
        let refresh = refresh_node(&s, &XpathMatcher::new(), "a").unwrap();
        assert_eq!(refresh.tagged, vec!["bar"]);
        assert_eq!(refresh.untagged, vec!["foo"]);

        // A global rebuild now reports no further changes.
        let report = rebuild_all(&s, &XpathMatcher::new()).unwrap();
        assert_eq!(report.total_added(), 0);
        assert_eq!(report.total_removed(), 0);
    }

    #[test]
    fn refresh_node_unknown_node_errors() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        assert!(matches!(
            refresh_node(&s, &XpathMatcher::new(), "ghost"),
            Err(TagError::NodeNotFound(_))
        ));
    }
}
