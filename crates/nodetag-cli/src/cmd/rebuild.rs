use crate::output::{print_json, print_table};
use nodetag_core::rebuild;
use nodetag_core::TagStore;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let store = TagStore::open(root)?;
    let report = rebuild::rebuild_all(&store, store.matcher())?;

    if json {
        print_json(&report)?;
        return Ok(());
    }

    if report.tags.is_empty() {
        println!("No definition-bearing tags to rebuild.");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = report
        .tags
        .iter()
        .map(|t| {
            vec![
                t.tag.clone(),
                t.added.to_string(),
                t.removed.to_string(),
                t.failures.len().to_string(),
            ]
        })
        .collect();
    print_table(&["TAG", "ADDED", "REMOVED", "FAILURES"], rows);

    for tag in &report.tags {
        for failure in &tag.failures {
            println!("{}: {}: {}", tag.tag, failure.system_id, failure.reason);
        }
    }
    println!(
        "Rebuilt {} tags: +{} / -{} associations",
        report.tags.len(),
        report.total_added(),
        report.total_removed()
    );
    Ok(())
}
