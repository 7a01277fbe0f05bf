use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use nodetag_core::rebuild;
use nodetag_core::tag::TagChanges;
use nodetag_core::TagStore;
use std::path::Path;

#[derive(Subcommand)]
pub enum TagSubcommand {
    /// Create a new tag
    Create {
        name: String,
        /// XPath definition evaluated against node facts (omit for a manual tag)
        #[arg(long, default_value = "")]
        definition: String,
        #[arg(long)]
        comment: Option<String>,
        /// Kernel command-line options for nodes carrying this tag
        #[arg(long)]
        kernel_opts: Option<String>,
    },
    /// List all tags
    List,
    /// Show tag details and its nodes
    Show { name: String },
    /// Update a tag's fields
    Update {
        name: String,
        /// New name for the tag
        #[arg(long)]
        rename: Option<String>,
        /// New definition; pass "" to clear it and make the tag manual
        #[arg(long)]
        definition: Option<String>,
        #[arg(long)]
        comment: Option<String>,
        #[arg(long)]
        kernel_opts: Option<String>,
    },
    /// Delete a tag and all its associations
    Delete { name: String },
    /// List the system_ids associated with a tag
    Nodes { name: String },
    /// Batch add/remove nodes on a tag (adds are applied before removes)
    UpdateNodes {
        name: String,
        #[arg(long)]
        add: Vec<String>,
        #[arg(long)]
        remove: Vec<String>,
        /// Refuse the update if the stored definition differs from this one
        #[arg(long)]
        definition: Option<String>,
    },
    /// Recompute this tag's associations from its definition
    Rebuild { name: String },
}

pub fn run(root: &Path, subcmd: TagSubcommand, json: bool) -> anyhow::Result<()> {
    let store = TagStore::open(root)?;
    match subcmd {
        TagSubcommand::Create {
            name,
            definition,
            comment,
            kernel_opts,
        } => create(&store, &name, &definition, comment, kernel_opts, json),
        TagSubcommand::List => list(&store, json),
        TagSubcommand::Show { name } => show(&store, &name, json),
        TagSubcommand::Update {
            name,
            rename,
            definition,
            comment,
            kernel_opts,
        } => update(&store, &name, rename, definition, comment, kernel_opts, json),
        TagSubcommand::Delete { name } => delete(&store, &name, json),
        TagSubcommand::Nodes { name } => nodes(&store, &name, json),
        TagSubcommand::UpdateNodes {
            name,
            add,
            remove,
            definition,
        } => update_nodes(&store, &name, &add, &remove, definition.as_deref(), json),
        TagSubcommand::Rebuild { name } => rebuild_one(&store, &name, json),
    }
}

fn create(
    store: &TagStore,
    name: &str,
    definition: &str,
    comment: Option<String>,
    kernel_opts: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let tag = store
        .create_tag(name, definition, comment, kernel_opts)
        .with_context(|| format!("failed to create tag '{name}'"))?;

    // A definition-bearing tag is populated right away.
    if !tag.is_manual() {
        let outcome = rebuild::rebuild_tag(store, store.matcher(), name)?;
        if json {
            print_json(&serde_json::json!({ "tag": tag, "populated": outcome }))?;
        } else {
            println!(
                "Created tag: {name} ({} nodes matched, {} evaluation failures)",
                outcome.added,
                outcome.failures.len()
            );
        }
        return Ok(());
    }

    if json {
        print_json(&tag)?;
    } else {
        println!("Created manual tag: {name}");
    }
    Ok(())
}

fn list(store: &TagStore, json: bool) -> anyhow::Result<()> {
    let tags = store.list_tags().context("failed to list tags")?;

    if json {
        let summaries: Vec<_> = tags
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "definition": t.definition,
                    "manual": t.is_manual(),
                    "comment": t.comment,
                    "node_count": store.nodes_for(&t.name).map(|n| n.len()).unwrap_or(0),
                })
            })
            .collect();
        print_json(&summaries)?;
        return Ok(());
    }

    if tags.is_empty() {
        println!("No tags yet.");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = tags
        .iter()
        .map(|t| {
            let count = store.nodes_for(&t.name).map(|n| n.len()).unwrap_or(0);
            vec![
                t.name.clone(),
                if t.is_manual() {
                    "manual".to_string()
                } else {
                    t.definition.clone()
                },
                count.to_string(),
            ]
        })
        .collect();
    print_table(&["NAME", "DEFINITION", "NODES"], rows);
    Ok(())
}

fn show(store: &TagStore, name: &str, json: bool) -> anyhow::Result<()> {
    let tag = store.get_tag(name)?;
    let nodes = store.nodes_for(name)?;

    if json {
        print_json(&serde_json::json!({ "tag": tag, "nodes": nodes }))?;
        return Ok(());
    }

    println!("Tag: {}", tag.name);
    if tag.is_manual() {
        println!("Definition: (manual)");
    } else {
        println!("Definition: {}", tag.definition);
    }
    if let Some(comment) = &tag.comment {
        println!("Comment: {comment}");
    }
    if let Some(kernel_opts) = &tag.kernel_opts {
        println!("Kernel opts: {kernel_opts}");
    }
    println!("Nodes ({}):", nodes.len());
    for system_id in nodes {
        println!("  {system_id}");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn update(
    store: &TagStore,
    name: &str,
    rename: Option<String>,
    definition: Option<String>,
    comment: Option<String>,
    kernel_opts: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let definition_set = matches!(definition.as_deref(), Some(d) if !d.is_empty());
    let tag = store
        .update_tag(
            name,
            TagChanges {
                name: rename,
                definition,
                comment,
                kernel_opts,
            },
        )
        .with_context(|| format!("failed to update tag '{name}'"))?;

    // A new definition re-populates the tag immediately.
    if definition_set {
        let outcome = rebuild::rebuild_tag(store, store.matcher(), &tag.name)?;
        if json {
            print_json(&serde_json::json!({ "tag": tag, "rebuilt": outcome }))?;
        } else {
            println!(
                "Updated tag: {} (+{} / -{} nodes)",
                tag.name, outcome.added, outcome.removed
            );
        }
        return Ok(());
    }

    if json {
        print_json(&tag)?;
    } else {
        println!("Updated tag: {}", tag.name);
    }
    Ok(())
}

fn delete(store: &TagStore, name: &str, json: bool) -> anyhow::Result<()> {
    store
        .delete_tag(name)
        .with_context(|| format!("failed to delete tag '{name}'"))?;

    if json {
        print_json(&serde_json::json!({ "deleted": name }))?;
    } else {
        println!("Deleted tag: {name}");
    }
    Ok(())
}

fn nodes(store: &TagStore, name: &str, json: bool) -> anyhow::Result<()> {
    let nodes = store.nodes_for(name)?;

    if json {
        print_json(&nodes)?;
        return Ok(());
    }
    for system_id in nodes {
        println!("{system_id}");
    }
    Ok(())
}

fn update_nodes(
    store: &TagStore,
    name: &str,
    add: &[String],
    remove: &[String],
    definition: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let counts = store.update_nodes(name, add, remove, definition)?;

    if json {
        print_json(&counts)?;
    } else {
        println!("Tag {name}: +{} / -{} nodes", counts.added, counts.removed);
    }
    Ok(())
}

fn rebuild_one(store: &TagStore, name: &str, json: bool) -> anyhow::Result<()> {
    let outcome = rebuild::rebuild_tag(store, store.matcher(), name)?;

    if json {
        print_json(&outcome)?;
        return Ok(());
    }
    if outcome.manual {
        println!("Tag {name} is manual; associations left untouched.");
    } else {
        println!(
            "Rebuilt tag {name}: +{} / -{} nodes, {} evaluation failures",
            outcome.added,
            outcome.removed,
            outcome.failures.len()
        );
        for failure in &outcome.failures {
            println!("  {}: {}", failure.system_id, failure.reason);
        }
    }
    Ok(())
}
