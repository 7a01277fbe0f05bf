use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use nodetag_core::rebuild;
use nodetag_core::TagStore;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum NodeSubcommand {
    /// Register a node with its hardware-facts XML
    Register {
        system_id: String,
        #[arg(long)]
        hostname: Option<String>,
        /// Path to the facts XML document ("-" reads stdin)
        #[arg(long)]
        facts: PathBuf,
    },
    /// List registered nodes
    List,
    /// Show node details and its tags
    Show { system_id: String },
    /// Replace a node's facts and re-evaluate its tags
    SetFacts {
        system_id: String,
        /// Path to the facts XML document ("-" reads stdin)
        facts: PathBuf,
    },
    /// Deregister a node, scrubbing it from every tag
    Remove { system_id: String },
}

pub fn run(root: &Path, subcmd: NodeSubcommand, json: bool) -> anyhow::Result<()> {
    let store = TagStore::open(root)?;
    match subcmd {
        NodeSubcommand::Register {
            system_id,
            hostname,
            facts,
        } => register(&store, &system_id, hostname, &facts, json),
        NodeSubcommand::List => list(&store, json),
        NodeSubcommand::Show { system_id } => show(&store, &system_id, json),
        NodeSubcommand::SetFacts { system_id, facts } => set_facts(&store, &system_id, &facts, json),
        NodeSubcommand::Remove { system_id } => remove(&store, &system_id, json),
    }
}

fn read_facts(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read facts from {}", path.display()))
}

fn register(
    store: &TagStore,
    system_id: &str,
    hostname: Option<String>,
    facts_path: &Path,
    json: bool,
) -> anyhow::Result<()> {
    let facts = read_facts(facts_path)?;
    let node = store
        .register_node(system_id, hostname, &facts)
        .with_context(|| format!("failed to register node '{system_id}'"))?;
    let refresh = rebuild::refresh_node(store, store.matcher(), system_id)?;

    if json {
        print_json(&serde_json::json!({ "node": node, "refresh": refresh }))?;
    } else {
        println!(
            "Registered node: {system_id} ({} tags applied)",
            refresh.tagged.len()
        );
        for tag in &refresh.tagged {
            println!("  +{tag}");
        }
    }
    Ok(())
}

fn list(store: &TagStore, json: bool) -> anyhow::Result<()> {
    let nodes = store.list_nodes().context("failed to list nodes")?;

    if json {
        let summaries: Vec<_> = nodes
            .iter()
            .map(|n| {
                serde_json::json!({
                    "system_id": n.system_id,
                    "hostname": n.hostname,
                    "tags": store.tags_for_node(&n.system_id).unwrap_or_default(),
                    "facts_updated_at": n.facts_updated_at,
                })
            })
            .collect();
        print_json(&summaries)?;
        return Ok(());
    }

    if nodes.is_empty() {
        println!("No nodes registered.");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = nodes
        .iter()
        .map(|n| {
            let tags = store.tags_for_node(&n.system_id).unwrap_or_default();
            vec![
                n.system_id.clone(),
                n.hostname.clone().unwrap_or_default(),
                tags.join(","),
            ]
        })
        .collect();
    print_table(&["SYSTEM_ID", "HOSTNAME", "TAGS"], rows);
    Ok(())
}

fn show(store: &TagStore, system_id: &str, json: bool) -> anyhow::Result<()> {
    let node = store.get_node(system_id)?;
    let tags = store.tags_for_node(system_id)?;

    if json {
        print_json(&serde_json::json!({ "node": node, "tags": tags }))?;
        return Ok(());
    }

    println!("Node: {}", node.system_id);
    if let Some(hostname) = &node.hostname {
        println!("Hostname: {hostname}");
    }
    println!("Registered: {}", node.registered_at);
    println!("Facts updated: {}", node.facts_updated_at);
    println!("Tags ({}):", tags.len());
    for tag in tags {
        println!("  {tag}");
    }
    Ok(())
}

fn set_facts(store: &TagStore, system_id: &str, facts_path: &Path, json: bool) -> anyhow::Result<()> {
    let facts = read_facts(facts_path)?;
    store
        .set_node_facts(system_id, &facts)
        .with_context(|| format!("failed to update facts for '{system_id}'"))?;
    let refresh = rebuild::refresh_node(store, store.matcher(), system_id)?;

    if json {
        print_json(&refresh)?;
    } else {
        println!(
            "Refreshed facts for {system_id}: +{} / -{} tags",
            refresh.tagged.len(),
            refresh.untagged.len()
        );
        for tag in &refresh.tagged {
            println!("  +{tag}");
        }
        for tag in &refresh.untagged {
            println!("  -{tag}");
        }
    }
    Ok(())
}

fn remove(store: &TagStore, system_id: &str, json: bool) -> anyhow::Result<()> {
    let scrubbed = store
        .deregister_node(system_id)
        .with_context(|| format!("failed to deregister node '{system_id}'"))?;

    if json {
        print_json(&serde_json::json!({ "removed": system_id, "scrubbed_from": scrubbed }))?;
    } else {
        println!("Removed node: {system_id}");
        for tag in scrubbed {
            println!("  -{tag}");
        }
    }
    Ok(())
}
