mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, node::NodeSubcommand, tag::TagSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "nodetag",
    about = "Tag bare-metal nodes by hand or by XPath definitions over their hardware facts",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .nodetag/ or .git/)
    #[arg(long, global = true, env = "NODETAG_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize nodetag in the current project
    Init {
        /// Cluster name (default: the root directory's name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Manage tags
    Tag {
        #[command(subcommand)]
        subcommand: TagSubcommand,
    },

    /// Manage nodes and their hardware facts
    Node {
        #[command(subcommand)]
        subcommand: NodeSubcommand,
    },

    /// Recompute associations for every definition-bearing tag
    Rebuild,

    /// Validate the project configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Run the JSON API server
    Serve {
        /// Port to listen on (0 = OS-assigned)
        #[arg(long, default_value = "5240")]
        port: u16,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root_path = cli.root.as_deref();
    let root = root::resolve_root(root_path);

    let result = match cli.command {
        Commands::Init { name } => cmd::init::run(&root, name.as_deref(), cli.json),
        Commands::Tag { subcommand } => cmd::tag::run(&root, subcommand, cli.json),
        Commands::Node { subcommand } => cmd::node::run(&root, subcommand, cli.json),
        Commands::Rebuild => cmd::rebuild::run(&root, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Serve { port } => cmd::serve::run(&root, port),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
