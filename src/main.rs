use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kgmem::{Config, ManagerRegistry};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::PoisonError;

#[derive(Parser, Debug)]
#[command(name = "kgmem")]
#[command(about = "Inspect and maintain a kgmem knowledge graph store", version)]
struct Args {
    /// Directory holding the namespace files (overrides config and KGMEM_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Namespace to operate on (defaults to store.default_namespace)
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the whole graph
    Read,
    /// Rank entities against a query
    Search {
        query: String,
        /// Maximum number of entities to return
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Print the named entities and the relations between them
    Open {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// List namespaces with a store file
    Namespaces,
    /// Print counts, entity types and implicit entities
    Stats,
    /// Rebuild the search index from the graph
    Rebuild,
    /// Delete every entity and relation in the namespace
    Clear,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(dir) = args.data_dir {
        config.store.base_dir = dir;
    }

    // Logs go to stderr so stdout stays valid JSON
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RUST_LOG", config.store.log_level.as_str()),
    )
    .init();

    log::debug!("Using data directory {}", config.base_dir().display());

    let registry = ManagerRegistry::new(config);
    let manager = registry.default_manager();
    let mut manager = manager.lock().unwrap_or_else(PoisonError::into_inner);
    let namespace = args.namespace.as_deref();

    match args.command {
        Command::Read => print_json(&manager.read_graph(namespace)?)?,
        Command::Search { query, top_k } => {
            print_json(&manager.search_nodes(&query, namespace, top_k)?)?
        }
        Command::Open { names } => print_json(&manager.open_nodes(&names, namespace)?)?,
        Command::Namespaces => print_json(&manager.list_namespaces()?)?,
        Command::Stats => print_json(&manager.graph_stats(namespace)?)?,
        Command::Rebuild => {
            let documents = manager.rebuild_search_index(namespace)?;
            log::info!("Rebuilt search index with {} documents", documents);
            print_json(&serde_json::json!({ "indexed": documents }))?
        }
        Command::Clear => {
            manager.clear_graph(namespace)?;
            print_json(&serde_json::json!({ "cleared": true }))?
        }
    }

    Ok(())
}
