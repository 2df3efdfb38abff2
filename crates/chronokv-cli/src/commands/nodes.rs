use anyhow::{Result, bail};
use chronokv_core::store::Store;
use clap::{Args, Subcommand};
use serde_json::json;
use tracing::debug;

use super::OutputContext;

#[derive(Args)]
pub struct NodesArgs {
    #[command(subcommand)]
    pub command: NodesCommands,
}

#[derive(Subcommand)]
pub enum NodesCommands {
    /// List registered peers
    List,
    /// Register a peer and queue the whole log for it
    Add {
        /// Peer name
        name: String,
    },
    /// Unregister a peer and drop its backlog
    Del {
        /// Peer name
        name: String,
    },
}

#[derive(Args)]
pub struct PendingArgs {
    /// Peer name
    pub node: String,
    /// Maximum number of entries listed
    #[arg(short, long, default_value_t = 100)]
    pub limit: usize,
}

pub fn execute(store: &Store, args: NodesArgs, output: &OutputContext) -> Result<()> {
    match args.command {
        NodesCommands::List => list_nodes(store, output),
        NodesCommands::Add { name } => add_node(store, &name, output),
        NodesCommands::Del { name } => del_node(store, &name, output),
    }
}

fn list_nodes(store: &Store, output: &OutputContext) -> Result<()> {
    let txn = store.read_txn()?;
    let mut rows = Vec::new();
    for name in store.nodes(&txn)? {
        let pending = store.pending_count(&txn, &name)?;
        rows.push((name, pending));
    }

    if output.json {
        let nodes: Vec<_> = rows
            .iter()
            .map(|(name, pending)| json!({ "name": name, "pending": pending }))
            .collect();
        return output.print_json(&json!(nodes));
    }

    let rows: Vec<Vec<String>> = rows
        .into_iter()
        .map(|(name, pending)| vec![name, pending.to_string()])
        .collect();
    output.print_table(&["node", "pending"], &rows);
    Ok(())
}

fn add_node(store: &Store, name: &str, output: &OutputContext) -> Result<()> {
    let mut txn = store.write_txn()?;
    let added = store.add_node(&mut txn, name)?;
    txn.commit()?;
    debug!(node = name, added, "node registration committed");

    let txn = store.read_txn()?;
    let pending = store.pending_count(&txn, name)?;
    if output.json {
        return output.print_json(&json!({ "added": added, "pending": pending }));
    }
    if added {
        output.print_success(&format!("node `{name}` registered with {pending} pending entries"));
    } else {
        output.print_info(&format!("node `{name}` is already registered"));
    }
    Ok(())
}

fn del_node(store: &Store, name: &str, output: &OutputContext) -> Result<()> {
    let mut txn = store.write_txn()?;
    let removed = store.del_node(&mut txn, name)?;
    txn.commit()?;
    debug!(node = name, removed, "node removal committed");

    if output.json {
        return output.print_json(&json!({ "removed": removed }));
    }
    if removed {
        output.print_success(&format!("node `{name}` removed"));
    } else {
        output.print_info(&format!("node `{name}` is not registered"));
    }
    Ok(())
}

pub fn pending(store: &Store, args: PendingArgs, output: &OutputContext) -> Result<()> {
    let txn = store.read_txn()?;
    if !store.node_exists(&txn, &args.node)? {
        bail!("node `{}` is not registered", args.node);
    }
    let total = store.pending_count(&txn, &args.node)?;
    let entries = store.pending_entries(&txn, &args.node, args.limit)?;

    if output.json {
        let rows: Vec<_> = entries
            .iter()
            .map(|(ts, flag)| json!({ "timestamp": ts.to_string(), "flag": flag.as_str() }))
            .collect();
        return output.print_json(&json!({ "node": args.node, "total": total, "entries": rows }));
    }

    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|(ts, flag)| vec![ts.to_string(), flag.to_string()])
        .collect();
    output.print_table(&["timestamp", "flag"], &rows);
    if (entries.len() as u64) < total {
        output.print_info(&format!("showing {} of {total} entries", entries.len()));
    }
    Ok(())
}

pub fn stats(store: &Store, output: &OutputContext) -> Result<()> {
    let txn = store.read_txn()?;
    let stats = store.stats(&txn)?;

    if output.json {
        return output.print_json(&serde_json::to_value(&stats)?);
    }

    let rows = vec![
        vec!["path".to_owned(), store.path().display().to_string()],
        vec!["origin".to_owned(), format!("{:08x}", store.origin())],
        vec!["log entries".to_owned(), stats.log_len.to_string()],
        vec!["keys".to_owned(), stats.keys.to_string()],
        vec!["live keys".to_owned(), stats.live_keys.to_string()],
        vec!["nodes".to_owned(), stats.nodes.to_string()],
        vec!["pending".to_owned(), stats.pending.to_string()],
    ];
    output.print_table(&["stat", "value"], &rows);
    Ok(())
}
