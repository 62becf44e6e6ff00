//! treefs - run tree commands against a treefs store.
//!
//! With command words on the command line, runs that one command and exits.
//! Without them, reads one command per line from stdin, keeping the current
//! folder between lines.
//!
//! Logs go to stderr; stdout carries only command output.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use treefs_kernel::{Command, NodeStat, Output, Session, TreeConfig, TreeRepository};

const DB_FILE: &str = "tree.db";

#[derive(Parser, Debug)]
#[command(name = "treefs")]
#[command(about = "Folder/file tree kept in SQLite")]
struct Args {
    /// Config file (RON). Defaults to $XDG_CONFIG_HOME/treefs/config.ron
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database file, overriding the config
    #[arg(long)]
    db: Option<PathBuf>,

    /// Use a throwaway in-memory store
    #[arg(long, conflicts_with = "db")]
    memory: bool,

    /// Print `stat`, `ls -l` and `fsck` results as JSON
    #[arg(long)]
    json: bool,

    /// Command to run, e.g. `ls /docs`. Omit to read commands from stdin.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    tracing::debug!(database = ?config.database, "opening tree");
    let repo = Arc::new(TreeRepository::open(&config).context("opening tree store")?);
    let mut session = Session::new(Arc::clone(&repo));

    if !args.command.is_empty() {
        let command = Command::from_args(&args.command)?;
        let output = session.execute(command).await?;
        render(&output, args.json)?;
        log_cache(&repo);
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match session.execute_line(&line).await {
            Ok(Some(output)) => render(&output, args.json)?,
            Ok(None) => {}
            Err(e) => eprintln!("error: {e}"),
        }
    }
    log_cache(&repo);
    Ok(())
}

fn log_cache(repo: &TreeRepository) {
    if let Some(stats) = repo.cache_stats() {
        tracing::debug!(
            hits = stats.hits,
            misses = stats.misses,
            entries = stats.entries,
            "resolution cache"
        );
    }
}

fn load_config(args: &Args) -> Result<TreeConfig> {
    let mut config = match &args.config {
        Some(path) => {
            TreeConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => match TreeConfig::default_path() {
            Some(path) => TreeConfig::load_or_default(&path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => TreeConfig::default(),
        },
    };

    if args.memory {
        config.database = None;
    } else if let Some(db) = &args.db {
        config = config.with_database(db);
    } else if config.database.is_none() {
        let dir = dirs::data_dir()
            .context("no data directory; pass --db or --memory")?
            .join("treefs");
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        config = config.with_database(dir.join(DB_FILE));
    }
    Ok(config)
}

fn render(output: &Output, json: bool) -> Result<()> {
    let mut out = std::io::stdout().lock();
    match output {
        Output::Cwd(path) => writeln!(out, "{path}")?,
        Output::Created { id, path } => writeln!(out, "{} {path}", id.short())?,
        Output::Content(bytes) => {
            out.write_all(bytes)?;
            if !bytes.ends_with(b"\n") {
                writeln!(out)?;
            }
        }
        Output::Listing(children) => {
            for child in children {
                let slash = if child.is_folder() { "/" } else { "" };
                writeln!(out, "{}{slash}", child.name)?;
            }
        }
        Output::LongListing { folder, children } if json => {
            let listing = serde_json::json!({ "folder": folder, "children": children });
            writeln!(out, "{}", serde_json::to_string_pretty(&listing)?)?
        }
        Output::LongListing { folder, children } => {
            long_line(&mut out, folder, ".")?;
            for child in children {
                long_line(&mut out, child, &child.summary.name)?;
            }
        }
        Output::Matches(hits) => {
            for hit in hits {
                let slash = if hit.node.is_folder() { "/" } else { "" };
                writeln!(out, "{}{slash}", hit.path)?;
            }
        }
        Output::Removed(count) => writeln!(out, "removed {count}")?,
        Output::Stat(stat) if json => writeln!(out, "{}", serde_json::to_string_pretty(stat)?)?,
        Output::Stat(stat) => {
            writeln!(out, "id:      {}", stat.summary.id)?;
            writeln!(out, "name:    {}", stat.summary.name)?;
            writeln!(out, "kind:    {}", stat.summary.kind.as_str())?;
            if let Some(parent) = stat.parent_id {
                writeln!(out, "parent:  {parent}")?;
            }
            writeln!(out, "size:    {}", stat.size)?;
            writeln!(out, "created: {}", stat.created_at)?;
            writeln!(out, "updated: {}", stat.updated_at)?;
        }
        Output::Report(violations) if json => {
            writeln!(out, "{}", serde_json::to_string_pretty(violations)?)?
        }
        Output::Report(violations) if violations.is_empty() => writeln!(out, "ok")?,
        Output::Report(violations) => {
            for violation in violations {
                writeln!(out, "{violation}")?;
            }
        }
        Output::Done => {}
    }
    Ok(())
}

fn long_line(out: &mut impl Write, stat: &NodeStat, name: &str) -> Result<()> {
    let slash = if stat.summary.is_folder() && name != "." { "/" } else { "" };
    writeln!(
        out,
        "{:<6} {:>10} {:>13} {name}{slash}",
        stat.summary.kind.as_str(),
        stat.size,
        stat.updated_at
    )?;
    Ok(())
}
