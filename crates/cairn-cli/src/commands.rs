use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use cairn_bus::{handler_fn, MessageManager, TaskManager};
use cairn_codec::{Record, ToRecord};
use cairn_store::{ContentEvent, PutOutcome, Repository, RepositoryMessage};
use cairn_types::ContentHash;
use colored::Colorize;
use serde::Serialize;

use crate::cli::*;
use crate::config::NodeConfig;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let mut config = NodeConfig::load(cli.config.as_deref())?;
    if let Some(root) = cli.root.clone() {
        config.store.root = root;
    }
    let format = cli.format;
    match cli.command {
        Command::Init(_) => cmd_init(config, format),
        Command::Put(args) => cmd_put(config, args, format),
        Command::Info(args) => cmd_info(config, args, format),
        Command::Delete(args) => cmd_delete(config, args, format),
        Command::Status(_) => cmd_status(config, format, cli.verbose),
    }
}

/// A repository together with the worker pool its bus runs on.
struct Node {
    tasks: Arc<TaskManager>,
    repository: Repository,
}

impl Node {
    fn open(config: &NodeConfig) -> anyhow::Result<Self> {
        let tasks = Arc::new(TaskManager::new(&config.bus)?);
        let bus = Arc::new(MessageManager::new(Arc::clone(&tasks)));
        bus.register(handler_fn::<ContentEvent, _>("log content events", |event| {
            tracing::debug!(hash = %event.hash.short_hex(), kind = ?event.kind, "content event");
            Ok(())
        }));
        bus.register(handler_fn::<RepositoryMessage, _>("log repository messages", |message| {
            tracing::debug!(%message, "repository message");
            Ok(())
        }));
        let repository = Repository::open(&config.store, bus)
            .with_context(|| format!("opening repository at {}", config.store.root.display()))?;
        Ok(Self { tasks, repository })
    }

    fn close(self) {
        self.repository.close();
        self.tasks.stop();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_hash(hex: &str) -> anyhow::Result<ContentHash> {
    hex.parse().with_context(|| format!("invalid content hash {hex:?}"))
}

fn cmd_init(config: NodeConfig, format: OutputFormat) -> anyhow::Result<()> {
    let node = Node::open(&config)?;
    let guid = node.repository.guid();
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "guid": guid,
            "root": node.repository.root(),
        }))?,
        OutputFormat::Text => println!(
            "{} Repository {} at {}",
            "✓".green().bold(),
            guid.to_string().yellow(),
            node.repository.root().display()
        ),
    }
    node.close();
    Ok(())
}

fn cmd_put(mut config: NodeConfig, args: PutArgs, format: OutputFormat) -> anyhow::Result<()> {
    if args.no_ack {
        config.store.auto_acknowledge = false;
    }
    let file = File::open(&args.path)
        .with_context(|| format!("opening {}", args.path.display()))?;
    let name = args.name.or_else(|| file_name(&args.path));
    let mut metadata = Record::new();
    if let Some(name) = name {
        metadata.insert("name", name);
    }

    let node = Node::open(&config)?;
    let result = node.repository.ingest(file, metadata);
    let outcome = match result {
        Ok((info, outcome)) => {
            match format {
                OutputFormat::Json => print_json(&serde_json::json!({
                    "outcome": outcome,
                    "info": info.to_record(),
                }))?,
                OutputFormat::Text => {
                    let mark = match outcome {
                        PutOutcome::Stored => "✓".green().bold(),
                        PutOutcome::AlreadyPresent => "=".blue().bold(),
                        PutOutcome::Busy => "!".yellow().bold(),
                    };
                    println!(
                        "{mark} {} {} ({} bytes)",
                        info.hash.to_hex().yellow(),
                        outcome,
                        info.length
                    );
                }
            }
            Ok(outcome)
        }
        Err(e) => Err(e),
    };
    node.close();
    if outcome? == PutOutcome::Busy {
        anyhow::bail!("content is busy; retry later");
    }
    Ok(())
}

fn cmd_info(config: NodeConfig, args: InfoArgs, format: OutputFormat) -> anyhow::Result<()> {
    let hash = parse_hash(&args.hash)?;
    let node = Node::open(&config)?;
    let info = node.repository.info(&hash);
    node.close();

    let Some(info) = info? else {
        anyhow::bail!("no content stored under {}", hash.short_hex());
    };
    match format {
        OutputFormat::Json => print_json(&info.to_record())?,
        OutputFormat::Text => {
            println!("{} {}", "hash".bold(), info.hash.to_hex().yellow());
            println!("{} {}", "length".bold(), info.length);
            for (key, value) in info.metadata.iter() {
                println!("  {key}: {}", serde_json::to_string(value)?);
            }
        }
    }
    Ok(())
}

fn cmd_delete(config: NodeConfig, args: DeleteArgs, format: OutputFormat) -> anyhow::Result<()> {
    let hash = parse_hash(&args.hash)?;
    let node = Node::open(&config)?;
    let deleted = node.repository.delete(&hash);
    node.close();

    let deleted = deleted?;
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "hash": hash.to_hex(),
            "deleted": deleted,
        }))?,
        OutputFormat::Text if deleted => {
            println!("{} Deleted {}", "✓".green().bold(), hash.to_hex().yellow())
        }
        OutputFormat::Text => {}
    }
    if !deleted {
        anyhow::bail!("content {} is busy; retry later", hash.short_hex());
    }
    Ok(())
}

fn cmd_status(config: NodeConfig, format: OutputFormat, verbose: bool) -> anyhow::Result<()> {
    let node = Node::open(&config)?;
    let status = node.repository.status();
    let pending = if verbose {
        node.repository.journal().pending()
    } else {
        Ok(Vec::new())
    };
    node.close();

    let status = status?;
    match format {
        OutputFormat::Json => print_json(&status)?,
        OutputFormat::Text => {
            println!("Repository {}", status.guid.to_string().yellow());
            println!("  root:         {}", status.root.display());
            println!("  buckets:      {}", status.buckets);
            println!("  loaded pages: {}", status.loaded_pages);
            let journal = format!(
                "{} pending, {} completed, {} deleted",
                status.pending, status.completed, status.deleted
            );
            if status.pending + status.completed == 0 {
                println!("  journal:      {}", journal.green());
            } else {
                println!("  journal:      {}", journal.yellow());
            }
            for hash in pending? {
                println!("    pending {}", hash.to_hex());
            }
        }
    }
    Ok(())
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config(dir: &Path) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.store.root = dir.join("repo");
        config.bus.worker_threads = 1;
        config
    }

    #[test]
    fn put_info_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("hello.txt");
        fs::write(&source, b"hello cairn").unwrap();
        let hash = ContentHash::of(b"hello cairn");

        let put = PutArgs { path: source.clone(), name: None, no_ack: false };
        cmd_put(config(dir.path()), put, OutputFormat::Text).unwrap();

        let node = Node::open(&config(dir.path())).unwrap();
        let info = node.repository.info(&hash).unwrap().unwrap();
        assert_eq!(info.length, 11);
        assert_eq!(info.metadata.str("name").unwrap(), "hello.txt");
        node.close();

        let again = PutArgs { path: source, name: None, no_ack: false };
        cmd_put(config(dir.path()), again, OutputFormat::Json).unwrap();

        let args = InfoArgs { hash: hash.to_hex() };
        cmd_info(config(dir.path()), args, OutputFormat::Json).unwrap();

        let args = DeleteArgs { hash: hash.to_hex() };
        cmd_delete(config(dir.path()), args, OutputFormat::Text).unwrap();

        let args = InfoArgs { hash: hash.to_hex() };
        assert!(cmd_info(config(dir.path()), args, OutputFormat::Text).is_err());
    }

    #[test]
    fn status_reports_unacknowledged_put() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("data.bin");
        fs::write(&source, [7u8; 64]).unwrap();

        let put = PutArgs { path: source, name: Some("seven".into()), no_ack: true };
        cmd_put(config(dir.path()), put, OutputFormat::Text).unwrap();

        let mut keep = config(dir.path());
        keep.store.auto_acknowledge = false;
        let node = Node::open(&keep).unwrap();
        let status = node.repository.status().unwrap();
        assert_eq!(status.completed, 1);
        assert_eq!(status.pending, 0);
        node.close();

        cmd_status(keep, OutputFormat::Text, true).unwrap();
    }

    #[test]
    fn bad_input_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = PutArgs { path: dir.path().join("nope"), name: None, no_ack: false };
        assert!(cmd_put(config(dir.path()), missing, OutputFormat::Text).is_err());

        let bad = InfoArgs { hash: "xyz".into() };
        assert!(cmd_info(config(dir.path()), bad, OutputFormat::Text).is_err());

        let absent = DeleteArgs { hash: ContentHash::of(b"absent").to_hex() };
        assert!(cmd_delete(config(dir.path()), absent, OutputFormat::Text).is_err());
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(config(dir.path()), OutputFormat::Text).unwrap();
        let first = Node::open(&config(dir.path())).unwrap();
        let guid = first.repository.guid();
        first.close();
        cmd_init(config(dir.path()), OutputFormat::Json).unwrap();
        let second = Node::open(&config(dir.path())).unwrap();
        assert_eq!(second.repository.guid(), guid);
        second.close();
    }
}
