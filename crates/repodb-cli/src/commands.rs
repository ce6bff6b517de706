use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::{bail, Context};
use colored::Colorize;
use repodb_cache::DocumentStore;
use repodb_engine::StoreConfig;
use serde_json::Value;
use tracing::debug;

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref(), |name| std::env::var(name).ok())?;
    debug!(?config, "configuration loaded");
    let store = DocumentStore::connect(config).context("opening document store")?;
    store.initialize().await.context("loading records")?;

    let format = cli.format;
    match cli.command {
        Command::Collections => cmd_collections(&store, format),
        Command::Get(args) => cmd_get(&store, args),
        Command::Set(args) => cmd_set(&store, args).await,
        Command::Delete(args) => cmd_delete(&store, args).await,
        Command::Dump(args) => cmd_dump(&store, args),
        Command::Index(args) => cmd_index(&store, args, format).await,
        Command::Metadata => cmd_metadata(&store).await,
        Command::Migrate(args) => cmd_migrate(&store, args, format).await,
    }
}

/// Defaults, then the optional TOML file, then the environment.
fn load_config(path: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<StoreConfig> {
    let mut config = match path {
        Some(path) => StoreConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => StoreConfig::default(),
    };
    config.apply_env_from(env)?;
    Ok(config)
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_collections(store: &DocumentStore, format: OutputFormat) -> anyhow::Result<()> {
    let mut counts = serde_json::Map::new();
    for name in store.collection_names() {
        let cache = store.collection(&name, None)?;
        match format {
            OutputFormat::Json => {
                counts.insert(name, cache.len().into());
            }
            OutputFormat::Text => {
                let grouping = match &cache.options().group_by {
                    Some(field) => format!("grouped by {field}").dimmed().to_string(),
                    None => String::new(),
                };
                println!("{:<28} {:>6} records  {}", name.bold(), cache.len(), grouping);
            }
        }
    }
    if format == OutputFormat::Json {
        print_json(&Value::Object(counts))?;
    } else if store.collection_names().is_empty() {
        println!("No collections.");
    }
    Ok(())
}

fn cmd_get(store: &DocumentStore, args: RecordArgs) -> anyhow::Result<()> {
    let cache = store.collection(&args.collection, None)?;
    match cache.get(&args.key) {
        Some(doc) => print_json(&doc),
        None => bail!("{}/{} not found", args.collection, args.key),
    }
}

async fn cmd_set(store: &DocumentStore, args: SetArgs) -> anyhow::Result<()> {
    let value: Value = serde_json::from_str(&args.json).context("record body is not valid JSON")?;
    let cache = store.collection(&args.collection, None)?;
    cache.set(&args.key, value, false)?;
    cache.persist(&args.key).await?;
    println!("{} Saved {}/{}", "✓".green().bold(), args.collection, args.key.yellow());
    Ok(())
}

async fn cmd_delete(store: &DocumentStore, args: RecordArgs) -> anyhow::Result<()> {
    let cache = store.collection(&args.collection, None)?;
    if !cache.delete_now(&args.key).await? {
        bail!("{}/{} not found", args.collection, args.key);
    }
    println!("{} Deleted {}/{}", "✓".green().bold(), args.collection, args.key.yellow());
    Ok(())
}

fn cmd_dump(store: &DocumentStore, args: CollectionArgs) -> anyhow::Result<()> {
    let cache = store.collection(&args.collection, None)?;
    print_json(&Value::Object(cache.to_object()))
}

async fn cmd_index(store: &DocumentStore, args: IndexArgs, format: OutputFormat) -> anyhow::Result<()> {
    let engine = store.engine();
    if args.rebuild {
        engine.rebuild_index(&args.collection).await?;
    }
    let Some(index) = engine.load_index(&args.collection).await? else {
        println!("No index for {} (try --rebuild).", args.collection.bold());
        return Ok(());
    };
    match format {
        OutputFormat::Json => print_json(&serde_json::to_value(&index)?)?,
        OutputFormat::Text => {
            println!(
                "{}: {} records, updated {}",
                index.name.bold(),
                index.count,
                index.last_updated.dimmed()
            );
            for entry in &index.files {
                println!("  {:<36} {}", entry.id.yellow(), entry.path);
            }
        }
    }
    Ok(())
}

async fn cmd_metadata(store: &DocumentStore) -> anyhow::Result<()> {
    let metadata = store.create_database_metadata().await?;
    print_json(&metadata)
}

async fn cmd_migrate(store: &DocumentStore, args: MigrateArgs, format: OutputFormat) -> anyhow::Result<()> {
    if !args.yes {
        let prompt = format!(
            "Rewrite legacy records of {}/{} into collection directories{}? [y/N] ",
            store.config().owner,
            store.config().repo,
            if args.no_backup { " without a backup" } else { "" }
        );
        if !confirm(&prompt, io::stdin().lock())? {
            println!("Aborted.");
            return Ok(());
        }
    }

    let report = store.migrate_to_structured_storage(!args.no_backup).await?;
    match format {
        OutputFormat::Json => print_json(&serde_json::to_value(&report)?)?,
        OutputFormat::Text => {
            println!("{} Migration complete", "✓".green().bold());
            println!("  Migrated: {}", report.migrated.to_string().green());
            println!("  Skipped:  {}", report.skipped);
            if report.failed > 0 {
                println!("  Failed:   {}", report.failed.to_string().red());
            }
            if let Some(path) = &report.backup_path {
                println!("  Backup:   {}", path.cyan());
            }
        }
    }
    Ok(())
}

fn confirm(prompt: &str, mut input: impl BufRead) -> io::Result<bool> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(is_affirmative(&answer))
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use repodb_remote::InMemoryRemote;

    #[test]
    fn affirmative_answers() {
        assert!(is_affirmative("y\n"));
        assert!(is_affirmative(" YES "));
        assert!(!is_affirmative("\n"));
        assert!(!is_affirmative("nope"));
    }

    #[test]
    fn confirm_reads_one_line() {
        assert!(confirm("? ", "yes\nno\n".as_bytes()).unwrap());
        assert!(!confirm("? ", "".as_bytes()).unwrap());
    }

    #[test]
    fn config_file_then_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repodb.toml");
        std::fs::write(&path, "owner = \"acme\"\nrepo = \"db\"\nbranch = \"data\"\n").unwrap();

        let env = HashMap::from([("GITHUB_BRANCH", "prod"), ("GITHUB_TOKEN", "t0k")]);
        let config = load_config(Some(&path), |name| env.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(config.owner, "acme");
        assert_eq!(config.repo, "db");
        assert_eq!(config.branch, "prod");
        assert_eq!(config.token, "t0k");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(load_config(Some(&path), |_| None).is_err());
    }

    #[test]
    fn no_file_means_defaults() {
        let config = load_config(None, |_| None).unwrap();
        assert_eq!(config, StoreConfig::default());
    }

    #[tokio::test]
    async fn delete_is_written_even_without_auto_save() {
        let remote = Arc::new(InMemoryRemote::new());
        remote
            .write_external("main", "data/tasks/a.json", br#"{"v":1}"#)
            .unwrap();
        let config = StoreConfig {
            auto_save: false,
            ..StoreConfig::default()
        };
        let store = DocumentStore::new(config, remote.clone()).unwrap();
        store.initialize().await.unwrap();

        let args = RecordArgs {
            collection: "tasks".into(),
            key: "a".into(),
        };
        cmd_delete(&store, args).await.unwrap();
        assert_eq!(remote.json("main", "data/tasks/a.json").unwrap()["__deleted"], true);

        let missing = RecordArgs {
            collection: "tasks".into(),
            key: "a".into(),
        };
        assert!(cmd_delete(&store, missing).await.is_err());
    }
}
