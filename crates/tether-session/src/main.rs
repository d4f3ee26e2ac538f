#![warn(missing_docs)]
//! tether inspection tool

use std::path::PathBuf;
use tether_cache::PersistentFileCache;
use tether_session::{JsonFileStateStore, ManagerConfig, StateStore};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: tether <config-file> [status|cache|purge-cache]");
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);
    let config = ManagerConfig::from_file(&config_path)?;
    tracing::info!("loaded config from {}", config_path.display());

    match args.get(2).map(String::as_str).unwrap_or("status") {
        "status" => status(&config).await,
        "cache" => cache(&config, false).await,
        "purge-cache" => cache(&config, true).await,
        other => anyhow::bail!("unknown command: {}", other),
    }
}

async fn status(config: &ManagerConfig) -> anyhow::Result<()> {
    let Some(path) = &config.state_file else {
        anyhow::bail!("no state_file configured");
    };
    let records = JsonFileStateStore::new(path.clone()).load_all().await?;
    if records.is_empty() {
        println!("no persisted connections in {}", path.display());
        return Ok(());
    }

    for record in records {
        println!(
            "{}  {:<12}  {}  attempts={}",
            record.connection_id,
            record.status.as_str(),
            record.config.endpoint(),
            record.reconnect_attempts
        );
        if let Some(error) = record.last_error {
            println!("    last error ({}): {}", error.kind, error.message);
        }
    }
    Ok(())
}

async fn cache(config: &ManagerConfig, purge: bool) -> anyhow::Result<()> {
    let Some(cache_config) = config.persistent_cache.clone() else {
        anyhow::bail!("no persistent_cache configured");
    };
    let dir = cache_config.cache_dir.clone();
    let cache = PersistentFileCache::open(cache_config).await?;
    cache.load_from_disk().await?;

    if purge {
        let before = cache.stats();
        cache.clear().await?;
        println!(
            "removed {} entries ({} bytes) from {}",
            before.total_files,
            before.total_size,
            dir.display()
        );
        return Ok(());
    }

    let stats = cache.stats();
    println!("cache dir:   {}", dir.display());
    println!("entries:     {}", stats.total_files);
    println!("total bytes: {}", stats.total_size);
    Ok(())
}
