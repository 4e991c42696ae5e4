mod cli;
mod config;
mod storage;

use std::{
    io::{self, Read},
    path::Path,
};

use clap::Parser;
use color_eyre::Result;
use stash_core::persistence::{Persistence, PersistenceError};
use stash_lock::CrossProcessLock;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Command, ConfigCommand};

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = match &cli.config {
        Some(path) => config::load_from_path(path)?,
        None => config::load()?,
    };

    match cli.command {
        Command::Save { content } => run_save(&config, content)?,
        Command::Load => run_load(&config)?,
        Command::Info => run_info(&config)?,
        Command::Health => run_health_check(&config)?,
        Command::Config(ConfigCommand::Init) => init_config(&config, cli.config.as_deref())?,
    }

    Ok(())
}

fn init_tracing() {
    // Logs go to stderr so `stash load` output stays clean.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn open(config: &config::Config) -> Result<(Box<dyn Persistence>, CrossProcessLock)> {
    let location = storage::resolve_location(config)?;
    let backend = storage::backend_from_config(config)?;
    let lock = storage::lock_for(config, &location);
    Ok((backend, lock))
}

fn run_save(config: &config::Config, content: Option<String>) -> Result<()> {
    let content = match content {
        Some(content) => content,
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let (backend, lock) = open(config)?;
    save_locked(&backend, &lock, &content)
}

fn run_load(config: &config::Config) -> Result<()> {
    let (backend, lock) = open(config)?;
    match load_locked(&backend, &lock)? {
        Some(content) => print!("{content}"),
        None => warn!(location = %backend.location(), "nothing saved yet"),
    }
    Ok(())
}

fn run_info(config: &config::Config) -> Result<()> {
    let (backend, lock) = open(config)?;
    println!("backend:   {:?}", config.backend);
    println!("location:  {}", backend.location());
    println!("encrypted: {}", backend.is_encrypted());
    println!("lock:      {}", lock.path().display());
    match backend.time_last_modified() {
        Ok(when) => println!("modified:  {}", when.to_rfc3339()),
        Err(err) if err.is_not_found() => println!("modified:  never"),
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

/// Takes the lock and reads the cache without modifying it.
fn run_health_check(config: &config::Config) -> Result<()> {
    let (backend, lock) = open(config)?;
    run_store_health(&backend, &lock)?;
    println!("Storage: ok");
    Ok(())
}

fn run_store_health<P: Persistence>(store: &P, lock: &CrossProcessLock) -> Result<()> {
    load_locked(store, lock)?;
    Ok(())
}

fn save_locked<P: Persistence>(store: &P, lock: &CrossProcessLock, content: &str) -> Result<()> {
    lock.with_lock(|| store.save(content))??;
    Ok(())
}

/// `None` when nothing has been saved yet.
fn load_locked<P: Persistence>(store: &P, lock: &CrossProcessLock) -> Result<Option<String>> {
    match lock.with_lock(|| store.load())? {
        Ok(content) => Ok(Some(content)),
        Err(PersistenceError::NotFound { .. }) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn init_config(config: &config::Config, path: Option<&Path>) -> Result<()> {
    let path = config::write_default_if_missing(config, path)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}
