//! authzd
//!
//! Authorization decision service over newline-delimited JSON. Each stdin
//! line is a decision request; each stdout line is the matching response.
//! Control lines: `reload` publishes a cache invalidation, `shutdown` stops
//! the service. EOF also stops it.

use anyhow::{Context, Result};
use authzd::shutdown::ShutdownCallback;
use authzd::store::{PolicyMap, SecretMap};
use authzd::{
    Authorizer, ChannelShutdownManager, Config, DecisionRequest, DecisionResponse,
    GracefulShutdown, KvClient, MemoryKv, MemoryKvFactory,
};
use clap::Parser;
use serde::Deserialize;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "authzd")]
#[command(about = "Authorization decision service reading JSON requests from stdin")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// JSON file with `policies` and `secrets` to seed the store with
    #[arg(short = 's', long)]
    seed: Option<PathBuf>,

    /// Log filter, overriding the config file (RUST_LOG overrides both)
    #[arg(short = 'l', long)]
    log_level: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Seed {
    policies: PolicyMap,
    secrets: SecretMap,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn seed_store(kv: &MemoryKv, config: &Config, path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    let seed: Seed = serde_json::from_str(&text).context("invalid seed file")?;

    kv.set(
        &config.store.policies_key,
        &serde_json::to_vec(&seed.policies)?,
        Duration::ZERO,
    )?;
    kv.set(
        &config.store.secrets_key,
        &serde_json::to_vec(&seed.secrets)?,
        Duration::ZERO,
    )?;

    info!(
        subjects = seed.policies.len(),
        secrets = seed.secrets.len(),
        "Seeded store"
    );
    Ok(())
}

fn respond(out: &mut impl Write, response: &DecisionResponse) -> Result<()> {
    writeln!(out, "{}", response.to_json())?;
    out.flush()?;
    Ok(())
}

fn stop_authorizer(authorizer: Arc<Authorizer>) -> impl ShutdownCallback {
    move |manager: &str| -> authzd::Result<()> {
        info!(manager, "Stopping authorizer");
        authorizer.shutdown();
        Ok(())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let directive = args.log_level.as_deref().unwrap_or(&config.log.level);
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)),
        )
        .init();

    info!("Starting authzd");

    let kv = MemoryKv::new();
    if let Some(seed) = args.seed.as_deref() {
        seed_store(&kv, &config, seed)?;
    }

    let authorizer = Arc::new(
        Authorizer::builder()
            .config(config)
            .client_factory(Arc::new(MemoryKvFactory::new(kv.clone())))
            .build()
            .context("failed to build authorizer")?,
    );
    authorizer.start()?;
    if let Err(e) = authorizer.listen_for_invalidations() {
        warn!(error = %e, "Invalidation listener not started");
    }

    let shutdown = GracefulShutdown::new();
    let (manager, trigger) = ChannelShutdownManager::new("stdin");
    shutdown.add_manager(manager.clone());
    shutdown.add_callback(stop_authorizer(Arc::clone(&authorizer)));
    shutdown.start()?;

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();
    let mut reason = "eof";

    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;
        let line = line.trim();
        match line {
            "" => continue,
            "reload" => {
                if let Err(e) = authorizer.publish_invalidation() {
                    warn!(error = %e, "Failed to publish invalidation");
                }
            }
            "shutdown" => {
                reason = "shutdown command";
                break;
            }
            _ => {
                let response = match serde_json::from_str::<DecisionRequest>(line) {
                    Ok(request) => authorizer.authorize(&request),
                    Err(e) => DecisionResponse::error("invalid request", e.to_string()),
                };
                respond(&mut stdout, &response)?;
            }
        }
    }

    trigger.fire(reason);
    manager.wait();

    let stats = authorizer.audit().stats();
    info!(
        accepted = stats.accepted,
        flushed = stats.flushed,
        failed = stats.failed,
        dropped = stats.dropped,
        "authzd stopped"
    );
    Ok(())
}
