//! Embedding host: boots the runtime from a TOML config file, registers
//! the built-in service types, wires SIGINT to a graceful stop and runs
//! until every worker has exited.

mod services;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use runtime::{NewService, RuntimeConfig, Server};

#[derive(Debug, Parser)]
#[command(name = "hive", about = "Multi-worker actor runtime host")]
struct Args {
    /// Path to the host config file.
    #[arg(short, long, default_value = "hive.toml")]
    config: PathBuf,

    /// Override the configured worker count.
    #[arg(short, long)]
    workers: Option<u32>,
}

/// Host config: the runtime section plus the services to boot.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HostConfig {
    #[serde(flatten)]
    runtime: RuntimeConfig,
    service: Vec<BootService>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct BootService {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    config: String,
    unique: bool,
    /// 1-based worker hint; 0 means round-robin placement.
    worker: u32,
}

impl Default for BootService {
    fn default() -> Self {
        Self {
            kind: String::new(),
            name: String::new(),
            config: String::new(),
            unique: false,
            worker: 0,
        }
    }
}

fn load_config(args: &Args) -> Result<HostConfig> {
    let mut config = if args.config.exists() {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("read {}", args.config.display()))?;
        toml::from_str(&text).with_context(|| format!("parse {}", args.config.display()))?
    } else {
        warn!(path = %args.config.display(), "config file not found, using defaults");
        HostConfig::default()
    };
    if let Some(workers) = args.workers {
        config.runtime.workers = workers;
    }
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let server = Arc::new(Server::init(config.runtime).context("runtime init")?);
    server.router().register_factory("echo", || Box::new(services::Echo));
    server
        .router()
        .register_factory("heartbeat", || Box::new(services::Heartbeat::new()));

    {
        let server = server.clone();
        ctrlc::set_handler(move || {
            warn!("interrupt received, shutting down");
            server.stop(1);
        })
        .context("install signal handler")?;
    }

    for boot in &config.service {
        info!(kind = %boot.kind, name = %boot.name, "booting service");
        server.router().new_service(
            NewService::new(&boot.kind)
                .name(&boot.name)
                .config(&boot.config)
                .unique(boot.unique),
            boot.worker,
            0,
            0,
        );
    }
    if config.service.is_empty() {
        // Nothing configured: keep the process observable anyway.
        server
            .router()
            .new_service(NewService::new("heartbeat"), 0, 0, 0);
    }

    let code = server.run();
    info!(code, "runtime exited");
    // An abort (negative signal code) must not read as a clean exit.
    std::process::exit(if code < 0 { 1 } else { code.min(255) });
}
