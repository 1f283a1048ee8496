//! Log agent launcher.
//!
//! Usage:
//!     logagent --config /etc/logagent/logagent.toml run
//!     logagent --config /etc/logagent/logagent.toml check

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use logagent::net::resolve_node_ip;
use logagent::AgentConfig;
use logagent_logging::{init_logging, LogConfig};
use logagent_protocol::defaults::DEFAULT_CONFIG_FILE;
use logagent_protocol::normalize_snapshot;
use logagent_protocol::paths::logagent_home;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "logagent", about = "Ships log file lines to a message bus")]
struct Cli {
    /// Config file (default: ~/.logagent/logagent.toml)
    #[arg(short, long, global = true, env = "LOGAGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Debug output on stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Log file directory (default: ~/.logagent/logs)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent until Ctrl-C
    Run,
    /// Validate the config and print what would be collected
    Check {
        /// Print the resolved entries as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LogConfig {
        app_name: "logagent",
        verbose: cli.verbose,
        log_dir: cli.log_dir.clone(),
    }) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::from(2);
    }

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn run_command(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_agent(config),
        Commands::Check { json } => check(config, json),
    }
}

/// An explicit path must exist; the default one may be missing.
fn load_config(path: Option<&PathBuf>) -> Result<AgentConfig> {
    match path {
        Some(path) => {
            let config = AgentConfig::load(path)?;
            info!(path = %path.display(), "Loaded config");
            Ok(config)
        }
        None => {
            let path = logagent_home().join(DEFAULT_CONFIG_FILE);
            if path.exists() {
                let config = AgentConfig::load(&path)?;
                info!(path = %path.display(), "Loaded config");
                Ok(config)
            } else {
                warn!(path = %path.display(), "No config file, using defaults");
                Ok(AgentConfig::default())
            }
        }
    }
}

fn run_agent(config: AgentConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("logagent-rt")
        .build()
        .context("Failed to build tokio runtime")?;

    let report = runtime.block_on(logagent::run(config, async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, initiating shutdown..."),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
        }
    }))?;

    if let Some(shutdown) = report.shutdown {
        info!(
            cancelled = shutdown.cancelled,
            joined = shutdown.joined,
            panicked = shutdown.panicked,
            "Tasks stopped"
        );
    }
    if let Some(forwarded) = report.forwarded {
        info!(
            written = forwarded.written,
            write_errors = forwarded.write_errors,
            "Bus drained"
        );
    }
    Ok(())
}

fn check(config: AgentConfig, json: bool) -> Result<()> {
    config.validate()?;
    let ip = resolve_node_ip(config.node.ip);
    let key = config.collect_key(ip);
    let normalized = normalize_snapshot(config.collect.clone());

    if json {
        println!("{}", serde_json::to_string_pretty(&normalized.entries)?);
        return Ok(());
    }

    println!("node ip:      {}", ip);
    println!("bus:          {}", config.bus.uri);
    match &config.remote {
        Some(remote) => println!(
            "remote:       {:?} {} (key {}, every {}s)",
            remote.kind, remote.location, key, remote.interval_secs
        ),
        None => println!("remote:       none (key would be {})", key),
    }
    println!("local entries ({}):", normalized.entries.len());
    for entry in &normalized.entries {
        println!("  {} -> {}", entry.path, entry.topic);
    }
    for path in &normalized.duplicate_paths {
        println!("  duplicate path, last entry wins: {}", path);
    }
    Ok(())
}
