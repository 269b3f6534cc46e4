use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use browser_automation_agent::config::AgentConfig;
use browser_automation_agent::logging::{self, LogFormat};
use browser_automation_agent::registry::SessionRegistry;
use browser_automation_agent::server::{self, AppState};
use clap::Parser;
use dotenvy::dotenv;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "browser-automation-agent", version, about = "Realtime browser automation server")]
struct Args {
    /// Config file (defaults to the user config directory)
    #[arg(long, env = "BROWSER_AGENT_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    log_level: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Worker executable
    #[arg(long)]
    worker: Option<String>,

    /// Extra argument placed before the per-run flags (repeatable)
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    worker_args: Vec<String>,

    #[arg(long)]
    stop_grace_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let config_path = args.config.clone().or_else(AgentConfig::default_path);
    let mut config = AgentConfig::load(config_path.as_deref())?;
    config.apply_env();
    let log_format = args.log_format;
    apply_args(&mut config, args);

    logging::init(&config.log_level, log_format, config.log_file.as_deref())?;
    info!(
        worker = %config.worker.program,
        grace_ms = config.worker.stop_grace.as_millis() as u64,
        "starting browser automation agent"
    );

    let registry = Arc::new(SessionRegistry::new(
        config.worker.clone(),
        config.event_capacity,
    ));
    let listener = server::bind(&config.host, config.port).await?;
    server::serve(listener, AppState::new(registry), shutdown_signal()).await?;

    info!("server stopped");
    Ok(())
}

fn apply_args(config: &mut AgentConfig, args: Args) {
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if let Some(file) = args.log_file {
        config.log_file = Some(file);
    }
    if let Some(worker) = args.worker {
        config.worker.program = worker;
    }
    if !args.worker_args.is_empty() {
        config.worker.args = args.worker_args;
    }
    if let Some(ms) = args.stop_grace_ms {
        config.worker.stop_grace = Duration::from_millis(ms);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
