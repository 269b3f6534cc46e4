use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use browser_automation_agent::client::{
    BackoffPolicy, ChannelClient, ClientConfig, ConnectionState, DISCONNECT_EVENT,
};
use browser_automation_agent::logging::{self, LogFormat};
use browser_automation_agent::types::{Event, LogEntry, LogKind};
use clap::Parser;
use dotenvy::dotenv;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "agent", version, about = "Submit a browser automation task and stream its progress")]
struct Args {
    #[arg(long, env = "BROWSER_AGENT_URL", default_value = "http://127.0.0.1:3001")]
    url: String,

    /// What the agent should do
    #[arg(long, short)]
    prompt: String,

    /// ollama, openai or bedrock
    #[arg(long)]
    provider: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    no_vision: bool,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// chromium, firefox or webkit
    #[arg(long)]
    browser: Option<String>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long)]
    aws_region: Option<String>,

    #[arg(long)]
    aws_profile: Option<String>,

    /// Connection attempts before giving up
    #[arg(long, default_value_t = 5)]
    retries: u32,

    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

#[derive(Debug)]
enum Outcome {
    Complete { success: bool, stopped: bool },
    Rejected(String),
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv().ok();
    let args = Args::parse();
    logging::init(&args.log_level, LogFormat::Text, None)?;

    let mut config = ClientConfig::new(&args.url);
    config.backoff = BackoffPolicy {
        max_retries: args.retries,
        ..BackoffPolicy::default()
    };
    let client = ChannelClient::connect(config);
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let started = Arc::new(AtomicBool::new(false));
    register_listeners(&client, outcome_tx, Arc::clone(&started));

    client.wait_connected(Duration::from_secs(120)).await?;
    if !client.emit("submit", submit_payload(&args)) {
        bail!("connection dropped before the task was sent");
    }

    let mut states = client.watch_state();
    let mut stop_sent = false;
    let code = loop {
        tokio::select! {
            outcome = outcome_rx.recv() => match outcome {
                Some(Outcome::Complete { success, stopped }) => {
                    if stopped {
                        eprintln!("Automation stopped.");
                    } else if success {
                        println!("Automation completed.");
                    } else {
                        eprintln!("Automation failed.");
                    }
                    break if success { ExitCode::SUCCESS } else { ExitCode::FAILURE };
                }
                Some(Outcome::Rejected(message)) => {
                    eprintln!("Rejected: {message}");
                    break ExitCode::FAILURE;
                }
                None => break ExitCode::FAILURE,
            },
            _ = tokio::signal::ctrl_c() => {
                if stop_sent {
                    break ExitCode::FAILURE;
                }
                stop_sent = true;
                eprintln!("Stopping... (press Ctrl-C again to quit)");
                if !client.emit("stop", json!({})) {
                    break ExitCode::FAILURE;
                }
            }
            changed = states.changed() => {
                // The server cancels a session's run when its connection drops.
                let state = *states.borrow();
                if changed.is_err()
                    || matches!(state, ConnectionState::Disconnected | ConnectionState::GaveUp)
                {
                    eprintln!("Lost connection to {}", args.url);
                    break ExitCode::FAILURE;
                }
            }
        }
    };

    client.close();
    Ok(code)
}

fn submit_payload(args: &Args) -> Value {
    let mut options = Map::new();
    let mut set = |key: &str, value: Option<Value>| {
        if let Some(value) = value {
            options.insert(key.to_string(), value);
        }
    };
    set("modelProvider", args.provider.clone().map(Value::from));
    set("model", args.model.clone().map(Value::from));
    set("useVision", Some(Value::from(!args.no_vision)));
    set("headless", Some(Value::from(!args.headed)));
    set("browserType", args.browser.clone().map(Value::from));
    set("timeout", args.timeout_ms.map(Value::from));
    set("awsRegion", args.aws_region.clone().map(Value::from));
    set("awsProfile", args.aws_profile.clone().map(Value::from));

    json!({ "prompt": args.prompt, "options": options })
}

fn register_listeners(
    client: &ChannelClient,
    outcome: mpsc::UnboundedSender<Outcome>,
    started: Arc<AtomicBool>,
) {
    let log_started = Arc::clone(&started);
    client.on("log", move |data| {
        log_started.store(true, Ordering::SeqCst);
        if let Ok(entry) = serde_json::from_value::<LogEntry>(data.clone()) {
            print_log(&entry);
        }
    });

    client.on("screenshot", |data| {
        let size = data.get("data").and_then(Value::as_str).map_or(0, str::len);
        println!("[screenshot] {size} bytes (base64)");
    });

    let error_outcome = outcome.clone();
    client.on("error", move |data| {
        let message = data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        // Errors before any log are rejections; no completion will follow.
        if !started.load(Ordering::SeqCst) {
            let _ = error_outcome.send(Outcome::Rejected(message));
        }
    });

    client.on("complete", move |data| {
        if let Ok(Event::Complete { success, stopped }) =
            serde_json::from_value::<Event>(json!({ "event": "complete", "data": data }))
        {
            let _ = outcome.send(Outcome::Complete { success, stopped });
        }
    });

    client.on(DISCONNECT_EVENT, |reason| {
        eprintln!("[channel] disconnected: {}", reason.as_str().unwrap_or("unknown"));
    });
}

fn print_log(entry: &LogEntry) {
    match entry.kind {
        LogKind::Error => eprintln!("[{}] ERROR {}", entry.timestamp, entry.text),
        LogKind::Debug => {}
        kind => println!("[{}] {:<6} {}", entry.timestamp, format!("{kind:?}").to_uppercase(), entry.text),
    }
}
