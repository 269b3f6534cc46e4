use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Default worker timeout handed to the worker, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// LLM backend the worker should drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    #[default]
    Ollama,
    OpenAi,
    Bedrock,
}

impl ModelProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelProvider::Ollama => "ollama",
            ModelProvider::OpenAi => "openai",
            ModelProvider::Bedrock => "bedrock",
        }
    }

    /// Model used when the request leaves `model` empty.
    pub fn default_model(self) -> &'static str {
        match self {
            ModelProvider::Ollama => "deepseek-r1:8b",
            ModelProvider::OpenAi => "gpt-4o",
            ModelProvider::Bedrock => "anthropic.claude-3-sonnet-20240229-v1:0",
        }
    }
}

impl fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserType {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserType {
    pub fn as_str(self) -> &'static str {
        match self {
            BrowserType::Chromium => "chromium",
            BrowserType::Firefox => "firefox",
            BrowserType::Webkit => "webkit",
        }
    }
}

/// Options block of a `submit` frame, exactly as the client sends it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubmitOptions {
    pub model_provider: ModelProvider,
    pub model: Option<String>,
    pub use_vision: bool,
    pub headless: bool,
    pub browser_type: BrowserType,
    pub timeout: u64,
    pub aws_region: Option<String>,
    pub aws_profile: Option<String>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            model_provider: ModelProvider::default(),
            model: None,
            use_vision: true,
            headless: true,
            browser_type: BrowserType::default(),
            timeout: DEFAULT_TIMEOUT_MS,
            aws_region: None,
            aws_profile: None,
        }
    }
}

/// Payload of the `submit` wire event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitPayload {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub options: SubmitOptions,
}

/// A validated automation request. Built only through [`AutomationRequest::from_submit`].
#[derive(Debug, Clone, PartialEq)]
pub struct AutomationRequest {
    pub task: String,
    pub provider: ModelProvider,
    pub model: String,
    pub use_vision: bool,
    pub headless: bool,
    pub browser: BrowserType,
    pub timeout: Duration,
    pub aws_region: Option<String>,
    pub aws_profile: Option<String>,
}

impl AutomationRequest {
    /// Validates a client payload. Blank optional strings count as absent.
    pub fn from_submit(payload: SubmitPayload) -> Result<Self> {
        let task = payload.prompt.trim().to_string();
        if task.is_empty() {
            return Err(AgentError::Configuration("task must not be empty".into()));
        }

        let options = payload.options;
        let provider = options.model_provider;
        let aws_region = non_blank(options.aws_region);
        if provider == ModelProvider::Bedrock && aws_region.is_none() {
            return Err(AgentError::Configuration(
                "awsRegion is required when modelProvider is bedrock".into(),
            ));
        }

        let model =
            non_blank(options.model).unwrap_or_else(|| provider.default_model().to_string());

        Ok(Self {
            task,
            provider,
            model,
            use_vision: options.use_vision,
            headless: options.headless,
            browser: options.browser_type,
            timeout: Duration::from_millis(options.timeout),
            aws_region,
            aws_profile: non_blank(options.aws_profile),
        })
    }

    /// One-line summary sent to the client before the worker starts.
    pub fn describe(&self) -> String {
        format!(
            "Configuration: Model Provider: {}, Model: {}, Vision: {}",
            self.provider,
            self.model,
            if self.use_vision { "Enabled" } else { "Disabled" }
        )
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Category of a log line as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    System,
    Error,
    Result,
    Urls,
    Debug,
    Config,
}

impl LogKind {
    /// Maps the worker's declared `type` field. Unknown types read as `system`.
    pub fn from_worker_type(kind: &str) -> Self {
        match kind {
            "error" => LogKind::Error,
            "result" => LogKind::Result,
            "urls" => LogKind::Urls,
            "debug" => LogKind::Debug,
            "config" => LogKind::Config,
            _ => LogKind::System,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub text: String,
    pub kind: LogKind,
    pub timestamp: String,
}

impl LogEntry {
    pub fn new(kind: LogKind, text: impl Into<String>) -> Self {
        Self {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            text: text.into(),
            kind,
            timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
        }
    }
}

/// Everything the core pushes to a client. Serializes to the wire envelope
/// `{"event": <name>, "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum Event {
    Log(LogEntry),
    Screenshot {
        data: String,
    },
    Complete {
        success: bool,
        #[serde(default, skip_serializing_if = "is_false")]
        stopped: bool,
    },
    Error {
        message: String,
    },
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Event {
    pub fn log(kind: LogKind, text: impl Into<String>) -> Self {
        Event::Log(LogEntry::new(kind, text))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::Log(_) => "log",
            Event::Screenshot { .. } => "screenshot",
            Event::Complete { .. } => "complete",
            Event::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Complete { .. })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({
                "event": "error",
                "data": { "message": format!("failed to encode event: {e}") }
            })
            .to_string()
        })
    }
}

/// Raw frame as read off the channel, before the event name is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl WireMessage {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Connected client as reported by `/api/clients`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub connected_at: String,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub status: String,
    pub version: String,
    pub uptime: f64,
    pub active_clients: usize,
    pub active_automations: usize,
}
