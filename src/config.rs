//! Process-wide configuration.
//!
//! Layers, lowest precedence first: built-in defaults, the JSON config file,
//! the process environment (after `.env` has been loaded), then CLI flags
//! applied by the server binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::fanout;

pub const APP_DIR: &str = "browser-automation-agent";
pub const CONFIG_FILE: &str = "config.json";
pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_WORKER: &str = "browser-automation-agent-worker";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub event_capacity: usize,
    pub worker: WorkerConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            log_level: "info".to_string(),
            log_file: None,
            event_capacity: fanout::DEFAULT_CAPACITY,
            worker: WorkerConfig::default(),
        }
    }
}

/// How to launch the external worker, and the secrets it may receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub program: String,
    /// Arguments placed before the generated request flags.
    pub args: Vec<String>,
    /// Time between the stop signal and a forced kill.
    #[serde(with = "millis")]
    pub stop_grace: Duration,
    #[serde(skip_serializing)]
    pub credentials: ProviderCredentials,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_WORKER.to_string(),
            args: Vec::new(),
            stop_grace: Duration::from_secs(5),
            credentials: ProviderCredentials::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderCredentials {
    pub openai_api_key: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_session_token: Option<String>,
}

impl AgentConfig {
    /// `<config dir>/browser-automation-agent/config.json`, if the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Reads the JSON file at `path`, or the default location when `None`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => return Ok(Self::default()),
        };
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let file = std::fs::File::open(&path)?;
        let config = serde_json::from_reader(std::io::BufReader::new(file))?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlays values from `lookup`; blank values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(host) = get("HOST") {
            self.host = host;
        }
        if let Some(port) = get("PORT").and_then(|v| v.parse().ok()) {
            self.port = port;
        }
        if let Some(level) = get("LOG_LEVEL") {
            self.log_level = level.to_lowercase();
        }
        if let Some(file) = get("LOG_FILE") {
            self.log_file = Some(PathBuf::from(file));
        }
        if let Some(program) = get("BROWSER_AGENT_WORKER") {
            self.worker.program = program;
        }
        if let Some(args) = get("BROWSER_AGENT_WORKER_ARGS") {
            self.worker.args = args.split_whitespace().map(String::from).collect();
        }
        if let Some(grace) = get("BROWSER_AGENT_STOP_GRACE_MS").and_then(|v| v.parse().ok()) {
            self.worker.stop_grace = Duration::from_millis(grace);
        }

        let credentials = &mut self.worker.credentials;
        if let Some(key) = get("OPENAI_API_KEY") {
            credentials.openai_api_key = Some(key);
        }
        if let Some(key) = get("AWS_ACCESS_KEY_ID") {
            credentials.aws_access_key_id = Some(key);
        }
        if let Some(key) = get("AWS_SECRET_ACCESS_KEY") {
            credentials.aws_secret_access_key = Some(key);
        }
        if let Some(token) = get("AWS_SESSION_TOKEN") {
            credentials.aws_session_token = Some(token);
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
