use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
    /// Bad or missing request fields. Never starts a process.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("An automation is already running for this session")]
    AlreadyRunning,

    #[error("Failed to start worker: {0}")]
    ProcessSpawn(String),

    #[error("Worker exited with code {code}")]
    WorkerRuntime { code: i32 },

    #[error("Channel disconnected: {0}")]
    ChannelDisconnect(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Rejections that go straight back to the submitter instead of the event stream.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AgentError::Configuration(_) | AgentError::AlreadyRunning
        )
    }
}
