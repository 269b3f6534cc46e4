//! Browser automation agent server.
//!
//! Clients submit natural-language tasks over a websocket channel; each
//! task runs in a supervised worker process whose output is decoded into
//! structured events and streamed back to the submitting client.

pub mod client;
pub mod config;
pub mod decoder;
pub mod error;
pub mod fanout;
pub mod framer;
pub mod logging;
pub mod registry;
pub mod server;
pub mod supervisor;
pub mod types;

pub use client::{BackoffPolicy, ChannelClient, ClientConfig, ConnectionState};
pub use config::{AgentConfig, WorkerConfig};
pub use error::{AgentError, Result};
pub use registry::SessionRegistry;
pub use supervisor::{RunHandle, SessionState, Supervisor};
pub use types::{AutomationRequest, Event, LogEntry, LogKind, ModelProvider, SubmitOptions};
