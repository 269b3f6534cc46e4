//! Process supervisor: one external worker per session.
//!
//! Lifecycle:
//! - `start` validates, flips the session from idle to running under a lock,
//!   and hands the run to a background task
//! - the task narrates the configuration, spawns the worker and pumps stdout
//!   and stderr through a [`LineFramer`] and the decoder into the fanout
//! - `stop` sends SIGTERM to the worker's process group, escalating to SIGKILL
//!   after the grace period
//! - exactly one terminal `complete` is published per run, while the session
//!   lock is held, right before the session returns to idle

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::decoder::{self, StreamSource};
use crate::error::{AgentError, Result};
use crate::fanout::EventFanout;
use crate::framer::LineFramer;
use crate::types::{AutomationRequest, Event, LogKind, ModelProvider};

const READ_CHUNK: usize = 8192;
/// How long output may keep flowing after the worker itself has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Running,
    Stopping,
}

/// Identifies one accepted run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub id: Uuid,
    pub started_at: DateTime<Local>,
}

/// Argument vector and environment overlay for one worker launch.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerInvocation {
    /// Secrets come from `worker.credentials` and go into the environment only.
    pub fn build(worker: &WorkerConfig, request: &AutomationRequest) -> Result<Self> {
        let mut args = worker.args.clone();
        args.extend([
            "--task".to_string(),
            request.task.clone(),
            "--model-provider".to_string(),
            request.provider.as_str().to_string(),
            "--model-name".to_string(),
            request.model.clone(),
            flag(request.use_vision, "--use-vision", "--no-vision"),
            flag(request.headless, "--headless", "--no-headless"),
            "--browser-type".to_string(),
            request.browser.as_str().to_string(),
            "--timeout".to_string(),
            request.timeout.as_millis().to_string(),
        ]);

        let mut env = vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())];
        let credentials = &worker.credentials;

        match request.provider {
            ModelProvider::Ollama => {}
            ModelProvider::OpenAi => {
                let key = credentials.openai_api_key.clone().ok_or_else(|| {
                    AgentError::Configuration(
                        "OpenAI API key is required when using OpenAI as the model provider"
                            .into(),
                    )
                })?;
                env.push(("OPENAI_API_KEY".to_string(), key));
            }
            ModelProvider::Bedrock => {
                let region = request.aws_region.clone().ok_or_else(|| {
                    AgentError::Configuration(
                        "awsRegion is required when modelProvider is bedrock".into(),
                    )
                })?;
                args.push("--aws-region".to_string());
                args.push(region);
                if let Some(profile) = &request.aws_profile {
                    args.push("--aws-profile".to_string());
                    args.push(profile.clone());
                }
                for (name, value) in [
                    ("AWS_ACCESS_KEY_ID", &credentials.aws_access_key_id),
                    ("AWS_SECRET_ACCESS_KEY", &credentials.aws_secret_access_key),
                    ("AWS_SESSION_TOKEN", &credentials.aws_session_token),
                ] {
                    if let Some(value) = value {
                        env.push((name.to_string(), value.clone()));
                    }
                }
            }
        }

        Ok(Self {
            program: worker.program.clone(),
            args,
            env,
        })
    }
}

fn flag(on: bool, yes: &str, no: &str) -> String {
    let chosen = if on { yes } else { no };
    chosen.to_string()
}

/// A running worker. Owned by exactly one run task.
struct WorkerProcess {
    child: Child,
    pid: Option<u32>,
    started_at: Instant,
}

impl WorkerProcess {
    fn spawn(invocation: &WorkerInvocation) -> std::io::Result<Self> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        let pid = child.id();
        Ok(Self {
            child,
            pid,
            started_at: Instant::now(),
        })
    }

    /// SIGTERM, then SIGKILL once `grace` has passed without an exit.
    async fn terminate(&mut self, grace: Duration) -> std::io::Result<ExitStatus> {
        self.signal_group(Signal::Term);
        #[cfg(not(unix))]
        let _ = self.child.start_kill();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(pid = ?self.pid, grace_ms = grace.as_millis() as u64, "worker ignored termination, killing");
                self.signal_group(Signal::Kill);
                self.child.kill().await?;
                self.child.wait().await
            }
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: Signal) {
        let Some(pid) = self.pid else { return };
        let signal = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: kill(2) has no memory-safety preconditions; the target is
        // the process group this worker leads.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
        if rc != 0 {
            debug!(pid, signal, "signal delivery failed, group already gone");
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _signal: Signal) {}
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[derive(Debug)]
enum RunOutcome {
    Succeeded,
    Failed(String),
    SpawnFailed(String),
    Stopped,
}

impl RunOutcome {
    fn from_status(status: std::io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) if status.success() => RunOutcome::Succeeded,
            Ok(status) => match status.code() {
                Some(code) => RunOutcome::Failed(AgentError::WorkerRuntime { code }.to_string()),
                None => RunOutcome::Failed(format!("Worker terminated abnormally ({status})")),
            },
            Err(e) => RunOutcome::Failed(format!("Failed to wait for worker: {e}")),
        }
    }

    fn terminal_events(self) -> Vec<Event> {
        match self {
            RunOutcome::Succeeded => vec![Event::Complete {
                success: true,
                stopped: false,
            }],
            RunOutcome::Stopped => vec![
                Event::log(LogKind::System, "Automation stopped by user"),
                Event::Complete {
                    success: false,
                    stopped: true,
                },
            ],
            RunOutcome::Failed(message) | RunOutcome::SpawnFailed(message) => vec![
                Event::log(LogKind::Error, format!("Error: {message}")),
                Event::Error { message },
                Event::Complete {
                    success: false,
                    stopped: false,
                },
            ],
        }
    }
}

struct Inner {
    state: SessionState,
    run: Option<ActiveRun>,
    /// Set once the owning session is detached; no run may start after it.
    closed: bool,
}

struct ActiveRun {
    handle: RunHandle,
    stop_tx: Option<oneshot::Sender<()>>,
}

pub struct Supervisor {
    session_id: String,
    worker: Arc<WorkerConfig>,
    fanout: EventFanout,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SessionState>,
}

impl Supervisor {
    pub fn new(
        session_id: impl Into<String>,
        worker: Arc<WorkerConfig>,
        fanout: EventFanout,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Arc::new(Self {
            session_id: session_id.into(),
            worker,
            fanout,
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                run: None,
                closed: false,
            }),
            state_tx,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn fanout(&self) -> &EventFanout {
        &self.fanout
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() != SessionState::Idle
    }

    pub fn current_run(&self) -> Option<RunHandle> {
        self.lock().run.as_ref().map(|run| run.handle.clone())
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Accepts `request` if the session is idle. Validation and the busy check
    /// happen before anything is spawned; spawn and runtime failures are only
    /// reported through the event stream.
    pub fn start(self: &Arc<Self>, request: AutomationRequest) -> Result<RunHandle> {
        let invocation = WorkerInvocation::build(&self.worker, &request)?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = RunHandle {
            id: Uuid::new_v4(),
            started_at: Local::now(),
        };

        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(AgentError::UnknownSession(self.session_id.clone()));
            }
            if inner.state != SessionState::Idle {
                return Err(AgentError::AlreadyRunning);
            }
            inner.state = SessionState::Running;
            inner.run = Some(ActiveRun {
                handle: handle.clone(),
                stop_tx: Some(stop_tx),
            });
            self.state_tx.send_replace(SessionState::Running);
        }

        info!(
            session_id = %self.session_id,
            run_id = %handle.id,
            provider = %request.provider,
            model = %request.model,
            "starting automation"
        );

        let supervisor = Arc::clone(self);
        let run_handle = handle.clone();
        tokio::spawn(async move {
            let outcome = supervisor.drive(&request, &invocation, stop_rx).await;
            supervisor.finish(&run_handle, outcome);
        });

        Ok(handle)
    }

    /// Requests termination of the current run. Returns `false` (and does
    /// nothing) when there is no running worker or a stop is already pending.
    pub fn stop(&self) -> bool {
        let mut inner = self.lock();
        self.request_stop(&mut inner)
    }

    /// Stops any current run and refuses every later `start`. Returns whether
    /// a run was asked to stop.
    pub fn close(&self) -> bool {
        let mut inner = self.lock();
        inner.closed = true;
        self.request_stop(&mut inner)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn request_stop(&self, inner: &mut Inner) -> bool {
        if inner.state != SessionState::Running {
            return false;
        }
        inner.state = SessionState::Stopping;
        if let Some(tx) = inner.run.as_mut().and_then(|run| run.stop_tx.take()) {
            let _ = tx.send(());
        }
        self.state_tx.send_replace(SessionState::Stopping);
        info!(session_id = %self.session_id, "stop requested");
        true
    }

    /// Like [`stop`](Self::stop), but only if `handle` is still the current run.
    pub fn stop_run(&self, handle: &RunHandle) -> bool {
        let current = self.lock().run.as_ref().map(|run| run.handle.id);
        current == Some(handle.id) && self.stop()
    }

    /// Resolves once the session is idle again.
    pub async fn wait_idle(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Idle).await;
    }

    async fn drive(
        &self,
        request: &AutomationRequest,
        invocation: &WorkerInvocation,
        mut stop_rx: oneshot::Receiver<()>,
    ) -> RunOutcome {
        self.fanout.publish(Event::log(
            LogKind::System,
            format!("Starting automation with task: {}", request.task),
        ));
        self.fanout
            .publish(Event::log(LogKind::Config, request.describe()));

        if stop_rx.try_recv().is_ok() {
            return RunOutcome::Stopped;
        }

        let mut process = match WorkerProcess::spawn(invocation) {
            Ok(process) => process,
            Err(e) => {
                error!(session_id = %self.session_id, program = %invocation.program, error = %e, "worker spawn failed");
                return RunOutcome::SpawnFailed(AgentError::ProcessSpawn(e.to_string()).to_string());
            }
        };
        info!(session_id = %self.session_id, pid = ?process.pid, "worker started");

        let stopping = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = process.child.stdout.take() {
            readers.push(tokio::spawn(pump(
                stdout,
                StreamSource::Stdout,
                self.fanout.clone(),
                Arc::clone(&stopping),
            )));
        }
        if let Some(stderr) = process.child.stderr.take() {
            readers.push(tokio::spawn(pump(
                stderr,
                StreamSource::Stderr,
                self.fanout.clone(),
                Arc::clone(&stopping),
            )));
        }

        let status = tokio::select! {
            status = process.child.wait() => status,
            Ok(()) = &mut stop_rx => {
                stopping.store(true, Ordering::SeqCst);
                process.terminate(self.worker.stop_grace).await
            }
        };

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(session_id = %self.session_id, "worker output still open after exit, closing");
            process.signal_group(Signal::Kill);
            // Finished handles were already polled to completion above.
            for reader in readers.into_iter().filter(|r| !r.is_finished()) {
                reader.abort();
                let _ = reader.await;
            }
        }

        info!(
            session_id = %self.session_id,
            pid = ?process.pid,
            status = ?status.as_ref().ok(),
            elapsed_ms = process.started_at.elapsed().as_millis() as u64,
            "worker exited"
        );

        if stopping.load(Ordering::SeqCst) {
            RunOutcome::Stopped
        } else {
            RunOutcome::from_status(status)
        }
    }

    /// Publishes the terminal events and returns the session to idle. Both
    /// happen under the session lock so no new run can interleave.
    fn finish(&self, handle: &RunHandle, outcome: RunOutcome) {
        let mut inner = self.lock();
        let outcome = if inner.state == SessionState::Stopping {
            RunOutcome::Stopped
        } else {
            outcome
        };
        debug!(session_id = %self.session_id, run_id = %handle.id, ?outcome, "run finished");

        for event in outcome.terminal_events() {
            self.fanout.publish(event);
        }
        inner.state = SessionState::Idle;
        inner.run = None;
        self.state_tx.send_replace(SessionState::Idle);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn pump<R>(mut reader: R, source: StreamSource, fanout: EventFanout, stopping: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin,
{
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in framer.feed(&buf[..n]) {
                    forward(&line, source, &fanout, &stopping);
                }
            }
            Err(e) => {
                warn!(stream = source.as_str(), error = %e, "worker pipe read failed");
                break;
            }
        }
    }

    if let Some(line) = framer.flush() {
        forward(&line, source, &fanout, &stopping);
    }
}

fn forward(line: &str, source: StreamSource, fanout: &EventFanout, stopping: &AtomicBool) {
    let mut event = decoder::decode(line, source);
    // Errors caused by our own SIGTERM are not failures.
    if stopping.load(Ordering::SeqCst) {
        if let Event::Log(entry) = &mut event {
            if entry.kind == LogKind::Error {
                entry.kind = LogKind::Debug;
            }
        }
    }
    fanout.publish(event);
}
