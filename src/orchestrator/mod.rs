//! Stream orchestrator
//!
//! Keeps a session-keyed arena of worker handles. Each admitted turn gets
//! its own worker task (see `worker`); callers only ever talk to a worker
//! through its control channel, so cancellation and permission decisions
//! are linearized with the agent's output instead of racing it.

mod handshake;
mod state;
mod worker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::agent::cli::CommandOptions;
use crate::agent::permissions::{resolve_permissions, PermissionPolicy, StandingRules};
use crate::agent::process::AgentLauncher;
use crate::error::{OrchestratorError, PermissionError};
use crate::protocol::{PermissionDecision, PermissionMode, PermissionRequest, StartRequest, StreamEvent};
use crate::store::SessionStore;

pub use handshake::Handshake;
pub use state::{SessionStreamState, StreamStatus};
use worker::{Control, TurnSpec, Worker};

const MAX_SESSION_ID_LEN: usize = 128;

/// Server-side defaults applied to every turn
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Agent executable
    pub program: String,
    /// Fail a turn after this long without valid agent output
    pub stall_timeout: Duration,
    /// Cap on a turn's running time, not counting permission waits
    pub max_turn_duration: Option<Duration>,
    /// How long a finished agent gets to exit before being killed
    pub shutdown_grace: Duration,
    /// Permission mode when the request names none
    pub default_permission_mode: PermissionMode,
    /// Pre-approved tool patterns
    pub allowed_tools: Vec<String>,
    /// Refused tool patterns
    pub disallowed_tools: Vec<String>,
    /// Turn cap when the request names none
    pub max_turns: Option<u32>,
    /// Budget cap when the request names none
    pub max_budget_usd: Option<f64>,
    /// Directory agents run in
    pub working_dir: Option<PathBuf>,
    /// Events buffered per turn before the worker waits on the subscriber
    pub channel_capacity: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            stall_timeout: Duration::from_secs(30),
            max_turn_duration: None,
            shutdown_grace: Duration::from_secs(2),
            default_permission_mode: PermissionMode::Default,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            max_turns: None,
            max_budget_usd: None,
            working_dir: None,
            channel_capacity: 64,
        }
    }
}

/// The outstanding permission request of a session
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPermission {
    /// The request
    pub request: PermissionRequest,
    /// How long it has been waiting
    pub awaiting: Duration,
}

struct WorkerHandle {
    turn_id: u64,
    control: mpsc::UnboundedSender<Control>,
    state: watch::Receiver<SessionStreamState>,
}

struct Inner {
    launcher: Arc<dyn AgentLauncher>,
    store: Arc<dyn SessionStore>,
    settings: OrchestratorSettings,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    rules: Mutex<HashMap<String, Arc<Mutex<StandingRules>>>>,
    next_turn: std::sync::atomic::AtomicU64,
}

impl Inner {
    fn workers(&self) -> MutexGuard<'_, HashMap<String, WorkerHandle>> {
        self.workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn release(&self, session_id: &str, turn_id: u64) {
        let mut workers = self.workers();
        if !workers.get(session_id).is_some_and(|h| h.turn_id == turn_id) {
            return;
        }
        workers.remove(session_id);
        debug!(session_id = %session_id, turn_id, "released session");

        // keep only sessions that actually recorded a standing rule;
        // the workers lock is still held so no new turn can pick up the set
        let mut rules = self.rules();
        if rules.get(session_id).is_some_and(|set| {
            set.lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .is_empty()
        }) {
            rules.remove(session_id);
        }
    }

    fn rules(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<StandingRules>>>> {
        self.rules
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Owns every live turn
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator
    #[must_use]
    pub fn new(
        launcher: Arc<dyn AgentLauncher>,
        store: Arc<dyn SessionStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                launcher,
                store,
                settings,
                workers: Mutex::new(HashMap::new()),
                rules: Mutex::new(HashMap::new()),
                next_turn: std::sync::atomic::AtomicU64::new(1),
            }),
        }
    }

    /// Admit a turn and start streaming it.
    ///
    /// Rejects with `Validation` before creating any state, and with
    /// `SessionBusy` while the session still has a live turn.
    pub async fn start(
        &self,
        session_id: &str,
        request: StartRequest,
    ) -> Result<TurnStream, OrchestratorError> {
        validate(session_id, &request)?;
        let settings = &self.inner.settings;

        let allowed = resolve_permissions(&settings.allowed_tools, &request.options.allowed_tools);
        let disallowed =
            resolve_permissions(&settings.disallowed_tools, &request.options.disallowed_tools);
        let mode = request
            .options
            .permission_mode
            .unwrap_or(settings.default_permission_mode);
        let policy = PermissionPolicy::new(mode, &allowed, &disallowed)
            .map_err(|e| OrchestratorError::Validation(e.to_string()))?;

        let resume = if request.resume {
            match self.inner.store.last_agent_session(session_id).await {
                Ok(resume) => resume,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "resume lookup failed, starting fresh");
                    None
                }
            }
        } else {
            None
        };

        let options = CommandOptions {
            program: settings.program.clone(),
            model: request.options.model.clone(),
            permission_mode: mode,
            resume,
            max_turns: request.options.max_turns.or(settings.max_turns),
            max_budget_usd: request.options.max_budget_usd.or(settings.max_budget_usd),
            allowed_tools: allowed,
            disallowed_tools: disallowed,
            system_prompt: request.options.system_prompt.clone(),
            append_system_prompt: request.options.append_system_prompt.clone(),
            working_dir: settings.working_dir.clone(),
        };
        let command = self.inner.launcher.command(&options);

        let turn_id = self
            .inner
            .next_turn
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::channel(settings.channel_capacity.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionStreamState::new(session_id));

        let rules = {
            let mut workers = self.inner.workers();
            if workers.contains_key(session_id) {
                return Err(OrchestratorError::SessionBusy(session_id.to_string()));
            }
            workers.insert(
                session_id.to_string(),
                WorkerHandle {
                    turn_id,
                    control: control_tx,
                    state: state_rx,
                },
            );
            self.session_rules(session_id)
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let release_id = session_id.to_string();
        let release = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.release(&release_id, turn_id);
            }
        });

        let spec = TurnSpec {
            session_id: session_id.to_string(),
            prompt: request.prompt,
            command,
            policy,
            rules,
            stall_timeout: settings.stall_timeout,
            max_turn_duration: settings.max_turn_duration,
            shutdown_grace: settings.shutdown_grace,
        };
        let (worker, command) = Worker::new(
            spec,
            events_tx,
            control_rx,
            state_tx,
            Arc::clone(&self.inner.store),
            release,
        );
        tokio::spawn(worker.run(command));

        info!(session_id = %session_id, turn_id, mode = mode.as_str(), "turn admitted");
        Ok(TurnStream {
            session_id: session_id.to_string(),
            events: events_rx,
        })
    }

    /// Deliver a permission decision to the session's worker.
    ///
    /// Succeeds only if `decision.id` is the session's outstanding request.
    pub async fn resolve(
        &self,
        session_id: &str,
        decision: PermissionDecision,
    ) -> Result<(), PermissionError> {
        let stale = PermissionError::Stale(decision.id.clone());
        let Some(control) = self
            .inner
            .workers()
            .get(session_id)
            .map(|h| h.control.clone())
        else {
            return Err(stale);
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if control
            .send(Control::Resolve {
                decision,
                reply: reply_tx,
            })
            .is_err()
        {
            return Err(stale);
        }
        reply_rx.await.unwrap_or(Err(stale))
    }

    /// Signal the session's live turn to stop. Returns whether one was
    /// signalled; calling it again, or with no live turn, is a no-op.
    pub fn cancel(&self, session_id: &str) -> bool {
        let workers = self.inner.workers();
        let Some(handle) = workers.get(session_id) else {
            return false;
        };
        if handle.state.borrow().status.is_terminal() {
            return false;
        }
        handle.control.send(Control::Cancel).is_ok()
    }

    /// Cancel every live turn; used on shutdown.
    pub fn cancel_all(&self) -> usize {
        let workers = self.inner.workers();
        workers
            .values()
            .filter(|h| h.control.send(Control::Cancel).is_ok())
            .count()
    }

    /// Snapshot of the session's live turn.
    #[must_use]
    pub fn state(&self, session_id: &str) -> Option<SessionStreamState> {
        self.inner
            .workers()
            .get(session_id)
            .map(|h| h.state.borrow().clone())
    }

    /// The session's outstanding permission request and how long it has waited.
    #[must_use]
    pub fn pending(&self, session_id: &str) -> Option<PendingPermission> {
        let state = self.state(session_id)?;
        let request = state.pending_permission?;
        let awaiting = state
            .awaiting_since
            .and_then(|since| (Utc::now() - since).to_std().ok())
            .unwrap_or_default();
        Some(PendingPermission { request, awaiting })
    }

    /// Number of sessions with a live turn.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.inner.workers().len()
    }

    fn session_rules(&self, session_id: &str) -> Arc<Mutex<StandingRules>> {
        let mut rules = self.inner.rules();
        Arc::clone(rules.entry(session_id.to_string()).or_default())
    }
}

fn validate(session_id: &str, request: &StartRequest) -> Result<(), OrchestratorError> {
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
        return Err(OrchestratorError::Validation(format!(
            "session id must be 1-{MAX_SESSION_ID_LEN} characters"
        )));
    }
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(OrchestratorError::Validation(format!(
            "session id '{session_id}' contains invalid characters"
        )));
    }
    if request.prompt.trim().is_empty() {
        return Err(OrchestratorError::Validation(
            "prompt cannot be empty".to_string(),
        ));
    }
    if request.options.max_turns == Some(0) {
        return Err(OrchestratorError::Validation(
            "maxTurns must be at least 1".to_string(),
        ));
    }
    if let Some(budget) = request.options.max_budget_usd {
        if !budget.is_finite() || budget <= 0.0 {
            return Err(OrchestratorError::Validation(
                "maxBudgetUsd must be a positive number".to_string(),
            ));
        }
    }
    Ok(())
}

/// Receiving end of one turn's events
///
/// Dropping it tells the worker the subscriber is gone, which cancels the turn.
#[derive(Debug)]
pub struct TurnStream {
    session_id: String,
    events: mpsc::Receiver<StreamEvent>,
}

impl TurnStream {
    /// Session this turn belongs to
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event, `None` after the terminator.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

impl Stream for TurnStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}
