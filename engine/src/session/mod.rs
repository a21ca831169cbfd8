//! Generation Session Manager
//!
//! Owns at most one in-flight generation run against one conversation.
//!
//! # Lifecycle
//!
//! ```text
//! Unprepared --prepare--> Idle --start_generation--> Generating
//!                          ^                              |
//!                          +---- Completed/Canceled/Errored
//! ```
//!
//! `start_generation` returns as soon as the run is spawned; callers observe
//! the outcome through [`SessionManager::subscribe_status`],
//! [`SessionManager::wait_until_idle`] or the message bus.
//!
//! # Reset during a run
//!
//! `reset` raises the run's cancel flag and replaces the conversation. A run
//! remembers the conversation epoch it started in, so any flush it still
//! performs after the reset is discarded. No output of the old run ever
//! lands in the new conversation.
//!
//! # Cancellation
//!
//! Cooperative: the streaming loop checks the flag around every fragment
//! pull. A backend that stops yielding fragments delays cancellation until
//! its next fragment.

mod run;

use sdk::types::PressureEvent;
use sdk::VitalisErrorExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

use crate::config::GenerationConfig;
use crate::conversation::{ConversationStore, TrimPolicy};
use crate::llm::{BackendError, Message, MessageRole, ModelBackend, ModelSession, SessionSchema};
use crate::message_bus::{Event, MessageBus};
use crate::prompt::{PromptAssembler, PromptError};
use run::{GenerationRun, RunInterrupt};

/// Default time threshold between flushes
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Default size threshold for a flush, in characters
pub const DEFAULT_FLUSH_MIN_CHARS: usize = 32;

/// Streaming and trimming knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationSettings {
    /// Flush when this much time passed since the last flush
    pub flush_interval: Duration,

    /// Flush when the buffer holds at least this many characters
    pub flush_min_chars: usize,

    /// Bounds applied before every run
    pub trim: TrimPolicy,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_min_chars: DEFAULT_FLUSH_MIN_CHARS,
            trim: TrimPolicy::default(),
        }
    }
}

impl GenerationSettings {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            flush_interval: config.flush_interval(),
            flush_min_chars: config.flush_min_chars,
            trim: config.trim_policy(),
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Stream exhausted; all output flushed
    Completed,

    /// Cancel flag observed; unflushed output dropped
    Canceled,

    /// Backend failed; unflushed output dropped
    Errored(String),
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Canceled => write!(f, "canceled"),
            RunOutcome::Errored(reason) => write!(f, "errored: {}", reason),
        }
    }
}

/// Observable session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// `prepare` has not succeeded yet
    Unprepared,

    /// Ready for `start_generation`
    Idle { last_outcome: Option<RunOutcome> },

    /// A run is active
    Generating { run_id: u64 },
}

/// Errors from `prepare`; the session is left unprepared
#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error("Backend setup failed: {0}")]
    Backend(#[from] BackendError),

    #[error("Prompt assembly failed: {0}")]
    Prompt(#[from] PromptError),
}

impl VitalisErrorExt for PrepareError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Backend(e) => e.user_hint(),
            Self::Prompt(e) => e.user_hint(),
        }
    }

    fn is_recoverable(&self) -> bool {
        true
    }
}

/// Errors from `start_generation`
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("Session is not prepared")]
    NotPrepared,

    #[error("A generation is already running")]
    AlreadyGenerating,
}

impl VitalisErrorExt for StartError {
    fn user_hint(&self) -> &str {
        match self {
            Self::NotPrepared => "Prepare the session before generating",
            Self::AlreadyGenerating => "Busy. Wait for the current reply or cancel it",
        }
    }

    fn is_recoverable(&self) -> bool {
        true
    }
}

/// Handle to the run currently owned by the session
struct ActiveRun {
    id: u64,
    cancel: Arc<AtomicBool>,
}

struct RunState {
    active: Option<ActiveRun>,
    next_run_id: u64,
    prepared: bool,
    schema: Option<SessionSchema>,
    last_prompt: Option<String>,
    last_outcome: Option<RunOutcome>,
}

impl RunState {
    fn resting_status(&self) -> SessionStatus {
        if self.prepared {
            SessionStatus::Idle {
                last_outcome: self.last_outcome.clone(),
            }
        } else {
            SessionStatus::Unprepared
        }
    }
}

struct Inner {
    backend: ModelSession,
    assembler: Arc<dyn PromptAssembler>,
    settings: GenerationSettings,
    bus: MessageBus,
    store: ConversationStore,
    state: Mutex<RunState>,
    status: watch::Sender<SessionStatus>,
}

/// Generation session manager
///
/// Cloning is cheap; clones share the session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        backend: ModelSession,
        assembler: Arc<dyn PromptAssembler>,
        settings: GenerationSettings,
        bus: MessageBus,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::Unprepared);
        Self {
            inner: Arc::new(Inner {
                backend,
                assembler,
                settings,
                bus,
                store: ConversationStore::new(),
                state: Mutex::new(RunState {
                    active: None,
                    next_run_id: 0,
                    prepared: false,
                    schema: None,
                    last_prompt: None,
                    last_outcome: None,
                }),
                status,
            }),
        }
    }

    /// Set up the backend and start a fresh conversation
    ///
    /// Runs backend setup (including warm-up), assembles the system prompt,
    /// clears backend context and resets the conversation to the single
    /// system message. Any active run is canceled.
    ///
    /// # Errors
    ///
    /// On failure the session is left unprepared.
    pub async fn prepare(&self, schema: SessionSchema) -> Result<(), PrepareError> {
        tracing::info!(
            "Preparing session '{}' on {} backend",
            schema.name,
            self.inner.backend.name()
        );

        let prompt = match self.build_prepared_prompt(&schema).await {
            Ok(prompt) => prompt,
            Err(e) => {
                tracing::error!("Session preparation failed: {}", e);
                let mut state = self.inner.lock_state();
                state.prepared = false;
                if state.active.is_none() {
                    self.inner.status.send_replace(SessionStatus::Unprepared);
                }
                return Err(e);
            }
        };

        let mut state = self.inner.lock_state();
        self.inner.request_cancel(&state);
        self.inner.store.reset_with_system(prompt.clone());
        state.prepared = true;
        state.last_prompt = Some(prompt);
        state.last_outcome = None;
        let name = schema.name.clone();
        state.schema = Some(schema);
        if state.active.is_none() {
            self.inner.status.send_replace(state.resting_status());
        }
        drop(state);

        self.inner.bus.publish(Event::SessionPrepared { schema: name });
        self.inner.bus.publish(Event::ConversationReset {
            epoch: self.inner.store.epoch(),
        });
        Ok(())
    }

    async fn build_prepared_prompt(&self, schema: &SessionSchema) -> Result<String, PrepareError> {
        self.inner.backend.setup(schema).await?;
        let prompt = self.inner.assembler.build_system_prompt().await?;
        self.inner.backend.reset_context().await?;
        Ok(compose_prompt(&prompt, schema))
    }

    /// Accept a new run and spawn its streaming task
    ///
    /// Returns immediately; the outcome is reported through the status
    /// channel and the message bus. Requests are never queued.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_generation(&self) -> Result<(), StartError> {
        let mut state = self.inner.lock_state();
        if !state.prepared {
            return Err(StartError::NotPrepared);
        }
        if let Some(active) = &state.active {
            tracing::debug!("Start rejected: run {} is active", active.id);
            return Err(StartError::AlreadyGenerating);
        }

        let removed = self.inner.store.trim(&self.inner.settings.trim);
        if removed > 0 {
            tracing::debug!("Trimmed {} messages before generation", removed);
        }
        let (epoch, messages) = self.inner.store.snapshot_with_epoch();

        state.next_run_id += 1;
        let run_id = state.next_run_id;
        let cancel = Arc::new(AtomicBool::new(false));
        state.active = Some(ActiveRun {
            id: run_id,
            cancel: cancel.clone(),
        });
        self.inner
            .status
            .send_replace(SessionStatus::Generating { run_id });
        self.inner.bus.publish(Event::GenerationStarted { run_id });

        let run = GenerationRun::new(run_id, epoch, cancel);
        tokio::spawn(Inner::drive(self.inner.clone(), run, messages));
        drop(state);

        tracing::info!("Generation run {} started", run_id);
        Ok(())
    }

    /// Request cancellation of the active run
    ///
    /// Returns whether a run was signaled.
    pub fn cancel_generation(&self) -> bool {
        let state = self.inner.lock_state();
        self.inner.request_cancel(&state)
    }

    /// Cancel any run and start over with a freshly assembled system prompt
    ///
    /// If assembly fails the previous prompt is reused.
    ///
    /// # Errors
    ///
    /// Fails only when assembly fails and there is no previous prompt.
    pub async fn reset(&self) -> Result<(), PrepareError> {
        let (schema, last_prompt) = {
            let state = self.inner.lock_state();
            self.inner.request_cancel(&state);
            (state.schema.clone().unwrap_or_default(), state.last_prompt.clone())
        };

        let prompt = match self.inner.assembler.build_system_prompt().await {
            Ok(prompt) => compose_prompt(&prompt, &schema),
            Err(e) => match last_prompt {
                Some(prompt) => {
                    tracing::warn!("Prompt assembly failed, reusing previous prompt: {}", e);
                    prompt
                }
                None => return Err(e.into()),
            },
        };

        if let Err(e) = self.inner.backend.reset_context().await {
            tracing::warn!("Backend context reset failed: {}", e);
        }

        let mut state = self.inner.lock_state();
        // A run started while the prompt was being assembled belongs to the
        // old conversation as well.
        self.inner.request_cancel(&state);
        self.inner.store.reset_with_system(prompt.clone());
        state.last_prompt = Some(prompt);
        drop(state);

        let epoch = self.inner.store.epoch();
        tracing::info!("Conversation reset (epoch {})", epoch);
        self.inner.bus.publish(Event::ConversationReset { epoch });
        Ok(())
    }

    /// Append a system note; allowed while a run is active
    pub fn append_note(&self, text: impl Into<String>) -> u64 {
        let seq = self.inner.store.append(MessageRole::System, text);
        self.inner.bus.publish(Event::NoteAppended { seq });
        seq
    }

    /// Append a user message
    pub fn append_user(&self, text: impl Into<String>) -> u64 {
        self.inner.store.append(MessageRole::User, text)
    }

    /// Pressure entry point: log the cause and cancel
    pub fn on_pressure(&self, event: PressureEvent) {
        self.inner.bus.publish(Event::PressureSignal { event });
        if self.cancel_generation() {
            tracing::warn!("Canceling generation due to {}", event);
        } else {
            tracing::info!("Pressure signal ({}) with no active generation", event);
        }
    }

    /// Current status
    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    /// Watch status transitions
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// Wait until no run is active
    ///
    /// Returns the last run's outcome, or `None` if the session is
    /// unprepared or no run has finished since preparation.
    pub async fn wait_until_idle(&self) -> Option<RunOutcome> {
        let mut rx = self.inner.status.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                SessionStatus::Generating { .. } => {}
                SessionStatus::Idle { last_outcome } => return last_outcome,
                SessionStatus::Unprepared => return None,
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Whether a run is active
    pub fn is_generating(&self) -> bool {
        self.inner.lock_state().active.is_some()
    }

    /// Snapshot of the conversation
    pub fn conversation(&self) -> Vec<Message> {
        self.inner.store.snapshot()
    }

    /// Bus the session publishes on
    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    /// Name of the backend variant
    pub fn backend_name(&self) -> &str {
        self.inner.backend.name()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set the active run's cancel flag; caller holds the state lock
    fn request_cancel(&self, state: &RunState) -> bool {
        let Some(active) = &state.active else {
            return false;
        };
        if !active.cancel.swap(true, Ordering::SeqCst) {
            tracing::info!("Cancellation requested for run {}", active.id);
            self.bus
                .publish(Event::CancellationRequested { run_id: active.id });
        }
        true
    }

    /// Task boundary: every way a run can end becomes a `RunOutcome`
    ///
    /// A panic in the streaming task is reported as `Errored` only where
    /// panics unwind. Release builds use `panic = "abort"` and terminate the
    /// process instead.
    async fn drive(inner: Arc<Inner>, mut run: GenerationRun, messages: Vec<Message>) {
        let run_id = run.id;
        let worker = inner.clone();
        let task = tokio::spawn(async move {
            let result = run
                .stream(
                    &worker.backend,
                    &messages,
                    &worker.store,
                    &worker.bus,
                    &worker.settings,
                )
                .await;
            let outcome = match result {
                Ok(()) => RunOutcome::Completed,
                Err(RunInterrupt::Canceled) => RunOutcome::Canceled,
                Err(RunInterrupt::Backend(e)) => {
                    tracing::error!("Run {} failed: {}", run.id, e);
                    RunOutcome::Errored(e.to_string())
                }
            };
            tracing::info!(
                "Generation run {} {} after {:.2}s ({} flushes)",
                run.id,
                outcome,
                run.started_at().elapsed().as_secs_f64(),
                run.flushes()
            );
            outcome
        });

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Run {} task aborted: {}", run_id, e);
                RunOutcome::Errored(format!("generation task failed: {}", e))
            }
        };

        inner.finish_run(run_id, outcome);
    }

    fn finish_run(&self, run_id: u64, outcome: RunOutcome) {
        let mut state = self.lock_state();
        if state.active.as_ref().map(|run| run.id) == Some(run_id) {
            state.active = None;
        }
        state.last_outcome = Some(outcome.clone());
        if state.active.is_none() {
            self.status.send_replace(state.resting_status());
        }
        self.bus
            .publish(Event::GenerationFinished { run_id, outcome });
    }
}

/// Append schema guidelines to the assembled prompt
fn compose_prompt(prompt: &str, schema: &SessionSchema) -> String {
    if schema.guidelines.is_empty() {
        return prompt.to_string();
    }
    let guidelines: Vec<String> = schema
        .guidelines
        .iter()
        .map(|g| format!("- {}", g))
        .collect();
    format!("{}\n\nResponse guidelines:\n{}", prompt, guidelines.join("\n"))
}
