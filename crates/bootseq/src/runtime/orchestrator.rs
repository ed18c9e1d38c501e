//! Boot orchestrator - runs stage 0, 1 and 2 under watchdog supervision
//!
//! Each stage runs against a child of the caller's cancellation token. The
//! watchdog cancels that child token when the stage overruns its timeout, so
//! a hung stage is abandoned without affecting the caller's token. When
//! classifying a failure the caller's token is checked first, so a user
//! cancellation is never reported as a timeout.

use crate::runtime::executor::elapsed_ms;
use crate::runtime::progress::{ProgressCalculator, ProgressError, ProgressEvent, StageWeights};
use crate::runtime::session::{BootSession, BootStatus, ServiceInitResult, StageMetrics};
use crate::runtime::stage::{BootStage, StageContext, StageSink};
use crate::runtime::watchdog::{
    duration_ms, process_snapshot, StageTimeouts, StageWatchdog, TimeoutDiagnostics, WatchdogError,
    WatchdogState,
};
use chrono::Utc;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default capacity of the progress broadcast channel
const PROGRESS_CHANNEL_CAPACITY: usize = 100;

/// Callback invoked with diagnostics when a stage hangs
pub type HangHandler = Arc<dyn Fn(&TimeoutDiagnostics) + Send + Sync>;

/// Orchestrator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub timeouts: StageTimeouts,
    pub weights: StageWeights,
    /// Events kept for slow progress subscribers before they start lagging
    pub progress_channel_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            timeouts: StageTimeouts::default(),
            weights: StageWeights::default(),
            progress_channel_capacity: PROGRESS_CHANNEL_CAPACITY,
        }
    }
}

/// Where the orchestrator is in the boot sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    NotStarted,
    Stage0Running,
    Stage1Running,
    Stage2Running,
    Completed(BootStatus),
}

impl BootState {
    fn running(stage: u8) -> Self {
        match stage {
            0 => BootState::Stage0Running,
            1 => BootState::Stage1Running,
            _ => BootState::Stage2Running,
        }
    }
}

struct SessionState {
    boot_state: BootState,
    session: Option<BootSession>,
    /// Last published (stage, overall percentage)
    last_progress: Option<(u8, u8)>,
    diagnostics: Option<TimeoutDiagnostics>,
}

struct Shared {
    state: Mutex<SessionState>,
    progress_tx: broadcast::Sender<ProgressEvent>,
    calculator: ProgressCalculator,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StageSink for Shared {
    fn report_progress(&self, stage: u8, stage_name: &str, progress: i32, message: &str) {
        let mut state = self.lock();
        let Some(session) = state.session.as_mut() else {
            return;
        };
        if session.status.is_terminal() {
            return;
        }

        if let Some(metrics) = session.stage_metrics_mut(stage) {
            let clamped = progress.clamp(0, 100) as u8;
            metrics.progress_percentage = metrics.progress_percentage.max(clamped);
            metrics.status_message = message.to_string();
        }

        // Stage 0 has no sub-progress
        if stage == 0 {
            return;
        }

        let mut overall = self.calculator.calculate_progress(stage, progress);
        if let Some((last_stage, last)) = state.last_progress {
            if last_stage == stage {
                overall = overall.max(last);
            }
        }
        state.last_progress = Some((stage, overall));

        // Sent under the lock so concurrent reporters publish in order
        let _ = self.progress_tx.send(ProgressEvent {
            stage_number: stage,
            stage_name: stage_name.to_string(),
            overall_percentage: overall,
            status_message: message.to_string(),
        });
    }

    fn record_service(&self, result: ServiceInitResult) {
        let mut state = self.lock();
        if let Some(session) = state.session.as_mut() {
            if !session.status.is_terminal() {
                session.service_metrics.push(result);
            }
        }
    }
}

/// Resets the running flag when a boot attempt ends, even if its future is dropped
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs the three boot stages in order and keeps the session record
pub struct BootOrchestrator {
    stages: [Arc<dyn BootStage>; 3],
    watchdog: Arc<StageWatchdog>,
    shared: Arc<Shared>,
    hang_handler: Option<HangHandler>,
    running: AtomicBool,
}

impl std::fmt::Debug for BootOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootOrchestrator")
            .field(
                "stages",
                &self.stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("state", &self.state())
            .finish()
    }
}

impl BootOrchestrator {
    /// Create an orchestrator with the default timeouts and weights.
    ///
    /// `stages[n]` must report stage number `n`.
    pub fn new(stages: [Arc<dyn BootStage>; 3]) -> Result<Self, BootError> {
        Self::with_config(stages, OrchestratorConfig::default())
    }

    pub fn with_config(
        stages: [Arc<dyn BootStage>; 3],
        config: OrchestratorConfig,
    ) -> Result<Self, BootError> {
        for (expected, stage) in (0u8..).zip(stages.iter()) {
            if stage.stage_number() != expected {
                return Err(BootError::StageMismatch {
                    expected,
                    found: stage.stage_number(),
                });
            }
        }

        let calculator = ProgressCalculator::new(config.weights)?;
        let (progress_tx, _) = broadcast::channel(config.progress_channel_capacity.max(1));

        Ok(Self {
            stages,
            watchdog: Arc::new(StageWatchdog::new(config.timeouts)),
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState {
                    boot_state: BootState::NotStarted,
                    session: None,
                    last_progress: None,
                    diagnostics: None,
                }),
                progress_tx,
                calculator,
            }),
            hang_handler: None,
            running: AtomicBool::new(false),
        })
    }

    /// Get called with diagnostics whenever a stage hangs
    pub fn with_hang_handler(
        mut self,
        handler: impl Fn(&TimeoutDiagnostics) + Send + Sync + 'static,
    ) -> Self {
        self.hang_handler = Some(Arc::new(handler));
        self
    }

    /// Subscribe to progress events.
    ///
    /// Subscribers that fall behind lose the oldest events; the boot never
    /// waits for them.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.shared.progress_tx.subscribe()
    }

    pub fn state(&self) -> BootState {
        self.shared.lock().boot_state
    }

    pub fn progress_calculator(&self) -> ProgressCalculator {
        self.shared.calculator
    }

    /// Snapshot of the current or last boot session
    pub fn boot_session(&self) -> Result<BootSession, BootError> {
        self.shared.lock().session.clone().ok_or(BootError::NoSession)
    }

    /// Diagnostics collected at the most recent stage timeout
    pub fn last_timeout_diagnostics(&self) -> Option<TimeoutDiagnostics> {
        self.shared.lock().diagnostics.clone()
    }

    /// Run stage 0, 1 and 2 in order.
    ///
    /// Returns the finished session on success. On failure the session is
    /// still finalized and available through [`BootOrchestrator::boot_session`].
    pub async fn execute_boot_sequence(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BootSession, BootError> {
        let _guard = RunGuard::acquire(&self.running).ok_or(BootError::AlreadyRunning)?;

        let session_id = Uuid::new_v4();
        log::info!("Starting boot sequence. Session ID: {}", session_id);
        {
            let mut state = self.shared.lock();
            state.session = Some(BootSession::new(session_id));
            state.boot_state = BootState::NotStarted;
            state.last_progress = None;
            state.diagnostics = None;
        }

        for stage in &self.stages {
            if let Err(error) = self.run_stage(stage.as_ref(), cancel).await {
                let status = match error {
                    BootError::Cancelled { .. } => BootStatus::Cancelled,
                    _ => BootStatus::Failed,
                };
                match status {
                    BootStatus::Cancelled => log::warn!("Boot sequence cancelled: {}", error),
                    _ => log::error!("Boot sequence failed: {}", error),
                }
                self.complete(status, Some(error.to_string()), Some(error_chain(&error)));
                return Err(error);
            }
        }

        let session = self.complete(BootStatus::Success, None, None);
        log::info!(
            "Boot sequence completed successfully. Total: {}ms (Stage 0: {}ms, Stage 1: {}ms, Stage 2: {}ms)",
            session.total_duration_ms.unwrap_or(0),
            session.stage0_duration_ms,
            session.stage1_duration_ms.unwrap_or(0),
            session.stage2_duration_ms.unwrap_or(0)
        );
        Ok(session)
    }

    async fn run_stage(
        &self,
        stage: &dyn BootStage,
        cancel: &CancellationToken,
    ) -> Result<(), BootError> {
        let number = stage.stage_number();
        let name = stage.name().to_string();
        log::info!("Starting stage {}: {}", number, name);

        {
            let mut state = self.shared.lock();
            state.boot_state = BootState::running(number);
            if let Some(session) = state.session.as_mut() {
                session.stage_metrics.push(StageMetrics::started(number, &name));
            }
        }

        let started = Instant::now();
        let outcome = self.guard_stage(stage, number, &name, cancel).await;
        let duration = elapsed_ms(started);

        {
            let mut state = self.shared.lock();
            if let Some(session) = state.session.as_mut() {
                session.set_stage_duration(number, duration);
                if let Some(metrics) = session.stage_metrics_mut(number) {
                    metrics.end_timestamp = Some(Utc::now());
                    metrics.duration_ms = Some(duration);
                    metrics.success = outcome.is_ok();
                    metrics.error_message = outcome.as_ref().err().map(|e| e.to_string());
                }
            }
        }

        match &outcome {
            Ok(()) => {
                log::info!("Stage {} completed in {}ms", number, duration);
                self.shared
                    .report_progress(number, &name, 100, &format!("{} complete", name));
            }
            Err(error) => log::error!("Stage {} failed after {}ms: {}", number, duration, error),
        }
        outcome
    }

    async fn guard_stage(
        &self,
        stage: &dyn BootStage,
        number: u8,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), BootError> {
        if cancel.is_cancelled() {
            return Err(BootError::Cancelled { stage: number });
        }

        stage
            .validate_preconditions()
            .map_err(|source| BootError::Preconditions {
                stage: number,
                source,
            })?;

        let timeout = self.watchdog.timeout_for_stage(number)?;
        let stage_token = cancel.child_token();
        self.watchdog
            .arm(number, timeout, self.timeout_handler(number, stage_token.clone()));

        let sink: Arc<dyn StageSink> = self.shared.clone();
        let ctx = StageContext::attached(number, name, stage_token.clone(), sink);
        if number > 0 {
            ctx.report_progress(0, format!("Starting {}...", name));
        }

        let outcome = tokio::select! {
            biased;
            result = stage.execute(ctx) => Some(result),
            _ = stage_token.cancelled() => None,
        };
        self.watchdog.disarm();

        // A stage that returns after the watchdog fired still timed out
        let timed_out =
            stage_token.is_cancelled() || self.watchdog.state() == WatchdogState::Fired;
        if cancel.is_cancelled() {
            return Err(BootError::Cancelled { stage: number });
        }

        match outcome {
            Some(Ok(())) if !timed_out => Ok(()),
            Some(Err(source)) if !timed_out => Err(BootError::StageFailed {
                stage: number,
                name: name.to_string(),
                source,
            }),
            _ => Err(self.timeout_error(number, timeout)),
        }
    }

    /// Handler run by the watchdog when a stage overruns.
    ///
    /// Diagnostics are stored before the stage token is cancelled, so they
    /// are in place by the time the stage is classified as timed out.
    fn timeout_handler(
        &self,
        stage: u8,
        stage_token: CancellationToken,
    ) -> impl FnOnce() + Send + 'static {
        let watchdog = Arc::clone(&self.watchdog);
        let shared = Arc::clone(&self.shared);
        let hang_handler = self.hang_handler.clone();

        move || {
            match watchdog.collect_diagnostics(stage) {
                Ok(diagnostics) => {
                    shared.lock().diagnostics = Some(diagnostics.clone());
                    if let Some(handler) = hang_handler {
                        let reported =
                            std::panic::catch_unwind(AssertUnwindSafe(|| handler(&diagnostics)));
                        if reported.is_err() {
                            log::error!("Hang handler panicked for stage {}", stage);
                        }
                    }
                }
                Err(e) => log::error!("Failed to collect timeout diagnostics: {}", e),
            }
            stage_token.cancel();
        }
    }

    fn timeout_error(&self, stage: u8, timeout: Duration) -> BootError {
        let elapsed_ms = self
            .shared
            .lock()
            .diagnostics
            .as_ref()
            .filter(|d| d.stage_number == stage)
            .map(|d| d.elapsed_ms)
            .unwrap_or_else(|| duration_ms(self.watchdog.elapsed()));

        BootError::StageTimeout {
            stage,
            elapsed_ms,
            timeout_ms: duration_ms(timeout),
        }
    }

    /// Finalize the session; it is immutable afterwards
    fn complete(
        &self,
        status: BootStatus,
        error_message: Option<String>,
        error_details: Option<String>,
    ) -> BootSession {
        let memory_usage_mb = process_snapshot().memory_usage_mb;

        let mut state = self.shared.lock();
        state.boot_state = BootState::Completed(status);
        let session = state
            .session
            .get_or_insert_with(|| BootSession::new(Uuid::new_v4()));
        session.end_timestamp = Some(Utc::now());
        session.total_duration_ms = Some(session.stage_duration_sum());
        session.status = status;
        session.error_message = error_message;
        session.error_details = error_details;
        session.memory_usage_mb = memory_usage_mb;
        session.clone()
    }
}

/// Display of an error followed by its sources
fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join("\ncaused by: ")
}

/// Errors that end a boot attempt or misuse the orchestrator
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("Stage {stage} preconditions not met: {source}")]
    Preconditions {
        stage: u8,
        #[source]
        source: anyhow::Error,
    },

    #[error("Stage {stage} timed out after {elapsed_ms}ms (timeout: {timeout_ms}ms)")]
    StageTimeout {
        stage: u8,
        elapsed_ms: u64,
        timeout_ms: u64,
    },

    #[error("User cancelled boot sequence during stage {stage}")]
    Cancelled { stage: u8 },

    #[error("Stage {stage} ({name}) failed: {source}")]
    StageFailed {
        stage: u8,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("No boot session available. Call execute_boot_sequence first")]
    NoSession,

    #[error("A boot sequence is already running")]
    AlreadyRunning,

    #[error("Stage slot {expected} holds stage {found}")]
    StageMismatch { expected: u8, found: u8 },

    #[error("Watchdog error: {0}")]
    Watchdog(#[from] WatchdogError),

    #[error("Progress configuration error: {0}")]
    Progress(#[from] ProgressError),
}
