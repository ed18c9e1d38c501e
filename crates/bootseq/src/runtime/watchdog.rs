//! Stage watchdog - hang detection for boot stages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Stage 0 (splash) timeout
const STAGE0_TIMEOUT: Duration = Duration::from_secs(10);

/// Stage 1 (services) timeout
const STAGE1_TIMEOUT: Duration = Duration::from_secs(60);

/// Stage 2 (application ready) timeout
const STAGE2_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-stage timeout limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub stage0: Duration,
    pub stage1: Duration,
    pub stage2: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            stage0: STAGE0_TIMEOUT,
            stage1: STAGE1_TIMEOUT,
            stage2: STAGE2_TIMEOUT,
        }
    }
}

impl StageTimeouts {
    /// Timeout for a stage, if the stage exists
    pub fn for_stage(&self, stage: u8) -> Option<Duration> {
        match stage {
            0 => Some(self.stage0),
            1 => Some(self.stage1),
            2 => Some(self.stage2),
            _ => None,
        }
    }
}

/// Watchdog lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Idle,
    Armed,
    Disarmed,
    Fired,
}

/// Snapshot taken when a stage hangs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutDiagnostics {
    pub stage_number: u8,
    pub elapsed_ms: u64,
    pub timeout_ms: u64,
    pub timestamp_utc: DateTime<Utc>,
    pub thread_count: usize,
    pub memory_usage_mb: u64,
}

#[derive(Debug)]
struct Timer {
    cancel: CancellationToken,
}

#[derive(Debug)]
struct Inner {
    state: WatchdogState,
    stage: Option<u8>,
    /// Timeout passed to the last arm
    timeout: Option<Duration>,
    armed_at: Option<Instant>,
    /// Frozen elapsed time once disarmed
    stopped_after: Option<Duration>,
    /// Bumped on every arm so stale timers never fire
    generation: u64,
    timer: Option<Timer>,
}

/// Races a timer against the guarded stage.
///
/// The timer runs as its own tokio task, so arming requires a running tokio
/// runtime. The guarded work is never blocked by the watchdog.
#[derive(Debug)]
pub struct StageWatchdog {
    timeouts: StageTimeouts,
    inner: Arc<Mutex<Inner>>,
}

impl Default for StageWatchdog {
    fn default() -> Self {
        Self::new(StageTimeouts::default())
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StageWatchdog {
    pub fn new(timeouts: StageTimeouts) -> Self {
        Self {
            timeouts,
            inner: Arc::new(Mutex::new(Inner {
                state: WatchdogState::Idle,
                stage: None,
                timeout: None,
                armed_at: None,
                stopped_after: None,
                generation: 0,
                timer: None,
            })),
        }
    }

    /// Configured timeout for a stage
    pub fn timeout_for_stage(&self, stage: u8) -> Result<Duration, WatchdogError> {
        self.timeouts
            .for_stage(stage)
            .ok_or(WatchdogError::UnknownStage(stage))
    }

    /// Arm for `stage` using its configured timeout
    pub fn arm_stage<F>(&self, stage: u8, on_timeout: F) -> Result<(), WatchdogError>
    where
        F: FnOnce() + Send + 'static,
    {
        let timeout = self.timeout_for_stage(stage)?;
        self.arm(stage, timeout, on_timeout);
        Ok(())
    }

    /// Start a timer for `stage`.
    ///
    /// Unless [`StageWatchdog::disarm`] is called first, `on_timeout` runs
    /// once when the timer expires. Any previous timer is stopped first.
    pub fn arm<F>(&self, stage: u8, timeout: Duration, on_timeout: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = lock(&self.inner);

        if let Some(previous) = inner.timer.take() {
            if inner.state == WatchdogState::Armed {
                log::warn!(
                    "Watchdog already armed for stage {:?}. Stopping previous timer.",
                    inner.stage
                );
            }
            previous.cancel.cancel();
        }

        inner.generation += 1;
        inner.state = WatchdogState::Armed;
        inner.stage = Some(stage);
        inner.timeout = Some(timeout);
        inner.armed_at = Some(Instant::now());
        inner.stopped_after = None;

        log::info!(
            "Starting watchdog for stage {} with timeout {}ms",
            stage,
            timeout.as_millis()
        );

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let shared = Arc::clone(&self.inner);
        let generation = inner.generation;

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    log::debug!("Watchdog for stage {} cancelled (stage completed)", stage);
                }
                _ = tokio::time::sleep(timeout) => {
                    let fire = {
                        let mut inner = lock(&shared);
                        if inner.generation == generation && inner.state == WatchdogState::Armed {
                            inner.state = WatchdogState::Fired;
                            inner.timer = None;
                            true
                        } else {
                            false
                        }
                    };
                    if fire {
                        log::error!("Stage {} timeout after {}ms", stage, timeout.as_millis());
                        on_timeout();
                    }
                }
            }
        });

        inner.timer = Some(Timer { cancel });
    }

    /// Stop the pending timer.
    ///
    /// Idempotent and never waits on the timer task. Returns the time spent
    /// armed, or `None` if the watchdog was not armed.
    pub fn disarm(&self) -> Option<Duration> {
        let mut inner = lock(&self.inner);

        if let Some(timer) = inner.timer.take() {
            timer.cancel.cancel();
        }

        match inner.state {
            WatchdogState::Armed => {
                let elapsed = inner.armed_at.map(|t| t.elapsed());
                inner.state = WatchdogState::Disarmed;
                inner.stopped_after = elapsed;
                log::debug!(
                    "Watchdog stopped. Elapsed: {}ms",
                    elapsed.unwrap_or_default().as_millis()
                );
                elapsed
            }
            WatchdogState::Fired => {
                log::debug!("Watchdog already fired for stage {:?}", inner.stage);
                None
            }
            WatchdogState::Idle | WatchdogState::Disarmed => None,
        }
    }

    pub fn state(&self) -> WatchdogState {
        lock(&self.inner).state
    }

    /// Whether a timer is pending
    pub fn is_running(&self) -> bool {
        self.state() == WatchdogState::Armed
    }

    /// Time since the last arm, frozen once disarmed
    pub fn elapsed(&self) -> Duration {
        let inner = lock(&self.inner);
        match (inner.stopped_after, inner.armed_at) {
            (Some(stopped), _) => stopped,
            (None, Some(armed_at)) => armed_at.elapsed(),
            (None, None) => Duration::ZERO,
        }
    }

    /// Snapshot of the process for timeout investigation.
    ///
    /// Reports the timeout the stage was armed with, falling back to the
    /// configured one for a stage that is not the last armed.
    pub fn collect_diagnostics(&self, stage: u8) -> Result<TimeoutDiagnostics, WatchdogError> {
        log::info!("Collecting timeout diagnostics for stage {}", stage);

        let armed = {
            let inner = lock(&self.inner);
            inner.timeout.filter(|_| inner.stage == Some(stage))
        };
        let timeout = match armed {
            Some(timeout) => timeout,
            None => self.timeout_for_stage(stage)?,
        };
        let process = process_snapshot();
        let diagnostics = TimeoutDiagnostics {
            stage_number: stage,
            elapsed_ms: duration_ms(self.elapsed()),
            timeout_ms: duration_ms(timeout),
            timestamp_utc: Utc::now(),
            thread_count: process.thread_count,
            memory_usage_mb: process.memory_usage_mb,
        };

        log::info!(
            "Timeout diagnostics: stage={}, elapsed={}ms, threads={}, memory={}MB",
            diagnostics.stage_number,
            diagnostics.elapsed_ms,
            diagnostics.thread_count,
            diagnostics.memory_usage_mb
        );
        Ok(diagnostics)
    }
}

impl Drop for StageWatchdog {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.inner).timer.take() {
            timer.cancel.cancel();
        }
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Resource usage of the current process
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ProcessSnapshot {
    pub memory_usage_mb: u64,
    pub thread_count: usize,
}

pub(crate) fn process_snapshot() -> ProcessSnapshot {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return ProcessSnapshot::default();
    };

    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::everything(),
    );

    system
        .process(pid)
        .map(|process| ProcessSnapshot {
            memory_usage_mb: process.memory() / 1024 / 1024,
            thread_count: process
                .tasks()
                .map(|tasks| tasks.len())
                .filter(|count| *count > 0)
                .unwrap_or(1),
        })
        .unwrap_or_default()
}

/// Watchdog errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchdogError {
    #[error("Invalid stage number: {0}")]
    UnknownStage(u8),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&fired);
        (fired, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_default_stage_timeouts() {
        let watchdog = StageWatchdog::default();
        assert_eq!(watchdog.timeout_for_stage(0), Ok(Duration::from_secs(10)));
        assert_eq!(watchdog.timeout_for_stage(1), Ok(Duration::from_secs(60)));
        assert_eq!(watchdog.timeout_for_stage(2), Ok(Duration::from_secs(15)));
        assert_eq!(
            watchdog.timeout_for_stage(3),
            Err(WatchdogError::UnknownStage(3))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_exactly_once_when_work_hangs() {
        let watchdog = StageWatchdog::default();
        let (fired, on_timeout) = counter();

        watchdog.arm(1, Duration::from_secs(60), on_timeout);
        assert_eq!(watchdog.state(), WatchdogState::Armed);

        // Simulated hang: nothing disarms the watchdog
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(watchdog.state(), WatchdogState::Fired);

        // Disarm after firing is a no-op
        assert_eq!(watchdog.disarm(), None);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(watchdog.state(), WatchdogState::Fired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_prevents_firing() {
        let watchdog = StageWatchdog::default();
        let (fired, on_timeout) = counter();

        watchdog.arm_stage(0, on_timeout).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        let elapsed = watchdog.disarm().unwrap();
        assert!(elapsed >= Duration::from_secs(3));
        assert_eq!(watchdog.state(), WatchdogState::Disarmed);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Second disarm is idempotent
        assert_eq!(watchdog.disarm(), None);
        assert_eq!(watchdog.elapsed(), elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_stops_previous_timer() {
        let watchdog = StageWatchdog::default();
        let (first, first_timeout) = counter();
        let (second, second_timeout) = counter();

        watchdog.arm(0, Duration::from_secs(10), first_timeout);
        tokio::time::sleep(Duration::from_secs(5)).await;
        watchdog.arm(2, Duration::from_secs(15), second_timeout);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_after_disarm() {
        let watchdog = StageWatchdog::default();
        let (fired, on_timeout) = counter();

        watchdog.arm_stage(0, || {}).unwrap();
        watchdog.disarm();
        watchdog.arm(1, Duration::from_millis(200), on_timeout);
        assert!(watchdog.is_running());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_diagnostics() {
        let watchdog = StageWatchdog::default();
        watchdog.arm_stage(2, || {}).unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;

        let diagnostics = watchdog.collect_diagnostics(2).unwrap();
        assert_eq!(diagnostics.stage_number, 2);
        assert_eq!(diagnostics.timeout_ms, 15_000);
        assert!(diagnostics.elapsed_ms >= 4_000);
        assert!(diagnostics.thread_count >= 1);

        assert_eq!(
            watchdog.collect_diagnostics(9),
            Err(WatchdogError::UnknownStage(9))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_diagnostics_report_armed_timeout() {
        let watchdog = StageWatchdog::default();
        watchdog.arm(1, Duration::from_millis(200), || {});

        let diagnostics = watchdog.collect_diagnostics(1).unwrap();
        assert_eq!(diagnostics.timeout_ms, 200);

        // Other stages still report their configured timeout
        assert_eq!(watchdog.collect_diagnostics(0).unwrap().timeout_ms, 10_000);
    }

    #[test]
    fn test_idle_watchdog() {
        let watchdog = StageWatchdog::default();
        assert_eq!(watchdog.state(), WatchdogState::Idle);
        assert!(!watchdog.is_running());
        assert_eq!(watchdog.disarm(), None);
        assert_eq!(watchdog.elapsed(), Duration::ZERO);
    }
}
