//! Group executor - starts services group by group with fail-fast semantics

use crate::runtime::dependency::DependencyError;
use crate::runtime::session::ServiceInitResult;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Future returned by a service initializer
pub type ServiceFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Initialization function for one named service
pub type ServiceInitializer = Arc<dyn Fn(CancellationToken) -> ServiceFuture + Send + Sync>;

/// Initializers keyed by service name
pub type Initializers = HashMap<String, ServiceInitializer>;

/// Callback invoked whenever a service finishes, successfully or not
pub type ServiceObserver = Arc<dyn Fn(&ServiceInitResult) + Send + Sync>;

/// Wrap an async closure as a [`ServiceInitializer`]
pub fn service_fn<F, Fut>(f: F) -> ServiceInitializer
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |cancel| f(cancel).boxed())
}

/// Aggregated outcome of a service startup run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupExecutionResult {
    pub successful_services: Vec<String>,
    pub failed_services: Vec<String>,
    pub service_durations: IndexMap<String, u64>,
    pub service_errors: IndexMap<String, String>,
    pub total_duration_ms: u64,
}

impl GroupExecutionResult {
    /// True when no attempted service failed
    pub fn is_success(&self) -> bool {
        self.failed_services.is_empty()
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "Success: {}, Failed: {}, Total: {}ms",
            self.successful_services.len(),
            self.failed_services.len(),
            self.total_duration_ms
        )
    }

    fn record(&mut self, result: &ServiceInitResult) {
        self.service_durations
            .insert(result.service_name.clone(), result.duration_ms);
        if result.success {
            self.successful_services.push(result.service_name.clone());
        } else {
            self.failed_services.push(result.service_name.clone());
            self.service_errors.insert(
                result.service_name.clone(),
                result.error_message.clone().unwrap_or_default(),
            );
        }
    }
}

/// Runs service initializers group by group.
///
/// Members of a group run concurrently as separate tokio tasks. The next
/// group only starts once every member of the current one has succeeded.
#[derive(Clone, Default)]
pub struct GroupExecutor {
    observer: Option<ServiceObserver>,
}

impl std::fmt::Debug for GroupExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupExecutor")
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Why a group stopped early
enum Abort {
    Failed(ServiceInitError),
    Cancelled,
}

impl GroupExecutor {
    /// Create an executor without an observer
    pub fn new() -> Self {
        Self::default()
    }

    /// Get notified after every finished service
    pub fn with_observer(
        mut self,
        observer: impl Fn(&ServiceInitResult) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Start services in parallel groups.
    ///
    /// The first failing member (in group order) aborts the run; its group
    /// still finishes, later groups never start.
    pub async fn start_services(
        &self,
        initializers: &Initializers,
        groups: &[Vec<String>],
        cancel: &CancellationToken,
    ) -> Result<GroupExecutionResult, ExecutorError> {
        log::info!(
            "Starting parallel service initialization for {} services in {} groups",
            initializers.len(),
            groups.len()
        );

        let started = Instant::now();
        let mut result = GroupExecutionResult::default();

        for (index, group) in groups.iter().enumerate() {
            if let Err(abort) = self
                .start_group(index, group, initializers, cancel, &mut result)
                .await
            {
                result.total_duration_ms = elapsed_ms(started);
                return Err(Self::abort_error(abort, index, result));
            }
        }

        result.total_duration_ms = elapsed_ms(started);
        log::info!(
            "Parallel service initialization completed. {}",
            result.summary()
        );
        Ok(result)
    }

    /// Start services one at a time in the given order.
    ///
    /// Deterministic fallback for diagnosing failures that only show up
    /// under parallel startup. Same fail-fast contract as
    /// [`GroupExecutor::start_services`].
    pub async fn start_services_sequentially(
        &self,
        initializers: &Initializers,
        order: &[String],
        cancel: &CancellationToken,
    ) -> Result<GroupExecutionResult, ExecutorError> {
        log::info!(
            "Starting sequential service initialization for {} services",
            initializers.len()
        );

        let started = Instant::now();
        let mut result = GroupExecutionResult::default();

        for (index, name) in order.iter().enumerate() {
            let Some(initializer) = initializers.get(name) else {
                log::warn!("No initializer registered for service '{}', skipping", name);
                continue;
            };

            if cancel.is_cancelled() {
                result.total_duration_ms = elapsed_ms(started);
                return Err(Self::abort_error(Abort::Cancelled, index, result));
            }

            let service_started = Instant::now();
            let service = run_service(
                name.clone(),
                Arc::clone(initializer),
                cancel.clone(),
                self.observer.clone(),
            );
            let outcome = tokio::select! {
                outcome = service => outcome,
                _ = cancel.cancelled() => {
                    let aborted = ServiceInitResult::failed(
                        name.as_str(),
                        elapsed_ms(service_started),
                        "cancelled",
                    );
                    if let Some(observer) = &self.observer {
                        observer(&aborted);
                    }
                    result.record(&aborted);
                    result.total_duration_ms = elapsed_ms(started);
                    return Err(Self::abort_error(Abort::Cancelled, index, result));
                }
            };

            result.record(&outcome);
            if !outcome.success {
                result.total_duration_ms = elapsed_ms(started);
                let error = ServiceInitError::from_result(&outcome);
                return Err(Self::abort_error(Abort::Failed(error), index, result));
            }
        }

        result.total_duration_ms = elapsed_ms(started);
        log::info!(
            "Sequential service initialization completed. {}",
            result.summary()
        );
        Ok(result)
    }

    /// Run every member of one group concurrently and merge their results
    async fn start_group(
        &self,
        index: usize,
        group: &[String],
        initializers: &Initializers,
        cancel: &CancellationToken,
        result: &mut GroupExecutionResult,
    ) -> Result<(), Abort> {
        let members: Vec<(&String, &ServiceInitializer)> = group
            .iter()
            .filter_map(|name| match initializers.get(name) {
                Some(initializer) => Some((name, initializer)),
                None => {
                    log::warn!("No initializer registered for service '{}', skipping", name);
                    None
                }
            })
            .collect();

        if members.is_empty() {
            log::warn!("No initializers found for group {}: [{}]", index, group.join(", "));
            return Ok(());
        }

        if cancel.is_cancelled() {
            return Err(Abort::Cancelled);
        }

        log::debug!("Starting parallel group {}: [{}]", index, group.join(", "));
        let group_started = Instant::now();

        let handles: Vec<_> = members
            .iter()
            .map(|(name, initializer)| {
                tokio::spawn(run_service(
                    (*name).clone(),
                    Arc::clone(initializer),
                    cancel.clone(),
                    self.observer.clone(),
                ))
            })
            .collect();
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let mut pending: FuturesUnordered<_> = handles
            .into_iter()
            .enumerate()
            .map(|(slot, handle)| async move { (slot, handle.await) })
            .collect();

        // Outcomes are kept as workers report in, so a cancelled group still
        // accounts for the members that already finished
        let mut outcomes: Vec<Option<ServiceInitResult>> = vec![None; members.len()];
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                next = pending.next() => match next {
                    Some((slot, joined)) => {
                        let name = members[slot].0;
                        outcomes[slot] = Some(joined.unwrap_or_else(|e| {
                            log::error!("Service task for '{}' did not complete: {}", name, e);
                            ServiceInitResult::failed(
                                name.as_str(),
                                elapsed_ms(group_started),
                                e.to_string(),
                            )
                        }));
                    }
                    None => break,
                },
                _ = cancel.cancelled() => {
                    log::warn!("Cancellation requested, aborting group {}", index);
                    for handle in &abort_handles {
                        handle.abort();
                    }
                    cancelled = true;
                    break;
                }
            }
        }

        let mut first_failure: Option<ServiceInitError> = None;
        for ((name, _), outcome) in members.iter().zip(outcomes) {
            let outcome = match outcome {
                Some(outcome) => outcome,
                None => {
                    let aborted = ServiceInitResult::failed(
                        name.as_str(),
                        elapsed_ms(group_started),
                        "cancelled",
                    );
                    if let Some(observer) = &self.observer {
                        observer(&aborted);
                    }
                    aborted
                }
            };
            result.record(&outcome);
            if !outcome.success && first_failure.is_none() {
                first_failure = Some(ServiceInitError::from_result(&outcome));
            }
        }

        if cancelled {
            return Err(Abort::Cancelled);
        }

        log::debug!(
            "Parallel group {} completed in {}ms",
            index,
            elapsed_ms(group_started)
        );

        match first_failure {
            Some(error) => Err(Abort::Failed(error)),
            None => Ok(()),
        }
    }

    fn abort_error(abort: Abort, group: usize, result: GroupExecutionResult) -> ExecutorError {
        match abort {
            Abort::Failed(source) => {
                log::error!(
                    "Service initialization failed in group {}: {}. {}",
                    group,
                    source,
                    result.summary()
                );
                ExecutorError::GroupFailed {
                    group,
                    source,
                    result: Box::new(result),
                }
            }
            Abort::Cancelled => {
                log::warn!("Service initialization cancelled. {}", result.summary());
                ExecutorError::Cancelled {
                    result: Box::new(result),
                }
            }
        }
    }
}

/// Run one initializer, timing it and turning errors and panics into a result
async fn run_service(
    name: String,
    initializer: ServiceInitializer,
    cancel: CancellationToken,
    observer: Option<ServiceObserver>,
) -> ServiceInitResult {
    log::debug!("Starting service: {}", name);
    let started = Instant::now();

    let outcome = AssertUnwindSafe(initializer(cancel)).catch_unwind().await;
    let duration_ms = elapsed_ms(started);

    let result = match outcome {
        Ok(Ok(())) => {
            log::info!(
                "Service initialized successfully: {} ({}ms)",
                name,
                duration_ms
            );
            ServiceInitResult::succeeded(name, duration_ms)
        }
        Ok(Err(e)) => {
            log::error!(
                "Service initialization failed: {} ({}ms): {:#}",
                name,
                duration_ms,
                e
            );
            ServiceInitResult::failed(name, duration_ms, format!("{:#}", e))
        }
        Err(_) => {
            log::error!("Service initializer panicked: {} ({}ms)", name, duration_ms);
            ServiceInitResult::failed(name, duration_ms, "initializer panicked")
        }
    };

    if let Some(observer) = observer {
        observer(&result);
    }
    result
}

pub(crate) fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// A single service failed to initialize
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Service '{service}' failed to initialize: {message}")]
pub struct ServiceInitError {
    pub service: String,
    pub message: String,
}

impl ServiceInitError {
    fn from_result(result: &ServiceInitResult) -> Self {
        Self {
            service: result.service_name.clone(),
            message: result.error_message.clone().unwrap_or_default(),
        }
    }
}

/// Errors that can occur while starting services
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Service group {group} aborted: {source}")]
    GroupFailed {
        group: usize,
        #[source]
        source: ServiceInitError,
        result: Box<GroupExecutionResult>,
    },

    #[error("Service startup cancelled")]
    Cancelled { result: Box<GroupExecutionResult> },
}

impl ExecutorError {
    /// What had been recorded before the run stopped
    pub fn partial_result(&self) -> Option<&GroupExecutionResult> {
        match self {
            ExecutorError::Dependency(_) => None,
            ExecutorError::GroupFailed { result, .. } | ExecutorError::Cancelled { result } => {
                Some(&**result)
            }
        }
    }
}
