//! Boot stage contract and the built-in stage implementations

use crate::runtime::dependency::{DependencyError, DependencyResolver};
use crate::runtime::executor::{ExecutorError, GroupExecutor, Initializers, ServiceInitializer};
use crate::runtime::session::ServiceInitResult;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One of the three boot stages.
///
/// Implementations do the actual work (loading configuration, starting
/// services, preparing the UI). They should watch the context's
/// cancellation token and return promptly once it fires.
#[async_trait]
pub trait BootStage: Send + Sync {
    /// Stage number (0, 1 or 2)
    fn stage_number(&self) -> u8;

    /// Human-readable stage name
    fn name(&self) -> &str;

    /// Cheap synchronous checks run before any work starts
    fn validate_preconditions(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Run the stage
    async fn execute(&self, ctx: StageContext) -> anyhow::Result<()>;
}

/// Receives what a running stage reports
pub(crate) trait StageSink: Send + Sync {
    fn report_progress(&self, stage: u8, stage_name: &str, progress: i32, message: &str);
    fn record_service(&self, result: ServiceInitResult);
}

/// Handle given to a stage while it runs
#[derive(Clone)]
pub struct StageContext {
    stage_number: u8,
    stage_name: String,
    cancel: CancellationToken,
    sink: Option<Arc<dyn StageSink>>,
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("stage_number", &self.stage_number)
            .field("stage_name", &self.stage_name)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl StageContext {
    /// Context that is not connected to an orchestrator; reports are dropped
    pub fn detached(
        stage_number: u8,
        stage_name: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stage_number,
            stage_name: stage_name.into(),
            cancel,
            sink: None,
        }
    }

    pub(crate) fn attached(
        stage_number: u8,
        stage_name: impl Into<String>,
        cancel: CancellationToken,
        sink: Arc<dyn StageSink>,
    ) -> Self {
        Self {
            stage_number,
            stage_name: stage_name.into(),
            cancel,
            sink: Some(sink),
        }
    }

    pub fn stage_number(&self) -> u8 {
        self.stage_number
    }

    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Cancelled when the caller gives up or the stage times out
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report progress within this stage (0-100)
    pub fn report_progress(&self, progress: i32, message: impl AsRef<str>) {
        if let Some(sink) = &self.sink {
            sink.report_progress(self.stage_number, &self.stage_name, progress, message.as_ref());
        }
    }

    /// Record the outcome of one service into the boot session
    pub fn record_service(&self, result: ServiceInitResult) {
        if let Some(sink) = &self.sink {
            sink.record_service(result);
        }
    }
}

type StageFn = Arc<dyn Fn(StageContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type PreconditionFn = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Stage built from an async closure
#[derive(Clone)]
pub struct FnStage {
    number: u8,
    name: String,
    body: StageFn,
    preconditions: Option<PreconditionFn>,
}

impl std::fmt::Debug for FnStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage")
            .field("number", &self.number)
            .field("name", &self.name)
            .finish()
    }
}

impl FnStage {
    pub fn new<F, Fut>(number: u8, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            number,
            name: name.into(),
            body: Arc::new(move |ctx| body(ctx).boxed()),
            preconditions: None,
        }
    }

    /// Add a precondition check
    pub fn with_preconditions(
        mut self,
        check: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.preconditions = Some(Arc::new(check));
        self
    }
}

#[async_trait]
impl BootStage for FnStage {
    fn stage_number(&self) -> u8 {
        self.number
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn validate_preconditions(&self) -> anyhow::Result<()> {
        match &self.preconditions {
            Some(check) => check(),
            None => Ok(()),
        }
    }

    async fn execute(&self, ctx: StageContext) -> anyhow::Result<()> {
        (self.body)(ctx).await
    }
}

/// How the services stage starts its services
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Dependency layers, members of a layer concurrently
    #[default]
    Parallel,
    /// One service at a time in initialization order
    Sequential,
}

/// Stage 1: starts the registered services as their dependencies allow
pub struct ServicesStage {
    resolver: DependencyResolver,
    initializers: Initializers,
    mode: ExecutionMode,
}

impl std::fmt::Debug for ServicesStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicesStage")
            .field("resolver", &self.resolver)
            .field("services", &self.initializers.keys().collect::<Vec<_>>())
            .field("mode", &self.mode)
            .finish()
    }
}

impl Default for ServicesStage {
    fn default() -> Self {
        Self::new(DependencyResolver::new())
    }
}

impl ServicesStage {
    pub fn new(resolver: DependencyResolver) -> Self {
        Self {
            resolver,
            initializers: Initializers::new(),
            mode: ExecutionMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Register a service, its dependencies and its initializer
    pub fn with_service<I, S>(
        mut self,
        name: impl Into<String>,
        dependencies: I,
        initializer: ServiceInitializer,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        self.resolver.register_service(name.clone(), dependencies);
        self.initializers.insert(name, initializer);
        self
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    async fn start(
        &self,
        executor: &GroupExecutor,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let result = match self.mode {
            ExecutionMode::Parallel => {
                let groups = self.resolver.parallel_groups()?;
                executor
                    .start_services(&self.initializers, &groups, cancel)
                    .await?
            }
            ExecutionMode::Sequential => {
                let order = self.resolver.initialization_order()?;
                executor
                    .start_services_sequentially(&self.initializers, &order, cancel)
                    .await?
            }
        };
        log::info!("Services started. {}", result.summary());
        Ok(())
    }
}

#[async_trait]
impl BootStage for ServicesStage {
    fn stage_number(&self) -> u8 {
        1
    }

    fn name(&self) -> &str {
        "Services"
    }

    fn validate_preconditions(&self) -> anyhow::Result<()> {
        self.resolver
            .validate_dependencies()
            .map_err(|cycle| DependencyError::CyclicDependency(cycle).into())
    }

    async fn execute(&self, ctx: StageContext) -> anyhow::Result<()> {
        let total = self
            .resolver
            .service_names()
            .filter(|name| self.initializers.contains_key(*name))
            .count()
            .max(1);
        let finished = Arc::new(AtomicUsize::new(0));

        ctx.report_progress(0, "Resolving service dependencies...");

        let observer_ctx = ctx.clone();
        let executor = GroupExecutor::new().with_observer(move |result: &ServiceInitResult| {
            let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
            let message = if result.success {
                format!("Started {}", result.service_name)
            } else {
                format!("Failed to start {}", result.service_name)
            };
            observer_ctx.record_service(result.clone());
            observer_ctx.report_progress((done * 100 / total) as i32, message);
        });

        self.start(&executor, ctx.cancel_token()).await?;
        ctx.report_progress(100, "All services started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::executor::service_fn;

    #[tokio::test]
    async fn test_services_stage_starts_everything() {
        let stage = ServicesStage::default()
            .with_service("configuration", Vec::<String>::new(), service_fn(|_| async { Ok(()) }))
            .with_service("cache", ["configuration"], service_fn(|_| async { Ok(()) }));

        assert_eq!(stage.stage_number(), 1);
        stage.validate_preconditions().unwrap();

        let ctx = StageContext::detached(1, "Services", CancellationToken::new());
        stage.execute(ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_services_stage_surfaces_executor_error() {
        let stage = ServicesStage::default()
            .with_mode(ExecutionMode::Sequential)
            .with_service(
                "database",
                Vec::<String>::new(),
                service_fn(|_| async { anyhow::bail!("connection refused") }),
            );

        let ctx = StageContext::detached(1, "Services", CancellationToken::new());
        let err = stage.execute(ctx).await.unwrap_err();
        let executor_error = err.downcast_ref::<ExecutorError>().unwrap();
        assert!(matches!(executor_error, ExecutorError::GroupFailed { .. }));
    }

    #[test]
    fn test_services_stage_rejects_cycles_up_front() {
        let stage = ServicesStage::default()
            .with_service("a", ["b"], service_fn(|_| async { Ok(()) }))
            .with_service("b", ["a"], service_fn(|_| async { Ok(()) }));

        let err = stage.validate_preconditions().unwrap_err();
        assert!(err.downcast_ref::<DependencyError>().is_some());
    }

    #[tokio::test]
    async fn test_fn_stage() {
        let stage = FnStage::new(2, "Application", |ctx: StageContext| async move {
            ctx.report_progress(50, "Applying theme...");
            Ok(())
        })
        .with_preconditions(|| anyhow::bail!("no window"));

        assert_eq!(stage.name(), "Application");
        assert!(stage.validate_preconditions().is_err());
        stage
            .execute(StageContext::detached(2, "Application", CancellationToken::new()))
            .await
            .unwrap();
    }

    #[test]
    fn test_execution_mode_from_yaml() {
        let mode: ExecutionMode = serde_yaml::from_str("sequential").unwrap();
        assert_eq!(mode, ExecutionMode::Sequential);
        assert_eq!(ExecutionMode::default(), ExecutionMode::Parallel);
    }
}
