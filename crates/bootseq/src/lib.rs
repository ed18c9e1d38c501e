//! Bootseq Boot Orchestrator
//!
//! Boots an application in three ordered stages, each guarded by its own
//! watchdog timeout:
//!
//! - Stage 0: splash (configuration loading, minimal UI)
//! - Stage 1: services, started as concurrently as their dependency graph allows
//! - Stage 2: application ready
//!
//! # Overview
//!
//! The orchestrator allows you to:
//! - Resolve service dependencies into an initialization order and parallel groups
//! - Start each group concurrently, aborting the boot on the first failure
//! - Detect hung stages and collect process diagnostics when they time out
//! - Publish stage-weighted progress and time-remaining estimates
//! - Keep a [`BootSession`] record of every boot attempt
//!
//! # Example Boot Plan
//!
//! ```yaml
//! version: "1.0"
//!
//! timeouts:
//!   stage1: 30000
//!
//! services:
//!   configuration:
//!     duration_ms: 50
//!   logging:
//!     depends_on: [configuration]
//!   database:
//!     depends_on: [configuration, logging]
//!     duration_ms: 300
//! ```

pub mod cli;
pub mod config;
pub mod runtime;
pub mod simulation;

pub use cli::BootArgs;
pub use config::{BootPlan, ConfigError, PlanOverview, ServiceConfig, StepConfig, TimeoutsConfig};
pub use runtime::{
    service_fn, BootError, BootOrchestrator, BootSession, BootStage, BootState, BootStatus,
    BootTimeline, DependencyError, DependencyResolver, ExecutionMode, ExecutorError, FnStage,
    GroupExecutionResult, GroupExecutor, OrchestratorConfig, ProgressCalculator, ProgressEvent,
    ServiceInitError, ServiceInitResult, ServiceInitializer, ServicesStage, StageContext,
    StageTimeouts, StageWatchdog, StageWeights, TimeoutDiagnostics,
};
