//! Simulated boot stages built from a boot plan
//!
//! Every step and service sleeps for its configured duration, honoring
//! cancellation, and optionally fails afterwards. This is what the `bootseq`
//! binary runs, and it doubles as a harness for exercising timeouts and
//! failure handling.

use crate::config::{BootPlan, ServiceConfig, StepConfig};
use crate::runtime::{
    service_fn, BootError, BootOrchestrator, BootStage, ExecutionMode, FnStage,
    ServiceInitializer, ServicesStage, StageContext,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Build an orchestrator whose stages simulate the plan.
///
/// `mode` overrides the plan's execution mode when set.
pub fn build_orchestrator(
    plan: &BootPlan,
    mode: Option<ExecutionMode>,
) -> Result<BootOrchestrator, BootError> {
    let stages: [Arc<dyn BootStage>; 3] = [
        Arc::new(steps_stage(0, "Splash", &plan.splash)),
        Arc::new(services_stage(plan, mode.unwrap_or(plan.mode))),
        Arc::new(steps_stage(2, "Application", &plan.application)),
    ];
    BootOrchestrator::with_config(stages, plan.orchestrator_config())
}

/// Stage running its steps one after another
pub fn steps_stage(number: u8, name: &str, steps: &[StepConfig]) -> FnStage {
    let steps: Arc<[StepConfig]> = steps.into();

    FnStage::new(number, name, move |ctx: StageContext| {
        let steps = Arc::clone(&steps);
        async move {
            let total = steps.len().max(1);
            for (i, step) in steps.iter().enumerate() {
                ctx.report_progress((i * 100 / total) as i32, format!("{}...", step.name));
                simulate(
                    &step.name,
                    step.duration_ms,
                    step.fail,
                    step.error.as_deref(),
                    ctx.cancel_token(),
                )
                .await?;
            }
            Ok(())
        }
    })
}

/// Stage 1 with one simulated initializer per configured service
pub fn services_stage(plan: &BootPlan, mode: ExecutionMode) -> ServicesStage {
    plan.services
        .iter()
        .fold(ServicesStage::default().with_mode(mode), |stage, (name, service)| {
            stage.with_service(
                name.clone(),
                service.depends_on.iter().cloned(),
                simulated_service(name, service),
            )
        })
}

fn simulated_service(name: &str, config: &ServiceConfig) -> ServiceInitializer {
    let name: Arc<str> = name.into();
    let config = config.clone();

    service_fn(move |cancel| {
        let name = Arc::clone(&name);
        let config = config.clone();
        async move {
            simulate(
                &name,
                config.duration_ms,
                config.fail,
                config.error.as_deref(),
                &cancel,
            )
            .await
        }
    })
}

async fn simulate(
    name: &str,
    duration_ms: u64,
    fail: bool,
    error: Option<&str>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    log::debug!("Simulating '{}' for {}ms", name, duration_ms);

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => {}
        _ = cancel.cancelled() => anyhow::bail!("'{}' interrupted", name),
    }

    if fail {
        anyhow::bail!("{}", error.unwrap_or("simulated failure"));
    }
    Ok(())
}
