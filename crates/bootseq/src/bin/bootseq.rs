//! Bootseq CLI
//!
//! Usage:
//!   bootseq boot/default.boot.yaml
//!   bootseq boot/default.boot.yaml --sequential -l debug
//!   bootseq boot/default.boot.yaml --dry-run

use bootseq::{simulation, BootArgs, BootPlan, BootStatus};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let args: BootArgs = argh::from_env();

    // Initialize logging
    let env = env_logger::Env::default().default_filter_or(args.log_level.as_str());
    env_logger::init_from_env(env);

    // Load boot plan
    log::info!("Loading boot plan: {}", args.plan_file);
    let plan = match BootPlan::from_file(&args.plan_file) {
        Ok(plan) => plan,
        Err(e) => {
            log::error!("Failed to load boot plan: {}", e);
            std::process::exit(1);
        }
    };

    // Validate only mode
    if args.validate {
        println!("Boot plan '{}' is valid", args.plan_file);
        println!("  Version: {}", plan.version);
        println!("  Splash steps: {}", plan.splash.len());
        println!("  Services: {}", plan.services.len());
        println!("  Application steps: {}", plan.application.len());
        return;
    }

    // Dry run mode
    if args.dry_run {
        let mut plan = plan;
        if let Some(mode) = args.mode_override() {
            plan.mode = mode;
        }
        match plan.overview() {
            Ok(overview) => println!("{}", overview),
            Err(e) => {
                log::error!("Failed to resolve boot plan: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let orchestrator = match simulation::build_orchestrator(&plan, args.mode_override()) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            log::error!("Failed to create orchestrator: {}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();

    // Set up Ctrl+C handler
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            log::info!("Received Ctrl+C, cancelling boot...");
            cancel.cancel();
        }) {
            log::warn!("Failed to set Ctrl+C handler: {}", e);
        }
    }

    // Print progress as it arrives
    let mut progress = orchestrator.subscribe();
    let calculator = orchestrator.progress_calculator();
    let printer = tokio::spawn(async move {
        let started = Instant::now();
        loop {
            match progress.recv().await {
                Ok(event) => {
                    let elapsed_ms =
                        i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
                    let remaining = calculator
                        .estimate_time_remaining(i32::from(event.overall_percentage), elapsed_ms);
                    println!(
                        "[{:>3}%] {}: {} {}",
                        event.overall_percentage,
                        event.stage_name,
                        event.status_message,
                        calculator.format_time_remaining(remaining)
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!("Progress printer skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let outcome = orchestrator.execute_boot_sequence(&cancel).await;
    let session = orchestrator.boot_session();
    // Closing the channel lets the printer drain and stop
    drop(orchestrator);
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    match &outcome {
        Ok(_) => log::info!("Boot completed"),
        Err(e) => log::error!("Boot did not complete: {}", e),
    }

    match session {
        Ok(session) => {
            match serde_json::to_string_pretty(&session) {
                Ok(json) => println!("{}", json),
                Err(e) => log::error!("Failed to serialize boot session: {}", e),
            }
            let code = match session.status {
                BootStatus::Success => 0,
                BootStatus::Cancelled => 130,
                BootStatus::Failed | BootStatus::InProgress => 1,
            };
            std::process::exit(code);
        }
        Err(e) => {
            log::error!("No boot session recorded: {}", e);
            std::process::exit(1);
        }
    }
}
