//! Command-line interface for bootseq

use crate::runtime::ExecutionMode;
use argh::FromArgs;

/// Staged application boot orchestrator
#[derive(FromArgs, Debug)]
pub struct BootArgs {
    /// path to the boot plan (default: boot/default.boot.yaml)
    #[argh(positional, default = "String::from(\"boot/default.boot.yaml\")")]
    pub plan_file: String,

    /// show the boot plan without executing it
    #[argh(switch)]
    pub dry_run: bool,

    /// validate the boot plan and exit
    #[argh(switch)]
    pub validate: bool,

    /// start services one at a time instead of in parallel groups
    #[argh(switch)]
    pub sequential: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")", from_str_fn(parse_log_level))]
    pub log_level: String,
}

/// Accept only the levels env_logger understands
fn parse_log_level(s: &str) -> Result<String, String> {
    let level = s.to_lowercase();
    match level.as_str() {
        "error" | "warn" | "info" | "debug" | "trace" => Ok(level),
        _ => Err(format!(
            "Invalid log level '{}'. Expected one of: error, warn, info, debug, trace",
            s
        )),
    }
}

impl BootArgs {
    /// Execution mode requested on the command line, if any
    pub fn mode_override(&self) -> Option<ExecutionMode> {
        self.sequential.then_some(ExecutionMode::Sequential)
    }
}
