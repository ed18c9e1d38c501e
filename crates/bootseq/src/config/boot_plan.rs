//! Boot plan YAML schema definitions

use crate::runtime::{
    DependencyError, DependencyResolver, ExecutionMode, OrchestratorConfig, ProgressError,
    StageTimeouts, StageWeights,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root boot plan configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootPlan {
    /// Boot plan format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Per-stage timeouts in milliseconds
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Share of the progress bar owned by each stage
    #[serde(default)]
    pub weights: StageWeights,

    /// How stage 1 starts its services
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Stage 0 steps
    #[serde(default)]
    pub splash: Vec<StepConfig>,

    /// Stage 1 services (ordered map for deterministic registration order)
    #[serde(default)]
    pub services: IndexMap<String, ServiceConfig>,

    /// Stage 2 steps
    #[serde(default)]
    pub application: Vec<StepConfig>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Per-stage timeouts in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsConfig {
    #[serde(default = "default_stage0_ms")]
    pub stage0: u64,
    #[serde(default = "default_stage1_ms")]
    pub stage1: u64,
    #[serde(default = "default_stage2_ms")]
    pub stage2: u64,
}

fn default_stage0_ms() -> u64 {
    10_000
}

fn default_stage1_ms() -> u64 {
    60_000
}

fn default_stage2_ms() -> u64 {
    15_000
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            stage0: default_stage0_ms(),
            stage1: default_stage1_ms(),
            stage2: default_stage2_ms(),
        }
    }
}

impl From<TimeoutsConfig> for StageTimeouts {
    fn from(config: TimeoutsConfig) -> Self {
        StageTimeouts {
            stage0: Duration::from_millis(config.stage0),
            stage1: Duration::from_millis(config.stage1),
            stage2: Duration::from_millis(config.stage2),
        }
    }
}

/// A simulated unit of work in stage 0 or stage 2
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    /// Status message shown while the step runs
    pub name: String,

    /// How long the step takes
    #[serde(default)]
    pub duration_ms: u64,

    /// Make the step fail after its duration
    #[serde(default)]
    pub fail: bool,

    /// Error message used when `fail` is set
    #[serde(default)]
    pub error: Option<String>,
}

/// A simulated stage 1 service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Services that must be initialized first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// How long initialization takes
    #[serde(default)]
    pub duration_ms: u64,

    /// Make initialization fail after its duration
    #[serde(default)]
    pub fail: bool,

    /// Error message used when `fail` is set
    #[serde(default)]
    pub error: Option<String>,
}

impl BootPlan {
    /// Load a boot plan from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse a boot plan from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let plan: BootPlan = serde_yaml::from_str(content)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Validate the boot plan configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (stage, timeout) in [
            (0, self.timeouts.stage0),
            (1, self.timeouts.stage1),
            (2, self.timeouts.stage2),
        ] {
            if timeout == 0 {
                return Err(ConfigError::Validation(format!(
                    "Stage {} timeout must be greater than zero",
                    stage
                )));
            }
        }

        self.weights.validate()?;

        for (section, steps) in [("splash", &self.splash), ("application", &self.application)] {
            if let Some(step) = steps.iter().find(|s| s.name.trim().is_empty()) {
                return Err(ConfigError::Validation(format!(
                    "Step in '{}' has an empty name (duration {}ms)",
                    section, step.duration_ms
                )));
            }
        }

        // Check that dependencies reference existing services
        for (name, service) in &self.services {
            for dep in &service.depends_on {
                if !self.services.contains_key(dep) {
                    return Err(ConfigError::Validation(format!(
                        "Service '{}': depends on unknown service '{}'",
                        name, dep
                    )));
                }
            }
        }

        self.build_resolver()
            .validate_dependencies()
            .map_err(|cycle| ConfigError::Dependency(DependencyError::CyclicDependency(cycle)))
    }

    /// Dependency graph of the configured services, in file order
    pub fn build_resolver(&self) -> DependencyResolver {
        let mut resolver = DependencyResolver::new();
        for (name, service) in &self.services {
            resolver.register_service(name.clone(), service.depends_on.iter().cloned());
        }
        resolver
    }

    /// Orchestrator settings described by this plan
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            timeouts: self.timeouts.into(),
            weights: self.weights,
            ..Default::default()
        }
    }

    /// What a boot with this plan would do, without running it
    pub fn overview(&self) -> Result<PlanOverview, ConfigError> {
        let resolver = self.build_resolver();
        Ok(PlanOverview {
            version: self.version.clone(),
            timeouts: self.timeouts,
            weights: self.weights,
            mode: self.mode,
            splash: self.splash.iter().map(|s| s.name.clone()).collect(),
            initialization_order: resolver.initialization_order()?,
            groups: resolver.parallel_groups()?,
            application: self.application.iter().map(|s| s.name.clone()).collect(),
        })
    }
}

/// Resolved view of a boot plan, printed by `--dry-run`
#[derive(Debug, Clone)]
pub struct PlanOverview {
    pub version: String,
    pub timeouts: TimeoutsConfig,
    pub weights: StageWeights,
    pub mode: ExecutionMode,
    pub splash: Vec<String>,
    pub initialization_order: Vec<String>,
    pub groups: Vec<Vec<String>>,
    pub application: Vec<String>,
}

impl std::fmt::Display for PlanOverview {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Boot Plan (version {})", self.version)?;
        writeln!(f, "=========")?;
        writeln!(f)?;

        let stages = [
            ("Stage 0 (splash)", self.timeouts.stage0, self.weights.stage0, &self.splash),
            ("Stage 2 (application)", self.timeouts.stage2, self.weights.stage2, &self.application),
        ];

        let (name, timeout, weight, steps) = stages[0];
        write_steps(f, name, timeout, weight, steps)?;

        writeln!(
            f,
            "Stage 1 (services): timeout {}ms, weight {}%, {:?} startup",
            self.timeouts.stage1, self.weights.stage1, self.mode
        )?;
        match self.mode {
            ExecutionMode::Parallel => {
                for (i, group) in self.groups.iter().enumerate() {
                    writeln!(f, "  Group {}: {}", i, group.join(", "))?;
                }
            }
            ExecutionMode::Sequential => {
                for (i, name) in self.initialization_order.iter().enumerate() {
                    writeln!(f, "  {}. {}", i + 1, name)?;
                }
            }
        }
        writeln!(f)?;

        let (name, timeout, weight, steps) = stages[1];
        write_steps(f, name, timeout, weight, steps)
    }
}

fn write_steps(
    f: &mut std::fmt::Formatter<'_>,
    name: &str,
    timeout_ms: u64,
    weight: u8,
    steps: &[String],
) -> std::fmt::Result {
    writeln!(f, "{}: timeout {}ms, weight {}%", name, timeout_ms, weight)?;
    for step in steps {
        writeln!(f, "  - {}", step)?;
    }
    writeln!(f)
}

/// Errors that can occur when loading a boot plan
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read boot plan '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse boot plan: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid progress weights: {0}")]
    Weights(#[from] ProgressError),

    #[error("Invalid service graph: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PLAN: &str = r#"
version: "1.0"
timeouts:
  stage1: 30000
mode: parallel
splash:
  - name: "Loading configuration"
    duration_ms: 20
services:
  configuration: {}
  logging:
    depends_on: [configuration]
  cache:
    depends_on: [configuration]
    duration_ms: 40
  database:
    depends_on: [logging, cache]
application:
  - name: "Applying theme"
"#;

    #[test]
    fn test_parse_boot_plan() {
        let plan = BootPlan::from_yaml(PLAN).unwrap();
        assert_eq!(plan.services.len(), 4);
        assert_eq!(plan.timeouts.stage0, 10_000);
        assert_eq!(plan.timeouts.stage1, 30_000);
        assert_eq!(plan.weights, StageWeights::default());
        assert_eq!(plan.splash[0].duration_ms, 20);
        assert!(!plan.application[0].fail);
    }

    #[test]
    fn test_overview_lists_groups() {
        let overview = BootPlan::from_yaml(PLAN).unwrap().overview().unwrap();
        assert_eq!(
            overview.groups,
            vec![
                vec!["configuration".to_string()],
                vec!["logging".to_string(), "cache".to_string()],
                vec!["database".to_string()],
            ]
        );

        let printed = overview.to_string();
        assert!(printed.contains("Group 1: logging, cache"));
        assert!(printed.contains("Stage 1 (services): timeout 30000ms"));
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let yaml = r#"
services:
  database:
    depends_on: [network]
"#;
        let err = BootPlan::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("unknown service 'network'"));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let yaml = r#"
services:
  a:
    depends_on: [b]
  b:
    depends_on: [a]
"#;
        assert!(matches!(
            BootPlan::from_yaml(yaml),
            Err(ConfigError::Dependency(DependencyError::CyclicDependency(_)))
        ));
    }

    #[test]
    fn test_invalid_weights_and_timeouts() {
        let weights = "weights: { stage0: 10, stage1: 10, stage2: 10 }";
        assert!(matches!(
            BootPlan::from_yaml(weights),
            Err(ConfigError::Weights(ProgressError::InvalidWeights(30)))
        ));

        let timeouts = "timeouts: { stage2: 0 }";
        assert!(matches!(
            BootPlan::from_yaml(timeouts),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let yaml = r#"
services:
  cache:
    dependson: [configuration]
"#;
        assert!(matches!(
            BootPlan::from_yaml(yaml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PLAN.as_bytes()).unwrap();

        let plan = BootPlan::from_file(file.path()).unwrap();
        assert_eq!(plan.mode, ExecutionMode::Parallel);

        let config = plan.orchestrator_config();
        assert_eq!(config.timeouts.stage1, Duration::from_secs(30));
    }

    #[test]
    fn test_missing_file() {
        let err = BootPlan::from_file("does/not/exist.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
