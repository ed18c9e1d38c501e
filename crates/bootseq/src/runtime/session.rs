//! Boot session records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of a boot attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootStatus {
    InProgress,
    Success,
    Failed,
    Cancelled,
}

impl BootStatus {
    /// Whether the status is final
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BootStatus::InProgress)
    }
}

impl std::fmt::Display for BootStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BootStatus::InProgress => "in progress",
            BootStatus::Success => "success",
            BootStatus::Failed => "failed",
            BootStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Timing and outcome of one service initializer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInitResult {
    pub service_name: String,
    pub duration_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
}

impl ServiceInitResult {
    pub fn succeeded(service_name: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            service_name: service_name.into(),
            duration_ms,
            success: true,
            error_message: None,
        }
    }

    pub fn failed(
        service_name: impl Into<String>,
        duration_ms: u64,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            duration_ms,
            success: false,
            error_message: Some(error_message.into()),
        }
    }
}

/// Per-stage timing and last reported status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub stage_number: u8,
    pub stage_name: String,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Progress within the stage (0-100)
    pub progress_percentage: u8,
    pub status_message: String,
    pub success: bool,
    pub error_message: Option<String>,
}

impl StageMetrics {
    pub(crate) fn started(stage_number: u8, stage_name: &str) -> Self {
        Self {
            stage_number,
            stage_name: stage_name.to_string(),
            start_timestamp: Utc::now(),
            end_timestamp: None,
            duration_ms: None,
            progress_percentage: 0,
            status_message: String::new(),
            success: false,
            error_message: None,
        }
    }
}

/// Record of one end-to-end boot attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSession {
    pub session_id: Uuid,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub stage0_duration_ms: u64,
    pub stage1_duration_ms: Option<u64>,
    pub stage2_duration_ms: Option<u64>,
    pub total_duration_ms: Option<u64>,
    pub status: BootStatus,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    pub memory_usage_mb: u64,
    /// Operating system and architecture
    pub platform_info: String,
    pub app_version: String,
    pub stage_metrics: Vec<StageMetrics>,
    pub service_metrics: Vec<ServiceInitResult>,
}

impl BootSession {
    pub(crate) fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            start_timestamp: Utc::now(),
            end_timestamp: None,
            stage0_duration_ms: 0,
            stage1_duration_ms: None,
            stage2_duration_ms: None,
            total_duration_ms: None,
            status: BootStatus::InProgress,
            error_message: None,
            error_details: None,
            memory_usage_mb: 0,
            platform_info: format!("{} ({})", std::env::consts::OS, std::env::consts::ARCH),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            stage_metrics: Vec::new(),
            service_metrics: Vec::new(),
        }
    }

    /// Sum of the recorded stage durations; stages that never ran count as zero
    pub fn stage_duration_sum(&self) -> u64 {
        self.stage0_duration_ms
            + self.stage1_duration_ms.unwrap_or(0)
            + self.stage2_duration_ms.unwrap_or(0)
    }

    pub(crate) fn set_stage_duration(&mut self, stage: u8, duration_ms: u64) {
        match stage {
            0 => self.stage0_duration_ms = duration_ms,
            1 => self.stage1_duration_ms = Some(duration_ms),
            2 => self.stage2_duration_ms = Some(duration_ms),
            _ => log::warn!("Ignoring duration for unknown stage {}", stage),
        }
    }

    pub(crate) fn stage_metrics_mut(&mut self, stage: u8) -> Option<&mut StageMetrics> {
        self.stage_metrics
            .iter_mut()
            .find(|m| m.stage_number == stage)
    }

    /// Stage-by-stage breakdown of a finished session.
    ///
    /// Returns `None` while the boot is still in progress.
    pub fn timeline(&self) -> Option<BootTimeline> {
        if !self.status.is_terminal() {
            return None;
        }

        let stages = (0..3u8)
            .map(|number| match self.stage_metrics.iter().find(|m| m.stage_number == number) {
                Some(metrics) => StageInfo {
                    stage_number: number,
                    stage_name: metrics.stage_name.clone(),
                    duration_ms: metrics.duration_ms.unwrap_or(0),
                    success: metrics.success,
                    error_message: metrics.error_message.clone(),
                },
                None => StageInfo {
                    stage_number: number,
                    stage_name: String::new(),
                    duration_ms: 0,
                    success: false,
                    error_message: None,
                },
            })
            .collect();

        Some(BootTimeline {
            boot_start_time: self.start_timestamp,
            stages,
            service_timings: self.service_metrics.clone(),
            total_boot_time_ms: self.total_duration_ms.unwrap_or(0),
        })
    }
}

/// Summary of one stage inside a [`BootTimeline`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageInfo {
    pub stage_number: u8,
    pub stage_name: String,
    pub duration_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Stage breakdown of a finished boot, for diagnostics export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootTimeline {
    pub boot_start_time: DateTime<Utc>,
    pub stages: Vec<StageInfo>,
    pub service_timings: Vec<ServiceInitResult>,
    pub total_boot_time_ms: u64,
}

impl BootTimeline {
    /// Total boot time matches the sum of the stage durations (1ms tolerance)
    pub fn is_valid(&self) -> bool {
        let sum: u64 = self.stages.iter().map(|s| s.duration_ms).sum();
        sum.abs_diff(self.total_boot_time_ms) <= 1
    }
}
