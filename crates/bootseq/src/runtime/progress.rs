//! Stage-weighted boot progress and time-remaining estimates

use serde::{Deserialize, Serialize};

/// Share of the overall progress bar owned by each stage.
///
/// The three weights must add up to 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageWeights {
    pub stage0: u8,
    pub stage1: u8,
    pub stage2: u8,
}

impl Default for StageWeights {
    fn default() -> Self {
        Self {
            stage0: 10,
            stage1: 65,
            stage2: 25,
        }
    }
}

impl StageWeights {
    /// Build a validated weight distribution
    pub fn new(stage0: u8, stage1: u8, stage2: u8) -> Result<Self, ProgressError> {
        let weights = Self {
            stage0,
            stage1,
            stage2,
        };
        weights.validate()?;
        Ok(weights)
    }

    /// Check that the weights sum to 100
    pub fn validate(&self) -> Result<(), ProgressError> {
        let total = u32::from(self.stage0) + u32::from(self.stage1) + u32::from(self.stage2);
        if total == 100 {
            Ok(())
        } else {
            Err(ProgressError::InvalidWeights(total))
        }
    }
}

/// A progress update published while the boot runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage_number: u8,
    pub stage_name: String,
    /// Overall boot progress (0-100)
    pub overall_percentage: u8,
    pub status_message: String,
}

/// Maps (stage, progress within stage) onto the overall 0-100 scale
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressCalculator {
    weights: StageWeights,
}

impl ProgressCalculator {
    /// Create a calculator for the given weights
    pub fn new(weights: StageWeights) -> Result<Self, ProgressError> {
        weights.validate()?;
        Ok(Self { weights })
    }

    pub fn weights(&self) -> StageWeights {
        self.weights
    }

    /// Overall boot progress for `stage_progress` percent through `stage`.
    ///
    /// Unknown stages are treated as stage 0 and the stage progress is
    /// clamped to 0-100.
    pub fn calculate_progress(&self, stage: u8, stage_progress: i32) -> u8 {
        let stage = if stage > 2 {
            log::warn!("Invalid stage number: {}. Defaulting to 0", stage);
            0
        } else {
            stage
        };

        if !(0..=100).contains(&stage_progress) {
            log::warn!(
                "Invalid stage progress: {}. Clamping to 0-100",
                stage_progress
            );
        }
        let stage_progress = stage_progress.clamp(0, 100) as u32;

        let (start, end) = self.stage_range(stage);
        let span = u32::from(end - start);
        let overall = u32::from(start) + stage_progress * span / 100;
        overall.min(100) as u8
    }

    /// Overall range `(start, end)` covered by a stage; `(0, 0)` if unknown
    pub fn stage_range(&self, stage: u8) -> (u8, u8) {
        let w = self.weights;
        match stage {
            0 => (0, w.stage0),
            1 => (w.stage0, w.stage0 + w.stage1),
            2 => (w.stage0 + w.stage1, 100),
            _ => (0, 0),
        }
    }

    /// Linear projection of the time left, in milliseconds.
    ///
    /// `None` when there is not enough data yet.
    pub fn estimate_time_remaining(&self, current_progress: i32, elapsed_ms: i64) -> Option<u64> {
        if current_progress <= 0 || elapsed_ms <= 0 {
            return None;
        }
        if current_progress >= 100 {
            return Some(0);
        }

        let total_estimated_ms = (100.0 / f64::from(current_progress) * elapsed_ms as f64) as i64;
        Some(total_estimated_ms.saturating_sub(elapsed_ms).max(0) as u64)
    }

    /// Human-readable time remaining, empty when there is nothing to show
    pub fn format_time_remaining(&self, remaining_ms: Option<u64>) -> String {
        let Some(remaining_ms) = remaining_ms.filter(|ms| *ms > 0) else {
            return String::new();
        };

        let total_seconds = remaining_ms / 1000;
        if total_seconds < 5 {
            "A few seconds...".to_string()
        } else if total_seconds < 60 {
            format!("About {} seconds...", total_seconds)
        } else {
            let minutes = total_seconds / 60;
            format!(
                "About {} minute{}...",
                minutes,
                if minutes > 1 { "s" } else { "" }
            )
        }
    }
}

/// Errors in progress configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgressError {
    #[error("Stage weights must sum to 100 (got {0})")]
    InvalidWeights(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> ProgressCalculator {
        ProgressCalculator::default()
    }

    #[test]
    fn test_stage_boundaries() {
        let calc = calculator();
        assert_eq!(calc.calculate_progress(1, 0), 10);
        assert_eq!(calc.calculate_progress(1, 100), 75);
        assert_eq!(calc.calculate_progress(2, 100), 100);
        assert_eq!(calc.calculate_progress(0, 50), 5);
        assert_eq!(calc.calculate_progress(0, 0), 0);
    }

    #[test]
    fn test_interpolation_truncates() {
        // 50% of a 65-point span is 32.5
        assert_eq!(calculator().calculate_progress(1, 50), 42);
    }

    #[test]
    fn test_out_of_range_inputs() {
        let calc = calculator();
        assert_eq!(calc.calculate_progress(1, 150), 75);
        assert_eq!(calc.calculate_progress(1, -20), 10);
        assert_eq!(calc.calculate_progress(7, 50), 5);
    }

    #[test]
    fn test_stage_ranges() {
        let calc = calculator();
        assert_eq!(calc.stage_range(0), (0, 10));
        assert_eq!(calc.stage_range(1), (10, 75));
        assert_eq!(calc.stage_range(2), (75, 100));
        assert_eq!(calc.stage_range(3), (0, 0));
    }

    #[test]
    fn test_custom_weights() {
        let calc = ProgressCalculator::new(StageWeights::new(20, 40, 40).unwrap()).unwrap();
        assert_eq!(calc.stage_range(1), (20, 60));
        assert_eq!(calc.calculate_progress(1, 50), 40);
        assert_eq!(calc.calculate_progress(2, 50), 80);
    }

    #[test]
    fn test_weights_must_sum_to_100() {
        assert_eq!(
            StageWeights::new(10, 60, 20),
            Err(ProgressError::InvalidWeights(90))
        );
        let bad = StageWeights {
            stage0: 50,
            stage1: 50,
            stage2: 50,
        };
        assert!(ProgressCalculator::new(bad).is_err());
    }

    #[test]
    fn test_estimate_time_remaining() {
        let calc = calculator();
        assert_eq!(calc.estimate_time_remaining(50, 1000), Some(1000));
        assert_eq!(calc.estimate_time_remaining(0, 1000), None);
        assert_eq!(calc.estimate_time_remaining(25, 0), None);
        assert_eq!(calc.estimate_time_remaining(100, 5000), Some(0));
        assert_eq!(calc.estimate_time_remaining(25, 1000), Some(3000));
    }

    #[test]
    fn test_format_time_remaining() {
        let calc = calculator();
        assert_eq!(calc.format_time_remaining(None), "");
        assert_eq!(calc.format_time_remaining(Some(0)), "");
        assert_eq!(calc.format_time_remaining(Some(3_000)), "A few seconds...");
        assert_eq!(calc.format_time_remaining(Some(42_000)), "About 42 seconds...");
        assert_eq!(calc.format_time_remaining(Some(60_000)), "About 1 minute...");
        assert_eq!(calc.format_time_remaining(Some(185_000)), "About 3 minutes...");
    }
}
