//! Batch progress events and time estimates.

use crate::models::BatchMode;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    BatchStarted {
        total: usize,
        mode: BatchMode,
    },
    ImageStarted {
        index: usize,
        total: usize,
        snapshot: ProgressSnapshot,
    },
    ImageSkipped {
        index: usize,
        name: String,
        reason: String,
    },
    ImageCompleted {
        index: usize,
        name: String,
        recorded: bool,
    },
    Rendering {
        records: usize,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressSnapshot {
    pub fraction: f32,
    pub elapsed_secs: f64,
    pub elapsed: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_secs: Option<f64>,
    pub remaining: String,
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Sink used by the synchronous endpoint: progress only goes to the log.
pub struct TracingProgress {
    pub user: String,
}

impl ProgressSink for TracingProgress {
    fn on_event(&self, event: ProgressEvent) {
        debug!(target = "appraisal.pipeline", user = %self.user, ?event, "batch_progress");
    }
}

/// Progress for image `index` (1-based) of `total` after `elapsed`.
///
/// The remaining estimate uses the average time of the images already
/// finished, so it is only available from the second image on.
pub fn snapshot(index: usize, total: usize, elapsed: Duration) -> ProgressSnapshot {
    let elapsed_secs = elapsed.as_secs_f64();
    let fraction = if total == 0 {
        0.0
    } else {
        (index.min(total) as f32) / (total as f32)
    };
    let remaining_secs = if index > 1 {
        let average = elapsed_secs / (index - 1) as f64;
        Some(average * (total.saturating_sub(index) + 1) as f64)
    } else {
        None
    };
    ProgressSnapshot {
        fraction,
        elapsed_secs,
        elapsed: format_hms(elapsed_secs),
        remaining: remaining_secs
            .map(format_hms)
            .unwrap_or_else(|| "Calculating...".to_string()),
        remaining_secs,
    }
}

pub fn format_hms(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "00:00:00".to_string();
    }
    let total = seconds as u64;
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_hours_minutes_seconds() {
        assert_eq!(format_hms(0.0), "00:00:00");
        assert_eq!(format_hms(59.9), "00:00:59");
        assert_eq!(format_hms(3725.0), "01:02:05");
        assert_eq!(format_hms(f64::NAN), "00:00:00");
        assert_eq!(format_hms(-4.0), "00:00:00");
    }

    #[test]
    fn first_image_has_no_estimate() {
        let snap = snapshot(1, 4, Duration::from_secs(0));
        assert_eq!(snap.remaining_secs, None);
        assert_eq!(snap.remaining, "Calculating...");
        assert!((snap.fraction - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn estimate_uses_running_average() {
        // two images finished in 20s, image 3 of 5 starting: 10s * 3 left
        let snap = snapshot(3, 5, Duration::from_secs(20));
        assert_eq!(snap.remaining_secs, Some(30.0));
        assert_eq!(snap.remaining, "00:00:30");
        assert_eq!(snap.elapsed, "00:00:20");
    }
}
