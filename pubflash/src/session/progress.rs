//! Flash progress projection.

use std::fmt;

/// Phase of a flash attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum FlashStatus {
    /// No attempt running.
    #[default]
    Idle,
    /// Re-entering the bootloader.
    Connecting,
    /// Erasing the whole flash.
    Erasing,
    /// Writing images.
    Flashing,
    /// Verifying written images. Not produced by the current sequence.
    Verifying,
    /// All images written and the device reset.
    Complete,
    /// The attempt failed.
    Error,
}

impl FlashStatus {
    /// Lowercase status name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Erasing => "erasing",
            Self::Flashing => "flashing",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for FlashStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable state of the current flash attempt.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashProgress {
    /// Current phase.
    pub status: FlashStatus,
    /// Overall progress, 0 to 100.
    pub progress: f64,
    /// Failure message when `status` is [`FlashStatus::Error`].
    pub error: Option<String>,
}

impl FlashProgress {
    /// A phase with the given progress.
    pub fn at(status: FlashStatus, progress: f64) -> Self {
        Self {
            status,
            progress,
            error: None,
        }
    }

    /// The failed state.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: FlashStatus::Error,
            progress: 0.0,
            error: Some(message.into()),
        }
    }
}

/// Overall percentage across `image_count` images.
///
/// `(image_index + written / total) / image_count * 100`, clamped to 0..=100.
pub fn overall_percent(image_index: usize, written: usize, total: usize, image_count: usize) -> f64 {
    if image_count == 0 {
        return 100.0;
    }
    let fraction = if total == 0 {
        1.0
    } else {
        (written as f64 / total as f64).clamp(0.0, 1.0)
    };
    ((image_index as f64 + fraction) / image_count as f64 * 100.0).clamp(0.0, 100.0)
}

/// Percentage of one image, rounded for display.
pub fn image_percent(written: usize, total: usize) -> u32 {
    if total == 0 {
        return 100;
    }
    ((written as f64 / total as f64).clamp(0.0, 1.0) * 100.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_percent_formula() {
        assert!((overall_percent(0, 0, 100, 3) - 0.0).abs() < f64::EPSILON);
        assert!((overall_percent(0, 50, 100, 3) - 100.0 / 6.0).abs() < 1e-9);
        assert!((overall_percent(1, 100, 100, 3) - 200.0 / 3.0).abs() < 1e-9);
        assert!((overall_percent(2, 100, 100, 3) - 100.0).abs() < 1e-9);
        assert!((overall_percent(0, 10, 10, 1) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_totals() {
        assert!((overall_percent(0, 0, 0, 2) - 50.0).abs() < 1e-9);
        assert!((overall_percent(5, 1, 1, 0) - 100.0).abs() < 1e-9);
        assert_eq!(image_percent(0, 0), 100);
        assert_eq!(image_percent(1, 3), 33);
    }

    #[test]
    fn test_failed_resets_progress() {
        let failed = FlashProgress::failed("write timeout");
        assert_eq!(failed.status, FlashStatus::Error);
        assert!(failed.progress.abs() < f64::EPSILON);
        assert_eq!(failed.error.as_deref(), Some("write timeout"));
        assert_eq!(FlashStatus::default().to_string(), "idle");
    }
}
