//! Divergence detection and the recovery banner offered to the user.
//!
//! Divergence never discards local edits. It only tells the host to offer
//! reload, a read-only fallback, or a diagnostics export.

use serde::Serialize;

/// Consecutive failures tolerated before divergence is declared.
pub const DEFAULT_DIVERGENCE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Reload,
    ReadOnly,
    ExportDiagnostics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DivergenceReason {
    /// Full integrity scans keep failing.
    RepeatedScanFailure { consecutive: u32 },
    /// Frontier reconciliation with the server is not converging.
    FrontierNonConvergence { attempts: u32 },
}

/// Non-destructive banner content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DivergenceBanner {
    pub reason: DivergenceReason,
    pub actions: Vec<RecoveryAction>,
}

impl DivergenceBanner {
    pub fn new(reason: DivergenceReason) -> Self {
        Self {
            reason,
            actions: vec![
                RecoveryAction::Reload,
                RecoveryAction::ReadOnly,
                RecoveryAction::ExportDiagnostics,
            ],
        }
    }
}

/// Counts consecutive failures of one kind of check.
#[derive(Debug, Clone)]
pub struct DivergenceTracker {
    threshold: u32,
    consecutive: u32,
}

impl Default for DivergenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_DIVERGENCE_THRESHOLD)
    }
}

impl DivergenceTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    /// Record an outcome. Returns the failure streak once it reaches the threshold.
    pub fn record(&mut self, ok: bool) -> Option<u32> {
        if ok {
            self.consecutive = 0;
            return None;
        }
        self.consecutive += 1;
        (self.consecutive >= self.threshold).then_some(self.consecutive)
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn is_diverged(&self) -> bool {
        self.consecutive >= self.threshold
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_reached_after_consecutive_failures() {
        let mut tracker = DivergenceTracker::new(3);
        assert_eq!(tracker.record(false), None);
        assert_eq!(tracker.record(false), None);
        assert_eq!(tracker.record(false), Some(3));
        assert!(tracker.is_diverged());
    }

    #[test]
    fn test_success_resets_streak() {
        let mut tracker = DivergenceTracker::new(2);
        tracker.record(false);
        tracker.record(true);
        assert_eq!(tracker.record(false), None);
        assert_eq!(tracker.consecutive(), 1);
    }

    #[test]
    fn test_banner_offers_all_actions() {
        let banner = DivergenceBanner::new(DivergenceReason::RepeatedScanFailure { consecutive: 3 });
        assert_eq!(banner.actions.len(), 3);
        let json = serde_json::to_string(&banner).unwrap();
        assert!(json.contains("\"kind\":\"repeated_scan_failure\""));
        assert!(json.contains("\"export_diagnostics\""));
    }
}
