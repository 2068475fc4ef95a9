//! Per-asset scan statistics.

use serde::{Deserialize, Serialize};
use vigil_model::{AssetId, ScanRecord, ScanStatus};

/// Scan history of one asset. Rates are percentages of all scans ever
/// requested for the asset; durations cover scans that both started and ended.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetScanSummary {
    pub asset_id: AssetId,
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub average_duration_secs: Option<f64>,
    pub std_dev_duration_secs: Option<f64>,
}

impl AssetScanSummary {
    pub fn from_scans(asset_id: AssetId, scans: &[ScanRecord]) -> Self {
        let mut summary = Self {
            asset_id,
            total: scans.len(),
            ..Default::default()
        };
        for scan in scans {
            match scan.status {
                ScanStatus::Queued => summary.queued += 1,
                ScanStatus::Running => summary.running += 1,
                ScanStatus::Completed => summary.completed += 1,
                ScanStatus::Failed => summary.failed += 1,
                ScanStatus::Cancelled => summary.cancelled += 1,
            }
        }
        if summary.total > 0 {
            summary.success_rate = summary.completed as f64 / summary.total as f64 * 100.0;
            summary.failure_rate = summary.failed as f64 / summary.total as f64 * 100.0;
        }

        let durations: Vec<f64> = scans
            .iter()
            .filter_map(ScanRecord::duration)
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .collect();
        if !durations.is_empty() {
            let n = durations.len() as f64;
            let mean = durations.iter().sum::<f64>() / n;
            let variance = durations.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;
            summary.average_duration_secs = Some(mean);
            summary.std_dev_duration_secs = Some(variance.sqrt());
        }
        summary
    }
}
