use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::ids::{AssetId, ModuleId, ScanId, ScheduleId};

/// Priority lanes; P0 is served first.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ScanPriority {
    P0 = 0,
    P1 = 1,
    #[default]
    P2 = 2,
    P3 = 3,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: ScanStatus) -> bool {
        matches!(
            (self, next),
            (ScanStatus::Queued, ScanStatus::Running)
                | (ScanStatus::Queued, ScanStatus::Cancelled)
                | (ScanStatus::Running, ScanStatus::Completed)
                | (ScanStatus::Running, ScanStatus::Failed)
                | (ScanStatus::Running, ScanStatus::Cancelled)
        )
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScanStatus::Queued => "queued",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Recurring scans carry the schedule epoch so that enqueue is idempotent per
/// `(asset, module, epoch)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    OneOff,
    Recurring { schedule: ScheduleId, epoch: u64 },
}

/// Why a scan was requested.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum ScanOrigin {
    User,
    Schedule,
    Discovery { parent_scan: ScanId },
    Retry { previous: ScanId },
}

/// Classified failure recorded on a terminal scan.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ExecutionTimeout,
    ToolNotFound,
    PermissionDenied,
    /// No records were recoverable from the tool output.
    ParseError,
    /// Tool exited non-zero without usable output.
    ToolExited,
    Configuration,
    Cancelled,
}

impl FailureKind {
    /// Transient failures are retried with backoff.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FailureKind::ExecutionTimeout | FailureKind::ParseError | FailureKind::ToolExited
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::ExecutionTimeout => "execution_timeout",
            FailureKind::ToolNotFound => "tool_not_found",
            FailureKind::PermissionDenied => "permission_denied",
            FailureKind::ParseError => "parse_error",
            FailureKind::ToolExited => "tool_exited",
            FailureKind::Configuration => "configuration",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// One scheduled or executed unit of work pairing an asset with a module.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: ScanId,
    pub asset_id: AssetId,
    pub module_id: ModuleId,
    /// Module definition version the scan was requested against.
    pub module_version: u32,
    pub priority: ScanPriority,
    pub schedule: ScheduleKind,
    pub origin: ScanOrigin,
    pub status: ScanStatus,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub cancel_requested: bool,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub output_excerpt: Option<String>,
    pub records_parsed: usize,
}

impl ScanRecord {
    pub fn new(
        asset_id: AssetId,
        module_id: ModuleId,
        module_version: u32,
        priority: ScanPriority,
        schedule: ScheduleKind,
        origin: ScanOrigin,
    ) -> Self {
        Self {
            id: ScanId::new(),
            asset_id,
            module_id,
            module_version,
            priority,
            schedule,
            origin,
            status: ScanStatus::Queued,
            requested_at: Utc::now(),
            started_at: None,
            ended_at: None,
            retry_count: 0,
            cancel_requested: false,
            failure: None,
            error: None,
            warnings: Vec::new(),
            output_excerpt: None,
            records_parsed: 0,
        }
    }

    /// Apply a state-machine transition, stamping start/end times.
    pub fn transition(&mut self, next: ScanStatus) -> Result<(), ModelError> {
        if !self.status.can_transition_to(next) {
            return Err(ModelError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == ScanStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    pub fn fail(&mut self, kind: FailureKind, error: impl Into<String>) -> Result<(), ModelError> {
        self.transition(ScanStatus::Failed)?;
        self.failure = Some(kind);
        self.error = Some(error.into());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall time between start and end, when both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ScanRecord {
        ScanRecord::new(
            AssetId::new(),
            ModuleId::from("nmap"),
            1,
            ScanPriority::P2,
            ScheduleKind::OneOff,
            ScanOrigin::User,
        )
    }

    #[test]
    fn queued_can_be_cancelled_directly() {
        let mut scan = record();
        scan.transition(ScanStatus::Cancelled).unwrap();
        assert!(scan.is_terminal());
        assert!(scan.started_at.is_none());
        assert!(scan.ended_at.is_some());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut scan = record();
        scan.transition(ScanStatus::Running).unwrap();
        scan.fail(FailureKind::ExecutionTimeout, "timed out").unwrap();
        let err = scan.transition(ScanStatus::Running).unwrap_err();
        assert_eq!(
            err,
            ModelError::InvalidTransition {
                from: ScanStatus::Failed,
                to: ScanStatus::Running
            }
        );
        assert!(scan.transition(ScanStatus::Completed).is_err());
    }

    #[test]
    fn queued_cannot_complete_without_running() {
        let mut scan = record();
        assert!(scan.transition(ScanStatus::Completed).is_err());
    }

    #[test]
    fn transient_classification() {
        assert!(FailureKind::ExecutionTimeout.is_transient());
        assert!(FailureKind::ParseError.is_transient());
        assert!(!FailureKind::ToolNotFound.is_transient());
        assert!(!FailureKind::PermissionDenied.is_transient());
        assert!(!FailureKind::Cancelled.is_transient());
    }

    #[test]
    fn priority_orders_p0_first() {
        assert!(ScanPriority::P0 < ScanPriority::P3);
    }
}
