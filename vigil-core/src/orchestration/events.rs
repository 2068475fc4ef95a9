use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vigil_model::{
    AssetId, FailureKind, FindingId, ModuleId, ScanId, ScanPriority, ScanStatus, Severity,
};

use crate::error::Result;

/// Metadata envelope attached to every engine event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub event_id: Uuid,
    pub emitted_at: DateTime<Utc>,
}

impl Default for EventMeta {
    fn default() -> Self {
        Self {
            version: 1,
            event_id: Uuid::now_v7(),
            emitted_at: Utc::now(),
        }
    }
}

/// Why discovery did not schedule follow-up scans for an asset.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    DepthExceeded,
    BudgetExhausted,
    ModuleDisabled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EngineEventPayload {
    ScanEnqueued {
        scan_id: ScanId,
        asset_id: AssetId,
        module_id: ModuleId,
        priority: ScanPriority,
    },
    /// Enqueue collapsed into work already pending or running.
    ScanMerged {
        existing_scan_id: ScanId,
        asset_id: AssetId,
        module_id: ModuleId,
    },
    ScanStarted {
        scan_id: ScanId,
        module_id: ModuleId,
    },
    ScanFinished {
        scan_id: ScanId,
        status: ScanStatus,
        failure: Option<FailureKind>,
        warnings: usize,
    },
    RetryScheduled {
        previous_scan_id: ScanId,
        scan_id: ScanId,
        retry_count: u32,
        delay_ms: u64,
    },
    FindingRecorded {
        finding_id: FindingId,
        scan_id: ScanId,
        severity: Severity,
        created: bool,
    },
    AssetRegistered {
        asset_id: AssetId,
        value: String,
        depth: u32,
        discovered_by: Option<ScanId>,
    },
    DiscoveryScheduled {
        parent_scan_id: ScanId,
        asset_id: AssetId,
        module_id: ModuleId,
        scan_id: ScanId,
    },
    DiscoverySuppressed {
        parent_scan_id: ScanId,
        asset_id: AssetId,
        reason: SuppressionReason,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineEvent {
    pub meta: EventMeta,
    pub payload: EngineEventPayload,
}

impl EngineEvent {
    pub fn new(payload: EngineEventPayload) -> Self {
        Self {
            meta: EventMeta::default(),
            payload,
        }
    }
}

impl From<EngineEventPayload> for EngineEvent {
    fn from(payload: EngineEventPayload) -> Self {
        Self::new(payload)
    }
}

#[async_trait]
pub trait EngineEventPublisher: Send + Sync {
    async fn publish(&self, event: EngineEvent) -> Result<()>;
}
