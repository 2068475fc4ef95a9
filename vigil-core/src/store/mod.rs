//! Durable record store port.
//!
//! The engine persists every entity through [`RecordStore`]. Each call is one
//! single-entity write; the store is expected to make that write atomic. The
//! in-memory implementation backs tests and the default daemon.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use vigil_model::{
    Asset, AssetId, DiscoveryEdge, Finding, FindingFilter, FindingId, ModuleId, ScanId, ScanRecord,
    Severity,
};

use crate::error::Result;

pub mod memory;

pub use memory::InMemoryRecordStore;

/// Observation ready to be merged into the finding table.
#[derive(Clone, Debug, PartialEq)]
pub struct FindingUpsert {
    pub asset_id: AssetId,
    pub module_id: ModuleId,
    pub fingerprint: String,
    pub severity: Severity,
    pub title: String,
    pub evidence: Value,
    pub scan_id: ScanId,
    pub observed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpsertOutcome {
    pub finding: Finding,
    pub created: bool,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_asset(&self, asset: &Asset) -> Result<()>;
    async fn touch_asset(&self, id: AssetId, seen_at: DateTime<Utc>) -> Result<()>;
    async fn get_asset(&self, id: AssetId) -> Result<Option<Asset>>;
    async fn list_assets(&self) -> Result<Vec<Asset>>;

    /// Insert or overwrite a scan record.
    async fn put_scan(&self, scan: &ScanRecord) -> Result<()>;
    async fn get_scan(&self, id: ScanId) -> Result<Option<ScanRecord>>;
    async fn scans_for_asset(&self, asset: AssetId) -> Result<Vec<ScanRecord>>;

    /// Insert a new finding or bump `last_seen`/`occurrence_count` of the
    /// existing one with the same `(asset, module, fingerprint)`. Writes to the
    /// same key are serialized.
    async fn upsert_finding(&self, upsert: FindingUpsert) -> Result<UpsertOutcome>;

    /// Findings matching `filter` ordered by id, strictly after `after`.
    async fn list_findings(
        &self,
        filter: &FindingFilter,
        after: Option<FindingId>,
        limit: usize,
    ) -> Result<Vec<Finding>>;

    async fn insert_edge(&self, edge: &DiscoveryEdge) -> Result<()>;
    async fn list_edges(&self) -> Result<Vec<DiscoveryEdge>>;
}
