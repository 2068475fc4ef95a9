use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use vigil_model::{
    Asset, AssetId, DiscoveryEdge, Finding, FindingFilter, FindingId, ModuleId, ScanId, ScanRecord,
};

use super::{FindingUpsert, RecordStore, UpsertOutcome};
use crate::error::{EngineError, Result};

type FindingKey = (AssetId, ModuleId, String);

/// Process-local store. Finding upserts go through the dashmap entry API so
/// writers to one fingerprint are serialized on that shard while other keys
/// proceed independently.
#[derive(Default)]
pub struct InMemoryRecordStore {
    assets: DashMap<AssetId, Asset>,
    scans: DashMap<ScanId, ScanRecord>,
    findings: DashMap<FindingKey, Finding>,
    edges: Mutex<Vec<DiscoveryEdge>>,
}

impl fmt::Debug for InMemoryRecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRecordStore")
            .field("assets", &self.assets.len())
            .field("scans", &self.scans.len())
            .field("findings", &self.findings.len())
            .field("edges", &self.edges.lock().len())
            .finish()
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finding_count(&self) -> usize {
        self.findings.len()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert_asset(&self, asset: &Asset) -> Result<()> {
        self.assets.insert(asset.id, asset.clone());
        Ok(())
    }

    async fn touch_asset(&self, id: AssetId, seen_at: DateTime<Utc>) -> Result<()> {
        let mut asset = self
            .assets
            .get_mut(&id)
            .ok_or_else(|| EngineError::Store(format!("asset {id} not found")))?;
        if seen_at > asset.last_seen {
            asset.last_seen = seen_at;
        }
        Ok(())
    }

    async fn get_asset(&self, id: AssetId) -> Result<Option<Asset>> {
        Ok(self.assets.get(&id).map(|a| a.clone()))
    }

    async fn list_assets(&self) -> Result<Vec<Asset>> {
        let mut assets: Vec<Asset> = self.assets.iter().map(|a| a.clone()).collect();
        assets.sort_by_key(|a| a.id);
        Ok(assets)
    }

    async fn put_scan(&self, scan: &ScanRecord) -> Result<()> {
        self.scans.insert(scan.id, scan.clone());
        Ok(())
    }

    async fn get_scan(&self, id: ScanId) -> Result<Option<ScanRecord>> {
        Ok(self.scans.get(&id).map(|s| s.clone()))
    }

    async fn scans_for_asset(&self, asset: AssetId) -> Result<Vec<ScanRecord>> {
        let mut scans: Vec<ScanRecord> = self
            .scans
            .iter()
            .filter(|s| s.asset_id == asset)
            .map(|s| s.clone())
            .collect();
        scans.sort_by_key(|s| s.requested_at);
        Ok(scans)
    }

    async fn upsert_finding(&self, upsert: FindingUpsert) -> Result<UpsertOutcome> {
        let key = (
            upsert.asset_id,
            upsert.module_id.clone(),
            upsert.fingerprint.clone(),
        );
        match self.findings.entry(key) {
            Entry::Occupied(mut entry) => {
                let finding = entry.get_mut();
                if upsert.observed_at > finding.last_seen {
                    finding.last_seen = upsert.observed_at;
                }
                finding.occurrence_count += 1;
                finding.severity = upsert.severity;
                finding.evidence = upsert.evidence;
                finding.last_scan = Some(upsert.scan_id);
                Ok(UpsertOutcome {
                    finding: finding.clone(),
                    created: false,
                })
            }
            Entry::Vacant(entry) => {
                let finding = Finding {
                    id: FindingId::new(),
                    asset_id: upsert.asset_id,
                    module_id: upsert.module_id,
                    fingerprint: upsert.fingerprint,
                    severity: upsert.severity,
                    title: upsert.title,
                    evidence: upsert.evidence,
                    first_seen: upsert.observed_at,
                    last_seen: upsert.observed_at,
                    occurrence_count: 1,
                    last_scan: Some(upsert.scan_id),
                };
                entry.insert(finding.clone());
                Ok(UpsertOutcome {
                    finding,
                    created: true,
                })
            }
        }
    }

    async fn list_findings(
        &self,
        filter: &FindingFilter,
        after: Option<FindingId>,
        limit: usize,
    ) -> Result<Vec<Finding>> {
        let mut page: Vec<Finding> = self
            .findings
            .iter()
            .filter(|f| after.is_none_or(|cursor| f.id > cursor))
            .filter(|f| filter.matches(f))
            .map(|f| f.clone())
            .collect();
        page.sort_by_key(|f| f.id);
        page.truncate(limit);
        Ok(page)
    }

    async fn insert_edge(&self, edge: &DiscoveryEdge) -> Result<()> {
        self.edges.lock().push(edge.clone());
        Ok(())
    }

    async fn list_edges(&self) -> Result<Vec<DiscoveryEdge>> {
        Ok(self.edges.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use vigil_model::Severity;

    fn upsert(asset: AssetId, fingerprint: &str) -> FindingUpsert {
        FindingUpsert {
            asset_id: asset,
            module_id: ModuleId::from("nmap"),
            fingerprint: fingerprint.into(),
            severity: Severity::Low,
            title: "Open Port 22/tcp - ssh".into(),
            evidence: json!({}),
            scan_id: ScanId::new(),
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn repeated_upserts_increment_occurrences() {
        let store = InMemoryRecordStore::new();
        let asset = AssetId::new();
        let first = store.upsert_finding(upsert(asset, "fp")).await.unwrap();
        let second = store.upsert_finding(upsert(asset, "fp")).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(second.finding.id, first.finding.id);
        assert_eq!(second.finding.occurrence_count, 2);
        assert_eq!(second.finding.first_seen, first.finding.first_seen);
        assert_eq!(store.finding_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upserts_to_one_key_are_serialized() {
        let store = Arc::new(InMemoryRecordStore::new());
        let asset = AssetId::new();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.upsert_finding(upsert(asset, "same")).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let all = store
            .list_findings(&FindingFilter::default(), None, 100)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].occurrence_count, 32);
    }

    #[tokio::test]
    async fn listing_pages_by_id() {
        let store = InMemoryRecordStore::new();
        let asset = AssetId::new();
        for i in 0..5 {
            store
                .upsert_finding(upsert(asset, &format!("fp-{i}")))
                .await
                .unwrap();
        }
        let first = store
            .list_findings(&FindingFilter::default(), None, 3)
            .await
            .unwrap();
        let rest = store
            .list_findings(&FindingFilter::default(), first.last().map(|f| f.id), 3)
            .await
            .unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(rest.len(), 2);
        assert!(rest[0].id > first[2].id);
    }
}
