//! Maps tool-native records onto canonical findings and candidate assets.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use vigil_model::{Asset, ScanId, ScanModule, asset::normalize_value};

use crate::adapter::{Capability, NativeRecord};
use crate::error::Result;
use crate::orchestration::events::{EngineEvent, EngineEventPayload, EngineEventPublisher};
use crate::store::{FindingUpsert, RecordStore, UpsertOutcome};

pub mod fingerprint;

pub use fingerprint::{FINGERPRINT_VERSION, canonical_json, fingerprint};

/// Result of normalizing one scan's records.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub findings: Vec<UpsertOutcome>,
    /// Normalized host values, in first-seen order, without duplicates.
    pub candidates: Vec<String>,
    /// Records the adapter's capability set does not allow, or hosts that did
    /// not normalize.
    pub dropped: usize,
}

#[derive(Clone)]
pub struct Normalizer {
    store: Arc<dyn RecordStore>,
    events: Arc<dyn EngineEventPublisher>,
}

impl fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Normalizer").finish_non_exhaustive()
    }
}

impl Normalizer {
    pub fn new(store: Arc<dyn RecordStore>, events: Arc<dyn EngineEventPublisher>) -> Self {
        Self { store, events }
    }

    pub async fn normalize(
        &self,
        asset: &Asset,
        module: &ScanModule,
        scan_id: ScanId,
        capability: Capability,
        records: Vec<NativeRecord>,
    ) -> Result<NormalizedBatch> {
        let mut batch = NormalizedBatch::default();
        let mut seen_fingerprints = HashSet::new();
        let mut seen_hosts = HashSet::new();
        let observed_at = Utc::now();

        for record in records {
            match record {
                NativeRecord::Observation(obs) if capability.produces_findings() => {
                    let fp = fingerprint(asset, &module.id, &obs.title, &obs.signature);
                    // One scan observing the same thing twice counts once.
                    if !seen_fingerprints.insert(fp.clone()) {
                        continue;
                    }
                    let outcome = self
                        .store
                        .upsert_finding(FindingUpsert {
                            asset_id: asset.id,
                            module_id: module.id.clone(),
                            fingerprint: fp,
                            severity: obs.severity,
                            title: obs.title,
                            evidence: obs.evidence,
                            scan_id,
                            observed_at,
                        })
                        .await?;
                    tracing::debug!(
                        target: "scan::normalize",
                        scan_id = %scan_id,
                        finding = %outcome.finding.id,
                        created = outcome.created,
                        occurrences = outcome.finding.occurrence_count,
                        "finding upserted"
                    );
                    let _ = self
                        .events
                        .publish(EngineEvent::new(EngineEventPayload::FindingRecorded {
                            finding_id: outcome.finding.id,
                            scan_id,
                            severity: outcome.finding.severity,
                            created: outcome.created,
                        }))
                        .await;
                    batch.findings.push(outcome);
                }
                NativeRecord::Host(raw) if capability.produces_assets() => {
                    match normalize_value(&raw) {
                        Ok(host) => {
                            if seen_hosts.insert(host.clone()) {
                                batch.candidates.push(host);
                            }
                        }
                        Err(err) => {
                            tracing::debug!(target: "scan::normalize", scan_id = %scan_id, "dropping host: {err}");
                            batch.dropped += 1;
                        }
                    }
                }
                _ => {
                    batch.dropped += 1;
                }
            }
        }

        if batch.dropped > 0 {
            tracing::warn!(
                target: "scan::normalize",
                scan_id = %scan_id,
                module = %module.id,
                dropped = batch.dropped,
                "records outside adapter capabilities were dropped"
            );
        }

        self.store.touch_asset(asset.id, observed_at).await?;
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Observation;
    use crate::orchestration::runtime::InProcEventBus;
    use crate::store::InMemoryRecordStore;
    use serde_json::json;
    use std::collections::BTreeMap;
    use vigil_model::{AssetKind, Severity};

    fn observation(port: u16) -> NativeRecord {
        let mut signature = BTreeMap::new();
        signature.insert("port".into(), json!(port));
        NativeRecord::Observation(Observation {
            title: format!("Open Port {port}/tcp - ssh"),
            severity: Severity::Low,
            signature,
            evidence: json!({ "line": "x" }),
        })
    }

    async fn setup() -> (Normalizer, Arc<InMemoryRecordStore>, Asset) {
        let store = Arc::new(InMemoryRecordStore::new());
        let asset = Asset::new(AssetKind::Domain, "example.com".into(), None, None, 0);
        store.insert_asset(&asset).await.unwrap();
        let normalizer = Normalizer::new(store.clone(), Arc::new(InProcEventBus::new(16)));
        (normalizer, store, asset)
    }

    #[tokio::test]
    async fn duplicate_records_in_one_run_count_once() {
        let (normalizer, store, asset) = setup().await;
        let module = ScanModule::new("nmap", "nmap");
        let batch = normalizer
            .normalize(
                &asset,
                &module,
                ScanId::new(),
                Capability::Findings,
                vec![observation(22), observation(22), observation(80)],
            )
            .await
            .unwrap();
        assert_eq!(batch.findings.len(), 2);
        assert_eq!(store.finding_count(), 2);
    }

    #[tokio::test]
    async fn capability_gates_record_kinds() {
        let (normalizer, store, asset) = setup().await;
        let module = ScanModule::new("subfinder", "subfinder");
        let batch = normalizer
            .normalize(
                &asset,
                &module,
                ScanId::new(),
                Capability::Assets,
                vec![
                    NativeRecord::Host("API.example.com".into()),
                    NativeRecord::Host("api.example.com.".into()),
                    observation(22),
                ],
            )
            .await
            .unwrap();
        assert_eq!(batch.candidates, vec!["api.example.com".to_string()]);
        assert_eq!(batch.dropped, 1);
        assert_eq!(store.finding_count(), 0);
    }
}
