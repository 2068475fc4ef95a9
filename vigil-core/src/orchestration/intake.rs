//! Validated entry point for new scan requests and cancellations.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use vigil_model::{
    AssetId, ModuleId, ScanId, ScanOrigin, ScanPriority, ScanRecord, ScanStatus, ScheduleKind,
};

use super::catalog::ModuleCatalog;
use super::events::{EngineEvent, EngineEventPayload, EngineEventPublisher};
use super::lease::LeaseKey;
use super::scheduler::{CancelOutcome, EnqueueOutcome, ScanScheduler};
use crate::error::{EngineError, Result};
use crate::registry::AssetRegistry;
use crate::store::RecordStore;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanRequest {
    pub asset_id: AssetId,
    pub module_id: ModuleId,
    pub priority: ScanPriority,
    pub schedule: ScheduleKind,
    pub origin: ScanOrigin,
}

impl ScanRequest {
    pub fn one_off(asset_id: AssetId, module_id: ModuleId, priority: ScanPriority) -> Self {
        Self {
            asset_id,
            module_id,
            priority,
            schedule: ScheduleKind::OneOff,
            origin: ScanOrigin::User,
        }
    }
}

/// Validates requests, persists new scans and hands them to the scheduler.
///
/// Enqueue and cancel are serialized by `gate` so a scan record is always
/// persisted as queued before any worker can observe it, and a queued scan is
/// never withdrawn while its record is still being written.
pub struct ScanIntake {
    store: Arc<dyn RecordStore>,
    scheduler: ScanScheduler,
    catalog: Arc<ModuleCatalog>,
    registry: Arc<AssetRegistry>,
    events: Arc<dyn EngineEventPublisher>,
    gate: Mutex<()>,
}

impl fmt::Debug for ScanIntake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanIntake")
            .field("scheduler", &self.scheduler)
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

impl ScanIntake {
    pub fn new(
        store: Arc<dyn RecordStore>,
        scheduler: ScanScheduler,
        catalog: Arc<ModuleCatalog>,
        registry: Arc<AssetRegistry>,
        events: Arc<dyn EngineEventPublisher>,
    ) -> Self {
        Self {
            store,
            scheduler,
            catalog,
            registry,
            events,
            gate: Mutex::new(()),
        }
    }

    pub async fn submit(&self, request: ScanRequest) -> Result<EnqueueOutcome> {
        let asset = self.registry.get(request.asset_id).ok_or_else(|| {
            EngineError::InvalidReference(format!("unknown asset {}", request.asset_id))
        })?;
        let module = self.catalog.get(&request.module_id).ok_or_else(|| {
            EngineError::InvalidReference(format!("unknown module {}", request.module_id))
        })?;
        if !module.enabled {
            return Err(EngineError::ModuleDisabled(module.id));
        }
        if self.registry.is_ignored(&asset.value) {
            return Err(EngineError::InvalidReference(format!(
                "asset {} is on the ignore list",
                asset.value
            )));
        }

        let scan = ScanRecord::new(
            asset.id,
            module.id.clone(),
            module.version,
            request.priority,
            request.schedule,
            request.origin,
        );

        let _gate = self.gate.lock().await;
        let outcome = self.scheduler.enqueue_held(scan.clone());
        match outcome {
            EnqueueOutcome::Merged(existing) => {
                let _ = self
                    .events
                    .publish(EngineEvent::new(EngineEventPayload::ScanMerged {
                        existing_scan_id: existing,
                        asset_id: asset.id,
                        module_id: module.id,
                    }))
                    .await;
            }
            EnqueueOutcome::Accepted(scan_id) => {
                if let Err(err) = self.store.put_scan(&scan).await {
                    self.scheduler.withdraw(scan_id);
                    tracing::error!(target: "scan::queue", scan_id = %scan_id, "persisting scan failed: {err}");
                    return Err(err);
                }
                self.scheduler.commit(scan_id);
                tracing::info!(
                    target: "scan::queue",
                    scan_id = %scan_id,
                    asset = %asset.value,
                    module = %module.id,
                    priority = ?scan.priority,
                    origin = ?scan.origin,
                    "scan queued"
                );
                let _ = self
                    .events
                    .publish(EngineEvent::new(EngineEventPayload::ScanEnqueued {
                        scan_id,
                        asset_id: asset.id,
                        module_id: module.id,
                        priority: scan.priority,
                    }))
                    .await;
            }
        }
        Ok(outcome)
    }

    /// Retire `previous` and queue its retry in the same slot. The retry is
    /// persisted before it can be dispatched, and a cancel arriving meanwhile
    /// waits on the gate and then finds it queued.
    pub async fn requeue_retry(
        &self,
        previous: ScanId,
        key: &LeaseKey,
        retry: ScanRecord,
        delay: Duration,
    ) -> Result<()> {
        let _gate = self.gate.lock().await;
        let retry_id = retry.id;
        let retry_count = retry.retry_count;
        self.scheduler.finish(previous, key, Some((retry.clone(), delay)));
        if let Err(err) = self.store.put_scan(&retry).await {
            self.scheduler.withdraw(retry_id);
            tracing::error!(target: "scan::queue", scan_id = %retry_id, "persisting retry failed: {err}");
            return Err(err);
        }
        self.scheduler.commit(retry_id);
        tracing::info!(
            target: "scan::queue",
            scan_id = %previous,
            retry_scan_id = %retry_id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "transient failure, retry scheduled"
        );
        let _ = self
            .events
            .publish(EngineEvent::new(EngineEventPayload::RetryScheduled {
                previous_scan_id: previous,
                scan_id: retry_id,
                retry_count,
                delay_ms: delay.as_millis() as u64,
            }))
            .await;
        Ok(())
    }

    /// Cancel a queued or running scan. Returns the scan as last recorded.
    pub async fn cancel(&self, scan_id: ScanId) -> Result<ScanRecord> {
        let _gate = self.gate.lock().await;
        match self.scheduler.cancel(scan_id) {
            CancelOutcome::Dequeued(mut scan) => {
                scan.cancel_requested = true;
                scan.transition(ScanStatus::Cancelled)?;
                self.store.put_scan(&scan).await?;
                tracing::info!(target: "scan::queue", scan_id = %scan_id, "queued scan cancelled");
                let _ = self
                    .events
                    .publish(EngineEvent::new(EngineEventPayload::ScanFinished {
                        scan_id,
                        status: ScanStatus::Cancelled,
                        failure: None,
                        warnings: 0,
                    }))
                    .await;
                Ok(scan)
            }
            CancelOutcome::Signalled => {
                tracing::info!(target: "scan::queue", scan_id = %scan_id, "cancellation signalled to running scan");
                self.store
                    .get_scan(scan_id)
                    .await?
                    .ok_or_else(|| EngineError::InvalidReference(format!("unknown scan {scan_id}")))
            }
            CancelOutcome::NotQueued => match self.store.get_scan(scan_id).await? {
                None => Err(EngineError::InvalidReference(format!(
                    "unknown scan {scan_id}"
                ))),
                Some(scan) => Err(EngineError::NotCancellable {
                    scan_id,
                    status: scan.status,
                }),
            },
        }
    }
}
