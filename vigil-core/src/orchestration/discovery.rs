//! Discovery feedback loop: newly found hosts become scan targets.

use std::fmt;
use std::sync::Arc;

use vigil_model::{Asset, ScanId, ScanOrigin, ScanRecord, ScheduleKind};

use super::config::DiscoveryConfig;
use super::events::{EngineEvent, EngineEventPayload, EngineEventPublisher, SuppressionReason};
use super::intake::{ScanIntake, ScanRequest};
use super::scheduler::EnqueueOutcome;
use crate::error::EngineError;
use crate::registry::{AssetRegistry, DiscoveryRegistration};

/// What one feedback cycle did with a scan's candidates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub registered: usize,
    pub existing: usize,
    pub ignored: usize,
    /// Scans newly enqueued by policy, in candidate order.
    pub scheduled: Vec<ScanId>,
    /// Auto-scans not enqueued because of depth, budget or disabled modules.
    pub suppressed: usize,
    /// Candidates or follow-ups dropped on a store or intake error.
    pub failed: usize,
}

pub struct DiscoveryController {
    registry: Arc<AssetRegistry>,
    intake: Arc<ScanIntake>,
    events: Arc<dyn EngineEventPublisher>,
    config: DiscoveryConfig,
}

impl fmt::Debug for DiscoveryController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DiscoveryController {
    pub fn new(
        registry: Arc<AssetRegistry>,
        intake: Arc<ScanIntake>,
        events: Arc<dyn EngineEventPublisher>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            registry,
            intake,
            events,
            config,
        }
    }

    /// Register `candidates` found by `scan` on `parent` and enqueue follow-up
    /// scans per policy. At most `fan_out_budget` scans are enqueued per call.
    /// A failing candidate is logged and skipped; the rest are still handled.
    pub async fn process(
        &self,
        scan: &ScanRecord,
        parent: &Asset,
        candidates: &[String],
    ) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        let mut budget = self.config.fan_out_budget;
        let follow_ups = self
            .config
            .policy
            .get(&scan.module_id)
            .cloned()
            .unwrap_or_default();

        for candidate in candidates {
            let registration = match self
                .registry
                .register_discovered(parent, candidate, scan.id, self.config.max_depth)
                .await
            {
                Ok(registration) => registration,
                Err(EngineError::InvalidReference(reason)) => {
                    tracing::debug!(target: "scan::discovery", candidate = %candidate, "skipping candidate: {reason}");
                    continue;
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        target: "scan::discovery",
                        candidate = %candidate,
                        "candidate registration failed: {err}"
                    );
                    continue;
                }
            };

            let asset = match registration {
                DiscoveryRegistration::Ignored(_) => {
                    report.ignored += 1;
                    continue;
                }
                DiscoveryRegistration::Existing(_) => {
                    report.existing += 1;
                    continue;
                }
                DiscoveryRegistration::Registered { asset, edge: None } => {
                    report.registered += 1;
                    report.suppressed += follow_ups.len();
                    tracing::debug!(
                        target: "scan::discovery",
                        asset = %asset.value,
                        depth = asset.depth,
                        max_depth = self.config.max_depth,
                        "depth limit reached, no follow-up scans"
                    );
                    self.suppressed(scan.id, &asset, SuppressionReason::DepthExceeded)
                        .await;
                    continue;
                }
                DiscoveryRegistration::Registered {
                    asset,
                    edge: Some(_),
                } => {
                    report.registered += 1;
                    asset
                }
            };

            for module_id in &follow_ups {
                if budget == 0 {
                    report.suppressed += 1;
                    self.suppressed(scan.id, &asset, SuppressionReason::BudgetExhausted)
                        .await;
                    continue;
                }
                let request = ScanRequest {
                    asset_id: asset.id,
                    module_id: module_id.clone(),
                    priority: self.config.auto_scan_priority,
                    schedule: ScheduleKind::OneOff,
                    origin: ScanOrigin::Discovery {
                        parent_scan: scan.id,
                    },
                };
                match self.intake.submit(request).await {
                    Ok(EnqueueOutcome::Accepted(scan_id)) => {
                        budget -= 1;
                        report.scheduled.push(scan_id);
                        let _ = self
                            .events
                            .publish(EngineEvent::new(EngineEventPayload::DiscoveryScheduled {
                                parent_scan_id: scan.id,
                                asset_id: asset.id,
                                module_id: module_id.clone(),
                                scan_id,
                            }))
                            .await;
                    }
                    Ok(EnqueueOutcome::Merged(_)) => {}
                    Err(EngineError::ModuleDisabled(_)) => {
                        report.suppressed += 1;
                        self.suppressed(scan.id, &asset, SuppressionReason::ModuleDisabled)
                            .await;
                    }
                    Err(EngineError::InvalidReference(reason)) => {
                        report.suppressed += 1;
                        tracing::warn!(
                            target: "scan::discovery",
                            module = %module_id,
                            asset = %asset.value,
                            "policy follow-up rejected: {reason}"
                        );
                    }
                    Err(err) => {
                        report.failed += 1;
                        tracing::warn!(
                            target: "scan::discovery",
                            module = %module_id,
                            asset = %asset.value,
                            "policy follow-up not enqueued: {err}"
                        );
                    }
                }
            }
        }

        tracing::info!(
            target: "scan::discovery",
            scan_id = %scan.id,
            registered = report.registered,
            existing = report.existing,
            ignored = report.ignored,
            scheduled = report.scheduled.len(),
            suppressed = report.suppressed,
            failed = report.failed,
            "discovery cycle processed"
        );
        report
    }

    async fn suppressed(&self, parent_scan_id: ScanId, asset: &Asset, reason: SuppressionReason) {
        let _ = self
            .events
            .publish(EngineEvent::new(EngineEventPayload::DiscoverySuppressed {
                parent_scan_id,
                asset_id: asset.id,
                reason,
            }))
            .await;
    }
}
