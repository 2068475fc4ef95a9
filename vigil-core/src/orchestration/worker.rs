//! Scan execution.
//!
//! A worker takes one [`Dispatch`] at a time and drives it through
//! build, execute and parse, then normalizes the records, feeds discovered
//! hosts back, records the terminal state and schedules a retry for
//! transient failures. The lease is released only after the terminal state is
//! persisted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vigil_model::{
    Asset, FailureKind, ScanModule, ScanOrigin, ScanRecord, ScanStatus,
};

use super::catalog::ModuleCatalog;
use super::config::OrchestratorConfig;
use super::discovery::DiscoveryController;
use super::events::{EngineEvent, EngineEventPayload, EngineEventPublisher};
use super::intake::ScanIntake;
use super::lease::LeaseKey;
use super::scheduler::{Dispatch, ScanScheduler};
use crate::adapter::{AdapterError, AdapterRegistry, ModuleAdapter, NativeRecord, RawOutput};
use crate::normalize::Normalizer;
use crate::registry::AssetRegistry;
use crate::store::RecordStore;

/// Bytes of tool output kept on the scan record.
pub const OUTPUT_EXCERPT_LIMIT: usize = 4 * 1024;

/// Extra time allowed for an adapter to return after its token fires.
const TEARDOWN_MARGIN: Duration = Duration::from_secs(1);

/// Shared dependencies of all workers in a pool.
pub struct WorkerContext {
    pub config: OrchestratorConfig,
    pub store: Arc<dyn RecordStore>,
    pub scheduler: ScanScheduler,
    pub catalog: Arc<ModuleCatalog>,
    pub registry: Arc<AssetRegistry>,
    pub adapters: AdapterRegistry,
    pub normalizer: Normalizer,
    pub discovery: DiscoveryController,
    pub intake: Arc<ScanIntake>,
    pub events: Arc<dyn EngineEventPublisher>,
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .field("adapters", &self.adapters)
            .finish_non_exhaustive()
    }
}

/// Terminal classification of one execution.
#[derive(Debug)]
enum Outcome {
    Completed {
        records: Vec<NativeRecord>,
        warnings: Vec<String>,
    },
    Failed {
        kind: FailureKind,
        error: String,
    },
    Cancelled,
}

enum Execution {
    Finished(Result<RawOutput, AdapterError>),
    TimedOut,
    Cancelled,
}

/// Clears the scheduler slot if the worker unwinds before finishing.
struct SlotGuard {
    scheduler: ScanScheduler,
    scan_id: vigil_model::ScanId,
    key: LeaseKey,
    armed: bool,
}

impl SlotGuard {
    fn finish(mut self) {
        self.armed = false;
        self.scheduler.finish(self.scan_id, &self.key, None);
    }

    /// Hand the slot to someone else who will finish it.
    fn disarm(mut self) -> LeaseKey {
        self.armed = false;
        self.key.clone()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::error!(target: "scan::worker", scan_id = %self.scan_id, "worker unwound mid-scan, clearing slot");
            self.scheduler.finish(self.scan_id, &self.key, None);
        }
    }
}

#[derive(Clone)]
pub struct ScanWorker {
    id: String,
    ctx: Arc<WorkerContext>,
}

impl fmt::Debug for ScanWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanWorker").field("id", &self.id).finish()
    }
}

impl ScanWorker {
    pub fn new(id: impl Into<String>, ctx: Arc<WorkerContext>) -> Self {
        Self {
            id: id.into(),
            ctx,
        }
    }

    /// Process scans until `shutdown` fires. A scan already in flight runs to
    /// its terminal state.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(target: "scan::worker", worker = %self.id, "worker started");
        while let Some(dispatch) = self.ctx.scheduler.next(&shutdown).await {
            self.execute(dispatch).await;
        }
        tracing::info!(target: "scan::worker", worker = %self.id, "worker shutting down");
    }

    pub async fn execute(&self, dispatch: Dispatch) {
        let Dispatch {
            mut scan,
            lease,
            cancel,
        } = dispatch;
        let slot = SlotGuard {
            scheduler: self.ctx.scheduler.clone(),
            scan_id: scan.id,
            key: lease.key().clone(),
            armed: true,
        };

        tracing::trace!(
            target: "scan::worker",
            worker = %self.id,
            scan_id = %scan.id,
            lease = %lease.lease_id(),
            "lease acquired"
        );

        let asset = self.ctx.registry.get(scan.asset_id);
        let module = self.ctx.catalog.get(&scan.module_id);
        // Runs use the definition current at start, not at enqueue.
        if let Some(module) = &module {
            scan.module_version = module.version;
        }

        let outcome = if cancel.is_cancelled() {
            // Cancelled between dispatch and start; the adapter never runs.
            scan.cancel_requested = true;
            if let Err(err) = scan.transition(ScanStatus::Cancelled) {
                tracing::error!(target: "scan::worker", scan_id = %scan.id, "{err}");
            }
            None
        } else {
            match scan.transition(ScanStatus::Running) {
                Ok(()) => {
                    self.persist(&scan).await;
                    let _ = self
                        .ctx
                        .events
                        .publish(EngineEvent::new(EngineEventPayload::ScanStarted {
                            scan_id: scan.id,
                            module_id: scan.module_id.clone(),
                        }))
                        .await;
                    Some(self.run_lifecycle(&mut scan, asset.as_ref(), module.as_ref(), &cancel).await)
                }
                Err(err) => {
                    tracing::error!(target: "scan::worker", scan_id = %scan.id, "cannot start scan: {err}");
                    None
                }
            }
        };

        let mut follow_up = None;
        if let Some(outcome) = outcome {
            follow_up = self.record_outcome(&mut scan, outcome, asset.as_ref()).await;
        }
        self.persist(&scan).await;

        let _ = self
            .ctx
            .events
            .publish(EngineEvent::new(EngineEventPayload::ScanFinished {
                scan_id: scan.id,
                status: scan.status,
                failure: scan.failure,
                warnings: scan.warnings.len(),
            }))
            .await;

        // Terminal state is durable; now the slot can be reused.
        lease.release();

        match follow_up {
            Some((retry, delay)) => {
                let key = slot.disarm();
                if let Err(err) = self
                    .ctx
                    .intake
                    .requeue_retry(scan.id, &key, retry, delay)
                    .await
                {
                    tracing::error!(target: "scan::worker", scan_id = %scan.id, "retry not scheduled: {err}");
                }
            }
            None => slot.finish(),
        }
    }

    async fn run_lifecycle(
        &self,
        scan: &mut ScanRecord,
        asset: Option<&Asset>,
        module: Option<&ScanModule>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let Some(asset) = asset else {
            return configuration(format!("asset {} is not registered", scan.asset_id));
        };
        let Some(module) = module else {
            return configuration(format!("module {} is not configured", scan.module_id));
        };
        if !module.enabled {
            return configuration(format!("module {} was disabled", module.id));
        }
        let Some(adapter) = self.ctx.adapters.get(&module.adapter) else {
            return configuration(format!("no adapter named {}", module.adapter));
        };

        let mut invocation = match adapter.build(asset, module) {
            Ok(invocation) => invocation,
            Err(err) => {
                return Outcome::Failed {
                    kind: err.failure_kind(),
                    error: err.to_string(),
                };
            }
        };
        invocation.grace = self.ctx.config.worker.cancel_grace();

        tracing::debug!(
            target: "scan::worker",
            worker = %self.id,
            scan_id = %scan.id,
            command = %invocation.command_line(),
            timeout_secs = module.timeout_secs,
            "executing"
        );

        let execution = self
            .execute_bounded(adapter.as_ref(), &invocation, module.timeout(), cancel)
            .await;

        let raw = match execution {
            Execution::Cancelled => return Outcome::Cancelled,
            Execution::TimedOut => {
                return Outcome::Failed {
                    kind: FailureKind::ExecutionTimeout,
                    error: format!("timed out after {}s", module.timeout_secs),
                };
            }
            Execution::Finished(Err(AdapterError::Cancelled)) if cancel.is_cancelled() => {
                return Outcome::Cancelled;
            }
            Execution::Finished(Err(err)) => {
                if let AdapterError::Exited { stderr, .. } = &err {
                    scan.output_excerpt = Some(excerpt(&RawOutput {
                        stderr: stderr.clone(),
                        ..Default::default()
                    }));
                }
                return Outcome::Failed {
                    kind: err.failure_kind(),
                    error: err.to_string(),
                };
            }
            Execution::Finished(Ok(raw)) => raw,
        };

        scan.output_excerpt = Some(excerpt(&raw));
        match adapter.parse(&raw) {
            Ok(records) => Outcome::Completed {
                records,
                warnings: Vec::new(),
            },
            Err(parse) if parse.partial.is_empty() => Outcome::Failed {
                kind: FailureKind::ParseError,
                error: parse.message,
            },
            Err(parse) => Outcome::Completed {
                warnings: vec![parse.message],
                records: parse.partial,
            },
        }
    }

    /// Run the adapter, enforcing the module timeout and the cancel token.
    /// Either way the adapter gets the grace period plus a margin to tear the
    /// process down before the worker moves on.
    async fn execute_bounded(
        &self,
        adapter: &dyn ModuleAdapter,
        invocation: &crate::adapter::Invocation,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Execution {
        let exec_token = cancel.child_token();
        let fut = adapter.execute(invocation, exec_token.clone());
        tokio::pin!(fut);
        let teardown = invocation.grace + TEARDOWN_MARGIN;

        tokio::select! {
            result = &mut fut => Execution::Finished(result),
            _ = tokio::time::sleep(timeout) => {
                exec_token.cancel();
                if tokio::time::timeout(teardown, &mut fut).await.is_err() {
                    tracing::warn!(target: "scan::worker", program = %invocation.program, "adapter did not stop within grace");
                }
                Execution::TimedOut
            }
            _ = cancel.cancelled() => {
                if tokio::time::timeout(teardown, &mut fut).await.is_err() {
                    tracing::warn!(target: "scan::worker", program = %invocation.program, "adapter did not stop within grace");
                }
                Execution::Cancelled
            }
        }
    }

    /// Apply the terminal transition and run normalization and discovery for
    /// completed scans. Returns the retry to enqueue, if any.
    async fn record_outcome(
        &self,
        scan: &mut ScanRecord,
        outcome: Outcome,
        asset: Option<&Asset>,
    ) -> Option<(ScanRecord, Duration)> {
        match outcome {
            Outcome::Completed { records, warnings } => {
                scan.records_parsed = records.len();
                scan.warnings = warnings;
                if let (Some(asset), Some(module)) = (asset, self.ctx.catalog.get(&scan.module_id))
                {
                    self.normalize_and_discover(scan, asset, &module, records).await;
                }
                if let Err(err) = scan.transition(ScanStatus::Completed) {
                    tracing::error!(target: "scan::worker", scan_id = %scan.id, "{err}");
                }
                if scan.warnings.is_empty() {
                    tracing::info!(target: "scan::worker", scan_id = %scan.id, records = scan.records_parsed, "scan completed");
                } else {
                    tracing::warn!(
                        target: "scan::worker",
                        scan_id = %scan.id,
                        records = scan.records_parsed,
                        warnings = ?scan.warnings,
                        "scan completed with warnings"
                    );
                }
                None
            }
            Outcome::Cancelled => {
                scan.cancel_requested = true;
                if let Err(err) = scan.transition(ScanStatus::Cancelled) {
                    tracing::error!(target: "scan::worker", scan_id = %scan.id, "{err}");
                }
                tracing::info!(target: "scan::worker", scan_id = %scan.id, "scan cancelled");
                None
            }
            Outcome::Failed { kind, error } => {
                if let Err(err) = scan.fail(kind, error.clone()) {
                    tracing::error!(target: "scan::worker", scan_id = %scan.id, "{err}");
                }
                tracing::warn!(
                    target: "scan::worker",
                    scan_id = %scan.id,
                    kind = %kind,
                    retry_count = scan.retry_count,
                    "scan failed: {error}"
                );
                self.retry_for(scan, kind)
            }
        }
    }

    async fn normalize_and_discover(
        &self,
        scan: &mut ScanRecord,
        asset: &Asset,
        module: &ScanModule,
        records: Vec<NativeRecord>,
    ) {
        let Some(adapter) = self.ctx.adapters.get(&module.adapter) else {
            return;
        };
        let batch = match self
            .ctx
            .normalizer
            .normalize(asset, module, scan.id, adapter.capabilities(), records)
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!(target: "scan::worker", scan_id = %scan.id, "normalization failed: {err}");
                scan.warnings.push(format!("normalization failed: {err}"));
                return;
            }
        };
        if batch.candidates.is_empty() {
            return;
        }
        let report = self
            .ctx
            .discovery
            .process(scan, asset, &batch.candidates)
            .await;
        if report.failed > 0 {
            scan.warnings.push(format!(
                "discovery dropped {} candidate(s) or follow-up(s)",
                report.failed
            ));
        }
    }

    fn retry_for(&self, scan: &ScanRecord, kind: FailureKind) -> Option<(ScanRecord, Duration)> {
        let retry_cfg = self.ctx.config.retry;
        if !kind.is_transient() || scan.retry_count >= retry_cfg.max_retries {
            return None;
        }
        let module_version = self
            .ctx
            .catalog
            .get(&scan.module_id)
            .map(|m| m.version)
            .unwrap_or(scan.module_version);
        let mut retry = ScanRecord::new(
            scan.asset_id,
            scan.module_id.clone(),
            module_version,
            scan.priority,
            scan.schedule,
            ScanOrigin::Retry { previous: scan.id },
        );
        retry.retry_count = scan.retry_count + 1;
        Some((retry, retry_cfg.backoff_for(scan.retry_count)))
    }

    async fn persist(&self, scan: &ScanRecord) {
        if let Err(err) = self.ctx.store.put_scan(scan).await {
            tracing::error!(target: "scan::worker", scan_id = %scan.id, status = %scan.status, "persisting scan failed: {err}");
        }
    }
}

fn configuration(error: String) -> Outcome {
    Outcome::Failed {
        kind: FailureKind::Configuration,
        error,
    }
}

/// Head of stdout followed by stderr, cut at a char boundary.
pub fn excerpt(raw: &RawOutput) -> String {
    let mut text = raw.stdout.clone();
    if !raw.stderr.trim().is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str("--- stderr ---\n");
        text.push_str(&raw.stderr);
    }
    if text.len() > OUTPUT_EXCERPT_LIMIT {
        let mut cut = OUTPUT_EXCERPT_LIMIT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_is_bounded_on_char_boundary() {
        let raw = RawOutput {
            stdout: "é".repeat(OUTPUT_EXCERPT_LIMIT),
            stderr: String::new(),
            exit_code: Some(0),
        };
        let text = excerpt(&raw);
        assert!(text.len() <= OUTPUT_EXCERPT_LIMIT);
        assert!(text.chars().all(|c| c == 'é'));
    }

    #[test]
    fn excerpt_appends_stderr() {
        let raw = RawOutput {
            stdout: "out".into(),
            stderr: "warn".into(),
            exit_code: Some(0),
        };
        assert_eq!(excerpt(&raw), "out\n--- stderr ---\nwarn");
    }
}
