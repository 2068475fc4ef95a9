use std::{any::type_name_of_val, fmt, sync::Arc, time::Duration};

use futures::Stream;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vigil_model::{
    Asset, AssetId, AssetKind, Finding, FindingFilter, ModuleId, ScanId, ScanModule, ScanOrigin,
    ScanPriority, ScanRecord, ScheduleId, ScheduleKind,
};

use super::event_bus::InProcEventBus;
use crate::adapter::AdapterRegistry;
use crate::error::{EngineError, Result};
use crate::normalize::Normalizer;
use crate::orchestration::{
    catalog::{ModuleCatalog, ReloadSummary},
    config::OrchestratorConfig,
    discovery::DiscoveryController,
    events::{EngineEvent, EngineEventPublisher},
    intake::{ScanIntake, ScanRequest},
    scheduler::{RecurringSchedule, ScanScheduler},
    worker::{ScanWorker, WorkerContext},
};
use crate::registry::AssetRegistry;
use crate::store::{InMemoryRecordStore, RecordStore};
use crate::summary::AssetScanSummary;

/// Page size used by [`Orchestrator::stream_findings`].
const FINDING_PAGE: usize = 100;

/// How long `shutdown` waits for each background task.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(30);

/// Facade over the engine: owns the worker pool and the recurring ticker and
/// exposes the operations collaborators call.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn RecordStore>,
    events: Arc<InProcEventBus>,
    catalog: Arc<ModuleCatalog>,
    scheduler: ScanScheduler,
    registry: Arc<AssetRegistry>,
    intake: Arc<ScanIntake>,
    worker_ctx: Arc<WorkerContext>,
    shutdown_token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handle_count = self
            .handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("store_type", &type_name_of_val(self.store.as_ref()))
            .field("events", &self.events)
            .field("catalog", &self.catalog)
            .field("scheduler", &self.scheduler)
            .field("task_count", &handle_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> Arc<AssetRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn catalog(&self) -> Arc<ModuleCatalog> {
        Arc::clone(&self.catalog)
    }

    pub fn scheduler(&self) -> ScanScheduler {
        self.scheduler.clone()
    }

    /// Spawn the worker pool and the recurring-schedule ticker.
    pub async fn start(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return Err(EngineError::Internal("orchestrator already started".into()));
        }

        let pool_size = self.config.worker.pool_size.max(1);
        for index in 0..pool_size {
            let worker = ScanWorker::new(format!("worker-{index}"), Arc::clone(&self.worker_ctx));
            let shutdown = self.shutdown_token.child_token();
            handles.push(tokio::spawn(worker.run(shutdown)));
        }
        handles.push(self.spawn_recurring_ticker());

        tracing::info!(target: "scan::queue", workers = pool_size, "orchestrator started");
        Ok(())
    }

    fn spawn_recurring_ticker(&self) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let intake = Arc::clone(&self.intake);
        let shutdown = self.shutdown_token.child_token();
        let tick = self.config.scheduler.recurring_tick();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                for due in scheduler.take_due(tokio::time::Instant::now()) {
                    let request = ScanRequest {
                        asset_id: due.asset_id,
                        module_id: due.module_id.clone(),
                        priority: due.priority,
                        schedule: ScheduleKind::Recurring {
                            schedule: due.schedule,
                            epoch: due.epoch,
                        },
                        origin: ScanOrigin::Schedule,
                    };
                    match intake.submit(request).await {
                        Ok(outcome) if outcome.was_merged() => tracing::debug!(
                            target: "scan::queue",
                            schedule = %due.schedule,
                            epoch = due.epoch,
                            "recurring occurrence merged into live scan"
                        ),
                        Ok(_) => {}
                        Err(err) => tracing::warn!(
                            target: "scan::queue",
                            schedule = %due.schedule,
                            module = %due.module_id,
                            "recurring occurrence rejected: {err}"
                        ),
                    }
                }
            }
        })
    }

    /// Cancel background tasks and wait for them. Scans in flight finish
    /// their current lifecycle first.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!(target: "scan::queue", "initiating orchestrator shutdown");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_WAIT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(target: "scan::queue", "task failed: {e:?}"),
                Err(_) => tracing::warn!(target: "scan::queue", "task timed out during shutdown"),
            }
        }

        tracing::info!(target: "scan::queue", "orchestrator shutdown complete");
        Ok(())
    }

    /// Request a one-off scan. An equivalent pending or running scan is not an
    /// error; its id is returned instead.
    pub async fn trigger_scan(
        &self,
        asset_id: AssetId,
        module_id: ModuleId,
        priority: ScanPriority,
    ) -> Result<ScanId> {
        let outcome = self
            .intake
            .submit(ScanRequest::one_off(asset_id, module_id, priority))
            .await?;
        Ok(outcome.scan_id())
    }

    pub async fn cancel_scan(&self, scan_id: ScanId) -> Result<ScanRecord> {
        self.intake.cancel(scan_id).await
    }

    pub async fn scan_status(&self, scan_id: ScanId) -> Result<ScanRecord> {
        self.store
            .get_scan(scan_id)
            .await?
            .ok_or_else(|| EngineError::InvalidReference(format!("unknown scan {scan_id}")))
    }

    /// Lazily page through findings matching `filter`. Each call starts from
    /// the beginning and ends after the last match present when it is reached.
    pub fn stream_findings(
        &self,
        filter: FindingFilter,
    ) -> impl Stream<Item = Result<Finding>> + Send + 'static {
        let store = Arc::clone(&self.store);
        async_stream::try_stream! {
            let mut cursor = None;
            loop {
                let page = store.list_findings(&filter, cursor, FINDING_PAGE).await?;
                let exhausted = page.len() < FINDING_PAGE;
                cursor = page.last().map(|finding| finding.id);
                for finding in page {
                    yield finding;
                }
                if exhausted || cursor.is_none() {
                    break;
                }
            }
        }
    }

    pub fn register_recurring_schedule(
        &self,
        asset_id: AssetId,
        module_id: ModuleId,
        interval: Duration,
        priority: ScanPriority,
    ) -> Result<ScheduleId> {
        if self.registry.get(asset_id).is_none() {
            return Err(EngineError::InvalidReference(format!("unknown asset {asset_id}")));
        }
        if self.catalog.get(&module_id).is_none() {
            return Err(EngineError::InvalidReference(format!("unknown module {module_id}")));
        }
        if interval.is_zero() {
            return Err(EngineError::InvalidReference(
                "recurring interval must be positive".into(),
            ));
        }
        let id = self
            .scheduler
            .add_schedule(asset_id, module_id.clone(), interval, priority);
        tracing::info!(
            target: "scan::queue",
            schedule = %id,
            asset_id = %asset_id,
            module = %module_id,
            interval_ms = interval.as_millis() as u64,
            "recurring schedule registered"
        );
        Ok(id)
    }

    pub fn remove_recurring_schedule(&self, id: ScheduleId) -> bool {
        self.scheduler.remove_schedule(id)
    }

    pub fn recurring_schedules(&self) -> Vec<RecurringSchedule> {
        self.scheduler.schedules()
    }

    /// Add a user-supplied asset. Subdomains also register their root domain.
    pub async fn register_asset(&self, kind: Option<AssetKind>, value: &str) -> Result<Asset> {
        Ok(self.registry.register(kind, value).await?.asset().clone())
    }

    pub fn ignore_asset(&self, name: &str) -> Result<()> {
        self.registry.ignore(name)
    }

    pub fn reload_modules(&self, definitions: Vec<ScanModule>) -> ReloadSummary {
        self.catalog.reload(definitions)
    }

    pub async fn asset_summary(&self, asset_id: AssetId) -> Result<AssetScanSummary> {
        if self.registry.get(asset_id).is_none() {
            return Err(EngineError::InvalidReference(format!("unknown asset {asset_id}")));
        }
        let scans = self.store.scans_for_asset(asset_id).await?;
        Ok(AssetScanSummary::from_scans(asset_id, &scans))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

/// Assembles an [`Orchestrator`]. The store defaults to
/// [`InMemoryRecordStore`] and the adapters to the built-in set.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    store: Option<Arc<dyn RecordStore>>,
    adapters: Option<AdapterRegistry>,
    modules: Vec<ScanModule>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("store_set", &self.store.is_some())
            .field("adapters", &self.adapters)
            .field("module_count", &self.modules.len())
            .finish()
    }
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            store: None,
            adapters: None,
            modules: Vec::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = Some(adapters);
        self
    }

    pub fn with_modules(mut self, modules: Vec<ScanModule>) -> Self {
        self.modules = modules;
        self
    }

    /// Wire the components and load assets and edges already in the store.
    pub async fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        let store: Arc<dyn RecordStore> = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryRecordStore::new()));
        let adapters = self
            .adapters
            .unwrap_or_else(|| AdapterRegistry::with_defaults(config.worker.cancel_grace()));

        for module in &self.modules {
            if !adapters.contains(&module.adapter) {
                return Err(EngineError::InvalidReference(format!(
                    "module {} uses unknown adapter {}",
                    module.id, module.adapter
                )));
            }
        }

        let bus = Arc::new(InProcEventBus::new(config.events.channel_capacity));
        let events: Arc<dyn EngineEventPublisher> = bus.clone();

        let catalog = Arc::new(ModuleCatalog::new(
            config.scheduler.default_module_concurrency,
        ));
        catalog.reload(self.modules);

        let scheduler = ScanScheduler::new(Arc::clone(&catalog));
        let registry = Arc::new(AssetRegistry::new(Arc::clone(&store), Arc::clone(&events)));
        let hydrated = registry.hydrate().await?;
        if hydrated > 0 {
            tracing::info!(target: "scan::discovery", assets = hydrated, "asset registry hydrated");
        }

        let intake = Arc::new(ScanIntake::new(
            Arc::clone(&store),
            scheduler.clone(),
            Arc::clone(&catalog),
            Arc::clone(&registry),
            Arc::clone(&events),
        ));
        let discovery = DiscoveryController::new(
            Arc::clone(&registry),
            Arc::clone(&intake),
            Arc::clone(&events),
            config.discovery.clone(),
        );
        let normalizer = Normalizer::new(Arc::clone(&store), Arc::clone(&events));

        let worker_ctx = Arc::new(WorkerContext {
            config: config.clone(),
            store: Arc::clone(&store),
            scheduler: scheduler.clone(),
            catalog: Arc::clone(&catalog),
            registry: Arc::clone(&registry),
            adapters,
            normalizer,
            discovery,
            intake: Arc::clone(&intake),
            events,
        });

        Ok(Orchestrator {
            config,
            store,
            events: bus,
            catalog,
            scheduler,
            registry,
            intake,
            worker_ctx,
            shutdown_token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }
}
