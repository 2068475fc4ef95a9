pub mod catalog;
pub mod config;
pub mod discovery;
pub mod events;
pub mod intake;
pub mod lease;
pub mod runtime;
pub mod scheduler;
pub mod worker;

pub use catalog::{ModuleCatalog, ReloadSummary};
pub use config::{
    DiscoveryConfig, EventConfig, OrchestratorConfig, RetryConfig, SchedulerConfig, WorkerConfig,
};
pub use discovery::{DiscoveryController, DiscoveryReport};
pub use events::{
    EngineEvent, EngineEventPayload, EngineEventPublisher, EventMeta, SuppressionReason,
};
pub use intake::{ScanIntake, ScanRequest};
pub use lease::{LeaseDenied, LeaseGuard, LeaseId, LeaseKey, LeaseManager};
pub use runtime::{InProcEventBus, Orchestrator, OrchestratorBuilder};
pub use scheduler::{
    CancelOutcome, Dispatch, DueSchedule, EnqueueOutcome, RecurringSchedule, ScanScheduler,
};
pub use worker::{ScanWorker, WorkerContext};
