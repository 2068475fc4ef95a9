//! # Vigil Core
//!
//! Scan orchestration engine for vigil. It schedules scans of network assets,
//! runs external scanning tools through pluggable adapters, deduplicates their
//! results into findings and feeds newly discovered hosts back into the queue.
//!
//! ## Architecture
//!
//! - [`adapter`]: the [`ModuleAdapter`] contract plus the built-in `subfinder`,
//!   `nmap`, `nuclei` and `ping` adapters
//! - [`orchestration`]: scheduler, lease manager, worker pool, discovery
//!   controller and the [`Orchestrator`] facade
//! - [`normalize`]: fingerprinting and finding upserts
//! - [`registry`]: assets and the discovery graph
//! - [`store`]: the [`RecordStore`] port and an in-memory implementation
//!
//! ## Example
//!
//! ```no_run
//! use vigil_core::{Orchestrator, OrchestratorConfig};
//! use vigil_model::{ModuleId, ScanModule, ScanPriority};
//!
//! # async fn run() -> vigil_core::Result<()> {
//! let orchestrator = Orchestrator::builder(OrchestratorConfig::default())
//!     .with_modules(vec![ScanModule::new(ModuleId::new("subdomains"), "subfinder")])
//!     .build()
//!     .await?;
//! orchestrator.start().await?;
//!
//! let asset = orchestrator.register_asset(None, "example.com").await?;
//! let scan_id = orchestrator
//!     .trigger_scan(asset.id, ModuleId::new("subdomains"), ScanPriority::P1)
//!     .await?;
//! let status = orchestrator.scan_status(scan_id).await?;
//! println!("{scan_id}: {}", status.status);
//!
//! orchestrator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod error;
pub mod normalize;
pub mod orchestration;
pub mod registry;
pub mod store;
pub mod summary;

pub use adapter::{AdapterRegistry, Capability, ModuleAdapter};
pub use error::{EngineError, Result};
pub use orchestration::{
    EngineEvent, EngineEventPayload, Orchestrator, OrchestratorBuilder, OrchestratorConfig,
};
pub use registry::AssetRegistry;
pub use store::{InMemoryRecordStore, RecordStore};
pub use summary::AssetScanSummary;
