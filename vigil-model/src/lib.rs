//! Shared data model for vigil.
//!
//! These types describe the records the orchestrator creates and mutates:
//! assets, scan modules, scans, findings and the provenance edges that link
//! discovered assets back to the scan that found them. They are plain data;
//! all behaviour that touches shared state lives in `vigil-core`.

pub mod asset;
pub mod discovery;
pub mod error;
pub mod finding;
pub mod ids;
pub mod module;
pub mod scan;

pub use asset::{Asset, AssetKind};
pub use discovery::DiscoveryEdge;
pub use error::ModelError;
pub use finding::{Finding, FindingFilter, Severity};
pub use ids::{AssetId, FindingId, ModuleId, ScanId, ScheduleId};
pub use module::{OutputFormat, ScanModule};
pub use scan::{
    FailureKind, ScanOrigin, ScanPriority, ScanRecord, ScanStatus, ScheduleKind,
};
