pub mod event_bus;
pub mod supervisor;

pub use event_bus::InProcEventBus;
pub use supervisor::{Orchestrator, OrchestratorBuilder};
