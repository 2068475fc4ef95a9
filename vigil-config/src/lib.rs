//! Configuration for the vigil daemon: engine tunables, module catalog,
//! seed assets, recurring schedules and the ignore list.

pub mod loader;
pub mod models;
pub mod validation;

pub use loader::ConfigSource;
pub use models::{AssetSeed, ScheduleSeed, VigilConfig, builtin_modules};
pub use validation::{ConfigWarning, validate, validate_with};
