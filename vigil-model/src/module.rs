use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::ModuleId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    #[default]
    Text,
    Xml,
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Xml => write!(f, "xml"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

/// Configuration binding to one external tool.
///
/// `command` is an argv template; each element may contain `{target}` or
/// `{option_name}` placeholders that adapters fill from the asset and
/// `options`. The definition is immutable for a given `version`: the catalog
/// bumps the version whenever a reload changes anything below.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanModule {
    pub id: ModuleId,
    /// Adapter implementation to drive (`nmap`, `subfinder`, ...).
    pub adapter: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "ScanModule::default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum simultaneous executions of this module across all assets.
    #[serde(default = "ScanModule::default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default = "ScanModule::default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default = "ScanModule::default_version")]
    pub version: u32,
}

impl ScanModule {
    pub fn new(id: impl Into<ModuleId>, adapter: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            adapter: adapter.into(),
            command: Vec::new(),
            timeout_secs: Self::default_timeout_secs(),
            max_concurrency: Self::default_max_concurrency(),
            output_format: OutputFormat::default(),
            enabled: true,
            options: BTreeMap::new(),
            version: Self::default_version(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// True when everything except `version` matches.
    pub fn same_definition(&self, other: &ScanModule) -> bool {
        self.id == other.id
            && self.adapter == other.adapter
            && self.command == other.command
            && self.timeout_secs == other.timeout_secs
            && self.max_concurrency == other.max_concurrency
            && self.output_format == other.output_format
            && self.enabled == other.enabled
            && self.options == other.options
    }

    const fn default_timeout_secs() -> u64 {
        300
    }

    const fn default_max_concurrency() -> usize {
        2
    }

    const fn default_enabled() -> bool {
        true
    }

    const fn default_version() -> u32 {
        1
    }
}
