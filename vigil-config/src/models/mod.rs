use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_core::OrchestratorConfig;
use vigil_model::{AssetKind, ModuleId, ScanModule, ScanPriority};

/// Root asset added at startup. Either a bare value or a table with an
/// explicit kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssetSeed {
    Value(String),
    Detailed {
        value: String,
        #[serde(default)]
        kind: Option<AssetKind>,
    },
}

impl AssetSeed {
    pub fn value(&self) -> &str {
        match self {
            AssetSeed::Value(value) | AssetSeed::Detailed { value, .. } => value,
        }
    }

    pub fn kind(&self) -> Option<AssetKind> {
        match self {
            AssetSeed::Value(_) => None,
            AssetSeed::Detailed { kind, .. } => *kind,
        }
    }
}

/// Recurring scan registered at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSeed {
    /// Asset value; registered if not already seeded.
    pub asset: String,
    pub module: ModuleId,
    pub interval_secs: u64,
    #[serde(default)]
    pub priority: ScanPriority,
}

impl ScheduleSeed {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Everything the daemon needs to boot the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    /// Worker pool size, retry policy, discovery limits and scheduler ticks.
    /// `discovery.policy` maps a discovering module to the modules run on
    /// each asset it finds.
    pub orchestrator: OrchestratorConfig,
    /// Module catalog. Replaces the built-in set entirely when present.
    pub modules: Vec<ScanModule>,
    pub assets: Vec<AssetSeed>,
    pub schedules: Vec<ScheduleSeed>,
    /// Host names that are never registered or scanned.
    pub ignored: Vec<String>,
}

impl Default for VigilConfig {
    fn default() -> Self {
        let mut orchestrator = OrchestratorConfig::default();
        orchestrator.discovery.policy = HashMap::from([(
            ModuleId::new("subfinder"),
            vec![ModuleId::new("nmap")],
        )]);

        Self {
            orchestrator,
            modules: builtin_modules(),
            assets: Vec::new(),
            schedules: Vec::new(),
            ignored: Vec::new(),
        }
    }
}

/// One module per built-in adapter, named after it.
pub fn builtin_modules() -> Vec<ScanModule> {
    let mut subfinder = ScanModule::new("subfinder", "subfinder");
    subfinder.timeout_secs = 600;

    let mut nmap = ScanModule::new("nmap", "nmap");
    nmap.timeout_secs = 1800;
    nmap.max_concurrency = 1;
    nmap.options.insert("host_timeout".into(), "300".into());

    let mut nuclei = ScanModule::new("nuclei", "nuclei");
    nuclei.timeout_secs = 1800;
    nuclei.max_concurrency = 1;

    let mut ping = ScanModule::new("ping", "ping");
    ping.timeout_secs = 30;
    ping.max_concurrency = 8;
    ping.options.insert("packet_count".into(), "4".into());

    vec![subfinder, nmap, nuclei, ping]
}
