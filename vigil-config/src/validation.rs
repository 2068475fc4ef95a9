//! Non-fatal checks on a loaded configuration.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use vigil_core::AdapterRegistry;
use vigil_model::ModuleId;
use vigil_model::asset::normalize_value;

use crate::models::VigilConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    DuplicateModule(ModuleId),
    UnknownAdapter { module: ModuleId, adapter: String },
    ZeroTimeout(ModuleId),
    ZeroWorkers,
    ScheduleUnknownModule { asset: String, module: ModuleId },
    ScheduleZeroInterval { asset: String, module: ModuleId },
    PolicyUnknownModule(ModuleId),
    SeedIgnored(String),
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::DuplicateModule(id) => {
                write!(f, "module {id} is defined more than once; the last definition wins")
            }
            ConfigWarning::UnknownAdapter { module, adapter } => {
                write!(f, "module {module} uses adapter {adapter} which is not built in")
            }
            ConfigWarning::ZeroTimeout(id) => write!(f, "module {id} has a zero timeout"),
            ConfigWarning::ZeroWorkers => {
                write!(f, "orchestrator.worker.pool_size is 0; one worker will be used")
            }
            ConfigWarning::ScheduleUnknownModule { asset, module } => {
                write!(f, "schedule for {asset} references unknown module {module}")
            }
            ConfigWarning::ScheduleZeroInterval { asset, module } => {
                write!(f, "schedule {module} on {asset} has a zero interval")
            }
            ConfigWarning::PolicyUnknownModule(id) => {
                write!(f, "discovery policy references unknown module {id}")
            }
            ConfigWarning::SeedIgnored(value) => {
                write!(f, "seed asset {value} is also on the ignore list")
            }
        }
    }
}

/// Check `config` against the bundled adapters.
pub fn validate(config: &VigilConfig) -> Vec<ConfigWarning> {
    validate_with(config, &AdapterRegistry::with_defaults(Duration::ZERO))
}

/// Check `config` against the adapters the engine will actually be built with.
pub fn validate_with(config: &VigilConfig, adapters: &AdapterRegistry) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    let mut seen = HashSet::new();
    for module in &config.modules {
        if !seen.insert(module.id.clone()) {
            warnings.push(ConfigWarning::DuplicateModule(module.id.clone()));
        }
        if !adapters.contains(&module.adapter) {
            warnings.push(ConfigWarning::UnknownAdapter {
                module: module.id.clone(),
                adapter: module.adapter.clone(),
            });
        }
        if module.timeout_secs == 0 {
            warnings.push(ConfigWarning::ZeroTimeout(module.id.clone()));
        }
    }

    if config.orchestrator.worker.pool_size == 0 {
        warnings.push(ConfigWarning::ZeroWorkers);
    }

    for schedule in &config.schedules {
        if !seen.contains(&schedule.module) {
            warnings.push(ConfigWarning::ScheduleUnknownModule {
                asset: schedule.asset.clone(),
                module: schedule.module.clone(),
            });
        }
        if schedule.interval_secs == 0 {
            warnings.push(ConfigWarning::ScheduleZeroInterval {
                asset: schedule.asset.clone(),
                module: schedule.module.clone(),
            });
        }
    }

    let mut policy_modules: Vec<&ModuleId> = config
        .orchestrator
        .discovery
        .policy
        .iter()
        .flat_map(|(from, to)| std::iter::once(from).chain(to.iter()))
        .collect();
    policy_modules.sort();
    policy_modules.dedup();
    for id in policy_modules {
        if !seen.contains(id) {
            warnings.push(ConfigWarning::PolicyUnknownModule(id.clone()));
        }
    }

    let ignored: HashSet<String> = config
        .ignored
        .iter()
        .filter_map(|name| normalize_value(name).ok())
        .collect();
    for seed in &config.assets {
        if let Ok(value) = normalize_value(seed.value())
            && ignored.contains(&value)
        {
            warnings.push(ConfigWarning::SeedIgnored(seed.value().to_string()));
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetSeed, ScheduleSeed};
    use vigil_model::{ScanModule, ScanPriority};

    #[test]
    fn defaults_are_clean() {
        assert!(validate(&VigilConfig::default()).is_empty());
    }

    #[test]
    fn reports_duplicates_and_dangling_references() {
        let mut config = VigilConfig::default();
        config.modules.push(ScanModule::new("nmap", "nmap"));
        config.modules.push(ScanModule::new("amass", "amass"));
        config.schedules.push(ScheduleSeed {
            asset: "example.com".into(),
            module: ModuleId::new("missing"),
            interval_secs: 0,
            priority: ScanPriority::P2,
        });
        config.assets.push(AssetSeed::Value("Example.com".into()));
        config.ignored.push("example.com".into());

        let warnings = validate(&config);
        assert!(warnings.contains(&ConfigWarning::DuplicateModule(ModuleId::new("nmap"))));
        assert!(warnings.contains(&ConfigWarning::UnknownAdapter {
            module: ModuleId::new("amass"),
            adapter: "amass".into(),
        }));
        assert!(warnings.contains(&ConfigWarning::ScheduleUnknownModule {
            asset: "example.com".into(),
            module: ModuleId::new("missing"),
        }));
        assert!(warnings.contains(&ConfigWarning::ScheduleZeroInterval {
            asset: "example.com".into(),
            module: ModuleId::new("missing"),
        }));
        assert!(warnings.contains(&ConfigWarning::SeedIgnored("Example.com".into())));
    }

    #[test]
    fn adapters_are_checked_against_the_given_registry() {
        let config = VigilConfig::default();
        let warnings = validate_with(&config, &AdapterRegistry::new());
        for module in &config.modules {
            assert!(warnings.contains(&ConfigWarning::UnknownAdapter {
                module: module.id.clone(),
                adapter: module.adapter.clone(),
            }));
        }
    }
}
