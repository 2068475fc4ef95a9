use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use vigil_model::{ModuleId, ScanModule};

/// Outcome of [`ModuleCatalog::reload`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSummary {
    pub added: Vec<ModuleId>,
    /// Modules whose definition changed; each got a new version.
    pub updated: Vec<ModuleId>,
    pub removed: Vec<ModuleId>,
    pub unchanged: usize,
}

/// Current module definitions, replaced wholesale on reload.
///
/// A definition is never edited in place: a changed definition is stored with
/// `version + 1`, and scans record the version they were requested against.
pub struct ModuleCatalog {
    modules: RwLock<HashMap<ModuleId, ScanModule>>,
    default_concurrency: usize,
}

impl fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCatalog")
            .field("modules", &self.modules.read().len())
            .field("default_concurrency", &self.default_concurrency)
            .finish()
    }
}

impl ModuleCatalog {
    pub fn new(default_concurrency: usize) -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
            default_concurrency: default_concurrency.max(1),
        }
    }

    pub fn get(&self, id: &ModuleId) -> Option<ScanModule> {
        self.modules.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<ScanModule> {
        let mut modules: Vec<ScanModule> = self.modules.read().values().cloned().collect();
        modules.sort_by(|a, b| a.id.cmp(&b.id));
        modules
    }

    /// Effective concurrency ceiling; `0` in the definition means "default".
    pub fn ceiling(&self, id: &ModuleId) -> usize {
        match self.modules.read().get(id) {
            Some(module) if module.max_concurrency > 0 => module.max_concurrency,
            _ => self.default_concurrency,
        }
    }

    pub fn reload(&self, definitions: Vec<ScanModule>) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let mut modules = self.modules.write();
        let mut next = HashMap::with_capacity(definitions.len());

        for mut def in definitions {
            match modules.get(&def.id) {
                Some(current) if current.same_definition(&def) => {
                    def.version = current.version;
                    summary.unchanged += 1;
                }
                Some(current) => {
                    def.version = current.version + 1;
                    summary.updated.push(def.id.clone());
                }
                None => {
                    summary.added.push(def.id.clone());
                }
            }
            next.insert(def.id.clone(), def);
        }

        summary.removed = modules
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();
        summary.removed.sort();
        *modules = next;
        drop(modules);

        tracing::info!(
            added = summary.added.len(),
            updated = summary.updated.len(),
            removed = summary.removed.len(),
            unchanged = summary.unchanged,
            "module catalog reloaded"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changed_definitions_get_new_versions() {
        let catalog = ModuleCatalog::new(2);
        catalog.reload(vec![
            ScanModule::new("nmap", "nmap"),
            ScanModule::new("ping", "ping"),
        ]);

        let mut nmap = ScanModule::new("nmap", "nmap");
        nmap.timeout_secs = 900;
        let summary = catalog.reload(vec![nmap, ScanModule::new("ping", "ping")]);

        assert_eq!(summary.updated, vec![ModuleId::from("nmap")]);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(catalog.get(&ModuleId::from("nmap")).unwrap().version, 2);
        assert_eq!(catalog.get(&ModuleId::from("ping")).unwrap().version, 1);
    }

    #[test]
    fn removed_modules_are_reported() {
        let catalog = ModuleCatalog::new(2);
        catalog.reload(vec![ScanModule::new("nmap", "nmap")]);
        let summary = catalog.reload(Vec::new());
        assert_eq!(summary.removed, vec![ModuleId::from("nmap")]);
        assert!(catalog.get(&ModuleId::from("nmap")).is_none());
    }

    #[test]
    fn zero_ceiling_falls_back_to_default() {
        let catalog = ModuleCatalog::new(3);
        let mut module = ScanModule::new("nmap", "nmap");
        module.max_concurrency = 0;
        catalog.reload(vec![module]);
        assert_eq!(catalog.ceiling(&ModuleId::from("nmap")), 3);
    }
}
