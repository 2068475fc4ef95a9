use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{ModuleAdapter, NmapAdapter, NucleiAdapter, PingAdapter, SubfinderAdapter};

/// Lookup table from `ScanModule::adapter` names to implementations.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ModuleAdapter>>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every bundled adapter.
    pub fn with_defaults(grace: Duration) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SubfinderAdapter::new(grace)));
        registry.register(Arc::new(NmapAdapter::new(grace)));
        registry.register(Arc::new(NucleiAdapter::new(grace)));
        registry.register(Arc::new(PingAdapter::new(grace)));
        registry
    }

    /// Register an adapter under its own `kind`, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ModuleAdapter>) {
        self.adapters.insert(adapter.kind().to_string(), adapter);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ModuleAdapter>> {
        self.adapters.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.adapters.contains_key(kind)
    }

    /// Registered adapter names, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_bundled_adapter() {
        let registry = AdapterRegistry::with_defaults(Duration::from_secs(1));
        assert_eq!(registry.kinds(), vec!["nmap", "nuclei", "ping", "subfinder"]);
        assert!(registry.get("nmap").is_some());
        assert!(!registry.contains("masscan"));
    }
}
