//! Asset registry and discovery graph.
//!
//! Assets live in an arena indexed by id and by `(kind, value)`; provenance is
//! an edge list pointing into it. The graph only grows: an asset that already
//! exists is never re-parented, so re-discovering an ancestor adds nothing and
//! feedback chains terminate.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use vigil_model::asset::{normalize_value, root_domain};
use vigil_model::{Asset, AssetId, AssetKind, DiscoveryEdge, ScanId};

use crate::error::{EngineError, Result};
use crate::orchestration::events::{EngineEvent, EngineEventPayload, EngineEventPublisher};
use crate::store::RecordStore;

#[derive(Debug, Default)]
struct DiscoveryGraph {
    nodes: Vec<Asset>,
    by_id: HashMap<AssetId, usize>,
    by_value: HashMap<(AssetKind, String), usize>,
    edges: Vec<DiscoveryEdge>,
    children: HashMap<AssetId, Vec<usize>>,
}

impl DiscoveryGraph {
    fn find(&self, kind: AssetKind, value: &str) -> Option<&Asset> {
        self.by_value
            .get(&(kind, value.to_string()))
            .map(|&idx| &self.nodes[idx])
    }

    fn get(&self, id: AssetId) -> Option<&Asset> {
        self.by_id.get(&id).map(|&idx| &self.nodes[idx])
    }

    fn push(&mut self, asset: Asset) {
        let idx = self.nodes.len();
        self.by_id.insert(asset.id, idx);
        self.by_value.insert((asset.kind, asset.value.clone()), idx);
        self.nodes.push(asset);
    }

    fn push_edge(&mut self, edge: DiscoveryEdge) {
        let idx = self.edges.len();
        self.children.entry(edge.parent).or_default().push(idx);
        self.edges.push(edge);
    }

    /// Parent for a subdomain. The root domain is returned as a new asset
    /// when it is not in the graph yet.
    fn plan_root(
        &self,
        value: &str,
        discovered_by: Option<ScanId>,
        depth: u32,
    ) -> (Option<AssetId>, Option<Asset>) {
        let Some(root) = root_domain(value) else {
            return (None, None);
        };
        if let Some(existing) = self.find(AssetKind::Domain, &root) {
            return (Some(existing.id), None);
        }
        let asset = Asset::new(AssetKind::Domain, root, None, discovered_by, depth);
        (Some(asset.id), Some(asset))
    }
}

/// Outcome of registering a user-supplied asset.
#[derive(Clone, Debug, PartialEq)]
pub enum Registration {
    Created(Asset),
    Existing(Asset),
}

impl Registration {
    pub fn asset(&self) -> &Asset {
        match self {
            Registration::Created(asset) | Registration::Existing(asset) => asset,
        }
    }
}

/// Outcome of registering a host found by a scan.
#[derive(Clone, Debug, PartialEq)]
pub enum DiscoveryRegistration {
    /// On the ignore list; nothing recorded.
    Ignored(String),
    /// Already known; no edge added.
    Existing(Asset),
    /// New asset. `edge` is `None` when the asset lies beyond the depth limit.
    Registered {
        asset: Asset,
        edge: Option<DiscoveryEdge>,
    },
}

/// Writers hold `writes` across persistence; a node joins the graph only once
/// the store has it.
pub struct AssetRegistry {
    graph: RwLock<DiscoveryGraph>,
    writes: Mutex<()>,
    ignored: RwLock<HashSet<String>>,
    store: Arc<dyn RecordStore>,
    events: Arc<dyn EngineEventPublisher>,
}

impl fmt::Debug for AssetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let graph = self.graph.read();
        f.debug_struct("AssetRegistry")
            .field("assets", &graph.nodes.len())
            .field("edges", &graph.edges.len())
            .field("ignored", &self.ignored.read().len())
            .finish()
    }
}

impl AssetRegistry {
    pub fn new(store: Arc<dyn RecordStore>, events: Arc<dyn EngineEventPublisher>) -> Self {
        Self {
            graph: RwLock::new(DiscoveryGraph::default()),
            writes: Mutex::new(()),
            ignored: RwLock::new(HashSet::new()),
            store,
            events,
        }
    }

    /// Rebuild the arena from the store, e.g. after a restart.
    pub async fn hydrate(&self) -> Result<usize> {
        let assets = self.store.list_assets().await?;
        let edges = self.store.list_edges().await?;
        let mut graph = self.graph.write();
        for asset in assets {
            if graph.get(asset.id).is_none() {
                graph.push(asset);
            }
        }
        for edge in edges {
            graph.push_edge(edge);
        }
        Ok(graph.nodes.len())
    }

    pub fn get(&self, id: AssetId) -> Option<Asset> {
        self.graph.read().get(id).cloned()
    }

    pub fn find(&self, kind: AssetKind, value: &str) -> Option<Asset> {
        let value = normalize_value(value).ok()?;
        self.graph.read().find(kind, &value).cloned()
    }

    pub fn assets(&self) -> Vec<Asset> {
        self.graph.read().nodes.clone()
    }

    pub fn edges(&self) -> Vec<DiscoveryEdge> {
        self.graph.read().edges.clone()
    }

    /// Edges leaving `id`.
    pub fn children(&self, id: AssetId) -> Vec<DiscoveryEdge> {
        let graph = self.graph.read();
        graph
            .children
            .get(&id)
            .map(|idxs| idxs.iter().map(|&i| graph.edges[i].clone()).collect())
            .unwrap_or_default()
    }

    pub fn ignore(&self, raw: &str) -> Result<()> {
        let value = normalize_value(raw)?;
        self.ignored.write().insert(value);
        Ok(())
    }

    pub fn is_ignored(&self, value: &str) -> bool {
        self.ignored.read().contains(value)
    }

    /// Register a user-added root asset. `kind` defaults to the classified
    /// kind of the value.
    pub async fn register(&self, kind: Option<AssetKind>, raw: &str) -> Result<Registration> {
        let value = normalize_value(raw)?;
        let kind = kind.unwrap_or_else(|| AssetKind::classify(&value));
        match kind {
            AssetKind::Ip if AssetKind::classify(&value) != AssetKind::Ip => {
                return Err(EngineError::InvalidReference(format!(
                    "{value} is not an ip address"
                )));
            }
            AssetKind::Subdomain if root_domain(&value).is_none() => {
                return Err(EngineError::InvalidReference(format!(
                    "{value} has no parent domain"
                )));
            }
            _ => {}
        }

        let _writes = self.writes.lock().await;
        if let Some(existing) = self.graph.read().find(kind, &value) {
            return Ok(Registration::Existing(existing.clone()));
        }

        let (parent, root) = if kind == AssetKind::Subdomain {
            self.graph.read().plan_root(&value, None, 0)
        } else {
            (None, None)
        };
        let asset = Asset::new(kind, value, parent, None, 0);
        if let Some(root) = &root {
            self.persist(root, None).await?;
        }
        self.persist(&asset, None).await?;
        Ok(Registration::Created(asset))
    }

    /// Register a host found while scanning `parent` in `scan`.
    pub async fn register_discovered(
        &self,
        parent: &Asset,
        raw: &str,
        scan: ScanId,
        max_depth: u32,
    ) -> Result<DiscoveryRegistration> {
        let value = normalize_value(raw)?;
        if self.is_ignored(&value) {
            tracing::debug!(target: "scan::discovery", value = %value, "ignored host skipped");
            return Ok(DiscoveryRegistration::Ignored(value));
        }
        let kind = AssetKind::classify(&value);
        let depth = parent.depth.saturating_add(1);
        let now = Utc::now();

        let _writes = self.writes.lock().await;
        let existing = {
            let mut graph = self.graph.write();
            graph
                .by_value
                .get(&(kind, value.clone()))
                .copied()
                .map(|idx| {
                    let node = &mut graph.nodes[idx];
                    node.last_seen = now;
                    node.clone()
                })
        };
        if let Some(asset) = existing {
            if let Err(err) = self.store.touch_asset(asset.id, now).await {
                tracing::warn!(
                    target: "scan::discovery",
                    asset_id = %asset.id,
                    "could not record last_seen: {err}"
                );
            }
            return Ok(DiscoveryRegistration::Existing(asset));
        }

        let (root_parent, root) = if kind == AssetKind::Subdomain {
            self.graph.read().plan_root(&value, Some(scan), depth)
        } else {
            (None, None)
        };
        let asset = Asset::new(kind, value, root_parent, Some(scan), depth);
        if let Some(root) = &root {
            self.persist(root, Some(scan)).await?;
        }
        self.persist(&asset, Some(scan)).await?;

        let edge = (depth <= max_depth).then(|| DiscoveryEdge {
            parent: parent.id,
            child: asset.id,
            scan,
            depth,
            created_at: now,
        });
        if let Some(edge) = &edge {
            self.store.insert_edge(edge).await?;
            self.graph.write().push_edge(edge.clone());
        }
        Ok(DiscoveryRegistration::Registered { asset, edge })
    }

    /// Store `asset`, then make it visible in the graph.
    async fn persist(&self, asset: &Asset, scan: Option<ScanId>) -> Result<()> {
        self.store.insert_asset(asset).await?;
        self.graph.write().push(asset.clone());
        tracing::info!(
            target: "scan::discovery",
            asset_id = %asset.id,
            value = %asset.value,
            kind = %asset.kind,
            depth = asset.depth,
            "asset registered"
        );
        let _ = self
            .events
            .publish(EngineEvent::new(EngineEventPayload::AssetRegistered {
                asset_id: asset.id,
                value: asset.value.clone(),
                depth: asset.depth,
                discovered_by: scan,
            }))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::DateTime;
    use vigil_model::{Finding, FindingFilter, FindingId, ScanRecord};

    use crate::orchestration::runtime::InProcEventBus;
    use crate::store::{FindingUpsert, InMemoryRecordStore, UpsertOutcome};

    /// Store whose asset writes are slow and whose `last_seen` updates can
    /// be made to fail.
    #[derive(Debug, Default)]
    struct SlowAssetStore {
        inner: InMemoryRecordStore,
        insert_delay: Duration,
        fail_touch: bool,
    }

    #[async_trait]
    impl RecordStore for SlowAssetStore {
        async fn insert_asset(&self, asset: &Asset) -> Result<()> {
            tokio::time::sleep(self.insert_delay).await;
            self.inner.insert_asset(asset).await
        }
        async fn touch_asset(&self, id: AssetId, seen_at: DateTime<Utc>) -> Result<()> {
            if self.fail_touch {
                return Err(EngineError::Store(format!("asset {id} not found")));
            }
            self.inner.touch_asset(id, seen_at).await
        }
        async fn get_asset(&self, id: AssetId) -> Result<Option<Asset>> {
            self.inner.get_asset(id).await
        }
        async fn list_assets(&self) -> Result<Vec<Asset>> {
            self.inner.list_assets().await
        }
        async fn put_scan(&self, scan: &ScanRecord) -> Result<()> {
            self.inner.put_scan(scan).await
        }
        async fn get_scan(&self, id: ScanId) -> Result<Option<ScanRecord>> {
            self.inner.get_scan(id).await
        }
        async fn scans_for_asset(&self, asset: AssetId) -> Result<Vec<ScanRecord>> {
            self.inner.scans_for_asset(asset).await
        }
        async fn upsert_finding(&self, upsert: FindingUpsert) -> Result<UpsertOutcome> {
            self.inner.upsert_finding(upsert).await
        }
        async fn list_findings(
            &self,
            filter: &FindingFilter,
            after: Option<FindingId>,
            limit: usize,
        ) -> Result<Vec<Finding>> {
            self.inner.list_findings(filter, after, limit).await
        }
        async fn insert_edge(&self, edge: &DiscoveryEdge) -> Result<()> {
            self.inner.insert_edge(edge).await
        }
        async fn list_edges(&self) -> Result<Vec<DiscoveryEdge>> {
            self.inner.list_edges().await
        }
    }

    fn registry() -> AssetRegistry {
        AssetRegistry::new(
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(InProcEventBus::new(64)),
        )
    }

    #[tokio::test]
    async fn kind_and_value_are_unique() {
        let registry = registry();
        let first = registry.register(None, "Example.com").await.unwrap();
        let second = registry.register(None, "example.com.").await.unwrap();
        assert!(matches!(first, Registration::Created(_)));
        assert_eq!(second, Registration::Existing(first.asset().clone()));
    }

    #[tokio::test]
    async fn subdomains_resolve_to_root_domain() {
        let registry = registry();
        let sub = registry.register(None, "api.example.com").await.unwrap();
        let root = registry.find(AssetKind::Domain, "example.com").unwrap();
        assert_eq!(sub.asset().parent, Some(root.id));
        assert_eq!(sub.asset().kind, AssetKind::Subdomain);
    }

    #[tokio::test]
    async fn rediscovering_an_ancestor_adds_nothing() {
        let registry = registry();
        let root = registry.register(None, "example.com").await.unwrap();
        let root = root.asset().clone();
        let scan = ScanId::new();

        let child = registry
            .register_discovered(&root, "www.example.com", scan, 3)
            .await
            .unwrap();
        let DiscoveryRegistration::Registered { asset: child, edge } = child else {
            panic!("expected new asset");
        };
        assert_eq!(edge.unwrap().depth, 1);
        assert_eq!(child.depth, 1);

        let cycle = registry
            .register_discovered(&child, "example.com", ScanId::new(), 3)
            .await
            .unwrap();
        assert!(matches!(cycle, DiscoveryRegistration::Existing(_)));
        assert_eq!(registry.edges().len(), 1);
        assert_eq!(registry.children(root.id).len(), 1);
    }

    #[tokio::test]
    async fn beyond_max_depth_registers_without_edge() {
        let registry = registry();
        let root = registry.register(None, "example.com").await.unwrap().asset().clone();
        let outcome = registry
            .register_discovered(&root, "deep.example.com", ScanId::new(), 0)
            .await
            .unwrap();
        let DiscoveryRegistration::Registered { asset, edge } = outcome else {
            panic!("expected registration");
        };
        assert!(edge.is_none());
        assert_eq!(asset.depth, 1);
        assert!(registry.edges().is_empty());
    }

    #[tokio::test]
    async fn ignored_hosts_are_skipped() {
        let registry = registry();
        registry.ignore("dev.example.com").unwrap();
        let root = registry.register(None, "example.com").await.unwrap().asset().clone();
        let outcome = registry
            .register_discovered(&root, "DEV.example.com", ScanId::new(), 3)
            .await
            .unwrap();
        assert!(matches!(outcome, DiscoveryRegistration::Ignored(_)));
        assert!(registry.find(AssetKind::Subdomain, "dev.example.com").is_none());
    }

    #[tokio::test]
    async fn subdomain_without_parent_domain_is_rejected() {
        let registry = registry();
        let err = registry
            .register(Some(AssetKind::Subdomain), "localhost")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidReference(_)));
        assert!(registry.assets().is_empty());
    }

    #[tokio::test]
    async fn concurrent_discovery_of_one_host_waits_for_the_write() {
        let store = Arc::new(SlowAssetStore {
            insert_delay: Duration::from_millis(50),
            ..Default::default()
        });
        let registry = Arc::new(AssetRegistry::new(
            store.clone(),
            Arc::new(InProcEventBus::new(64)),
        ));
        let root = registry.register(None, "example.com").await.unwrap().asset().clone();

        let first = {
            let (registry, root) = (registry.clone(), root.clone());
            tokio::spawn(async move {
                registry
                    .register_discovered(&root, "www.example.com", ScanId::new(), 3)
                    .await
            })
        };
        let second = {
            let (registry, root) = (registry.clone(), root.clone());
            tokio::spawn(async move {
                registry
                    .register_discovered(&root, "www.example.com", ScanId::new(), 3)
                    .await
            })
        };
        let outcomes = [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];

        let registered = outcomes
            .iter()
            .filter(|o| matches!(o, DiscoveryRegistration::Registered { .. }))
            .count();
        assert_eq!(registered, 1);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, DiscoveryRegistration::Existing(_))));
        assert_eq!(store.list_assets().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_last_seen_update_keeps_existing_registration() {
        let store = Arc::new(SlowAssetStore {
            fail_touch: true,
            ..Default::default()
        });
        let registry = AssetRegistry::new(store, Arc::new(InProcEventBus::new(64)));
        let root = registry.register(None, "example.com").await.unwrap().asset().clone();
        registry
            .register_discovered(&root, "www.example.com", ScanId::new(), 3)
            .await
            .unwrap();

        let again = registry
            .register_discovered(&root, "www.example.com", ScanId::new(), 3)
            .await
            .unwrap();
        assert!(matches!(again, DiscoveryRegistration::Existing(_)));
    }
}
