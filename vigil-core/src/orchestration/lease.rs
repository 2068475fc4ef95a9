//! Concurrency leases.
//!
//! A lease is keyed by `(asset, module)`; at most one is outstanding per key,
//! and the number of outstanding leases per module never exceeds the ceiling
//! passed to [`LeaseManager::try_acquire`]. Both checks and the grant happen
//! under one lock so acquisition is all-or-nothing. Releasing happens exactly
//! once, when the [`LeaseGuard`] is released or dropped, and wakes the
//! scheduler.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;
use vigil_model::{AssetId, ModuleId, ScanId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseKey {
    pub asset_id: AssetId,
    pub module_id: ModuleId,
}

impl LeaseKey {
    pub fn new(asset_id: AssetId, module_id: ModuleId) -> Self {
        Self {
            asset_id,
            module_id,
        }
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.asset_id, self.module_id)
    }
}

/// Why a lease could not be granted. Not an error: the request stays queued.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeaseDenied {
    KeyHeld,
    ModuleSaturated,
}

#[derive(Debug)]
struct HeldLease {
    lease_id: LeaseId,
    scan_id: ScanId,
}

#[derive(Default)]
struct LeaseTable {
    held: HashMap<LeaseKey, HeldLease>,
    per_module: HashMap<ModuleId, usize>,
}

struct LeaseShared {
    table: Mutex<LeaseTable>,
    released: Arc<Notify>,
}

/// Single authority for lease grants.
#[derive(Clone)]
pub struct LeaseManager {
    shared: Arc<LeaseShared>,
}

impl fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("LeaseManager");
        match self.shared.table.try_lock() {
            Some(table) => {
                debug
                    .field("held", &table.held.len())
                    .field("modules", &table.per_module.len());
            }
            None => {
                debug.field("table", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl LeaseManager {
    /// `released` is notified every time a lease is returned.
    pub fn new(released: Arc<Notify>) -> Self {
        Self {
            shared: Arc::new(LeaseShared {
                table: Mutex::new(LeaseTable::default()),
                released,
            }),
        }
    }

    pub fn try_acquire(
        &self,
        key: LeaseKey,
        scan_id: ScanId,
        module_ceiling: usize,
    ) -> Result<LeaseGuard, LeaseDenied> {
        let mut table = self.shared.table.lock();
        if table.held.contains_key(&key) {
            return Err(LeaseDenied::KeyHeld);
        }
        let active = table.per_module.get(&key.module_id).copied().unwrap_or(0);
        if active >= module_ceiling.max(1) {
            return Err(LeaseDenied::ModuleSaturated);
        }

        let lease_id = LeaseId::new();
        table.held.insert(key.clone(), HeldLease { lease_id, scan_id });
        *table.per_module.entry(key.module_id.clone()).or_insert(0) += 1;
        drop(table);

        tracing::trace!(
            target: "scan::lease",
            lease = %lease_id,
            key = %key,
            scan_id = %scan_id,
            "lease granted"
        );

        Ok(LeaseGuard {
            lease_id,
            key,
            scan_id,
            shared: Arc::clone(&self.shared),
            released: false,
        })
    }

    pub fn active_for_module(&self, module: &ModuleId) -> usize {
        self.shared
            .table
            .lock()
            .per_module
            .get(module)
            .copied()
            .unwrap_or(0)
    }

    pub fn holder(&self, key: &LeaseKey) -> Option<ScanId> {
        self.shared.table.lock().held.get(key).map(|h| h.scan_id)
    }

    pub fn outstanding(&self) -> usize {
        self.shared.table.lock().held.len()
    }
}

/// Outstanding lease. Released exactly once: explicitly via
/// [`LeaseGuard::release`] or implicitly on drop, including when the owning
/// worker task panics or is aborted.
pub struct LeaseGuard {
    lease_id: LeaseId,
    key: LeaseKey,
    scan_id: ScanId,
    shared: Arc<LeaseShared>,
    released: bool,
}

impl fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("lease_id", &self.lease_id)
            .field("key", &self.key)
            .field("scan_id", &self.scan_id)
            .field("released", &self.released)
            .finish()
    }
}

impl LeaseGuard {
    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    pub fn key(&self) -> &LeaseKey {
        &self.key
    }

    pub fn scan_id(&self) -> ScanId {
        self.scan_id
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut table = self.shared.table.lock();
        let owned = table
            .held
            .get(&self.key)
            .is_some_and(|held| held.lease_id == self.lease_id);
        if owned {
            table.held.remove(&self.key);
            if let Some(count) = table.per_module.get_mut(&self.key.module_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    table.per_module.remove(&self.key.module_id);
                }
            }
        }
        drop(table);

        tracing::trace!(
            target: "scan::lease",
            lease = %self.lease_id,
            key = %self.key,
            scan_id = %self.scan_id,
            "lease released"
        );
        self.shared.released.notify_waiters();
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> LeaseManager {
        LeaseManager::new(Arc::new(Notify::new()))
    }

    #[test]
    fn one_lease_per_key() {
        let leases = manager();
        let key = LeaseKey::new(AssetId::new(), ModuleId::from("nmap"));
        let guard = leases.try_acquire(key.clone(), ScanId::new(), 4).unwrap();
        assert_eq!(
            leases.try_acquire(key.clone(), ScanId::new(), 4).unwrap_err(),
            LeaseDenied::KeyHeld
        );
        guard.release();
        assert!(leases.try_acquire(key, ScanId::new(), 4).is_ok());
    }

    #[test]
    fn module_ceiling_is_enforced() {
        let leases = manager();
        let module = ModuleId::from("nuclei");
        let a = leases
            .try_acquire(LeaseKey::new(AssetId::new(), module.clone()), ScanId::new(), 2)
            .unwrap();
        let _b = leases
            .try_acquire(LeaseKey::new(AssetId::new(), module.clone()), ScanId::new(), 2)
            .unwrap();
        assert_eq!(
            leases
                .try_acquire(LeaseKey::new(AssetId::new(), module.clone()), ScanId::new(), 2)
                .unwrap_err(),
            LeaseDenied::ModuleSaturated
        );
        // Failed attempts do not leak capacity.
        assert_eq!(leases.active_for_module(&module), 2);
        drop(a);
        assert_eq!(leases.active_for_module(&module), 1);
    }

    #[test]
    fn drop_releases_exactly_once() {
        let leases = manager();
        let key = LeaseKey::new(AssetId::new(), ModuleId::from("ping"));
        {
            let _guard = leases.try_acquire(key.clone(), ScanId::new(), 1).unwrap();
            assert_eq!(leases.outstanding(), 1);
        }
        assert_eq!(leases.outstanding(), 0);
        assert_eq!(leases.active_for_module(&key.module_id), 0);
    }

    #[tokio::test]
    async fn release_wakes_waiters() {
        let notify = Arc::new(Notify::new());
        let leases = LeaseManager::new(Arc::clone(&notify));
        let guard = leases
            .try_acquire(
                LeaseKey::new(AssetId::new(), ModuleId::from("ping")),
                ScanId::new(),
                1,
            )
            .unwrap();
        let waiter = notify.notified();
        tokio::pin!(waiter);
        waiter.as_mut().enable();
        guard.release();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap();
    }
}
