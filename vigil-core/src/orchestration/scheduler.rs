//! Pending-work queue and recurring schedules.
//!
//! Pending scans are ordered by `(priority, requested_at, seq)` so P0 is
//! served first and equal priorities are FIFO. An index of live work per
//! `(asset, module)` covers both pending and running scans; enqueueing a key
//! that is already live returns the existing scan instead of adding another.
//!
//! [`ScanScheduler::next`] hands out the first entry that is due and for
//! which the lease manager grants a lease. When nothing is eligible it parks
//! on a [`Notify`] that fires on enqueue and on lease release, waking early
//! only for the earliest deferred retry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vigil_model::{AssetId, ModuleId, ScanId, ScanPriority, ScanRecord, ScheduleId};

use super::catalog::ModuleCatalog;
use super::lease::{LeaseDenied, LeaseGuard, LeaseKey, LeaseManager};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct QueueKey {
    priority: ScanPriority,
    requested_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Debug)]
struct PendingEntry {
    scan: ScanRecord,
    not_before: Option<Instant>,
    /// Accepted but not yet persisted; invisible to dispatch.
    held: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: BTreeMap<QueueKey, PendingEntry>,
    by_scan: HashMap<ScanId, QueueKey>,
    live: HashMap<LeaseKey, ScanId>,
    running: HashMap<ScanId, CancellationToken>,
    seq: u64,
}

impl QueueState {
    fn insert(&mut self, scan: ScanRecord, not_before: Option<Instant>, held: bool) {
        self.seq += 1;
        let key = QueueKey {
            priority: scan.priority,
            requested_at: scan.requested_at,
            seq: self.seq,
        };
        self.live.insert(
            LeaseKey::new(scan.asset_id, scan.module_id.clone()),
            scan.id,
        );
        self.by_scan.insert(scan.id, key);
        self.pending.insert(
            key,
            PendingEntry {
                scan,
                not_before,
                held,
            },
        );
    }

    fn remove_pending(&mut self, scan_id: ScanId) -> Option<PendingEntry> {
        let key = self.by_scan.remove(&scan_id)?;
        let entry = self.pending.remove(&key)?;
        let lease_key = LeaseKey::new(entry.scan.asset_id, entry.scan.module_id.clone());
        if self.live.get(&lease_key) == Some(&scan_id) {
            self.live.remove(&lease_key);
        }
        Some(entry)
    }
}

/// Result of an idempotent enqueue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnqueueOutcome {
    Accepted(ScanId),
    /// Equivalent work is already pending or running.
    Merged(ScanId),
}

impl EnqueueOutcome {
    pub fn scan_id(&self) -> ScanId {
        match self {
            EnqueueOutcome::Accepted(id) | EnqueueOutcome::Merged(id) => *id,
        }
    }

    pub fn was_merged(&self) -> bool {
        matches!(self, EnqueueOutcome::Merged(_))
    }
}

#[derive(Debug)]
pub enum CancelOutcome {
    /// Removed from the queue before dispatch; nothing ran.
    Dequeued(ScanRecord),
    /// Running; the worker has been signalled.
    Signalled,
    NotQueued,
}

/// Work handed to a worker. Dropping it releases the lease.
#[derive(Debug)]
pub struct Dispatch {
    pub scan: ScanRecord,
    pub lease: LeaseGuard,
    pub cancel: CancellationToken,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecurringSchedule {
    pub id: ScheduleId,
    pub asset_id: AssetId,
    pub module_id: ModuleId,
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    pub priority: ScanPriority,
    /// Last epoch handed out; epoch `n` is the `n`-th due time.
    pub epoch: u64,
    #[serde(skip, default = "Instant::now")]
    next_due: Instant,
}

/// Due occurrence of a recurring schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DueSchedule {
    pub schedule: ScheduleId,
    pub asset_id: AssetId,
    pub module_id: ModuleId,
    pub priority: ScanPriority,
    pub epoch: u64,
}

struct SchedulerInner {
    queue: Mutex<QueueState>,
    schedules: Mutex<HashMap<ScheduleId, RecurringSchedule>>,
    wake: Arc<Notify>,
    leases: LeaseManager,
    catalog: Arc<ModuleCatalog>,
}

#[derive(Clone)]
pub struct ScanScheduler {
    inner: Arc<SchedulerInner>,
}

impl fmt::Debug for ScanScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ScanScheduler");
        match self.inner.queue.try_lock() {
            Some(state) => {
                debug
                    .field("pending", &state.pending.len())
                    .field("running", &state.running.len())
                    .field("live", &state.live.len());
            }
            None => {
                debug.field("queue", &"<locked>");
            }
        }
        debug
            .field("schedules", &self.inner.schedules.lock().len())
            .field("leases", &self.inner.leases)
            .finish()
    }
}

impl ScanScheduler {
    pub fn new(catalog: Arc<ModuleCatalog>) -> Self {
        let wake = Arc::new(Notify::new());
        let leases = LeaseManager::new(Arc::clone(&wake));
        Self {
            inner: Arc::new(SchedulerInner {
                queue: Mutex::new(QueueState::default()),
                schedules: Mutex::new(HashMap::new()),
                wake,
                leases,
                catalog,
            }),
        }
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.inner.leases
    }

    /// Scan currently pending or running for `key`, if any.
    pub fn live_scan(&self, key: &LeaseKey) -> Option<ScanId> {
        self.inner.queue.lock().live.get(key).copied()
    }

    /// Accept `scan` in a held state unless equivalent work is live. A held
    /// entry merges later duplicates but is not dispatched until
    /// [`ScanScheduler::commit`]; call [`ScanScheduler::withdraw`] if it
    /// could not be persisted.
    pub fn enqueue_held(&self, scan: ScanRecord) -> EnqueueOutcome {
        self.enqueue_inner(scan, None, true)
    }

    /// Accept `scan` and make it immediately dispatchable.
    pub fn enqueue(&self, scan: ScanRecord) -> EnqueueOutcome {
        self.enqueue_inner(scan, None, false)
    }

    fn enqueue_inner(
        &self,
        scan: ScanRecord,
        not_before: Option<Instant>,
        held: bool,
    ) -> EnqueueOutcome {
        let key = LeaseKey::new(scan.asset_id, scan.module_id.clone());
        let mut state = self.inner.queue.lock();
        if let Some(existing) = state.live.get(&key) {
            let existing = *existing;
            drop(state);
            tracing::debug!(
                target: "scan::queue",
                existing = %existing,
                key = %key,
                "enqueue merged into live scan"
            );
            return EnqueueOutcome::Merged(existing);
        }
        let scan_id = scan.id;
        let priority = scan.priority;
        state.insert(scan, not_before, held);
        drop(state);

        tracing::debug!(
            target: "scan::queue",
            scan_id = %scan_id,
            key = %key,
            priority = ?priority,
            held,
            "scan enqueued"
        );
        if !held {
            self.inner.wake.notify_waiters();
        }
        EnqueueOutcome::Accepted(scan_id)
    }

    pub fn commit(&self, scan_id: ScanId) {
        let mut state = self.inner.queue.lock();
        if let Some(key) = state.by_scan.get(&scan_id).copied()
            && let Some(entry) = state.pending.get_mut(&key)
        {
            entry.held = false;
        }
        drop(state);
        self.inner.wake.notify_waiters();
    }

    pub fn withdraw(&self, scan_id: ScanId) {
        self.inner.queue.lock().remove_pending(scan_id);
    }

    /// Remove a queued scan or signal a running one.
    pub fn cancel(&self, scan_id: ScanId) -> CancelOutcome {
        let mut state = self.inner.queue.lock();
        if let Some(token) = state.running.get(&scan_id) {
            token.cancel();
            return CancelOutcome::Signalled;
        }
        match state.remove_pending(scan_id) {
            Some(entry) => {
                drop(state);
                tracing::debug!(target: "scan::queue", scan_id = %scan_id, "queued scan withdrawn");
                // A freed key may unblock nothing, but deferred sleepers must
                // recompute their deadline.
                self.inner.wake.notify_waiters();
                CancelOutcome::Dequeued(entry.scan)
            }
            None => CancelOutcome::NotQueued,
        }
    }

    /// Retire a dispatched scan. When `follow_up` is given it takes over the
    /// `(asset, module)` slot atomically and becomes due after `delay`. It is
    /// held like [`ScanScheduler::enqueue_held`] until committed.
    pub fn finish(&self, scan_id: ScanId, key: &LeaseKey, follow_up: Option<(ScanRecord, Duration)>) {
        let mut state = self.inner.queue.lock();
        state.running.remove(&scan_id);
        if state.live.get(key) == Some(&scan_id) {
            state.live.remove(key);
        }
        if let Some((retry, delay)) = follow_up {
            // A retry always takes the slot of the scan it replaces.
            state.live.remove(key);
            state.insert(retry, Some(Instant::now() + delay), true);
        }
        drop(state);
        self.inner.wake.notify_waiters();
    }

    /// Take the next eligible scan, waiting until one exists or `shutdown`
    /// fires.
    pub async fn next(&self, shutdown: &CancellationToken) -> Option<Dispatch> {
        loop {
            let notified = self.inner.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = match self.try_next() {
                Ok(dispatch) => return Some(dispatch),
                Err(wake_at) => wake_at,
            };

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = &mut notified => {}
                _ = sleep_until_opt(wake_at) => {}
            }
        }
    }

    /// Non-blocking dequeue. On failure returns the earliest instant at which
    /// a deferred entry becomes due.
    pub fn try_next(&self) -> Result<Dispatch, Option<Instant>> {
        let now = Instant::now();
        let mut earliest: Option<Instant> = None;
        let mut state = self.inner.queue.lock();

        let mut granted = None;
        for (key, entry) in state.pending.iter() {
            if entry.held {
                continue;
            }
            if let Some(not_before) = entry.not_before
                && not_before > now
            {
                earliest = Some(earliest.map_or(not_before, |e| e.min(not_before)));
                continue;
            }
            let lease_key = LeaseKey::new(entry.scan.asset_id, entry.scan.module_id.clone());
            let ceiling = self.inner.catalog.ceiling(&entry.scan.module_id);
            match self.inner.leases.try_acquire(lease_key, entry.scan.id, ceiling) {
                Ok(lease) => {
                    granted = Some((*key, lease));
                    break;
                }
                Err(LeaseDenied::KeyHeld) | Err(LeaseDenied::ModuleSaturated) => continue,
            }
        }

        let Some((key, lease)) = granted else {
            return Err(earliest);
        };
        let Some(entry) = state.pending.remove(&key) else {
            return Err(earliest);
        };
        state.by_scan.remove(&entry.scan.id);
        let cancel = CancellationToken::new();
        state.running.insert(entry.scan.id, cancel.clone());
        drop(state);

        tracing::trace!(
            target: "scan::queue",
            scan_id = %entry.scan.id,
            lease = %lease.lease_id(),
            "scan dispatched"
        );
        Ok(Dispatch {
            scan: entry.scan,
            lease,
            cancel,
        })
    }

    pub fn pending_len(&self) -> usize {
        self.inner.queue.lock().pending.len()
    }

    pub fn running_len(&self) -> usize {
        self.inner.queue.lock().running.len()
    }

    pub fn is_pending(&self, scan_id: ScanId) -> bool {
        self.inner.queue.lock().by_scan.contains_key(&scan_id)
    }

    /// Register a recurring schedule; its first occurrence is due immediately.
    pub fn add_schedule(
        &self,
        asset_id: AssetId,
        module_id: ModuleId,
        interval: Duration,
        priority: ScanPriority,
    ) -> ScheduleId {
        let schedule = RecurringSchedule {
            id: ScheduleId::new(),
            asset_id,
            module_id,
            interval: interval.max(Duration::from_millis(1)),
            priority,
            epoch: 0,
            next_due: Instant::now(),
        };
        let id = schedule.id;
        self.inner.schedules.lock().insert(id, schedule);
        self.inner.wake.notify_waiters();
        id
    }

    pub fn remove_schedule(&self, id: ScheduleId) -> bool {
        self.inner.schedules.lock().remove(&id).is_some()
    }

    pub fn schedules(&self) -> Vec<RecurringSchedule> {
        self.inner.schedules.lock().values().cloned().collect()
    }

    /// Advance every schedule whose due time has passed and return one
    /// occurrence for each. Missed occurrences collapse into one; each epoch
    /// is handed out once.
    pub fn take_due(&self, now: Instant) -> Vec<DueSchedule> {
        let mut due = Vec::new();
        let mut schedules = self.inner.schedules.lock();
        for schedule in schedules.values_mut() {
            if schedule.next_due > now {
                continue;
            }
            schedule.epoch += 1;
            while schedule.next_due <= now {
                schedule.next_due += schedule.interval;
            }
            due.push(DueSchedule {
                schedule: schedule.id,
                asset_id: schedule.asset_id,
                module_id: schedule.module_id.clone(),
                priority: schedule.priority,
                epoch: schedule.epoch,
            });
        }
        due
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
