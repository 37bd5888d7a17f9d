//! Priority incident queue with correlation dedup for AEGIS
//!
//! Bounded, in-memory, deliberately ephemeral: the cluster is the source of
//! truth and the queue is rebuilt from watcher observations after a restart.
//! A single mutex guards the queue and the production lock; `dequeue` blocks
//! on a notifier rather than polling.

use aegis_common::{metrics, Error, Incident, IncidentId, IncidentStatus, Priority, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Queued,
    Claimed,
}

struct Entry {
    incident: Incident,
    seq: u64,
    state: EntryState,
    last_merge: DateTime<Utc>,
}

#[derive(Default)]
struct QueueInner {
    /// Ordering index: (priority rank, arrival seq) → incident id.
    order: BTreeMap<(u8, u64), IncidentId>,
    items: HashMap<IncidentId, Entry>,
    /// Correlation key → open incident id; enforces one active analysis per
    /// key.
    open_keys: HashMap<String, IncidentId>,
    next_seq: u64,
}

impl QueueInner {
    fn insert_entry(&mut self, incident: Incident) -> IncidentId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = incident.id;
        self.order.insert((incident.priority.rank(), seq), id);
        self.open_keys.insert(incident.correlation_key.clone(), id);
        self.items.insert(
            id,
            Entry {
                incident,
                seq,
                state: EntryState::Queued,
                last_merge: Utc::now(),
            },
        );
        id
    }

    fn requeue_entry(&mut self, id: IncidentId) -> bool {
        let Some(entry) = self.items.get_mut(&id) else {
            return false;
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        entry.state = EntryState::Queued;
        entry.seq = seq;
        entry.incident.status = IncidentStatus::Queued;
        self.order.insert((entry.incident.priority.rank(), seq), id);
        true
    }

    fn depths(&self) -> BTreeMap<Priority, usize> {
        let mut depths: BTreeMap<Priority, usize> = Priority::ALL.iter().map(|p| (*p, 0)).collect();
        for entry in self.items.values() {
            if entry.state == EntryState::Queued {
                *depths.entry(entry.incident.priority).or_insert(0) += 1;
            }
        }
        depths
    }
}

/// Priority-ordered, deduplicated incident staging
pub struct IncidentQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    merge_window: ChronoDuration,
    production_namespaces: HashSet<String>,
    production_locked: AtomicBool,
}

impl IncidentQueue {
    pub fn new(config: &aegis_common::config::QueueConfig) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            capacity: config.capacity,
            merge_window: ChronoDuration::seconds(config.merge_window_seconds as i64),
            production_namespaces: config.production_namespaces.iter().cloned().collect(),
            production_locked: AtomicBool::new(false),
        }
    }

    pub fn is_production_namespace(&self, namespace: &str) -> bool {
        self.production_namespaces.contains(namespace)
    }

    /// Enqueue an incident, merging into an open incident with the same
    /// correlation key. Returns the effective incident id.
    pub async fn enqueue(&self, incident: Incident) -> Result<IncidentId> {
        let mut inner = self.inner.lock().await;

        let existing = inner.open_keys.get(&incident.correlation_key).copied();
        if let Some(existing_id) = existing {
            let now = Utc::now();
            let Some(entry) = inner.items.get_mut(&existing_id) else {
                // Stale index entry; drop it and fall through to insertion.
                inner.open_keys.remove(&incident.correlation_key);
                return self.insert_new(inner, incident);
            };
            let (old_priority, seq, merged_priority) = {
                let stale = now - entry.last_merge > self.merge_window;
                if stale {
                    // An open incident always absorbs its duplicates; the
                    // window only bounds how long the merge clock may idle.
                    debug!(
                        incident_id = %existing_id,
                        correlation_key = %incident.correlation_key,
                        "merge window elapsed on open incident, merging anyway"
                    );
                }
                entry.incident.occurrences += incident.occurrences.max(1);
                let old_priority = entry.incident.priority;
                let merged = old_priority.promote(incident.priority);
                entry.incident.priority = merged;
                entry.last_merge = now;
                (old_priority, entry.seq, merged)
            };
            if merged_priority != old_priority {
                if inner.order.remove(&(old_priority.rank(), seq)).is_some() {
                    inner.order.insert((merged_priority.rank(), seq), existing_id);
                }
                info!(
                    incident_id = %existing_id,
                    correlation_key = %incident.correlation_key,
                    priority = %merged_priority,
                    "duplicate promoted open incident"
                );
            }
            self.publish_depths(&inner);
            self.notify.notify_waiters();
            return Ok(existing_id);
        }

        self.insert_new(inner, incident)
    }

    fn insert_new(
        &self,
        mut inner: tokio::sync::MutexGuard<'_, QueueInner>,
        incident: Incident,
    ) -> Result<IncidentId> {
        if inner.items.len() >= self.capacity {
            warn!(capacity = self.capacity, "incident queue full");
            return Err(Error::QueueFull(self.capacity));
        }

        let correlation_key = incident.correlation_key.clone();
        let priority = incident.priority;
        let id = inner.insert_entry(incident);
        debug!(
            incident_id = %id,
            correlation_key = %correlation_key,
            priority = %priority,
            "incident enqueued"
        );
        self.publish_depths(&inner);
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Block up to `timeout` for the highest-priority claimable incident.
    /// FIFO within a priority; production-namespace incidents are skipped
    /// while the production lock is held.
    pub async fn dequeue(&self, timeout: Duration) -> Option<Incident> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(incident) = self.try_claim().await {
                return Some(incident);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    async fn try_claim(&self) -> Option<Incident> {
        let locked = self.is_production_locked();
        let mut inner = self.inner.lock().await;
        let mut claim = None;
        for (&key, &id) in inner.order.iter() {
            let Some(entry) = inner.items.get(&id) else {
                continue;
            };
            if entry.state != EntryState::Queued {
                continue;
            }
            if locked && self.is_production_namespace(&entry.incident.resource.namespace) {
                continue;
            }
            claim = Some((key, id));
            break;
        }
        let (key, id) = claim?;
        inner.order.remove(&key);
        let entry = inner.items.get_mut(&id)?;
        entry.state = EntryState::Claimed;
        entry.incident.status = IncidentStatus::Claimed;
        let incident = entry.incident.clone();
        self.publish_depths(&inner);
        debug!(incident_id = %id, priority = %incident.priority, "incident claimed");
        Some(incident)
    }

    /// Remove a claimed incident; it has reached a terminal state.
    pub async fn acknowledge(&self, id: IncidentId) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.items.remove(&id) else {
            return false;
        };
        inner.order.remove(&(entry.incident.priority.rank(), entry.seq));
        inner.open_keys.remove(&entry.incident.correlation_key);
        self.publish_depths(&inner);
        debug!(incident_id = %id, "incident acknowledged");
        true
    }

    /// Put a claimed incident back at the end of its priority class.
    pub async fn nack(&self, id: IncidentId) -> bool {
        let mut inner = self.inner.lock().await;
        let requeued = inner.requeue_entry(id);
        if requeued {
            self.publish_depths(&inner);
            self.notify.notify_waiters();
            debug!(incident_id = %id, "incident requeued");
        }
        requeued
    }

    /// Engage the cluster-wide production lock. Idempotent.
    pub fn lock_production(&self) {
        if !self.production_locked.swap(true, Ordering::SeqCst) {
            info!("production lock engaged");
        }
    }

    /// Release the production lock and wake blocked consumers. Idempotent.
    pub fn unlock_production(&self) {
        if self.production_locked.swap(false, Ordering::SeqCst) {
            info!("production lock released");
            self.notify.notify_waiters();
        }
    }

    pub fn is_production_locked(&self) -> bool {
        self.production_locked.load(Ordering::SeqCst)
    }

    /// Per-priority depth of queued (unclaimed) incidents.
    pub async fn snapshot(&self) -> BTreeMap<Priority, usize> {
        let inner = self.inner.lock().await;
        inner.depths()
    }

    /// Current view of one incident, if it is still tracked.
    pub async fn get(&self, id: IncidentId) -> Option<Incident> {
        let inner = self.inner.lock().await;
        inner.items.get(&id).map(|e| e.incident.clone())
    }

    /// All tracked incidents, queued and claimed.
    pub async fn list(&self) -> Vec<Incident> {
        let inner = self.inner.lock().await;
        let mut incidents: Vec<Incident> =
            inner.items.values().map(|e| e.incident.clone()).collect();
        incidents.sort_by_key(|i| (i.priority.rank(), i.detected_at));
        incidents
    }

    fn publish_depths(&self, inner: &QueueInner) {
        for (priority, depth) in inner.depths() {
            metrics::queue_depth(priority, depth);
        }
    }
}
