//! Worker directory and cluster status aggregation.
//!
//! Workers register a probe channel here at startup and refresh a
//! heartbeat while running. The aggregator fans a status probe out to
//! every live worker and assembles the replies into a point-in-time
//! cluster snapshot. Probing is read-only: it never touches queue or
//! job state, and a worker that does not answer within the deadline is
//! simply absent from the snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

use encq_models::RoutingKey;

/// Probe channel capacity per worker. Probes are tiny and answered
/// promptly; a small buffer absorbs overlapping snapshots.
const PROBE_CHANNEL_CAPACITY: usize = 8;

/// A status request delivered to a worker's probe channel.
pub struct StatusProbe {
    pub reply: oneshot::Sender<WorkerStatus>,
}

/// Whether a worker has capacity for more deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Available,
    Busy,
}

/// One worker's self-reported load.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    /// Deliveries currently executing
    pub active: usize,
    /// Deliveries claimed but not yet executing
    pub reserved: usize,
    /// Deliveries parked for a later attempt
    pub scheduled: usize,
    pub status: Availability,
}

/// Point-in-time view of the worker pool.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    /// Workers that answered the probe within the deadline
    pub worker_count: usize,
    /// True iff at least one worker answered and every responder is
    /// available. Zero responders is the distinguishable degenerate case.
    pub all_available: bool,
    pub workers: BTreeMap<String, WorkerStatus>,
}

struct WorkerEntry {
    subscriptions: Vec<RoutingKey>,
    probe_tx: mpsc::Sender<StatusProbe>,
    last_seen: Instant,
}

/// Registry of live workers, keyed by worker id.
pub struct WorkerDirectory {
    grace: Duration,
    entries: Mutex<HashMap<String, WorkerEntry>>,
}

impl WorkerDirectory {
    /// Create a directory that prunes workers whose heartbeat is older
    /// than `grace`.
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a worker, returning the receiving end of its probe
    /// channel. Re-registering an id replaces the previous entry.
    pub fn register(
        &self,
        worker_id: &str,
        subscriptions: &[RoutingKey],
    ) -> mpsc::Receiver<StatusProbe> {
        let (probe_tx, probe_rx) = mpsc::channel(PROBE_CHANNEL_CAPACITY);
        let mut entries = self.lock_entries();
        entries.insert(
            worker_id.to_string(),
            WorkerEntry {
                subscriptions: subscriptions.to_vec(),
                probe_tx,
                last_seen: Instant::now(),
            },
        );
        debug!(worker_id, "Worker registered");
        probe_rx
    }

    /// Remove a worker's entry.
    pub fn deregister(&self, worker_id: &str) {
        self.lock_entries().remove(worker_id);
        debug!(worker_id, "Worker deregistered");
    }

    /// Refresh a worker's heartbeat.
    pub fn heartbeat(&self, worker_id: &str) {
        if let Some(entry) = self.lock_entries().get_mut(worker_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Routing keys a registered worker consumes, if it is still live.
    pub fn subscriptions(&self, worker_id: &str) -> Option<Vec<RoutingKey>> {
        self.lock_entries()
            .get(worker_id)
            .map(|e| e.subscriptions.clone())
    }

    /// Number of registered entries, stale ones included.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Probe senders for every live worker, pruning stale entries on the
    /// way through.
    fn live(&self) -> Vec<(String, mpsc::Sender<StatusProbe>)> {
        let now = Instant::now();
        let mut entries = self.lock_entries();
        entries.retain(|id, entry| {
            let live = now.duration_since(entry.last_seen) <= self.grace;
            if !live {
                debug!(worker_id = %id, "Pruned stale worker");
            }
            live
        });
        entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.probe_tx.clone()))
            .collect()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorkerEntry>> {
        self.entries.lock().expect("worker directory lock poisoned")
    }
}

/// Read-only status fan-out over the worker directory.
pub struct ClusterStatusAggregator {
    directory: Arc<WorkerDirectory>,
}

impl ClusterStatusAggregator {
    pub fn new(directory: Arc<WorkerDirectory>) -> Self {
        Self { directory }
    }

    /// Probe every live worker in parallel and collect replies that
    /// arrive within `timeout`.
    pub async fn snapshot(&self, timeout: Duration) -> ClusterStatus {
        let probes = self.directory.live().into_iter().map(|(id, tx)| async move {
            let (reply_tx, reply_rx) = oneshot::channel();
            let probe = StatusProbe { reply: reply_tx };

            let answered = tokio::time::timeout(timeout, async {
                tx.send(probe).await.ok()?;
                reply_rx.await.ok()
            })
            .await
            .ok()
            .flatten();

            answered.map(|status| (id, status))
        });

        let workers: BTreeMap<String, WorkerStatus> = futures::future::join_all(probes)
            .await
            .into_iter()
            .flatten()
            .collect();

        let worker_count = workers.len();
        let all_available = worker_count > 0
            && workers
                .values()
                .all(|w| w.status == Availability::Available);

        ClusterStatus {
            worker_count,
            all_available,
            workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_status() -> WorkerStatus {
        WorkerStatus {
            active: 0,
            reserved: 0,
            scheduled: 0,
            status: Availability::Available,
        }
    }

    fn busy_status() -> WorkerStatus {
        WorkerStatus {
            active: 1,
            reserved: 0,
            scheduled: 0,
            status: Availability::Busy,
        }
    }

    fn answer_probes(mut rx: mpsc::Receiver<StatusProbe>, status: WorkerStatus) {
        tokio::spawn(async move {
            while let Some(probe) = rx.recv().await {
                let _ = probe.reply.send(status.clone());
            }
        });
    }

    #[tokio::test]
    async fn snapshot_collects_all_responders() {
        let directory = Arc::new(WorkerDirectory::new(Duration::from_secs(30)));
        answer_probes(directory.register("worker-a", &[RoutingKey::High]), idle_status());
        answer_probes(directory.register("worker-b", &[RoutingKey::Low]), busy_status());

        let aggregator = ClusterStatusAggregator::new(Arc::clone(&directory));
        let snapshot = aggregator.snapshot(Duration::from_millis(500)).await;

        assert_eq!(snapshot.worker_count, 2);
        assert!(!snapshot.all_available);
        assert_eq!(snapshot.workers["worker-a"].status, Availability::Available);
        assert_eq!(snapshot.workers["worker-b"].active, 1);
    }

    #[tokio::test]
    async fn unresponsive_worker_is_absent() {
        let directory = Arc::new(WorkerDirectory::new(Duration::from_secs(30)));
        answer_probes(directory.register("worker-a", &[RoutingKey::High]), idle_status());
        answer_probes(directory.register("worker-b", &[RoutingKey::Low]), idle_status());
        // Holds its probe channel but never answers.
        let _silent_rx = directory.register("worker-c", &[RoutingKey::All]);

        let aggregator = ClusterStatusAggregator::new(Arc::clone(&directory));
        let snapshot = aggregator.snapshot(Duration::from_millis(500)).await;

        assert_eq!(snapshot.worker_count, 2);
        assert!(snapshot.all_available);
        assert!(!snapshot.workers.contains_key("worker-c"));
    }

    #[tokio::test]
    async fn empty_pool_is_not_all_available() {
        let directory = Arc::new(WorkerDirectory::new(Duration::from_secs(30)));
        let aggregator = ClusterStatusAggregator::new(directory);

        let snapshot = aggregator.snapshot(Duration::from_millis(100)).await;

        assert_eq!(snapshot.worker_count, 0);
        assert!(!snapshot.all_available);
        assert!(snapshot.workers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_workers_are_pruned() {
        let directory = Arc::new(WorkerDirectory::new(Duration::from_secs(30)));
        let _rx_a = directory.register("worker-a", &[RoutingKey::High]);
        let _rx_b = directory.register("worker-b", &[RoutingKey::Low]);

        tokio::time::advance(Duration::from_secs(31)).await;
        directory.heartbeat("worker-b");

        let aggregator = ClusterStatusAggregator::new(Arc::clone(&directory));
        let _ = aggregator.snapshot(Duration::from_millis(10)).await;

        assert!(directory.subscriptions("worker-a").is_none());
        assert!(directory.subscriptions("worker-b").is_some());
    }
}
