//! Queue broker core.
//!
//! One ordered pending set per routing key, keyed by
//! `(Reverse(priority), seq)` where `seq` is a global insertion sequence
//! number. Dequeue scans every queue visible to the caller's subscription
//! and pops the entry with the smallest key, which gives strict priority
//! order with FIFO tie-break across all visible keys. Because the sequence
//! numbers are global, no routing key can starve another at equal
//! priority; this replaces round-robin key selection.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use encq_models::{Job, JobId, RoutingKey};

use crate::error::{BrokerError, BrokerResult};

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Failed delivery attempts allowed before a job is dead-lettered.
    pub max_retries: u32,
    /// How long a worker may hold a delivery before it is reclaimed.
    pub lease_timeout: Duration,
    /// How often the lease sweeper scans for expired deliveries.
    pub sweep_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            lease_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl BrokerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            max_retries: std::env::var("BROKER_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            lease_timeout: Duration::from_secs(
                std::env::var("BROKER_LEASE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            ),
            sweep_interval: Duration::from_secs(
                std::env::var("BROKER_SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
        }
    }
}

/// Identifier of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryId(pub u64);

impl std::fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An at-least-once delivery handle. The holder must `ack` or `nack` it
/// before the lease deadline, or the broker reclaims and requeues the job.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Delivery id, unique per attempt.
    pub id: DeliveryId,
    /// The delivered job.
    pub job: Job,
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the lease expires.
    pub lease_deadline: Instant,
}

/// A job removed from circulation after exhausting its retry budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub job: Job,
    /// Error detail from the last failed attempt.
    pub error: String,
    /// Total delivery attempts consumed.
    pub attempts: u32,
}

/// Outcome of a negative acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// The job went back to its queue, at the front of its priority band.
    Requeued,
    /// Retry budget exhausted; the job left the queue permanently and was
    /// published on the dead-letter channel.
    DeadLettered,
}

#[derive(Debug)]
struct PendingEntry {
    job: Job,
    /// Global insertion sequence; kept across requeues so a retried job
    /// re-enters at the front of its priority band.
    seq: u64,
    /// Failed delivery attempts so far.
    retries: u32,
}

#[derive(Debug)]
struct ActiveEntry {
    job: Job,
    seq: u64,
    retries: u32,
    deadline: Instant,
}

type PendingSet = BTreeMap<(Reverse<u8>, u64), PendingEntry>;

#[derive(Default)]
struct State {
    queues: HashMap<RoutingKey, PendingSet>,
    active: HashMap<u64, ActiveEntry>,
    /// Every job currently pending or active. Guards the "exactly one
    /// place at a time" invariant.
    known: HashSet<JobId>,
    next_seq: u64,
    next_delivery: u64,
}

/// In-process queue broker. Shared as `Arc<QueueBroker>` between the
/// dispatcher, the worker pool and the lease sweeper.
pub struct QueueBroker {
    state: Mutex<State>,
    notify: Notify,
    config: BrokerConfig,
    shutdown: watch::Sender<bool>,
    dead_tx: mpsc::UnboundedSender<DeadLetter>,
    dead_rx: Mutex<Option<mpsc::UnboundedReceiver<DeadLetter>>>,
}

impl QueueBroker {
    /// Create a new broker.
    pub fn new(config: BrokerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();

        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            config,
            shutdown,
            dead_tx,
            dead_rx: Mutex::new(Some(dead_rx)),
        }
    }

    /// Create from environment variables.
    pub fn from_env() -> Self {
        Self::new(BrokerConfig::from_env())
    }

    /// Maximum failed attempts before dead-lettering.
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// How long a delivery's lease lasts between renewals.
    pub fn lease_timeout(&self) -> Duration {
        self.config.lease_timeout
    }

    /// Push an active delivery's lease deadline out by the configured
    /// lease timeout. Holders renew periodically while work runs, so an
    /// encode may legitimately take many lease periods; only a holder
    /// that stops renewing (crash, hang) gets reclaimed by the sweeper.
    pub fn extend_lease(&self, id: DeliveryId) -> BrokerResult<()> {
        let mut state = self.lock_state();
        let entry = state
            .active
            .get_mut(&id.0)
            .ok_or(BrokerError::UnknownDelivery(id.0))?;
        entry.deadline = Instant::now() + self.config.lease_timeout;
        Ok(())
    }

    /// Take the dead-letter receiver. Yields `Some` exactly once; the
    /// supervisor that drains it marks the registry entries Failed.
    pub fn take_dead_letters(&self) -> Option<mpsc::UnboundedReceiver<DeadLetter>> {
        self.dead_rx.lock().expect("dead_rx lock poisoned").take()
    }

    /// Enqueue a job on the queue named by its routing key.
    pub fn enqueue(&self, job: Job) -> BrokerResult<()> {
        if *self.shutdown.borrow() {
            return Err(BrokerError::Closed);
        }
        let mut state = self.lock_state();

        if !state.known.insert(job.id.clone()) {
            return Err(BrokerError::DuplicateJob(job.id));
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        debug!(
            job_id = %job.id,
            routing_key = %job.routing_key,
            priority = job.priority,
            seq,
            "Enqueued job"
        );

        let key = (Reverse(job.priority), seq);
        state
            .queues
            .entry(job.routing_key)
            .or_default()
            .insert(key, PendingEntry { job, seq, retries: 0 });

        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Dequeue the best eligible job for the given subscription, blocking
    /// until one is available or the broker shuts down (`Ok(None)`).
    ///
    /// A subscription to `High` or `Low` also sees the `All` queue; a
    /// subscription to `All` sees only the `All` queue.
    pub async fn dequeue(&self, subscribed: &[RoutingKey]) -> BrokerResult<Option<Delivery>> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                return Ok(None);
            }

            // Register for wakeups before checking state, or a concurrent
            // enqueue between the check and the await would be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_dequeue(subscribed) {
                return Ok(Some(delivery));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// Non-blocking dequeue.
    pub fn try_dequeue(&self, subscribed: &[RoutingKey]) -> Option<Delivery> {
        let visible = visible_keys(subscribed);
        let mut state = self.lock_state();

        // Pick the smallest (Reverse(priority), seq) across visible queues:
        // highest priority first, oldest first within a band. Sequence
        // numbers are globally unique, so the order key never ties.
        let best = visible
            .iter()
            .filter_map(|rk| {
                let key = *state.queues.get(rk)?.keys().next()?;
                Some((key, *rk))
            })
            .min_by_key(|&(order, _)| order)?;

        let (order, rk) = best;
        let entry = state
            .queues
            .get_mut(&rk)
            .and_then(|q| q.remove(&order))
            .expect("peeked entry vanished under lock");

        let delivery_id = state.next_delivery;
        state.next_delivery += 1;

        let deadline = Instant::now() + self.config.lease_timeout;
        state.active.insert(
            delivery_id,
            ActiveEntry {
                job: entry.job.clone(),
                seq: entry.seq,
                retries: entry.retries,
                deadline,
            },
        );

        debug!(
            job_id = %entry.job.id,
            delivery_id,
            attempt = entry.retries + 1,
            "Delivered job"
        );

        Some(Delivery {
            id: DeliveryId(delivery_id),
            job: entry.job,
            attempt: entry.retries + 1,
            lease_deadline: deadline,
        })
    }

    /// Acknowledge a delivery: the job is done (either way) and leaves the
    /// broker entirely.
    pub fn ack(&self, id: DeliveryId) -> BrokerResult<()> {
        let mut state = self.lock_state();
        let entry = state
            .active
            .remove(&id.0)
            .ok_or(BrokerError::UnknownDelivery(id.0))?;
        state.known.remove(&entry.job.id);
        debug!(job_id = %entry.job.id, delivery_id = id.0, "Acknowledged delivery");
        Ok(())
    }

    /// Negative acknowledgment: requeue at the original priority, front of
    /// its band, or dead-letter once the retry budget is spent.
    pub fn nack(&self, id: DeliveryId, error: &str) -> BrokerResult<NackOutcome> {
        let mut state = self.lock_state();
        let outcome = self.fail_active_locked(&mut state, id.0, error)?;
        drop(state);

        if outcome == NackOutcome::Requeued {
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    /// Requeue every delivery whose lease has expired. Returns how many
    /// were reclaimed. Called periodically by the lease sweeper.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock_state();

        let expired: Vec<u64> = state
            .active
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            // Unknown-delivery cannot happen here: the ids were collected
            // under the same lock.
            if let Ok(outcome) = self.fail_active_locked(&mut state, *id, "delivery lease expired")
            {
                warn!(delivery_id = id, ?outcome, "Reclaimed expired delivery");
            }
        }

        let count = expired.len();
        drop(state);
        if count > 0 {
            self.notify.notify_waiters();
        }
        count
    }

    /// Spawn the background lease sweeper. Exits on broker shutdown.
    pub fn spawn_lease_sweeper(self: &std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let broker = std::sync::Arc::clone(self);
        let mut shutdown_rx = broker.shutdown.subscribe();
        let interval = broker.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        broker.sweep_expired();
                    }
                }
            }
        })
    }

    /// Signal shutdown: blocked dequeues return `Ok(None)` and the sweeper
    /// exits.
    pub fn shutdown(&self) {
        info!("Broker shutting down");
        let _ = self.shutdown.send(true);
        self.notify.notify_waiters();
    }

    /// Number of pending jobs on one routing key's queue.
    pub fn depth(&self, key: RoutingKey) -> usize {
        self.lock_state()
            .queues
            .get(&key)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Number of unacknowledged deliveries.
    pub fn in_flight(&self) -> usize {
        self.lock_state().active.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("broker state lock poisoned")
    }

    fn fail_active_locked(
        &self,
        state: &mut State,
        delivery_id: u64,
        error: &str,
    ) -> BrokerResult<NackOutcome> {
        let entry = state
            .active
            .remove(&delivery_id)
            .ok_or(BrokerError::UnknownDelivery(delivery_id))?;

        let retries = entry.retries + 1;

        if retries >= self.config.max_retries {
            state.known.remove(&entry.job.id);
            warn!(
                job_id = %entry.job.id,
                attempts = retries,
                "Retry budget exhausted, dead-lettering job"
            );
            // Receiver dropped means nobody is reaping dead letters; the
            // registry entry is then the only record of the failure.
            let _ = self.dead_tx.send(DeadLetter {
                job: entry.job,
                error: error.to_string(),
                attempts: retries,
            });
            return Ok(NackOutcome::DeadLettered);
        }

        debug!(
            job_id = %entry.job.id,
            retries,
            max_retries = self.config.max_retries,
            "Requeued job after failed attempt"
        );

        let key = (Reverse(entry.job.priority), entry.seq);
        state.queues.entry(entry.job.routing_key).or_default().insert(
            key,
            PendingEntry {
                job: entry.job,
                seq: entry.seq,
                retries,
            },
        );

        Ok(NackOutcome::Requeued)
    }
}

/// Expand a subscription into the set of queues it may dequeue from.
fn visible_keys(subscribed: &[RoutingKey]) -> Vec<RoutingKey> {
    let mut keys: Vec<RoutingKey> = Vec::with_capacity(3);
    for key in subscribed {
        if !keys.contains(key) {
            keys.push(*key);
        }
    }
    // Jobs routed to All are visible to every pool.
    if !keys.contains(&RoutingKey::All) {
        keys.push(RoutingKey::All);
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use encq_models::{EncodeParams, Job, JobKind};

    fn job(priority: u8, routing_key: RoutingKey) -> Job {
        Job::new(
            JobKind::Video,
            format!("input/{}_clip.mkv", uuid::Uuid::new_v4()),
            EncodeParams::default_for(JobKind::Video),
            priority,
            routing_key,
        )
    }

    fn broker() -> QueueBroker {
        QueueBroker::new(BrokerConfig {
            max_retries: 3,
            lease_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn strict_priority_with_fifo_tie_break() {
        let broker = broker();
        let low = job(2, RoutingKey::All);
        let high = job(9, RoutingKey::All);
        let first_mid = job(5, RoutingKey::All);
        let second_mid = job(5, RoutingKey::All);

        broker.enqueue(low.clone()).unwrap();
        broker.enqueue(first_mid.clone()).unwrap();
        broker.enqueue(second_mid.clone()).unwrap();
        broker.enqueue(high.clone()).unwrap();

        let order: Vec<JobId> = (0..4)
            .map(|_| broker.try_dequeue(&[RoutingKey::All]).unwrap().job.id)
            .collect();

        assert_eq!(order, vec![high.id, first_mid.id, second_mid.id, low.id]);
    }

    #[tokio::test]
    async fn routing_visibility() {
        let broker = broker();
        let high_job = job(5, RoutingKey::High);
        let all_job = job(5, RoutingKey::All);
        broker.enqueue(high_job.clone()).unwrap();
        broker.enqueue(all_job.clone()).unwrap();

        // Low subscribers never see the High queue.
        let got = broker.try_dequeue(&[RoutingKey::Low]).unwrap();
        assert_eq!(got.job.id, all_job.id);
        assert!(broker.try_dequeue(&[RoutingKey::Low]).is_none());

        // High subscribers do.
        let got = broker.try_dequeue(&[RoutingKey::High]).unwrap();
        assert_eq!(got.job.id, high_job.id);
    }

    #[tokio::test]
    async fn all_subscription_sees_only_all_queue() {
        let broker = broker();
        broker.enqueue(job(5, RoutingKey::High)).unwrap();
        assert!(broker.try_dequeue(&[RoutingKey::All]).is_none());
    }

    #[tokio::test]
    async fn no_double_delivery_under_concurrent_dequeue() {
        let broker = std::sync::Arc::new(broker());
        for _ in 0..20 {
            broker.enqueue(job(5, RoutingKey::All)).unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let broker = std::sync::Arc::clone(&broker);
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(d) = broker.try_dequeue(&[RoutingKey::All]) {
                    seen.push(d.job.id.clone());
                    broker.ack(d.id).unwrap();
                }
                seen
            }));
        }

        let mut all: Vec<JobId> = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        assert_eq!(all.len(), 20);
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), 20, "a job was delivered twice");
    }

    #[tokio::test]
    async fn nack_requeues_at_front_of_band() {
        let broker = broker();
        let first = job(5, RoutingKey::All);
        let second = job(5, RoutingKey::All);
        broker.enqueue(first.clone()).unwrap();
        broker.enqueue(second.clone()).unwrap();

        let d = broker.try_dequeue(&[RoutingKey::All]).unwrap();
        assert_eq!(d.job.id, first.id);
        assert_eq!(
            broker.nack(d.id, "encoder failed").unwrap(),
            NackOutcome::Requeued
        );

        // The retried job keeps its original position in the band.
        let d = broker.try_dequeue(&[RoutingKey::All]).unwrap();
        assert_eq!(d.job.id, first.id);
        assert_eq!(d.attempt, 2);
    }

    #[tokio::test]
    async fn retry_exhaustion_dead_letters_and_never_redelivers() {
        let broker = broker();
        let mut dead_rx = broker.take_dead_letters().unwrap();
        let j = job(5, RoutingKey::All);
        broker.enqueue(j.clone()).unwrap();

        for attempt in 1..=3 {
            let d = broker.try_dequeue(&[RoutingKey::All]).unwrap();
            assert_eq!(d.attempt, attempt);
            let outcome = broker.nack(d.id, "encoder failed").unwrap();
            if attempt < 3 {
                assert_eq!(outcome, NackOutcome::Requeued);
            } else {
                assert_eq!(outcome, NackOutcome::DeadLettered);
            }
        }

        // Never delivered a 4th time.
        assert!(broker.try_dequeue(&[RoutingKey::All]).is_none());
        assert_eq!(broker.in_flight(), 0);

        let dead = dead_rx.recv().await.unwrap();
        assert_eq!(dead.job.id, j.id);
        assert_eq!(dead.attempts, 3);
        assert_eq!(dead.error, "encoder failed");
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expiry_requeues_delivery() {
        let broker = QueueBroker::new(BrokerConfig {
            max_retries: 3,
            lease_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        });
        let j = job(5, RoutingKey::All);
        broker.enqueue(j.clone()).unwrap();

        let d = broker.try_dequeue(&[RoutingKey::All]).unwrap();
        assert_eq!(broker.sweep_expired(), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(broker.sweep_expired(), 1);

        // Reclaimed and eligible again; stale handle may no longer ack.
        let redelivered = broker.try_dequeue(&[RoutingKey::All]).unwrap();
        assert_eq!(redelivered.job.id, j.id);
        assert_eq!(redelivered.attempt, 2);
        assert!(matches!(
            broker.ack(d.id),
            Err(BrokerError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn fifo_holds_across_visible_queues() {
        let broker = broker();
        let first = job(5, RoutingKey::High);
        let second = job(5, RoutingKey::All);
        let third = job(5, RoutingKey::High);
        broker.enqueue(first.clone()).unwrap();
        broker.enqueue(second.clone()).unwrap();
        broker.enqueue(third.clone()).unwrap();

        // A High subscriber sees both queues; equal-priority jobs come
        // out in global insertion order regardless of which queue holds
        // them.
        let order: Vec<JobId> = (0..3)
            .map(|_| broker.try_dequeue(&[RoutingKey::High]).unwrap().job.id)
            .collect();
        assert_eq!(order, vec![first.id, second.id, third.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn renewed_lease_outlives_the_timeout() {
        let broker = QueueBroker::new(BrokerConfig {
            max_retries: 3,
            lease_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        });
        broker.enqueue(job(5, RoutingKey::All)).unwrap();
        let d = broker.try_dequeue(&[RoutingKey::All]).unwrap();

        // A holder that keeps renewing is never reclaimed, no matter how
        // long the work takes relative to one lease period.
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(20)).await;
            broker.extend_lease(d.id).unwrap();
            assert_eq!(broker.sweep_expired(), 0);
        }

        // The holder can still settle its delivery normally.
        broker.ack(d.id).unwrap();
        assert_eq!(broker.in_flight(), 0);

        // Renewal of a settled delivery is the invariant error.
        assert!(matches!(
            broker.extend_lease(d.id),
            Err(BrokerError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn ack_of_unknown_delivery_is_invariant_error() {
        let broker = broker();
        let err = broker.ack(DeliveryId(42)).unwrap_err();
        assert!(err.is_invariant());
    }

    #[tokio::test]
    async fn duplicate_enqueue_rejected() {
        let broker = broker();
        let j = job(5, RoutingKey::All);
        broker.enqueue(j.clone()).unwrap();
        let err = broker.enqueue(j).unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateJob(_)));
    }

    #[tokio::test]
    async fn blocking_dequeue_wakes_on_enqueue() {
        let broker = std::sync::Arc::new(broker());
        let waiter = {
            let broker = std::sync::Arc::clone(&broker);
            tokio::spawn(async move { broker.dequeue(&[RoutingKey::All]).await })
        };

        tokio::task::yield_now().await;
        let j = job(5, RoutingKey::All);
        broker.enqueue(j.clone()).unwrap();

        let delivered = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivered.job.id, j.id);
    }

    #[tokio::test]
    async fn shutdown_unblocks_dequeue() {
        let broker = std::sync::Arc::new(broker());
        let waiter = {
            let broker = std::sync::Arc::clone(&broker);
            tokio::spawn(async move { broker.dequeue(&[RoutingKey::All]).await })
        };

        tokio::task::yield_now().await;
        broker.shutdown();
        assert!(waiter.await.unwrap().unwrap().is_none());
    }
}
