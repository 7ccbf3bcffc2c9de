//! Worker execution loop.
//!
//! One `Worker` holds at most `concurrency` deliveries at a time. Each
//! delivery runs: mark Running, download the input into per-attempt
//! scratch space, encode, upload to the derived output locator, mark
//! Succeeded, ack. Any failure nacks the delivery back to the broker;
//! once the retry budget is spent the dead-letter reaper records the
//! terminal failure. Scratch space is a `TempDir`, so temp artifacts
//! disappear on every path, success or not.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use encq_broker::{Delivery, DeliveryId, NackOutcome, QueueBroker};
use encq_media::Encoder;
use encq_models::JobId;
use encq_registry::JobStore;
use encq_storage::BlobStore;

use crate::config::WorkerConfig;
use crate::directory::{Availability, StatusProbe, WorkerDirectory, WorkerStatus};
use crate::error::WorkerResult;

/// A single worker consuming deliveries from the broker.
pub struct Worker {
    id: String,
    config: WorkerConfig,
    broker: Arc<QueueBroker>,
    store: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    encoder: Arc<dyn Encoder>,
    directory: Arc<WorkerDirectory>,
    semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    active: AtomicUsize,
    reserved: AtomicUsize,
    // Deliveries this worker currently owes an ack or nack. Whoever
    // removes an entry (the execute task, or the shutdown drain) owns
    // the acknowledgment for it.
    in_flight: Mutex<HashMap<DeliveryId, JobId>>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        broker: Arc<QueueBroker>,
        store: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        encoder: Arc<dyn Encoder>,
        directory: Arc<WorkerDirectory>,
    ) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            id: format!("worker-{}", Uuid::new_v4()),
            config,
            broker,
            store,
            blobs,
            encoder,
            directory,
            semaphore,
            shutdown,
            active: AtomicUsize::new(0),
            reserved: AtomicUsize::new(0),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Self-reported load, answered to status probes.
    pub fn status(&self) -> WorkerStatus {
        let active = self.active.load(Ordering::SeqCst);
        let reserved = self.reserved.load(Ordering::SeqCst);
        WorkerStatus {
            active,
            reserved,
            scheduled: 0,
            status: if active + reserved > 0 {
                Availability::Busy
            } else {
                Availability::Available
            },
        }
    }

    /// Signal shutdown. The run loop stops claiming new deliveries,
    /// drains in-flight ones, and nacks whatever cannot finish in time.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Run until shutdown or broker close.
    pub async fn run(self: &Arc<Self>) -> WorkerResult<()> {
        tokio::fs::create_dir_all(&self.config.work_dir).await?;

        let probe_rx = self
            .directory
            .register(&self.id, &self.config.subscriptions);
        let probe_task = self.spawn_probe_task(probe_rx);

        let mut shutdown_rx = self.shutdown.subscribe();
        info!(
            worker_id = %self.id,
            queues = ?self.config.subscriptions,
            concurrency = self.config.concurrency,
            "Worker started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // Claim a concurrency slot before asking the broker for work,
            // so a full worker never holds an unstarted delivery.
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let delivery = tokio::select! {
                _ = shutdown_rx.changed() => continue,
                result = self.broker.dequeue(&self.config.subscriptions) => {
                    match result? {
                        Some(delivery) => delivery,
                        // Broker shut down.
                        None => break,
                    }
                }
            };

            self.reserved.fetch_add(1, Ordering::SeqCst);
            self.lock_in_flight()
                .insert(delivery.id, delivery.job.id.clone());

            let worker = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                worker.execute(delivery).await;
            });
        }

        self.drain().await;
        probe_task.abort();
        self.directory.deregister(&self.id);
        info!(worker_id = %self.id, "Worker stopped");
        Ok(())
    }

    /// Execute one delivery and settle it with the broker.
    async fn execute(&self, delivery: Delivery) {
        let job_id = delivery.job.id.clone();
        self.reserved.fetch_sub(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);

        let renewal = self.spawn_lease_renewal(delivery.id);
        let result = self.run_attempt(&delivery).await;
        renewal.abort();

        self.active.fetch_sub(1, Ordering::SeqCst);

        // The drain may have already nacked this delivery; only settle it
        // if we still own it.
        if self.lock_in_flight().remove(&delivery.id).is_none() {
            return;
        }

        match result {
            Ok(()) => {
                if let Err(e) = self.broker.ack(delivery.id) {
                    error!(job_id = %job_id, "Failed to ack delivery: {}", e);
                }
            }
            Err(e) => {
                warn!(
                    job_id = %job_id,
                    attempt = delivery.attempt,
                    "Attempt failed: {}", e
                );
                match self.broker.nack(delivery.id, &e.to_string()) {
                    Ok(NackOutcome::Requeued) => {
                        info!(job_id = %job_id, "Job requeued for retry");
                    }
                    Ok(NackOutcome::DeadLettered) => {
                        warn!(job_id = %job_id, "Job dead-lettered");
                    }
                    Err(e) => {
                        error!(job_id = %job_id, "Failed to nack delivery: {}", e);
                    }
                }
            }
        }
    }

    /// One end-to-end attempt: registry transition, transfer, encode,
    /// transfer, registry transition.
    async fn run_attempt(&self, delivery: &Delivery) -> WorkerResult<()> {
        let job = self
            .store
            .mark_running(&delivery.job.id, Utc::now(), delivery.attempt)
            .await?;

        info!(
            job_id = %job.id,
            worker_id = %self.id,
            kind = %job.kind,
            attempt = delivery.attempt,
            input = %job.input_locator,
            "Job running"
        );

        let scratch = tempfile::TempDir::new_in(&self.config.work_dir)?;
        let input_path = scratch.path().join(locator_file_name(&job.input_locator));
        let output_path = scratch.path().join(locator_file_name(&job.output_locator));

        self.blobs
            .download_file(&job.input_locator, &input_path)
            .await?;
        debug!(job_id = %job.id, "Input downloaded");

        self.encoder
            .encode(&job.params, &input_path, &output_path)
            .await?;
        debug!(job_id = %job.id, "Encode finished");

        self.blobs
            .upload_file(&output_path, &job.output_locator)
            .await?;

        self.store.mark_succeeded(&job.id, Utc::now()).await?;
        info!(
            job_id = %job.id,
            output = %job.output_locator,
            "Job succeeded"
        );
        Ok(())
        // scratch drops here; temp artifacts are gone on every path
    }

    /// Keep an active delivery's lease alive while its attempt runs. An
    /// encode may take many lease periods; without renewal the sweeper
    /// would reclaim and redeliver a job that is still making progress.
    /// Aborted by `execute` once the attempt settles.
    fn spawn_lease_renewal(&self, id: DeliveryId) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let period = broker.lease_timeout() / 2;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                // Unknown delivery means the lease was already reclaimed
                // or settled; nothing left to renew.
                if broker.extend_lease(id).is_err() {
                    break;
                }
            }
        })
    }

    /// Answer status probes and refresh the directory heartbeat until
    /// shutdown.
    fn spawn_probe_task(
        self: &Arc<Self>,
        mut probe_rx: mpsc::Receiver<StatusProbe>,
    ) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        let mut shutdown_rx = worker.shutdown.subscribe();

        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(worker.config.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = heartbeat.tick() => {
                        worker.directory.heartbeat(&worker.id);
                    }
                    probe = probe_rx.recv() => {
                        match probe {
                            Some(probe) => {
                                let _ = probe.reply.send(worker.status());
                            }
                            None => break,
                        }
                    }
                }
            }
        })
    }

    /// Wait for in-flight deliveries, then nack the stragglers so another
    /// worker can pick them up.
    async fn drain(&self) {
        let idle = async {
            loop {
                let busy =
                    self.active.load(Ordering::SeqCst) + self.reserved.load(Ordering::SeqCst);
                if busy == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };

        if tokio::time::timeout(self.config.shutdown_timeout, idle)
            .await
            .is_ok()
        {
            return;
        }

        let stragglers: Vec<(DeliveryId, JobId)> =
            self.lock_in_flight().drain().collect();
        for (delivery_id, job_id) in stragglers {
            warn!(
                job_id = %job_id,
                delivery_id = %delivery_id,
                "Nacking unfinished delivery at shutdown"
            );
            if let Err(e) = self.broker.nack(delivery_id, "worker shutting down") {
                error!(job_id = %job_id, "Failed to nack at shutdown: {}", e);
            }
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<DeliveryId, JobId>> {
        self.in_flight.lock().expect("in-flight lock poisoned")
    }
}

/// Last path segment of a locator, for naming scratch files.
fn locator_file_name(locator: &str) -> &str {
    Path::new(locator)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(locator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_file_name_takes_last_segment() {
        assert_eq!(locator_file_name("input/abc_clip.mkv"), "abc_clip.mkv");
        assert_eq!(locator_file_name("clip.mkv"), "clip.mkv");
    }
}
