//! Worker configuration.

use std::time::Duration;

use encq_models::RoutingKey;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Routing keys this worker consumes. Subscribing to `High` or `Low`
    /// also makes the `All` queue visible, so the default subscription
    /// sees every queue.
    pub subscriptions: Vec<RoutingKey>,
    /// Maximum concurrent deliveries held by this worker
    pub concurrency: usize,
    /// Directory for per-attempt scratch space
    pub work_dir: String,
    /// How often the worker refreshes its directory heartbeat
    pub heartbeat_interval: Duration,
    /// How stale a heartbeat may be before the directory prunes the worker
    pub heartbeat_grace: Duration,
    /// Graceful shutdown timeout; in-flight deliveries still running after
    /// this are nacked back to the broker
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            subscriptions: vec![RoutingKey::High, RoutingKey::Low],
            concurrency: 1,
            work_dir: "/tmp/encq".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_grace: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let subscriptions = std::env::var("WORKER_QUEUES")
            .ok()
            .map(|s| {
                s.split(',')
                    .filter_map(|q| q.trim().parse().ok())
                    .collect::<Vec<RoutingKey>>()
            })
            .filter(|keys| !keys.is_empty())
            .unwrap_or_else(|| vec![RoutingKey::High, RoutingKey::Low]);

        Self {
            subscriptions,
            concurrency: std::env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .unwrap_or_else(|_| "/tmp/encq".to_string()),
            heartbeat_interval: Duration::from_secs(
                std::env::var("WORKER_HEARTBEAT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            ),
            heartbeat_grace: Duration::from_secs(
                std::env::var("WORKER_HEARTBEAT_GRACE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_subscription_sees_every_queue() {
        let config = WorkerConfig::default();
        assert!(config.subscriptions.contains(&RoutingKey::High));
        assert!(config.subscriptions.contains(&RoutingKey::Low));
        assert_eq!(config.concurrency, 1);
    }
}
