use crate::collector::HostCollector;
use crate::config::{Config, HostConfig};
use crate::session::{CommandRunner, SshSession};
use crate::status::{HostStatus, StatusMap, StatusStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

struct CycleOutcome<R> {
    /// `None` when the host's task panicked; the poller rebuilds the
    /// collector from config on the next cycle.
    collector: Option<HostCollector<R>>,
    status: Option<HostStatus>,
}

/// Runs every collector's `fetch` concurrently, one blocking task per
/// host, and waits for all of them. Outcomes come back in input order.
async fn run_cycle<R>(collectors: Vec<HostCollector<R>>) -> Vec<CycleOutcome<R>>
where
    R: CommandRunner + Send + 'static,
{
    let mut handles = Vec::with_capacity(collectors.len());
    for mut collector in collectors {
        handles.push(task::spawn_blocking(move || {
            let result = collector.fetch();
            (collector, result)
        }));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        let outcome = match handle.await {
            Ok((collector, Ok(status))) => CycleOutcome {
                collector: Some(collector),
                status: Some(status),
            },
            Ok((collector, Err(err))) => {
                warn!(host = %collector.name(), error = %err, "fetch failed, keeping previous status");
                CycleOutcome {
                    collector: Some(collector),
                    status: None,
                }
            }
            Err(err) => {
                error!(error = %err, "host collection task panicked");
                CycleOutcome {
                    collector: None,
                    status: None,
                }
            }
        };
        outcomes.push(outcome);
    }
    outcomes
}

/// One full polling pass: collect all hosts concurrently, then publish
/// the successes as a single merge. Hosts that failed keep whatever the
/// store already holds for them. Returns the collectors in input order,
/// with `None` where a task panicked.
pub async fn poll_once<R>(
    collectors: Vec<HostCollector<R>>,
    store: &StatusStore,
) -> Vec<Option<HostCollector<R>>>
where
    R: CommandRunner + Send + 'static,
{
    let mut updates = StatusMap::new();
    let mut returned = Vec::new();
    for outcome in run_cycle(collectors).await {
        if let (Some(collector), Some(status)) = (&outcome.collector, outcome.status) {
            updates.insert(collector.name().to_string(), status);
        }
        returned.push(outcome.collector);
    }
    store.publish(updates).await;
    returned
}

/// Drives the whole fleet on the configured cadence until the shutdown
/// signal fires. Cycles never overlap: each tick waits for every host
/// before publishing and sleeping again.
pub struct Poller {
    config: Config,
    store: Arc<StatusStore>,
}

impl Poller {
    pub fn new(config: Config, store: Arc<StatusStore>) -> Self {
        Self { config, store }
    }

    fn new_collector(&self, host: &HostConfig) -> HostCollector<SshSession> {
        let session = SshSession::new(
            host.clone(),
            Duration::from_millis(self.config.connect_timeout_ms),
            Duration::from_millis(self.config.command_timeout_ms),
        );
        HostCollector::new(host.name.clone(), session)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut collectors: Vec<Option<HostCollector<SshSession>>> =
            self.config.hosts.iter().map(|_| None).collect();

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.refresh_interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("received shutdown signal, stopping poller");
                    break;
                }
                _ = ticker.tick() => {
                    for (slot, host) in collectors.iter_mut().zip(&self.config.hosts) {
                        if slot.is_none() {
                            *slot = Some(self.new_collector(host));
                        }
                    }
                    let batch: Vec<_> = collectors.drain(..).flatten().collect();
                    collectors = poll_once(batch, &self.store).await;
                }
            }
        }

        // Explicit session teardown instead of relying on drop order.
        let remaining: Vec<_> = collectors.into_iter().flatten().collect();
        let _ = task::spawn_blocking(move || {
            for mut collector in remaining {
                collector.close();
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::tests::{
        expected_healthy_status, healthy_runner, ScriptedRunner, CPU_OUTPUT, MEMORY_OUTPUT,
    };
    use crate::collector::{CPU_COMMAND, GPU_COMMAND, MEMORY_COMMAND};

    fn failing_runner() -> ScriptedRunner {
        ScriptedRunner::new([
            (GPU_COMMAND, Err(())),
            (CPU_COMMAND, Err(())),
            (MEMORY_COMMAND, Err(())),
        ])
    }

    #[tokio::test]
    async fn failed_host_keeps_previous_entry_while_healthy_host_updates() {
        let store = StatusStore::new();

        // First cycle: both hosts healthy.
        let collectors = vec![
            HostCollector::new("a".to_string(), healthy_runner()),
            HostCollector::new("b".to_string(), healthy_runner()),
        ];
        poll_once(collectors, &store).await;
        let first = store.snapshot().await;
        assert_eq!(first.len(), 2);

        // Second cycle: "a" down entirely, "b" reports different cpu load.
        let b_runner = ScriptedRunner::new([
            (
                GPU_COMMAND,
                Ok("name, memory.used [MiB], memory.total [MiB]\nNVIDIA GeForce RTX 3090, 12288 MiB, 24576 MiB\n"),
            ),
            (CPU_COMMAND, Ok(CPU_OUTPUT)),
            (MEMORY_COMMAND, Ok(MEMORY_OUTPUT)),
        ]);
        let collectors = vec![
            HostCollector::new("a".to_string(), failing_runner()),
            HostCollector::new("b".to_string(), b_runner),
        ];
        poll_once(collectors, &store).await;

        let second = store.snapshot().await;
        assert_eq!(second["a"], first["a"], "stale entry must be retained");
        assert_eq!(second["b"].gpus[0].usage_percentage, 50.0);
    }

    #[tokio::test]
    async fn never_collected_host_stays_absent() {
        let store = StatusStore::new();
        let collectors = vec![HostCollector::new("a".to_string(), failing_runner())];
        poll_once(collectors, &store).await;
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn two_host_round_trip_matches_expected_values() {
        let store = StatusStore::new();
        let collectors = vec![
            HostCollector::new("a".to_string(), healthy_runner()),
            HostCollector::new("b".to_string(), healthy_runner()),
        ];
        let returned = poll_once(collectors, &store).await;
        assert!(returned.iter().all(Option::is_some));

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot["a"], expected_healthy_status());
        assert_eq!(snapshot["b"], expected_healthy_status());
    }

    #[tokio::test]
    async fn consecutive_cycles_with_identical_output_are_idempotent() {
        let store = StatusStore::new();
        let mut collectors = vec![HostCollector::new("a".to_string(), healthy_runner())];
        for _ in 0..2 {
            let returned = poll_once(collectors, &store).await;
            collectors = returned.into_iter().flatten().collect();
        }
        assert_eq!(store.snapshot().await["a"], expected_healthy_status());
    }
}
