//! Worker lifecycles: poll, outbox, reaper, and offer-sync loops as tokio
//! tasks with watch-channel shutdown and health reporting.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use numio_adapter::ProviderAdapter;
use numio_rpc::{HealthBoard, WorkerHealth};

use crate::Node;

#[derive(Clone, Copy, Debug)]
pub struct WorkerIntervals {
    pub poll_secs: u64,
    pub outbox_secs: u64,
    pub reaper_secs: u64,
    pub offer_sync_secs: u64,
}

impl Default for WorkerIntervals {
    fn default() -> Self {
        Self {
            poll_secs: 3,
            outbox_secs: 2,
            reaper_secs: numio_core::REAPER_INTERVAL_SECS,
            offer_sync_secs: 300,
        }
    }
}

pub struct WorkerHandles {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandles {
    /// Signal every worker and wait for the loops to drain.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("workers stopped");
    }
}

/// Spawn the four periodic workers.
pub fn spawn_workers(node: &Node, intervals: WorkerIntervals) -> WorkerHandles {
    let (shutdown, _) = watch::channel(false);
    let mut tasks = Vec::new();

    // ── Poll worker ──────────────────────────────────────────────────────────
    {
        let poll = Arc::clone(&node.poll);
        let health = Arc::clone(&node.health);
        let mut rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(intervals.poll_secs));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let result = poll.run_cycle().await;
                        report(&health, "poll", result.err().map(|e| e.to_string()));
                    }
                    _ = rx.changed() => break,
                }
            }
            mark_stopped(&health, "poll");
        }));
    }

    // ── Outbox worker ────────────────────────────────────────────────────────
    {
        let dispatcher = Arc::clone(&node.dispatcher);
        let health = Arc::clone(&node.health);
        let mut rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(intervals.outbox_secs));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let result = dispatcher.run_once().await;
                        report(&health, "outbox", result.err().map(|e| e.to_string()));
                    }
                    _ = rx.changed() => break,
                }
            }
            mark_stopped(&health, "outbox");
        }));
    }

    // ── Reaper worker ────────────────────────────────────────────────────────
    {
        let reaper = Arc::clone(&node.reaper);
        let health = Arc::clone(&node.health);
        let mut rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(intervals.reaper_secs));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let result = reaper.run_once().await;
                        report(&health, "reaper", result.err().map(|e| e.to_string()));
                    }
                    _ = rx.changed() => break,
                }
            }
            mark_stopped(&health, "reaper");
        }));
    }

    // ── Offer-sync worker ────────────────────────────────────────────────────
    {
        let sync = Arc::clone(&node.offer_sync);
        let adapters = node.adapters.clone();
        let kernel = Arc::clone(&node.kernel);
        let index = Arc::clone(&node.index);
        let health = Arc::clone(&node.health);
        let mut rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_secs(intervals.offer_sync_secs));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let mut last_error = None;
                        for provider_id in adapters.provider_ids() {
                            let Ok(adapter) = adapters.get(&provider_id) else { continue };
                            if !adapter.supports_offers() {
                                continue;
                            }
                            let now = kernel.now();
                            if let Err(e) = sync
                                .sync_provider(adapter.as_ref(), index.as_ref(), now)
                                .await
                            {
                                warn!(provider = %provider_id, error = %e, "offer sync failed");
                                last_error = Some(e.to_string());
                            }
                        }
                        report(&health, "offer_sync", last_error);
                    }
                    _ = rx.changed() => break,
                }
            }
            mark_stopped(&health, "offer_sync");
        }));
    }

    WorkerHandles { shutdown, tasks }
}

fn report(health: &HealthBoard, worker: &str, error: Option<String>) {
    health.report(
        worker,
        WorkerHealth {
            running: true,
            last_cycle_at: Some(chrono::Utc::now().timestamp()),
            last_error: error,
        },
    );
}

fn mark_stopped(health: &HealthBoard, worker: &str) {
    health.report(
        worker,
        WorkerHealth { running: false, last_cycle_at: None, last_error: None },
    );
}
