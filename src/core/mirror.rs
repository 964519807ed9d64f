//! Mirror-write reconciliation.
//!
//! Mirror writes that fail, or that are skipped because their target is
//! unhealthy, are parked in a bounded [`MirrorQueue`]. The [`Reconciler`]
//! replays them once the target is healthy again. Replays reuse the original
//! idempotency key, so a write that already landed is not applied twice.

use crate::config::MirrorConfig;
use crate::core::backend::{execute_with_metrics, WriteOp};
use crate::core::health::HealthRegistry;
use crate::core::metrics::LayerMetrics;
use crate::core::replica::ShardGroup;
use crate::core::shard::ShardGroupId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// A write still owed to one backend
#[derive(Debug, Clone)]
pub struct PendingMirror {
    pub op: WriteOp,
    pub group: ShardGroupId,
    pub target: String,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingMirror {
    pub fn new(op: WriteOp, group: ShardGroupId, target: impl Into<String>) -> Self {
        Self {
            op,
            group,
            target: target.into(),
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }
}

/// Bounded FIFO of pending mirror writes; overflow drops the oldest entry
pub struct MirrorQueue {
    capacity: usize,
    entries: Mutex<VecDeque<PendingMirror>>,
    metrics: Arc<LayerMetrics>,
}

impl MirrorQueue {
    pub fn new(capacity: usize, metrics: Arc<LayerMetrics>) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, pending: PendingMirror) {
        let mut entries = self.entries.lock();
        entries.push_back(pending);
        self.trim(&mut entries);
    }

    fn drain(&self) -> Vec<PendingMirror> {
        self.entries.lock().drain(..).collect()
    }

    /// Put entries back ahead of anything queued since they were drained
    fn requeue(&self, pending: Vec<PendingMirror>) {
        let mut entries = self.entries.lock();
        for entry in pending.into_iter().rev() {
            entries.push_front(entry);
        }
        self.trim(&mut entries);
    }

    fn trim(&self, entries: &mut VecDeque<PendingMirror>) {
        while entries.len() > self.capacity {
            if let Some(dropped) = entries.pop_front() {
                self.metrics.record_mirror_dropped();
                warn!(
                    target_backend = %dropped.target,
                    key = %dropped.op.idempotency_key,
                    "Mirror queue full, dropping oldest pending write"
                );
            }
        }
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub repaired: usize,
    pub retried: usize,
    pub deferred: usize,
    pub abandoned: usize,
}

/// Periodic replay of pending mirror writes
pub struct Reconciler {
    config: MirrorConfig,
    queue: Arc<MirrorQueue>,
    groups: Vec<Arc<ShardGroup>>,
    registry: Arc<HealthRegistry>,
    metrics: Arc<LayerMetrics>,
}

impl Reconciler {
    pub fn new(
        config: MirrorConfig,
        queue: Arc<MirrorQueue>,
        groups: Vec<Arc<ShardGroup>>,
        registry: Arc<HealthRegistry>,
        metrics: Arc<LayerMetrics>,
    ) -> Self {
        Self {
            config,
            queue,
            groups,
            registry,
            metrics,
        }
    }

    /// Replay every pending write whose target is healthy and active
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut keep = Vec::new();

        for mut pending in self.queue.drain() {
            let backend = self
                .groups
                .get(pending.group.index())
                .and_then(|group| group.find(&pending.target));

            let Some(backend) = backend else {
                error!(
                    "Abandoning mirror write {}: backend '{}' is not part of {}",
                    pending.op.idempotency_key, pending.target, pending.group
                );
                self.metrics.record_mirror_abandoned();
                report.abandoned += 1;
                continue;
            };

            if !backend.descriptor().is_active() || !self.registry.is_healthy(&pending.target) {
                report.deferred += 1;
                keep.push(pending);
                continue;
            }

            let result = execute_with_metrics(backend.as_ref(), backend.apply(&pending.op)).await;
            match result {
                Ok(_) => {
                    self.metrics.record_mirror_repaired();
                    report.repaired += 1;
                }
                Err(e) => {
                    pending.attempts += 1;
                    if pending.attempts >= self.config.max_attempts {
                        error!(
                            "Abandoning mirror write {} to '{}' after {} attempts: {}",
                            pending.op.idempotency_key, pending.target, pending.attempts, e
                        );
                        self.metrics.record_mirror_abandoned();
                        report.abandoned += 1;
                    } else {
                        warn!(
                            "Mirror repair to '{}' failed (attempt {}): {}",
                            pending.target, pending.attempts, e
                        );
                        report.retried += 1;
                        keep.push(pending);
                    }
                }
            }
        }

        self.queue.requeue(keep);
        report
    }

    /// Reconcile on a fixed interval until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = std::time::Duration::from_secs(self.config.reconcile_interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Mirror reconciler started, interval {:?}", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.queue.is_empty() {
                        continue;
                    }
                    let report = self.reconcile_once().await;
                    info!(
                        repaired = report.repaired,
                        retried = report.retried,
                        deferred = report.deferred,
                        abandoned = report.abandoned,
                        pending = self.queue.len(),
                        "Mirror reconciliation pass"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Mirror reconciler stopped");
    }
}
