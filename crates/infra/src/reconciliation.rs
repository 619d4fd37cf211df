//! Timeout sweep for batches stuck awaiting acknowledgement.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use branchledger_accounting::{BatchEvent, PostingError, StagedBatch};
use branchledger_core::{BranchId, TransactionRef};
use branchledger_events::{EventBus, EventEnvelope};

use crate::engine::PostingEngine;
use crate::gateway::BranchGateway;
use crate::store::{LedgerStore, StagedBatchStore};

/// Operator-facing report of a batch that needs manual reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationNotice {
    pub reference: TransactionRef,
    pub originating_branch: BranchId,
    /// Required branches without an approval.
    pub pending: Vec<BranchId>,
    /// Branches whose request never got through.
    pub undelivered: Vec<BranchId>,
    pub staged_at: Option<DateTime<Utc>>,
    pub flagged_at: DateTime<Utc>,
    pub error: PostingError,
}

impl ReconciliationNotice {
    pub fn for_batch(staged: &StagedBatch, flagged_at: DateTime<Utc>) -> Option<Self> {
        let pending = staged.pending_acknowledgers();
        Some(Self {
            reference: staged.reference().clone(),
            originating_branch: staged.originating_branch()?.clone(),
            undelivered: staged.undelivered(),
            staged_at: staged.staged_at(),
            flagged_at,
            error: PostingError::AcknowledgementTimeout {
                reference: staged.reference().clone(),
                pending: pending.clone(),
            },
            pending,
        })
    }
}

/// Sweeper runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweeperStats {
    pub passes: u64,
    pub failed_passes: u64,
    pub flagged: u64,
    pub redispatched: u64,
}

/// Handle to control a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SweeperStats>>,
}

impl SweeperHandle {
    /// Stop after the current pass and wait for the task to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(error = %err, "reconciliation sweeper ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> SweeperStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl<S, L, G, A, N> PostingEngine<S, L, G, A, N>
where
    S: StagedBatchStore + 'static,
    L: LedgerStore + 'static,
    G: BranchGateway + 'static,
    A: EventBus<EventEnvelope<BatchEvent>> + 'static,
    N: EventBus<ReconciliationNotice> + 'static,
{
    /// Run [`PostingEngine::sweep`] every `sweep_interval` on the current runtime.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let interval = self.config().sweep_interval.max(Duration::from_millis(1));
        let engine = Arc::clone(self);
        let stats = Arc::new(Mutex::new(SweeperStats::default()));
        let task_stats = Arc::clone(&stats);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {}
                }

                let result = engine.sweep(Utc::now()).await;
                let mut stats = task_stats.lock().unwrap_or_else(PoisonError::into_inner);
                stats.passes += 1;
                match result {
                    Ok(report) => {
                        stats.flagged += report.flagged.len() as u64;
                        stats.redispatched += report.redispatched as u64;
                    }
                    Err(err) => {
                        stats.failed_passes += 1;
                        warn!(error = %err, "reconciliation pass failed");
                    }
                }
                drop(stats);
            }
            debug!("reconciliation sweeper stopped");
        });

        SweeperHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
            stats,
        }
    }
}
