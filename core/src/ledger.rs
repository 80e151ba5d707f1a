//! Offsets of processed records awaiting a commit.
//!
//! Only offsets whose processing has returned are ever recorded, so whatever
//! the ledger commits is safe to skip on redelivery.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::errors::BrokerError;
use crate::source::{OffsetCommitter, OffsetRecord, RebalanceEvent, RebalanceHandler, format_offsets};

pub const DEFAULT_COMMIT_MODULO: i64 = 10;

/// Shared between the poll loop and the rebalance hook running inside poll.
pub type SharedLedger = Arc<Mutex<OffsetLedger>>;

#[derive(Debug)]
pub struct OffsetLedger {
    pending: Vec<OffsetRecord>,
    commit_modulo: i64,
}

impl Default for OffsetLedger {
    fn default() -> Self {
        Self::new(DEFAULT_COMMIT_MODULO)
    }
}

impl OffsetLedger {
    pub fn new(commit_modulo: i64) -> Self {
        Self {
            pending: Vec::new(),
            commit_modulo: commit_modulo.max(1),
        }
    }

    pub fn shared(commit_modulo: i64) -> SharedLedger {
        Arc::new(Mutex::new(Self::new(commit_modulo)))
    }

    pub fn record(&mut self, record: OffsetRecord) {
        self.pending.push(record);
    }

    /// Commits are triggered by offset value, not by how many records are pending.
    pub fn should_commit(&self, record: &OffsetRecord) -> bool {
        record.offset % self.commit_modulo == 0
    }

    /// Commits everything pending. Pending records survive a failed commit.
    pub fn commit_pending<C: OffsetCommitter + ?Sized>(
        &mut self,
        committer: &mut C,
    ) -> Result<Vec<OffsetRecord>, BrokerError> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let committed = committer.commit_offsets(&self.pending)?;
        info!(
            "offsets committed ([partition:offset]): {}",
            format_offsets(&committed)
        );
        self.pending.clear();
        Ok(committed)
    }

    /// Commit attempt made before partitions are revoked. Failures are only logged.
    pub fn flush_on_rebalance<C: OffsetCommitter + ?Sized>(&mut self, committer: &mut C) {
        if committer.assignment_lost() {
            warn!("assignment lost involuntarily, commit may fail");
        }
        if let Err(e) = self.commit_pending(committer) {
            warn!(error = %e, pending = self.pending.len(), "failed to commit offsets on rebalance");
        }
    }

    pub fn pending(&self) -> &[OffsetRecord] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Rebalance hook that flushes the ledger before partitions are revoked.
pub struct LedgerRebalanceHandler {
    ledger: SharedLedger,
}

impl LedgerRebalanceHandler {
    pub fn new(ledger: SharedLedger) -> Self {
        Self { ledger }
    }
}

impl RebalanceHandler for LedgerRebalanceHandler {
    fn on_rebalance(&mut self, event: &RebalanceEvent, committer: &mut dyn OffsetCommitter) {
        match event {
            RebalanceEvent::Assigned(partitions) => {
                warn!(count = partitions.len(), ?partitions, "consumer rebalance: partition(s) assigned");
            }
            RebalanceEvent::Revoked(partitions) => {
                warn!(count = partitions.len(), ?partitions, "consumer rebalance: partition(s) revoked");
                self.ledger.lock().flush_on_rebalance(committer);
            }
            RebalanceEvent::Failed(reason) => {
                warn!(%reason, "consumer rebalance failed");
            }
        }
    }
}
