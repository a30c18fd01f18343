//! Deferred side effects of a transaction.
//!
//! Entries are plain data. A queue is filled while a context proposes or
//! progresses and can only be taken out of a committed context, so nothing is
//! delivered for a transaction whose journal write failed. Delivery is
//! at-least-once from the consumer's point of view: a redelivered entry must
//! be harmless.

use crate::catalog::PathId;
use crate::operation::OperationId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionEntry {
    PublishNamespaceChange {
        op_id: OperationId,
        path_id: PathId,
    },
    FinalizeOperation {
        op_id: OperationId,
    },
}

impl CompletionEntry {
    pub fn op_id(&self) -> OperationId {
        match self {
            CompletionEntry::PublishNamespaceChange { op_id, .. } => *op_id,
            CompletionEntry::FinalizeOperation { op_id } => *op_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionQueue {
    entries: VecDeque<CompletionEntry>,
}

impl CompletionQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompletionEntry> {
        self.entries.iter()
    }

    pub(crate) fn push(&mut self, entry: CompletionEntry) {
        self.entries.push_back(entry);
    }

    /// Delivers every entry in queue order to every sink.
    ///
    /// A panicking sink is logged and skipped; the remaining sinks and
    /// entries are still delivered.
    pub(crate) fn flush(self, sinks: &[Arc<dyn CompletionSink>]) -> Vec<CompletionEntry> {
        let entries: Vec<CompletionEntry> = self.entries.into_iter().collect();
        for entry in &entries {
            for sink in sinks {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink.deliver(entry)))
                    .is_err()
                {
                    warn!(op_id = %entry.op_id(), "completion sink panicked while delivering entry");
                }
            }
        }
        debug!(entries = entries.len(), sinks = sinks.len(), "flushed completions");
        entries
    }
}

/// Messaging substrate that receives entries after commit.
pub trait CompletionSink: Send + Sync {
    fn deliver(&self, entry: &CompletionEntry);
}

/// Forwards entries into a tokio channel for an async consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<CompletionEntry>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CompletionEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CompletionSink for ChannelSink {
    fn deliver(&self, entry: &CompletionEntry) {
        if self.tx.send(entry.clone()).is_err() {
            debug!(op_id = %entry.op_id(), "completion receiver dropped");
        }
    }
}
