pub mod file;
pub mod frame;

use crate::catalog::PathId;
use crate::catalog::node::PathNode;
use crate::catalog::stream::StreamGroupInfo;
use crate::error::MetaError;
use crate::operation::{OperationId, StepId, TxId, TxStateRecord};
use crate::quota::{DomainConfig, DomainInfo};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One persistent write staged by an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalRecord {
    /// Full node image; replay overwrites the slot.
    Path(PathNode),
    DropStep {
        path_id: PathId,
        tx_id: TxId,
        step: StepId,
    },
    UserAttrs {
        path_id: PathId,
        attrs: BTreeMap<String, String>,
    },
    StreamGroup {
        path_id: PathId,
        info: StreamGroupInfo,
    },
    RemoveStreamGroup {
        path_id: PathId,
    },
    DirAlterVersion {
        path_id: PathId,
        version: u64,
    },
    DomainCounters {
        domain_id: PathId,
        info: DomainInfo,
    },
    DomainConfig {
        domain_id: PathId,
        config: DomainConfig,
    },
    TxState {
        op_id: OperationId,
        state: Option<TxStateRecord>,
    },
}

/// Records of one committed transaction, applied as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalBatch {
    pub seq: u64,
    pub tx_id: TxId,
    pub records: Vec<JournalRecord>,
}

impl JournalBatch {
    pub fn encode(&self) -> Result<Vec<u8>, MetaError> {
        rmp_serde::to_vec(self).map_err(|e| MetaError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MetaError> {
        rmp_serde::from_slice(bytes).map_err(|e| MetaError::Decode(e.to_string()))
    }
}

/// Durability boundary consumed by the engine.
///
/// `append` either persists the whole batch or returns an error and persists
/// nothing; the engine treats an error as rollback of the transaction.
pub trait Journal: Send {
    fn append(&mut self, batch: &JournalBatch) -> Result<(), MetaError>;
    fn replay(&mut self) -> Result<Vec<JournalBatch>, MetaError>;
}

#[derive(Debug, Default)]
struct MemoryJournalInner {
    batches: Vec<Vec<u8>>,
    fail_next: usize,
}

/// In-memory journal keeping encoded batches.
///
/// Clones share storage, so a test can keep a handle, drop the shard and
/// reopen from the same journal.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    inner: Arc<Mutex<MemoryJournalInner>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` appends fail without storing anything.
    pub fn fail_next_commits(&self, count: usize) {
        self.inner.lock().fail_next = count;
    }

    pub fn batch_count(&self) -> usize {
        self.inner.lock().batches.len()
    }
}

impl Journal for MemoryJournal {
    fn append(&mut self, batch: &JournalBatch) -> Result<(), MetaError> {
        let encoded = batch.encode()?;
        let mut inner = self.inner.lock();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(MetaError::JournalCommit {
                message: format!("injected commit failure for tx {}", batch.tx_id),
            });
        }
        inner.batches.push(encoded);
        Ok(())
    }

    fn replay(&mut self) -> Result<Vec<JournalBatch>, MetaError> {
        let inner = self.inner.lock();
        inner
            .batches
            .iter()
            .map(|bytes| JournalBatch::decode(bytes))
            .collect()
    }
}
