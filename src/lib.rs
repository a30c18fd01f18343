pub mod catalog;
pub mod config;
pub mod describe;
pub mod error;
pub mod hooks;
pub mod operation;
pub mod quota;
pub mod recovery;
pub mod wal;

use crate::catalog::{PathId, PathNode};
use crate::config::MetaConfig;
use crate::describe::{DescribeCache, PathDescription};
use crate::error::MetaError;
use crate::hooks::OverrideSlot;
use crate::operation::completion::{CompletionQueue, CompletionSink};
use crate::operation::context::{OperationContext, ShardState};
use crate::operation::{
    OperationId, Progress, ProposeResult, StatusCode, SubOperation, Transaction, TxId,
};
use crate::quota::DomainInfo;
use crate::wal::Journal;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct ShardCore {
    state: ShardState,
    journal: Box<dyn Journal>,
    in_flight: BTreeMap<OperationId, SubOperation>,
}

/// One metadata shard: the path tree, the domain ledger and the operations
/// running against them.
///
/// Transactions are serialized on the shard. Completion sinks are called
/// after the shard lock is released, so a sink may read the shard again.
pub struct MetaShard {
    config: MetaConfig,
    overrides: OverrideSlot,
    core: Mutex<ShardCore>,
    describe_cache: DescribeCache,
    completion_sinks: Arc<Mutex<Vec<Arc<dyn CompletionSink>>>>,
    startup_recovered_seq: u64,
}

impl MetaShard {
    pub fn open(config: MetaConfig, journal: Box<dyn Journal>) -> Result<Self, MetaError> {
        Self::open_with_overrides(config, journal, OverrideSlot::new())
    }

    pub fn open_with_overrides(
        config: MetaConfig,
        mut journal: Box<dyn Journal>,
        overrides: OverrideSlot,
    ) -> Result<Self, MetaError> {
        config.validate()?;
        info!(
            durability_mode = ?config.durability_mode,
            recovery_mode = ?config.recovery_mode,
            describe_cache_capacity = config.describe_cache_capacity,
            max_parts_per_transaction = config.max_parts_per_transaction,
            abort_inflight_on_recovery = config.abort_inflight_on_recovery,
            "metashard config"
        );

        let recovered = recovery::recover(journal.as_mut())?;
        let startup_recovered_seq = recovered.state.last_seq;
        let mut state = recovered.state;
        let mut in_flight = BTreeMap::new();
        for record in &recovered.in_flight {
            in_flight.insert(record.op_id, SubOperation::restore(record));
        }

        if config.abort_inflight_on_recovery {
            for (op_id, mut op) in std::mem::take(&mut in_flight) {
                let mut ctx = OperationContext::begin(&state, &config, &overrides, op_id.tx_id);
                op.abort_unsafe(op_id.tx_id, &mut ctx);
                let (next, _, completions) = ctx.commit(journal.as_mut())?.into_parts();
                state = next;
                // no sink can be registered yet
                completions.flush(&[]);
                info!(%op_id, kind = %op.kind(), "recovery: aborted in-flight operation");
            }
        } else if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "recovery: resuming in-flight operations");
        }

        Ok(Self {
            describe_cache: DescribeCache::new(config.describe_cache_capacity),
            config,
            overrides,
            core: Mutex::new(ShardCore {
                state,
                journal,
                in_flight,
            }),
            completion_sinks: Arc::new(Mutex::new(Vec::new())),
            startup_recovered_seq,
        })
    }

    pub fn config(&self) -> &MetaConfig {
        &self.config
    }

    pub fn overrides(&self) -> &OverrideSlot {
        &self.overrides
    }

    pub fn startup_recovered_seq(&self) -> u64 {
        self.startup_recovered_seq
    }

    /// Proposes every part of `tx` in one context and commits it.
    ///
    /// A rejection is `Ok` with a non-accepted status and leaves the shard
    /// untouched. `Err` means the journal refused the batch; the shard is
    /// untouched then as well.
    pub fn submit(&self, tx: Transaction) -> Result<ProposeResult, MetaError> {
        let Transaction { tx_id, parts } = tx;
        let mut core = self.core.lock();
        if let Err(explain) = self.check_shape(&core, tx_id, parts.len()) {
            warn!(%tx_id, %explain, "transaction rejected before propose");
            return Ok(ProposeResult::rejected(
                tx_id,
                StatusCode::InvalidParameters,
                explain,
            ));
        }

        let mut ops: Vec<SubOperation> = parts
            .into_iter()
            .enumerate()
            .map(|(index, part)| SubOperation::from_part(OperationId::new(tx_id, index as u32), part))
            .collect();
        let mut ctx = OperationContext::begin(&core.state, &self.config, &self.overrides, tx_id);
        let mut outcome = ProposeResult::accepted(tx_id);
        for index in 0..ops.len() {
            let result = ops[index].propose(&mut ctx);
            if !result.is_accepted() {
                for op in ops[..index].iter_mut().rev() {
                    if op.kind().supports_abort_propose() {
                        op.abort_propose(&mut ctx);
                    }
                }
                ctx.discard();
                return Ok(result);
            }
            let pending = outcome.pending_progress || result.pending_progress;
            outcome = result;
            outcome.pending_progress = pending;
        }

        let committed = ctx.commit(core.journal.as_mut())?;
        let (state, invalidated, completions) = committed.into_parts();
        core.state = state;
        for op in ops {
            if op.kind().is_multi_step() {
                core.in_flight.insert(op.operation_id(), op);
            }
        }
        self.describe_cache.invalidate(&invalidated);
        drop(core);

        self.deliver(completions);
        Ok(outcome)
    }

    fn check_shape(&self, core: &ShardCore, tx_id: TxId, parts: usize) -> Result<(), String> {
        if parts == 0 {
            return Err(format!("transaction {tx_id} has no parts"));
        }
        if parts > self.config.max_parts_per_transaction {
            return Err(format!(
                "transaction {tx_id} has {parts} parts, at most {} allowed",
                self.config.max_parts_per_transaction
            ));
        }
        if core.in_flight.keys().any(|op_id| op_id.tx_id == tx_id) {
            return Err(format!("transaction {tx_id} is already in flight"));
        }
        Ok(())
    }

    /// One scheduling tick: every in-flight operation advances once.
    /// Returns the operations that finished.
    pub fn progress(&self) -> Result<Vec<OperationId>, MetaError> {
        let mut core = self.core.lock();
        let ids: Vec<OperationId> = core.in_flight.keys().copied().collect();
        let mut finished = Vec::new();
        let mut queues = Vec::new();
        for op_id in ids {
            let Some(mut op) = core.in_flight.remove(&op_id) else {
                continue;
            };
            let mut ctx =
                OperationContext::begin(&core.state, &self.config, &self.overrides, op_id.tx_id);
            let step = op.progress_state(&mut ctx);
            let committed = match ctx.commit(core.journal.as_mut()) {
                Ok(committed) => committed,
                Err(e) => {
                    core.in_flight.insert(op_id, op);
                    drop(core);
                    for queue in queues {
                        self.deliver(queue);
                    }
                    return Err(e);
                }
            };
            let (state, invalidated, completions) = committed.into_parts();
            core.state = state;
            self.describe_cache.invalidate(&invalidated);
            queues.push(completions);
            match step {
                Progress::Done => finished.push(op_id),
                Progress::Pending => {
                    core.in_flight.insert(op_id, op);
                }
            }
        }
        drop(core);

        for queue in queues {
            self.deliver(queue);
        }
        if !finished.is_empty() {
            debug!(finished = finished.len(), "progress tick finished operations");
        }
        Ok(finished)
    }

    fn deliver(&self, completions: CompletionQueue) {
        if completions.is_empty() {
            return;
        }
        let sinks = self.completion_sinks.lock().clone();
        completions.flush(&sinks);
    }

    pub fn add_completion_sink(&self, sink: Arc<dyn CompletionSink>) {
        self.completion_sinks.lock().push(sink);
    }

    pub fn remove_completion_sink(&self, sink: &Arc<dyn CompletionSink>) {
        self.completion_sinks
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, sink));
    }

    /// O(1) snapshot of the installed state.
    pub fn state(&self) -> ShardState {
        self.core.lock().state.clone()
    }

    pub fn resolve(&self, path: &str) -> Result<PathId, MetaError> {
        self.core.lock().state.tree().resolve(path)
    }

    pub fn node(&self, path_id: PathId) -> Option<PathNode> {
        self.core.lock().state.tree().get(path_id).cloned()
    }

    pub fn domain_counters(&self, domain_id: PathId) -> Option<DomainInfo> {
        self.core.lock().state.ledger().domain_counters(domain_id)
    }

    pub fn describe(&self, path: &str) -> Result<Arc<PathDescription>, MetaError> {
        let core = self.core.lock();
        let path_id = core.state.tree().resolve(path)?;
        self.describe_cache.get_or_build(&core.state, path_id)
    }

    pub fn in_flight(&self) -> Vec<OperationId> {
        self.core.lock().in_flight.keys().copied().collect()
    }
}

impl std::fmt::Debug for MetaShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaShard")
            .field("config", &self.config)
            .field("describe_cache", &self.describe_cache)
            .finish_non_exhaustive()
    }
}
