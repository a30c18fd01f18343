use crate::error::MetaError;
use crate::operation::TxStateRecord;
use crate::operation::context::ShardState;
use crate::wal::{Journal, JournalBatch, JournalRecord};
use tracing::info;

#[derive(Debug, Clone)]
pub struct RecoveredState {
    pub state: ShardState,
    /// Multi-step operations that were committed but not finished.
    pub in_flight: Vec<TxStateRecord>,
    pub batches: usize,
}

pub fn recover(journal: &mut dyn Journal) -> Result<RecoveredState, MetaError> {
    info!("recovery: read journal");
    let batches = journal.replay()?;
    let mut state = ShardState::default();
    info!(batches = batches.len(), "recovery: replay batches");
    replay_batches(&batches, &mut state)?;

    state.tree.recount_alive_children();
    if let Some(step) = state.tree.iter().filter_map(|node| node.drop_step).max() {
        state.steps.observe(step);
    }
    let in_flight: Vec<TxStateRecord> = state.tx_states.values().cloned().collect();
    info!(
        seq = state.last_seq,
        nodes = state.tree.node_count(),
        in_flight = in_flight.len(),
        "recovery: done"
    );
    Ok(RecoveredState {
        state,
        in_flight,
        batches: batches.len(),
    })
}

pub fn replay_batches(batches: &[JournalBatch], state: &mut ShardState) -> Result<(), MetaError> {
    for batch in batches {
        if batch.seq <= state.last_seq {
            return Err(MetaError::Corruption {
                message: format!(
                    "non-monotonic journal seq {} after {}",
                    batch.seq, state.last_seq
                ),
            });
        }
        for record in &batch.records {
            apply_record(record, state)?;
        }
        state.last_seq = batch.seq;
    }
    Ok(())
}

fn apply_record(record: &JournalRecord, state: &mut ShardState) -> Result<(), MetaError> {
    match record {
        JournalRecord::Path(node) => state.tree.restore_node(node.clone()),
        JournalRecord::DropStep {
            path_id,
            tx_id,
            step,
        } => state.tree.restore_drop(*path_id, *tx_id, *step),
        JournalRecord::UserAttrs { path_id, attrs } => {
            state.tree.restore_user_attrs(*path_id, attrs.clone())
        }
        JournalRecord::StreamGroup { path_id, info } => {
            state.streams.insert(*path_id, info.clone());
            Ok(())
        }
        JournalRecord::RemoveStreamGroup { path_id } => {
            state.streams.remove(path_id);
            Ok(())
        }
        JournalRecord::DirAlterVersion { path_id, version } => {
            state.tree.restore_dir_alter_version(*path_id, *version)
        }
        JournalRecord::DomainCounters { domain_id, info } => {
            state.ledger.restore_counters(*domain_id, *info);
            Ok(())
        }
        JournalRecord::DomainConfig { domain_id, config } => {
            state.ledger.restore_limits(*domain_id, config.limits);
            state.domain_configs.insert(*domain_id, config.clone());
            Ok(())
        }
        JournalRecord::TxState { op_id, state: tx } => {
            match tx {
                Some(record) => {
                    state.tx_states.insert(*op_id, record.clone());
                }
                None => {
                    state.tx_states.remove(op_id);
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{recover, replay_batches};
    use crate::catalog::{PathId, PathKind};
    use crate::config::MetaConfig;
    use crate::error::MetaErrorCode;
    use crate::hooks::OverrideSlot;
    use crate::operation::context::{OperationContext, ShardState};
    use crate::operation::{StepId, TxId};
    use crate::quota::{DomainLimits, QuotaDelta};
    use crate::wal::{JournalBatch, JournalRecord, MemoryJournal};

    #[test]
    fn replay_rebuilds_committed_state() {
        let config = MetaConfig::default();
        let overrides = OverrideSlot::new();
        let mut journal = MemoryJournal::new();
        let mut state = ShardState::default();

        let mut ctx = OperationContext::begin(&state, &config, &overrides, TxId(1));
        let domain = ctx.create_path(PathId::ROOT, "db", PathKind::Domain);
        ctx.register_domain(domain, DomainLimits::default());
        let dir = ctx.create_path(domain, "a", PathKind::Directory);
        ctx.apply_quota(domain, &QuotaDelta::objects(1)).expect("quota");
        state = ctx.commit(&mut journal).expect("commit").into_parts().0;

        let mut ctx = OperationContext::begin(&state, &config, &overrides, TxId(2));
        ctx.mark_dropped(dir);
        ctx.dec_alive_children(domain);
        ctx.bump_dir_alter_version(domain);
        ctx.apply_quota(domain, &QuotaDelta::objects(-1)).expect("quota");
        state = ctx.commit(&mut journal).expect("commit").into_parts().0;

        let recovered = recover(&mut journal).expect("recover");
        assert_eq!(recovered.batches, 2);
        assert_eq!(recovered.state.tree, state.tree);
        assert_eq!(recovered.state.ledger, state.ledger);
        assert_eq!(recovered.state.last_seq, 2);
        assert_eq!(recovered.state.steps.last(), state.steps.last());
        assert!(recovered.in_flight.is_empty());
    }

    #[test]
    fn non_monotonic_seq_is_corruption() {
        let batch = |seq| JournalBatch {
            seq,
            tx_id: TxId(seq),
            records: Vec::new(),
        };
        let mut state = ShardState::default();
        let err = replay_batches(&[batch(2), batch(2)], &mut state).expect_err("dup seq");
        assert_eq!(err.code(), MetaErrorCode::Corruption);
    }

    #[test]
    fn records_for_unknown_paths_are_corruption() {
        let mut state = ShardState::default();
        let batch = JournalBatch {
            seq: 1,
            tx_id: TxId(1),
            records: vec![JournalRecord::DropStep {
                path_id: PathId(9),
                tx_id: TxId(1),
                step: StepId(5),
            }],
        };
        let err = replay_batches(&[batch], &mut state).expect_err("unknown path");
        assert_eq!(err.code(), MetaErrorCode::Corruption);
    }
}
