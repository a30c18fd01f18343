//! Transaction scope over a working copy of the shard state.
//!
//! The tree, ledger and side tables are persistent collections, so `begin`
//! clones the shard state in O(1) and every mutation inside the context
//! touches only the copy. Each mutation also stages the journal record that
//! reproduces it on replay. `commit` appends the staged batch and only then
//! hands the copy back for installation; dropping the context (or a failed
//! append) leaves the installed state exactly as it was.

use crate::catalog::stream::StreamGroupInfo;
use crate::catalog::{PathId, PathKind, PathState, PathTree};
use crate::config::MetaConfig;
use crate::error::{MetaError, fatal};
use crate::hooks::OverrideSlot;
use crate::operation::completion::{CompletionEntry, CompletionQueue};
use crate::operation::{OperationId, StepId, TxId, TxStateRecord};
use crate::quota::{DomainConfig, DomainInfo, DomainLimits, QuotaCounter, QuotaDelta, QuotaLedger};
use crate::wal::{Journal, JournalBatch, JournalRecord};
use im::OrdMap;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Monotonic source of drop step ids, wall-clock based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepClock {
    last: u64,
}

impl StepClock {
    pub fn next(&mut self) -> StepId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.last = now.max(self.last + 1);
        StepId(self.last)
    }

    pub fn last(&self) -> u64 {
        self.last
    }

    pub(crate) fn observe(&mut self, step: StepId) {
        self.last = self.last.max(step.0);
    }
}

/// Everything a shard owns that transactions mutate.
#[derive(Debug, Clone, Default)]
pub struct ShardState {
    pub(crate) tree: PathTree,
    pub(crate) ledger: QuotaLedger,
    pub(crate) streams: OrdMap<PathId, StreamGroupInfo>,
    pub(crate) domain_configs: OrdMap<PathId, DomainConfig>,
    pub(crate) tx_states: OrdMap<OperationId, TxStateRecord>,
    pub(crate) steps: StepClock,
    pub(crate) last_seq: u64,
}

impl ShardState {
    pub fn tree(&self) -> &PathTree {
        &self.tree
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn stream(&self, path_id: PathId) -> Option<&StreamGroupInfo> {
        self.streams.get(&path_id)
    }

    pub fn domain_config(&self, domain_id: PathId) -> Option<&DomainConfig> {
        self.domain_configs.get(&domain_id)
    }

    pub fn tx_states(&self) -> impl Iterator<Item = &TxStateRecord> {
        self.tx_states.values()
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }
}

pub struct OperationContext<'a> {
    state: ShardState,
    config: &'a MetaConfig,
    overrides: &'a OverrideSlot,
    tx_id: TxId,
    records: Vec<JournalRecord>,
    touched_domains: BTreeSet<PathId>,
    invalidated: BTreeSet<PathId>,
    completions: CompletionQueue,
}

impl<'a> OperationContext<'a> {
    pub(crate) fn begin(
        state: &ShardState,
        config: &'a MetaConfig,
        overrides: &'a OverrideSlot,
        tx_id: TxId,
    ) -> Self {
        Self {
            state: state.clone(),
            config,
            overrides,
            tx_id,
            records: Vec::new(),
            touched_domains: BTreeSet::new(),
            invalidated: BTreeSet::new(),
            completions: CompletionQueue::default(),
        }
    }

    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    pub fn config(&self) -> &'a MetaConfig {
        self.config
    }

    pub fn tree(&self) -> &PathTree {
        &self.state.tree
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.state.ledger
    }

    pub fn stream(&self, path_id: PathId) -> Option<&StreamGroupInfo> {
        self.state.streams.get(&path_id)
    }

    pub fn tx_state(&self, op_id: OperationId) -> Option<&TxStateRecord> {
        self.state.tx_states.get(&op_id)
    }

    pub fn staged(&self) -> &[JournalRecord] {
        &self.records
    }

    pub fn completions(&self) -> &CompletionQueue {
        &self.completions
    }

    pub(crate) fn persist_path(&mut self, id: PathId) {
        let node = self.state.tree.node(id).clone();
        self.records.push(JournalRecord::Path(node));
    }

    pub(crate) fn invalidate(&mut self, id: PathId) {
        self.invalidated.insert(id);
    }

    pub(crate) fn create_path(&mut self, parent: PathId, name: &str, kind: PathKind) -> PathId {
        let id = self.state.tree.insert(parent, name, kind, self.tx_id);
        self.persist_path(id);
        self.persist_path(parent);
        self.invalidate(id);
        self.invalidate(parent);
        id
    }

    pub(crate) fn claim(&mut self, id: PathId) -> Result<(), MetaError> {
        self.state.tree.claim(id, self.tx_id)?;
        self.persist_path(id);
        Ok(())
    }

    pub(crate) fn release(&mut self, id: PathId) {
        self.state.tree.release(id);
        self.persist_path(id);
        self.invalidate(id);
    }

    pub(crate) fn set_state(&mut self, id: PathId, state: PathState) {
        self.state.tree.set_state(id, state);
        self.persist_path(id);
        self.invalidate(id);
    }

    pub(crate) fn mark_under_deleting(&mut self, id: PathId) {
        self.state.tree.mark_under_deleting(id, self.tx_id);
        self.persist_path(id);
        self.invalidate(id);
    }

    pub(crate) fn unmark_under_deleting(&mut self, id: PathId) {
        self.state.tree.unmark_under_deleting(id);
        self.persist_path(id);
        self.invalidate(id);
    }

    /// Drops `id` at the next step of the shard's step clock.
    pub(crate) fn mark_dropped(&mut self, id: PathId) -> StepId {
        let step = self.state.steps.next();
        self.state.tree.set_last_tx(id, self.tx_id);
        self.state.tree.mark_dropped(id, self.tx_id, step);
        self.records.push(JournalRecord::DropStep {
            path_id: id,
            tx_id: self.tx_id,
            step,
        });
        self.invalidate(id);
        step
    }

    pub(crate) fn dec_alive_children(&mut self, id: PathId) {
        self.state.tree.dec_alive_children(id);
    }

    pub(crate) fn set_user_attrs(&mut self, id: PathId, attrs: BTreeMap<String, String>) {
        self.state.tree.set_user_attrs(id, attrs.clone());
        self.records
            .push(JournalRecord::UserAttrs { path_id: id, attrs });
        self.invalidate(id);
    }

    pub(crate) fn clear_user_attrs(&mut self, id: PathId) -> usize {
        let removed = self.state.tree.clear_user_attrs(id);
        self.records.push(JournalRecord::UserAttrs {
            path_id: id,
            attrs: BTreeMap::new(),
        });
        removed
    }

    pub(crate) fn bump_dir_alter_version(&mut self, id: PathId) -> u64 {
        let version = self.state.tree.bump_dir_alter_version(id);
        self.records.push(JournalRecord::DirAlterVersion {
            path_id: id,
            version,
        });
        self.invalidate(id);
        version
    }

    pub(crate) fn register_domain(&mut self, domain_id: PathId, limits: DomainLimits) {
        self.state.ledger.register_domain(domain_id, limits);
        self.touched_domains.insert(domain_id);
    }

    pub(crate) fn apply_quota(
        &mut self,
        domain_id: PathId,
        delta: &QuotaDelta,
    ) -> Result<DomainInfo, MetaError> {
        let info = self.state.ledger.apply_delta(domain_id, delta)?;
        self.touched_domains.insert(domain_id);
        Ok(info)
    }

    pub(crate) fn reserve_quota(
        &mut self,
        domain_id: PathId,
        delta: &QuotaDelta,
    ) -> Result<Result<DomainInfo, QuotaCounter>, MetaError> {
        let reserved = self.state.ledger.reserve(domain_id, delta)?;
        if reserved.is_ok() {
            self.touched_domains.insert(domain_id);
        }
        Ok(reserved)
    }

    /// Keeps the config in memory; journals it unless the installed
    /// override declines. Returns whether a record was staged.
    pub(crate) fn persist_domain_config(&mut self, domain_id: PathId, config: DomainConfig) -> bool {
        let persist = self
            .overrides
            .should_persist_domain_config(domain_id, &config);
        self.state.domain_configs.insert(domain_id, config.clone());
        if persist {
            self.records
                .push(JournalRecord::DomainConfig { domain_id, config });
        } else {
            debug!(tx_id = %self.tx_id, domain_id = %domain_id, "persist override skipped domain config");
        }
        persist
    }

    pub(crate) fn put_stream(&mut self, path_id: PathId, info: StreamGroupInfo) {
        self.state.streams.insert(path_id, info.clone());
        self.records
            .push(JournalRecord::StreamGroup { path_id, info });
        self.invalidate(path_id);
    }

    pub(crate) fn remove_stream(&mut self, path_id: PathId) -> Option<StreamGroupInfo> {
        let removed = self.state.streams.remove(&path_id);
        self.records
            .push(JournalRecord::RemoveStreamGroup { path_id });
        self.invalidate(path_id);
        removed
    }

    pub(crate) fn put_tx_state(&mut self, record: TxStateRecord) {
        let op_id = record.op_id;
        self.state.tx_states.insert(op_id, record.clone());
        self.records.push(JournalRecord::TxState {
            op_id,
            state: Some(record),
        });
    }

    pub(crate) fn remove_tx_state(&mut self, op_id: OperationId) {
        if self.state.tx_states.remove(&op_id).is_none() {
            fatal(format!("no tx state to remove for {op_id}"));
        }
        self.records
            .push(JournalRecord::TxState { op_id, state: None });
    }

    pub(crate) fn publish(&mut self, op_id: OperationId, path_id: PathId) {
        self.completions
            .push(CompletionEntry::PublishNamespaceChange { op_id, path_id });
    }

    pub(crate) fn finalize(&mut self, op_id: OperationId) {
        self.completions
            .push(CompletionEntry::FinalizeOperation { op_id });
    }

    /// Appends the staged batch; the returned state is the one to install.
    ///
    /// On error nothing of this transaction is observable: the working copy,
    /// the staged records and the queued completions are dropped with `self`.
    pub fn commit(mut self, journal: &mut dyn Journal) -> Result<CommittedContext, MetaError> {
        let touched: Vec<PathId> = self.touched_domains.iter().copied().collect();
        for domain_id in touched {
            let info = self
                .state
                .ledger
                .domain_counters(domain_id)
                .unwrap_or_else(|| fatal(format!("touched domain {domain_id} has no counters")));
            self.records
                .push(JournalRecord::DomainCounters { domain_id, info });
            // a domain's description embeds its counters
            self.invalidated.insert(domain_id);
        }
        if !self.records.is_empty() {
            let batch = JournalBatch {
                seq: self.state.last_seq + 1,
                tx_id: self.tx_id,
                records: std::mem::take(&mut self.records),
            };
            journal.append(&batch)?;
            self.state.last_seq = batch.seq;
            info!(
                tx_id = %self.tx_id,
                seq = batch.seq,
                records = batch.records.len(),
                completions = self.completions.len(),
                "committed transaction"
            );
        }
        Ok(CommittedContext {
            state: self.state,
            invalidated: self.invalidated,
            completions: self.completions,
        })
    }

    pub fn discard(self) {
        debug!(
            tx_id = %self.tx_id,
            records = self.records.len(),
            "discarded transaction context"
        );
    }
}

/// A context whose batch is durable. The completion queue can only be
/// taken from here.
#[derive(Debug)]
pub struct CommittedContext {
    state: ShardState,
    invalidated: BTreeSet<PathId>,
    completions: CompletionQueue,
}

impl CommittedContext {
    pub fn completions(&self) -> &CompletionQueue {
        &self.completions
    }

    pub(crate) fn into_parts(self) -> (ShardState, BTreeSet<PathId>, CompletionQueue) {
        (self.state, self.invalidated, self.completions)
    }
}

#[cfg(test)]
mod tests {
    use super::{OperationContext, ShardState, StepClock};
    use crate::catalog::{PathId, PathKind};
    use crate::config::MetaConfig;
    use crate::error::MetaErrorCode;
    use crate::hooks::OverrideSlot;
    use crate::operation::{OperationId, StepId, TxId};
    use crate::quota::{DomainLimits, QuotaDelta};
    use crate::wal::{Journal, JournalRecord, MemoryJournal};

    fn state_with_domain() -> (ShardState, PathId) {
        let mut state = ShardState::default();
        let domain = state
            .tree
            .insert(PathId::ROOT, "db", PathKind::Domain, TxId(1));
        state.ledger.register_domain(domain, DomainLimits::default());
        (state, domain)
    }

    #[test]
    fn step_clock_is_strictly_increasing() {
        let mut clock = StepClock::default();
        clock.observe(StepId(u64::MAX / 2));
        let first = clock.next();
        let second = clock.next();
        assert_eq!(first, StepId(u64::MAX / 2 + 1));
        assert!(second > first);
    }

    #[test]
    fn commit_installs_changes_and_counts_domains() {
        let (state, domain) = state_with_domain();
        let config = MetaConfig::default();
        let overrides = OverrideSlot::new();
        let mut journal = MemoryJournal::new();
        let mut ctx = OperationContext::begin(&state, &config, &overrides, TxId(2));
        let dir = ctx.create_path(domain, "a", PathKind::Directory);
        ctx.apply_quota(domain, &QuotaDelta::objects(1)).expect("quota");
        ctx.publish(OperationId::new(TxId(2), 0), dir);

        // the installed state is untouched until commit
        assert!(state.tree.child(domain, "a").is_none());

        let committed = ctx.commit(&mut journal).expect("commit");
        assert_eq!(committed.completions().len(), 1);
        let (next, invalidated, _) = committed.into_parts();
        assert_eq!(next.tree.child(domain, "a"), Some(dir));
        assert_eq!(next.ledger.domain_counters(domain).expect("domain").objects, 1);
        assert_eq!(next.last_seq, 1);
        assert!(invalidated.contains(&dir) && invalidated.contains(&domain));

        let batches = journal.replay().expect("replay");
        assert_eq!(batches.len(), 1);
        assert!(matches!(
            batches[0].records.last(),
            Some(JournalRecord::DomainCounters { info, .. }) if info.objects == 1
        ));
    }

    #[test]
    fn failed_commit_drops_everything() {
        let (state, domain) = state_with_domain();
        let config = MetaConfig::default();
        let overrides = OverrideSlot::new();
        let mut journal = MemoryJournal::new();
        journal.fail_next_commits(1);
        let mut ctx = OperationContext::begin(&state, &config, &overrides, TxId(2));
        ctx.create_path(domain, "a", PathKind::Directory);
        ctx.apply_quota(domain, &QuotaDelta::objects(1)).expect("quota");
        let err = ctx.commit(&mut journal).expect_err("injected");
        assert_eq!(err.code(), MetaErrorCode::JournalCommit);
        assert!(state.tree.child(domain, "a").is_none());
        assert_eq!(state.ledger.domain_counters(domain).expect("domain").objects, 0);
        assert_eq!(journal.batch_count(), 0);
    }

    #[test]
    fn empty_context_commits_without_a_batch() {
        let (state, _) = state_with_domain();
        let config = MetaConfig::default();
        let overrides = OverrideSlot::new();
        let mut journal = MemoryJournal::new();
        let ctx = OperationContext::begin(&state, &config, &overrides, TxId(2));
        let (next, _, _) = ctx.commit(&mut journal).expect("commit").into_parts();
        assert_eq!(next.last_seq, 0);
        assert_eq!(journal.batch_count(), 0);
    }

    #[test]
    fn drop_stages_step_record() {
        let (state, domain) = state_with_domain();
        let config = MetaConfig::default();
        let overrides = OverrideSlot::new();
        let mut ctx = OperationContext::begin(&state, &config, &overrides, TxId(3));
        let dir = ctx.create_path(domain, "a", PathKind::Directory);
        let step = ctx.mark_dropped(dir);
        assert!(ctx.tree().node(dir).is_dropped());
        assert!(ctx.staged().iter().any(|record| matches!(
            record,
            JournalRecord::DropStep { path_id, step: s, tx_id } if *path_id == dir && *s == step && *tx_id == TxId(3)
        )));
        ctx.discard();
    }
}
