//! Reconfiguration of a partitioned stream group.
//!
//! `propose` charges the signed quota difference between the old and the new
//! reservation and parks the new config on the group; `progress_state` swaps
//! it in and releases the claim on the next tick.

use crate::catalog::stream::{ResourceConfig, StreamGroupInfo};
use crate::catalog::{PathId, PathKind, PathState, PathTree, PathView};
use crate::error::{MetaError, fatal};
use crate::operation::context::OperationContext;
use crate::operation::{
    ApplyIf, OperationId, OperationKind, Progress, ProposeResult, StatusCode, SubOperationPart,
    TxId, TxStage, TxStateRecord, check_apply_if, reject_with,
};
use crate::quota::QuotaDelta;
use tracing::info;

#[derive(Debug)]
struct AlterRequest {
    working_dir: String,
    name: String,
    config: ResourceConfig,
    apply_if: Vec<ApplyIf>,
}

#[derive(Debug)]
pub struct AlterStream {
    pub(crate) op_id: OperationId,
    request: Option<AlterRequest>,
    /// What `propose` did to the context, for `abort_propose`.
    proposed: Option<(PathId, PathId, QuotaDelta)>,
}

impl AlterStream {
    pub fn new(
        op_id: OperationId,
        working_dir: String,
        name: String,
        config: ResourceConfig,
        apply_if: Vec<ApplyIf>,
    ) -> Self {
        Self {
            op_id,
            request: Some(AlterRequest {
                working_dir,
                name,
                config,
                apply_if,
            }),
            proposed: None,
        }
    }

    pub(crate) fn restored(op_id: OperationId) -> Self {
        Self {
            op_id,
            request: None,
            proposed: None,
        }
    }

    fn check_target(
        &self,
        tree: &PathTree,
        request: &AlterRequest,
    ) -> Result<(PathId, PathId), ProposeResult> {
        let mut result = ProposeResult::accepted(self.op_id.tx_id);
        let path = PathView::resolve(tree, &request.working_dir).dive(&request.name);
        let checks = path
            .check()
            .not_empty()
            .not_under_domain_upgrade()
            .is_resolved()
            .not_deleted()
            .not_under_deleting()
            .not_under_operation()
            .is_of_kind(PathKind::Stream);
        if !checks.ok() {
            reject_with(&mut result, &checks, path.base());
            return Err(result);
        }
        if let Err(explain) = check_apply_if(tree, &request.apply_if) {
            result.set_error(StatusCode::PreconditionFailed, explain);
            return Err(result);
        }
        let Some(node) = path.base() else {
            fatal(format!("resolved path {} has no base", path.path_string()));
        };
        Ok((node.id, node.domain))
    }

    fn record(&self, ctx: &OperationContext<'_>) -> TxStateRecord {
        ctx.tx_state(self.op_id)
            .cloned()
            .unwrap_or_else(|| fatal(format!("alter stream {} has no tx state", self.op_id)))
    }

    fn group(ctx: &OperationContext<'_>, target: PathId) -> StreamGroupInfo {
        ctx.stream(target)
            .cloned()
            .unwrap_or_else(|| fatal(format!("stream path {target} has no stream group")))
    }

    /// Undoes the proposal's effects on `target` and returns the charge.
    fn unwind(&self, ctx: &mut OperationContext<'_>, target: PathId, domain: PathId, charged: &QuotaDelta) {
        if let Err(e) = ctx.apply_quota(domain, &charged.negated()) {
            fatal(format!("domain {domain} ledger: {e}"));
        }
        let mut group = Self::group(ctx, target);
        group.pending_alter = None;
        ctx.put_stream(target, group);
        ctx.set_state(target, PathState::Created);
        ctx.release(target);
        ctx.remove_tx_state(self.op_id);
    }
}

impl SubOperationPart for AlterStream {
    fn propose(&mut self, ctx: &mut OperationContext<'_>) -> ProposeResult {
        let op_id = self.op_id;
        let Some(request) = self.request.as_ref() else {
            fatal(format!("restored alter stream {op_id} cannot propose"));
        };
        let mut result = ProposeResult::accepted(op_id.tx_id);
        let (target, domain) = match self.check_target(ctx.tree(), request) {
            Ok(found) => found,
            Err(rejected) => return rejected,
        };
        result.path_id = Some(target);

        if let Err(explain) = request.config.validate() {
            result.set_error(StatusCode::InvalidParameters, explain);
            return result;
        }
        let mut group = Self::group(ctx, target);
        if group.pending_alter.is_some() {
            result.set_error(
                StatusCode::MultipleModifications,
                format!("stream group {target} is under alteration"),
            );
            return result;
        }
        let current = ResourceConfig::decode(&group.config_blob)
            .and_then(|config| config.reservation())
            .unwrap_or_else(|e| fatal(format!("stream group {target} config is unreadable: {e}")));
        let prepared = request.config.reservation().and_then(|next| {
            let delta = current.change_to(&next)?;
            Ok((delta, request.config.encode()?))
        });
        let (delta, blob) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                result.set_error(StatusCode::InvalidParameters, e.to_string());
                return result;
            }
        };

        match ctx.reserve_quota(domain, &delta) {
            Ok(Ok(_)) => {}
            Ok(Err(counter)) => {
                result.set_error(
                    StatusCode::QuotaViolation,
                    format!("domain {domain} limit exceeded: {counter}"),
                );
                return result;
            }
            Err(MetaError::QuotaOverflow { counter, .. }) => {
                result.set_error(
                    StatusCode::QuotaViolation,
                    format!("domain {domain} {counter} would overflow"),
                );
                return result;
            }
            Err(e) => fatal(format!("domain {domain} ledger: {e}")),
        }

        if let Err(e) = ctx.claim(target) {
            fatal(format!("claim after passing checks: {e}"));
        }
        ctx.set_state(target, PathState::AlteringInProgress);
        group.pending_alter = Some(blob.clone());
        ctx.put_stream(target, group);
        ctx.put_tx_state(TxStateRecord {
            op_id,
            kind: OperationKind::AlterStream,
            target,
            stage: TxStage::Altering,
            reserved: delta,
            pending_config: Some(blob),
        });
        ctx.publish(op_id, target);
        self.proposed = Some((target, domain, delta));
        result
    }

    fn progress_state(&mut self, ctx: &mut OperationContext<'_>) -> Progress {
        let op_id = self.op_id;
        let record = self.record(ctx);
        let target = record.target;
        let Some(blob) = record.pending_config else {
            fatal(format!("alter stream {op_id} has no pending config"));
        };
        let config = ResourceConfig::decode(&blob)
            .unwrap_or_else(|e| fatal(format!("alter stream {op_id} pending config: {e}")));

        let mut group = Self::group(ctx, target);
        group.total_partition_count = config.partition_count;
        group.config_blob = blob;
        group.alter_version += 1;
        group.pending_alter = None;
        let alter_version = group.alter_version;
        ctx.put_stream(target, group);
        ctx.set_state(target, PathState::Created);
        ctx.release(target);
        ctx.remove_tx_state(op_id);
        ctx.publish(op_id, target);
        ctx.finalize(op_id);
        info!(%op_id, path_id = %target, alter_version, "stream altered");
        Progress::Done
    }

    fn abort_propose(&mut self, ctx: &mut OperationContext<'_>) {
        if let Some((target, domain, charged)) = self.proposed.take() {
            self.unwind(ctx, target, domain, &charged);
        }
    }

    fn abort_unsafe(&mut self, tx_id: TxId, ctx: &mut OperationContext<'_>) {
        let record = self.record(ctx);
        let domain = ctx.tree().node(record.target).domain;
        info!(op_id = %self.op_id, %tx_id, path_id = %record.target, "unwinding stream alter");
        self.unwind(ctx, record.target, domain, &record.reserved);
        ctx.publish(self.op_id, record.target);
    }
}

#[cfg(test)]
mod tests {
    use super::AlterStream;
    use crate::catalog::stream::{PartitionConfig, ResourceConfig, StreamGroupInfo};
    use crate::catalog::{PathId, PathKind, PathState};
    use crate::config::MetaConfig;
    use crate::hooks::OverrideSlot;
    use crate::operation::context::{OperationContext, ShardState};
    use crate::operation::{OperationId, Progress, StatusCode, SubOperationPart, TxId};
    use crate::quota::{DomainInfo, DomainLimits};

    fn config(partitions: u32) -> ResourceConfig {
        ResourceConfig {
            partition_count: partitions,
            partition: PartitionConfig {
                write_speed_bytes_per_sec: 100,
                storage_limit_bytes: None,
                lifetime_seconds: 5,
            },
            sub_config: Vec::new(),
        }
    }

    fn shard(limits: DomainLimits) -> (ShardState, PathId, PathId) {
        let mut state = ShardState::default();
        let domain = state
            .tree
            .insert(PathId::ROOT, "db", PathKind::Domain, TxId(1));
        let stream = state.tree.insert(domain, "s", PathKind::Stream, TxId(1));
        state
            .streams
            .insert(stream, StreamGroupInfo::new(&config(2)).expect("group"));
        state.ledger.register_domain(domain, limits);
        state.ledger.restore_counters(
            domain,
            DomainInfo {
                objects: 1,
                stream_partitions: 2,
                reserved_storage_bytes: 500,
                reserved_throughput_bps: 200,
            },
        );
        (state, domain, stream)
    }

    fn alter(partitions: u32) -> AlterStream {
        AlterStream::new(
            OperationId::new(TxId(8), 0),
            "/db".into(),
            "s".into(),
            config(partitions),
            Vec::new(),
        )
    }

    #[test]
    fn alter_charges_at_propose_and_swaps_at_progress() {
        let (state, domain, stream) = shard(DomainLimits::default());
        let meta = MetaConfig::default();
        let overrides = OverrideSlot::new();
        let mut ctx = OperationContext::begin(&state, &meta, &overrides, TxId(8));
        let mut op = alter(4);
        assert!(op.propose(&mut ctx).is_accepted());
        assert_eq!(ctx.tree().node(stream).state, PathState::AlteringInProgress);
        assert_eq!(ctx.tree().node(stream).owning_tx, Some(TxId(8)));
        let info = ctx.ledger().domain_counters(domain).expect("domain");
        assert_eq!(info.stream_partitions, 4);
        assert_eq!(info.reserved_throughput_bps, 400);
        assert_eq!(ctx.stream(stream).expect("group").total_partition_count, 2);

        assert_eq!(op.progress_state(&mut ctx), Progress::Done);
        let group = ctx.stream(stream).expect("group");
        assert_eq!(group.total_partition_count, 4);
        assert_eq!(group.alter_version, 2);
        assert!(group.pending_alter.is_none());
        assert_eq!(ctx.tree().node(stream).owning_tx, None);
    }

    #[test]
    fn abort_unsafe_returns_the_charge() {
        let (state, domain, stream) = shard(DomainLimits::default());
        let meta = MetaConfig::default();
        let overrides = OverrideSlot::new();
        let mut ctx = OperationContext::begin(&state, &meta, &overrides, TxId(8));
        assert!(alter(4).propose(&mut ctx).is_accepted());
        let mut restored = AlterStream::restored(OperationId::new(TxId(8), 0));
        restored.abort_unsafe(TxId(8), &mut ctx);
        let info = ctx.ledger().domain_counters(domain).expect("domain");
        assert_eq!(info.stream_partitions, 2);
        assert_eq!(info.reserved_throughput_bps, 200);
        assert_eq!(ctx.tree().node(stream).state, PathState::Created);
        assert!(ctx.stream(stream).expect("group").pending_alter.is_none());
    }

    #[test]
    fn growth_past_limits_is_rejected() {
        let (state, _, stream) = shard(DomainLimits {
            max_stream_partitions: Some(3),
            ..DomainLimits::default()
        });
        let meta = MetaConfig::default();
        let overrides = OverrideSlot::new();
        let mut ctx = OperationContext::begin(&state, &meta, &overrides, TxId(8));
        assert_eq!(alter(4).propose(&mut ctx).status, StatusCode::QuotaViolation);
        assert_eq!(ctx.tree().node(stream).owning_tx, None);
        // shrinking is always allowed
        assert!(alter(1).propose(&mut ctx).is_accepted());
    }
}
