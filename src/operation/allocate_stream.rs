use crate::catalog::stream::{ResourceConfig, StreamGroupInfo};
use crate::catalog::{PathKind, PathView};
use crate::error::{MetaError, fatal};
use crate::operation::context::OperationContext;
use crate::operation::{
    ApplyIf, OperationId, Progress, ProposeResult, StatusCode, SubOperationPart, TxId,
    check_apply_if, check_new_name, reject_with,
};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug)]
pub struct AllocateStream {
    pub(crate) op_id: OperationId,
    working_dir: String,
    name: String,
    config: ResourceConfig,
    user_attrs: BTreeMap<String, String>,
    apply_if: Vec<ApplyIf>,
}

impl AllocateStream {
    pub fn new(
        op_id: OperationId,
        working_dir: String,
        name: String,
        config: ResourceConfig,
        apply_if: Vec<ApplyIf>,
    ) -> Self {
        Self {
            op_id,
            working_dir,
            name,
            config,
            user_attrs: BTreeMap::new(),
            apply_if,
        }
    }

    pub fn with_user_attrs(mut self, user_attrs: BTreeMap<String, String>) -> Self {
        self.user_attrs = user_attrs;
        self
    }
}

impl SubOperationPart for AllocateStream {
    fn propose(&mut self, ctx: &mut OperationContext<'_>) -> ProposeResult {
        let op_id = self.op_id;
        let mut result = ProposeResult::accepted(op_id.tx_id);

        let (parent_id, domain_id) = {
            let tree = ctx.tree();
            let parent = PathView::resolve(tree, &self.working_dir);
            let resolved = parent.check().is_resolved();
            if !resolved.ok() {
                reject_with(&mut result, &resolved, None);
                return result;
            }
            let Some(parent_node) = parent.base() else {
                fatal(format!("resolved path {} has no base", parent.path_string()));
            };
            let checks = if parent_node.kind == PathKind::CdcStream {
                parent
                    .check()
                    .not_under_domain_upgrade()
                    .not_deleted()
                    .not_under_deleting()
                    .not_under_operation()
            } else {
                parent
                    .check()
                    .not_under_domain_upgrade()
                    .not_deleted()
                    .not_under_deleting()
                    .is_like_directory()
                    .is_inside_domain()
            };
            if !checks.ok() {
                reject_with(&mut result, &checks, None);
                return result;
            }
            if let Err(rejected) = check_new_name(tree, parent_node.id, &self.name, op_id.tx_id) {
                return rejected;
            }
            if let Err(explain) = check_apply_if(tree, &self.apply_if) {
                result.set_error(StatusCode::PreconditionFailed, explain);
                return result;
            }
            (parent_node.id, parent_node.domain)
        };

        if let Err(explain) = self.config.validate() {
            result.set_error(StatusCode::InvalidParameters, explain);
            return result;
        }
        let prepared = self.config.reservation().and_then(|reservation| {
            let delta = reservation.allocate_delta()?;
            let group = StreamGroupInfo::new(&self.config)?;
            Ok((reservation, delta, group))
        });
        let (reservation, delta, group) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                result.set_error(StatusCode::InvalidParameters, e.to_string());
                return result;
            }
        };

        match ctx.reserve_quota(domain_id, &delta) {
            Ok(Ok(_)) => {}
            Ok(Err(counter)) => {
                result.set_error(
                    StatusCode::QuotaViolation,
                    format!("domain {domain_id} limit exceeded: {counter}"),
                );
                return result;
            }
            Err(MetaError::QuotaOverflow { counter, .. }) => {
                result.set_error(
                    StatusCode::QuotaViolation,
                    format!("domain {domain_id} {counter} would overflow"),
                );
                return result;
            }
            Err(e) => fatal(format!("domain {domain_id} ledger: {e}")),
        }

        let id = ctx.create_path(parent_id, &self.name, PathKind::Stream);
        ctx.put_stream(id, group);
        if !self.user_attrs.is_empty() {
            ctx.set_user_attrs(id, std::mem::take(&mut self.user_attrs));
        }
        ctx.publish(op_id, parent_id);
        ctx.publish(op_id, id);
        debug!(
            %op_id,
            path_id = %id,
            partitions = reservation.partitions,
            storage_bytes = reservation.storage_bytes,
            throughput_bps = reservation.throughput_bps,
            "stream allocated"
        );
        result.path_id = Some(id);
        result
    }

    fn progress_state(&mut self, _ctx: &mut OperationContext<'_>) -> Progress {
        fatal(format!("allocate stream {} has no progress state", self.op_id))
    }

    fn abort_propose(&mut self, _ctx: &mut OperationContext<'_>) {
        debug!(op_id = %self.op_id, "allocate stream proposal aborted");
    }

    fn abort_unsafe(&mut self, tx_id: TxId, _ctx: &mut OperationContext<'_>) {
        fatal(format!(
            "allocate stream {} cannot be unwound (tx {tx_id})",
            self.op_id
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::AllocateStream;
    use crate::catalog::stream::{PartitionConfig, ResourceConfig};
    use crate::catalog::{PathId, PathKind};
    use crate::config::MetaConfig;
    use crate::hooks::OverrideSlot;
    use crate::operation::context::{OperationContext, ShardState};
    use crate::operation::{OperationId, StatusCode, SubOperationPart, TxId};
    use crate::quota::DomainLimits;
    use std::collections::BTreeMap;

    fn config(partitions: u32) -> ResourceConfig {
        ResourceConfig {
            partition_count: partitions,
            partition: PartitionConfig {
                write_speed_bytes_per_sec: 100,
                storage_limit_bytes: None,
                lifetime_seconds: 5,
            },
            sub_config: b"consumer=a".to_vec(),
        }
    }

    fn allocate(name: &str, partitions: u32) -> AllocateStream {
        AllocateStream::new(
            OperationId::new(TxId(4), 0),
            "/db".into(),
            name.into(),
            config(partitions),
            Vec::new(),
        )
    }

    fn shard(limits: DomainLimits) -> (ShardState, PathId) {
        let mut state = ShardState::default();
        let domain = state
            .tree
            .insert(PathId::ROOT, "db", PathKind::Domain, TxId(1));
        state.ledger.register_domain(domain, limits);
        (state, domain)
    }

    #[test]
    fn allocation_charges_the_reservation() {
        let (state, domain) = shard(DomainLimits::default());
        let meta = MetaConfig::default();
        let overrides = OverrideSlot::new();
        let mut ctx = OperationContext::begin(&state, &meta, &overrides, TxId(4));
        let result = allocate("s", 2).propose(&mut ctx);
        assert!(result.is_accepted(), "{}", result.explain);
        let id = result.path_id.expect("id");
        let info = ctx.ledger().domain_counters(domain).expect("domain");
        assert_eq!(info.objects, 1);
        assert_eq!(info.stream_partitions, 2);
        assert_eq!(info.reserved_storage_bytes, 500);
        assert_eq!(info.reserved_throughput_bps, 200);
        assert_eq!(
            ctx.stream(id).expect("group").total_partition_count,
            2
        );
    }

    #[test]
    fn partition_limit_rejects_without_side_effects() {
        let (state, domain) = shard(DomainLimits {
            max_stream_partitions: Some(3),
            ..DomainLimits::default()
        });
        let meta = MetaConfig::default();
        let overrides = OverrideSlot::new();
        let mut ctx = OperationContext::begin(&state, &meta, &overrides, TxId(4));
        assert!(allocate("a", 2).propose(&mut ctx).is_accepted());
        let staged = ctx.staged().len();
        let result = allocate("b", 2).propose(&mut ctx);
        assert_eq!(result.status, StatusCode::QuotaViolation);
        assert_eq!(ctx.staged().len(), staged);
        assert_eq!(
            ctx.ledger().domain_counters(domain).expect("domain").stream_partitions,
            2
        );
    }

    #[test]
    fn storage_counter_overflow_is_a_quota_violation() {
        let (state, domain) = shard(DomainLimits::default());
        let meta = MetaConfig::default();
        let overrides = OverrideSlot::new();
        let mut ctx = OperationContext::begin(&state, &meta, &overrides, TxId(4));
        let mut huge = config(1);
        huge.partition.storage_limit_bytes = Some(i64::MAX as u64);
        let allocate_huge = |name: &str| {
            AllocateStream::new(
                OperationId::new(TxId(4), 0),
                "/db".into(),
                name.into(),
                huge.clone(),
                Vec::new(),
            )
        };
        assert!(allocate_huge("a").propose(&mut ctx).is_accepted());
        assert!(allocate_huge("b").propose(&mut ctx).is_accepted());
        let staged = ctx.staged().len();
        let result = allocate_huge("c").propose(&mut ctx);
        assert_eq!(result.status, StatusCode::QuotaViolation);
        assert_eq!(ctx.staged().len(), staged);
        let info = ctx.ledger().domain_counters(domain).expect("domain");
        assert_eq!(info.objects, 2);
        assert_eq!(info.reserved_storage_bytes, 2 * (i64::MAX as u64));
    }

    #[test]
    fn attributes_are_set_on_the_new_stream() {
        let (state, _) = shard(DomainLimits::default());
        let meta = MetaConfig::default();
        let overrides = OverrideSlot::new();
        let mut ctx = OperationContext::begin(&state, &meta, &overrides, TxId(4));
        let attrs = BTreeMap::from([("owner".to_string(), "ingest".to_string())]);
        let result = allocate("s", 1)
            .with_user_attrs(attrs.clone())
            .propose(&mut ctx);
        assert!(result.is_accepted(), "{}", result.explain);
        let id = result.path_id.expect("id");
        assert_eq!(ctx.tree().node(id).user_attrs, attrs);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (state, _) = shard(DomainLimits::default());
        let meta = MetaConfig::default();
        let overrides = OverrideSlot::new();
        let mut ctx = OperationContext::begin(&state, &meta, &overrides, TxId(4));
        assert_eq!(
            allocate("s", 0).propose(&mut ctx).status,
            StatusCode::InvalidParameters
        );
    }
}
