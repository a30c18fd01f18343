//! Drop of a partitioned stream group.
//!
//! Single-step: everything happens in `propose`. The path is tombstoned, the
//! group's reservation goes back to the domain and both the path and its
//! parent are republished. The state machine's other edges are unreachable
//! for this kind and treated as invariant violations.

use crate::catalog::stream::ResourceConfig;
use crate::catalog::{PathId, PathKind, PathTree, PathView};
use crate::error::{MetaError, fatal};
use crate::operation::context::OperationContext;
use crate::operation::{
    ApplyIf, OperationId, Progress, ProposeResult, StatusCode, SubOperationPart, TxId,
    check_apply_if, reject_with,
};
use tracing::debug;

#[derive(Debug)]
pub struct DeallocateStream {
    pub(crate) op_id: OperationId,
    working_dir: String,
    name: String,
    apply_if: Vec<ApplyIf>,
}

struct Target {
    path_id: PathId,
    parent_id: PathId,
    domain_id: PathId,
}

impl DeallocateStream {
    pub fn new(op_id: OperationId, working_dir: String, name: String, apply_if: Vec<ApplyIf>) -> Self {
        Self {
            op_id,
            working_dir,
            name,
            apply_if,
        }
    }

    fn check_target(&self, tree: &PathTree) -> Result<Target, ProposeResult> {
        let tx_id = self.op_id.tx_id;
        let mut result = ProposeResult::accepted(tx_id);

        let path = PathView::resolve(tree, &self.working_dir).dive(&self.name);
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
        let Some(node) = path.base() else {
            fatal(format!("resolved path {} has no base", path.path_string()));
        };

        let parent = path.parent();
        let Some(parent_node) = parent.base() else {
            fatal(format!("stream {} has no resolved parent", node.id));
        };
        // A change-data-capture parent may be mid-drop, but only by the
        // transaction that is deallocating its streams.
        let parent_checks = if parent_node.kind == PathKind::CdcStream {
            parent
                .check()
                .is_under_deleting(StatusCode::NameConflict)
                .is_under_the_same_operation(tx_id)
        } else {
            parent
                .check()
                .not_deleted()
                .is_like_directory()
                .not_under_deleting()
        };
        if !parent_checks.ok() {
            reject_with(&mut result, &parent_checks, None);
            return Err(result);
        }

        if let Err(explain) = check_apply_if(tree, &self.apply_if) {
            result.set_error(StatusCode::PreconditionFailed, explain);
            return Err(result);
        }

        Ok(Target {
            path_id: node.id,
            parent_id: parent_node.id,
            domain_id: node.domain,
        })
    }
}

impl SubOperationPart for DeallocateStream {
    fn propose(&mut self, ctx: &mut OperationContext<'_>) -> ProposeResult {
        let op_id = self.op_id;
        let mut result = ProposeResult::accepted(op_id.tx_id);
        let target = match self.check_target(ctx.tree()) {
            Ok(target) => target,
            Err(rejected) => return rejected,
        };
        result.path_id = Some(target.path_id);

        let Some(group) = ctx.stream(target.path_id) else {
            fatal(format!("stream path {} has no stream group", target.path_id));
        };
        if group.pending_alter.is_some() {
            result.set_error(
                StatusCode::MultipleModifications,
                format!(
                    "stream group is under alteration, path: {}/{}",
                    self.working_dir, self.name
                ),
            );
            return result;
        }
        if group.config_blob.is_empty() {
            fatal(format!("stream group {} has an empty config", target.path_id));
        }
        let reservation = ResourceConfig::decode(&group.config_blob)
            .and_then(|config| config.reservation())
            .unwrap_or_else(|e| {
                fatal(format!("stream group {} config is unreadable: {e}", target.path_id))
            });
        let release = reservation
            .release_delta()
            .unwrap_or_else(|e| fatal(format!("stream group {} release: {e}", target.path_id)));

        match ctx.apply_quota(target.domain_id, &release) {
            Ok(_) => {}
            Err(MetaError::QuotaUnderflow { counter, .. }) => {
                result.set_error(
                    StatusCode::QuotaViolation,
                    format!(
                        "releasing stream would underflow {counter} of domain {}",
                        target.domain_id
                    ),
                );
                return result;
            }
            Err(e) => fatal(format!("domain {} ledger: {e}", target.domain_id)),
        }

        let step = ctx.mark_dropped(target.path_id);
        ctx.dec_alive_children(target.parent_id);
        if !ctx.config().disable_cleanup_on_drop_for_test {
            ctx.remove_stream(target.path_id);
        }
        let removed_attrs = ctx.clear_user_attrs(target.path_id);
        let dir_version = ctx.bump_dir_alter_version(target.parent_id);
        ctx.invalidate(target.path_id);
        ctx.invalidate(target.parent_id);
        if !ctx.config().disable_publications_of_dropping {
            ctx.publish(op_id, target.parent_id);
            ctx.publish(op_id, target.path_id);
        }
        debug!(
            %op_id,
            path_id = %target.path_id,
            step = step.0,
            removed_attrs,
            dir_version,
            partitions = reservation.partitions,
            storage_bytes = reservation.storage_bytes,
            "stream deallocated"
        );
        result
    }

    fn progress_state(&mut self, _ctx: &mut OperationContext<'_>) -> Progress {
        fatal(format!("deallocate stream {} has no progress state", self.op_id))
    }

    fn abort_propose(&mut self, _ctx: &mut OperationContext<'_>) {
        fatal(format!("deallocate stream {} cannot abort a proposal", self.op_id))
    }

    fn abort_unsafe(&mut self, tx_id: TxId, _ctx: &mut OperationContext<'_>) {
        fatal(format!(
            "deallocate stream {} cannot be unwound (tx {tx_id})",
            self.op_id
        ))
    }
}
