//! Change-data-capture streams.
//!
//! A CDC stream is a container for partitioned streams. Dropping one is a
//! two-step operation: `propose` claims it and marks it under deletion, so
//! the streams inside can be deallocated by later parts of the same
//! transaction; `progress_state` finishes the drop once no live child is
//! left.

use crate::catalog::{PathId, PathKind, PathTree, PathView};
use crate::error::{MetaError, fatal};
use crate::operation::context::OperationContext;
use crate::operation::{
    ApplyIf, OperationId, OperationKind, Progress, ProposeResult, StatusCode, SubOperationPart,
    TxId, TxStage, TxStateRecord, check_apply_if, check_new_name, reject_with,
};
use crate::quota::QuotaDelta;
use tracing::{debug, info};

#[derive(Debug)]
pub struct CreateCdcStream {
    pub(crate) op_id: OperationId,
    working_dir: String,
    name: String,
    apply_if: Vec<ApplyIf>,
}

impl CreateCdcStream {
    pub fn new(op_id: OperationId, working_dir: String, name: String, apply_if: Vec<ApplyIf>) -> Self {
        Self {
            op_id,
            working_dir,
            name,
            apply_if,
        }
    }
}

impl SubOperationPart for CreateCdcStream {
    fn propose(&mut self, ctx: &mut OperationContext<'_>) -> ProposeResult {
        let op_id = self.op_id;
        let mut result = ProposeResult::accepted(op_id.tx_id);
        let (parent_id, domain_id) = {
            let tree = ctx.tree();
            let parent = PathView::resolve(tree, &self.working_dir);
            let checks = parent
                .check()
                .not_under_domain_upgrade()
                .is_resolved()
                .not_deleted()
                .not_under_deleting()
                .is_like_directory()
                .is_inside_domain();
            if !checks.ok() {
                reject_with(&mut result, &checks, None);
                return result;
            }
            let Some(parent_node) = parent.base() else {
                fatal(format!("resolved path {} has no base", parent.path_string()));
            };
            if let Err(rejected) = check_new_name(tree, parent_node.id, &self.name, op_id.tx_id) {
                return rejected;
            }
            if let Err(explain) = check_apply_if(tree, &self.apply_if) {
                result.set_error(StatusCode::PreconditionFailed, explain);
                return result;
            }
            (parent_node.id, parent_node.domain)
        };

        match ctx.reserve_quota(domain_id, &QuotaDelta::objects(1)) {
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
        let id = ctx.create_path(parent_id, &self.name, PathKind::CdcStream);
        ctx.publish(op_id, parent_id);
        ctx.publish(op_id, id);
        result.path_id = Some(id);
        result
    }

    fn progress_state(&mut self, _ctx: &mut OperationContext<'_>) -> Progress {
        fatal(format!("create cdc stream {} has no progress state", self.op_id))
    }

    fn abort_propose(&mut self, _ctx: &mut OperationContext<'_>) {
        debug!(op_id = %self.op_id, "create cdc stream proposal aborted");
    }

    fn abort_unsafe(&mut self, tx_id: TxId, _ctx: &mut OperationContext<'_>) {
        fatal(format!(
            "create cdc stream {} cannot be unwound (tx {tx_id})",
            self.op_id
        ))
    }
}

#[derive(Debug)]
struct DropRequest {
    working_dir: String,
    name: String,
    apply_if: Vec<ApplyIf>,
}

#[derive(Debug)]
pub struct DropCdcStream {
    pub(crate) op_id: OperationId,
    /// Absent for an operation restored from the journal.
    request: Option<DropRequest>,
    target: Option<PathId>,
}

impl DropCdcStream {
    pub fn new(op_id: OperationId, working_dir: String, name: String, apply_if: Vec<ApplyIf>) -> Self {
        Self {
            op_id,
            request: Some(DropRequest {
                working_dir,
                name,
                apply_if,
            }),
            target: None,
        }
    }

    pub(crate) fn restored(op_id: OperationId) -> Self {
        Self {
            op_id,
            request: None,
            target: None,
        }
    }

    fn check_target(&self, tree: &PathTree, request: &DropRequest) -> Result<PathId, ProposeResult> {
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
            .is_of_kind(PathKind::CdcStream);
        if !checks.ok() {
            reject_with(&mut result, &checks, path.base());
            return Err(result);
        }
        if let Err(explain) = check_apply_if(tree, &request.apply_if) {
            result.set_error(StatusCode::PreconditionFailed, explain);
            return Err(result);
        }
        let Some(target) = path.base_id() else {
            fatal(format!("resolved path {} has no base", path.path_string()));
        };
        Ok(target)
    }

    fn record(&self, ctx: &OperationContext<'_>) -> TxStateRecord {
        ctx.tx_state(self.op_id)
            .cloned()
            .unwrap_or_else(|| fatal(format!("drop cdc stream {} has no tx state", self.op_id)))
    }
}

impl SubOperationPart for DropCdcStream {
    fn propose(&mut self, ctx: &mut OperationContext<'_>) -> ProposeResult {
        let op_id = self.op_id;
        let Some(request) = self.request.as_ref() else {
            fatal(format!("restored drop cdc stream {op_id} cannot propose"));
        };
        let target = match self.check_target(ctx.tree(), request) {
            Ok(target) => target,
            Err(rejected) => return rejected,
        };

        if let Err(e) = ctx.claim(target) {
            fatal(format!("claim after passing checks: {e}"));
        }
        ctx.mark_under_deleting(target);
        ctx.put_tx_state(TxStateRecord {
            op_id,
            kind: OperationKind::DropCdcStream,
            target,
            stage: TxStage::Dropping,
            reserved: QuotaDelta::default(),
            pending_config: None,
        });
        if !ctx.config().disable_publications_of_dropping {
            ctx.publish(op_id, target);
        }
        self.target = Some(target);

        let mut result = ProposeResult::accepted(op_id.tx_id);
        result.path_id = Some(target);
        result
    }

    fn progress_state(&mut self, ctx: &mut OperationContext<'_>) -> Progress {
        let op_id = self.op_id;
        let record = self.record(ctx);
        let target = record.target;
        let (alive, parent, domain) = {
            let node = ctx.tree().node(target);
            let Some(parent) = node.parent else {
                fatal(format!("cdc stream {target} has no parent"));
            };
            (node.alive_children, parent, node.domain)
        };
        if alive > 0 {
            debug!(%op_id, path_id = %target, alive, "cdc stream still has live children");
            return Progress::Pending;
        }

        if let Err(e) = ctx.apply_quota(domain, &QuotaDelta::objects(-1)) {
            fatal(format!("domain {domain} ledger: {e}"));
        }
        ctx.mark_dropped(target);
        ctx.dec_alive_children(parent);
        ctx.bump_dir_alter_version(parent);
        ctx.remove_tx_state(op_id);
        if !ctx.config().disable_publications_of_dropping {
            ctx.publish(op_id, parent);
            ctx.publish(op_id, target);
        }
        ctx.finalize(op_id);
        info!(%op_id, path_id = %target, "cdc stream dropped");
        Progress::Done
    }

    fn abort_propose(&mut self, ctx: &mut OperationContext<'_>) {
        let Some(target) = self.target.take() else {
            return;
        };
        ctx.unmark_under_deleting(target);
        ctx.release(target);
        ctx.remove_tx_state(self.op_id);
    }

    fn abort_unsafe(&mut self, tx_id: TxId, ctx: &mut OperationContext<'_>) {
        let record = self.record(ctx);
        let target = record.target;
        info!(op_id = %self.op_id, %tx_id, path_id = %target, "unwinding cdc stream drop");
        ctx.unmark_under_deleting(target);
        ctx.release(target);
        ctx.remove_tx_state(self.op_id);
        ctx.publish(self.op_id, target);
    }
}
