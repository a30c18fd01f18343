use crate::catalog::{PathKind, PathView};
use crate::error::{MetaError, fatal};
use crate::operation::context::OperationContext;
use crate::operation::{
    ApplyIf, OperationId, Progress, ProposeResult, StatusCode, SubOperationPart, TxId,
    check_apply_if, check_new_name, reject_with,
};
use crate::quota::QuotaDelta;
use tracing::debug;

#[derive(Debug)]
pub struct MkDir {
    pub(crate) op_id: OperationId,
    working_dir: String,
    name: String,
    apply_if: Vec<ApplyIf>,
}

impl MkDir {
    pub fn new(op_id: OperationId, working_dir: String, name: String, apply_if: Vec<ApplyIf>) -> Self {
        Self {
            op_id,
            working_dir,
            name,
            apply_if,
        }
    }
}

impl SubOperationPart for MkDir {
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

        let id = ctx.create_path(parent_id, &self.name, PathKind::Directory);
        ctx.publish(op_id, parent_id);
        ctx.publish(op_id, id);
        result.path_id = Some(id);
        result
    }

    fn progress_state(&mut self, _ctx: &mut OperationContext<'_>) -> Progress {
        fatal(format!("mkdir {} has no progress state", self.op_id))
    }

    fn abort_propose(&mut self, _ctx: &mut OperationContext<'_>) {
        // the new node and its quota live only in the discarded context
        debug!(op_id = %self.op_id, "mkdir proposal aborted");
    }

    fn abort_unsafe(&mut self, tx_id: TxId, _ctx: &mut OperationContext<'_>) {
        fatal(format!("mkdir {} cannot be unwound (tx {tx_id})", self.op_id))
    }
}
