use crate::catalog::{PathId, PathKind, PathView};
use crate::error::fatal;
use crate::operation::context::OperationContext;
use crate::operation::{
    ApplyIf, OperationId, Progress, ProposeResult, StatusCode, SubOperationPart, TxId,
    check_apply_if, check_new_name, reject_with,
};
use crate::quota::{DomainConfig, DomainLimits};
use tracing::debug;

/// Creates a top-level domain and its quota ledger entry.
#[derive(Debug)]
pub struct CreateDomain {
    pub(crate) op_id: OperationId,
    working_dir: String,
    name: String,
    limits: DomainLimits,
    apply_if: Vec<ApplyIf>,
}

impl CreateDomain {
    pub fn new(
        op_id: OperationId,
        working_dir: String,
        name: String,
        limits: DomainLimits,
        apply_if: Vec<ApplyIf>,
    ) -> Self {
        Self {
            op_id,
            working_dir,
            name,
            limits,
            apply_if,
        }
    }
}

impl SubOperationPart for CreateDomain {
    fn propose(&mut self, ctx: &mut OperationContext<'_>) -> ProposeResult {
        let op_id = self.op_id;
        let mut result = ProposeResult::accepted(op_id.tx_id);
        {
            let tree = ctx.tree();
            let root = PathView::resolve(tree, &self.working_dir);
            let checks = root.check().is_resolved();
            if !checks.ok() {
                reject_with(&mut result, &checks, None);
                return result;
            }
            if root.base_id() != Some(PathId::ROOT) {
                result.set_error(
                    StatusCode::InvalidParameters,
                    format!(
                        "domains are created at the root, working dir: {}",
                        root.path_string()
                    ),
                );
                return result;
            }
            if let Err(rejected) = check_new_name(tree, PathId::ROOT, &self.name, op_id.tx_id) {
                return rejected;
            }
            if let Err(explain) = check_apply_if(tree, &self.apply_if) {
                result.set_error(StatusCode::PreconditionFailed, explain);
                return result;
            }
        }

        let id = ctx.create_path(PathId::ROOT, &self.name, PathKind::Domain);
        ctx.register_domain(id, self.limits);
        let persisted = ctx.persist_domain_config(
            id,
            DomainConfig {
                name: self.name.clone(),
                limits: self.limits,
            },
        );
        debug!(%op_id, domain_id = %id, persisted, "domain created");
        ctx.publish(op_id, PathId::ROOT);
        ctx.publish(op_id, id);
        result.path_id = Some(id);
        result
    }

    fn progress_state(&mut self, _ctx: &mut OperationContext<'_>) -> Progress {
        fatal(format!("create domain {} has no progress state", self.op_id))
    }

    fn abort_propose(&mut self, _ctx: &mut OperationContext<'_>) {
        debug!(op_id = %self.op_id, "create domain proposal aborted");
    }

    fn abort_unsafe(&mut self, tx_id: TxId, _ctx: &mut OperationContext<'_>) {
        fatal(format!(
            "create domain {} cannot be unwound (tx {tx_id})",
            self.op_id
        ))
    }
}
