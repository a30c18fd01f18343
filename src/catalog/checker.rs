//! Composable read-only preconditions over a [`PathView`].
//!
//! Every check in a chain is evaluated, failed or not. The chain reports the
//! first failure as its status while keeping the rest for inspection, so a
//! caller can still look at terminal state (an existing drop transaction, the
//! owner of a claim) after the chain said no. Checks that need the base node
//! are silently skipped when the path did not resolve; `is_resolved` is the
//! one that reports that.

use crate::catalog::{PathKind, PathNode, PathState, PathView};
use crate::operation::{StatusCode, TxId};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFailure {
    pub check: &'static str,
    pub status: StatusCode,
    pub explain: String,
    /// Transaction that holds the node, when the failure is a conflict.
    pub conflicting_tx: Option<TxId>,
}

#[derive(Debug, Clone)]
pub struct Checker<'a> {
    view: PathView<'a>,
    failures: Vec<CheckFailure>,
}

impl<'a> Checker<'a> {
    pub(crate) fn new(view: PathView<'a>) -> Self {
        Self {
            view,
            failures: Vec::new(),
        }
    }

    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[CheckFailure] {
        &self.failures
    }

    pub fn first_failure(&self) -> Option<&CheckFailure> {
        self.failures.first()
    }

    pub fn conflicting_tx(&self) -> Option<TxId> {
        self.failures.iter().find_map(|f| f.conflicting_tx)
    }

    pub fn status_with_explain(&self) -> (StatusCode, String) {
        match self.failures.first() {
            Some(failure) => (failure.status, failure.explain.clone()),
            None => (StatusCode::Accepted, String::new()),
        }
    }

    fn fail(&mut self, check: &'static str, status: StatusCode, explain: String) {
        self.fail_with_conflict(check, status, explain, None);
    }

    fn fail_with_conflict(
        &mut self,
        check: &'static str,
        status: StatusCode,
        explain: String,
        conflicting_tx: Option<TxId>,
    ) {
        debug!(
            check,
            status = status.as_str(),
            path = %self.view.path_string(),
            "path check failed"
        );
        self.failures.push(CheckFailure {
            check,
            status,
            explain,
            conflicting_tx,
        });
    }

    fn with_base(mut self, check: impl FnOnce(&mut Self, &'a PathNode)) -> Self {
        if let Some(node) = self.view.base() {
            check(&mut self, node);
        }
        self
    }

    pub fn not_empty(mut self) -> Self {
        let empty = self.view.segments().is_empty()
            || self.view.segments().iter().any(|segment| segment.is_empty());
        if empty {
            let explain = format!("path is empty, path: {}", self.view.path_string());
            self.fail("not_empty", StatusCode::InvalidParameters, explain);
        }
        self
    }

    pub fn is_resolved(mut self) -> Self {
        if !self.view.is_resolved() {
            let nearest = self.view.nearest_resolved();
            let explain = format!(
                "path hasn't been resolved, nearest resolved path: {} ({}), path: {}",
                self.view.tree().path_string(nearest.id),
                nearest.id,
                self.view.path_string()
            );
            self.fail("is_resolved", StatusCode::NotFound, explain);
        }
        self
    }

    pub fn not_deleted(self) -> Self {
        self.with_base(|checker, node| {
            if node.is_dropped() {
                let explain = format!(
                    "path has been deleted, path: {}, drop tx: {}",
                    checker.view.path_string(),
                    node.drop_tx.map(|tx| tx.to_string()).unwrap_or_default()
                );
                checker.fail_with_conflict(
                    "not_deleted",
                    StatusCode::NotFound,
                    explain,
                    node.drop_tx,
                );
            }
        })
    }

    pub fn not_under_deleting(self) -> Self {
        self.with_base(|checker, node| {
            if node.is_under_deleting() {
                let explain = format!(
                    "path is being deleted right now, path: {}, drop tx: {}",
                    checker.view.path_string(),
                    node.drop_tx.map(|tx| tx.to_string()).unwrap_or_default()
                );
                checker.fail_with_conflict(
                    "not_under_deleting",
                    StatusCode::MultipleModifications,
                    explain,
                    node.drop_tx,
                );
            }
        })
    }

    pub fn is_under_deleting(self, status: StatusCode) -> Self {
        self.with_base(|checker, node| {
            if !node.is_under_deleting() {
                let explain = format!(
                    "path is not being deleted, path: {}",
                    checker.view.path_string()
                );
                checker.fail("is_under_deleting", status, explain);
            }
        })
    }

    pub fn not_under_operation(self) -> Self {
        self.with_base(|checker, node| {
            if let Some(owner) = node.owning_tx {
                let explain = format!(
                    "path is under operation, path: {}, owner tx: {owner}",
                    checker.view.path_string()
                );
                checker.fail_with_conflict(
                    "not_under_operation",
                    StatusCode::MultipleModifications,
                    explain,
                    Some(owner),
                );
            }
        })
    }

    /// Passes only when the node is held by `tx_id` itself.
    pub fn is_under_the_same_operation(self, tx_id: TxId) -> Self {
        self.with_base(|checker, node| {
            if node.owning_tx != Some(tx_id) {
                let explain = format!(
                    "path is not held by tx {tx_id}, path: {}, owner tx: {}",
                    checker.view.path_string(),
                    node.owning_tx
                        .map(|tx| tx.to_string())
                        .unwrap_or_else(|| "none".into())
                );
                checker.fail_with_conflict(
                    "is_under_the_same_operation",
                    StatusCode::PreconditionFailed,
                    explain,
                    node.owning_tx,
                );
            }
        })
    }

    pub fn is_of_kind(self, kind: PathKind) -> Self {
        self.with_base(|checker, node| {
            if node.kind != kind {
                let explain = format!(
                    "path is not a {kind}, path: {}, actual kind: {}",
                    checker.view.path_string(),
                    node.kind
                );
                checker.fail("is_of_kind", StatusCode::NameConflict, explain);
            }
        })
    }

    pub fn is_like_directory(self) -> Self {
        self.with_base(|checker, node| {
            if !node.kind.is_like_directory() {
                let explain = format!(
                    "path is not a directory, path: {}, kind: {}",
                    checker.view.path_string(),
                    node.kind
                );
                checker.fail("is_like_directory", StatusCode::PathIsNotDirectory, explain);
            }
        })
    }

    /// The node sits inside a domain rather than being the root itself.
    pub fn is_inside_domain(self) -> Self {
        self.with_base(|checker, node| {
            if node.kind == PathKind::Root {
                let explain = format!(
                    "path is outside of any domain, path: {}",
                    checker.view.path_string()
                );
                checker.fail("is_inside_domain", StatusCode::InvalidParameters, explain);
            }
        })
    }

    pub fn not_under_domain_upgrade(self) -> Self {
        let domain = self.view.domain();
        self.with_base(|checker, _| {
            if let Some(domain) = domain
                && domain.state == PathState::AlteringInProgress
            {
                let explain = format!(
                    "domain is under upgrade, domain: {}, path: {}",
                    domain.name,
                    checker.view.path_string()
                );
                checker.fail_with_conflict(
                    "not_under_domain_upgrade",
                    StatusCode::MultipleModifications,
                    explain,
                    domain.owning_tx,
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::catalog::{PathId, PathKind, PathState, PathTree, PathView};
    use crate::operation::{StatusCode, StepId, TxId};

    fn tree_with_stream() -> (PathTree, PathId, PathId) {
        let mut tree = PathTree::new();
        let domain = tree.insert(PathId::ROOT, "db", PathKind::Domain, TxId(1));
        let dir = tree.insert(domain, "dir", PathKind::Directory, TxId(1));
        let stream = tree.insert(dir, "s", PathKind::Stream, TxId(1));
        (tree, domain, stream)
    }

    #[test]
    fn passing_chain_is_ok() {
        let (tree, _, _) = tree_with_stream();
        let checks = PathView::resolve(&tree, "/db/dir/s")
            .check()
            .not_empty()
            .not_under_domain_upgrade()
            .is_resolved()
            .not_deleted()
            .not_under_deleting()
            .not_under_operation()
            .is_of_kind(PathKind::Stream);
        assert!(checks.ok());
        assert_eq!(checks.status_with_explain().0, StatusCode::Accepted);
    }

    #[test]
    fn unresolved_path_reports_not_found_and_skips_node_checks() {
        let (tree, _, _) = tree_with_stream();
        let checks = PathView::resolve(&tree, "/db/dir/missing")
            .check()
            .is_resolved()
            .not_deleted()
            .is_of_kind(PathKind::Stream);
        assert!(!checks.ok());
        assert_eq!(checks.failures().len(), 1);
        let (status, explain) = checks.status_with_explain();
        assert_eq!(status, StatusCode::NotFound);
        assert!(explain.contains("nearest resolved path: /db/dir"));
    }

    #[test]
    fn every_check_runs_and_first_failure_wins() {
        let (mut tree, _, stream) = tree_with_stream();
        tree.claim(stream, TxId(7)).expect("claim");
        let checks = PathView::resolve(&tree, "/db/dir/s")
            .check()
            .not_under_operation()
            .is_of_kind(PathKind::Directory);
        assert_eq!(checks.failures().len(), 2);
        assert_eq!(
            checks.status_with_explain().0,
            StatusCode::MultipleModifications
        );
        assert_eq!(checks.conflicting_tx(), Some(TxId(7)));
        assert_eq!(checks.failures()[1].status, StatusCode::NameConflict);
    }

    #[test]
    fn deleted_path_exposes_drop_tx() {
        let (mut tree, _, stream) = tree_with_stream();
        tree.mark_dropped(stream, TxId(9), StepId(1));
        let checks = PathView::resolve(&tree, "/db/dir/s")
            .check()
            .is_resolved()
            .not_deleted();
        assert_eq!(checks.status_with_explain().0, StatusCode::NotFound);
        assert_eq!(checks.conflicting_tx(), Some(TxId(9)));
    }

    #[test]
    fn empty_segment_fails_not_empty() {
        let (tree, _, _) = tree_with_stream();
        let checks = PathView::resolve(&tree, "/db/dir").dive("").check().not_empty();
        assert_eq!(checks.status_with_explain().0, StatusCode::InvalidParameters);
        let root = PathView::resolve(&tree, "/").check().not_empty();
        assert!(!root.ok());
    }

    #[test]
    fn same_operation_check_rejects_foreign_owner() {
        let (mut tree, _, stream) = tree_with_stream();
        tree.mark_under_deleting(stream, TxId(3));
        tree.claim(stream, TxId(3)).expect("claim");
        let view = PathView::resolve(&tree, "/db/dir/s");
        assert!(
            view.check()
                .is_under_deleting(StatusCode::NameConflict)
                .is_under_the_same_operation(TxId(3))
                .ok()
        );
        let foreign = view
            .check()
            .is_under_deleting(StatusCode::NameConflict)
            .is_under_the_same_operation(TxId(4));
        assert_eq!(
            foreign.status_with_explain().0,
            StatusCode::PreconditionFailed
        );
        assert_eq!(foreign.conflicting_tx(), Some(TxId(3)));
    }

    #[test]
    fn domain_upgrade_blocks_paths_inside_it() {
        let (mut tree, domain, _) = tree_with_stream();
        tree.set_state(domain, PathState::AlteringInProgress);
        let checks = PathView::resolve(&tree, "/db/dir/s")
            .check()
            .not_under_domain_upgrade();
        assert_eq!(
            checks.status_with_explain().0,
            StatusCode::MultipleModifications
        );
    }

    #[test]
    fn directory_checks() {
        let (tree, _, _) = tree_with_stream();
        assert!(
            PathView::resolve(&tree, "/db/dir")
                .check()
                .is_like_directory()
                .is_inside_domain()
                .ok()
        );
        let stream = PathView::resolve(&tree, "/db/dir/s")
            .check()
            .is_like_directory();
        assert_eq!(
            stream.status_with_explain().0,
            StatusCode::PathIsNotDirectory
        );
        let root = PathView::resolve(&tree, "/").check().is_inside_domain();
        assert!(!root.ok());
    }
}
