pub mod allocate_stream;
pub mod alter_stream;
pub mod cdc_stream;
pub mod completion;
pub mod context;
pub mod create_domain;
pub mod deallocate_stream;
pub mod mkdir;

use crate::catalog::checker::Checker;
use crate::catalog::stream::ResourceConfig;
use crate::catalog::{PathId, PathNode, PathTree, validate_name};
use crate::error::fatal;
use crate::operation::allocate_stream::AllocateStream;
use crate::operation::alter_stream::AlterStream;
use crate::operation::cdc_stream::{CreateCdcStream, DropCdcStream};
use crate::operation::context::OperationContext;
use crate::operation::create_domain::CreateDomain;
use crate::operation::deallocate_stream::DeallocateStream;
use crate::operation::mkdir::MkDir;
use crate::quota::{DomainLimits, QuotaDelta};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One part of a (possibly multi-part) transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId {
    pub tx_id: TxId,
    pub part: u32,
}

impl OperationId {
    pub fn new(tx_id: TxId, part: u32) -> Self {
        Self { tx_id, part }
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.part)
    }
}

/// Plan step at which a drop became final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Accepted,
    NotFound,
    AlreadyExists,
    PreconditionFailed,
    MultipleModifications,
    NameConflict,
    PathIsNotDirectory,
    QuotaViolation,
    InvalidParameters,
}

impl StatusCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Accepted => "accepted",
            StatusCode::NotFound => "not_found",
            StatusCode::AlreadyExists => "already_exists",
            StatusCode::PreconditionFailed => "precondition_failed",
            StatusCode::MultipleModifications => "multiple_modifications",
            StatusCode::NameConflict => "name_conflict",
            StatusCode::PathIsNotDirectory => "path_is_not_directory",
            StatusCode::QuotaViolation => "quota_violation",
            StatusCode::InvalidParameters => "invalid_parameters",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drop already decided for the target, reported so a retry can be treated
/// as idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathDrop {
    pub path_id: PathId,
    pub drop_tx_id: TxId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeResult {
    pub status: StatusCode,
    pub explain: String,
    pub tx_id: TxId,
    pub path_id: Option<PathId>,
    pub path_drop: Option<PathDrop>,
    pub conflicting_tx: Option<TxId>,
    /// Accepted, but the transaction finishes on a later progress tick.
    pub pending_progress: bool,
}

impl ProposeResult {
    pub fn accepted(tx_id: TxId) -> Self {
        Self {
            status: StatusCode::Accepted,
            explain: String::new(),
            tx_id,
            path_id: None,
            path_drop: None,
            conflicting_tx: None,
            pending_progress: false,
        }
    }

    pub fn rejected(tx_id: TxId, status: StatusCode, explain: impl Into<String>) -> Self {
        let mut result = Self::accepted(tx_id);
        result.set_error(status, explain);
        result
    }

    pub fn set_error(&mut self, status: StatusCode, explain: impl Into<String>) {
        if status == StatusCode::Accepted {
            fatal("set_error called with Accepted status");
        }
        self.status = status;
        self.explain = explain.into();
    }

    pub fn set_path_drop(&mut self, path_id: PathId, drop_tx_id: TxId) {
        self.path_drop = Some(PathDrop {
            path_id,
            drop_tx_id,
        });
    }

    pub fn is_accepted(&self) -> bool {
        self.status == StatusCode::Accepted
    }
}

/// Kind-specific payload of a transaction part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationSpec {
    CreateDomain { name: String, limits: DomainLimits },
    MkDir { name: String },
    AllocateStream {
        name: String,
        config: ResourceConfig,
        /// Extended attributes set on the new stream.
        #[serde(default)]
        user_attrs: BTreeMap<String, String>,
    },
    AlterStream { name: String, config: ResourceConfig },
    CreateCdcStream { name: String },
    DropCdcStream { name: String },
    DeallocateStream { name: String },
}

impl OperationSpec {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationSpec::CreateDomain { .. } => OperationKind::CreateDomain,
            OperationSpec::MkDir { .. } => OperationKind::MkDir,
            OperationSpec::AllocateStream { .. } => OperationKind::AllocateStream,
            OperationSpec::AlterStream { .. } => OperationKind::AlterStream,
            OperationSpec::CreateCdcStream { .. } => OperationKind::CreateCdcStream,
            OperationSpec::DropCdcStream { .. } => OperationKind::DropCdcStream,
            OperationSpec::DeallocateStream { .. } => OperationKind::DeallocateStream,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    CreateDomain,
    MkDir,
    AllocateStream,
    AlterStream,
    CreateCdcStream,
    DropCdcStream,
    DeallocateStream,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::CreateDomain => "create_domain",
            OperationKind::MkDir => "mkdir",
            OperationKind::AllocateStream => "allocate_stream",
            OperationKind::AlterStream => "alter_stream",
            OperationKind::CreateCdcStream => "create_cdc_stream",
            OperationKind::DropCdcStream => "drop_cdc_stream",
            OperationKind::DeallocateStream => "deallocate_stream",
        }
    }

    /// Needs progress ticks after commit and persists a [`TxStateRecord`].
    pub fn is_multi_step(self) -> bool {
        match self {
            OperationKind::AlterStream | OperationKind::DropCdcStream => true,
            OperationKind::CreateDomain
            | OperationKind::MkDir
            | OperationKind::AllocateStream
            | OperationKind::CreateCdcStream
            | OperationKind::DeallocateStream => false,
        }
    }

    /// Kinds without compensation are rolled back by discarding the context
    /// alone; calling their `abort_propose` is fatal.
    pub fn supports_abort_propose(self) -> bool {
        match self {
            OperationKind::CreateDomain
            | OperationKind::MkDir
            | OperationKind::AllocateStream
            | OperationKind::AlterStream
            | OperationKind::CreateCdcStream
            | OperationKind::DropCdcStream => true,
            OperationKind::DeallocateStream => false,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optimistic precondition: the node must still be at `expected_version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyIf {
    pub path_id: PathId,
    pub expected_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPart {
    pub working_dir: String,
    pub operation: OperationSpec,
    #[serde(default)]
    pub apply_if: Vec<ApplyIf>,
}

impl TxPart {
    pub fn new(working_dir: impl Into<String>, operation: OperationSpec) -> Self {
        Self {
            working_dir: working_dir.into(),
            operation,
            apply_if: Vec::new(),
        }
    }

    pub fn apply_if(mut self, path_id: PathId, expected_version: u64) -> Self {
        self.apply_if.push(ApplyIf {
            path_id,
            expected_version,
        });
        self
    }
}

/// Inbound transaction descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: TxId,
    pub parts: Vec<TxPart>,
}

impl Transaction {
    pub fn new(tx_id: TxId) -> Self {
        Self {
            tx_id,
            parts: Vec::new(),
        }
    }

    pub fn single(tx_id: TxId, working_dir: impl Into<String>, operation: OperationSpec) -> Self {
        Self::new(tx_id).part(TxPart::new(working_dir, operation))
    }

    pub fn part(mut self, part: TxPart) -> Self {
        self.parts.push(part);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStage {
    Altering,
    Dropping,
}

/// Persisted state of a multi-step operation between progress ticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStateRecord {
    pub op_id: OperationId,
    pub kind: OperationKind,
    pub target: PathId,
    pub stage: TxStage,
    /// Quota already charged at propose time, returned by `abort_unsafe`.
    pub reserved: QuotaDelta,
    pub pending_config: Option<Vec<u8>>,
}

/// Checks `apply_if` conditions against the alteration versions in `tree`.
pub(crate) fn check_apply_if(tree: &PathTree, conditions: &[ApplyIf]) -> Result<(), String> {
    for condition in conditions {
        let Some(node) = tree.get(condition.path_id) else {
            return Err(format!(
                "apply-if references unknown path {}",
                condition.path_id
            ));
        };
        if node.alter_version != condition.expected_version {
            return Err(format!(
                "path {} version mismatch: expected {}, actual {}",
                tree.path_string(node.id),
                condition.expected_version,
                node.alter_version
            ));
        }
    }
    Ok(())
}

/// Copies the first failed check into `result`. When the checked node already
/// has a drop decided, that drop is reported so a retry can be recognised.
pub(crate) fn reject_with(
    result: &mut ProposeResult,
    checks: &Checker<'_>,
    base: Option<&PathNode>,
) {
    let (status, explain) = checks.status_with_explain();
    result.set_error(status, explain);
    result.conflicting_tx = checks.conflicting_tx();
    if let Some(node) = base
        && let Some(drop_tx) = node.drop_tx
    {
        result.set_path_drop(node.id, drop_tx);
    }
}

/// Validates `name` as a new child of `parent`: well-formed and not held by a
/// live node. A node still being deleted under that name is reported as a
/// conflict with its drop transaction.
pub(crate) fn check_new_name(
    tree: &PathTree,
    parent: PathId,
    name: &str,
    tx_id: TxId,
) -> Result<(), ProposeResult> {
    let mut result = ProposeResult::accepted(tx_id);
    if let Err(explain) = validate_name(name) {
        result.set_error(StatusCode::InvalidParameters, explain);
        return Err(result);
    }
    if let Some(existing) = tree.child(parent, name).and_then(|id| tree.get(id))
        && !existing.is_dropped()
    {
        result.path_id = Some(existing.id);
        if existing.is_under_deleting() {
            result.set_error(
                StatusCode::MultipleModifications,
                format!(
                    "path is being deleted right now, path: {}",
                    tree.path_string(existing.id)
                ),
            );
            result.conflicting_tx = existing.drop_tx;
        } else {
            result.set_error(
                StatusCode::AlreadyExists,
                format!("path exists, path: {}", tree.path_string(existing.id)),
            );
        }
        return Err(result);
    }
    Ok(())
}

/// State machine shared by every operation kind.
///
/// `propose` must leave nothing visible outside the context when it rejects.
/// `progress_state` runs on later scheduling ticks for multi-step kinds.
/// `abort_propose` compensates in-memory effects when a sibling part rejects.
/// `abort_unsafe` undoes a recovered in-flight operation after replay.
pub(crate) trait SubOperationPart {
    fn propose(&mut self, ctx: &mut OperationContext<'_>) -> ProposeResult;
    fn progress_state(&mut self, ctx: &mut OperationContext<'_>) -> Progress;
    fn abort_propose(&mut self, ctx: &mut OperationContext<'_>);
    fn abort_unsafe(&mut self, tx_id: TxId, ctx: &mut OperationContext<'_>);
}

/// Closed set of operation kinds; adding one is a compile error at every
/// dispatch site until it is handled.
#[derive(Debug)]
pub enum SubOperation {
    CreateDomain(CreateDomain),
    MkDir(MkDir),
    AllocateStream(AllocateStream),
    AlterStream(AlterStream),
    CreateCdcStream(CreateCdcStream),
    DropCdcStream(DropCdcStream),
    DeallocateStream(DeallocateStream),
}

impl SubOperation {
    pub fn from_part(op_id: OperationId, part: TxPart) -> Self {
        let TxPart {
            working_dir,
            operation,
            apply_if,
        } = part;
        match operation {
            OperationSpec::CreateDomain { name, limits } => SubOperation::CreateDomain(
                CreateDomain::new(op_id, working_dir, name, limits, apply_if),
            ),
            OperationSpec::MkDir { name } => {
                SubOperation::MkDir(MkDir::new(op_id, working_dir, name, apply_if))
            }
            OperationSpec::AllocateStream {
                name,
                config,
                user_attrs,
            } => SubOperation::AllocateStream(
                AllocateStream::new(op_id, working_dir, name, config, apply_if)
                    .with_user_attrs(user_attrs),
            ),
            OperationSpec::AlterStream { name, config } => SubOperation::AlterStream(
                AlterStream::new(op_id, working_dir, name, config, apply_if),
            ),
            OperationSpec::CreateCdcStream { name } => SubOperation::CreateCdcStream(
                CreateCdcStream::new(op_id, working_dir, name, apply_if),
            ),
            OperationSpec::DropCdcStream { name } => SubOperation::DropCdcStream(
                DropCdcStream::new(op_id, working_dir, name, apply_if),
            ),
            OperationSpec::DeallocateStream { name } => SubOperation::DeallocateStream(
                DeallocateStream::new(op_id, working_dir, name, apply_if),
            ),
        }
    }

    /// Rebuilds an in-flight operation from its persisted state.
    pub fn restore(record: &TxStateRecord) -> Self {
        let op_id = record.op_id;
        match record.kind {
            OperationKind::AlterStream => SubOperation::AlterStream(AlterStream::restored(op_id)),
            OperationKind::DropCdcStream => {
                SubOperation::DropCdcStream(DropCdcStream::restored(op_id))
            }
            OperationKind::CreateDomain
            | OperationKind::MkDir
            | OperationKind::AllocateStream
            | OperationKind::CreateCdcStream
            | OperationKind::DeallocateStream => fatal(format!(
                "{} never persists a tx state, found one for {op_id}",
                record.kind
            )),
        }
    }

    pub fn operation_id(&self) -> OperationId {
        match self {
            SubOperation::CreateDomain(op) => op.op_id,
            SubOperation::MkDir(op) => op.op_id,
            SubOperation::AllocateStream(op) => op.op_id,
            SubOperation::AlterStream(op) => op.op_id,
            SubOperation::CreateCdcStream(op) => op.op_id,
            SubOperation::DropCdcStream(op) => op.op_id,
            SubOperation::DeallocateStream(op) => op.op_id,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            SubOperation::CreateDomain(_) => OperationKind::CreateDomain,
            SubOperation::MkDir(_) => OperationKind::MkDir,
            SubOperation::AllocateStream(_) => OperationKind::AllocateStream,
            SubOperation::AlterStream(_) => OperationKind::AlterStream,
            SubOperation::CreateCdcStream(_) => OperationKind::CreateCdcStream,
            SubOperation::DropCdcStream(_) => OperationKind::DropCdcStream,
            SubOperation::DeallocateStream(_) => OperationKind::DeallocateStream,
        }
    }

    fn part(&mut self) -> &mut dyn SubOperationPart {
        match self {
            SubOperation::CreateDomain(op) => op,
            SubOperation::MkDir(op) => op,
            SubOperation::AllocateStream(op) => op,
            SubOperation::AlterStream(op) => op,
            SubOperation::CreateCdcStream(op) => op,
            SubOperation::DropCdcStream(op) => op,
            SubOperation::DeallocateStream(op) => op,
        }
    }

    pub fn propose(&mut self, ctx: &mut OperationContext<'_>) -> ProposeResult {
        let op_id = self.operation_id();
        let kind = self.kind();
        let mut result = self.part().propose(ctx);
        if result.is_accepted() {
            result.pending_progress = kind.is_multi_step();
            info!(%op_id, %kind, path_id = ?result.path_id, "proposal accepted");
        } else {
            warn!(
                %op_id,
                %kind,
                status = result.status.as_str(),
                explain = %result.explain,
                "proposal rejected"
            );
        }
        result
    }

    pub fn progress_state(&mut self, ctx: &mut OperationContext<'_>) -> Progress {
        self.part().progress_state(ctx)
    }

    pub fn abort_propose(&mut self, ctx: &mut OperationContext<'_>) {
        self.part().abort_propose(ctx)
    }

    pub fn abort_unsafe(&mut self, tx_id: TxId, ctx: &mut OperationContext<'_>) {
        self.part().abort_unsafe(tx_id, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        OperationId, OperationKind, OperationSpec, ProposeResult, StatusCode, SubOperation,
        Transaction, TxId, TxPart, TxStage, TxStateRecord, check_apply_if,
    };
    use crate::catalog::{PathId, PathKind, PathTree};
    use crate::quota::QuotaDelta;

    #[test]
    fn descriptor_selects_matching_kind() {
        let tx = Transaction::single(
            TxId(5),
            "/db",
            OperationSpec::DeallocateStream {
                name: "s".into(),
            },
        );
        let part = tx.parts.into_iter().next().expect("part");
        let op = SubOperation::from_part(OperationId::new(TxId(5), 0), part);
        assert_eq!(op.kind(), OperationKind::DeallocateStream);
        assert_eq!(op.operation_id().to_string(), "5:0");
    }

    #[test]
    fn rejected_result_carries_status_and_explain() {
        let result = ProposeResult::rejected(TxId(1), StatusCode::NameConflict, "nope");
        assert!(!result.is_accepted());
        assert_eq!(result.status.as_str(), "name_conflict");
        assert_eq!(result.explain, "nope");
    }

    #[test]
    #[should_panic(expected = "set_error called with Accepted")]
    fn accepted_is_not_an_error() {
        ProposeResult::accepted(TxId(1)).set_error(StatusCode::Accepted, "");
    }

    #[test]
    fn apply_if_compares_alter_versions() {
        let mut tree = PathTree::new();
        let domain = tree.insert(PathId::ROOT, "db", PathKind::Domain, TxId(1));
        let version = tree.get(domain).expect("domain").alter_version;
        let part = TxPart::new("/", OperationSpec::MkDir { name: "x".into() })
            .apply_if(domain, version);
        assert!(check_apply_if(&tree, &part.apply_if).is_ok());
        let stale = TxPart::new("/", OperationSpec::MkDir { name: "x".into() })
            .apply_if(domain, version + 1);
        let err = check_apply_if(&tree, &stale.apply_if).expect_err("stale");
        assert!(err.contains("version mismatch"));
        let unknown = TxPart::new("/", OperationSpec::MkDir { name: "x".into() })
            .apply_if(PathId(99), 1);
        assert!(check_apply_if(&tree, &unknown.apply_if).is_err());
    }

    #[test]
    fn only_multi_step_kinds_restore() {
        let record = TxStateRecord {
            op_id: OperationId::new(TxId(3), 0),
            kind: OperationKind::DropCdcStream,
            target: PathId(4),
            stage: TxStage::Dropping,
            reserved: QuotaDelta::default(),
            pending_config: None,
        };
        let op = SubOperation::restore(&record);
        assert_eq!(op.kind(), OperationKind::DropCdcStream);
        assert!(OperationKind::AlterStream.is_multi_step());
        assert!(!OperationKind::DeallocateStream.supports_abort_propose());
    }

    #[test]
    #[should_panic(expected = "never persists a tx state")]
    fn restoring_single_step_kind_is_fatal() {
        let record = TxStateRecord {
            op_id: OperationId::new(TxId(3), 0),
            kind: OperationKind::DeallocateStream,
            target: PathId(4),
            stage: TxStage::Dropping,
            reserved: QuotaDelta::default(),
            pending_config: None,
        };
        let _ = SubOperation::restore(&record);
    }
}
