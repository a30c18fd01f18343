use crate::operation::{StepId, TxId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Arena index of a node in the path tree. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathId(pub u64);

impl PathId {
    pub const ROOT: PathId = PathId(0);
}

impl std::fmt::Display for PathId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathKind {
    Root,
    Domain,
    Directory,
    Stream,
    CdcStream,
}

impl PathKind {
    pub fn is_like_directory(self) -> bool {
        matches!(self, PathKind::Root | PathKind::Domain | PathKind::Directory)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PathKind::Root => "root",
            PathKind::Domain => "domain",
            PathKind::Directory => "directory",
            PathKind::Stream => "stream",
            PathKind::CdcStream => "cdc_stream",
        }
    }
}

impl std::fmt::Display for PathKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathState {
    Created,
    AlteringInProgress,
    MarkedDeleted,
    /// Terminal.
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathNode {
    pub id: PathId,
    pub name: String,
    pub parent: Option<PathId>,
    /// Children by name, dropped ones included until the name is reused.
    pub children: BTreeMap<String, PathId>,
    pub kind: PathKind,
    pub state: PathState,
    /// Top-level domain the node is accounted to; the root points at itself.
    pub domain: PathId,
    pub owning_tx: Option<TxId>,
    pub created_tx: TxId,
    pub last_tx: TxId,
    pub drop_tx: Option<TxId>,
    pub drop_step: Option<StepId>,
    pub alter_version: u64,
    pub dir_alter_version: u64,
    pub user_attrs: BTreeMap<String, String>,
    /// Derived from children states; rebuilt after replay.
    #[serde(skip)]
    pub alive_children: u64,
}

impl PathNode {
    pub(crate) fn new(
        id: PathId,
        name: String,
        parent: Option<PathId>,
        kind: PathKind,
        domain: PathId,
        tx_id: TxId,
    ) -> Self {
        Self {
            id,
            name,
            parent,
            children: BTreeMap::new(),
            kind,
            state: PathState::Created,
            domain,
            owning_tx: None,
            created_tx: tx_id,
            last_tx: tx_id,
            drop_tx: None,
            drop_step: None,
            alter_version: 1,
            dir_alter_version: 1,
            user_attrs: BTreeMap::new(),
            alive_children: 0,
        }
    }

    pub fn is_dropped(&self) -> bool {
        self.state == PathState::Dropped
    }

    pub fn is_under_deleting(&self) -> bool {
        self.state == PathState::MarkedDeleted
    }

    /// A drop has been decided for this node, whether or not it finished.
    pub fn planned_to_drop(&self) -> bool {
        self.drop_tx.is_some()
    }

    pub fn is_under_operation(&self) -> bool {
        self.owning_tx.is_some()
    }
}
