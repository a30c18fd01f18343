//! Read-side path descriptions and their LRU cache.

use crate::catalog::stream::ResourceConfig;
use crate::catalog::{PathId, PathKind, PathState};
use crate::error::{MetaError, ResourceType};
use crate::operation::TxId;
use crate::operation::context::ShardState;
use crate::quota::DomainInfo;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescription {
    pub partition_count: u32,
    pub alter_version: u64,
    pub config: ResourceConfig,
    pub alter_pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathDescription {
    pub path_id: PathId,
    pub path: String,
    pub kind: PathKind,
    pub state: PathState,
    pub domain: PathId,
    pub owning_tx: Option<TxId>,
    pub created_tx: TxId,
    pub drop_tx: Option<TxId>,
    pub alter_version: u64,
    pub dir_alter_version: u64,
    /// Live children names; dropped children are not listed.
    pub children: Vec<String>,
    pub user_attrs: BTreeMap<String, String>,
    pub stream: Option<StreamDescription>,
    /// Counters of the domain, present when the node is the domain itself.
    pub domain_counters: Option<DomainInfo>,
}

impl PathDescription {
    pub fn build(state: &ShardState, path_id: PathId) -> Result<Self, MetaError> {
        let tree = state.tree();
        let node = tree.get(path_id).ok_or(MetaError::NotFound {
            resource_type: ResourceType::Path,
            resource_id: path_id.to_string(),
        })?;
        let stream = match state.stream(path_id) {
            Some(group) => Some(StreamDescription {
                partition_count: group.total_partition_count,
                alter_version: group.alter_version,
                config: ResourceConfig::decode(&group.config_blob)?,
                alter_pending: group.pending_alter.is_some(),
            }),
            None => None,
        };
        let domain_counters = if node.kind == PathKind::Domain {
            state.ledger().domain_counters(path_id)
        } else {
            None
        };
        Ok(Self {
            path_id,
            path: tree.path_string(path_id),
            kind: node.kind,
            state: node.state,
            domain: node.domain,
            owning_tx: node.owning_tx,
            created_tx: node.created_tx,
            drop_tx: node.drop_tx,
            alter_version: node.alter_version,
            dir_alter_version: node.dir_alter_version,
            children: tree.alive_children(path_id).map(|c| c.name.clone()).collect(),
            user_attrs: node.user_attrs.clone(),
            stream,
            domain_counters,
        })
    }

    pub fn to_json(&self) -> Result<String, MetaError> {
        serde_json::to_string(self).map_err(|e| MetaError::Encode(e.to_string()))
    }
}

/// Descriptions keyed by path id. Entries are dropped when a committed
/// transaction invalidates the node.
pub struct DescribeCache {
    inner: Mutex<LruCache<PathId, Arc<PathDescription>>>,
}

impl DescribeCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get_or_build(
        &self,
        state: &ShardState,
        path_id: PathId,
    ) -> Result<Arc<PathDescription>, MetaError> {
        if let Some(hit) = self.inner.lock().get(&path_id) {
            return Ok(Arc::clone(hit));
        }
        let built = Arc::new(PathDescription::build(state, path_id)?);
        self.inner.lock().put(path_id, Arc::clone(&built));
        Ok(built)
    }

    pub fn invalidate<'a>(&self, ids: impl IntoIterator<Item = &'a PathId>) {
        let mut inner = self.inner.lock();
        for id in ids {
            inner.pop(id);
        }
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for DescribeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescribeCache")
            .field("len", &self.len())
            .finish()
    }
}
