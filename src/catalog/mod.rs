pub mod checker;
pub mod node;
pub mod stream;

pub use node::{PathId, PathKind, PathNode, PathState};

use crate::catalog::checker::Checker;
use crate::error::{MetaError, ResourceType, fatal};
use crate::operation::{StepId, TxId};
use im::Vector;
use std::collections::BTreeMap;

pub const MAX_NAME_LEN: usize = 255;

pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".into());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("name is longer than {MAX_NAME_LEN} bytes"));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!("name '{name}' contains forbidden character '{bad}'"));
    }
    if name == "." || name == ".." {
        return Err(format!("name '{name}' is reserved"));
    }
    Ok(())
}

pub fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Arena of namespace nodes addressed by [`PathId`].
///
/// Nodes are never removed: a drop flips the node to [`PathState::Dropped`]
/// and leaves the slot in place, so ids held by in-flight operations stay
/// valid. Backed by a persistent vector, so cloning the tree for a
/// transaction's working copy is cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTree {
    nodes: Vector<PathNode>,
}

impl Default for PathTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PathTree {
    pub fn new() -> Self {
        let mut nodes = Vector::new();
        nodes.push_back(PathNode::new(
            PathId::ROOT,
            String::new(),
            None,
            PathKind::Root,
            PathId::ROOT,
            TxId(0),
        ));
        Self { nodes }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, id: PathId) -> Option<&PathNode> {
        usize::try_from(id.0).ok().and_then(|idx| self.nodes.get(idx))
    }

    /// Node lookup for ids that came out of this tree; a miss means the
    /// caller holds a handle from a different tree.
    pub(crate) fn node(&self, id: PathId) -> &PathNode {
        self.get(id)
            .unwrap_or_else(|| fatal(format!("path id {id} is not in the tree")))
    }

    fn node_mut(&mut self, id: PathId) -> &mut PathNode {
        let idx = usize::try_from(id.0).unwrap_or(usize::MAX);
        match self.nodes.get_mut(idx) {
            Some(node) => node,
            None => fatal(format!("path id {id} is not in the tree")),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathNode> {
        self.nodes.iter()
    }

    pub fn child(&self, parent: PathId, name: &str) -> Option<PathId> {
        self.get(parent)
            .and_then(|node| node.children.get(name))
            .copied()
    }

    pub fn resolve(&self, path: &str) -> Result<PathId, MetaError> {
        let mut current = PathId::ROOT;
        for segment in split_path(path) {
            current = self
                .child(current, &segment)
                .ok_or_else(|| MetaError::NotFound {
                    resource_type: ResourceType::Path,
                    resource_id: path.to_string(),
                })?;
        }
        Ok(current)
    }

    pub fn path_string(&self, id: PathId) -> String {
        let mut names = Vec::new();
        let mut cursor = self.get(id);
        while let Some(node) = cursor {
            if node.kind == PathKind::Root {
                break;
            }
            names.push(node.name.as_str());
            cursor = node.parent.and_then(|parent| self.get(parent));
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    pub fn alive_children(&self, id: PathId) -> impl Iterator<Item = &PathNode> {
        self.get(id)
            .into_iter()
            .flat_map(|node| node.children.values())
            .filter_map(|child| self.get(*child))
            .filter(|child| !child.is_dropped())
    }

    pub(crate) fn insert(
        &mut self,
        parent: PathId,
        name: &str,
        kind: PathKind,
        tx_id: TxId,
    ) -> PathId {
        let id = PathId(self.nodes.len() as u64);
        let parent_node = self.node(parent);
        if parent_node.is_dropped() {
            fatal(format!("insert of '{name}' under dropped path {parent}"));
        }
        if let Some(existing) = parent_node.children.get(name)
            && !self.node(*existing).is_dropped()
        {
            fatal(format!("insert of '{name}' over live path {existing}"));
        }
        let domain = if parent_node.kind == PathKind::Root {
            id
        } else {
            parent_node.domain
        };
        self.nodes.push_back(PathNode::new(
            id,
            name.to_string(),
            Some(parent),
            kind,
            domain,
            tx_id,
        ));
        let parent_node = self.node_mut(parent);
        parent_node.children.insert(name.to_string(), id);
        parent_node.alive_children += 1;
        parent_node.dir_alter_version += 1;
        id
    }

    pub(crate) fn claim(&mut self, id: PathId, tx_id: TxId) -> Result<(), MetaError> {
        let node = self.node_mut(id);
        if node.is_dropped() {
            fatal(format!("claim of dropped path {id} by tx {tx_id}"));
        }
        match node.owning_tx {
            Some(owner) if owner != tx_id => Err(MetaError::AlreadyClaimed { path_id: id, owner }),
            _ => {
                node.owning_tx = Some(tx_id);
                node.last_tx = tx_id;
                Ok(())
            }
        }
    }

    pub(crate) fn release(&mut self, id: PathId) {
        self.node_mut(id).owning_tx = None;
    }

    pub(crate) fn set_last_tx(&mut self, id: PathId, tx_id: TxId) {
        self.node_mut(id).last_tx = tx_id;
    }

    pub(crate) fn set_state(&mut self, id: PathId, state: PathState) {
        let node = self.node_mut(id);
        if node.is_dropped() {
            fatal(format!("state change of dropped path {id} to {state:?}"));
        }
        if state == PathState::Dropped {
            fatal(format!("path {id} must be dropped through mark_dropped"));
        }
        node.state = state;
        node.alter_version += 1;
    }

    pub(crate) fn mark_under_deleting(&mut self, id: PathId, tx_id: TxId) {
        self.set_state(id, PathState::MarkedDeleted);
        self.node_mut(id).drop_tx = Some(tx_id);
    }

    /// Undoes [`Self::mark_under_deleting`] for a drop that never finished.
    pub(crate) fn unmark_under_deleting(&mut self, id: PathId) {
        let node = self.node_mut(id);
        if node.state != PathState::MarkedDeleted {
            fatal(format!("path {id} is not under deleting"));
        }
        node.state = PathState::Created;
        node.drop_tx = None;
        node.alter_version += 1;
    }

    pub(crate) fn mark_dropped(&mut self, id: PathId, tx_id: TxId, step: StepId) {
        let node = self.node_mut(id);
        if node.is_dropped() {
            fatal(format!(
                "path {id} dropped twice: by tx {:?} and tx {tx_id}",
                node.drop_tx
            ));
        }
        node.state = PathState::Dropped;
        node.drop_tx = Some(tx_id);
        node.drop_step = Some(step);
        node.owning_tx = None;
        node.alter_version += 1;
    }

    pub(crate) fn dec_alive_children(&mut self, id: PathId) {
        let node = self.node_mut(id);
        node.alive_children = node
            .alive_children
            .checked_sub(1)
            .unwrap_or_else(|| fatal(format!("alive children underflow at path {id}")));
    }

    pub(crate) fn bump_dir_alter_version(&mut self, id: PathId) -> u64 {
        let node = self.node_mut(id);
        node.dir_alter_version += 1;
        node.dir_alter_version
    }

    pub(crate) fn set_user_attrs(&mut self, id: PathId, attrs: BTreeMap<String, String>) {
        self.node_mut(id).user_attrs = attrs;
    }

    /// Drops every extended attribute and returns how many there were.
    pub(crate) fn clear_user_attrs(&mut self, id: PathId) -> usize {
        let node = self.node_mut(id);
        let removed = node.user_attrs.len();
        node.user_attrs.clear();
        removed
    }

    pub(crate) fn restore_node(&mut self, node: PathNode) -> Result<(), MetaError> {
        let idx = usize::try_from(node.id.0).map_err(|_| MetaError::Corruption {
            message: format!("path id {} out of range", node.id),
        })?;
        if idx < self.nodes.len() {
            self.nodes.set(idx, node);
            Ok(())
        } else if idx == self.nodes.len() {
            self.nodes.push_back(node);
            Ok(())
        } else {
            Err(MetaError::Corruption {
                message: format!(
                    "path record {} skips ids (tree has {} nodes)",
                    node.id,
                    self.nodes.len()
                ),
            })
        }
    }

    pub(crate) fn restore_drop(
        &mut self,
        id: PathId,
        tx_id: TxId,
        step: StepId,
    ) -> Result<(), MetaError> {
        let node = self.restored_mut(id)?;
        if node.is_dropped() {
            return Err(MetaError::Corruption {
                message: format!("drop step replayed twice for path {id}"),
            });
        }
        node.state = PathState::Dropped;
        node.drop_tx = Some(tx_id);
        node.drop_step = Some(step);
        node.owning_tx = None;
        node.last_tx = tx_id;
        node.alter_version += 1;
        Ok(())
    }

    pub(crate) fn restore_dir_alter_version(
        &mut self,
        id: PathId,
        version: u64,
    ) -> Result<(), MetaError> {
        self.restored_mut(id)?.dir_alter_version = version;
        Ok(())
    }

    pub(crate) fn restore_user_attrs(
        &mut self,
        id: PathId,
        attrs: BTreeMap<String, String>,
    ) -> Result<(), MetaError> {
        self.restored_mut(id)?.user_attrs = attrs;
        Ok(())
    }

    fn restored_mut(&mut self, id: PathId) -> Result<&mut PathNode, MetaError> {
        let idx = usize::try_from(id.0).unwrap_or(usize::MAX);
        self.nodes.get_mut(idx).ok_or_else(|| MetaError::Corruption {
            message: format!("journal references unknown path {id}"),
        })
    }

    pub(crate) fn recount_alive_children(&mut self) {
        let counts: Vec<(usize, u64)> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| {
                let alive = node
                    .children
                    .values()
                    .filter_map(|child| self.get(*child))
                    .filter(|child| !child.is_dropped())
                    .count() as u64;
                (idx, alive)
            })
            .collect();
        for (idx, alive) in counts {
            if let Some(node) = self.nodes.get_mut(idx) {
                node.alive_children = alive;
            }
        }
    }
}

/// A path string resolved against the tree as far as it goes.
///
/// `resolved[0]` is always the root; `resolved[i]` is the node for
/// `segments[i - 1]`. Resolution stops at the first missing segment, the
/// remaining segments are kept for diagnostics.
#[derive(Debug, Clone)]
pub struct PathView<'a> {
    tree: &'a PathTree,
    segments: Vec<String>,
    resolved: Vec<PathId>,
}

impl<'a> PathView<'a> {
    pub fn resolve(tree: &'a PathTree, path: &str) -> Self {
        let mut view = Self {
            tree,
            segments: Vec::new(),
            resolved: vec![PathId::ROOT],
        };
        for segment in split_path(path) {
            view = view.dive(&segment);
        }
        view
    }

    pub fn from_id(tree: &'a PathTree, id: PathId) -> Self {
        Self::resolve(tree, &tree.path_string(id))
    }

    /// Appends one segment; an empty name is kept so `not_empty` can flag it.
    pub fn dive(mut self, name: &str) -> Self {
        if self.is_resolved() {
            let last = *self.resolved.last().unwrap_or(&PathId::ROOT);
            if let Some(child) = self.tree.child(last, name) {
                self.resolved.push(child);
            }
        }
        self.segments.push(name.to_string());
        self
    }

    pub fn parent(&self) -> PathView<'a> {
        let mut segments = self.segments.clone();
        segments.pop();
        let mut resolved = self.resolved.clone();
        resolved.truncate(segments.len() + 1);
        PathView {
            tree: self.tree,
            segments,
            resolved,
        }
    }

    pub fn tree(&self) -> &'a PathTree {
        self.tree
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.len() == self.segments.len() + 1
    }

    pub fn base(&self) -> Option<&'a PathNode> {
        if !self.is_resolved() {
            return None;
        }
        self.resolved.last().and_then(|id| self.tree.get(*id))
    }

    pub fn base_id(&self) -> Option<PathId> {
        self.base().map(|node| node.id)
    }

    pub fn nearest_resolved(&self) -> &'a PathNode {
        let id = *self.resolved.last().unwrap_or(&PathId::ROOT);
        self.tree.node(id)
    }

    pub fn domain(&self) -> Option<&'a PathNode> {
        self.base()
            .filter(|node| node.kind != PathKind::Root)
            .and_then(|node| self.tree.get(node.domain))
    }

    pub fn path_string(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    pub fn check(&self) -> Checker<'a> {
        Checker::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::{PathKind, PathState, PathTree, PathView, validate_name};
    use crate::catalog::PathId;
    use crate::error::MetaErrorCode;
    use crate::operation::{StepId, TxId};

    fn sample_tree() -> (PathTree, PathId, PathId, PathId) {
        let mut tree = PathTree::new();
        let domain = tree.insert(PathId::ROOT, "db", PathKind::Domain, TxId(1));
        let dir = tree.insert(domain, "events", PathKind::Directory, TxId(2));
        let stream = tree.insert(dir, "clicks", PathKind::Stream, TxId(3));
        (tree, domain, dir, stream)
    }

    #[test]
    fn resolve_walks_segments_and_reports_missing_paths() {
        let (tree, domain, dir, stream) = sample_tree();
        assert_eq!(tree.resolve("/").expect("root"), PathId::ROOT);
        assert_eq!(tree.resolve("/db").expect("domain"), domain);
        assert_eq!(tree.resolve("db/events").expect("dir"), dir);
        assert_eq!(tree.resolve("/db/events/clicks").expect("stream"), stream);
        let err = tree.resolve("/db/missing").expect_err("missing");
        assert_eq!(err.code(), MetaErrorCode::PathNotFound);
        assert_eq!(tree.path_string(stream), "/db/events/clicks");
    }

    #[test]
    fn insert_inherits_domain_and_bumps_parent_version() {
        let (tree, domain, dir, stream) = sample_tree();
        assert_eq!(tree.node(domain).domain, domain);
        assert_eq!(tree.node(stream).domain, domain);
        assert_eq!(tree.node(dir).alive_children, 1);
        assert_eq!(tree.node(dir).dir_alter_version, 2);
        assert_eq!(tree.child(dir, "clicks"), Some(stream));
    }

    #[test]
    fn claim_is_exclusive_per_node() {
        let (mut tree, _, _, stream) = sample_tree();
        tree.claim(stream, TxId(10)).expect("first claim");
        tree.claim(stream, TxId(10)).expect("same tx may re-claim");
        let err = tree.claim(stream, TxId(11)).expect_err("second tx");
        assert_eq!(err.code(), MetaErrorCode::AlreadyClaimed);
        tree.release(stream);
        tree.claim(stream, TxId(11)).expect("claim after release");
    }

    #[test]
    fn mark_dropped_is_terminal() {
        let (mut tree, _, dir, stream) = sample_tree();
        tree.mark_dropped(stream, TxId(5), StepId(100));
        tree.dec_alive_children(dir);
        let node = tree.node(stream);
        assert_eq!(node.state, PathState::Dropped);
        assert_eq!(node.drop_tx, Some(TxId(5)));
        assert_eq!(tree.alive_children(dir).count(), 0);
        // the dropped child still resolves so retries can see its drop tx
        assert_eq!(tree.resolve("/db/events/clicks").expect("resolve"), stream);
    }

    #[test]
    #[should_panic(expected = "dropped twice")]
    fn dropping_twice_is_fatal() {
        let (mut tree, _, _, stream) = sample_tree();
        tree.mark_dropped(stream, TxId(5), StepId(100));
        tree.mark_dropped(stream, TxId(6), StepId(101));
    }

    #[test]
    #[should_panic(expected = "state change of dropped path")]
    fn dropped_nodes_cannot_be_revived() {
        let (mut tree, _, _, stream) = sample_tree();
        tree.mark_dropped(stream, TxId(5), StepId(100));
        tree.set_state(stream, PathState::Created);
    }

    #[test]
    fn name_reuse_after_drop_gets_a_fresh_id() {
        let (mut tree, _, dir, stream) = sample_tree();
        tree.mark_dropped(stream, TxId(5), StepId(100));
        tree.dec_alive_children(dir);
        let again = tree.insert(dir, "clicks", PathKind::Stream, TxId(6));
        assert_ne!(again, stream);
        assert_eq!(tree.resolve("/db/events/clicks").expect("resolve"), again);
        assert!(tree.node(stream).is_dropped());
    }

    #[test]
    fn recount_rebuilds_alive_children() {
        let (mut tree, domain, dir, stream) = sample_tree();
        tree.mark_dropped(stream, TxId(5), StepId(100));
        tree.recount_alive_children();
        assert_eq!(tree.node(dir).alive_children, 0);
        assert_eq!(tree.node(domain).alive_children, 1);
        assert_eq!(tree.node(PathId::ROOT).alive_children, 1);
    }

    #[test]
    fn view_tracks_partial_resolution() {
        let (tree, _, dir, _) = sample_tree();
        let view = PathView::resolve(&tree, "/db/events").dive("nope");
        assert!(!view.is_resolved());
        assert_eq!(view.nearest_resolved().id, dir);
        assert_eq!(view.path_string(), "/db/events/nope");
        let parent = view.parent();
        assert!(parent.is_resolved());
        assert_eq!(parent.base_id(), Some(dir));
    }

    #[test]
    fn names_are_validated() {
        assert!(validate_name("orders-2024_v1.bak").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name(&"x".repeat(300)).is_err());
    }
}
