//! The asset graph.
//!
//! A directed graph rooted in a single synthetic node. Entry specifiers hang
//! off the root, each resolving to an entry file and then to an asset.
//! Assets point at the dependencies they declare, and every dependency
//! points at the asset it resolved to:
//!
//! ```text
//! @@root ─► entry_specifier ─► entry_file ─► asset ─► dependency ─► asset ...
//! ```
//!
//! Every node has a string identity key ([`NodeKey`]). Adding a node whose
//! key already exists only adds the missing edge, which is what makes cycles
//! between files harmless: the second visit of a file finds its asset
//! already present and stops there.
//!
//! The graph does not run anything. It only remembers which nodes still need
//! work, which the builder drains through [`AssetGraph::ready_nodes`].

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use serde::Serialize;

use crate::core::Hash32;
use crate::plugin::{DependencyRequest, TransformOutput};

/// Identity key of a node, unique within a graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeKey(String);

impl NodeKey {
    pub fn root() -> Self {
        Self("@@root".into())
    }

    pub fn entry_specifier(specifier: &str) -> Self {
        Self(format!("entry_specifier:{specifier}"))
    }

    pub fn entry_file(path: &Utf8Path) -> Self {
        Self(format!("entry_file:{path}"))
    }

    pub fn dependency(id: Hash32) -> Self {
        Self(format!("dependency:{id}"))
    }

    pub fn asset(id: Hash32) -> Self {
        Self(format!("asset:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Progress of anything that has to be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DependencyStatus {
    Incomplete,
    Resolving,
    Resolved,
    Excluded,
}

/// Progress of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AssetStatus {
    /// The file is known but has not been transformed yet.
    Pending,
    Transforming,
    Transformed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyNode {
    pub id: Hash32,
    pub specifier: String,
    pub resolve_from: Utf8PathBuf,
    pub is_entry: bool,
    pub is_optional: bool,
    pub status: DependencyStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetNode {
    pub id: Hash32,
    pub file_path: Utf8PathBuf,
    pub content_hash: Option<Hash32>,
    pub asset_type: Option<String>,
    pub dependencies: Vec<DependencyRequest>,
    pub status: AssetStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Root,
    EntrySpecifier {
        specifier: String,
        status: DependencyStatus,
    },
    EntryFile {
        file_path: Utf8PathBuf,
    },
    Dependency(DependencyNode),
    Asset(AssetNode),
}

impl Node {
    pub fn key(&self) -> NodeKey {
        match self {
            Node::Root => NodeKey::root(),
            Node::EntrySpecifier { specifier, .. } => NodeKey::entry_specifier(specifier),
            Node::EntryFile { file_path } => NodeKey::entry_file(file_path),
            Node::Dependency(dep) => NodeKey::dependency(dep.id),
            Node::Asset(asset) => NodeKey::asset(asset.id),
        }
    }

    /// Waiting to be dispatched.
    fn is_ready(&self) -> bool {
        matches!(
            self,
            Node::EntrySpecifier {
                status: DependencyStatus::Incomplete,
                ..
            } | Node::Dependency(DependencyNode {
                status: DependencyStatus::Incomplete,
                ..
            }) | Node::Asset(AssetNode {
                status: AssetStatus::Pending,
                ..
            })
        )
    }

    /// Dispatched or waiting to be.
    fn is_unfinished(&self) -> bool {
        match self {
            Node::EntrySpecifier { status, .. } | Node::Dependency(DependencyNode { status, .. }) => {
                matches!(status, DependencyStatus::Incomplete | DependencyStatus::Resolving)
            }
            Node::Asset(asset) => asset.status != AssetStatus::Transformed,
            Node::Root | Node::EntryFile { .. } => false,
        }
    }
}

/// Sorted view of a graph, independent of insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<(NodeKey, Node)>,
    pub edges: Vec<(NodeKey, NodeKey)>,
}

#[derive(Debug, Clone)]
pub struct AssetGraph {
    graph: StableDiGraph<Node, ()>,
    keys: HashMap<NodeKey, NodeIndex>,
    root: NodeIndex,
    /// Nodes that are not finished yet.
    unfinished: BTreeSet<NodeIndex>,
    version: u64,
}

impl Default for AssetGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetGraph {
    pub fn new() -> Self {
        let mut graph = StableDiGraph::new();
        let root = graph.add_node(Node::Root);

        Self {
            graph,
            keys: HashMap::from([(NodeKey::root(), root)]),
            root,
            unfinished: BTreeSet::new(),
            version: 0,
        }
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    /// Bumped on every mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 1
    }

    pub fn has_node(&self, key: &NodeKey) -> bool {
        self.keys.contains_key(key)
    }

    pub fn index_of(&self, key: &NodeKey) -> Option<NodeIndex> {
        self.keys.get(key).copied()
    }

    pub fn node(&self, key: &NodeKey) -> Option<&Node> {
        self.get(self.index_of(key)?)
    }

    pub fn get(&self, index: NodeIndex) -> Option<&Node> {
        self.graph.node_weight(index)
    }

    /// Adds a node, or finds the existing node with the same key. Either way
    /// an edge `from -> node` is ensured when `from` is given.
    fn upsert(&mut self, from: Option<NodeIndex>, node: Node) -> NodeIndex {
        let key = node.key();
        let index = match self.keys.get(&key) {
            Some(&index) => index,
            None => {
                let unfinished = node.is_unfinished();
                let index = self.graph.add_node(node);
                self.keys.insert(key, index);
                if unfinished {
                    self.unfinished.insert(index);
                }
                index
            }
        };

        match from {
            Some(from) => self.link(from, index),
            None => self.version += 1,
        }
        index
    }

    fn link(&mut self, from: NodeIndex, to: NodeIndex) {
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
        self.version += 1;
    }

    fn sync_status(&mut self, index: NodeIndex) {
        let unfinished = self
            .graph
            .node_weight(index)
            .is_some_and(Node::is_unfinished);

        if unfinished {
            self.unfinished.insert(index);
        } else {
            self.unfinished.remove(&index);
        }
        self.version += 1;
    }

    fn clear_outgoing(&mut self, index: NodeIndex) {
        let edges: Vec<_> = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .map(|edge| edge.id())
            .collect();

        for edge in edges {
            self.graph.remove_edge(edge);
        }
    }

    /// Adds an entry specifier under the root. Adding the same specifier
    /// twice is a no-op.
    pub fn add_entry_specifier(&mut self, specifier: &str) -> NodeIndex {
        self.upsert(
            Some(self.root),
            Node::EntrySpecifier {
                specifier: specifier.to_string(),
                status: DependencyStatus::Incomplete,
            },
        )
    }

    /// Records that the entry at `entry` resolved to `file_path`, and returns
    /// the asset node built from that file.
    pub fn resolve_entry(
        &mut self,
        entry: NodeIndex,
        file_path: &Utf8Path,
        asset_id: Hash32,
    ) -> Option<NodeIndex> {
        let Some(Node::EntrySpecifier { status, .. }) = self.graph.node_weight_mut(entry) else {
            return None;
        };
        *status = DependencyStatus::Resolved;
        self.sync_status(entry);
        self.clear_outgoing(entry);

        let file = self.upsert(
            Some(entry),
            Node::EntryFile {
                file_path: file_path.to_owned(),
            },
        );
        Some(self.upsert(Some(file), pending_asset(asset_id, file_path)))
    }

    /// Adds a dependency declared by the asset at `from_asset`. The same
    /// specifier declared twice by one asset is one node; it stays optional
    /// only if every declaration is.
    pub fn add_dependency(
        &mut self,
        from_asset: NodeIndex,
        request: &DependencyRequest,
    ) -> Option<NodeIndex> {
        let Some(Node::Asset(asset)) = self.graph.node_weight(from_asset) else {
            return None;
        };

        let resolve_from = asset.file_path.clone();
        let id = Hash32::of(&(asset.id, &request.specifier));

        if let Some(&index) = self.keys.get(&NodeKey::dependency(id)) {
            if let Some(Node::Dependency(dep)) = self.graph.node_weight_mut(index) {
                dep.is_optional &= request.is_optional;
            }
            self.link(from_asset, index);
            return Some(index);
        }

        Some(self.upsert(
            Some(from_asset),
            Node::Dependency(DependencyNode {
                id,
                specifier: request.specifier.clone(),
                resolve_from,
                is_entry: false,
                is_optional: request.is_optional,
                status: DependencyStatus::Incomplete,
            }),
        ))
    }

    /// Points the dependency at `dep` to the asset built from `file_path`,
    /// replacing any previous target.
    pub fn resolve_dependency(
        &mut self,
        dep: NodeIndex,
        file_path: &Utf8Path,
        asset_id: Hash32,
    ) -> Option<NodeIndex> {
        let Some(Node::Dependency(node)) = self.graph.node_weight_mut(dep) else {
            return None;
        };
        node.status = DependencyStatus::Resolved;
        self.sync_status(dep);
        self.clear_outgoing(dep);

        Some(self.upsert(Some(dep), pending_asset(asset_id, file_path)))
    }

    /// Marks a dependency or entry specifier as deliberately left out, and
    /// detaches whatever it pointed at.
    pub fn mark_excluded(&mut self, index: NodeIndex) {
        match self.graph.node_weight_mut(index) {
            Some(Node::Dependency(DependencyNode { status, .. }))
            | Some(Node::EntrySpecifier { status, .. }) => *status = DependencyStatus::Excluded,
            _ => return,
        }
        self.clear_outgoing(index);
        self.sync_status(index);
    }

    /// Moves a ready node into its in-flight state.
    pub fn mark_dispatched(&mut self, index: NodeIndex) {
        match self.graph.node_weight_mut(index) {
            Some(Node::Dependency(DependencyNode { status, .. }))
            | Some(Node::EntrySpecifier { status, .. })
                if *status == DependencyStatus::Incomplete =>
            {
                *status = DependencyStatus::Resolving
            }
            Some(Node::Asset(asset)) if asset.status == AssetStatus::Pending => {
                asset.status = AssetStatus::Transforming
            }
            _ => return,
        }
        self.version += 1;
    }

    /// Stores the result of transforming the asset at `asset`.
    ///
    /// The asset's dependency set is replaced: new dependencies are added,
    /// dependencies it no longer declares are detached, and anything left
    /// unreachable from the root is removed.
    pub fn set_asset_transformed(&mut self, asset: NodeIndex, output: &TransformOutput) {
        let Some(Node::Asset(node)) = self.graph.node_weight_mut(asset) else {
            return;
        };
        node.content_hash = Some(output.content_hash);
        node.asset_type = Some(output.asset_type.clone());
        node.dependencies = output.dependencies.clone();
        node.status = AssetStatus::Transformed;
        self.sync_status(asset);

        let mut kept = HashSet::new();
        for request in &output.dependencies {
            let Some(dep) = self.add_dependency(asset, request) else {
                continue;
            };
            // Optionality comes from this output alone, not earlier ones.
            if kept.insert(dep) {
                if let Some(Node::Dependency(node)) = self.graph.node_weight_mut(dep) {
                    node.is_optional = request.is_optional;
                }
            }
        }

        let stale: Vec<_> = self
            .graph
            .edges_directed(asset, Direction::Outgoing)
            .filter(|edge| !kept.contains(&edge.target()))
            .map(|edge| edge.id())
            .collect();

        if !stale.is_empty() {
            for edge in stale {
                self.graph.remove_edge(edge);
            }
            self.prune_unreachable();
        }
    }

    /// Removes every node that cannot be reached from the root. Returns how
    /// many were removed.
    pub fn prune_unreachable(&mut self) -> usize {
        let reachable: HashSet<_> = self.bfs(self.root).into_iter().collect();
        let orphans: Vec<_> = self
            .graph
            .node_indices()
            .filter(|index| !reachable.contains(index))
            .collect();

        for &index in &orphans {
            if let Some(node) = self.graph.remove_node(index) {
                self.keys.remove(&node.key());
            }
            self.unfinished.remove(&index);
        }

        if !orphans.is_empty() {
            tracing::debug!("pruned {} unreachable node(s)", orphans.len());
            self.version += 1;
        }
        orphans.len()
    }

    /// Re-opens the parts of the graph built from any of `paths`.
    ///
    /// Assets built from those files go back to `Pending`, and whatever
    /// resolved to them is resolved again, since a changed file can change
    /// how its importers resolve. Returns the number of nodes re-opened.
    pub fn invalidate<P: AsRef<Utf8Path>>(&mut self, paths: &[P]) -> usize {
        let paths: HashSet<&Utf8Path> = paths.iter().map(|path| path.as_ref()).collect();
        let mut reopened = BTreeSet::new();

        for asset in self.asset_indices() {
            let Some(Node::Asset(node)) = self.graph.node_weight(asset) else {
                continue;
            };
            if !paths.contains(node.file_path.as_path()) {
                continue;
            }
            reopened.insert(asset);

            for parent in self.graph.neighbors_directed(asset, Direction::Incoming) {
                match &self.graph[parent] {
                    Node::Dependency(_) => {
                        reopened.insert(parent);
                    }
                    Node::EntryFile { .. } => {
                        reopened.extend(self.graph.neighbors_directed(parent, Direction::Incoming));
                    }
                    _ => {}
                }
            }
        }

        for &index in &reopened {
            match self.graph.node_weight_mut(index) {
                Some(Node::Asset(asset)) => asset.status = AssetStatus::Pending,
                Some(Node::Dependency(DependencyNode { status, .. }))
                | Some(Node::EntrySpecifier { status, .. }) => *status = DependencyStatus::Incomplete,
                _ => continue,
            }
            self.sync_status(index);
        }

        reopened.len()
    }

    /// Every node still waiting for or undergoing work, in index order.
    pub fn incomplete_nodes(&self) -> Vec<NodeIndex> {
        self.unfinished.iter().copied().collect()
    }

    /// Incomplete nodes that have not been dispatched yet.
    pub fn ready_nodes(&self) -> Vec<NodeIndex> {
        self.unfinished
            .iter()
            .copied()
            .filter(|&index| self.graph[index].is_ready())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.unfinished.is_empty()
    }

    fn bfs(&self, start: NodeIndex) -> Vec<NodeIndex> {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        let mut order = Vec::new();

        while let Some(index) = queue.pop_front() {
            order.push(index);

            // petgraph yields the newest edge first
            let mut children: Vec<_> = self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .collect();
            children.reverse();

            for child in children {
                if seen.insert(child) {
                    queue.push_back(child);
                }
            }
        }

        order
    }

    /// Breadth-first walk from the root, children in the order they were
    /// attached. Every node is visited once, cycles included.
    pub fn traverse(&self) -> impl Iterator<Item = (NodeIndex, &Node)> {
        self.bfs(self.root)
            .into_iter()
            .map(|index| (index, &self.graph[index]))
    }

    /// Assets reachable from the given entry specifier.
    pub fn reachable_assets(&self, entry: &str) -> Vec<&AssetNode> {
        let Some(start) = self.index_of(&NodeKey::entry_specifier(entry)) else {
            return Vec::new();
        };

        self.bfs(start)
            .into_iter()
            .filter_map(|index| match &self.graph[index] {
                Node::Asset(asset) => Some(asset),
                _ => None,
            })
            .collect()
    }

    fn asset_indices(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&index| matches!(self.graph[index], Node::Asset(_)))
            .collect()
    }

    fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_indices().map(|index| &self.graph[index])
    }

    pub fn assets(&self) -> impl Iterator<Item = &AssetNode> {
        self.nodes().filter_map(|node| match node {
            Node::Asset(asset) => Some(asset),
            _ => None,
        })
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &DependencyNode> {
        self.nodes().filter_map(|node| match node {
            Node::Dependency(dep) => Some(dep),
            _ => None,
        })
    }

    /// Dependencies pointing at the given asset.
    pub fn incoming_dependencies(&self, asset: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(asset, Direction::Incoming)
            .filter(|&index| matches!(self.graph[index], Node::Dependency(_)))
            .collect()
    }

    /// Whether an entry file leads to the given asset.
    pub fn is_entry_asset(&self, asset: NodeIndex) -> bool {
        self.graph
            .neighbors_directed(asset, Direction::Incoming)
            .any(|index| matches!(self.graph[index], Node::EntryFile { .. }))
    }

    /// All edges as `(from, to)` identity keys.
    pub fn edges(&self) -> Vec<(NodeKey, NodeKey)> {
        self.graph
            .edge_indices()
            .filter_map(|edge| self.graph.edge_endpoints(edge))
            .map(|(from, to)| (self.graph[from].key(), self.graph[to].key()))
            .collect()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let mut nodes: Vec<_> = self
            .nodes()
            .map(|node| (node.key(), node.clone()))
            .collect();
        nodes.sort_by(|a, b| a.0.cmp(&b.0));

        let mut edges = self.edges();
        edges.sort();

        GraphSnapshot { nodes, edges }
    }
}

fn pending_asset(id: Hash32, file_path: &Utf8Path) -> Node {
    Node::Asset(AssetNode {
        id,
        file_path: file_path.to_owned(),
        content_hash: None,
        asset_type: None,
        dependencies: Vec::new(),
        status: AssetStatus::Pending,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BuildOptions;

    fn id(path: &str) -> Hash32 {
        BuildOptions::default().asset_id(Utf8Path::new(path))
    }

    fn output(deps: &[&str]) -> TransformOutput {
        deps.iter()
            .fold(TransformOutput::new(Hash32::hash("x"), "js"), |out, dep| {
                out.with_dependency(DependencyRequest::new(*dep))
            })
    }

    /// index.js -> a.js
    fn small() -> (AssetGraph, NodeIndex, NodeIndex) {
        let mut graph = AssetGraph::new();
        let entry = graph.add_entry_specifier("./index.js");
        let index = graph
            .resolve_entry(entry, Utf8Path::new("index.js"), id("index.js"))
            .unwrap();
        graph.set_asset_transformed(index, &output(&["./a"]));
        let dep = graph.ready_nodes()[0];
        let a = graph.resolve_dependency(dep, Utf8Path::new("a.js"), id("a.js")).unwrap();
        graph.set_asset_transformed(a, &output(&[]));
        (graph, index, a)
    }

    #[test]
    fn test_entry_specifier_is_idempotent() {
        let mut graph = AssetGraph::new();
        let a = graph.add_entry_specifier("./module-b");
        let b = graph.add_entry_specifier("./module-b");

        assert_eq!(a, b);
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.edges().len(), 1);
        assert!(graph.has_node(&NodeKey::entry_specifier("./module-b")));
        assert_eq!(
            graph.node(&NodeKey::entry_specifier("./module-b")),
            Some(&Node::EntrySpecifier {
                specifier: "./module-b".into(),
                status: DependencyStatus::Incomplete,
            })
        );
    }

    #[test]
    fn test_keys() {
        assert_eq!(NodeKey::root().as_str(), "@@root");
        assert_eq!(
            NodeKey::entry_specifier("./module-b").as_str(),
            "entry_specifier:./module-b"
        );
        assert_eq!(
            NodeKey::entry_file(Utf8Path::new("src/a.js")).as_str(),
            "entry_file:src/a.js"
        );
    }

    #[test]
    fn test_lifecycle() {
        let mut graph = AssetGraph::new();
        let entry = graph.add_entry_specifier("./index.js");
        assert_eq!(graph.ready_nodes(), vec![entry]);

        graph.mark_dispatched(entry);
        assert!(graph.ready_nodes().is_empty());
        assert_eq!(graph.incomplete_nodes(), vec![entry]);

        let asset = graph
            .resolve_entry(entry, Utf8Path::new("index.js"), id("index.js"))
            .unwrap();
        assert_eq!(graph.ready_nodes(), vec![asset]);
        assert!(!graph.is_complete());

        graph.set_asset_transformed(asset, &output(&["./a", "./b"]));
        assert_eq!(graph.ready_nodes().len(), 2);
        assert_eq!(graph.dependencies().count(), 2);

        for dep in graph.ready_nodes() {
            graph.mark_excluded(dep);
        }
        assert!(graph.is_complete());
    }

    #[test]
    fn test_cycles_are_not_traversed_twice() {
        let (mut graph, index, a) = small();

        // a.js -> ./index
        graph.set_asset_transformed(a, &output(&["./index"]));
        let dep = graph.ready_nodes()[0];
        let target = graph
            .resolve_dependency(dep, Utf8Path::new("index.js"), id("index.js"))
            .unwrap();

        assert_eq!(target, index);
        assert!(graph.is_complete());

        let visited: Vec<_> = graph.traverse().map(|(index, _)| index).collect();
        let unique: HashSet<_> = visited.iter().collect();
        assert_eq!(visited.len(), unique.len());
        assert_eq!(visited.len(), graph.len());
        assert_eq!(graph.reachable_assets("./index.js").len(), 2);
    }

    #[test]
    fn test_dropped_dependency_is_pruned() {
        let (mut graph, index, _) = small();
        let before = graph.len();

        graph.set_asset_transformed(index, &output(&[]));

        assert_eq!(graph.len(), before - 2);
        assert_eq!(graph.assets().count(), 1);
        assert_eq!(graph.dependencies().count(), 0);
    }

    #[test]
    fn test_optional_merges() {
        let mut graph = AssetGraph::new();
        let entry = graph.add_entry_specifier("./index.js");
        let asset = graph
            .resolve_entry(entry, Utf8Path::new("index.js"), id("index.js"))
            .unwrap();

        let first = graph
            .add_dependency(asset, &DependencyRequest::optional("./a"))
            .unwrap();
        let second = graph
            .add_dependency(asset, &DependencyRequest::new("./a"))
            .unwrap();

        assert_eq!(first, second);
        let Some(Node::Dependency(dep)) = graph.get(first) else {
            panic!("expected a dependency");
        };
        assert!(!dep.is_optional);
        assert_eq!(dep.resolve_from, "index.js");
    }

    #[test]
    fn test_optional_follows_latest_output() {
        let mut graph = AssetGraph::new();
        let entry = graph.add_entry_specifier("./index.js");
        let asset = graph
            .resolve_entry(entry, Utf8Path::new("index.js"), id("index.js"))
            .unwrap();

        graph.set_asset_transformed(asset, &output(&["./a"]));
        graph.invalidate(&[Utf8Path::new("index.js")]);

        let relaxed = TransformOutput::new(Hash32::hash("y"), "js")
            .with_dependency(DependencyRequest::optional("./a"));
        graph.set_asset_transformed(asset, &relaxed);

        let deps: Vec<_> = graph.dependencies().collect();
        assert_eq!(deps.len(), 1);
        assert!(deps[0].is_optional);

        let mixed = TransformOutput::new(Hash32::hash("z"), "js")
            .with_dependency(DependencyRequest::optional("./a"))
            .with_dependency(DependencyRequest::new("./a"));
        graph.set_asset_transformed(asset, &mixed);
        assert!(!graph.dependencies().next().unwrap().is_optional);
    }

    #[test]
    fn test_invalidate() {
        let (mut graph, _, a) = small();
        let version = graph.version();

        let reopened = graph.invalidate(&[Utf8Path::new("a.js")]);
        assert_eq!(reopened, 2);
        assert!(graph.version() > version);
        assert_eq!(graph.ready_nodes().len(), 2);
        assert!(matches!(
            graph.get(a),
            Some(Node::Asset(AssetNode {
                status: AssetStatus::Pending,
                ..
            }))
        ));

        assert_eq!(graph.invalidate(&[Utf8Path::new("missing.js")]), 0);
    }

    #[test]
    fn test_invalidate_entry_file() {
        let (mut graph, _, _) = small();
        graph.invalidate(&["index.js"]);

        let entry = graph.index_of(&NodeKey::entry_specifier("./index.js")).unwrap();
        assert!(graph.ready_nodes().contains(&entry));
    }

    #[test]
    fn test_snapshot_ignores_insertion_order() {
        let mut one = AssetGraph::new();
        one.add_entry_specifier("./a");
        one.add_entry_specifier("./b");

        let mut two = AssetGraph::new();
        two.add_entry_specifier("./b");
        two.add_entry_specifier("./a");

        assert_eq!(one.snapshot(), two.snapshot());
        assert_ne!(
            one.traverse().map(|(_, n)| n.key()).collect::<Vec<_>>(),
            two.traverse().map(|(_, n)| n.key()).collect::<Vec<_>>()
        );
    }
}
