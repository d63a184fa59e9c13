//! Pipeline graph: an arena of stages addressed by stable ids
//!
//! Stages live in an arena and refer to their parents by [`StageId`]. Rewrite
//! passes never move or copy a stage; they append wrapper stages and rewrite
//! the parent ids stored in children, so an id handed out by the builder keeps
//! naming the same logical stage after any number of rewrites.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::device::ExecutionStream;
use crate::error::{Error, Result};
use crate::item::Item;
use crate::stage::{ItemStream, OpenContext, Role, Stage};

/// Stable identity of a stage within a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(usize);

impl StageId {
    /// Arena index of this stage
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Node<T: Item> {
    stage: Arc<dyn Stage<T>>,
    parents: Vec<StageId>,
    stream: Option<Arc<dyn ExecutionStream>>,
}

impl<T: Item> Clone for Node<T> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage.clone(),
            parents: self.parents.clone(),
            stream: self.stream.clone(),
        }
    }
}

/// Builder collecting stages before the graph is validated
pub struct PipelineBuilder<T: Item> {
    nodes: Vec<Node<T>>,
}

impl<T: Item> PipelineBuilder<T> {
    /// Create an empty builder
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Add a stage pulling from `parents`
    pub fn add<S: Stage<T> + 'static>(&mut self, stage: S, parents: &[StageId]) -> Result<StageId> {
        self.add_shared(Arc::new(stage), parents)
    }

    /// Add an already shared stage pulling from `parents`
    pub fn add_shared(&mut self, stage: Arc<dyn Stage<T>>, parents: &[StageId]) -> Result<StageId> {
        for parent in parents {
            self.check(*parent)?;
        }
        let id = StageId(self.nodes.len());
        self.nodes.push(Node {
            stage,
            parents: parents.to_vec(),
            stream: None,
        });
        Ok(id)
    }

    /// Add `parent` as an extra upstream of `child`
    pub fn connect(&mut self, child: StageId, parent: StageId) -> Result<()> {
        self.check(parent)?;
        self.check(child)?;
        self.nodes[child.0].parents.push(parent);
        Ok(())
    }

    /// Number of stages added so far
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no stage was added
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Validate the graph reachable from `root`
    pub fn build(self, root: StageId) -> Result<Graph<T>> {
        self.check(root)?;
        let graph = Graph {
            nodes: self.nodes,
            root,
            revision: 0,
        };

        let walk = graph.walk();
        if let Some(stage) = walk.cycle {
            return Err(Error::CycleDetected(stage));
        }
        debug!(root = %root, stages = walk.order.len(), "Pipeline graph built");
        Ok(graph)
    }

    fn check(&self, id: StageId) -> Result<()> {
        if id.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(Error::UnknownStage(id))
        }
    }
}

impl<T: Item> Default for PipelineBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Active,
    Done,
}

struct Walk {
    order: Vec<StageId>,
    cycle: Option<StageId>,
}

/// A validated pipeline DAG rooted at a single stage
pub struct Graph<T: Item> {
    nodes: Vec<Node<T>>,
    root: StageId,
    revision: u64,
}

impl<T: Item> Graph<T> {
    /// The root stage (the end marker under a loader)
    pub fn root(&self) -> StageId {
        self.root
    }

    /// Structural revision, bumped by every rewrite
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The stage stored under `id`
    pub fn stage(&self, id: StageId) -> Result<&Arc<dyn Stage<T>>> {
        self.node(id).map(|node| &node.stage)
    }

    /// Direct parents of `id`, in input order
    pub fn parents(&self, id: StageId) -> Result<&[StageId]> {
        self.node(id).map(|node| node.parents.as_slice())
    }

    /// Role of `id`
    pub fn role(&self, id: StageId) -> Result<Role> {
        self.node(id).map(|node| node.stage.role())
    }

    /// Stream attached to `id`, if any
    pub fn stream(&self, id: StageId) -> Result<Option<&Arc<dyn ExecutionStream>>> {
        self.node(id).map(|node| node.stream.as_ref())
    }

    /// Stages reachable from the root, parents before children
    pub fn reachable(&self) -> Vec<StageId> {
        self.walk().order
    }

    /// Number of reachable stages
    pub fn stage_count(&self) -> usize {
        self.reachable().len()
    }

    /// Reachable stages whose role equals `role`
    pub fn find(&self, role: &Role) -> BTreeSet<StageId> {
        self.reachable()
            .into_iter()
            .filter(|id| self.nodes[id.0].stage.role() == *role)
            .collect()
    }

    /// Reachable stages listing `id` among their parents
    pub fn children_of(&self, id: StageId) -> Vec<StageId> {
        self.reachable()
            .into_iter()
            .filter(|child| self.nodes[child.0].parents.contains(&id))
            .collect()
    }

    /// Build a fresh adjacency index for the current revision
    pub fn adjacency(&self) -> Adjacency<T> {
        let entries = self
            .reachable()
            .into_iter()
            .map(|id| {
                let node = &self.nodes[id.0];
                let entry = AdjacencyEntry {
                    stage: node.stage.clone(),
                    parents: node.parents.iter().copied().collect(),
                };
                (id, entry)
            })
            .collect();

        Adjacency {
            revision: self.revision,
            entries,
        }
    }

    /// Attach an alternate execution stream to a stage
    pub fn attach_stream(&mut self, id: StageId, stream: Arc<dyn ExecutionStream>) -> Result<()> {
        self.check(id)?;
        self.nodes[id.0].stream = Some(stream);
        Ok(())
    }

    /// Start a pass over the root's output
    pub fn open(&self, ctx: &OpenContext) -> Result<ItemStream<T>> {
        self.snapshot().open_node(self.root, ctx)
    }

    /// Freeze the current graph so it can be opened from other threads
    pub fn snapshot(&self) -> Arc<GraphSnapshot<T>> {
        Arc::new(GraphSnapshot {
            nodes: self.nodes.clone(),
        })
    }

    /// Call [`Stage::close`] on every reachable stage
    pub fn close_all(&self) {
        for id in self.reachable() {
            self.nodes[id.0].stage.close();
        }
    }

    /// One line per reachable stage: id, role, name and parents
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for id in self.reachable() {
            let node = &self.nodes[id.0];
            let parents: Vec<String> = node.parents.iter().map(ToString::to_string).collect();
            out.push_str(&format!(
                "{id} {} '{}' <- [{}]\n",
                node.stage.role(),
                node.stage.name(),
                parents.join(", ")
            ));
        }
        out
    }

    pub(crate) fn insert(&mut self, stage: Arc<dyn Stage<T>>, parents: Vec<StageId>) -> StageId {
        let id = StageId(self.nodes.len());
        self.nodes.push(Node {
            stage,
            parents,
            stream: None,
        });
        id
    }

    pub(crate) fn redirect(&mut self, child: StageId, from: StageId, to: StageId) {
        for parent in &mut self.nodes[child.0].parents {
            if *parent == from {
                *parent = to;
            }
        }
    }

    pub(crate) fn set_root(&mut self, root: StageId) {
        self.root = root;
    }

    pub(crate) fn bump_revision(&mut self) {
        self.revision += 1;
    }

    fn node(&self, id: StageId) -> Result<&Node<T>> {
        self.nodes.get(id.0).ok_or(Error::UnknownStage(id))
    }

    fn check(&self, id: StageId) -> Result<()> {
        self.node(id).map(|_| ())
    }

    /// Depth-first walk from the root recording post-order and the first
    /// back edge found
    fn walk(&self) -> Walk {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut order = Vec::new();
        let mut cycle = None;
        let mut stack: Vec<(StageId, usize)> = vec![(self.root, 0)];
        marks[self.root.0] = Mark::Active;

        while let Some(frame) = stack.last_mut() {
            let (id, cursor) = *frame;
            let parents = &self.nodes[id.0].parents;
            if cursor < parents.len() {
                frame.1 += 1;
                let parent = parents[cursor];
                match marks[parent.0] {
                    Mark::Unvisited => {
                        marks[parent.0] = Mark::Active;
                        stack.push((parent, 0));
                    }
                    Mark::Active => {
                        cycle.get_or_insert(parent);
                    }
                    Mark::Done => {}
                }
            } else {
                marks[id.0] = Mark::Done;
                order.push(id);
                stack.pop();
            }
        }

        Walk { order, cycle }
    }
}

impl<T: Item> fmt::Debug for Graph<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("root", &self.root)
            .field("revision", &self.revision)
            .field("stages", &self.describe())
            .finish()
    }
}

/// Parent set of one stage in an [`Adjacency`] index
pub struct AdjacencyEntry<T: Item> {
    /// The stage itself
    pub stage: Arc<dyn Stage<T>>,
    /// Ids of its direct parents
    pub parents: BTreeSet<StageId>,
}

/// Snapshot of every reachable stage's direct parents
///
/// The index is tied to the graph revision it was built from; rewrite passes
/// refuse an index whose revision no longer matches the graph.
pub struct Adjacency<T: Item> {
    revision: u64,
    entries: BTreeMap<StageId, AdjacencyEntry<T>>,
}

impl<T: Item> Adjacency<T> {
    /// Graph revision this index describes
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Parents of `id`, `None` if `id` was not reachable
    pub fn parents_of(&self, id: StageId) -> Option<&BTreeSet<StageId>> {
        self.entries.get(&id).map(|entry| &entry.parents)
    }

    /// Stage stored under `id`
    pub fn stage(&self, id: StageId) -> Option<&Arc<dyn Stage<T>>> {
        self.entries.get(&id).map(|entry| &entry.stage)
    }

    /// Number of indexed stages
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in id order
    pub fn iter(&self) -> impl Iterator<Item = (StageId, &AdjacencyEntry<T>)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    /// Fail if `graph` changed since this index was built
    pub fn ensure_current(&self, graph: &Graph<T>) -> Result<()> {
        if self.revision == graph.revision() {
            Ok(())
        } else {
            Err(Error::StaleIndex {
                index: self.revision,
                graph: graph.revision(),
            })
        }
    }
}

/// Frozen copy of a graph shared by every context a pass runs in
pub struct GraphSnapshot<T: Item> {
    nodes: Vec<Node<T>>,
}

impl<T: Item> GraphSnapshot<T> {
    /// Open `id` with the stream attached to it
    pub fn open_node(self: &Arc<Self>, id: StageId, ctx: &OpenContext) -> Result<ItemStream<T>> {
        let node = self.nodes.get(id.0).ok_or(Error::UnknownStage(id))?;
        let upstream = Upstream {
            graph: Arc::clone(self),
            parents: node.parents.clone(),
        };
        let ctx = ctx.clone().with_stream(node.stream.clone());
        trace!(stage = %id, name = node.stage.name(), worker = ?ctx.worker(), "Opening stage");
        node.stage.open(upstream, &ctx)
    }
}

/// The parents of a stage, openable from any thread
///
/// Each call to [`Upstream::open`] starts independent passes over the parent
/// sub-pipelines; a worker context opening its upstream gets its own private
/// iteration state.
pub struct Upstream<T: Item> {
    graph: Arc<GraphSnapshot<T>>,
    parents: Vec<StageId>,
}

impl<T: Item> Clone for Upstream<T> {
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            parents: self.parents.clone(),
        }
    }
}

impl<T: Item> Upstream<T> {
    /// Ids of the parent stages
    pub fn ids(&self) -> &[StageId] {
        &self.parents
    }

    /// Number of parents
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    /// Whether the stage is a source
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Open every parent, in input order
    pub fn open(&self, ctx: &OpenContext) -> Result<Vec<ItemStream<T>>> {
        self.parents
            .iter()
            .map(|id| self.graph.open_node(*id, ctx))
            .collect()
    }

    /// Open the only parent
    pub fn open_single(&self, ctx: &OpenContext) -> Result<ItemStream<T>> {
        match self.parents.as_slice() {
            [parent] => self.graph.open_node(*parent, ctx),
            parents => Err(Error::InvalidGraph(format!(
                "expected exactly one upstream stage, found {}",
                parents.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{Lifecycle, DEFAULT_SHUTDOWN_GRACE};
    use crate::stages::{EndMarker, ItemSampler, MapStage};

    fn ctx() -> OpenContext {
        OpenContext::new(Lifecycle::new(DEFAULT_SHUTDOWN_GRACE))
    }

    fn linear() -> (Graph<u64>, StageId, StageId, StageId) {
        let mut builder = PipelineBuilder::new();
        let sampler = builder.add(ItemSampler::new(0..5u64), &[]).unwrap();
        let fetch = builder
            .add(MapStage::feature_fetcher("fetch", |x: u64, _| Ok(x * 10)), &[sampler])
            .unwrap();
        let end = builder.add(EndMarker::new(), &[fetch]).unwrap();
        (builder.build(end).unwrap(), sampler, fetch, end)
    }

    #[test]
    fn test_build_and_open_linear_pipeline() {
        let (graph, sampler, fetch, end) = linear();
        assert_eq!(graph.root(), end);
        assert_eq!(graph.reachable(), vec![sampler, fetch, end]);

        let items: Vec<u64> = graph.open(&ctx()).unwrap().map(Result::unwrap).collect();
        assert_eq!(items, vec![0, 10, 20, 30, 40]);
    }

    #[test]
    fn test_unreachable_stages_are_ignored() {
        let mut builder = PipelineBuilder::new();
        let sampler = builder.add(ItemSampler::new(vec![1u64]), &[]).unwrap();
        let _orphan = builder.add(ItemSampler::new(vec![2u64]), &[]).unwrap();
        let end = builder.add(EndMarker::new(), &[sampler]).unwrap();
        let graph = builder.build(end).unwrap();

        assert_eq!(graph.stage_count(), 2);
        assert_eq!(graph.adjacency().len(), 2);
    }

    #[test]
    fn test_cycle_is_detected_at_build() {
        let mut builder = PipelineBuilder::new();
        let a = builder
            .add(MapStage::new("a", |x: u64, _| Ok(x)), &[])
            .unwrap();
        let b = builder
            .add(MapStage::new("b", |x: u64, _| Ok(x)), &[a])
            .unwrap();
        builder.connect(a, b).unwrap();
        let end = builder.add(EndMarker::new(), &[b]).unwrap();

        assert!(matches!(builder.build(end), Err(Error::CycleDetected(_))));
    }

    #[test]
    fn test_unknown_parent_is_rejected() {
        let mut builder: PipelineBuilder<u64> = PipelineBuilder::new();
        let err = builder.add(EndMarker::new(), &[StageId(3)]).unwrap_err();
        assert!(matches!(err, Error::UnknownStage(StageId(3))));
    }

    #[test]
    fn test_find_by_role() {
        let (graph, sampler, fetch, end) = linear();
        assert_eq!(graph.find(&Role::ItemSampler), BTreeSet::from([sampler]));
        assert_eq!(graph.find(&Role::FeatureFetcher), BTreeSet::from([fetch]));
        assert_eq!(graph.find(&Role::EndMarker), BTreeSet::from([end]));
        assert!(graph.find(&Role::DeviceCopy).is_empty());
    }

    #[test]
    fn test_adjacency_lists_direct_parents() {
        let mut builder = PipelineBuilder::new();
        let left = builder.add(ItemSampler::new(vec![1u64]), &[]).unwrap();
        let right = builder.add(ItemSampler::new(vec![2u64]), &[]).unwrap();
        let join = builder
            .add(MapStage::new("join", |x: u64, _| Ok(x)), &[left])
            .unwrap();
        builder.connect(join, right).unwrap();
        let end = builder.add(EndMarker::new(), &[join]).unwrap();
        let graph = builder.build(end).unwrap();

        let index = graph.adjacency();
        assert_eq!(index.revision(), 0);
        assert_eq!(index.parents_of(join), Some(&BTreeSet::from([left, right])));
        assert_eq!(index.parents_of(end), Some(&BTreeSet::from([join])));
        assert!(index.parents_of(left).unwrap().is_empty());
        assert_eq!(graph.children_of(left), vec![join]);
    }

    #[test]
    fn test_open_single_rejects_multiple_parents() {
        let mut builder = PipelineBuilder::new();
        let left = builder.add(ItemSampler::new(vec![1u64]), &[]).unwrap();
        let right = builder.add(ItemSampler::new(vec![2u64]), &[]).unwrap();
        let end = builder.add(EndMarker::new(), &[left]).unwrap();
        builder.connect(end, right).unwrap();
        let graph = builder.build(end).unwrap();

        assert!(matches!(graph.open(&ctx()), Err(Error::InvalidGraph(_))));
    }

    #[test]
    fn test_describe_mentions_roles() {
        let (graph, ..) = linear();
        let text = graph.describe();
        assert!(text.contains("item-sampler"));
        assert!(text.contains("feature-fetcher 'fetch' <- [#0]"));
        assert!(text.contains("end-marker"));
    }
}
