//! Lock-free growth of disjoint sampling trees over the pairwise graph.
//!
//! Every vertex carries a [`Membership`] record: its [`TreeState`], parent and
//! height packed into a single `AtomicU64`, plus an atomic counter of children
//! that have not settled yet. All transitions are compare-and-set operations
//! on that word, so the three fields always change together and no other
//! worker can observe a half populated record.
//!
//! ## Lifecycle of a vertex
//! ```text
//!  AVAILABLE --claim--> CANDIDATE --admit--> BOUNDARY --expand--> TREE_NODE
//!      ^                    |                                        |
//!      +------reject--------+                        pending == 0 --> CALIBRATED
//!      ^                                                             |
//!      +--------------------------- release ------------------------+
//! ```
//! A claim is a single CAS from AVAILABLE; losing it simply means the vertex
//! belongs to another tree (or is about to) and it is never retried in the
//! same pass. The worker that wins the CAS out of CANDIDATE admits the vertex
//! and scans all of its neighbors in one go. A parent bumps its own
//! `pending_children` before every child claim, and a child decrements its
//! parent's counter after reaching CALIBRATED (or after being rejected); the
//! worker that brings a counter to zero settles the parent in turn, so the
//! root is calibrated exactly once and only after the whole tree has.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

// block membership is kept as a bitset of vertex identities
use roaring::RoaringBitmap;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::error::{BlockGibbsError, Result};
use crate::graph::{Graph, VertexId};

// ------------- TreeState -------------
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeState {
    /// Owns no commitments and may be claimed by any tree.
    Available = 0,
    /// Claimed, but not yet admitted into the tree.
    Candidate = 1,
    /// Admitted; its own neighbors are being explored.
    Boundary = 2,
    /// Explored; waits for its children to settle.
    TreeNode = 3,
    /// Combined its children and reported to its parent.
    Calibrated = 4,
}

impl TreeState {
    pub fn tag(self) -> u32 {
        self as u32
    }
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(TreeState::Available),
            1 => Some(TreeState::Candidate),
            2 => Some(TreeState::Boundary),
            3 => Some(TreeState::TreeNode),
            4 => Some(TreeState::Calibrated),
            _ => None,
        }
    }
    pub fn is_owned(self) -> bool {
        self != TreeState::Available
    }
}
impl fmt::Display for TreeState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TreeState::Available => "AVAILABLE",
            TreeState::Candidate => "CANDIDATE",
            TreeState::Boundary => "BOUNDARY",
            TreeState::TreeNode => "TREE_NODE",
            TreeState::Calibrated => "CALIBRATED",
        };
        f.write_str(name)
    }
}

// ------------- Membership -------------
const NO_PARENT: u64 = u32::MAX as u64;
const HEIGHT_BITS: u32 = 24;

/// Largest height a tree vertex can record.
pub const MAX_TREE_HEIGHT: u32 = (1 << HEIGHT_BITS) - 1;

/// A consistent snapshot of a membership record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipView {
    pub state: TreeState,
    pub parent: Option<VertexId>,
    pub height: u32,
}

impl MembershipView {
    pub const AVAILABLE: MembershipView = MembershipView {
        state: TreeState::Available,
        parent: None,
        height: 0,
    };

    // layout: bits 0..8 state, 8..32 height, 32..64 parent (all ones = none)
    fn pack(self) -> u64 {
        let parent = self.parent.map_or(NO_PARENT, u64::from);
        (parent << 32) | (u64::from(self.height & MAX_TREE_HEIGHT) << 8) | self.state as u64
    }
    fn unpack(word: u64) -> Self {
        let parent = word >> 32;
        let state = TreeState::from_tag((word & 0xff) as u32);
        debug_assert!(state.is_some(), "corrupt membership word {word:#x}");
        Self {
            state: state.unwrap_or(TreeState::Available),
            parent: (parent != NO_PARENT).then_some(parent as VertexId),
            height: ((word >> 8) as u32) & MAX_TREE_HEIGHT,
        }
    }
}

#[derive(Debug)]
pub struct Membership {
    word: AtomicU64,
    pending_children: AtomicUsize,
}

impl Default for Membership {
    fn default() -> Self {
        Self::new()
    }
}

impl Membership {
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(MembershipView::AVAILABLE.pack()),
            pending_children: AtomicUsize::new(0),
        }
    }
    pub(crate) fn restored(view: MembershipView, pending_children: usize) -> Self {
        Self {
            word: AtomicU64::new(view.pack()),
            pending_children: AtomicUsize::new(pending_children),
        }
    }
    pub fn load(&self) -> MembershipView {
        MembershipView::unpack(self.word.load(Ordering::SeqCst))
    }
    pub fn state(&self) -> TreeState {
        self.load().state
    }
    pub fn parent(&self) -> Option<VertexId> {
        self.load().parent
    }
    pub fn height(&self) -> u32 {
        self.load().height
    }
    pub fn pending_children(&self) -> usize {
        self.pending_children.load(Ordering::SeqCst)
    }
    /// AVAILABLE -> CANDIDATE with parent and height filled in by the same CAS.
    pub(crate) fn claim(&self, parent: Option<VertexId>, height: u32) -> bool {
        let candidate = MembershipView {
            state: TreeState::Candidate,
            parent,
            height,
        };
        self.word
            .compare_exchange(
                MembershipView::AVAILABLE.pack(),
                candidate.pack(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
    /// Moves `from` -> `to` keeping parent and height. Returns the record as
    /// it was before the transition, or `None` if the vertex was not in
    /// `from` (someone else got there first).
    pub(crate) fn transition(&self, from: TreeState, to: TreeState) -> Option<MembershipView> {
        let mut current = self.word.load(Ordering::SeqCst);
        loop {
            let view = MembershipView::unpack(current);
            if view.state != from {
                return None;
            }
            let next = MembershipView { state: to, ..view };
            match self.word.compare_exchange(
                current,
                next.pack(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(view),
                Err(actual) => current = actual,
            }
        }
    }
    /// CANDIDATE -> AVAILABLE, clearing parent and height.
    pub(crate) fn reject(&self) -> Option<MembershipView> {
        let mut current = self.word.load(Ordering::SeqCst);
        loop {
            let view = MembershipView::unpack(current);
            if view.state != TreeState::Candidate {
                return None;
            }
            match self.word.compare_exchange(
                current,
                MembershipView::AVAILABLE.pack(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(view),
                Err(actual) => current = actual,
            }
        }
    }
    pub(crate) fn add_child(&self) {
        self.pending_children.fetch_add(1, Ordering::SeqCst);
    }
    /// Returns the count before the decrement.
    pub(crate) fn remove_child(&self) -> usize {
        let previous = self.pending_children.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "pending_children underflow");
        previous
    }
    pub(crate) fn reset(&self) {
        self.pending_children.store(0, Ordering::SeqCst);
        self.word
            .store(MembershipView::AVAILABLE.pack(), Ordering::SeqCst);
    }
}

// ------------- Policies and hooks -------------
/// Decides whether a claimed candidate is admitted into its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Every claimed candidate joins the tree.
    #[default]
    Greedy,
    /// A candidate with an owned neighbor other than its parent is sent back
    /// to AVAILABLE, which keeps the subgraph induced by a block a tree.
    Acyclic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GrowthPolicy {
    pub admission: AdmissionPolicy,
    /// Vertices at this height are not expanded any further.
    pub max_height: Option<u32>,
}

/// Invoked exactly once for every vertex when it becomes CALIBRATED, after
/// all of its children have been. This is where messages are combined.
pub trait Calibrator: Sync {
    fn calibrate(&self, _graph: &Graph, _vertex: VertexId) {}
}

/// Calibration that does nothing beyond the state transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passive;
impl Calibrator for Passive {}

/// Work produced by a protocol step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    /// Freshly claimed candidates that need an [`TreeProtocol::update`].
    pub schedule: Vec<VertexId>,
    /// Root of a tree that became fully calibrated during this step.
    pub completed: Option<VertexId>,
}

// ------------- Block -------------
/// The vertices of one tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    root: VertexId,
    members: RoaringBitmap,
    depth: u32,
}

impl Block {
    pub fn root(&self) -> VertexId {
        self.root
    }
    pub fn members(&self) -> &RoaringBitmap {
        &self.members
    }
    pub fn contains(&self, vertex: VertexId) -> bool {
        self.members.contains(vertex)
    }
    pub fn len(&self) -> u64 {
        self.members.len()
    }
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
    /// Largest height of any member.
    pub fn depth(&self) -> u32 {
        self.depth
    }
    pub fn iter(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.members.iter()
    }
}

// ------------- TreeProtocol -------------
/// The per-vertex operations a scheduler invokes to grow, calibrate and
/// release trees. Safe to call concurrently from any number of workers.
pub struct TreeProtocol<'g> {
    graph: &'g Graph,
    calibrator: &'g dyn Calibrator,
    policy: GrowthPolicy,
}

impl<'g> TreeProtocol<'g> {
    pub fn new(graph: &'g Graph, policy: GrowthPolicy) -> Self {
        Self::with_calibrator(graph, policy, &Passive)
    }
    pub fn with_calibrator(
        graph: &'g Graph,
        policy: GrowthPolicy,
        calibrator: &'g dyn Calibrator,
    ) -> Self {
        Self {
            graph,
            calibrator,
            policy,
        }
    }
    pub fn graph(&self) -> &'g Graph {
        self.graph
    }
    pub fn policy(&self) -> GrowthPolicy {
        self.policy
    }

    /// Claims `root` as the root of a new tree and grows it as far as this
    /// worker can. Returns `None` if the claim was lost. A root without
    /// neighbors is CALIBRATED when this returns.
    pub fn start_root(&self, root: VertexId) -> Option<Progress> {
        if !self.graph.vertex(root).membership().claim(None, 0) {
            trace!(root, "root claim lost");
            return None;
        }
        trace!(root, "root claimed");
        let mut progress = Progress::default();
        self.advance(root, &mut progress);
        Some(progress)
    }

    /// Runs whatever step a claimed candidate is waiting for. Vertices in any
    /// other state are left alone, so spurious invocations are harmless.
    pub fn update(&self, vertex: VertexId) -> Progress {
        let mut progress = Progress::default();
        self.advance(vertex, &mut progress);
        progress
    }

    fn advance(&self, vertex: VertexId, progress: &mut Progress) {
        let membership = self.graph.vertex(vertex).membership();
        let view = membership.load();
        if view.state != TreeState::Candidate {
            return;
        }
        if !self.admissible(vertex, view) {
            if let Some(rejected) = membership.reject() {
                trace!(vertex, parent = ?rejected.parent, "candidate rejected");
                if let Some(parent) = rejected.parent {
                    if let Some(edge) = self.graph.find_edge(parent, vertex) {
                        self.graph.edge(edge).set_exploring(false);
                    }
                    self.child_settled(parent, progress);
                }
            }
            return;
        }
        if membership
            .transition(TreeState::Candidate, TreeState::Boundary)
            .is_none()
        {
            return;
        }
        self.expand(vertex, view, progress);
        membership.transition(TreeState::Boundary, TreeState::TreeNode);
        self.settle(vertex, progress);
    }

    fn admissible(&self, vertex: VertexId, view: MembershipView) -> bool {
        match (self.policy.admission, view.parent) {
            (AdmissionPolicy::Greedy, _) | (_, None) => true,
            (AdmissionPolicy::Acyclic, Some(parent)) => self
                .graph
                .neighbors(vertex)
                .filter(|n| *n != parent)
                .all(|n| !self.graph.vertex(n).membership().state().is_owned()),
        }
    }

    // Attempts to claim every neighbor except the parent.
    fn expand(&self, vertex: VertexId, view: MembershipView, progress: &mut Progress) {
        let limit = self
            .policy
            .max_height
            .unwrap_or(MAX_TREE_HEIGHT)
            .min(MAX_TREE_HEIGHT);
        if view.height >= limit {
            return;
        }
        let membership = self.graph.vertex(vertex).membership();
        for &edge_id in self.graph.out_edges(vertex) {
            let edge = self.graph.edge(edge_id);
            let target = edge.target();
            if Some(target) == view.parent {
                continue;
            }
            edge.set_exploring(true);
            // counted before the child can run, so it can never be
            // decremented below what the child contributes
            membership.add_child();
            let child = self.graph.vertex(target).membership();
            if child.claim(Some(vertex), view.height + 1) {
                trace!(parent = vertex, child = target, "child claimed");
                progress.schedule.push(target);
            } else {
                membership.remove_child();
                edge.set_exploring(false);
            }
        }
    }

    fn child_settled(&self, parent: VertexId, progress: &mut Progress) {
        if self.graph.vertex(parent).membership().remove_child() == 1 {
            self.settle(parent, progress);
        }
    }

    // Calibrates `vertex` if it is an explored tree node without pending
    // children, then walks up for as long as this worker releases the last
    // pending child of the parent.
    fn settle(&self, vertex: VertexId, progress: &mut Progress) {
        let mut current = vertex;
        loop {
            let membership = self.graph.vertex(current).membership();
            if membership.pending_children() != 0 {
                return;
            }
            let Some(view) = membership.transition(TreeState::TreeNode, TreeState::Calibrated)
            else {
                return;
            };
            self.calibrator.calibrate(self.graph, current);
            match view.parent {
                None => {
                    debug!(root = current, "tree calibrated");
                    progress.completed = Some(current);
                    return;
                }
                Some(parent) => {
                    if self.graph.vertex(parent).membership().remove_child() != 1 {
                        return;
                    }
                    current = parent;
                }
            }
        }
    }

    // A child hangs below `vertex` when the edge towards it is exploring and
    // the child names `vertex` as its parent.
    fn tree_children(&self, vertex: VertexId) -> impl Iterator<Item = VertexId> + '_ {
        self.graph
            .out_edges(vertex)
            .iter()
            .map(move |&e| self.graph.edge(e))
            .filter(|edge| edge.is_exploring())
            .map(|edge| edge.target())
            .filter(move |&child| {
                let view = self.graph.vertex(child).membership().load();
                view.state.is_owned() && view.parent == Some(vertex)
            })
    }

    /// Every vertex hanging below `root`.
    pub fn collect_block(&self, root: VertexId) -> Block {
        let mut members = RoaringBitmap::new();
        let mut depth = 0;
        let mut stack = vec![root];
        while let Some(vertex) = stack.pop() {
            if !members.insert(vertex) {
                continue;
            }
            depth = depth.max(self.graph.vertex(vertex).membership().height());
            stack.extend(self.tree_children(vertex));
        }
        Block {
            root,
            members,
            depth,
        }
    }

    /// Hands a fully calibrated tree back: every member returns to AVAILABLE.
    /// Nothing is reset unless `root` is a calibrated root and every member
    /// is calibrated.
    pub fn release_tree(&self, root: VertexId) -> Result<Block> {
        let view = self.graph.vertex(root).membership().load();
        if view.state != TreeState::Calibrated || view.parent.is_some() {
            return Err(BlockGibbsError::Invariant(format!(
                "vertex {root} is not a calibrated root ({}, parent {:?})",
                view.state, view.parent
            )));
        }
        let block = self.collect_block(root);
        if let Some(vertex) = block
            .iter()
            .find(|v| self.graph.vertex(*v).membership().state() != TreeState::Calibrated)
        {
            return Err(BlockGibbsError::Invariant(format!(
                "vertex {vertex} in the tree of {root} is {}",
                self.graph.vertex(vertex).membership().state()
            )));
        }
        self.reset_block(&block);
        debug!(root, size = block.len(), depth = block.depth(), "tree released");
        Ok(block)
    }

    /// Forcibly resets the tree below `root`, whatever state it is in. Only
    /// call this when no worker has a claim in flight for that tree.
    pub fn abandon_tree(&self, root: VertexId) -> Block {
        let block = self.collect_block(root);
        self.reset_block(&block);
        debug!(root, size = block.len(), "tree abandoned");
        block
    }

    /// Forcibly returns every vertex of the graph to AVAILABLE. Only call this
    /// while no worker is running.
    pub fn reset_all(&self) {
        for edge in self.graph.edges() {
            edge.set_exploring(false);
        }
        for vertex in self.graph.vertices() {
            vertex.membership().reset();
        }
    }

    fn reset_block(&self, block: &Block) {
        for vertex in block.iter() {
            for &edge in self.graph.out_edges(vertex) {
                self.graph.edge(edge).set_exploring(false);
            }
        }
        for vertex in block.iter() {
            self.graph.vertex(vertex).membership().reset();
        }
    }
}
