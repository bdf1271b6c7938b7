use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{BlockGibbsError, Result};
use crate::factor::{Assignment, Domain, Factor, Variable, VariableId};
use crate::tree::{Membership, TreeState};

/// Vertex identifiers coincide with the identifiers of the variables.
pub type VertexId = VariableId;
pub type EdgeId = usize;

// ------------- Vertex -------------
/// State owned by the sampler: guarded by the vertex lock, never touched by
/// the tree protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleState {
    pub assignment: Assignment,
    pub belief: Factor,
    pub working_belief: Factor,
}

#[derive(Debug)]
pub struct VertexData {
    variable: Variable,
    factor_ids: Vec<usize>,
    sample: Mutex<SampleState>,
    updates: AtomicU64,
    membership: Membership,
}

impl VertexData {
    /// A fresh vertex: beliefs hold all their mass at the minimum log
    /// probability and the vertex is AVAILABLE.
    pub fn new(variable: Variable, factor_ids: Vec<usize>, assignment: Assignment) -> Self {
        let mut belief = Factor::new(Domain::unary(variable));
        belief.uniform(-f64::MAX);
        let working_belief = belief.clone();
        Self {
            variable,
            factor_ids,
            sample: Mutex::new(SampleState {
                assignment,
                belief,
                working_belief,
            }),
            updates: AtomicU64::new(0),
            membership: Membership::new(),
        }
    }
    pub(crate) fn from_parts(
        variable: Variable,
        factor_ids: Vec<usize>,
        sample: SampleState,
        updates: u64,
        membership: Membership,
    ) -> Self {
        Self {
            variable,
            factor_ids,
            sample: Mutex::new(sample),
            updates: AtomicU64::new(updates),
            membership,
        }
    }
    pub fn id(&self) -> VertexId {
        self.variable.id()
    }
    pub fn variable(&self) -> Variable {
        self.variable
    }
    pub fn factor_ids(&self) -> &[usize] {
        &self.factor_ids
    }
    /// Exclusive access to assignment and beliefs.
    pub fn sample(&self) -> Result<MutexGuard<'_, SampleState>> {
        self.sample
            .lock()
            .map_err(|e| BlockGibbsError::Lock(format!("vertex {}: {}", self.id(), e)))
    }
    /// Counts one more resample of this vertex, returning the new total.
    pub fn record_update(&self) -> u64 {
        self.updates.fetch_add(1, Ordering::SeqCst) + 1
    }
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }
    /// Read-only view of the tree membership; it only changes through the
    /// operations of [`crate::tree::TreeProtocol`].
    pub fn membership(&self) -> &Membership {
        &self.membership
    }
    pub fn state(&self) -> TreeState {
        self.membership.state()
    }
}

// ------------- Edge -------------
#[derive(Debug)]
pub struct EdgeData {
    source: VertexId,
    target: VertexId,
    weight: f64,
    pairwise_factor: Factor,
    message: Mutex<Factor>,
    exploring: AtomicBool,
}

impl EdgeData {
    /// The message starts out uniform over the target.
    pub fn new(source: Variable, target: Variable, pairwise_factor: Factor) -> Self {
        Self::from_parts(
            source.id(),
            target.id(),
            0.0,
            pairwise_factor,
            Factor::new(Domain::unary(target)),
            false,
        )
    }
    pub(crate) fn from_parts(
        source: VertexId,
        target: VertexId,
        weight: f64,
        pairwise_factor: Factor,
        message: Factor,
        exploring: bool,
    ) -> Self {
        Self {
            source,
            target,
            weight,
            pairwise_factor,
            message: Mutex::new(message),
            exploring: AtomicBool::new(exploring),
        }
    }
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
    pub fn source(&self) -> VertexId {
        self.source
    }
    pub fn target(&self) -> VertexId {
        self.target
    }
    pub fn weight(&self) -> f64 {
        self.weight
    }
    pub fn pairwise_factor(&self) -> &Factor {
        &self.pairwise_factor
    }
    pub fn message(&self) -> Result<MutexGuard<'_, Factor>> {
        self.message.lock().map_err(|e| {
            BlockGibbsError::Lock(format!("edge {}->{}: {}", self.source, self.target, e))
        })
    }
    pub fn is_exploring(&self) -> bool {
        self.exploring.load(Ordering::SeqCst)
    }
    pub(crate) fn set_exploring(&self, exploring: bool) {
        self.exploring.store(exploring, Ordering::SeqCst);
    }
}

// ------------- Graph -------------
/// Pairwise Markov random field: one vertex per variable and two directed
/// edge records per pair of variables sharing a factor.
#[derive(Debug)]
pub struct Graph {
    vertices: Vec<VertexData>,
    edges: Vec<EdgeData>,
    out_edges: Vec<Vec<EdgeId>>,
    in_edges: Vec<Vec<EdgeId>>,
}

impl Graph {
    /// Vertex `i` of the list must represent the variable with identifier `i`.
    pub fn new(vertices: Vec<VertexData>) -> Result<Self> {
        if vertices.len() >= u32::MAX as usize {
            return Err(BlockGibbsError::Contract(format!(
                "{} vertices exceed the addressable range",
                vertices.len()
            )));
        }
        if let Some((index, vertex)) = vertices
            .iter()
            .enumerate()
            .find(|(index, vertex)| vertex.id() as usize != *index)
        {
            return Err(BlockGibbsError::Contract(format!(
                "vertex {index} represents variable {}, identifiers must be dense and start at 0",
                vertex.id()
            )));
        }
        let count = vertices.len();
        Ok(Self {
            vertices,
            edges: Vec::new(),
            out_edges: vec![Vec::new(); count],
            in_edges: vec![Vec::new(); count],
        })
    }
    pub fn add_edge(&mut self, edge: EdgeData) -> Result<EdgeId> {
        let (source, target) = (edge.source, edge.target);
        let count = self.vertices.len() as u32;
        if source >= count || target >= count || source == target {
            return Err(BlockGibbsError::Contract(format!(
                "edge {source}->{target} does not join two distinct vertices"
            )));
        }
        if self.find_edge(source, target).is_some() {
            return Err(BlockGibbsError::Contract(format!(
                "edge {source}->{target} already exists"
            )));
        }
        let id = self.edges.len();
        self.edges.push(edge);
        self.out_edges[source as usize].push(id);
        self.in_edges[target as usize].push(id);
        Ok(id)
    }
    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }
    /// Panics if `vertex` is not part of the graph, like slice indexing.
    pub fn vertex(&self, vertex: VertexId) -> &VertexData {
        &self.vertices[vertex as usize]
    }
    pub fn get_vertex(&self, vertex: VertexId) -> Option<&VertexData> {
        self.vertices.get(vertex as usize)
    }
    pub fn edge(&self, edge: EdgeId) -> &EdgeData {
        &self.edges[edge]
    }
    pub fn vertices(&self) -> impl Iterator<Item = &VertexData> {
        self.vertices.iter()
    }
    pub fn edges(&self) -> impl Iterator<Item = &EdgeData> {
        self.edges.iter()
    }
    pub fn out_edges(&self, vertex: VertexId) -> &[EdgeId] {
        &self.out_edges[vertex as usize]
    }
    pub fn in_edges(&self, vertex: VertexId) -> &[EdgeId] {
        &self.in_edges[vertex as usize]
    }
    pub fn find_edge(&self, source: VertexId, target: VertexId) -> Option<EdgeId> {
        self.out_edges
            .get(source as usize)?
            .iter()
            .copied()
            .find(|e| self.edges[*e].target == target)
    }
    pub fn neighbors(&self, vertex: VertexId) -> impl Iterator<Item = VertexId> + '_ {
        self.out_edges(vertex)
            .iter()
            .map(move |e| self.edges[*e].target)
    }
    /// Fewest and most resamples over all vertices.
    pub fn min_max_updates(&self) -> Option<(u64, u64)> {
        self.vertices.iter().map(|v| v.update_count()).fold(None, |acc, n| {
            Some(match acc {
                None => (n, n),
                Some((lo, hi)) => (lo.min(n), hi.max(n)),
            })
        })
    }
}
