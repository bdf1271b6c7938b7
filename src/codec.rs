//! Binary checkpoint format for models, vertices, edges and whole graphs.
//!
//! All integers and floats are little endian. Floats are stored by their bit
//! pattern, so decoding an encoded record reproduces it exactly.
//!
//! ```text
//! [Domain]
//!   - Variable count: u32
//!   - Per variable: id u32, arity u32
//!
//! [Factor]
//!   - Domain
//!   - Table length: u64
//!   - Table: length * f64
//!
//! [Vertex]
//!   - Variable: id u32, arity u32
//!   - Assignment: domain, then one u32 value per variable
//!   - Factor ids: count u64, then u64 each
//!   - Belief: factor
//!   - Working belief: factor
//!   - Update count: u64
//!   - Parent: i64 (-1 for none)
//!   - State tag: u32
//!   - Height: u64
//!   - Pending children: u64
//!
//! [Edge]
//!   - Weight: f64
//!   - Message: factor
//!   - Pairwise factor: factor
//!   - Exploring: u8 (0 or 1)
//!
//! [Graph]
//!   - Magic: "BGCK" (4 bytes)
//!   - Version: u32
//!   - Vertex count: u64, then the vertex records in identifier order
//!   - Edge count: u64, then per edge: source u32, target u32, edge record
//!
//! [Model]
//!   - Magic: "BGCM" (4 bytes)
//!   - Version: u32
//!   - Variable count: u64, then id u32, arity u32 each (ascending ids)
//!   - Name count: u64, then per name: id u32, length u64, UTF-8 bytes
//!   - Factor count: u64, then the factors in insertion order
//! ```
//!
//! Decoding validates everything it reads and fails with
//! [`BlockGibbsError::Decode`] before anything is handed out. Besides every
//! record on its own, a decoded graph must hold consistent trees: an owned
//! vertex hangs below an admitted parent through an exploring edge, one level
//! deeper than that parent, and every parent counts exactly its children
//! that have not calibrated yet.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{BlockGibbsError, Result};
use crate::factor::{Assignment, Domain, Factor, MAX_DIM, Variable};
use crate::graph::{EdgeData, Graph, SampleState, VertexData, VertexId};
use crate::model::{FactorizedModel, ModelBuilder};
use crate::tree::{MAX_TREE_HEIGHT, Membership, MembershipView, TreeState};

const MAGIC: &[u8; 4] = b"BGCK";
const MODEL_MAGIC: &[u8; 4] = b"BGCM";
const VERSION: u32 = 1;

// ------------- Records -------------
/// Everything a vertex holds, detached from its locks and atomics.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexRecord {
    pub variable: Variable,
    pub assignment: Assignment,
    pub factor_ids: Vec<usize>,
    pub belief: Factor,
    pub working_belief: Factor,
    pub update_count: u64,
    pub parent: Option<VertexId>,
    pub state: TreeState,
    pub height: u32,
    pub pending_children: usize,
}

impl VertexRecord {
    pub fn capture(vertex: &VertexData) -> Result<Self> {
        let sample = vertex.sample()?.clone();
        let view = vertex.membership().load();
        Ok(Self {
            variable: vertex.variable(),
            assignment: sample.assignment,
            factor_ids: vertex.factor_ids().to_vec(),
            belief: sample.belief,
            working_belief: sample.working_belief,
            update_count: vertex.update_count(),
            parent: view.parent,
            state: view.state,
            height: view.height,
            pending_children: vertex.membership().pending_children(),
        })
    }
    pub fn into_vertex(self) -> VertexData {
        let view = MembershipView {
            state: self.state,
            parent: self.parent,
            height: self.height,
        };
        VertexData::from_parts(
            self.variable,
            self.factor_ids,
            SampleState {
                assignment: self.assignment,
                belief: self.belief,
                working_belief: self.working_belief,
            },
            self.update_count,
            Membership::restored(view, self.pending_children),
        )
    }
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut encoder = Encoder::default();
        encoder.vertex(self)?;
        Ok(encoder.finish())
    }
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut decoder = Decoder::new(bytes);
        let record = decoder.vertex()?;
        decoder.finish()?;
        Ok(record)
    }
}

/// Everything an edge holds. The endpoints are not part of the edge stream;
/// they are supplied by the surrounding graph record.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRecord {
    pub source: Variable,
    pub target: Variable,
    pub weight: f64,
    pub message: Factor,
    pub pairwise_factor: Factor,
    pub exploring: bool,
}

impl EdgeRecord {
    pub fn capture(graph: &Graph, edge: &EdgeData) -> Result<Self> {
        let endpoint = |id: VertexId| {
            graph.get_vertex(id).map(VertexData::variable).ok_or_else(|| {
                BlockGibbsError::Invariant(format!("edge endpoint {id} is not in the graph"))
            })
        };
        Ok(Self {
            source: endpoint(edge.source())?,
            target: endpoint(edge.target())?,
            weight: edge.weight(),
            message: edge.message()?.clone(),
            pairwise_factor: edge.pairwise_factor().clone(),
            exploring: edge.is_exploring(),
        })
    }
    pub fn into_edge(self) -> EdgeData {
        EdgeData::from_parts(
            self.source.id(),
            self.target.id(),
            self.weight,
            self.pairwise_factor,
            self.message,
            self.exploring,
        )
    }
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut encoder = Encoder::default();
        encoder.edge(self)?;
        Ok(encoder.finish())
    }
    pub fn from_bytes(bytes: &[u8], source: Variable, target: Variable) -> Result<Self> {
        let mut decoder = Decoder::new(bytes);
        let record = decoder.edge(source, target)?;
        decoder.finish()?;
        Ok(record)
    }
}

// ------------- Graph -------------
pub fn encode_graph(graph: &Graph) -> Result<Vec<u8>> {
    let mut encoder = Encoder::default();
    encoder.header(MAGIC)?;
    encoder.len(graph.num_vertices())?;
    for vertex in graph.vertices() {
        encoder.vertex(&VertexRecord::capture(vertex)?)?;
    }
    encoder.len(graph.num_edges())?;
    for edge in graph.edges() {
        let record = EdgeRecord::capture(graph, edge)?;
        encoder.out.write_u32::<LittleEndian>(edge.source())?;
        encoder.out.write_u32::<LittleEndian>(edge.target())?;
        encoder.edge(&record)?;
    }
    Ok(encoder.finish())
}

pub fn decode_graph(bytes: &[u8]) -> Result<Graph> {
    let mut decoder = Decoder::new(bytes);
    decoder.header(MAGIC, "graph")?;

    let vertex_count = decoder.len()?;
    let mut vertices = Vec::with_capacity(vertex_count);
    for index in 0..vertex_count {
        let record = decoder.vertex()?;
        if record.variable.id() as usize != index {
            return Err(corrupt(format!(
                "vertex record {index} holds variable {}",
                record.variable.id()
            )));
        }
        vertices.push(record);
    }
    let variables: Vec<Variable> = vertices.iter().map(|v| v.variable).collect();
    let endpoint = |id: u32| {
        variables
            .get(id as usize)
            .copied()
            .ok_or_else(|| corrupt(format!("edge endpoint {id} out of range")))
    };

    let edge_count = decoder.len()?;
    let mut edges = Vec::with_capacity(edge_count);
    for _ in 0..edge_count {
        let source = endpoint(decoder.u32()?)?;
        let target = endpoint(decoder.u32()?)?;
        edges.push(decoder.edge(source, target)?);
    }
    decoder.finish()?;

    let mut graph = Graph::new(vertices.into_iter().map(VertexRecord::into_vertex).collect())
        .map_err(|e| corrupt(e.to_string()))?;
    for edge in edges {
        graph
            .add_edge(edge.into_edge())
            .map_err(|e| corrupt(e.to_string()))?;
    }
    check_trees(&graph)?;
    Ok(graph)
}

/// Decodes a graph and checks that it was built from `model`.
pub fn decode_graph_for(model: &FactorizedModel, bytes: &[u8]) -> Result<Graph> {
    let graph = decode_graph(bytes)?;
    check_model_binding(model, &graph)?;
    Ok(graph)
}

/// Checks the tree records of an assembled graph against each other, so
/// that the protocol never follows a parent that is not there.
pub fn check_trees(graph: &Graph) -> Result<()> {
    let mut unsettled = vec![0usize; graph.num_vertices()];
    for vertex in graph.vertices() {
        let id = vertex.id();
        let view = vertex.membership().load();
        if !view.state.is_owned() {
            continue;
        }
        let pending = vertex.membership().pending_children();
        if matches!(view.state, TreeState::Candidate | TreeState::Calibrated) && pending != 0 {
            return Err(corrupt(format!(
                "{} vertex {id} has {pending} pending children",
                view.state
            )));
        }
        let Some(parent) = view.parent else {
            if view.height != 0 {
                return Err(corrupt(format!("root {id} at height {}", view.height)));
            }
            continue;
        };
        let above = graph
            .get_vertex(parent)
            .map(|p| p.membership().load())
            .ok_or_else(|| corrupt(format!("parent {parent} of vertex {id} out of range")))?;
        if !graph
            .find_edge(parent, id)
            .is_some_and(|edge| graph.edge(edge).is_exploring())
        {
            return Err(corrupt(format!(
                "vertex {id} hangs below {parent} without an exploring edge"
            )));
        }
        if !matches!(
            above.state,
            TreeState::Boundary | TreeState::TreeNode | TreeState::Calibrated
        ) {
            return Err(corrupt(format!(
                "vertex {id} hangs below {} vertex {parent}",
                above.state
            )));
        }
        if view.height != above.height + 1 {
            return Err(corrupt(format!(
                "vertex {id} at height {} below {parent} at height {}",
                view.height, above.height
            )));
        }
        if view.state != TreeState::Calibrated {
            unsettled[parent as usize] += 1;
        }
    }
    for vertex in graph.vertices() {
        let pending = vertex.membership().pending_children();
        let expected = unsettled[vertex.id() as usize];
        if pending != expected {
            return Err(corrupt(format!(
                "vertex {} counts {pending} pending children, {expected} are unsettled",
                vertex.id()
            )));
        }
    }
    Ok(())
}

// ------------- Model -------------
pub fn encode_model(model: &FactorizedModel) -> Result<Vec<u8>> {
    let mut encoder = Encoder::default();
    encoder.header(MODEL_MAGIC)?;
    encoder.len(model.num_variables())?;
    for variable in model.variables() {
        encoder.variable(*variable)?;
    }
    let names = model.names();
    encoder.len(names.len())?;
    for (id, name) in names {
        encoder.out.write_u32::<LittleEndian>(id)?;
        encoder.text(name)?;
    }
    encoder.len(model.num_factors())?;
    for factor in model.factors() {
        encoder.factor(factor)?;
    }
    Ok(encoder.finish())
}

/// Rebuilds a model; the reverse index is derived again rather than read.
pub fn decode_model(bytes: &[u8]) -> Result<FactorizedModel> {
    let mut decoder = Decoder::new(bytes);
    decoder.header(MODEL_MAGIC, "model")?;

    let count = decoder.len()?;
    let variables = (0..count)
        .map(|_| decoder.variable())
        .collect::<Result<Vec<_>>>()?;

    let mut builder = ModelBuilder::new();
    let mut last = None;
    for _ in 0..decoder.len()? {
        let id = decoder.u32()?;
        if last.is_some_and(|last| last >= id) {
            return Err(corrupt("variable names are not in ascending order"));
        }
        last = Some(id);
        builder.restore_name(id, decoder.text()?);
    }
    for _ in 0..decoder.len()? {
        builder.add_factor(decoder.factor()?);
    }
    decoder.finish()?;

    let model = builder.build().map_err(|e| corrupt(e.to_string()))?;
    let listed = variables.len() == model.num_variables()
        && variables
            .iter()
            .zip(model.variables())
            .all(|(a, b)| a.id() == b.id() && a.arity() == b.arity());
    if !listed {
        return Err(corrupt(
            "listed variables differ from those the factors reference",
        ));
    }
    Ok(model)
}

/// Checks that every vertex stands for a variable of `model` and indexes
/// exactly the factors that reference it.
pub fn check_model_binding(model: &FactorizedModel, graph: &Graph) -> Result<()> {
    model_mismatch(model, graph).map_or(Ok(()), |message| Err(corrupt(message)))
}

pub(crate) fn model_mismatch(model: &FactorizedModel, graph: &Graph) -> Option<String> {
    if model.num_variables() != graph.num_vertices() {
        return Some(format!(
            "graph of {} vertices for a model of {} variables",
            graph.num_vertices(),
            model.num_variables()
        ));
    }
    for vertex in graph.vertices() {
        let variable = vertex.variable();
        if model.variable(variable.id()).map(|v| v.arity()) != Some(variable.arity()) {
            return Some(format!("vertex {} stands for no variable of the model", vertex.id()));
        }
        if let Some(id) = vertex
            .factor_ids()
            .iter()
            .find(|id| **id >= model.num_factors())
        {
            return Some(format!(
                "vertex {} references factor {id} of {}",
                vertex.id(),
                model.num_factors()
            ));
        }
        if model.factor_ids(&variable).ok() != Some(vertex.factor_ids()) {
            return Some(format!(
                "factors of vertex {} disagree with the model",
                vertex.id()
            ));
        }
    }
    None
}

fn corrupt(message: impl Into<String>) -> BlockGibbsError {
    BlockGibbsError::Decode(message.into())
}

// ------------- Encoder -------------
#[derive(Default)]
struct Encoder {
    out: Vec<u8>,
}

impl Encoder {
    fn finish(self) -> Vec<u8> {
        self.out
    }
    fn header(&mut self, magic: &[u8; 4]) -> Result<()> {
        self.out.extend_from_slice(magic);
        self.out.write_u32::<LittleEndian>(VERSION)?;
        Ok(())
    }
    fn len(&mut self, len: usize) -> Result<()> {
        self.out.write_u64::<LittleEndian>(len as u64)?;
        Ok(())
    }
    fn text(&mut self, text: &str) -> Result<()> {
        self.len(text.len())?;
        self.out.extend_from_slice(text.as_bytes());
        Ok(())
    }
    fn variable(&mut self, variable: Variable) -> Result<()> {
        self.out.write_u32::<LittleEndian>(variable.id())?;
        self.out.write_u32::<LittleEndian>(variable.arity())?;
        Ok(())
    }
    fn domain(&mut self, domain: &Domain) -> Result<()> {
        self.out.write_u32::<LittleEndian>(domain.num_vars() as u32)?;
        for variable in domain.vars() {
            self.variable(*variable)?;
        }
        Ok(())
    }
    fn factor(&mut self, factor: &Factor) -> Result<()> {
        self.domain(factor.domain())?;
        self.len(factor.size())?;
        for &logp in factor.table() {
            self.out.write_f64::<LittleEndian>(logp)?;
        }
        Ok(())
    }
    fn vertex(&mut self, record: &VertexRecord) -> Result<()> {
        self.variable(record.variable)?;
        self.domain(record.assignment.domain())?;
        for &value in record.assignment.values() {
            self.out.write_u32::<LittleEndian>(value)?;
        }
        self.len(record.factor_ids.len())?;
        for &factor_id in &record.factor_ids {
            self.out.write_u64::<LittleEndian>(factor_id as u64)?;
        }
        self.factor(&record.belief)?;
        self.factor(&record.working_belief)?;
        self.out.write_u64::<LittleEndian>(record.update_count)?;
        self.out
            .write_i64::<LittleEndian>(record.parent.map_or(-1, i64::from))?;
        self.out.write_u32::<LittleEndian>(record.state.tag())?;
        self.out.write_u64::<LittleEndian>(u64::from(record.height))?;
        self.len(record.pending_children)?;
        Ok(())
    }
    fn edge(&mut self, record: &EdgeRecord) -> Result<()> {
        self.out.write_f64::<LittleEndian>(record.weight)?;
        self.factor(&record.message)?;
        self.factor(&record.pairwise_factor)?;
        self.out.write_u8(u8::from(record.exploring))?;
        Ok(())
    }
}

// ------------- Decoder -------------
struct Decoder<'a> {
    input: &'a [u8],
}

fn truncated(e: std::io::Error) -> BlockGibbsError {
    corrupt(format!("truncated checkpoint: {e}"))
}

impl<'a> Decoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input }
    }
    fn finish(self) -> Result<()> {
        if self.input.is_empty() {
            Ok(())
        } else {
            Err(corrupt(format!("{} trailing bytes", self.input.len())))
        }
    }
    fn header(&mut self, magic: &[u8; 4], what: &str) -> Result<()> {
        let mut found = [0u8; 4];
        for byte in found.iter_mut() {
            *byte = self.u8()?;
        }
        if &found != magic {
            return Err(corrupt(format!("not a {what} checkpoint (bad magic bytes)")));
        }
        let version = self.u32()?;
        if version != VERSION {
            return Err(corrupt(format!("unsupported {what} checkpoint version {version}")));
        }
        Ok(())
    }
    fn u8(&mut self) -> Result<u8> {
        self.input.read_u8().map_err(truncated)
    }
    fn u32(&mut self) -> Result<u32> {
        self.input.read_u32::<LittleEndian>().map_err(truncated)
    }
    fn u64(&mut self) -> Result<u64> {
        self.input.read_u64::<LittleEndian>().map_err(truncated)
    }
    fn i64(&mut self) -> Result<i64> {
        self.input.read_i64::<LittleEndian>().map_err(truncated)
    }
    fn f64(&mut self) -> Result<f64> {
        self.input.read_f64::<LittleEndian>().map_err(truncated)
    }
    // A count can never exceed the bytes left, since every element takes at
    // least one; this keeps a corrupt count from reserving huge buffers.
    fn len(&mut self) -> Result<usize> {
        let len = self.u64()?;
        if len > self.input.len() as u64 {
            return Err(corrupt(format!(
                "count {len} exceeds the {} bytes left",
                self.input.len()
            )));
        }
        Ok(len as usize)
    }
    fn text(&mut self) -> Result<String> {
        let len = self.len()?;
        let (text, rest) = self.input.split_at(len);
        self.input = rest;
        String::from_utf8(text.to_vec()).map_err(|e| corrupt(format!("name is not UTF-8: {e}")))
    }
    fn variable(&mut self) -> Result<Variable> {
        let id = self.u32()?;
        let arity = self.u32()?;
        if arity == 0 {
            return Err(corrupt(format!("variable {id} has arity 0")));
        }
        Ok(Variable::new(id, arity))
    }
    fn domain(&mut self) -> Result<Domain> {
        let count = self.u32()? as usize;
        if count == 0 || count > MAX_DIM {
            return Err(corrupt(format!("domain of {count} variables")));
        }
        let mut vars = Vec::with_capacity(count);
        for _ in 0..count {
            let variable = self.variable()?;
            if vars.last().is_some_and(|last: &Variable| last.id() >= variable.id()) {
                return Err(corrupt("domain variables are not strictly ascending"));
            }
            vars.push(variable);
        }
        if vars
            .iter()
            .try_fold(1usize, |size, v| size.checked_mul(v.arity() as usize))
            .is_none()
        {
            return Err(corrupt("domain size overflows"));
        }
        Domain::new(vars).map_err(|e| corrupt(e.to_string()))
    }
    fn factor(&mut self) -> Result<Factor> {
        let domain = self.domain()?;
        let len = self.len()?;
        if len != domain.size() {
            return Err(corrupt(format!(
                "table of {len} entries for domain {domain} of size {}",
                domain.size()
            )));
        }
        let table = (0..len).map(|_| self.f64()).collect::<Result<Vec<_>>>()?;
        Factor::from_table(domain, table).map_err(|e| corrupt(e.to_string()))
    }
    fn vertex(&mut self) -> Result<VertexRecord> {
        let variable = self.variable()?;
        let own = Domain::unary(variable);
        let expect_own = |what: &str, domain: &Domain| {
            if domain.same_shape(&own) {
                Ok(())
            } else {
                Err(corrupt(format!(
                    "{what} of vertex {} spans {domain}",
                    variable.id()
                )))
            }
        };

        let domain = self.domain()?;
        expect_own("assignment", &domain)?;
        let values = (0..domain.num_vars())
            .map(|_| self.u32())
            .collect::<Result<Vec<_>>>()?;
        let assignment =
            Assignment::from_values(domain, values).map_err(|e| corrupt(e.to_string()))?;

        let count = self.len()?;
        let factor_ids = (0..count)
            .map(|_| self.u64().map(|id| id as usize))
            .collect::<Result<Vec<_>>>()?;

        let belief = self.factor()?;
        expect_own("belief", belief.domain())?;
        let working_belief = self.factor()?;
        expect_own("working belief", working_belief.domain())?;

        let update_count = self.u64()?;
        let parent = match self.i64()? {
            -1 => None,
            id if (0..i64::from(u32::MAX)).contains(&id) => Some(id as VertexId),
            id => return Err(corrupt(format!("parent {id} out of range"))),
        };
        let tag = self.u32()?;
        let state =
            TreeState::from_tag(tag).ok_or_else(|| corrupt(format!("unknown state tag {tag}")))?;
        let height = self.u64()?;
        if height > u64::from(MAX_TREE_HEIGHT) {
            return Err(corrupt(format!("height {height} out of range")));
        }
        let pending = self.u64()?;
        let pending_children = usize::try_from(pending)
            .map_err(|_| corrupt(format!("pending children {pending} out of range")))?;
        // an AVAILABLE vertex is only claimable from its canonical record
        if state == TreeState::Available && (parent.is_some() || height != 0 || pending != 0) {
            return Err(corrupt(format!(
                "available vertex {} carries tree data",
                variable.id()
            )));
        }
        Ok(VertexRecord {
            variable,
            assignment,
            factor_ids,
            belief,
            working_belief,
            update_count,
            parent,
            state,
            height: height as u32,
            pending_children,
        })
    }
    fn edge(&mut self, source: Variable, target: Variable) -> Result<EdgeRecord> {
        let weight = self.f64()?;
        let message = self.factor()?;
        if !message.domain().same_shape(&Domain::unary(target)) {
            return Err(corrupt(format!(
                "message on edge {}->{} spans {}",
                source.id(),
                target.id(),
                message.domain()
            )));
        }
        let pairwise_factor = self.factor()?;
        let pair = Domain::new([source, target]).map_err(|e| corrupt(e.to_string()))?;
        if !pairwise_factor.domain().same_shape(&pair) {
            return Err(corrupt(format!(
                "pairwise factor on edge {}->{} spans {}",
                source.id(),
                target.id(),
                pairwise_factor.domain()
            )));
        }
        let exploring = match self.u8()? {
            0 => false,
            1 => true,
            flag => return Err(corrupt(format!("exploring flag {flag}"))),
        };
        Ok(EdgeRecord {
            source,
            target,
            weight,
            message,
            pairwise_factor,
            exploring,
        })
    }
}
