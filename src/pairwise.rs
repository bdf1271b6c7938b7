//! Conversion of a factorized model into a pairwise Markov random field.
//!
//! Every variable becomes a vertex whose identifier equals the variable
//! identifier. Two vertices are joined (by one edge record in each direction)
//! whenever their variables appear together in at least one factor. Because
//! factors span at most [`crate::factor::MAX_DIM`] variables, collecting the
//! co-occurring variables per vertex stays cheap even though it is quadratic
//! in factor arity.

use std::collections::BTreeMap;

use rand::Rng;
use serde::Deserialize;
use tracing::info;

use crate::error::Result;
use crate::factor::{Assignment, Domain, Factor, Variable};
use crate::graph::{EdgeData, Graph, VertexData, VertexId};
use crate::model::FactorizedModel;

/// Derives the pairwise compatibility table stored on an edge.
pub trait EdgeFactorStrategy {
    /// `shared` lists the factors that mention both `source` and `target`.
    /// The result must be a factor over exactly `{source, target}`.
    fn edge_factor(
        &self,
        model: &FactorizedModel,
        source: Variable,
        target: Variable,
        shared: &[usize],
    ) -> Result<Factor>;
}

/// Projects every shared factor onto the pair by summing out the other
/// variables, and multiplies the projections together.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarginalProduct;

impl EdgeFactorStrategy for MarginalProduct {
    fn edge_factor(
        &self,
        model: &FactorizedModel,
        source: Variable,
        target: Variable,
        shared: &[usize],
    ) -> Result<Factor> {
        let domain = Domain::new([source, target])?;
        let mut table = Factor::new(domain.clone());
        for &factor_id in shared {
            let projection = model.factors()[factor_id].marginalize(&domain)?;
            table.multiply_in(&projection)?;
        }
        Ok(table)
    }
}

/// An uninformative table: every joint value has log weight 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformEdge;

impl EdgeFactorStrategy for UniformEdge {
    fn edge_factor(
        &self,
        _model: &FactorizedModel,
        source: Variable,
        target: Variable,
        _shared: &[usize],
    ) -> Result<Factor> {
        Ok(Factor::new(Domain::new([source, target])?))
    }
}

/// Strategy selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeFactorKind {
    #[default]
    MarginalProduct,
    Uniform,
}

impl EdgeFactorStrategy for EdgeFactorKind {
    fn edge_factor(
        &self,
        model: &FactorizedModel,
        source: Variable,
        target: Variable,
        shared: &[usize],
    ) -> Result<Factor> {
        match self {
            EdgeFactorKind::MarginalProduct => {
                MarginalProduct.edge_factor(model, source, target, shared)
            }
            EdgeFactorKind::Uniform => UniformEdge.edge_factor(model, source, target, shared),
        }
    }
}

/// Builds the pairwise graph of `model`, drawing every initial assignment
/// uniformly at random. Fails with a contract error, before any edge is
/// created, unless the variable identifiers are exactly `0..n`.
pub fn construct_pairwise_graph<S, R>(
    model: &FactorizedModel,
    strategy: &S,
    rng: &mut R,
) -> Result<Graph>
where
    S: EdgeFactorStrategy + ?Sized,
    R: Rng,
{
    let mut vertices = Vec::with_capacity(model.num_variables());
    for variable in model.variables() {
        let factor_ids = model.factor_ids(variable)?.to_vec();
        let mut assignment = Assignment::new(Domain::unary(*variable));
        assignment.uniform_sample(rng);
        vertices.push(VertexData::new(*variable, factor_ids, assignment));
    }
    // refuses identifiers that are not dense and 0-based
    let mut graph = Graph::new(vertices)?;

    let factors = model.factors();
    for vertex_id in 0..graph.num_vertices() as VertexId {
        let vertex = graph.vertex(vertex_id);
        let variable = vertex.variable();
        // every other variable of every factor of this vertex, together with
        // the factors it shares with the vertex
        let mut neighbors: BTreeMap<Variable, Vec<usize>> = BTreeMap::new();
        for &factor_id in vertex.factor_ids() {
            for other in factors[factor_id].domain().vars() {
                if *other != variable {
                    neighbors.entry(*other).or_default().push(factor_id);
                }
            }
        }
        let edges = neighbors
            .into_iter()
            .map(|(neighbor, shared)| {
                let table = strategy.edge_factor(model, variable, neighbor, &shared)?;
                Ok(EdgeData::new(variable, neighbor, table))
            })
            .collect::<Result<Vec<_>>>()?;
        for edge in edges {
            graph.add_edge(edge)?;
        }
    }
    info!(
        vertices = graph.num_vertices(),
        edges = graph.num_edges(),
        factors = factors.len(),
        "pairwise graph constructed"
    );
    Ok(graph)
}
