//! Property tests for graph construction, checkpoint encoding and tree growth

use std::collections::BTreeSet;
use std::thread;

use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

use blockgibbs::codec::{decode_graph, encode_graph, VertexRecord};
use blockgibbs::factor::{Assignment, Domain, Factor, Variable};
use blockgibbs::graph::{Graph, VertexId};
use blockgibbs::model::{FactorizedModel, ModelBuilder};
use blockgibbs::pairwise::{construct_pairwise_graph, UniformEdge};
use blockgibbs::tree::{GrowthPolicy, TreeProtocol, TreeState};

// Every variable gets a unary factor so identifiers are dense; the scopes
// index into the variables modulo their count.
fn model(arities: &[u32], scopes: &[Vec<usize>]) -> FactorizedModel {
    let variables: Vec<Variable> = arities
        .iter()
        .enumerate()
        .map(|(id, arity)| Variable::new(id as u32, *arity))
        .collect();
    let mut builder = ModelBuilder::new();
    for variable in &variables {
        builder.add_factor(Factor::new(Domain::unary(*variable)));
    }
    for scope in scopes {
        let vars = scope.iter().map(|i| variables[i % variables.len()]);
        builder.add_factor(Factor::new(Domain::new(vars).unwrap()));
    }
    builder.build().unwrap()
}

fn model_strategy() -> impl Strategy<Value = (Vec<u32>, Vec<Vec<usize>>)> {
    (
        prop::collection::vec(1u32..4, 1..12),
        prop::collection::vec(prop::collection::vec(0usize..64, 1..5), 0..16),
    )
}

fn build(arities: &[u32], scopes: &[Vec<usize>], seed: u64) -> (FactorizedModel, Graph) {
    let model = model(arities, scopes);
    let mut rng = StdRng::seed_from_u64(seed);
    let graph = construct_pairwise_graph(&model, &UniformEdge, &mut rng).unwrap();
    (model, graph)
}

fn grow(protocol: &TreeProtocol, root: VertexId) -> Option<VertexId> {
    let progress = protocol.start_root(root)?;
    let mut completed = progress.completed;
    let mut work = progress.schedule;
    while let Some(vertex) = work.pop() {
        let progress = protocol.update(vertex);
        work.extend(progress.schedule);
        completed = completed.or(progress.completed);
    }
    completed
}

proptest! {
    #[test]
    fn edges_exactly_join_co_occurring_variables((arities, scopes) in model_strategy(), seed in any::<u64>()) {
        let (model, graph) = build(&arities, &scopes, seed);
        prop_assert_eq!(graph.num_vertices(), model.num_variables());

        let mut pairs = BTreeSet::new();
        for factor in model.factors() {
            for a in factor.domain().vars() {
                for b in factor.domain().vars() {
                    if a != b {
                        pairs.insert((a.id(), b.id()));
                    }
                }
            }
        }
        let edges: BTreeSet<(u32, u32)> = graph.edges().map(|e| (e.source(), e.target())).collect();
        prop_assert_eq!(edges.len(), graph.num_edges());
        prop_assert_eq!(edges, pairs);
        for vertex in graph.vertices() {
            prop_assert_eq!(vertex.id(), vertex.variable().id());
            let value = vertex.sample().unwrap().assignment.values()[0];
            prop_assert!(value < vertex.variable().arity());
        }
    }

    #[test]
    fn vertex_records_decode_to_identical_bytes(
        arity in 1u32..6,
        value in 0u32..6,
        table in prop::collection::vec(prop::num::f64::ANY, 6),
        factor_ids in prop::collection::vec(0usize..1000, 0..5),
        update_count in any::<u64>(),
        state in 0u32..5,
        parent in 0u32..1000,
        height in 0u32..100,
        pending in 0usize..8,
    ) {
        let variable = Variable::new(7, arity);
        let domain = Domain::unary(variable);
        let belief = Factor::from_table(domain.clone(), table[..arity as usize].to_vec()).unwrap();
        let state = TreeState::from_tag(state).unwrap();
        let available = state == TreeState::Available;
        let record = VertexRecord {
            variable,
            assignment: Assignment::from_values(domain, vec![value % arity]).unwrap(),
            factor_ids,
            working_belief: Factor::new(belief.domain().clone()),
            belief,
            update_count,
            parent: (!available).then_some(parent),
            state,
            height: if available { 0 } else { height },
            pending_children: if available { 0 } else { pending },
        };
        let bytes = record.to_bytes().unwrap();
        let decoded = VertexRecord::from_bytes(&bytes).unwrap();
        prop_assert_eq!(decoded.to_bytes().unwrap(), bytes);
        prop_assert_eq!(decoded.state, record.state);
        prop_assert_eq!(decoded.parent, record.parent);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn concurrent_growth_partitions_random_graphs((arities, scopes) in model_strategy(), seed in any::<u64>()) {
        let (_, graph) = build(&arities, &scopes, seed);
        let protocol = TreeProtocol::new(&graph, GrowthPolicy::default());
        let count = graph.num_vertices() as VertexId;
        let roots: Vec<VertexId> = thread::scope(|s| {
            let handles: Vec<_> = (0..3u32)
                .map(|w| {
                    let protocol = &protocol;
                    s.spawn(move || {
                        (0..count)
                            .filter(|v| v % 3 == w)
                            .filter_map(|v| grow(protocol, v))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        let mut seen = BTreeSet::new();
        for root in roots {
            for vertex in protocol.collect_block(root).iter() {
                prop_assert!(seen.insert(vertex));
            }
        }
        prop_assert_eq!(seen.len(), graph.num_vertices());
        prop_assert!(graph.vertices().all(|v| v.state() == TreeState::Calibrated));

        let restored = decode_graph(&encode_graph(&graph).unwrap()).unwrap();
        prop_assert_eq!(encode_graph(&restored).unwrap(), encode_graph(&graph).unwrap());
    }
}
