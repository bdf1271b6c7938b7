use rand::SeedableRng;
use rand::rngs::StdRng;

use blockgibbs::error::BlockGibbsError;
use blockgibbs::factor::{Domain, Factor, Variable};
use blockgibbs::model::ModelBuilder;
use blockgibbs::pairwise::{construct_pairwise_graph, EdgeFactorKind, MarginalProduct};

fn abc() -> (Variable, Variable, Variable) {
    (Variable::new(0, 2), Variable::new(1, 2), Variable::new(2, 2))
}

#[test]
fn chain_of_two_factors_yields_two_pairs() {
    let (a, b, c) = abc();
    let mut builder = ModelBuilder::new();
    builder.add_factor(Factor::new(Domain::new([a, b]).unwrap()));
    builder.add_factor(Factor::new(Domain::new([b, c]).unwrap()));
    let model = builder.build().unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let graph = construct_pairwise_graph(&model, &MarginalProduct, &mut rng).unwrap();

    assert_eq!(graph.num_vertices(), 3);
    // one record per direction for A-B and B-C
    assert_eq!(graph.num_edges(), 4);
    assert!(graph.find_edge(0, 1).is_some());
    assert!(graph.find_edge(1, 0).is_some());
    assert!(graph.find_edge(1, 2).is_some());
    assert!(graph.find_edge(2, 1).is_some());
    assert!(graph.find_edge(0, 2).is_none());
    assert!(graph.find_edge(2, 0).is_none());
    for vertex in graph.vertices() {
        assert_eq!(vertex.id(), vertex.variable().id());
        assert_eq!(vertex.factor_ids(), model.factor_ids(&vertex.variable()).unwrap());
    }
}

#[test]
fn vertices_start_available_with_valid_assignments() {
    let (a, b, c) = abc();
    let mut builder = ModelBuilder::new();
    builder.add_factor(Factor::new(Domain::new([a, b, c]).unwrap()));
    let model = builder.build().unwrap();
    let mut rng = StdRng::seed_from_u64(99);
    let graph = construct_pairwise_graph(&model, &EdgeFactorKind::default(), &mut rng).unwrap();

    // a ternary factor joins every pair
    assert_eq!(graph.num_edges(), 6);
    for vertex in graph.vertices() {
        let sample = vertex.sample().unwrap();
        assert!(sample.assignment.values()[0] < 2);
        assert!(sample.belief.table().iter().all(|x| *x == -f64::MAX));
        assert_eq!(vertex.membership().pending_children(), 0);
        assert_eq!(vertex.membership().parent(), None);
        assert_eq!(vertex.update_count(), 0);
    }
    for edge in graph.edges() {
        assert!(!edge.is_exploring());
        assert_eq!(edge.weight(), 0.0);
        assert_eq!(edge.pairwise_factor().size(), 4);
    }
}

#[test]
fn identifiers_with_a_gap_are_refused() {
    let mut builder = ModelBuilder::new();
    builder.add_factor(Factor::new(
        Domain::new([Variable::new(0, 2), Variable::new(2, 2)]).unwrap(),
    ));
    let model = builder.build().unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let result = construct_pairwise_graph(&model, &MarginalProduct, &mut rng);
    assert!(matches!(result, Err(BlockGibbsError::Contract(_))));
}

#[test]
fn same_seed_gives_same_assignments() {
    let (a, b, c) = abc();
    let mut builder = ModelBuilder::new();
    builder.add_factor(Factor::new(Domain::new([a, b]).unwrap()));
    builder.add_factor(Factor::new(Domain::new([b, c]).unwrap()));
    let model = builder.build().unwrap();
    let draw = |seed| {
        let mut rng = StdRng::seed_from_u64(seed);
        let graph = construct_pairwise_graph(&model, &MarginalProduct, &mut rng).unwrap();
        graph
            .vertices()
            .map(|v| v.sample().unwrap().assignment.values()[0])
            .collect::<Vec<_>>()
    };
    assert_eq!(draw(5), draw(5));
}
