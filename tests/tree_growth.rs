use std::collections::BTreeSet;
use std::sync::{Barrier, Mutex};
use std::thread;

use rand::SeedableRng;
use rand::rngs::StdRng;

use blockgibbs::error::BlockGibbsError;
use blockgibbs::factor::{Domain, Factor, Variable};
use blockgibbs::graph::{Graph, VertexId};
use blockgibbs::model::ModelBuilder;
use blockgibbs::pairwise::{construct_pairwise_graph, UniformEdge};
use blockgibbs::tree::{
    AdmissionPolicy, Block, Calibrator, GrowthPolicy, MembershipView, TreeProtocol, TreeState,
};

// Binary variables 0..count joined by the given pairs.
fn graph(count: u32, pairs: &[(u32, u32)]) -> Graph {
    let mut builder = ModelBuilder::new();
    for id in 0..count {
        builder.add_factor(Factor::new(Domain::unary(Variable::new(id, 2))));
    }
    for &(a, b) in pairs {
        builder.add_factor(Factor::new(
            Domain::new([Variable::new(a, 2), Variable::new(b, 2)]).unwrap(),
        ));
    }
    let model = builder.build().unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    construct_pairwise_graph(&model, &UniformEdge, &mut rng).unwrap()
}

fn grid(size: u32) -> Graph {
    let mut pairs = Vec::new();
    for row in 0..size {
        for col in 0..size {
            let here = row * size + col;
            if col + 1 < size {
                pairs.push((here, here + 1));
            }
            if row + 1 < size {
                pairs.push((here, here + size));
            }
        }
    }
    graph(size * size, &pairs)
}

// Grows one tree to completion on the calling thread.
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

fn induced_edges(graph: &Graph, block: &Block) -> usize {
    graph
        .edges()
        .filter(|e| e.source() < e.target())
        .filter(|e| block.contains(e.source()) && block.contains(e.target()))
        .count()
}

#[test]
fn singleton_root_is_calibrated_at_once() {
    let g = graph(1, &[]);
    let protocol = TreeProtocol::new(&g, GrowthPolicy::default());
    let progress = protocol.start_root(0).unwrap();
    assert!(progress.schedule.is_empty());
    assert_eq!(progress.completed, Some(0));
    let membership = g.vertex(0).membership();
    assert_eq!(membership.state(), TreeState::Calibrated);
    assert_eq!(membership.pending_children(), 0);
    assert_eq!(protocol.collect_block(0).len(), 1);
}

#[test]
fn later_root_claim_finds_vertex_already_a_child() {
    let g = graph(3, &[(0, 1), (1, 2)]);
    let protocol = TreeProtocol::new(&g, GrowthPolicy::default());
    let progress = protocol.start_root(0).unwrap();
    assert_eq!(progress.schedule, vec![1]);
    // B was claimed on behalf of A before anyone tried it as a root
    assert!(protocol.start_root(1).is_none());
    let b = g.vertex(1).membership().load();
    assert_eq!(b.state, TreeState::Candidate);
    assert_eq!(b.parent, Some(0));
    assert_eq!(b.height, 1);

    let progress = protocol.update(1);
    assert_eq!(progress.schedule, vec![2]);
    assert_eq!(g.vertex(0).membership().pending_children(), 1);
    let progress = protocol.update(2);
    assert!(progress.schedule.is_empty());
    assert_eq!(progress.completed, Some(0));

    let block = protocol.collect_block(0);
    assert_eq!(block.iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(block.depth(), 2);
    assert_eq!(g.vertex(2).membership().parent(), Some(1));
}

#[test]
fn simultaneous_root_claims_have_one_winner() {
    let g = graph(3, &[(0, 1), (1, 2)]);
    let protocol = TreeProtocol::new(&g, GrowthPolicy::default());
    for _ in 0..200 {
        let barrier = Barrier::new(2);
        let wins = thread::scope(|s| {
            let claims: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        protocol.start_root(1).is_some()
                    })
                })
                .collect();
            claims
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count()
        });
        assert_eq!(wins, 1);
        protocol.reset_all();
    }
}

#[test]
fn concurrent_trees_partition_the_graph() {
    let g = grid(12);
    let protocol = TreeProtocol::new(&g, GrowthPolicy::default());
    let workers = 4;
    let count = g.num_vertices() as VertexId;
    let roots: Vec<VertexId> = thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|w| {
                let protocol = &protocol;
                s.spawn(move || {
                    // interleaved root lists, so workers collide all the time
                    (0..count)
                        .filter(|v| *v as usize % workers == w)
                        .filter_map(|v| grow(protocol, v))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let mut seen = BTreeSet::new();
    for &root in &roots {
        let block = protocol.collect_block(root);
        for vertex in block.iter() {
            assert!(seen.insert(vertex), "vertex {vertex} belongs to two trees");
            let view = g.vertex(vertex).membership().load();
            assert_eq!(view.state, TreeState::Calibrated);
            assert_eq!(g.vertex(vertex).membership().pending_children(), 0);
            if let Some(parent) = view.parent {
                assert!(block.contains(parent));
                assert!(g.find_edge(parent, vertex).is_some());
                assert_eq!(view.height, g.vertex(parent).membership().height() + 1);
            } else {
                assert_eq!(vertex, root);
            }
        }
    }
    // every vertex was offered as a root, so none is left behind
    assert_eq!(seen.len(), g.num_vertices());
}

struct Recorder(Mutex<Vec<VertexId>>);
impl Calibrator for Recorder {
    fn calibrate(&self, graph: &Graph, vertex: VertexId) {
        assert_eq!(graph.vertex(vertex).membership().pending_children(), 0);
        self.0.lock().unwrap().push(vertex);
    }
}

#[test]
fn children_calibrate_before_their_parent() {
    let g = grid(8);
    let recorder = Recorder(Mutex::new(Vec::new()));
    let protocol = TreeProtocol::with_calibrator(&g, GrowthPolicy::default(), &recorder);
    thread::scope(|s| {
        for w in 0..3u32 {
            let protocol = &protocol;
            s.spawn(move || {
                for v in (0..64).filter(|v| v % 3 == w) {
                    grow(protocol, v);
                }
            });
        }
    });
    let order = recorder.0.into_inner().unwrap();
    assert_eq!(order.len(), g.num_vertices());
    let position = |v: VertexId| order.iter().position(|x| *x == v).unwrap();
    for vertex in g.vertices() {
        if let Some(parent) = vertex.membership().parent() {
            assert!(position(vertex.id()) < position(parent));
        }
    }
}

#[test]
fn release_returns_every_member_to_available() {
    let g = grid(4);
    let protocol = TreeProtocol::new(&g, GrowthPolicy::default());
    assert_eq!(grow(&protocol, 5), Some(5));
    let block = protocol.release_tree(5).unwrap();
    assert_eq!(block.len(), 16);
    for vertex in g.vertices() {
        assert_eq!(vertex.membership().load(), MembershipView::AVAILABLE);
        assert_eq!(vertex.membership().pending_children(), 0);
    }
    assert!(g.edges().all(|e| !e.is_exploring()));
    // the released vertices can root a new tree
    assert_eq!(grow(&protocol, 0), Some(0));
}

#[test]
fn incomplete_tree_cannot_be_released() {
    let g = graph(3, &[(0, 1), (1, 2)]);
    let protocol = TreeProtocol::new(&g, GrowthPolicy::default());
    protocol.start_root(0).unwrap();
    let err = protocol.release_tree(0).unwrap_err();
    assert!(matches!(err, BlockGibbsError::Invariant(_)));
    assert_eq!(g.vertex(1).state(), TreeState::Candidate);
    // a non-root is refused as well
    assert!(protocol.release_tree(1).is_err());
}

#[test]
fn abandon_resets_a_tree_in_flight() {
    let g = graph(3, &[(0, 1), (1, 2)]);
    let protocol = TreeProtocol::new(&g, GrowthPolicy::default());
    protocol.start_root(0).unwrap();
    protocol.update(1);
    let block = protocol.abandon_tree(0);
    assert_eq!(block.len(), 3);
    for vertex in g.vertices() {
        assert_eq!(vertex.state(), TreeState::Available);
        assert_eq!(vertex.membership().pending_children(), 0);
    }
    // the forgotten candidate no longer advances
    assert_eq!(protocol.update(2), Default::default());
}

#[test]
fn acyclic_admission_keeps_blocks_induced_trees() {
    let square = graph(4, &[(0, 1), (1, 2), (2, 3), (0, 3)]);
    let greedy = TreeProtocol::new(&square, GrowthPolicy::default());
    grow(&greedy, 0);
    let block = greedy.collect_block(0);
    assert_eq!(block.len(), 4);
    assert_eq!(induced_edges(&square, &block), 4);
    greedy.reset_all();

    let policy = GrowthPolicy {
        admission: AdmissionPolicy::Acyclic,
        max_height: None,
    };
    let acyclic = TreeProtocol::new(&square, policy);
    assert_eq!(grow(&acyclic, 0), Some(0));
    let block = acyclic.collect_block(0);
    assert_eq!(induced_edges(&square, &block) as u64, block.len() - 1);

    let g = grid(10);
    let protocol = TreeProtocol::new(&g, policy);
    let roots: Vec<VertexId> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|w| {
                let protocol = &protocol;
                s.spawn(move || {
                    (0..100)
                        .filter(|v| v % 4 == w)
                        .filter_map(|v| grow(protocol, v))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });
    for root in roots {
        let block = protocol.collect_block(root);
        assert_eq!(induced_edges(&g, &block) as u64, block.len() - 1);
    }
    assert!(g.edges().all(|e| {
        !e.is_exploring() || g.vertex(e.target()).membership().parent() == Some(e.source())
    }));
}

#[test]
fn max_height_bounds_tree_depth() {
    let chain = graph(5, &[(0, 1), (1, 2), (2, 3), (3, 4)]);
    let policy = GrowthPolicy {
        admission: AdmissionPolicy::Greedy,
        max_height: Some(1),
    };
    let protocol = TreeProtocol::new(&chain, policy);
    assert_eq!(grow(&protocol, 1), Some(1));
    let block = protocol.collect_block(1);
    assert_eq!(block.iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(block.depth(), 1);
    assert_eq!(chain.vertex(3).state(), TreeState::Available);
}
