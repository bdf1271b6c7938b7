//! Threaded scheduler driving the tree protocol over a graph.
//!
//! A sweep runs a fixed number of scoped worker threads that share one queue
//! of [`Work`] items. Workers never block on each other beyond the queue
//! lock: a lost claim is counted and dropped, and every step of the protocol
//! returns the follow-up work it produced. Whenever a tree completes, the
//! [`BlockSampler`] is handed the block, the tree is released and its
//! members are queued as new roots. Cancellation is cooperative through a
//! [`CancelToken`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::error::{BlockGibbsError, Result};
use crate::graph::{Graph, VertexId};
use crate::settings::Settings;
use crate::tree::{Block, Calibrator, GrowthPolicy, TreeProtocol};

/// Cancellation token shared with the worker threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self { Self::default() }
    pub fn cancel(&self) { self.0.store(true, Ordering::SeqCst); }
    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::Relaxed) }
}

/// One unit of scheduled work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Work {
    /// Try to start a new tree at the vertex.
    Root(VertexId),
    /// Advance a claimed candidate.
    Update(VertexId),
}

/// Consumes calibrated blocks, typically by drawing a joint sample for all
/// of their members. Called concurrently for disjoint blocks.
pub trait BlockSampler: Sync {
    fn sample_block(&self, graph: &Graph, block: &Block) -> Result<()>;
}

impl<F> BlockSampler for F
where
    F: Fn(&Graph, &Block) -> Result<()> + Sync,
{
    fn sample_block(&self, graph: &Graph, block: &Block) -> Result<()> {
        self(graph, block)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepOptions {
    pub workers: usize,
    /// The sweep ends once this many blocks have been sampled.
    pub max_blocks: usize,
    pub growth: GrowthPolicy,
}
impl Default for SweepOptions {
    fn default() -> Self {
        Self { workers: 4, max_blocks: 1000, growth: GrowthPolicy::default() }
    }
}
impl From<&Settings> for SweepOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            workers: settings.workers,
            max_blocks: settings.max_blocks,
            growth: settings.growth(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub blocks: usize,
    /// Sum of the sizes of all sampled blocks.
    pub sampled_vertices: u64,
    /// Root claims that found the vertex already owned.
    pub lost_claims: u64,
    /// Times the whole graph was seeded with roots.
    pub passes: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

struct Sweep<'a> {
    protocol: TreeProtocol<'a>,
    sampler: &'a dyn BlockSampler,
    cancel: &'a CancelToken,
    max_blocks: usize,
    queue: Mutex<VecDeque<Work>>,
    // queued plus in-flight items
    outstanding: AtomicUsize,
    blocks: AtomicUsize,
    sampled: AtomicU64,
    lost: AtomicU64,
    stop: AtomicBool,
}

impl<'a> Sweep<'a> {
    fn push(&self, work: impl IntoIterator<Item = Work>) -> Result<()> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|e| BlockGibbsError::Lock(format!("work queue: {e}")))?;
        let before = queue.len();
        queue.extend(work);
        self.outstanding.fetch_add(queue.len() - before, Ordering::SeqCst);
        Ok(())
    }

    fn pop(&self) -> Result<Option<Work>> {
        Ok(self
            .queue
            .lock()
            .map_err(|e| BlockGibbsError::Lock(format!("work queue: {e}")))?
            .pop_front())
    }

    // Roots in ascending update count, so the least sampled vertices get the
    // first chance to root a tree.
    fn seed(&self, vertices: impl IntoIterator<Item = VertexId>) -> Result<()> {
        let graph = self.protocol.graph();
        let mut roots: Vec<VertexId> = vertices.into_iter().collect();
        roots.sort_by_key(|v| (graph.vertex(*v).update_count(), *v));
        self.push(roots.into_iter().map(Work::Root))
    }

    fn halted(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    fn work(&self) -> Result<()> {
        loop {
            if self.halted() {
                return Ok(());
            }
            match self.pop()? {
                Some(work) => {
                    let result = self.process(work);
                    // after process, so the items it queued are already counted
                    self.outstanding.fetch_sub(1, Ordering::SeqCst);
                    result?;
                }
                None if self.outstanding.load(Ordering::SeqCst) == 0 => return Ok(()),
                None => thread::yield_now(),
            }
        }
    }

    fn process(&self, work: Work) -> Result<()> {
        let progress = match work {
            Work::Root(root) => match self.protocol.start_root(root) {
                Some(progress) => progress,
                None => {
                    self.lost.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
            },
            Work::Update(vertex) => self.protocol.update(vertex),
        };
        self.push(progress.schedule.into_iter().map(Work::Update))?;
        if let Some(root) = progress.completed {
            self.finish_tree(root)?;
        }
        Ok(())
    }

    fn finish_tree(&self, root: VertexId) -> Result<()> {
        let Ok(previous) = self
            .blocks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_blocks).then_some(n + 1)
            })
        else {
            // the tree stays owned until the sweep resets the graph
            self.stop.store(true, Ordering::SeqCst);
            return Ok(());
        };
        let graph = self.protocol.graph();
        let block = self.protocol.collect_block(root);
        self.sampler.sample_block(graph, &block)?;
        for vertex in block.iter() {
            graph.vertex(vertex).record_update();
        }
        self.sampled.fetch_add(block.len(), Ordering::Relaxed);
        let block = self.protocol.release_tree(root)?;
        trace!(root, size = block.len(), depth = block.depth(), "block sampled");
        if previous + 1 >= self.max_blocks {
            self.stop.store(true, Ordering::SeqCst);
            return Ok(());
        }
        self.seed(block.iter())
    }
}

/// Samples blocks until `options.max_blocks` have been drawn, the token is
/// cancelled or a sampler fails. Whenever the sweep stops early the graph is
/// forcibly reset, so every vertex is AVAILABLE again when this returns.
pub fn run_sweep(
    graph: &Graph,
    calibrator: &dyn Calibrator,
    sampler: &dyn BlockSampler,
    options: &SweepOptions,
    cancel: &CancelToken,
) -> Result<SweepReport> {
    if options.workers == 0 {
        return Err(BlockGibbsError::Config("a sweep needs at least one worker".into()));
    }
    let start = Instant::now();
    let sweep = Sweep {
        protocol: TreeProtocol::with_calibrator(graph, options.growth, calibrator),
        sampler,
        cancel,
        max_blocks: options.max_blocks,
        queue: Mutex::new(VecDeque::new()),
        outstanding: AtomicUsize::new(0),
        blocks: AtomicUsize::new(0),
        sampled: AtomicU64::new(0),
        lost: AtomicU64::new(0),
        stop: AtomicBool::new(false),
    };

    let mut passes = 0;
    let outcome = loop {
        if sweep.halted()
            || graph.num_vertices() == 0
            || sweep.blocks.load(Ordering::SeqCst) >= options.max_blocks
        {
            break Ok(());
        }
        if let Err(e) = sweep.seed(0..graph.num_vertices() as VertexId) {
            break Err(e);
        }
        passes += 1;
        let result = thread::scope(|s| {
            let handles: Vec<_> = (0..options.workers)
                .map(|_| {
                    s.spawn(|| {
                        let result = sweep.work();
                        if result.is_err() {
                            sweep.stop.store(true, Ordering::SeqCst);
                        }
                        result
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(BlockGibbsError::Invariant("sweep worker panicked".into()))
                    })
                })
                .fold(Ok(()), |acc, r| acc.and(r))
        });
        debug!(pass = passes, blocks = sweep.blocks.load(Ordering::SeqCst), "pass finished");
        if let Err(e) = result {
            break Err(e);
        }
    };

    // no claims are in flight once the workers are joined
    let interrupted = outcome.is_err() || sweep.halted();
    if interrupted {
        if let Ok(mut queue) = sweep.queue.lock() {
            queue.clear();
        }
        sweep.protocol.reset_all();
    }
    outcome?;

    let report = SweepReport {
        blocks: sweep.blocks.load(Ordering::SeqCst),
        sampled_vertices: sweep.sampled.load(Ordering::SeqCst),
        lost_claims: sweep.lost.load(Ordering::SeqCst),
        passes,
        cancelled: cancel.is_cancelled(),
        elapsed: start.elapsed(),
    };
    info!(
        blocks = report.blocks,
        sampled = report.sampled_vertices,
        lost_claims = report.lost_claims,
        passes = report.passes,
        cancelled = report.cancelled,
        ms = report.elapsed.as_millis() as u64,
        "sweep finished"
    );
    Ok(report)
}
