//! Demonstration driver: builds a square grid model with Ising-style
//! couplings, converts it into a pairwise graph and runs one threaded sweep
//! with a diagnostic block sampler that redraws every member uniformly.
//!
//! Settings are read from `blockgibbs.*` and `BLOCKGIBBS_*` (see
//! `settings.rs`); log verbosity follows `RUST_LOG`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rusqlite::Connection;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use blockgibbs::error::Result;
use blockgibbs::factor::{Domain, Factor, Variable};
use blockgibbs::graph::Graph;
use blockgibbs::model::{FactorizedModel, ModelBuilder};
use blockgibbs::pairwise::construct_pairwise_graph;
use blockgibbs::persist::Persistor;
use blockgibbs::settings::Settings;
use blockgibbs::tree::{Block, Passive};
use blockgibbs::workers::{run_sweep, CancelToken, SweepOptions};

pub fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    if let Err(e) = run() {
        error!(error = %e, "blockgibbs failed");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let settings = Settings::load()?;
    info!(?settings, "settings loaded");
    let mut rng = StdRng::seed_from_u64(settings.seed);

    let model = grid_model(settings.grid_size, settings.coupling, &mut rng)?;
    let graph = construct_pairwise_graph(&model, &settings.edge_factor, &mut rng)?;

    let seed = settings.seed;
    let sampler = move |graph: &Graph, block: &Block| -> Result<()> {
        for vertex in block.iter() {
            let data = graph.vertex(vertex);
            let mut rng = StdRng::seed_from_u64(seed ^ (u64::from(vertex) << 32) ^ data.update_count());
            data.sample()?.assignment.uniform_sample(&mut rng);
        }
        Ok(())
    };
    let report = run_sweep(
        &graph,
        &Passive,
        &sampler,
        &SweepOptions::from(&settings),
        &CancelToken::new(),
    )?;
    if let Some((fewest, most)) = graph.min_max_updates() {
        info!(blocks = report.blocks, fewest, most, "vertex updates");
    }

    if let Some(path) = &settings.checkpoint {
        let connection = Connection::open(path)?;
        let mut persistor = Persistor::new(&connection)?;
        let id = persistor.checkpoint(&model, &graph)?;
        info!(checkpoint = id, path = %path, "graph checkpointed");
    }
    Ok(())
}

// One binary variable per cell, a random field on every cell and a coupling
// factor between horizontal and vertical neighbors.
fn grid_model(size: u32, coupling: f64, rng: &mut StdRng) -> Result<FactorizedModel> {
    let cell = |row: u32, col: u32| Variable::new(row * size + col, 2);
    let mut builder = ModelBuilder::new();
    for row in 0..size {
        for col in 0..size {
            let here = cell(row, col);
            builder.name_variable(here, format!("cell_{row}_{col}"));
            let field: f64 = rng.gen_range(-0.1..0.1);
            builder.add_factor(Factor::from_table(Domain::unary(here), vec![field, -field])?);
            let mut neighbors = Vec::with_capacity(2);
            if col + 1 < size {
                neighbors.push(cell(row, col + 1));
            }
            if row + 1 < size {
                neighbors.push(cell(row + 1, col));
            }
            for there in neighbors {
                builder.add_factor(Factor::from_table(
                    Domain::new([here, there])?,
                    vec![coupling, -coupling, -coupling, coupling],
                )?);
            }
        }
    }
    builder.build()
}
