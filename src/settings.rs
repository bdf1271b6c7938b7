//! Runtime settings, layered from built-in defaults, an optional
//! `blockgibbs.{toml,json,yaml,...}` file and `BLOCKGIBBS_*` environment
//! variables (later layers win).

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{BlockGibbsError, Result};
use crate::pairwise::EdgeFactorKind;
use crate::tree::{AdmissionPolicy, GrowthPolicy, MAX_TREE_HEIGHT};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    /// Number of sampling threads.
    pub workers: usize,
    /// Blocks to sample before a sweep ends.
    pub max_blocks: usize,
    pub admission: AdmissionPolicy,
    /// Unbounded when absent.
    pub max_height: Option<u32>,
    pub edge_factor: EdgeFactorKind,
    pub seed: u64,
    /// SQLite file checkpoints are written to; none are taken when absent.
    pub checkpoint: Option<String>,
    /// Side length of the square grid model built by the binary.
    pub grid_size: u32,
    /// Coupling strength of neighboring grid cells.
    pub coupling: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 4,
            max_blocks: 1000,
            admission: AdmissionPolicy::Greedy,
            max_height: None,
            edge_factor: EdgeFactorKind::MarginalProduct,
            seed: 42,
            checkpoint: None,
            grid_size: 32,
            coupling: 0.5,
        }
    }
}

impl Settings {
    /// Reads `blockgibbs.*` from the working directory if present.
    pub fn load() -> Result<Self> {
        Self::load_from("blockgibbs")
    }

    /// `file` is a path without extension, as understood by [`File::with_name`].
    pub fn load_from(file: &str) -> Result<Self> {
        let defaults = Settings::default();
        let settings: Settings = Config::builder()
            .set_default("workers", defaults.workers as u64)?
            .set_default("max_blocks", defaults.max_blocks as u64)?
            .set_default("admission", "greedy")?
            .set_default("edge_factor", "marginal_product")?
            .set_default("seed", defaults.seed)?
            .set_default("grid_size", u64::from(defaults.grid_size))?
            .set_default("coupling", defaults.coupling)?
            .add_source(File::with_name(file).required(false))
            .add_source(Environment::with_prefix("BLOCKGIBBS").try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(BlockGibbsError::Config("workers must be at least 1".into()));
        }
        if self.grid_size == 0 {
            return Err(BlockGibbsError::Config("grid_size must be at least 1".into()));
        }
        if let Some(height) = self.max_height {
            if height > MAX_TREE_HEIGHT {
                return Err(BlockGibbsError::Config(format!(
                    "max_height {height} exceeds {MAX_TREE_HEIGHT}"
                )));
            }
        }
        if !self.coupling.is_finite() {
            return Err(BlockGibbsError::Config("coupling must be finite".into()));
        }
        Ok(())
    }

    pub fn growth(&self) -> GrowthPolicy {
        GrowthPolicy {
            admission: self.admission,
            max_height: self.max_height,
        }
    }
}
