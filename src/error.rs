use thiserror::Error;

use crate::factor::VariableId;

#[derive(Error, Debug)]
pub enum BlockGibbsError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Data corruption: {message}")]
    DataCorruption { message: String },
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Model contract violated: {0}")]
    Contract(String),
    #[error("Variable {variable} is not registered in the model")]
    NotFound { variable: VariableId },
    #[error("Sampler error: {0}")]
    Sampler(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, BlockGibbsError>;

// Helper conversions
impl From<rusqlite::Error> for BlockGibbsError {
    fn from(e: rusqlite::Error) -> Self { Self::Persistence(e.to_string()) }
}
impl From<config::ConfigError> for BlockGibbsError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}
impl From<std::io::Error> for BlockGibbsError {
    fn from(e: std::io::Error) -> Self { Self::Persistence(e.to_string()) }
}
