// Engine Errors
// Top-level error type aggregating graph, cache, workflow and sink failures

use crate::cache::store::CacheError;
use crate::execution::graph::GraphError;
use crate::sink::SinkError;
use crate::workflow::error::ParseError;

use std::io;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Workflow error: {0}")]
    Parse(#[from] ParseError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
