//! Error taxonomy of the analyzer.
//!
//! The measurement hot path never returns these: it only has guard clauses.
//! They surface from the control path (enable/disable, control surface,
//! initialization) and from the outer hook sources.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RtslError>;

#[derive(Debug, Error)]
pub enum RtslError {
    /// A hook could not be resolved by name or refused registration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Malformed write to the control surface.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The per-core table could not be allocated.
    #[error("Out of memory: cannot allocate {0} core records")]
    OutOfMemory(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A trace line could not be turned into an event.
    #[error("Malformed trace line: {0}")]
    Parse(String),
}
