//! The error taxonomy shared by every pipeline subsystem.
//!
//! Mirrors the original implementation's exception hierarchy
//! (`MBadDataFieldRequest`, `MInitialisationError`, `MKeyError`,
//! `MValueError`, `MMemoryError`, `MGribError`) as a single flat enum,
//! following the manual `Display`/`Error` idiom this workspace's teacher
//! uses for its own error types rather than pulling in a derive macro
//! crate for six variants.
use std::fmt;

/// Errors that can occur anywhere in the pipeline, cache, scheduler, or
/// orchestrator.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineError {
    /// A component's resources (readers, GPU programs, font atlases) could
    /// not be acquired. Fatal to the owning component, recoverable by
    /// disabling the feature.
    Initialization(String),
    /// A request was missing a source's required keys and no pass-through
    /// was defined.
    BadRequest(String),
    /// A request referenced an unknown data source id or variable.
    Key(String),
    /// A request contained a syntactically well-formed but semantically
    /// invalid parameter.
    Value(String),
    /// The cache could not satisfy an admission because all items are
    /// active, or a companion reference could not be re-established.
    Memory(String),
    /// A wrapped file/format error from an upstream reader.
    Io(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Initialization(msg) => write!(f, "initialization error: {}", msg),
            PipelineError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            PipelineError::Key(msg) => write!(f, "key error: {}", msg),
            PipelineError::Value(msg) => write!(f, "value error: {}", msg),
            PipelineError::Memory(msg) => write!(f, "memory error: {}", msg),
            PipelineError::Io(msg) => write!(f, "io error: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}
