use thiserror::Error;

/// Configuration and state errors raised by the runners themselves.
///
/// Errors coming out of a flow engine are never mapped into this type; they
/// travel through `anyhow::Error` untouched.
#[derive(Debug, Error, PartialEq)]
pub enum RunnerError {
    #[error("task can be either of index or search (got '{found}')")]
    InvalidTask { found: String },

    #[error("documents is of wrong type: {found}")]
    InvalidDocuments { found: &'static str },

    #[error("request_size must be a positive integer")]
    InvalidRequestSize,

    #[error("eval_flow_index {index} does not resolve in a chain of {len} flows")]
    InvalidEvalIndex { index: isize, len: usize },

    #[error("a flow chain needs at least one member")]
    EmptyChain,

    #[error("no evaluation callback configured for this runner")]
    NoCallback,

    #[error("no completed trial to read evaluations from")]
    NotExecuted,

    #[error("evaluation callback saw no evaluated documents")]
    NoEvaluations,

    #[error("unresolved substitution variable '{name}' in flow definition")]
    UnresolvedVariable { name: String },
}
