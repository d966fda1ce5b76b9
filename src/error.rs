use thiserror::Error;

/// Errors surfaced by the analytic core. The batch entry points recover from
/// most of these locally (degraded vectors, detector fallback); they escape
/// only when a whole run cannot produce a result.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid month key `{0}` (expected YYYY-MM)")]
    InvalidMonth(String),

    #[error("feature matrix is degenerate: {0}")]
    DegenerateMatrix(String),

    #[error("empty input: {0}")]
    EmptyInput(String),

    #[error("aggregate source read failed: {0}")]
    SourceRead(String),
}
