use thiserror::Error;

/// Errors raised at the ingestion boundary.
///
/// All variants are non-fatal: malformed input is rejected synchronously and
/// counted, the engine keeps running.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("invalid sample: {reason}")]
    InvalidSample { reason: &'static str },

    #[error("invalid span: {reason}")]
    InvalidSpan { reason: &'static str },

    #[error("engine is stopped")]
    Stopped,
}
