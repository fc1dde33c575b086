use thiserror::Error;

/// Errors produced while parsing ISO-BMFF boxes.
///
/// `BufferTooSmall` is the only recoverable variant: it tells the caller how
/// many bytes must be buffered before the same parse can succeed, so a fetcher
/// can widen its byte range and retry. Everything else is fatal for the
/// current segment.
#[derive(Debug, Error)]
pub enum BoxError {
    #[error("buffer too small, need at least {needed} bytes")]
    BufferTooSmall { needed: u64 },

    #[error("truncated box: {0}")]
    Truncated(&'static str),

    #[error("malformed box: {0}")]
    Malformed(String),

    #[error("unsupported box feature: {0}")]
    Unsupported(String),
}

impl BoxError {
    pub fn is_buffer_too_small(&self) -> bool {
        matches!(self, BoxError::BufferTooSmall { .. })
    }
}
