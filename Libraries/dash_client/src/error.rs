use thiserror::Error;

/// Errors surfaced by the streaming client.
///
/// `Parse` and `Unsupported` are fatal to manifest handling and surface as a
/// prepare failure. `Box` wraps container-level errors; its BufferTooSmall
/// variant is recoverable and retried by the fetcher with a widened byte
/// range. `Io` is fatal to the fetcher that hit it.
#[derive(Debug, Error)]
pub enum DashError {
    #[error("manifest parse error: {0}")]
    Parse(String),

    #[error("unsupported manifest feature: {0}")]
    Unsupported(String),

    #[error("io error: {0}")]
    Io(String),

    #[error(transparent)]
    Box(#[from] mp4_box::BoxError),

    #[error("unresolvable URL template: {0}")]
    Template(String),

    #[error("session closed")]
    SessionClosed,
}

impl DashError {
    /// True for the transient "need more bytes" condition the fetcher retries
    /// silently with a larger byte range.
    pub fn needs_more_data(&self) -> bool {
        matches!(self, DashError::Box(e) if e.is_buffer_too_small())
    }
}

impl From<reqwest::Error> for DashError {
    fn from(e: reqwest::Error) -> Self {
        DashError::Io(e.to_string())
    }
}

impl From<quick_xml::Error> for DashError {
    fn from(e: quick_xml::Error) -> Self {
        DashError::Parse(e.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for DashError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        DashError::Parse(e.to_string())
    }
}

impl From<std::str::Utf8Error> for DashError {
    fn from(e: std::str::Utf8Error) -> Self {
        DashError::Parse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_buffer_too_small_is_retryable() {
        let short = DashError::Box(mp4_box::BoxError::BufferTooSmall { needed: 64 });
        assert!(short.needs_more_data());
        assert!(!DashError::SessionClosed.needs_more_data());
        assert!(!DashError::Io("404".into()).needs_more_data());
    }
}
