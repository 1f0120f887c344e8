// ABOUTME: Error types for the book-source engine including ErrorCode enum and SourceError struct.
// ABOUTME: Provides categorized errors with convenience constructors and boolean helpers.

use std::fmt;

/// Error codes representing the categories of book-source failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidSourceConfig,
    InvalidUrl,
    FetchFailed,
    UnexpectedContentType,
    NoAudioRuleMatched,
    Cancelled,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::InvalidSourceConfig => "invalid source config",
            ErrorCode::InvalidUrl => "invalid URL",
            ErrorCode::FetchFailed => "fetch failed",
            ErrorCode::UnexpectedContentType => "unexpected content type",
            ErrorCode::NoAudioRuleMatched => "no audio rule matched",
            ErrorCode::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// The error type for every fallible engine operation.
///
/// `url` is the URL being processed when the failure happened (empty for
/// configuration errors raised before any request), `op` names the
/// operation (`Search`, `GetChapters`, `GetAudioUrl`, `Fetch`,
/// `AddSubscription`, ...).
#[derive(Debug, thiserror::Error)]
pub struct SourceError {
    pub code: ErrorCode,
    pub url: String,
    pub op: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "booksource: {} {}: {}", self.op, self.url, self.code)?;
        if let Some(ref src) = self.source {
            write!(f, ": {}", src)?;
        }
        Ok(())
    }
}

impl SourceError {
    fn new(
        code: ErrorCode,
        url: impl Into<String>,
        op: impl Into<String>,
        source: Option<anyhow::Error>,
    ) -> Self {
        Self {
            code,
            url: url.into(),
            op: op.into(),
            source,
        }
    }

    /// Create an InvalidSourceConfig error.
    pub fn invalid_config(
        url: impl Into<String>,
        op: impl Into<String>,
        source: Option<anyhow::Error>,
    ) -> Self {
        Self::new(ErrorCode::InvalidSourceConfig, url, op, source)
    }

    /// Create an InvalidUrl error.
    pub fn invalid_url(
        url: impl Into<String>,
        op: impl Into<String>,
        source: Option<anyhow::Error>,
    ) -> Self {
        Self::new(ErrorCode::InvalidUrl, url, op, source)
    }

    /// Create a FetchFailed error.
    pub fn fetch(
        url: impl Into<String>,
        op: impl Into<String>,
        source: Option<anyhow::Error>,
    ) -> Self {
        Self::new(ErrorCode::FetchFailed, url, op, source)
    }

    /// Create an UnexpectedContentType error.
    pub fn content_type(
        url: impl Into<String>,
        op: impl Into<String>,
        source: Option<anyhow::Error>,
    ) -> Self {
        Self::new(ErrorCode::UnexpectedContentType, url, op, source)
    }

    /// Create a NoAudioRuleMatched error.
    pub fn no_audio(
        url: impl Into<String>,
        op: impl Into<String>,
        source: Option<anyhow::Error>,
    ) -> Self {
        Self::new(ErrorCode::NoAudioRuleMatched, url, op, source)
    }

    /// Create a Cancelled error.
    pub fn cancelled(url: impl Into<String>, op: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::Cancelled,
            url,
            op,
            Some(anyhow::anyhow!("request aborted by caller")),
        )
    }

    /// Re-tag this error with the operation that surfaced it, keeping code, URL and cause.
    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = op.into();
        self
    }

    /// Returns true if this is an InvalidSourceConfig error.
    pub fn is_invalid_config(&self) -> bool {
        self.code == ErrorCode::InvalidSourceConfig
    }

    /// Returns true if this is an InvalidUrl error.
    pub fn is_invalid_url(&self) -> bool {
        self.code == ErrorCode::InvalidUrl
    }

    /// Returns true if this is a FetchFailed error.
    pub fn is_fetch(&self) -> bool {
        self.code == ErrorCode::FetchFailed
    }

    /// Returns true if this is an UnexpectedContentType error.
    pub fn is_content_type(&self) -> bool {
        self.code == ErrorCode::UnexpectedContentType
    }

    /// Returns true if this is a NoAudioRuleMatched error.
    pub fn is_no_audio(&self) -> bool {
        self.code == ErrorCode::NoAudioRuleMatched
    }

    /// Returns true if this is a Cancelled error.
    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_op_url_code_and_cause() {
        let err = SourceError::fetch(
            "http://s/x",
            "Search",
            Some(anyhow::anyhow!("HTTP status 500")),
        );
        assert_eq!(
            err.to_string(),
            "booksource: Search http://s/x: fetch failed: HTTP status 500"
        );
    }

    #[test]
    fn display_without_cause() {
        let err = SourceError::invalid_config("", "GetChapters", None);
        assert_eq!(err.to_string(), "booksource: GetChapters : invalid source config");
    }

    #[test]
    fn helpers_match_codes() {
        assert!(SourceError::invalid_config("", "op", None).is_invalid_config());
        assert!(SourceError::invalid_url("", "op", None).is_invalid_url());
        assert!(SourceError::content_type("", "op", None).is_content_type());
        assert!(SourceError::no_audio("", "op", None).is_no_audio());
        assert!(SourceError::cancelled("", "op").is_cancelled());
        assert!(!SourceError::cancelled("", "op").is_fetch());
    }

    #[test]
    fn with_op_keeps_code() {
        let err = SourceError::fetch("u", "Fetch", None).with_op("GetAudioUrl");
        assert_eq!(err.op, "GetAudioUrl");
        assert_eq!(err.code, ErrorCode::FetchFailed);
    }
}
