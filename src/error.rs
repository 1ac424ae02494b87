//! Error types for the connection layer.

use crate::cursor::ResultCursor;
use crate::diagnostic::Diagnostic;
use crate::link::{FailureKind, LinkFailure};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the connection layer.
#[derive(Debug, Error)]
pub enum LdapError {
    /// The link could not be established or was lost. Never retried here.
    #[error("connection failed: {0}")]
    Connection(Diagnostic),

    /// Credentials rejected or the bind primitive failed.
    #[error("bind failed: {0}")]
    Bind(Diagnostic),

    /// A directory operation returned a failure.
    #[error("{operation} failed: {diagnostic}")]
    Operation {
        operation: &'static str,
        diagnostic: Diagnostic,
    },

    /// API misuse: closed or rewound cursor, TLS outside the connected state.
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },
}

pub type Result<T, E = LdapError> = std::result::Result<T, E>;

impl LdapError {
    pub fn connection(failure: &LinkFailure) -> Self {
        LdapError::Connection(Diagnostic::from_failure(failure))
    }

    pub fn bind(failure: &LinkFailure) -> Self {
        LdapError::Bind(Diagnostic::from_failure(failure))
    }

    pub fn operation(operation: &'static str, failure: &LinkFailure) -> Self {
        LdapError::Operation {
            operation,
            diagnostic: Diagnostic::from_failure(failure),
        }
    }

    /// `Connection` when the link itself failed, `Operation` for a server verdict.
    pub fn from_link(operation: &'static str, failure: &LinkFailure) -> Self {
        match failure.kind {
            FailureKind::Transport => Self::connection(failure),
            FailureKind::Server => Self::operation(operation, failure),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        LdapError::InvalidState {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        LdapError::Config {
            message: message.into(),
        }
    }

    /// Decoded diagnostic, for the variants that carry one.
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            LdapError::Connection(d) | LdapError::Bind(d) => Some(d),
            LdapError::Operation { diagnostic, .. } => Some(diagnostic),
            _ => None,
        }
    }

    /// Decoded code (hex sub-code or numeric result code), if any.
    pub fn code(&self) -> Option<&str> {
        self.diagnostic().and_then(Diagnostic::code)
    }

    pub fn is_bind(&self) -> bool {
        matches!(self, LdapError::Bind(_))
    }

    /// Short label used in metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LdapError::Connection(_) => "connection",
            LdapError::Bind(_) => "bind",
            LdapError::Operation { .. } => "operation",
            LdapError::InvalidState { .. } => "invalid_state",
            LdapError::Config { .. } => "config",
            LdapError::Timeout { .. } => "timeout",
            LdapError::Cancelled { .. } => "cancelled",
        }
    }
}

/// A failed search, with whatever pages arrived before the failure.
pub struct SearchError {
    pub error: LdapError,
    pub partial: Option<ResultCursor>,
}

impl SearchError {
    pub fn new(error: LdapError) -> Self {
        Self {
            error,
            partial: None,
        }
    }

    pub fn with_partial(error: LdapError, partial: ResultCursor) -> Self {
        Self {
            error,
            partial: Some(partial),
        }
    }

    /// Records retrieved before the failure (zero when none arrived).
    pub fn partial_count(&self) -> usize {
        self.partial.as_ref().map(ResultCursor::count).unwrap_or(0)
    }

    pub fn into_parts(self) -> (LdapError, Option<ResultCursor>) {
        (self.error, self.partial)
    }
}

impl fmt::Debug for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchError")
            .field("error", &self.error)
            .field("partial_count", &self.partial_count())
            .finish()
    }
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(partial) = &self.partial {
            write!(f, " ({} entries retrieved before the failure)", partial.count())?;
        }
        Ok(())
    }
}

impl std::error::Error for SearchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<LdapError> for SearchError {
    fn from(error: LdapError) -> Self {
        SearchError::new(error)
    }
}

/// Discards the partial results.
impl From<SearchError> for LdapError {
    fn from(err: SearchError) -> Self {
        err.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_display_and_code() {
        let err = LdapError::bind(&LinkFailure::server(49, "52e: 80090308: LdapErr"));
        assert!(err.is_bind());
        assert_eq!(err.code(), Some("52e"));
        assert_eq!(err.to_string(), "bind failed: 52e: 80090308: LdapErr (code 52e)");
    }

    #[test]
    fn test_operation_error_carries_name() {
        let err = LdapError::operation("delete", &LinkFailure::server(32, ""));
        assert_eq!(err.to_string(), "delete failed: No such object (code 32)");
        assert_eq!(err.code(), Some("32"));
    }

    #[test]
    fn test_from_link_splits_transport_and_server() {
        let lost = LdapError::from_link("modify", &LinkFailure::transport("connection reset"));
        assert!(matches!(lost, LdapError::Connection(_)));
        assert_eq!(lost.kind(), "connection");
        let verdict = LdapError::from_link("modify", &LinkFailure::server(50, ""));
        assert!(matches!(verdict, LdapError::Operation { operation: "modify", .. }));
    }

    #[test]
    fn test_invalid_state_has_no_diagnostic() {
        let err = LdapError::invalid_state("cursor closed");
        assert!(err.diagnostic().is_none());
        assert_eq!(err.to_string(), "invalid state: cursor closed");
    }

    #[test]
    fn test_search_error_without_partial() {
        let err = SearchError::new(LdapError::config("bad"));
        assert_eq!(err.partial_count(), 0);
        let inner: LdapError = err.into();
        assert!(matches!(inner, LdapError::Config { .. }));
    }
}
