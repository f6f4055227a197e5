//! Error types for the xpert-aggregator crate.

use http::StatusCode;
use thiserror::Error;

/// Whether a failed fetch is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Connection refused/reset, timeouts, 5xx responses.
    Transient,
    /// 4xx responses, malformed or unsupported URLs, missing files.
    Permanent,
}

/// Error returned when a subscription source could not be retrieved.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} fetch failure for {url}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub url: String,
    pub message: String,
}

impl FetchError {
    pub fn transient(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Transient,
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn permanent(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Permanent,
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FetchErrorKind::Transient
    }
}

/// Error produced while decoding a subscription payload or one of its lines.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    /// The payload or line is not in any recognised shape.
    #[error("malformed input at line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    /// The line uses a scheme outside the supported protocol set.
    #[error("unsupported scheme at line {line}: {scheme}")]
    Unsupported { line: usize, scheme: String },
}

/// Failure of a single reachability attempt.
#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("probe to {target} timed out")]
    Timeout { target: String },
    #[error("probe to {target} failed: {message}")]
    Connect { target: String, message: String },
}

/// Errors surfaced by a [`Store`](crate::store::Store) implementation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors that abort an aggregation cycle.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The commit failed; previously committed state is untouched.
    #[error("cycle commit failed: {0}")]
    Store(#[from] StoreError),
    /// The cycle was cancelled before reaching the commit step.
    #[error("cycle cancelled before commit")]
    Cancelled,
}

/// Errors returned by the operator-facing [`XpertPanel`](crate::panel::XpertPanel).
#[derive(Debug, Error)]
pub enum PanelError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// A previewed subscription URL could not be retrieved.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// A previewed subscription payload could not be decoded.
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl PanelError {
    /// HTTP status an API layer should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            PanelError::Validation(_) => StatusCode::BAD_REQUEST,
            PanelError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            PanelError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            PanelError::Store(StoreError::Unavailable(_))
            | PanelError::Engine(EngineError::Store(_)) => StatusCode::SERVICE_UNAVAILABLE,
            PanelError::Engine(EngineError::Cancelled) => StatusCode::CONFLICT,
            PanelError::Fetch(_) => StatusCode::BAD_GATEWAY,
            PanelError::Parse(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

/// Invalid value in the environment-driven configuration.
#[derive(Debug, Error)]
#[error("invalid value {value:?} for {var}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panel_errors_map_to_http_statuses() {
        assert_eq!(
            PanelError::Validation("name".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PanelError::from(StoreError::NotFound("source 9".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PanelError::from(StoreError::Conflict("url".into())).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            PanelError::from(EngineError::Store(StoreError::Unavailable("disk".into())))
                .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            PanelError::from(FetchError::permanent("https://x/", "HTTP 404")).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn fetch_error_kind_helpers() {
        assert!(FetchError::transient("u", "reset").is_transient());
        assert!(!FetchError::permanent("u", "HTTP 403").is_transient());
    }
}
