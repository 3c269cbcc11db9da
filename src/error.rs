//! Domain error taxonomy.
//!
//! Deliberately flat: validation failures (user-correctable, all collected
//! before reporting), lifecycle misuse, not-found lookups, and operational
//! failures from external collaborators. Each variant maps to the stable
//! `error_code` string carried in the HTTP envelope.

use axum::http::StatusCode;

/// What kind of record a failed lookup was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Request,
    Instance,
    Plan,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Request => write!(f, "request"),
            ResourceKind::Instance => write!(f, "instance"),
            ResourceKind::Plan => write!(f, "plan"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// One or more user-correctable input problems. All failures for a
    /// record are collected into the list before reporting.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// A lifecycle action was requested from a state that does not allow it.
    #[error("{0}")]
    InvalidState(String),

    #[error("{kind} not found: {key}")]
    NotFound { kind: ResourceKind, key: String },

    /// Subprocess, RPC, or container-runtime failure. The affected instance
    /// is moved to the `error` state by the caller.
    #[error(transparent)]
    Operational(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(kind: ResourceKind, key: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    pub fn operational(msg: impl Into<String>) -> Self {
        Error::Operational(anyhow::anyhow!(msg.into()))
    }

    /// Stable machine-readable code for the HTTP envelope.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::InvalidState(_) => "USER_ERROR",
            Error::NotFound { kind, .. } => match kind {
                ResourceKind::Request => "REQUEST_NOT_FOUND",
                ResourceKind::Instance => "INSTANCE_NOT_FOUND",
                ResourceKind::Plan => "PLAN_NOT_FOUND",
            },
            Error::Operational(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the envelope is delivered with.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::InvalidState(_) => StatusCode::CONFLICT,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Operational(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to API callers. Operational detail is not leaked.
    pub fn public_message(&self) -> String {
        match self {
            Error::Operational(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_joins_all_messages() {
        let e = Error::Validation(vec!["a".into(), "b".into()]);
        assert_eq!(e.to_string(), "validation failed: a; b");
        assert_eq!(e.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn not_found_codes_are_per_kind() {
        assert_eq!(
            Error::not_found(ResourceKind::Request, "REQ-1").error_code(),
            "REQUEST_NOT_FOUND"
        );
        assert_eq!(
            Error::not_found(ResourceKind::Instance, "acme").error_code(),
            "INSTANCE_NOT_FOUND"
        );
    }

    #[test]
    fn operational_detail_is_not_public() {
        let e = Error::operational("psql exited with code 2");
        assert_eq!(e.public_message(), "Internal server error");
        assert_eq!(e.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
