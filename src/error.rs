//! Application error taxonomy.
//!
//! Every failure that crosses a component boundary is one of these variants.
//! Transient and Permanent stay contained within a task (surfaced as
//! `TaskFailed` + `last_error` after retry exhaustion); Conflict and NotFound
//! surface to HTTP/WebSocket callers as structured errors with stable codes;
//! Fatal aborts the campaign and drains the pool. No stack traces cross the
//! process boundary.

use crate::driver::DriverError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Malformed input, rejected at the boundary.
    #[error("{0}")]
    Validation(String),

    /// Entity id unknown.
    #[error("{0} not found")]
    NotFound(String),

    /// Illegal state transition (e.g. starting an already-running campaign).
    #[error("{0}")]
    Conflict(String),

    /// Network / timeout / driver crash — retriable within a task.
    #[error("{0}")]
    Transient(String),

    /// Unrecoverable extraction failure for a task.
    #[error("{0}")]
    Permanent(String),

    /// Malformed WebSocket envelope.
    #[error("{0}")]
    Protocol(String),

    /// Pool initialization exhaustion, storage unavailable, and the like.
    #[error("{0}")]
    Fatal(String),
}

impl Error {
    /// Stable machine-readable code, part of the HTTP/WS contract.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Transient(_) => "transient",
            Error::Permanent(_) => "permanent",
            Error::Protocol(_) => "protocol_error",
            Error::Fatal(_) => "fatal",
        }
    }

    /// True for failures a task may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Transient(m) => Error::Transient(m),
            DriverError::Crashed(m) => Error::Transient(format!("driver session crashed: {m}")),
            DriverError::Permanent(m) => Error::Permanent(m),
            DriverError::Cancelled => Error::Transient("driver operation cancelled".into()),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("row".into()),
            other => Error::Fatal(format!("storage error: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let cases = [
            (Error::Validation("x".into()), "validation_error"),
            (Error::NotFound("campaign".into()), "not_found"),
            (Error::Conflict("x".into()), "conflict"),
            (Error::Transient("x".into()), "transient"),
            (Error::Permanent("x".into()), "permanent"),
            (Error::Protocol("x".into()), "protocol_error"),
            (Error::Fatal("x".into()), "fatal"),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn not_found_message_names_the_entity() {
        let err = Error::NotFound("campaign 01ARZ".into());
        assert_eq!(err.to_string(), "campaign 01ARZ not found");
    }

    #[test]
    fn driver_errors_map_onto_taxonomy() {
        assert!(Error::from(DriverError::Transient("timeout".into())).is_transient());
        assert!(Error::from(DriverError::Crashed("gone".into())).is_transient());
        assert!(matches!(
            Error::from(DriverError::Permanent("selector missing".into())),
            Error::Permanent(_)
        ));
    }

    #[test]
    fn sqlx_row_not_found_maps_to_not_found() {
        assert!(matches!(
            Error::from(sqlx::Error::RowNotFound),
            Error::NotFound(_)
        ));
    }
}
