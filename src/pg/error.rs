//! Error types for the PostgreSQL protocol implementation.
//!
//! Every failure carries a tag telling the caller whether the session is
//! still usable. Timeouts, disconnects and transport errors force the
//! session closed; everything else is local to the operation that raised it.

use std::collections::HashMap;
use std::fmt;
use std::io;

use thiserror::Error;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Coarse classification of a [`PgError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Error reported by the server (ErrorResponse).
    Wire,
    /// A response deadline elapsed; the session was closed.
    Timeout,
    /// The transport failed or closed unexpectedly; the session was closed.
    Disconnect,
    /// A value could not be converted between two kinds.
    Coercion,
    /// A call or statement had the wrong shape (arity, parameter count, output row).
    Structural,
    /// Explicit disposal of a server-side resource failed.
    Disposal,
    /// The session was already closed.
    Closed,
    /// Protocol violations, authentication and unsupported features.
    Other,
}

/// Errors that can occur during PostgreSQL operations.
#[derive(Debug, Error)]
pub enum PgError {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (unexpected message, invalid format, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Server returned an error.
    #[error("{severity}: {message} ({code})")]
    Server {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
        position: Option<u32>,
    },

    /// Unsupported conversion between a source and a destination kind.
    #[error("Cannot coerce {from} to {to}")]
    Coercion { from: String, to: String },

    /// The server has no type with the requested identifier or name.
    #[error("Unknown type: {0}")]
    UnknownType(String),

    /// Malformed SQL text.
    #[error("{message} (offset {offset})")]
    Syntax { message: String, offset: usize },

    /// Escape function invoked with the wrong number of arguments.
    #[error("{0}")]
    Arity(String),

    /// Parameter count or output shape mismatch.
    #[error("{0}")]
    Structural(String),

    /// Timeout waiting for response.
    #[error("Operation timed out")]
    Timeout,

    /// Transport closed while a response was pending.
    #[error("Connection closed unexpectedly")]
    Disconnected,

    /// Connection is closed or in invalid state.
    #[error("Connection is closed")]
    Closed,

    /// Explicit disposal of a prepared statement or portal failed.
    #[error("Disposal of {name} failed: {reason}")]
    Disposal { name: String, reason: String },

    /// Feature not supported by this client.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl PgError {
    /// Build a server error from ErrorResponse fields.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        PgError::Server {
            severity: fields.get(&b'S').cloned().unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
            position: fields.get(&b'P').and_then(|p| p.parse().ok()),
        }
    }

    pub fn coercion(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        PgError::Coercion {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn syntax(message: impl Into<String>, offset: usize) -> Self {
        PgError::Syntax {
            message: message.into(),
            offset,
        }
    }

    pub fn severity_class(&self) -> ErrorClass {
        match self {
            PgError::Server { .. } => ErrorClass::Wire,
            PgError::Timeout => ErrorClass::Timeout,
            PgError::Io(_) | PgError::Disconnected => ErrorClass::Disconnect,
            PgError::Coercion { .. } | PgError::UnknownType(_) => ErrorClass::Coercion,
            PgError::Syntax { .. } | PgError::Arity(_) | PgError::Structural(_) => {
                ErrorClass::Structural
            }
            PgError::Disposal { .. } => ErrorClass::Disposal,
            PgError::Closed => ErrorClass::Closed,
            PgError::Protocol(_) | PgError::Auth(_) | PgError::Unsupported(_) => {
                ErrorClass::Other
            }
        }
    }

    /// True when the session can no longer be used after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.severity_class(),
            ErrorClass::Timeout | ErrorClass::Disconnect | ErrorClass::Closed
        )
    }

    /// SQLSTATE code for server errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server { code, .. } => Some(code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_from_fields() {
        let mut fields = HashMap::new();
        fields.insert(b'S', "ERROR".to_string());
        fields.insert(b'C', "42P01".to_string());
        fields.insert(b'M', "relation \"foo\" does not exist".to_string());
        fields.insert(b'P', "15".to_string());

        let err = PgError::from_fields(&fields);
        assert_eq!(err.code(), Some("42P01"));
        assert_eq!(err.severity_class(), ErrorClass::Wire);
        assert!(!err.is_fatal());
        match err {
            PgError::Server { position, .. } => assert_eq!(position, Some(15)),
            _ => panic!("expected server error"),
        }
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PgError::Timeout.is_fatal());
        assert!(PgError::Disconnected.is_fatal());
        assert!(PgError::Closed.is_fatal());
        assert!(PgError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone")).is_fatal());

        assert!(!PgError::coercion("text", "int4").is_fatal());
        assert!(!PgError::Arity("x".into()).is_fatal());
        assert!(!PgError::syntax("Unterminated comment", 3).is_fatal());
    }

    #[test]
    fn test_display_names_both_kinds() {
        let err = PgError::coercion("bytea", "int4");
        assert_eq!(err.to_string(), "Cannot coerce bytea to int4");
    }
}
