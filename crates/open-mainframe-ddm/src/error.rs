//! DDM/DRDA error types.

use thiserror::Error;

/// Errors that can occur while reading, writing or driving DRDA traffic.
#[derive(Error, Debug)]
pub enum DrdaError {
    /// I/O error on the TCP connection outside of a flush or stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A write to the peer failed while flushing replies or streaming data.
    /// Always fatal for the connection.
    #[error("Communications failure in {context}: {source}")]
    CommunicationsFailure {
        /// Operation that was in progress.
        context: &'static str,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Malformed inbound DSS or DDM structure (reported back as SYNTAXRM).
    #[error("DDM syntax error 0x{code:02X}{}", code_point_suffix(.code_point))]
    Syntax {
        /// SYNERRCD value.
        code: u8,
        /// Code point being parsed, when known.
        code_point: Option<u16>,
    },

    /// Invalid DDM object received.
    #[error("Invalid DDM object: {0}")]
    InvalidDdm(String),

    /// Packed decimal conversion failed.
    #[error("Decimal conversion failed ({sqlstate}): {message}")]
    Decimal {
        /// SQLSTATE describing the failure.
        sqlstate: &'static str,
        /// Human-readable message.
        message: String,
    },

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A command failed after part of its reply had already been sent, so
    /// no error reply can replace it.
    #[error("Reply to command 0x{code_point:04X} aborted: {reason}")]
    ReplyAborted {
        /// Command being answered.
        code_point: u16,
        /// What went wrong.
        reason: String,
    },

    /// Connection closed by client.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl DrdaError {
    /// Build a syntax error without an associated code point.
    pub fn syntax(code: u8) -> Self {
        DrdaError::Syntax {
            code,
            code_point: None,
        }
    }

    /// Whether the error ends the connection without any further reply.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DrdaError::Io(_)
                | DrdaError::CommunicationsFailure { .. }
                | DrdaError::ReplyAborted { .. }
                | DrdaError::ConnectionClosed
        )
    }
}

fn code_point_suffix(code_point: &Option<u16>) -> String {
    code_point
        .map(|cp| format!(" at code point 0x{cp:04X}"))
        .unwrap_or_default()
}

/// Result type for DRDA operations.
pub type DrdaResult<T> = Result<T, DrdaError>;

/// Failures reported by a command handler while building a reply.
///
/// The driver discards whatever the handler wrote and replaces it with a
/// standard error reply; the connection stays usable.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The SQL engine rejected the request.
    #[error("SQL error {sqlcode} ({sqlstate}): {message}")]
    Sql {
        /// SQLCODE reported in the SQLCARD.
        sqlcode: i32,
        /// Five-character SQLSTATE.
        sqlstate: String,
        /// Message text for SQLERRMSG.
        message: String,
        /// Severity code for the SQLERRRM reply.
        svrcod: u16,
    },

    /// The command code point is not implemented by this server.
    #[error("Command 0x{0:04X} not supported")]
    NotSupported(u16),

    /// A protocol-level failure; fatal errors propagate, syntax errors are
    /// answered with SYNTAXRM.
    #[error(transparent)]
    Protocol(#[from] DrdaError),
}

impl CommandError {
    /// Build an SQL error with error severity.
    pub fn sql(sqlcode: i32, sqlstate: &str, message: impl Into<String>) -> Self {
        CommandError::Sql {
            sqlcode,
            sqlstate: sqlstate.to_string(),
            message: message.into(),
            svrcod: crate::code_points::SVRCOD_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_error_display_includes_code_point() {
        let err = DrdaError::Syntax {
            code: 0x0C,
            code_point: Some(0x146C),
        };
        assert_eq!(err.to_string(), "DDM syntax error 0x0C at code point 0x146C");
        assert_eq!(DrdaError::syntax(0x01).to_string(), "DDM syntax error 0x01");
    }

    #[test]
    fn fatal_classification() {
        assert!(DrdaError::ConnectionClosed.is_fatal());
        assert!(DrdaError::CommunicationsFailure {
            context: "flush",
            source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
        }
        .is_fatal());
        assert!(!DrdaError::syntax(0x03).is_fatal());
    }
}
