//! Errors reported by handlers and how the dispatcher classifies them.

use std::fmt;

/// ErrorKind decides the route a failed message takes.
///
/// - Transient: retry through the delay queue (requeue = true)
/// - Permanent: retry cannot help; ack and drop (requeue = false)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => f.write_str("transient"),
            ErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// HandlerError is the business error a handler returns.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} handler error: {message}")]
pub struct HandlerError {
    kind: ErrorKind,
    message: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Retry later, subject to the message's attempt/time budget.
    pub fn retry(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// Drop the message.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}
