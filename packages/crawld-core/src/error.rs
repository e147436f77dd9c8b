//! The closed error taxonomy every component in this crate maps its own
//! errors onto, plus the `Categorizable` trait used to do the mapping.
//!
//! Mirrors seesaw's `Categorizable`/`SafeErrorCategory` split: component
//! errors stay concrete (`thiserror` enums with full context) for logging
//! and pattern matching, while `ErrorCategory` is the coarse classification
//! callers use to decide whether to retry, dead-letter, or surface as-is.

use std::borrow::Cow;
use std::fmt;

/// The closed set of error categories every component error maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    AlreadyExists,
    InvalidState,
    Validation,
    Auth,
    Unavailable,
    Timeout,
    Transport,
    Protocol,
    Parse,
    Duplicate,
    Internal,
}

impl ErrorCategory {
    /// Whether an error of this category should be retried with backoff.
    ///
    /// Matches §7's propagation policy: `Unavailable`, `Timeout`, `Transport`
    /// and protocol-level 429/5xx are recoverable; everything else is
    /// terminal.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Unavailable | ErrorCategory::Timeout | ErrorCategory::Transport
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::AlreadyExists => "already_exists",
            ErrorCategory::InvalidState => "invalid_state",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Unavailable => "unavailable",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Transport => "transport",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Parse => "parse",
            ErrorCategory::Duplicate => "duplicate",
            ErrorCategory::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Implemented by every component-specific error enum so it can be folded
/// into the closed taxonomy without losing its own context.
pub trait Categorizable: std::error::Error {
    fn category(&self) -> ErrorCategory;

    /// A short, loggable reason string distinct from `Display`'s full
    /// context chain — used as the terminal "dead" reason on frontier rows
    /// and job error_message columns.
    fn reason(&self) -> Cow<'static, str> {
        Cow::Borrowed("error")
    }
}

impl Categorizable for sqlx::Error {
    fn category(&self) -> ErrorCategory {
        match self {
            sqlx::Error::RowNotFound => ErrorCategory::NotFound,
            sqlx::Error::PoolTimedOut => ErrorCategory::Timeout,
            sqlx::Error::PoolClosed | sqlx::Error::Io(_) => ErrorCategory::Unavailable,
            _ => ErrorCategory::Internal,
        }
    }
}

impl Categorizable for redis::RedisError {
    fn category(&self) -> ErrorCategory {
        if self.is_timeout() {
            ErrorCategory::Timeout
        } else if self.is_io_error() || self.is_connection_dropped() {
            ErrorCategory::Unavailable
        } else {
            ErrorCategory::Internal
        }
    }
}

impl Categorizable for reqwest::Error {
    fn category(&self) -> ErrorCategory {
        if self.is_timeout() {
            ErrorCategory::Timeout
        } else if self.is_connect() {
            ErrorCategory::Unavailable
        } else if self.is_status() {
            ErrorCategory::Protocol
        } else {
            ErrorCategory::Transport
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_categories_match_spec_7() {
        assert!(ErrorCategory::Unavailable.is_retryable());
        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(ErrorCategory::Transport.is_retryable());
        assert!(!ErrorCategory::NotFound.is_retryable());
        assert!(!ErrorCategory::InvalidState.is_retryable());
    }

    #[test]
    fn display_uses_snake_case_tokens() {
        assert_eq!(ErrorCategory::InvalidState.to_string(), "invalid_state");
        assert_eq!(ErrorCategory::AlreadyExists.to_string(), "already_exists");
    }
}
