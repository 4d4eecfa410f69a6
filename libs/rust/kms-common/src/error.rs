//! Centralized error type for the shared helpers.
//!
//! Errors are classified as retryable or not so that callers polling a
//! remote resource can decide whether another attempt makes sense.

use std::time::Duration;
use thiserror::Error;

/// Common error type for platform operations.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A header name or value could not be used
    #[error("Invalid header {name}: {reason}")]
    InvalidHeader {
        /// Header name as configured
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// Service is temporarily unavailable
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Polling gave up after the maximum total wait
    #[error("Gave up waiting for {what} after {waited:?}")]
    PollTimeout {
        /// What was being waited for
        what: String,
        /// Total time spent waiting
        waited: Duration,
    },

    /// Tracing subscriber could not be installed
    #[error("Tracing initialization failed: {0}")]
    Tracing(String),
}

impl PlatformError {
    /// Check if this error is retryable.
    ///
    /// # Examples
    ///
    /// ```
    /// use kms_common::PlatformError;
    ///
    /// let err = PlatformError::unavailable("vault");
    /// assert!(err.is_retryable());
    ///
    /// let err = PlatformError::invalid_input("bad name");
    /// assert!(!err.is_retryable());
    /// ```
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Create an unavailable error with the given message.
    #[must_use]
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create an invalid input error with the given message.
    #[must_use]
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a poll timeout error.
    #[must_use]
    pub fn poll_timeout(what: impl Into<String>, waited: Duration) -> Self {
        Self::PollTimeout {
            what: what.into(),
            waited,
        }
    }
}
