#![forbid(unsafe_code)]

//! Failure taxonomy shared by every collaborator boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse classification of why a single item could not be fetched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The video, channel or resource does not exist (or is private/removed).
    NotFound,
    /// The resource exists but the requested artifact is switched off,
    /// e.g. captions disabled for a video.
    Disabled,
    /// Transient transport or extractor trouble. Eligible for retry.
    NetworkError,
    /// Malformed URL or channel name, rejected before any external call.
    InvalidInput,
    /// Anything else: missing binaries, unparsable payloads, IO errors.
    Unexpected,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Disabled => "disabled",
            Self::NetworkError => "network_error",
            Self::InvalidInput => "invalid_input",
            Self::Unexpected => "unexpected",
        }
    }

    /// Terminal outcomes that say something about the resource rather than
    /// about our ability to reach it.
    pub fn is_unavailable(self) -> bool {
        matches!(self, Self::NotFound | Self::Disabled)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: FailureKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, message)
    }

    pub fn disabled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Disabled, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NetworkError, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidInput, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unexpected, message)
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        Self::unexpected(err.to_string())
    }
}

pub type FetchResult<T> = Result<T, FetchError>;
