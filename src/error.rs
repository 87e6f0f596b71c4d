//! Error taxonomy for feed polling, decoding and dispatch.

use std::fmt;

use thiserror::Error;

/// Number of leading payload bytes rendered into a decode-error excerpt.
const EXCERPT_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum FeedError {
    /// Invalid or incomplete configuration. Never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("feed request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport failure reported by a non-HTTP transport or a non-2xx status.
    #[error("feed transport failed: {0}")]
    Transport(String),

    #[error("could not decode feed message: {reason}")]
    Decode {
        reason: String,
        excerpt: Option<String>,
    },

    /// The decoded message is not newer than the last accepted one.
    #[error("feed message timestamp {received} is not newer than previously accepted {previous}")]
    OrderingViolation { previous: u64, received: u64 },

    #[error("listener failed: {0}")]
    Listener(String),
}

/// Coarse classification of a [`FeedError`], used in poller events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Transport,
    Decode,
    OrderingViolation,
    Listener,
}

impl FeedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FeedError::Config(_) => ErrorKind::Config,
            FeedError::Http(_) | FeedError::Transport(_) => ErrorKind::Transport,
            FeedError::Decode { .. } => ErrorKind::Decode,
            FeedError::OrderingViolation { .. } => ErrorKind::OrderingViolation,
            FeedError::Listener(_) => ErrorKind::Listener,
        }
    }

    /// Whether the error flows into the poller's back-off path.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Config | ErrorKind::Listener)
    }

    /// Hex excerpt of the offending payload, when one was captured.
    pub fn excerpt(&self) -> Option<&str> {
        match self {
            FeedError::Decode { excerpt, .. } => excerpt.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn decode(reason: impl Into<String>, payload: &[u8]) -> Self {
        FeedError::Decode {
            reason: reason.into(),
            excerpt: excerpt(payload),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Config => "config_error",
            ErrorKind::Transport => "transport_error",
            ErrorKind::Decode => "decode_error",
            ErrorKind::OrderingViolation => "ordering_violation",
            ErrorKind::Listener => "listener_error",
        };
        f.write_str(name)
    }
}

/// Renders the first bytes of a payload as space-separated hex.
///
/// Returns `None` for an empty payload.
pub fn excerpt(payload: &[u8]) -> Option<String> {
    if payload.is_empty() {
        return None;
    }

    let mut out = payload
        .iter()
        .take(EXCERPT_LEN)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");

    if payload.len() > EXCERPT_LEN {
        out.push_str(" ...");
    }

    Some(out)
}
