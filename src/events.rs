//! Structured notifications emitted by the poller.
//!
//! The poller reports what happens to it through an [`EventSink`] and never
//! renders or persists anything itself. [`TracingSink`] logs each event;
//! [`ChannelSink`] forwards them to whoever holds the receiving end.

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::{ErrorKind, FeedError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerEvent {
    Started {
        source_url: String,
    },
    Stopped,
    SuccessfulRead {
        feed_timestamp: u64,
        entities: usize,
    },
    Error {
        kind: ErrorKind,
        message: String,
        retry_count: u32,
        excerpt: Option<String>,
    },
    /// No fetch outcome arrived in time; the transport was discarded and
    /// polling restarted.
    WatchdogFired {
        restarts: u64,
    },
}

impl PollerEvent {
    pub fn from_error(err: &FeedError, retry_count: u32) -> Self {
        PollerEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
            retry_count,
            excerpt: err.excerpt().map(str::to_string),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: PollerEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PollerEvent) {
        match event {
            PollerEvent::Started { source_url } => info!(%source_url, "Feed poller started"),
            PollerEvent::Stopped => info!("Feed poller stopped"),
            PollerEvent::SuccessfulRead {
                feed_timestamp,
                entities,
            } => info!(feed_timestamp, entities, "Feed read"),
            PollerEvent::Error {
                kind: ErrorKind::OrderingViolation,
                message,
                retry_count,
                ..
            } => warn!(retry_count, %message, "Stale feed message rejected"),
            PollerEvent::Error {
                kind,
                message,
                retry_count,
                excerpt,
            } => error!(
                %kind,
                retry_count,
                excerpt = excerpt.as_deref().unwrap_or(""),
                %message,
                "Feed read failed"
            ),
            PollerEvent::WatchdogFired { restarts } => {
                warn!(restarts, "No feed response in time, restarting poller")
            }
        }
    }
}

/// Forwards events into an unbounded tokio channel.
///
/// Events are dropped silently once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PollerEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PollerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: PollerEvent) {
        let _ = self.tx.send(event);
    }
}
