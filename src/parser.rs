//! Protobuf decoding for GTFS Realtime feeds.

use prost::Message;

use crate::error::FeedError;
use crate::gtfs_rt::FeedMessage;

/// Turns raw feed bytes into a [`FeedMessage`].
///
/// The poller treats any decode failure like a transport failure and retries.
pub trait FeedDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<FeedMessage, FeedError>;
}

/// Decoder for the `transit_realtime` schema compiled in by `build.rs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtobufDecoder;

impl FeedDecoder for ProtobufDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<FeedMessage, FeedError> {
        parse_feed(bytes)
    }
}

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns [`FeedError::Decode`] with a hex excerpt of the payload if the
/// bytes are not valid protobuf for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage, FeedError> {
    FeedMessage::decode(bytes).map_err(|e| FeedError::decode(e.to_string(), bytes))
}
