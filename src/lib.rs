pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod index;
pub mod output;
pub mod parser;
pub mod poller;
pub mod query;
pub mod schedule;
pub mod summary;
pub mod time_utils;

#[cfg(test)]
mod fixtures;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}

pub use config::{FeedSettings, PollerOptions};
pub use error::{ErrorKind, FeedError};
pub use poller::{FeedListener, FeedPoller, PollerPhase, PollerState};
pub use query::QueryView;
