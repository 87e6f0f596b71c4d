//! One-row summaries of feed reads, for CSV logs and JSON output.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ErrorKind, FeedError};
use crate::events::PollerEvent;
use crate::query::QueryView;

#[derive(Debug, Default, Clone, Serialize)]
pub struct FeedSummary {
    pub read_at: DateTime<Utc>,
    pub source: Option<String>,
    pub feed_timestamp: Option<u64>,
    /// The header timestamp in the agency timezone.
    pub feed_time: Option<String>,
    pub total_entities: usize,

    // entity types
    pub trip_updates: usize,
    pub vehicle_positions: usize,
    pub alerts: usize,
    pub unrecognized: usize,
    pub untracked: usize,

    // index
    pub duplicate_trip_updates: usize,
    pub pruned_stop_time_updates: usize,
    pub monitored_trips: usize,
    pub routes: usize,
    pub stops: usize,
    pub stop_visits: usize,
    pub predicted_stop_visits: usize,

    // error tracking
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl FeedSummary {
    pub fn from_view(view: &QueryView) -> Self {
        let stats = view.stats();
        let indices = view.indices();

        let visits = indices.stops.values().flatten();
        let (stop_visits, predicted_stop_visits) = visits.fold((0, 0), |(all, predicted), visit| {
            (all + 1, predicted + usize::from(visit.predicted.is_some()))
        });

        FeedSummary {
            read_at: Utc::now(),
            source: None,
            feed_timestamp: view.message().header.timestamp,
            feed_time: view.formatted_feed_timestamp(None),
            total_entities: view.message().entity.len(),
            trip_updates: stats.trip_updates,
            vehicle_positions: stats.vehicle_positions,
            alerts: stats.alerts,
            unrecognized: stats.unrecognized,
            untracked: stats.untracked,
            duplicate_trip_updates: stats.duplicate_trip_updates,
            pruned_stop_time_updates: stats.pruned_stop_time_updates,
            monitored_trips: indices.trips.len(),
            routes: indices.routes.len(),
            stops: indices.stops.len(),
            stop_visits,
            predicted_stop_visits,
            error_type: None,
            error_message: None,
        }
    }

    /// Create an error record with timestamp and error information
    pub fn from_error(err: &FeedError) -> Self {
        FeedSummary {
            read_at: Utc::now(),
            error_type: Some(err.kind().to_string()),
            error_message: Some(err.to_string()),
            ..Default::default()
        }
    }

    /// Error row for a failed read reported by the poller.
    ///
    /// Listener failures and lifecycle events are not reads and yield `None`.
    pub fn from_event(event: &PollerEvent) -> Option<Self> {
        match event {
            PollerEvent::Error {
                kind: ErrorKind::Listener,
                ..
            } => None,
            PollerEvent::Error { kind, message, .. } => Some(FeedSummary {
                read_at: Utc::now(),
                error_type: Some(kind.to_string()),
                error_message: Some(message.clone()),
                ..Default::default()
            }),
            _ => None,
        }
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn pct(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            (part as f64 / total as f64) * 100.0
        }
    }

    /// Share of stop visits that carry a predicted time.
    pub fn prediction_pct(&self) -> f64 {
        Self::pct(self.predicted_stop_visits, self.stop_visits)
    }

    pub fn is_error(&self) -> bool {
        self.error_type.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;

    #[test]
    fn test_pct_with_zero_total() {
        assert_eq!(FeedSummary::pct(10, 0), 0.0);
    }

    #[test]
    fn test_pct_normal_values() {
        assert_eq!(FeedSummary::pct(50, 100), 50.0);
        assert_eq!(FeedSummary::pct(1, 4), 25.0);
    }

    #[test]
    fn test_from_view_counts() {
        let view = QueryView::new(
            message(
                100,
                vec![
                    trip_update_entity(
                        "1",
                        trip_update("T1", "R1", vec![arriving("A", 150), stop("B", None, None)]),
                    ),
                    trip_update_entity("2", trip_update("T2", "R2", vec![arriving("A", 120)])),
                    vehicle_entity("v", "T3", "R1", 90),
                    alert_entity("a", &[("T1", "R1")]),
                ],
            ),
            None,
        );

        let summary = FeedSummary::from_view(&view).with_source("feed.pb");

        assert_eq!(summary.source.as_deref(), Some("feed.pb"));
        assert_eq!(summary.feed_timestamp, Some(100));
        assert_eq!(summary.total_entities, 4);
        assert_eq!(summary.trip_updates, 2);
        assert_eq!(summary.vehicle_positions, 1);
        assert_eq!(summary.alerts, 1);
        assert_eq!(summary.monitored_trips, 3);
        assert_eq!(summary.routes, 2);
        assert_eq!(summary.stops, 2);
        assert_eq!(summary.stop_visits, 3);
        assert_eq!(summary.predicted_stop_visits, 2);
        assert!(!summary.is_error());
    }

    #[test]
    fn test_from_error() {
        let summary = FeedSummary::from_error(&FeedError::OrderingViolation {
            previous: 100,
            received: 90,
        });

        assert_eq!(summary.error_type.as_deref(), Some("ordering_violation"));
        assert!(summary.error_message.unwrap().contains("90"));
        assert_eq!(summary.total_entities, 0);
    }

    #[test]
    fn test_from_event_records_failed_reads_only() {
        let failed = PollerEvent::from_error(&FeedError::Transport("timed out".to_string()), 2);
        let summary = FeedSummary::from_event(&failed).unwrap();

        assert_eq!(summary.error_type.as_deref(), Some("transport_error"));
        assert!(summary.error_message.as_deref().unwrap().contains("timed out"));
        assert!(summary.is_error());

        let listener = PollerEvent::from_error(&FeedError::Listener("boom".to_string()), 0);
        assert!(FeedSummary::from_event(&listener).is_none());
        assert!(FeedSummary::from_event(&PollerEvent::Stopped).is_none());
        assert!(FeedSummary::from_event(&PollerEvent::WatchdogFired { restarts: 1 }).is_none());
    }
}
