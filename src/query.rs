//! Read-only query facade over one feed message and its indices.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;

use crate::gtfs_rt::trip_update::StopTimeUpdate;
use crate::gtfs_rt::{Alert, EntitySelector, FeedMessage, TripDescriptor, TripUpdate, VehiclePosition};
use crate::index::{self, FeedIndices, IndexStats, StopVisit, TripIndexNode};
use crate::schedule::ScheduleProvider;
use crate::time_utils;

/// A snapshot of one accepted feed message.
///
/// Bound to exactly one message and the indices built from it; a newer
/// message always produces a new view. All lookups fail soft, returning
/// `None` or an empty collection for unknown ids, since feed data is
/// routinely partial.
#[derive(Debug, Clone)]
pub struct QueryView {
    message: Arc<FeedMessage>,
    indices: FeedIndices,
}

impl QueryView {
    /// Indexes `message` in the agency timezone and wraps the result.
    pub fn new(message: FeedMessage, schedule: Option<&dyn ScheduleProvider>) -> Self {
        let indices = index::build(&message, schedule);
        Self::from_parts(Arc::new(message), indices)
    }

    pub fn from_parts(message: Arc<FeedMessage>, indices: FeedIndices) -> Self {
        Self { message, indices }
    }

    pub fn message(&self) -> &FeedMessage {
        &self.message
    }

    pub fn indices(&self) -> &FeedIndices {
        &self.indices
    }

    pub fn stats(&self) -> &IndexStats {
        &self.indices.stats
    }

    /// The header timestamp, or 0 when the header carries none.
    pub fn feed_timestamp(&self) -> u64 {
        self.message.header.timestamp.unwrap_or(0)
    }

    /// The header timestamp rendered in the agency timezone.
    pub fn formatted_feed_timestamp(&self, format: Option<&str>) -> Option<String> {
        let ts = i64::try_from(self.message.header.timestamp?).ok()?;
        time_utils::format_timestamp(ts, format)
    }

    /// Every trip with a trip update, vehicle position or alert, sorted.
    pub fn all_monitored_trips(&self) -> Vec<&str> {
        let mut trips: Vec<&str> = self.indices.trips.keys().map(String::as_str).collect();
        trips.sort_unstable();
        trips
    }

    pub fn trip_update(&self, trip_id: &str) -> Option<&TripUpdate> {
        self.node(trip_id)?.trip_update.as_ref()
    }

    pub fn vehicle_position(&self, trip_id: &str) -> Option<&VehiclePosition> {
        self.node(trip_id)?.vehicle_position.as_ref()
    }

    pub fn alerts(&self, trip_id: &str) -> &[Alert] {
        self.node(trip_id)
            .map(|node| node.alerts.as_slice())
            .unwrap_or_default()
    }

    /// The trip descriptor from the trip update, else from the vehicle,
    /// else from the first alert naming the trip.
    pub fn trip_descriptor(&self, trip_id: &str) -> Option<&TripDescriptor> {
        let node = self.node(trip_id)?;
        node.trip_update
            .as_ref()
            .map(|update| &update.trip)
            .or_else(|| node.vehicle_position.as_ref()?.trip.as_ref())
            .or_else(|| self.alert_selector(trip_id)?.trip.as_ref())
    }

    /// Alert-only trips may carry the route on the selector instead of the
    /// trip descriptor.
    pub fn route_of(&self, trip_id: &str) -> Option<&str> {
        self.trip_descriptor(trip_id)
            .and_then(|trip| trip.route_id.as_deref())
            .or_else(|| self.alert_selector(trip_id)?.route_id.as_deref())
    }

    pub fn start_date(&self, trip_id: &str) -> Option<NaiveDate> {
        let start_date = self.trip_descriptor(trip_id)?.start_date.as_deref()?;
        time_utils::parse_service_date(start_date)
    }

    /// Onward stop-time updates, with stops already passed removed.
    pub fn stop_time_updates(&self, trip_id: &str) -> &[StopTimeUpdate] {
        self.trip_update(trip_id)
            .map(|update| update.stop_time_update.as_slice())
            .unwrap_or_default()
    }

    /// Onward stop ids in sequence order.
    pub fn onward_stops(&self, trip_id: &str) -> Vec<&str> {
        self.stop_time_updates(trip_id)
            .iter()
            .filter_map(|stu| stu.stop_id.as_deref())
            .collect()
    }

    pub fn first_n_onward_stops(&self, trip_id: &str, n: usize) -> Vec<&str> {
        self.stop_time_updates(trip_id)
            .iter()
            .take(n)
            .filter_map(|stu| stu.stop_id.as_deref())
            .collect()
    }

    pub fn next_stop(&self, trip_id: &str) -> Option<&str> {
        self.nth_onward_stop(trip_id, 0)
    }

    /// Zero-based: `n == 0` is the next stop.
    pub fn nth_onward_stop(&self, trip_id: &str, n: usize) -> Option<&str> {
        self.stop_time_updates(trip_id).get(n)?.stop_id.as_deref()
    }

    pub fn destination_stop_time_update(&self, trip_id: &str) -> Option<&StopTimeUpdate> {
        self.stop_time_updates(trip_id).last()
    }

    pub fn destination_stop(&self, trip_id: &str) -> Option<&str> {
        self.destination_stop_time_update(trip_id)?.stop_id.as_deref()
    }

    /// Position of `stop_id` within the trip's onward stop-time updates.
    pub fn stop_position(&self, trip_id: &str, stop_id: &str) -> Option<usize> {
        self.node(trip_id)?.stops.get(stop_id).copied()
    }

    pub fn stop_time_update(&self, trip_id: &str, stop_id: &str) -> Option<&StopTimeUpdate> {
        let position = self.stop_position(trip_id, stop_id)?;
        self.stop_time_updates(trip_id).get(position)
    }

    /// Predicted arrival at `stop_id` as POSIX seconds, stated or interpolated.
    pub fn expected_arrival(&self, trip_id: &str, stop_id: &str) -> Option<i64> {
        let position = self.stop_position(trip_id, stop_id)?;
        self.node(trip_id)?.predictions.get(position)?.arrival
    }

    pub fn expected_departure(&self, trip_id: &str, stop_id: &str) -> Option<i64> {
        let position = self.stop_position(trip_id, stop_id)?;
        self.node(trip_id)?.predictions.get(position)?.departure
    }

    pub fn stop_visits(&self, stop_id: &str) -> &[StopVisit] {
        self.indices
            .stops
            .get(stop_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Trips calling at `stop_id`, ascending by predicted time there.
    pub fn trips_servicing_stop(&self, stop_id: &str) -> Vec<&str> {
        self.stop_visits(stop_id)
            .iter()
            .map(|visit| visit.trip_id.as_str())
            .collect()
    }

    pub fn trips_servicing_route(&self, route_id: &str) -> &[String] {
        self.indices
            .routes
            .get(route_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Trip updates of every trip on `route_id`, in trip id order.
    pub fn trip_updates_for_route(&self, route_id: &str) -> Vec<&TripUpdate> {
        self.trips_servicing_route(route_id)
            .iter()
            .filter_map(|trip_id| self.trip_update(trip_id))
            .collect()
    }

    pub fn vehicle_positions_for_route(&self, route_id: &str) -> Vec<&VehiclePosition> {
        self.trips_servicing_route(route_id)
            .iter()
            .filter_map(|trip_id| self.vehicle_position(trip_id))
            .collect()
    }

    /// Alerts touching any trip on `route_id`, each listed once even when
    /// it names several of the route's trips.
    pub fn alerts_for_route(&self, route_id: &str) -> Vec<&Alert> {
        let mut alerts: Vec<&Alert> = Vec::new();
        for trip_id in self.trips_servicing_route(route_id) {
            for alert in self.alerts(trip_id) {
                if !alerts.contains(&alert) {
                    alerts.push(alert);
                }
            }
        }
        alerts
    }

    /// Trips on `route_id` calling at `stop_id`, in stop order.
    pub fn trips_servicing_stop_for_route(&self, stop_id: &str, route_id: &str) -> Vec<&str> {
        let on_route: HashSet<&str> = self
            .trips_servicing_route(route_id)
            .iter()
            .map(String::as_str)
            .collect();

        self.trips_servicing_stop(stop_id)
            .into_iter()
            .filter(|trip_id| on_route.contains(trip_id))
            .collect()
    }

    pub fn route_ids(&self) -> impl Iterator<Item = &str> {
        self.indices.routes.keys().map(String::as_str)
    }

    pub fn stop_ids(&self) -> impl Iterator<Item = &str> {
        self.indices.stops.keys().map(String::as_str)
    }

    fn node(&self, trip_id: &str) -> Option<&TripIndexNode> {
        self.indices.trips.get(trip_id)
    }

    fn alert_selector(&self, trip_id: &str) -> Option<&EntitySelector> {
        self.alerts(trip_id)
            .iter()
            .flat_map(|alert| &alert.informed_entity)
            .find(|informed| {
                informed
                    .trip
                    .as_ref()
                    .is_some_and(|trip| trip.trip_id.as_deref() == Some(trip_id))
            })
    }
}
