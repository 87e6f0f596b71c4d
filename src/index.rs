//! Per-message indices over trip updates, vehicle positions and alerts.
//!
//! Every decoded [`FeedMessage`] produces a brand-new [`FeedIndices`] set:
//! trips keyed by trip id, trips grouped by route, and trips ordered by
//! predicted time at each stop. Nothing is updated in place across messages.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::NaiveDate;
use chrono_tz::Tz;
use tracing::debug;

use crate::gtfs_rt::trip_update::{StopTimeEvent, StopTimeUpdate};
use crate::gtfs_rt::{Alert, FeedEntity, FeedMessage, TripDescriptor, TripUpdate, VehiclePosition};
use crate::schedule::ScheduleProvider;
use crate::time_utils;

/// Predicted arrival and departure for one stop-time update.
///
/// Either comes straight from the feed or is interpolated from the static
/// schedule plus the running delay. Absent when neither source has a value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Prediction {
    pub arrival: Option<i64>,
    pub departure: Option<i64>,
}

impl Prediction {
    /// The time used to order trips at a stop: arrival, else departure.
    pub fn time_at_stop(&self) -> Option<i64> {
        self.arrival.or(self.departure)
    }
}

/// Everything indexed for one trip within one message.
#[derive(Debug, Default, Clone)]
pub struct TripIndexNode {
    /// The winning trip update, with stops already passed pruned away.
    pub trip_update: Option<TripUpdate>,
    /// One entry per remaining stop-time update, in the same order.
    pub predictions: Vec<Prediction>,
    pub vehicle_position: Option<VehiclePosition>,
    pub alerts: Vec<Alert>,
    /// Position of each stop in the pruned stop-time update sequence.
    pub stops: HashMap<String, usize>,
}

/// One trip calling at a stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopVisit {
    pub trip_id: String,
    pub predicted: Option<i64>,
}

/// Counters collected while building, mainly for logging and summaries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub trip_updates: usize,
    pub vehicle_positions: usize,
    pub alerts: usize,
    pub unrecognized: usize,
    /// Trip updates or vehicle positions without a usable trip id.
    pub untracked: usize,
    /// Trip updates discarded because another update named the same trip.
    pub duplicate_trip_updates: usize,
    pub pruned_stop_time_updates: usize,
}

#[derive(Debug, Default, Clone)]
pub struct FeedIndices {
    pub trips: HashMap<String, TripIndexNode>,
    /// Trip ids per route, sorted.
    pub routes: HashMap<String, Vec<String>>,
    /// Visits per stop, ascending by predicted time; visits without a
    /// prediction come last. Ties break on trip id.
    pub stops: HashMap<String, Vec<StopVisit>>,
    pub stats: IndexStats,
}

/// Builds [`FeedIndices`] from a decoded message.
pub struct IndexBuilder<'a> {
    schedule: Option<&'a dyn ScheduleProvider>,
    timezone: Tz,
}

impl Default for IndexBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> IndexBuilder<'a> {
    /// A builder without a schedule provider, anchored in the agency timezone.
    pub fn new() -> Self {
        Self {
            schedule: None,
            timezone: time_utils::agency_timezone(),
        }
    }

    pub fn with_schedule(mut self, schedule: &'a dyn ScheduleProvider) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn build(&self, message: &FeedMessage) -> FeedIndices {
        let mut acc = Accumulator::default();
        let header_timestamp = message.header.timestamp;

        let mut alerts = Vec::new();
        let mut vehicles = Vec::new();
        let mut trip_updates = Vec::new();

        for entity in &message.entity {
            match classify(entity) {
                Some(Payload::TripUpdate(update)) => trip_updates.push(update),
                Some(Payload::Vehicle(vehicle)) => vehicles.push(vehicle),
                Some(Payload::Alert(alert)) => alerts.push(alert),
                None => {
                    acc.stats.unrecognized += 1;
                    debug!(entity_id = %entity.id, "Skipping unrecognized feed entity");
                }
            }
        }

        acc.stats.trip_updates = trip_updates.len();
        acc.stats.vehicle_positions = vehicles.len();
        acc.stats.alerts = alerts.len();

        for alert in alerts {
            acc.index_alert(alert);
        }

        // Vehicles go first: their timestamps are the pruning cutoff for
        // the trip updates below.
        for vehicle in vehicles {
            acc.index_vehicle(vehicle);
        }

        for update in resolve_duplicates(&trip_updates, &mut acc.stats) {
            self.index_trip_update(&mut acc, update, header_timestamp);
        }

        acc.finish()
    }

    fn index_trip_update(
        &self,
        acc: &mut Accumulator,
        update: &TripUpdate,
        header_timestamp: Option<u64>,
    ) {
        let Some(trip_id) = trip_key(&update.trip) else {
            return;
        };
        let mut update = update.clone();

        let vehicle_timestamp = acc
            .trips
            .get(trip_id)
            .and_then(|node| node.vehicle_position.as_ref())
            .and_then(|vehicle| vehicle.timestamp);

        // A cutoff beyond the i64 range cannot be compared with stop times.
        if let Some(cutoff) = vehicle_timestamp
            .or(update.timestamp)
            .or(header_timestamp)
            .and_then(|ts| i64::try_from(ts).ok())
        {
            acc.stats.pruned_stop_time_updates +=
                prune_passed_stops(&mut update.stop_time_update, cutoff);
        }

        let predictions = self.predict(trip_id, &update, header_timestamp);

        acc.link_route(update.trip.route_id.as_deref(), trip_id);

        let node = acc.trips.entry(trip_id.to_string()).or_default();
        for (position, stu) in update.stop_time_update.iter().enumerate() {
            let Some(stop_id) = stu.stop_id.as_deref().filter(|id| !id.is_empty()) else {
                continue;
            };

            // A trip that calls at a stop twice is indexed at its next visit.
            node.stops.entry(stop_id.to_string()).or_insert(position);

            let slot = acc
                .stops
                .entry(stop_id.to_string())
                .or_default()
                .entry(trip_id.to_string())
                .or_insert(None);
            if slot.is_none() {
                *slot = predictions[position].time_at_stop();
            }
        }

        node.trip_update = Some(update);
        node.predictions = predictions;
    }

    fn predict(
        &self,
        trip_id: &str,
        update: &TripUpdate,
        header_timestamp: Option<u64>,
    ) -> Vec<Prediction> {
        let service_date = update
            .trip
            .start_date
            .as_deref()
            .and_then(time_utils::parse_service_date)
            .or_else(|| {
                header_timestamp
                    .and_then(|ts| i64::try_from(ts).ok())
                    .and_then(|ts| time_utils::local_date(self.timezone, ts))
            });

        let mut running_delay = update.delay;

        update
            .stop_time_update
            .iter()
            .map(|stu| {
                let mut prediction = Prediction::default();

                for kind in [EventKind::Arrival, EventKind::Departure] {
                    let event = kind.event(stu);
                    if let Some(delay) = event.and_then(|e| e.delay) {
                        running_delay = Some(delay);
                    }

                    let time = event.and_then(|e| e.time).or_else(|| {
                        self.interpolate(kind, trip_id, stu, running_delay, service_date)
                    });

                    match kind {
                        EventKind::Arrival => prediction.arrival = time,
                        EventKind::Departure => prediction.departure = time,
                    }
                }

                prediction
            })
            .collect()
    }

    fn interpolate(
        &self,
        kind: EventKind,
        trip_id: &str,
        stu: &StopTimeUpdate,
        delay: Option<i32>,
        service_date: Option<NaiveDate>,
    ) -> Option<i64> {
        let schedule = self.schedule?;
        let stop_id = stu.stop_id.as_deref()?;
        let delay = delay?;
        let service_date = service_date?;

        let scheduled = match kind {
            EventKind::Arrival => schedule.scheduled_arrival(trip_id, stop_id, stu.stop_sequence),
            EventKind::Departure => {
                schedule.scheduled_departure(trip_id, stop_id, stu.stop_sequence)
            }
        }?;

        let timestamp = time_utils::scheduled_timestamp(self.timezone, service_date, &scheduled)?;
        Some(timestamp + i64::from(delay))
    }
}

/// Builds indices for `message` in the agency timezone.
pub fn build(message: &FeedMessage, schedule: Option<&dyn ScheduleProvider>) -> FeedIndices {
    let builder = IndexBuilder::new();
    match schedule {
        Some(schedule) => builder.with_schedule(schedule).build(message),
        None => builder.build(message),
    }
}

/// Drops leading stop-time updates the vehicle has already left.
///
/// A stop counts as passed when its departure time (or, without one, its
/// arrival time) is strictly before `cutoff`. Stops without a stated time
/// end the pruned prefix. Returns the number of updates removed; applying it
/// again to the result removes nothing.
pub fn prune_passed_stops(updates: &mut Vec<StopTimeUpdate>, cutoff: i64) -> usize {
    let passed = updates
        .iter()
        .take_while(|stu| {
            event_time(&stu.departure)
                .or_else(|| event_time(&stu.arrival))
                .is_some_and(|time| time < cutoff)
        })
        .count();

    updates.drain(..passed);
    passed
}

#[derive(Default)]
struct Accumulator {
    trips: HashMap<String, TripIndexNode>,
    routes: HashMap<String, BTreeSet<String>>,
    stops: HashMap<String, HashMap<String, Option<i64>>>,
    stats: IndexStats,
}

impl Accumulator {
    fn link_route(&mut self, route_id: Option<&str>, trip_id: &str) {
        if let Some(route_id) = route_id.filter(|id| !id.is_empty()) {
            self.routes
                .entry(route_id.to_string())
                .or_default()
                .insert(trip_id.to_string());
        }
    }

    fn index_alert(&mut self, alert: &Alert) {
        let mut informed_trips = HashSet::new();

        for informed in &alert.informed_entity {
            let Some(trip) = informed.trip.as_ref() else {
                continue;
            };
            let Some(trip_id) = trip_key(trip) else {
                continue;
            };
            if !informed_trips.insert(trip_id) {
                continue;
            }

            self.trips
                .entry(trip_id.to_string())
                .or_default()
                .alerts
                .push(alert.clone());

            let route_id = trip.route_id.as_deref().or(informed.route_id.as_deref());
            self.link_route(route_id, trip_id);
        }
    }

    fn index_vehicle(&mut self, vehicle: &VehiclePosition) {
        let Some(trip) = vehicle.trip.as_ref() else {
            self.stats.untracked += 1;
            return;
        };
        let Some(trip_id) = trip_key(trip) else {
            self.stats.untracked += 1;
            return;
        };

        let node = self.trips.entry(trip_id.to_string()).or_default();
        // Keep the most recent report if a trip shows up twice.
        let newer = match (&node.vehicle_position, vehicle.timestamp) {
            (Some(current), Some(ts)) => current.timestamp.is_none_or(|seen| ts >= seen),
            (Some(_), None) => false,
            (None, _) => true,
        };
        if newer {
            node.vehicle_position = Some(vehicle.clone());
        }

        self.link_route(trip.route_id.as_deref(), trip_id);
    }

    fn finish(self) -> FeedIndices {
        let routes = self
            .routes
            .into_iter()
            .map(|(route_id, trips)| (route_id, trips.into_iter().collect()))
            .collect();

        let stops = self
            .stops
            .into_iter()
            .map(|(stop_id, visits)| {
                let mut visits: Vec<StopVisit> = visits
                    .into_iter()
                    .map(|(trip_id, predicted)| StopVisit { trip_id, predicted })
                    .collect();
                visits.sort_by(|a, b| {
                    (a.predicted.is_none(), a.predicted, &a.trip_id).cmp(&(
                        b.predicted.is_none(),
                        b.predicted,
                        &b.trip_id,
                    ))
                });
                (stop_id, visits)
            })
            .collect();

        FeedIndices {
            trips: self.trips,
            routes,
            stops,
            stats: self.stats,
        }
    }
}

enum Payload<'m> {
    TripUpdate(&'m TripUpdate),
    Vehicle(&'m VehiclePosition),
    Alert(&'m Alert),
}

fn classify(entity: &FeedEntity) -> Option<Payload<'_>> {
    entity
        .trip_update
        .as_ref()
        .map(Payload::TripUpdate)
        .or_else(|| entity.vehicle.as_ref().map(Payload::Vehicle))
        .or_else(|| entity.alert.as_ref().map(Payload::Alert))
}

#[derive(Debug, Clone, Copy)]
enum EventKind {
    Arrival,
    Departure,
}

impl EventKind {
    fn event(self, stu: &StopTimeUpdate) -> Option<&StopTimeEvent> {
        match self {
            EventKind::Arrival => stu.arrival.as_ref(),
            EventKind::Departure => stu.departure.as_ref(),
        }
    }
}

/// The trip id used to correlate updates, positions and alerts.
fn trip_key(trip: &TripDescriptor) -> Option<&str> {
    trip.trip_id.as_deref().filter(|id| !id.is_empty())
}

fn event_time(event: &Option<StopTimeEvent>) -> Option<i64> {
    event.as_ref().and_then(|e| e.time)
}

fn first_stop_time(update: &TripUpdate) -> Option<i64> {
    update
        .stop_time_update
        .first()
        .and_then(|stu| event_time(&stu.arrival).or_else(|| event_time(&stu.departure)))
}

/// Whether `candidate` should replace `current` for the same trip.
///
/// The later first-stop prediction wins; an update with a first-stop time
/// beats one without. When neither has one, the longer stop sequence wins.
/// Any remaining tie keeps the update seen first.
fn supersedes(candidate: &TripUpdate, current: &TripUpdate) -> bool {
    match (first_stop_time(candidate), first_stop_time(current)) {
        (Some(new), Some(old)) => new > old,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => candidate.stop_time_update.len() > current.stop_time_update.len(),
    }
}

/// Picks one trip update per trip id, preserving first-seen order.
fn resolve_duplicates<'m>(
    updates: &[&'m TripUpdate],
    stats: &mut IndexStats,
) -> Vec<&'m TripUpdate> {
    let mut order = Vec::new();
    let mut winners: HashMap<&'m str, &'m TripUpdate> = HashMap::new();

    for &update in updates {
        let Some(trip_id) = trip_key(&update.trip) else {
            stats.untracked += 1;
            continue;
        };

        match winners.entry(trip_id) {
            Entry::Vacant(slot) => {
                order.push(trip_id);
                slot.insert(update);
            }
            Entry::Occupied(mut slot) => {
                stats.duplicate_trip_updates += 1;
                if supersedes(update, slot.get()) {
                    slot.insert(update);
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|trip_id| winners.remove(trip_id))
        .collect()
}
