//! Builders for feed messages used across unit tests.

use crate::gtfs_rt::trip_update::{StopTimeEvent, StopTimeUpdate};
use crate::gtfs_rt::{
    Alert, EntitySelector, FeedEntity, FeedHeader, FeedMessage, TripDescriptor, TripUpdate,
    VehiclePosition,
};

pub fn header(timestamp: u64) -> FeedHeader {
    FeedHeader {
        gtfs_realtime_version: "2.0".to_string(),
        timestamp: Some(timestamp),
        incrementality: None,
        feed_version: None,
    }
}

pub fn message(timestamp: u64, entity: Vec<FeedEntity>) -> FeedMessage {
    FeedMessage {
        header: header(timestamp),
        entity,
    }
}

pub fn descriptor(trip_id: &str, route_id: &str) -> TripDescriptor {
    TripDescriptor {
        trip_id: Some(trip_id.to_string()),
        route_id: Some(route_id.to_string()),
        ..Default::default()
    }
}

pub fn event(time: i64) -> StopTimeEvent {
    StopTimeEvent {
        time: Some(time),
        ..Default::default()
    }
}

pub fn delay_event(delay: i32) -> StopTimeEvent {
    StopTimeEvent {
        delay: Some(delay),
        ..Default::default()
    }
}

pub fn stop(stop_id: &str, arrival: Option<i64>, departure: Option<i64>) -> StopTimeUpdate {
    StopTimeUpdate {
        stop_id: Some(stop_id.to_string()),
        arrival: arrival.map(event),
        departure: departure.map(event),
        ..Default::default()
    }
}

pub fn arriving(stop_id: &str, arrival: i64) -> StopTimeUpdate {
    stop(stop_id, Some(arrival), None)
}

pub fn trip_update(trip_id: &str, route_id: &str, stops: Vec<StopTimeUpdate>) -> TripUpdate {
    TripUpdate {
        trip: descriptor(trip_id, route_id),
        stop_time_update: stops,
        ..Default::default()
    }
}

pub fn trip_update_entity(id: &str, update: TripUpdate) -> FeedEntity {
    FeedEntity {
        id: id.to_string(),
        trip_update: Some(update),
        ..Default::default()
    }
}

pub fn vehicle_entity(id: &str, trip_id: &str, route_id: &str, timestamp: u64) -> FeedEntity {
    FeedEntity {
        id: id.to_string(),
        vehicle: Some(VehiclePosition {
            trip: Some(descriptor(trip_id, route_id)),
            timestamp: Some(timestamp),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn alert_entity(id: &str, trips: &[(&str, &str)]) -> FeedEntity {
    FeedEntity {
        id: id.to_string(),
        alert: Some(Alert {
            informed_entity: trips
                .iter()
                .map(|(trip_id, route_id)| EntitySelector {
                    trip: Some(descriptor(trip_id, route_id)),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
        ..Default::default()
    }
}
