//! Static GTFS schedule lookups used to interpolate missing predictions.

/// Source of scheduled stop times, keyed by trip, stop and stop sequence.
///
/// Times are GTFS `HH:MM:SS` strings relative to the trip's service date;
/// hours may exceed 23. Returning `None` means the schedule has no entry, in
/// which case the stop is left without an interpolated prediction.
pub trait ScheduleProvider: Send + Sync {
    fn scheduled_arrival(
        &self,
        trip_id: &str,
        stop_id: &str,
        stop_sequence: Option<u32>,
    ) -> Option<String>;

    fn scheduled_departure(
        &self,
        trip_id: &str,
        stop_id: &str,
        stop_sequence: Option<u32>,
    ) -> Option<String>;
}
