use async_trait::async_trait;
use bytes::Bytes;
use chrono_tz::Tz;
use gtfs_rt_toolkit::events::ChannelSink;
use gtfs_rt_toolkit::fetch::FeedTransport;
use gtfs_rt_toolkit::gtfs_rt::trip_update::{StopTimeEvent, StopTimeUpdate};
use gtfs_rt_toolkit::gtfs_rt::{FeedEntity, FeedHeader, FeedMessage, TripDescriptor, TripUpdate};
use gtfs_rt_toolkit::index::IndexBuilder;
use gtfs_rt_toolkit::parser::parse_feed;
use gtfs_rt_toolkit::schedule::ScheduleProvider;
use gtfs_rt_toolkit::summary::FeedSummary;
use gtfs_rt_toolkit::{FeedError, FeedPoller, FeedSettings, QueryView};
use prost::Message;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[test]
fn test_full_pipeline() {
    let bytes = feed(
        100,
        vec![entity(
            "e1",
            update("T1", "R1", vec![arriving("A", 150), arriving("B", 200)]),
        )],
    )
    .encode_to_vec();

    let message = parse_feed(&bytes).expect("Failed to parse feed");
    let view = QueryView::new(message, None);

    assert_eq!(view.feed_timestamp(), 100);
    assert_eq!(view.onward_stops("T1"), vec!["A", "B"]);
    assert_eq!(view.expected_arrival("T1", "A"), Some(150));
    assert_eq!(view.trips_servicing_route("R1"), ["T1".to_string()]);

    let summary = FeedSummary::from_view(&view);
    assert_eq!(summary.total_entities, 1);
    assert_eq!(summary.monitored_trips, 1);
}

#[test]
fn test_duplicate_trip_updates_keep_later_prediction() {
    let early = entity("a", update("T2", "R2", vec![arriving("S", 500)]));
    let late = entity("b", update("T2", "R2", vec![arriving("S", 600)]));

    for entities in [vec![early.clone(), late.clone()], vec![late, early]] {
        let view = QueryView::new(feed(100, entities), None);

        assert_eq!(view.expected_arrival("T2", "S"), Some(600));
        assert_eq!(view.stats().duplicate_trip_updates, 1);
    }
}

#[test]
fn test_stop_queries_are_time_ordered() {
    let view = QueryView::new(
        feed(
            100,
            vec![
                entity("1", update("T1", "R1", vec![arriving("X", 110), arriving("S", 900)])),
                entity("2", update("T2", "R2", vec![arriving("S", 300)])),
                entity("3", update("T3", "R1", vec![arriving("S", 600)])),
                entity("4", update("T4", "R1", vec![stop_without_time("S")])),
            ],
        ),
        None,
    );

    assert_eq!(view.trips_servicing_stop("S"), vec!["T2", "T3", "T1", "T4"]);
    assert_eq!(
        view.trips_servicing_stop_for_route("S", "R1"),
        vec!["T3", "T1", "T4"]
    );
    assert_eq!(view.expected_arrival("T4", "S"), None);
}

#[test]
fn test_passed_stops_are_pruned() {
    let view = QueryView::new(
        feed(
            1_000,
            vec![entity(
                "1",
                update(
                    "T1",
                    "R1",
                    vec![arriving("A", 900), arriving("B", 950), arriving("C", 1_100)],
                ),
            )],
        ),
        None,
    );

    assert_eq!(view.onward_stops("T1"), vec!["C"]);
    assert_eq!(view.next_stop("T1"), Some("C"));
    assert!(view.trips_servicing_stop("A").is_empty());
    assert_eq!(view.stats().pruned_stop_time_updates, 2);
}

#[test]
fn test_schedule_interpolation_with_delay() {
    // 2024-03-01T00:00:00Z
    let midnight = 1_709_251_200;

    let mut trip_update = update(
        "T1",
        "R1",
        vec![
            StopTimeUpdate {
                stop_id: Some("A".to_string()),
                arrival: Some(StopTimeEvent {
                    delay: Some(120),
                    ..Default::default()
                }),
                ..Default::default()
            },
            stop_without_time("B"),
        ],
    );
    trip_update.trip.start_date = Some("20240301".to_string());
    let message = feed(midnight, vec![entity("1", trip_update)]);

    let indices = IndexBuilder::new()
        .with_schedule(&StaticSchedule)
        .with_timezone(Tz::UTC)
        .build(&message);
    let view = QueryView::from_parts(Arc::new(message), indices);

    assert_eq!(view.expected_arrival("T1", "A"), Some(midnight as i64 + 8 * 3600 + 120));
    // 25:10:00 rolls over into the next day; the delay carries forward.
    assert_eq!(
        view.expected_arrival("T1", "B"),
        Some(midnight as i64 + 86_400 + 3600 + 600 + 120)
    );
    assert_eq!(view.expected_departure("T1", "B"), None);
}

#[test]
fn test_settings_file_to_options() {
    let path = std::env::temp_dir().join("gtfs_rt_toolkit_settings.json");
    std::fs::write(
        &path,
        r#"{
            "source_url": "http://feed.example/tripupdates",
            "poll_interval_seconds": 15,
            "max_retries": 2,
            "api_key": { "type": "header", "name": "x-api-key", "key": "secret" }
        }"#,
    )
    .unwrap();

    let settings = FeedSettings::load(path.to_str().unwrap()).unwrap();
    let options = settings.to_options().unwrap();

    assert_eq!(options.poll_interval, Duration::from_secs(15));
    assert_eq!(options.retry_interval, Duration::from_secs(1));
    assert_eq!(options.max_retries, 2);
    assert!(gtfs_rt_toolkit::fetch::client_for(settings.api_key.as_ref()).is_ok());

    std::fs::remove_file(path).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_poller_delivers_views_and_keeps_last_good() {
    let transport = Arc::new(MemoryTransport::new(vec![100, 200]));
    let (sink, _events) = ChannelSink::new();
    let options = gtfs_rt_toolkit::PollerOptions::new("memory://feed", Duration::from_secs(10));
    let poller = FeedPoller::with_parts(options, transport, Arc::new(sink)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    poller.register_listener(move |view: &Arc<QueryView>| -> anyhow::Result<()> {
        recorder.lock().unwrap().push(view.feed_timestamp());
        Ok(())
    });

    tokio::time::sleep(Duration::from_secs(25)).await;

    // The third read fails; the last accepted view stays available.
    assert_eq!(*seen.lock().unwrap(), vec![100, 200]);
    assert_eq!(poller.latest().map(|view| view.feed_timestamp()), Some(200));
    assert_eq!(poller.get_state().previous_timestamp, Some(200));

    poller.shutdown();
    assert!(!poller.is_running());
}

// Helpers

struct MemoryTransport {
    timestamps: Mutex<VecDeque<u64>>,
}

impl MemoryTransport {
    fn new(timestamps: Vec<u64>) -> Self {
        Self {
            timestamps: Mutex::new(timestamps.into()),
        }
    }
}

#[async_trait]
impl FeedTransport for MemoryTransport {
    async fn fetch(&self, _url: &str) -> Result<Bytes, FeedError> {
        let next = self.timestamps.lock().unwrap().pop_front();
        match next {
            Some(timestamp) => Ok(Bytes::from(feed(timestamp, vec![]).encode_to_vec())),
            None => Err(FeedError::Transport("feed unavailable".to_string())),
        }
    }
}

struct StaticSchedule;

impl ScheduleProvider for StaticSchedule {
    fn scheduled_arrival(&self, _trip_id: &str, stop_id: &str, _seq: Option<u32>) -> Option<String> {
        match stop_id {
            "A" => Some("08:00:00".to_string()),
            "B" => Some("25:10:00".to_string()),
            _ => None,
        }
    }

    fn scheduled_departure(&self, _trip_id: &str, _stop_id: &str, _seq: Option<u32>) -> Option<String> {
        None
    }
}

fn feed(timestamp: u64, entity: Vec<FeedEntity>) -> FeedMessage {
    FeedMessage {
        header: FeedHeader {
            gtfs_realtime_version: "2.0".to_string(),
            timestamp: Some(timestamp),
            ..Default::default()
        },
        entity,
    }
}

fn entity(id: &str, trip_update: TripUpdate) -> FeedEntity {
    FeedEntity {
        id: id.to_string(),
        trip_update: Some(trip_update),
        ..Default::default()
    }
}

fn update(trip_id: &str, route_id: &str, stops: Vec<StopTimeUpdate>) -> TripUpdate {
    TripUpdate {
        trip: TripDescriptor {
            trip_id: Some(trip_id.to_string()),
            route_id: Some(route_id.to_string()),
            ..Default::default()
        },
        stop_time_update: stops,
        ..Default::default()
    }
}

fn arriving(stop_id: &str, time: i64) -> StopTimeUpdate {
    StopTimeUpdate {
        stop_id: Some(stop_id.to_string()),
        arrival: Some(StopTimeEvent {
            time: Some(time),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn stop_without_time(stop_id: &str) -> StopTimeUpdate {
    StopTimeUpdate {
        stop_id: Some(stop_id.to_string()),
        ..Default::default()
    }
}
