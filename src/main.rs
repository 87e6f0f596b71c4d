//! CLI entry point for the GTFS-RT toolkit.
//!
//! Provides subcommands for inspecting a single feed message and for
//! watching a live feed through the poller.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use gtfs_rt_toolkit::{
    FeedPoller, FeedSettings, QueryView,
    events::{ChannelSink, EventSink, TracingSink},
    fetch::{BasicClient, HttpTransport, client_for, fetch_bytes},
    output::{SummaryLog, append_record, print_json},
    parser::parse_feed,
    summary::FeedSummary,
    time_utils,
};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfs_rt_toolkit")]
#[command(about = "Poll, index and query GTFS-RT feeds", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read one GTFS-RT message from a file or URL and summarize it
    Inspect {
        /// Path to file or URL to fetch
        #[arg(value_name = "FILE_OR_URL")]
        source: String,

        /// CSV file to append the summary to
        #[arg(short, long)]
        output: Option<String>,

        /// IANA timezone used to render feed times
        #[arg(short, long, env = "AGENCY_TIMEZONE")]
        timezone: Option<String>,

        /// List the trips calling at this stop, soonest first
        #[arg(short, long)]
        stop: Option<String>,
    },
    /// Poll a feed and append a summary row for every read, failed or not
    Watch {
        /// JSON feed settings file
        #[arg(short, long, env = "FEED_CONFIG")]
        config: Option<String>,

        /// Feed URL, used when no settings file is given
        #[arg(short, long, env = "FEED_URL")]
        url: Option<String>,

        /// Poll interval in seconds, used with --url
        #[arg(short, long, default_value_t = 30.0)]
        interval: f64,

        /// CSV file to append summaries to
        #[arg(short, long, default_value = "feed_summaries.csv")]
        output: String,

        /// Number of messages to collect (0 = until Ctrl+C)
        #[arg(short = 'n', long, default_value_t = 0)]
        samples: usize,

        /// IANA timezone, overriding the settings file
        #[arg(short, long, env = "AGENCY_TIMEZONE")]
        timezone: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    let _file_guard = init_tracing()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect {
            source,
            output,
            timezone,
            stop,
        } => {
            if let Some(name) = &timezone {
                time_utils::set_agency_timezone_name(name)?;
            }
            inspect(&source, output.as_deref(), stop.as_deref()).await?;
        }
        Commands::Watch {
            config,
            url,
            interval,
            output,
            samples,
            timezone,
        } => {
            let mut settings = match (config, url) {
                (Some(path), _) => FeedSettings::load(&path)
                    .with_context(|| format!("loading feed settings from {path}"))?,
                (None, Some(url)) => FeedSettings::for_url(url, interval),
                (None, None) => bail!("either --config or --url is required"),
            };
            if timezone.is_some() {
                settings.agency_timezone = timezone;
            }
            watch(&settings, &output, samples).await?;
        }
    }

    Ok(())
}

/// Logging setup: colored stderr + JSON rolling log file
fn init_tracing() -> Result<WorkerGuard> {
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/gtfs_rt_toolkit.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_rt_toolkit.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    Ok(file_guard)
}

/// Reads, indexes and summarizes a single feed message.
#[tracing::instrument(skip(output, stop))]
async fn inspect(source: &str, output: Option<&str>, stop: Option<&str>) -> Result<()> {
    let read = async {
        let bytes = fetcher(source).await?;
        Ok::<_, gtfs_rt_toolkit::FeedError>(parse_feed(&bytes)?)
    };

    let message = match read.await {
        Ok(message) => message,
        Err(e) => {
            if let Some(path) = output {
                append_record(path, &FeedSummary::from_error(&e).with_source(source))?;
            }
            return Err(e.into());
        }
    };

    let view = QueryView::new(message, None);
    let summary = FeedSummary::from_view(&view).with_source(source);
    print_json(&summary)?;

    if let Some(stop_id) = stop {
        log_stop_departures(&view, stop_id);
    }
    if let Some(path) = output {
        append_record(path, &summary)?;
    }
    Ok(())
}

fn log_stop_departures(view: &QueryView, stop_id: &str) {
    let visits = view.stop_visits(stop_id);
    if visits.is_empty() {
        warn!(stop_id, "No monitored trips call at this stop");
        return;
    }

    for visit in visits {
        let expected = visit
            .predicted
            .and_then(|time| time_utils::format_timestamp(time, Some("%H:%M:%S")));
        info!(
            stop_id,
            trip_id = %visit.trip_id,
            route_id = view.route_of(&visit.trip_id).unwrap_or(""),
            expected = expected.as_deref().unwrap_or("unknown"),
            destination = view.destination_stop(&visit.trip_id).unwrap_or(""),
            "Trip at stop"
        );
    }
}

/// Runs a poller until enough messages were collected or Ctrl+C.
///
/// Accepted messages and failed reads both become CSV rows; every poller
/// event is still logged.
#[tracing::instrument(skip_all, fields(source = %settings.source_url))]
async fn watch(settings: &FeedSettings, output: &str, samples: usize) -> Result<()> {
    if let Some(name) = &settings.agency_timezone {
        time_utils::set_agency_timezone_name(name)?;
    }

    let options = settings.to_options()?;
    let transport = HttpTransport::from_client(client_for(settings.api_key.as_ref())?);
    let (sink, mut events) = ChannelSink::new();
    let poller = FeedPoller::with_parts(options, Arc::new(transport), Arc::new(sink))?;
    let mut log = SummaryLog::open(output)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    poller.register_listener(move |view: &Arc<QueryView>| -> Result<()> {
        tx.send(Arc::clone(view))?;
        Ok(())
    });

    if samples == 0 {
        info!("Watching feed. Press Ctrl+C to stop.");
    } else {
        info!(samples, "Watching feed");
    }

    let mut collected = 0;
    loop {
        tokio::select! {
            view = rx.recv() => {
                let Some(view) = view else { break };
                let summary = FeedSummary::from_view(&view).with_source(&settings.source_url);
                log.append(&summary)?;
                collected += 1;

                info!(
                    sample = collected,
                    feed_timestamp = summary.feed_timestamp,
                    monitored_trips = summary.monitored_trips,
                    prediction_pct = summary.prediction_pct(),
                    "Summary written"
                );

                if samples > 0 && collected >= samples {
                    break;
                }
            }
            Some(event) = events.recv() => {
                if let Some(failed) = FeedSummary::from_event(&event) {
                    log.append(&failed.with_source(&settings.source_url))?;
                }
                TracingSink.emit(event);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let state = poller.get_state();
    poller.shutdown();
    info!(
        collected,
        rows = log.rows(),
        failed_reads = log.errors(),
        watchdog_restarts = state.watchdog_restarts,
        last_read = ?state.last_successful_read,
        "Stopped watching"
    );
    Ok(())
}

/// Loads feed data from a local file path or fetches it over HTTP.
#[tracing::instrument(fields(source = %url))]
async fn fetcher(url: &str) -> Result<Vec<u8>, gtfs_rt_toolkit::FeedError> {
    let bytes = if url.starts_with("http") {
        let client = BasicClient::new();
        fetch_bytes(&client, url).await?.to_vec()
    } else {
        std::fs::read(url)
            .map_err(|e| gtfs_rt_toolkit::FeedError::Transport(format!("cannot read {url}: {e}")))?
    };
    Ok(bytes)
}
