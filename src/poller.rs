//! Polling, retry and self-healing around one feed source.
//!
//! A [`FeedPoller`] runs at most one supervisor task at a time. The task owns
//! three timers (regular poll, error retry, watchdog) and the single in-flight
//! fetch, so every state transition happens on that one task. Stopping bumps
//! a generation counter under the status lock before aborting the task; the
//! supervisor checks the generation before touching shared state, so a stale
//! run can never write into a newer one.

use std::any::Any;
use std::fmt;
use std::future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::debug;

use crate::config::PollerOptions;
use crate::error::FeedError;
use crate::events::{EventSink, PollerEvent, TracingSink};
use crate::fetch::{BasicClient, FeedTransport, HttpTransport};
use crate::gtfs_rt::FeedMessage;
use crate::parser::FeedDecoder;
use crate::query::QueryView;

/// Receives every accepted feed message as a [`QueryView`].
///
/// An error or a panic inside a listener is reported to the event sink and
/// otherwise ignored: the remaining listeners are still called and polling
/// carries on.
pub trait FeedListener: Send + Sync {
    fn on_feed(&self, view: &Arc<QueryView>) -> anyhow::Result<()>;
}

impl<F> FeedListener for F
where
    F: Fn(&Arc<QueryView>) -> anyhow::Result<()> + Send + Sync,
{
    fn on_feed(&self, view: &Arc<QueryView>) -> anyhow::Result<()> {
        self(view)
    }
}

/// Handle returned by [`FeedPoller::register_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PollerPhase {
    #[default]
    Stopped,
    Polling,
    /// A failure armed the retry timer.
    Retrying,
}

/// Diagnostic snapshot returned by [`FeedPoller::get_state`].
#[derive(Debug, Clone, PartialEq)]
pub struct PollerState {
    pub source_url: String,
    pub poll_interval: Duration,
    pub retry_interval: Duration,
    pub max_retries: u32,
    pub phase: PollerPhase,
    pub retry_count: u32,
    /// Header timestamp of the last accepted message.
    pub previous_timestamp: Option<u64>,
    pub last_successful_read: Option<DateTime<Utc>>,
    pub listener_count: usize,
    pub watchdog_restarts: u64,
}

#[derive(Debug, Default)]
struct Status {
    phase: PollerPhase,
    retry_count: u32,
    previous_timestamp: Option<u64>,
    last_successful_read: Option<DateTime<Utc>>,
    watchdog_restarts: u64,
}

type FetchFuture = Pin<Box<dyn Future<Output = Result<FeedMessage, FeedError>> + Send>>;

struct Shared {
    options: RwLock<PollerOptions>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn FeedListener>)>>,
    next_listener: AtomicU64,
    run: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    status: Mutex<Status>,
    latest: RwLock<Option<Arc<QueryView>>>,
    transport: Arc<dyn FeedTransport>,
    sink: Arc<dyn EventSink>,
}

/// Polls one GTFS-RT source and fans accepted messages out to listeners.
///
/// Polling runs only while at least one listener is registered. Dropping the
/// poller stops it.
pub struct FeedPoller {
    shared: Arc<Shared>,
}

impl FeedPoller {
    /// A poller fetching over HTTP and logging its events through `tracing`.
    pub fn new(options: PollerOptions) -> Result<Self, FeedError> {
        Self::with_parts(
            options,
            Arc::new(HttpTransport::new(BasicClient::new())),
            Arc::new(TracingSink),
        )
    }

    pub fn with_parts(
        options: PollerOptions,
        transport: Arc<dyn FeedTransport>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, FeedError> {
        options.validate()?;

        Ok(Self {
            shared: Arc::new(Shared {
                options: RwLock::new(options),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                run: Mutex::new(None),
                generation: AtomicU64::new(0),
                status: Mutex::new(Status::default()),
                latest: RwLock::new(None),
                transport,
                sink,
            }),
        })
    }

    /// Replaces the options. A running poller restarts with the new ones
    /// right away; a new source URL also resets the ordering guard.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Config`] and keeps the current options if the new
    /// ones are invalid.
    pub fn configure(&self, options: PollerOptions) -> Result<(), FeedError> {
        options.validate()?;

        let mut run = lock(&self.shared.run);
        let was_running = run.is_some();
        self.shared.stop_locked(&mut run);

        let source_changed = {
            let mut current = write(&self.shared.options);
            let changed = current.source_url != options.source_url;
            *current = options;
            changed
        };
        if source_changed {
            lock(&self.shared.status).previous_timestamp = None;
        }

        if was_running && !lock(&self.shared.listeners).is_empty() {
            self.shared.start_locked(&mut run);
        }
        Ok(())
    }

    /// Adds a listener. The first listener starts polling, with one fetch
    /// issued immediately.
    ///
    /// # Panics
    ///
    /// Starting to poll spawns a task, so this must be called from within a
    /// tokio runtime.
    pub fn register_listener(&self, listener: impl FeedListener + 'static) -> ListenerId {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        let listener: Arc<dyn FeedListener> = Arc::new(listener);
        lock(&self.shared.listeners).push((id, listener));
        self.shared.sync_running();
        id
    }

    /// Removes a listener. Removing the last one stops polling and cancels
    /// every timer. Returns `false` for an unknown id.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let removed = {
            let mut listeners = lock(&self.shared.listeners);
            let before = listeners.len();
            listeners.retain(|(listener_id, _)| *listener_id != id);
            listeners.len() != before
        };
        if removed {
            self.shared.sync_running();
        }
        removed
    }

    pub fn get_state(&self) -> PollerState {
        let options = read(&self.shared.options);
        let status = lock(&self.shared.status);

        PollerState {
            source_url: options.source_url.clone(),
            poll_interval: options.poll_interval,
            retry_interval: options.retry_interval,
            max_retries: options.max_retries,
            phase: status.phase,
            retry_count: status.retry_count,
            previous_timestamp: status.previous_timestamp,
            last_successful_read: status.last_successful_read,
            listener_count: lock(&self.shared.listeners).len(),
            watchdog_restarts: status.watchdog_restarts,
        }
    }

    /// The last accepted message, still valid while newer reads fail.
    pub fn latest(&self) -> Option<Arc<QueryView>> {
        read(&self.shared.latest).clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.run).is_some()
    }

    /// Removes every listener and stops polling.
    pub fn shutdown(&self) {
        lock(&self.shared.listeners).clear();
        let mut run = lock(&self.shared.run);
        self.shared.stop_locked(&mut run);
    }
}

impl Drop for FeedPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Starts or stops the supervisor to match whether anyone is listening.
    fn sync_running(self: &Arc<Self>) {
        let mut run = lock(&self.run);
        if lock(&self.listeners).is_empty() {
            self.stop_locked(&mut run);
        } else {
            self.start_locked(&mut run);
        }
    }

    fn start_locked(self: &Arc<Self>, run: &mut Option<JoinHandle<()>>) {
        if run.is_some() {
            return;
        }

        let options = read(&self.options).clone();
        let Some(decoder) = options.decoder.clone() else {
            return;
        };

        let generation = {
            let mut status = lock(&self.status);
            status.phase = PollerPhase::Polling;
            status.retry_count = 0;
            self.generation.load(Ordering::SeqCst)
        };

        self.sink.emit(PollerEvent::Started {
            source_url: options.source_url.clone(),
        });

        let supervisor = Supervisor {
            shared: Arc::clone(self),
            options,
            decoder,
            generation,
        };
        *run = Some(tokio::spawn(supervisor.run()));
    }

    fn stop_locked(&self, run: &mut Option<JoinHandle<()>>) {
        let Some(task) = run.take() else {
            return;
        };

        {
            let mut status = lock(&self.status);
            self.generation.fetch_add(1, Ordering::SeqCst);
            status.phase = PollerPhase::Stopped;
            status.retry_count = 0;
        }

        task.abort();
        self.sink.emit(PollerEvent::Stopped);
    }
}

/// One run of the poller: owns the timers and the in-flight fetch.
struct Supervisor {
    shared: Arc<Shared>,
    options: PollerOptions,
    decoder: Arc<dyn FeedDecoder>,
    generation: u64,
}

impl Supervisor {
    async fn run(self) {
        let poll = self.options.poll_interval;
        let retry = self.options.retry_interval;
        let patience = poll.saturating_mul(2);

        let mut poll_timer = delayed_interval(poll);
        let mut retry_timer: Option<Interval> = None;
        // Set once the retry budget is spent; only a poll tick re-opens it.
        let mut exhausted = false;
        let watchdog = time::sleep(patience);
        tokio::pin!(watchdog);
        let mut in_flight = Some(self.fetch());

        loop {
            tokio::select! {
                _ = poll_timer.tick() => {
                    retry_timer = None;
                    exhausted = false;
                    let Some(mut status) = self.status() else { return };
                    status.retry_count = 0;
                    status.phase = PollerPhase::Polling;
                    drop(status);

                    if in_flight.is_none() {
                        in_flight = Some(self.fetch());
                    } else {
                        debug!("Fetch still in flight, skipping poll tick");
                    }
                }
                _ = tick(&mut retry_timer) => {
                    if in_flight.is_some() {
                        debug!("Fetch still in flight, skipping retry tick");
                        continue;
                    }

                    let Some(mut status) = self.status() else { return };
                    status.retry_count += 1;

                    if status.retry_count > self.options.max_retries {
                        status.phase = PollerPhase::Polling;
                        drop(status);
                        retry_timer = None;
                        exhausted = true;
                        debug!(
                            max_retries = self.options.max_retries,
                            "Retries exhausted, waiting for the next poll"
                        );
                    } else {
                        drop(status);
                        in_flight = Some(self.fetch());
                    }
                }
                outcome = settle(&mut in_flight) => {
                    in_flight = None;
                    watchdog.as_mut().reset(Instant::now() + patience);

                    match outcome.and_then(|message| self.accept(message)) {
                        Ok(Some(view)) => {
                            retry_timer = None;
                            exhausted = false;
                            self.dispatch(&view);
                        }
                        Ok(None) => return,
                        Err(err) => {
                            let Some(mut status) = self.status() else { return };
                            if retry_timer.is_none() && !exhausted {
                                retry_timer = Some(delayed_interval(retry));
                                status.retry_count = 0;
                                status.phase = PollerPhase::Retrying;
                            }
                            let retry_count = status.retry_count;
                            drop(status);

                            self.shared.sink.emit(PollerEvent::from_error(&err, retry_count));
                        }
                    }
                }
                _ = &mut watchdog => {
                    // Abandon the hung fetch; whatever it eventually returns
                    // is never observed.
                    in_flight = None;
                    self.shared.transport.reset();

                    let Some(mut status) = self.status() else { return };
                    status.watchdog_restarts += 1;
                    status.retry_count = 0;
                    status.phase = PollerPhase::Polling;
                    let restarts = status.watchdog_restarts;
                    drop(status);

                    self.shared.sink.emit(PollerEvent::WatchdogFired { restarts });

                    poll_timer.reset();
                    retry_timer = None;
                    exhausted = false;
                    watchdog.as_mut().reset(Instant::now() + patience);
                    in_flight = Some(self.fetch());
                }
            }
        }
    }

    fn fetch(&self) -> FetchFuture {
        let transport = Arc::clone(&self.shared.transport);
        let decoder = Arc::clone(&self.decoder);
        let url = self.options.source_url.clone();

        Box::pin(async move {
            let bytes = transport.fetch(&url).await?;
            decoder.decode(&bytes)
        })
    }

    /// Applies the ordering guard and, on acceptance, indexes the message.
    ///
    /// `Ok(None)` means this run has been superseded.
    fn accept(&self, message: FeedMessage) -> Result<Option<Arc<QueryView>>, FeedError> {
        let received = message.header.timestamp.ok_or_else(|| FeedError::Decode {
            reason: "feed header carries no timestamp".to_string(),
            excerpt: None,
        })?;

        {
            let Some(status) = self.status() else {
                return Ok(None);
            };
            if let Some(previous) = status.previous_timestamp.filter(|&p| received <= p) {
                return Err(FeedError::OrderingViolation { previous, received });
            }
        }

        let entities = message.entity.len();
        let view = Arc::new(QueryView::new(message, self.options.schedule.as_deref()));

        let Some(mut status) = self.status() else {
            return Ok(None);
        };
        status.previous_timestamp = Some(received);
        status.retry_count = 0;
        status.phase = PollerPhase::Polling;
        status.last_successful_read = Some(Utc::now());
        drop(status);

        *write(&self.shared.latest) = Some(Arc::clone(&view));
        self.shared.sink.emit(PollerEvent::SuccessfulRead {
            feed_timestamp: received,
            entities,
        });
        Ok(Some(view))
    }

    fn dispatch(&self, view: &Arc<QueryView>) {
        let listeners: Vec<(ListenerId, Arc<dyn FeedListener>)> = lock(&self.shared.listeners)
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        for (id, listener) in listeners {
            if !self.is_current() {
                return;
            }

            let err = match panic::catch_unwind(AssertUnwindSafe(|| listener.on_feed(view))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => FeedError::Listener(format!("listener {id} failed: {e:#}")),
                Err(payload) => FeedError::Listener(format!(
                    "listener {id} panicked: {}",
                    panic_message(&*payload)
                )),
            };
            self.shared.sink.emit(PollerEvent::from_error(&err, 0));
        }
    }

    fn is_current(&self) -> bool {
        self.shared.generation.load(Ordering::SeqCst) == self.generation
    }

    /// The status guard, or `None` once this run has been stopped.
    fn status(&self) -> Option<MutexGuard<'_, Status>> {
        let status = lock(&self.shared.status);
        self.is_current().then_some(status)
    }
}

/// An interval whose first tick is one period from now.
fn delayed_interval(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => future::pending().await,
    }
}

async fn settle(in_flight: &mut Option<FetchFuture>) -> Result<FeedMessage, FeedError> {
    match in_flight {
        Some(fetch) => fetch.await,
        None => future::pending().await,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
