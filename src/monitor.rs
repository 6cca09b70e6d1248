//! Lifecycle of one remote source: share connection plus two subscriptions.
//!
//! Acquisition order is connection (with the database's share attached),
//! conversation subscription, message subscription. Everything acquired is pushed onto a [`Teardown`] stack and
//! released in reverse, so subscriptions are always cancelled before the
//! connection they read through is released.

use std::fmt;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{debug, info, trace, warn};

use crate::adapter::ChatDbAdapter;
use crate::config::{MonitorConfig, ResolvedTargets};
use crate::error::{ExportError, MonitorError, ShareError, StreamError};
use crate::exporter::{ExportLocks, ExportOutcome, ExportStats, IncrementalExporter};
use crate::share::{RemoteShareMount, ShareConnection, ShareConnector};
use crate::stream::{CsvRecord, RecordStream, StreamEnd, Subscription};

/// Events held for a caller that is not draining [`ChangeStreamMonitor::events`].
pub const EVENT_CAPACITY: usize = 256;
/// Slots export failures never take, so both end-of-stream events fit even
/// when each delivery thread overshoots the limit by one.
const END_EVENT_RESERVE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Conversations,
    Messages,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Conversations => "conversations",
            StreamKind::Messages => "messages",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorState::Idle => "idle",
            MonitorState::Starting => "starting",
            MonitorState::Running => "running",
            MonitorState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Things that happen on the delivery threads and need the owner's attention.
/// At most [`EVENT_CAPACITY`] are queued; the rest are counted by
/// [`ChangeStreamMonitor::dropped_events`].
#[derive(Debug)]
pub enum MonitorEvent {
    /// The adapter closed the stream normally.
    StreamCompleted { stream: StreamKind },
    /// The stream terminated abnormally and will not be resubscribed.
    StreamFailed {
        stream: StreamKind,
        error: StreamError,
    },
    /// One record could not be appended; later records are still attempted.
    ExportFailed {
        stream: StreamKind,
        error: ExportError,
    },
}

enum Release {
    Connection(ShareConnection),
    Subscription(StreamKind, Subscription),
}

/// Resources held by a running monitor, in acquisition order.
#[derive(Default)]
struct Teardown {
    stack: Vec<Release>,
}

impl Teardown {
    fn push(&mut self, release: Release) {
        self.stack.push(release);
    }

    fn connection(&self) -> Option<&ShareConnection> {
        self.stack.iter().find_map(|r| match r {
            Release::Connection(conn) => Some(conn),
            Release::Subscription(..) => None,
        })
    }

    /// Release everything, newest first. Every action runs; the first
    /// release failure is returned. A share that is already gone counts as
    /// released.
    fn unwind<M: RemoteShareMount>(
        &mut self,
        connector: &ShareConnector<M>,
    ) -> Result<(), ShareError> {
        let mut first_error = None;
        while let Some(release) = self.stack.pop() {
            match release {
                Release::Subscription(kind, mut subscription) => {
                    subscription.cancel();
                    debug!(stream = %kind, "Subscription cancelled");
                }
                Release::Connection(mut conn) => match connector.disconnect(&mut conn) {
                    Ok(()) => {}
                    Err(ShareError::MountNotFound { unc }) => {
                        debug!(%unc, "Share already released");
                    }
                    Err(e) => {
                        warn!(unc = %conn.remote_unc(), error = %e, "Failed to release share");
                        first_error.get_or_insert(e);
                    }
                },
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Watches one remote chat database and appends new records to local exports.
pub struct ChangeStreamMonitor<A, M: RemoteShareMount> {
    config: MonitorConfig,
    targets: ResolvedTargets,
    adapter: A,
    connector: ShareConnector<M>,
    conversations: Arc<IncrementalExporter>,
    messages: Arc<IncrementalExporter>,
    state: MonitorState,
    teardown: Teardown,
    events: EventQueue,
}

/// Bounded event channel that drops instead of blocking a delivery thread.
#[derive(Clone)]
struct EventQueue {
    tx: Sender<MonitorEvent>,
    rx: Receiver<MonitorEvent>,
    dropped: Arc<AtomicUsize>,
}

impl EventQueue {
    fn new() -> Self {
        let (tx, rx) = bounded(EVENT_CAPACITY);
        Self {
            tx,
            rx,
            dropped: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Per-record failures are already logged and counted in [`ExportStats`],
    /// so they give way before the queue fills up.
    fn export_failed(&self, stream: StreamKind, error: ExportError) {
        if self.tx.len() >= EVENT_CAPACITY - END_EVENT_RESERVE {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.push(MonitorEvent::ExportFailed { stream, error });
    }

    fn push(&self, event: MonitorEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(?event, "Event queue full, dropping event");
            }
            // The monitor holds a receiver for as long as it exists.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl<A: ChatDbAdapter, M: RemoteShareMount> ChangeStreamMonitor<A, M> {
    /// Resolve and validate all paths up front; they never change afterwards.
    pub fn new(config: MonitorConfig, adapter: A, mount: M) -> Result<Self, MonitorError> {
        let targets = config.resolve()?;
        let locks = ExportLocks::new();
        let conversations = Arc::new(IncrementalExporter::new(
            targets.conversations_export.clone(),
            &locks,
        ));
        let messages = Arc::new(IncrementalExporter::new(
            targets.messages_export.clone(),
            &locks,
        ));
        Ok(Self {
            config,
            targets,
            adapter,
            connector: ShareConnector::new(mount),
            conversations,
            messages,
            state: MonitorState::Idle,
            teardown: Teardown::default(),
            events: EventQueue::new(),
        })
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn targets(&self) -> &ResolvedTargets {
        &self.targets
    }

    pub fn connection(&self) -> Option<&ShareConnection> {
        self.teardown.connection()
    }

    pub fn mount(&self) -> &M {
        self.connector.mount()
    }

    /// Stream failures and per-record export failures.
    pub fn events(&self) -> Receiver<MonitorEvent> {
        self.events.rx.clone()
    }

    /// Events discarded because the queue was full.
    pub fn dropped_events(&self) -> usize {
        self.events.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self, stream: StreamKind) -> &ExportStats {
        match stream {
            StreamKind::Conversations => self.conversations.stats(),
            StreamKind::Messages => self.messages.stats(),
        }
    }

    /// Connect, point the adapter at the remote database and subscribe to
    /// both streams. On failure everything acquired so far is released
    /// before the error is returned.
    pub fn start(&mut self) -> Result<(), MonitorError> {
        if self.state != MonitorState::Idle {
            return Err(MonitorError::InvalidState(self.state));
        }
        self.state = MonitorState::Starting;
        match self.acquire() {
            Ok(()) => {
                self.state = MonitorState::Running;
                info!(remote = %self.targets.remote_path, "Monitor running");
                Ok(())
            }
            Err(e) => {
                if let Err(release) = self.teardown.unwind(&self.connector) {
                    warn!(error = %release, "Cleanup after failed start was incomplete");
                }
                self.state = MonitorState::Idle;
                Err(e)
            }
        }
    }

    fn acquire(&mut self) -> Result<(), MonitorError> {
        fs::create_dir_all(&self.config.target_dir).map_err(|source| {
            MonitorError::TargetDir {
                path: self.config.target_dir.clone(),
                source,
            }
        })?;

        let connection = self
            .connector
            .connect(&self.targets.host, self.config.credential.as_ref())?;
        let local_path = self.connector.attach(
            &connection,
            &self.targets.remote_path,
            self.config.credential.as_ref(),
        );
        self.teardown.push(Release::Connection(connection));
        let local_path = local_path?;

        self.adapter
            .set_connection(&local_path)
            .map_err(|source| MonitorError::Adapter {
                path: local_path.clone(),
                source,
            })?;

        let stream = self
            .adapter
            .conversations()
            .map_err(|source| subscription_error(StreamKind::Conversations, source))?;
        let subscription = self.deliver(StreamKind::Conversations, stream)?;
        self.teardown
            .push(Release::Subscription(StreamKind::Conversations, subscription));

        let stream = self
            .adapter
            .messages()
            .map_err(|source| subscription_error(StreamKind::Messages, source))?;
        let subscription = self.deliver(StreamKind::Messages, stream)?;
        self.teardown
            .push(Release::Subscription(StreamKind::Messages, subscription));

        Ok(())
    }

    fn deliver<R>(
        &self,
        kind: StreamKind,
        stream: RecordStream<R>,
    ) -> Result<Subscription, MonitorError>
    where
        R: CsvRecord + Send + 'static,
    {
        let exporter = match kind {
            StreamKind::Conversations => Arc::clone(&self.conversations),
            StreamKind::Messages => Arc::clone(&self.messages),
        };
        let record_events = self.events.clone();
        let end_events = self.events.clone();

        let subscription = stream
            .subscribe(
                kind.as_str(),
                move |record: R| match exporter.export(&record) {
                    Ok(ExportOutcome::Appended) => {
                        trace!(stream = %kind, "Record appended");
                    }
                    Ok(ExportOutcome::Skipped) => {
                        trace!(stream = %kind, "Record rendered empty, skipped");
                    }
                    Err(error) => {
                        warn!(stream = %kind, error = %error, "Export failed");
                        record_events.export_failed(kind, error);
                    }
                },
                move |end| {
                    let event = match end {
                        StreamEnd::Completed => {
                            info!(stream = %kind, "Stream completed");
                            MonitorEvent::StreamCompleted { stream: kind }
                        }
                        StreamEnd::Failed(error) => {
                            warn!(stream = %kind, error = %error, "Stream failed");
                            MonitorEvent::StreamFailed {
                                stream: kind,
                                error,
                            }
                        }
                    };
                    end_events.push(event);
                },
            )
            .map_err(|source| subscription_error(kind, source))?;

        info!(stream = %kind, "Subscribed");
        Ok(subscription)
    }

    /// Cancel both subscriptions, then release the share. Calling it on an
    /// idle monitor does nothing.
    pub fn stop(&mut self) -> Result<(), MonitorError> {
        if self.state == MonitorState::Idle {
            return Ok(());
        }
        self.state = MonitorState::Stopping;
        let result = self.teardown.unwind(&self.connector);
        self.state = MonitorState::Idle;
        info!(remote = %self.targets.remote_path, "Monitor stopped");
        result.map_err(MonitorError::from)
    }
}

fn subscription_error(stream: StreamKind, source: StreamError) -> MonitorError {
    MonitorError::StreamSubscription { stream, source }
}

impl<A, M: RemoteShareMount> Drop for ChangeStreamMonitor<A, M> {
    fn drop(&mut self) {
        if self.state == MonitorState::Idle {
            return;
        }
        if let Err(e) = self.teardown.unwind(&self.connector) {
            warn!(error = %e, "Release on drop failed");
        }
        self.state = MonitorState::Idle;
    }
}
