//! Push-based record streams.
//!
//! A producer (the database adapter) owns a [`RecordSender`]; the consumer
//! turns the matching [`RecordStream`] into a [`Subscription`], which runs the
//! handler on a dedicated delivery thread in emission order. Cancelling the
//! subscription joins that thread, so no handler call can start after
//! [`Subscription::cancel`] returns. A producer running on its own thread can
//! hand its handle to the stream with [`RecordStream::with_producer`]; it is
//! joined on cancel too, once it has noticed the consumer is gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{
    Receiver, RecvTimeoutError, Sender, TryRecvError, bounded, select, unbounded,
};

use crate::error::StreamError;

/// A record that knows how to render itself as one delimited line.
pub trait CsvRecord {
    /// Append this record's line (without terminator) to `out`.
    fn build_csv(&self, out: &mut String);
}

impl CsvRecord for String {
    fn build_csv(&self, out: &mut String) {
        out.push_str(self);
    }
}

impl CsvRecord for str {
    fn build_csv(&self, out: &mut String) {
        out.push_str(self);
    }
}

/// Create a connected producer/consumer pair.
pub fn record_channel<T>() -> (RecordSender<T>, RecordStream<T>) {
    let (tx, rx) = unbounded();
    let (alive_tx, alive_rx) = bounded::<()>(0);
    (
        RecordSender {
            tx,
            closed: alive_rx,
        },
        RecordStream {
            rx,
            alive: alive_tx,
            producer: None,
        },
    )
}

/// Producer half. Dropping it completes the stream.
pub struct RecordSender<T> {
    tx: Sender<Result<T, StreamError>>,
    closed: Receiver<()>,
}

impl<T> RecordSender<T> {
    /// Emit a record. Returns `false` once nobody is listening anymore.
    pub fn send(&self, record: T) -> bool {
        !self.is_closed() && self.tx.send(Ok(record)).is_ok()
    }

    /// Terminate the stream abnormally.
    pub fn fail(self, error: StreamError) {
        let _ = self.tx.send(Err(error));
    }

    /// The consumer has gone away (stream dropped or subscription cancelled).
    pub fn is_closed(&self) -> bool {
        matches!(self.closed.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep up to `timeout`, waking early if the consumer goes away.
    /// Returns `true` if it did.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        matches!(
            self.closed.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

/// How a stream ended, if it ended on its own.
#[derive(Debug)]
pub enum StreamEnd {
    /// The producer finished and dropped its sender.
    Completed,
    /// The producer reported a terminal error.
    Failed(StreamError),
}

/// Consumer half, not yet subscribed.
pub struct RecordStream<T> {
    rx: Receiver<Result<T, StreamError>>,
    alive: Sender<()>,
    producer: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> RecordStream<T> {
    /// Tie the thread feeding the [`RecordSender`] to this stream. It must
    /// return once [`RecordSender::send`] fails or
    /// [`RecordSender::wait_closed`] reports the close.
    pub fn with_producer(mut self, producer: JoinHandle<()>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Start delivering records to `on_record` on a new thread named after
    /// `name`. `on_end` runs once if the stream completes or fails; it does
    /// not run after cancellation.
    pub fn subscribe<F, E>(
        self,
        name: &str,
        mut on_record: F,
        on_end: E,
    ) -> Result<Subscription, StreamError>
    where
        F: FnMut(T) + Send + 'static,
        E: FnOnce(StreamEnd) + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker_cancelled = Arc::clone(&cancelled);
        let RecordStream {
            rx,
            alive,
            producer,
        } = self;

        let worker = thread::Builder::new()
            .name(format!("{name}-stream"))
            .spawn(move || {
                // Held until the worker exits so the producer sees the close.
                let _alive = alive;
                let end = loop {
                    let next = select! {
                        recv(cancel_rx) -> _ => None,
                        recv(rx) -> msg => Some(msg),
                    };
                    match next {
                        None => return,
                        Some(Ok(Ok(record))) => {
                            if worker_cancelled.load(Ordering::Acquire) {
                                return;
                            }
                            on_record(record);
                        }
                        Some(Ok(Err(e))) => break StreamEnd::Failed(e),
                        Some(Err(_)) => break StreamEnd::Completed,
                    }
                };
                if !worker_cancelled.load(Ordering::Acquire) {
                    on_end(end);
                }
            })
            .map_err(StreamError::Spawn)?;

        Ok(Subscription {
            name: name.to_string(),
            cancel: Some(cancel_tx),
            cancelled,
            worker: Some(worker),
            producer,
        })
    }
}

/// Handle to a running delivery thread. Cancels on drop.
pub struct Subscription {
    name: String,
    cancel: Option<Sender<()>>,
    cancelled: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    producer: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The delivery thread is still running.
    pub fn is_active(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Stop delivery. Waits for an in-flight handler call to finish and for
    /// the producer thread to exit, unless called from that handler, in which
    /// case both stop after it returns.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        drop(self.cancel.take());
        let Some(worker) = self.worker.take() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            // The producer only sees the close once this handler returns.
            drop(self.producer.take());
            return;
        }
        if worker.join().is_err() {
            tracing::warn!(stream = %self.name, "Delivery thread panicked");
        }
        if let Some(producer) = self.producer.take()
            && producer.join().is_err()
        {
            tracing::warn!(stream = %self.name, "Producer thread panicked");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn delivers_in_emission_order_then_completes() {
        let (sender, stream) = record_channel::<u32>();
        let (seen_tx, seen_rx) = unbounded();
        let (end_tx, end_rx) = unbounded();
        let _sub = stream
            .subscribe(
                "numbers",
                move |n| seen_tx.send(n).unwrap(),
                move |end| end_tx.send(end).unwrap(),
            )
            .unwrap();

        for n in 0..100 {
            assert!(sender.send(n));
        }
        drop(sender);

        let end = end_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(end, StreamEnd::Completed));
        let seen: Vec<u32> = seen_rx.try_iter().collect();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn failure_is_reported_once() {
        let (sender, stream) = record_channel::<u32>();
        let (end_tx, end_rx) = unbounded();
        let _sub = stream
            .subscribe("failing", |_| {}, move |end| end_tx.send(end).unwrap())
            .unwrap();

        sender.fail(StreamError::Terminated("disk went away".into()));
        match end_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            StreamEnd::Failed(StreamError::Terminated(reason)) => {
                assert_eq!(reason, "disk went away");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(end_rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn no_delivery_after_cancel_returns() {
        let (sender, stream) = record_channel::<u32>();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let (end_tx, end_rx) = unbounded::<StreamEnd>();
        let mut sub = stream
            .subscribe(
                "cancelled",
                move |n| sink.lock().unwrap().push(n),
                move |end| end_tx.send(end).unwrap(),
            )
            .unwrap();

        sender.send(1);
        sub.cancel();
        assert!(!sub.is_active());
        let count = seen.lock().unwrap().len();

        assert!(!sender.send(2));
        assert!(sender.is_closed());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(seen.lock().unwrap().len(), count);
        assert!(end_rx.try_recv().is_err());

        sub.cancel();
    }

    #[test]
    fn cancel_waits_for_the_producer_to_exit() {
        let (sender, stream) = record_channel::<u32>();
        let exited = Arc::new(AtomicBool::new(false));
        let producer_exited = Arc::clone(&exited);
        let producer = thread::spawn(move || {
            let mut n = 0;
            while sender.send(n) {
                n += 1;
                if sender.wait_closed(Duration::from_millis(5)) {
                    break;
                }
            }
            // Stand-in for closing a database handle.
            thread::sleep(Duration::from_millis(50));
            producer_exited.store(true, Ordering::Release);
        });

        let (seen_tx, seen_rx) = unbounded();
        let mut sub = stream
            .with_producer(producer)
            .subscribe("produced", move |n| seen_tx.send(n).unwrap(), |_| {})
            .unwrap();
        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        sub.cancel();
        assert!(exited.load(Ordering::Acquire));
    }

    #[test]
    fn dropping_the_stream_closes_the_sender() {
        let (sender, stream) = record_channel::<u32>();
        assert!(!sender.is_closed());
        drop(stream);
        assert!(sender.is_closed());
        assert!(sender.wait_closed(Duration::from_secs(1)));
    }

    #[test]
    fn cancel_from_inside_the_handler_does_not_deadlock() {
        let (sender, stream) = record_channel::<u32>();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let handler_slot = Arc::clone(&slot);
        let (done_tx, done_rx) = unbounded();
        let sub = stream
            .subscribe(
                "self-cancel",
                move |_| {
                    if let Some(mut sub) = handler_slot.lock().unwrap().take() {
                        sub.cancel();
                        done_tx.send(()).unwrap();
                    }
                },
                |_| {},
            )
            .unwrap();
        *slot.lock().unwrap() = Some(sub);

        sender.send(1);
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(sender.wait_closed(Duration::from_secs(5)));
    }
}
