//! Asynchronous persistence of accepted readings.
//!
//! Points go through a bounded queue to a fixed pool of worker threads. Each worker
//! collects Line Protocol lines into a batch and posts it when the batch is full or
//! the flush interval has passed. Submitting never blocks: when the queue is full
//! the newest point is dropped.
//!
//! ```text
//! submit --> [bounded queue] --> worker 1..n --> PointSink
//!                                     |
//!                                     +--> errors() --> drain_errors
//! ```
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use thiserror::Error;

use crate::config::WriterParams;
use crate::influx::{PointSink, StoreError, TimeSeriesPoint};
use crate::record::SensorReading;

/// Failures buffered for the drainer before they are logged in place.
const ERROR_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to write {points} points: {source}")]
    Store {
        points: usize,
        #[source]
        source: StoreError,
    },
    #[error("write queue is full, dropped point for {location} at {time}")]
    QueueFull { location: String, time: String },
    #[error("writer is closed, dropped point for {0}")]
    Closed(String),
    #[error("writer workers did not finish within {0:?}")]
    CloseTimeout(Duration),
    #[error("cannot start writer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Lines waiting in one worker until the batch is full or its oldest line is old enough.
struct Batch {
    lines: Vec<String>,
    max_size: usize,
    flush_interval: Duration,
    last_flush: Instant,
}

impl Batch {
    fn new(max_size: usize, flush_interval: Duration) -> Self {
        Batch {
            lines: Vec::with_capacity(max_size),
            max_size,
            flush_interval,
            last_flush: Instant::now(),
        }
    }

    /// Adds a line, returning the batch when it is full.
    fn add(&mut self, line: String) -> Option<Vec<String>> {
        if self.lines.is_empty() {
            self.last_flush = Instant::now();
        }
        self.lines.push(line);
        if self.lines.len() >= self.max_size {
            Some(self.flush())
        } else {
            None
        }
    }

    fn should_flush(&self) -> bool {
        !self.lines.is_empty() && self.last_flush.elapsed() >= self.flush_interval
    }

    /// Time left until a time based flush is due.
    fn time_to_flush(&self) -> Duration {
        if self.lines.is_empty() {
            return self.flush_interval;
        }
        self.flush_interval.saturating_sub(self.last_flush.elapsed())
    }

    fn flush(&mut self) -> Vec<String> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.lines)
    }
}

/// Writes points to a [`PointSink`] from a pool of worker threads.
pub struct PersistenceWriter {
    measurement: String,
    queue: Option<Sender<TimeSeriesPoint>>,
    errors_rx: Receiver<WriteError>,
    finished: Receiver<()>,
    workers: Vec<JoinHandle<()>>,
    close_timeout: Duration,
    submitted: AtomicU64,
    dropped: AtomicU64,
}

impl PersistenceWriter {
    /// Starts the worker threads. The sink is released once all workers are done.
    pub fn new(sink: Arc<dyn PointSink>, measurement: &str, params: &WriterParams) -> Result<Self, WriteError> {
        let (queue_tx, queue_rx) = channel::bounded::<TimeSeriesPoint>(params.queue_capacity);
        let (errors_tx, errors_rx) = channel::bounded::<WriteError>(ERROR_BUFFER);
        let (finished_tx, finished_rx) = channel::bounded::<()>(0);

        let mut workers = Vec::with_capacity(params.workers);
        for index in 0..params.workers {
            let sink = Arc::clone(&sink);
            let queue = queue_rx.clone();
            let errors = errors_tx.clone();
            let finished = finished_tx.clone();
            let batch = Batch::new(params.batch_size, params.flush_interval());
            let handle = thread::Builder::new()
                .name(format!("writer-{}", index))
                .spawn(move || {
                    worker_loop(sink, queue, errors, batch);
                    drop(finished);
                })?;
            workers.push(handle);
        }
        log::debug!(target: "tempfilterd::writer", "Started {} writer threads, queue capacity {}", workers.len(), params.queue_capacity);

        Ok(PersistenceWriter {
            measurement: measurement.to_string(),
            queue: Some(queue_tx),
            errors_rx,
            finished: finished_rx,
            workers,
            close_timeout: params.close_timeout(),
            submitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Queues a point for the reading. Returns `false` if the point was dropped.
    ///
    /// Drops are logged and counted here; the error stream only carries store failures.
    pub fn submit(&self, location: &str, reading: &SensorReading) -> bool {
        let point = TimeSeriesPoint::from_reading(&self.measurement, location, reading);
        let failure = match &self.queue {
            Some(queue) => match queue.try_send(point) {
                Ok(()) => {
                    self.submitted.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(TrySendError::Full(point)) => WriteError::QueueFull {
                    location: point.location,
                    time: point.time.to_rfc3339(),
                },
                Err(TrySendError::Disconnected(point)) => WriteError::Closed(point.location),
            },
            None => WriteError::Closed(location.to_string()),
        };
        self.dropped.fetch_add(1, Ordering::Relaxed);
        log::warn!(target: "tempfilterd::writer", "{}", failure);
        false
    }

    /// Stream of store failures. Iteration ends once the writer is closed and its workers are done.
    pub fn errors(&self) -> Receiver<WriteError> {
        self.errors_rx.clone()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_none()
    }

    /// Stops intake and waits up to the configured close timeout for the workers to
    /// flush their batches.
    ///
    /// Workers still blocked on the database after that are left behind; their
    /// points are lost.
    pub fn close(&mut self) -> Result<(), WriteError> {
        if self.queue.take().is_none() {
            return Ok(());
        }
        let deadline = Instant::now() + self.close_timeout;
        match self.finished.recv_deadline(deadline) {
            Err(channel::RecvTimeoutError::Timeout) => {
                self.workers.clear();
                Err(WriteError::CloseTimeout(self.close_timeout))
            }
            _ => {
                for handle in self.workers.drain(..) {
                    if handle.join().is_err() {
                        log::error!(target: "tempfilterd::writer", "A writer thread panicked!");
                    }
                }
                log::debug!(target: "tempfilterd::writer", "Writer closed, {} points submitted, {} dropped", self.submitted(), self.dropped());
                Ok(())
            }
        }
    }
}

impl Drop for PersistenceWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!(target: "tempfilterd::writer", "Could not close writer: '{}'", err);
        }
    }
}

fn worker_loop(sink: Arc<dyn PointSink>, queue: Receiver<TimeSeriesPoint>, errors: Sender<WriteError>, mut batch: Batch) {
    loop {
        match queue.recv_timeout(batch.time_to_flush()) {
            Ok(point) => {
                if let Some(lines) = batch.add(point.to_line_protocol()) {
                    post(sink.as_ref(), &errors, lines);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                post(sink.as_ref(), &errors, batch.flush());
                return;
            }
        }
        if batch.should_flush() {
            post(sink.as_ref(), &errors, batch.flush());
        }
    }
}

fn post(sink: &dyn PointSink, errors: &Sender<WriteError>, lines: Vec<String>) {
    if lines.is_empty() {
        return;
    }
    if let Err(source) = sink.write_lines(&lines) {
        let failure = WriteError::Store {
            points: lines.len(),
            source,
        };
        if let Err(err) = errors.try_send(failure) {
            log::error!(target: "tempfilterd::writer", "Database write failed: '{}'", err.into_inner());
        }
    }
}

/// Spawns the thread that logs every failure of the writer until it is closed.
pub fn drain_errors(errors: Receiver<WriteError>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name("writer-errors".to_string()).spawn(move || {
        for err in errors.iter() {
            log::error!(target: "tempfilterd::writer", "Database write failed: '{}'", err);
        }
        log::debug!(target: "tempfilterd::writer", "Error stream closed");
    })
}
