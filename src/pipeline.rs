//! The ingestion pipeline: broker subscription, receive loop and the
//! dedup → decode → allowlist → persist sequence for every payload.
use std::fmt;
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;

use crate::allowlist::IdentityAllowlist;
use crate::config::MqttParams;
use crate::dedup::DeduplicationFilter;
use crate::mqtt::{Broker, BrokerError};
use crate::record::RawRecord;
use crate::service::{Program, StopSignal};
use crate::writer::{drain_errors, PersistenceWriter, WriteError};

/// How long the receive loop waits for a message before it checks the stop signal.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unable to connect to the broker: {0}")]
    Connect(#[source] BrokerError),
    #[error("unable to subscribe to '{topic}': {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },
    #[error("receiving from the broker failed: {0}")]
    Receive(#[source] BrokerError),
    #[error("unable to unsubscribe from '{topic}': {source}")]
    Unsubscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },
    #[error("persistence writer did not close: {0}")]
    WriterClose(#[source] WriteError),
    #[error("cannot start the error drain thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Disconnected,
    Connecting,
    Subscribed,
    Receiving,
    Stopping,
    Stopped,
}

/// What happened to one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Same bytes as the payload right before it.
    Duplicate,
    /// Not JSON, or an allowlisted sensor's record with the wrong shape.
    Malformed,
    /// Not from an allowlisted sensor. `None` when the record carries no identity.
    UnknownSensor(Option<u32>),
    /// Handed to the writer.
    Submitted { location: String },
    /// The writer's queue was full.
    Dropped { location: String },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub received: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub unknown: u64,
    pub submitted: u64,
    pub dropped: u64,
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received {}, duplicates {}, malformed {}, unknown sensors {}, submitted {}, dropped {}",
            self.received, self.duplicates, self.malformed, self.unknown, self.submitted, self.dropped
        )
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub topic: String,
    pub qos: i32,
    pub poll_interval: Duration,
    pub disconnect_timeout: Duration,
}

impl From<&MqttParams> for PipelineSettings {
    fn from(params: &MqttParams) -> Self {
        PipelineSettings {
            topic: params.topic.clone(),
            qos: params.qos,
            poll_interval: DEFAULT_POLL_INTERVAL,
            disconnect_timeout: params.disconnect_timeout(),
        }
    }
}

type Connector<B> = Box<dyn FnOnce() -> Result<B, BrokerError> + Send>;

/// Owns the broker session and the writer for as long as it runs.
pub struct IngestionPipeline<B: Broker> {
    settings: PipelineSettings,
    allowlist: IdentityAllowlist,
    dedup: DeduplicationFilter,
    writer: PersistenceWriter,
    connector: Option<Connector<B>>,
    state: PipelineState,
    stats: PipelineStats,
}

impl<B: Broker> IngestionPipeline<B> {
    /// `connect` is called once, on the pipeline's own thread, when the pipeline runs.
    pub fn new<C>(settings: PipelineSettings, allowlist: IdentityAllowlist, writer: PersistenceWriter, connect: C) -> Self
    where
        C: FnOnce() -> Result<B, BrokerError> + Send + 'static,
    {
        IngestionPipeline {
            settings,
            allowlist,
            dedup: DeduplicationFilter::new(),
            writer,
            connector: Some(Box::new(connect)),
            state: PipelineState::Disconnected,
            stats: PipelineStats::default(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    fn transition(&mut self, next: PipelineState) {
        log::info!(target: "tempfilterd::pipeline", "Pipeline {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Runs one payload through dedup, decode, the allowlist and the writer.
    pub fn handle_payload(&mut self, payload: &[u8]) -> Outcome {
        self.stats.received += 1;

        if self.dedup.is_duplicate(payload) {
            self.stats.duplicates += 1;
            log::trace!(target: "tempfilterd::pipeline", "Dropping repeated payload");
            return Outcome::Duplicate;
        }

        let raw = match RawRecord::parse(payload) {
            Ok(raw) => raw,
            Err(err) => {
                self.stats.malformed += 1;
                log::warn!(target: "tempfilterd::pipeline", "Received data cannot be decoded: '{}'", err);
                return Outcome::Malformed;
            }
        };

        let id = raw.sensor_id();
        let location = match id.and_then(|id| self.allowlist.location(id)) {
            Some(location) => location.to_string(),
            None => {
                self.stats.unknown += 1;
                log::debug!(target: "tempfilterd::pipeline", "Ignoring record from sensor {:?}", id);
                return Outcome::UnknownSensor(id);
            }
        };

        let reading = match raw.into_reading() {
            Ok(reading) => reading,
            Err(err) => {
                self.stats.malformed += 1;
                log::warn!(target: "tempfilterd::pipeline", "Record for {} cannot be decoded: '{}'", location, err);
                return Outcome::Malformed;
            }
        };

        if self.writer.submit(&location, &reading) {
            self.stats.submitted += 1;
            log::trace!(target: "tempfilterd::pipeline", "Submitted {} °C / {} % for {}", reading.temperature_c, reading.humidity, location);
            Outcome::Submitted { location }
        } else {
            self.stats.dropped += 1;
            Outcome::Dropped { location }
        }
    }

    /// Connects, subscribes and processes messages until `stop` is raised, then
    /// tears everything down.
    ///
    /// Connect and subscribe failures end the run before any message is read.
    /// Unsubscribe, receive and writer close failures are returned, in that order
    /// of precedence, after the rest of the teardown has run.
    pub fn run(&mut self, stop: &StopSignal) -> Result<PipelineStats, PipelineError> {
        let connect = match self.connector.take() {
            Some(connect) => connect,
            None => return Ok(self.stats),
        };

        let drainer = match drain_errors(self.writer.errors()) {
            Ok(drainer) => drainer,
            Err(err) => {
                let _ = self.finish(None);
                return Err(PipelineError::Spawn(err));
            }
        };

        self.transition(PipelineState::Connecting);
        let mut broker = match connect() {
            Ok(broker) => broker,
            Err(err) => {
                let _ = self.finish(Some(drainer));
                return Err(PipelineError::Connect(err));
            }
        };

        if let Err(source) = broker.subscribe(&self.settings.topic, self.settings.qos) {
            self.transition(PipelineState::Stopping);
            self.disconnect(broker);
            let _ = self.finish(Some(drainer));
            return Err(PipelineError::Subscribe {
                topic: self.settings.topic.clone(),
                source,
            });
        }
        self.transition(PipelineState::Subscribed);

        self.transition(PipelineState::Receiving);
        let mut receive_error = None;
        while !stop.is_stopped() {
            match broker.next_message(self.settings.poll_interval) {
                Ok(Some(payload)) => {
                    self.handle_payload(&payload);
                }
                Ok(None) => {}
                Err(err) => {
                    log::error!(target: "tempfilterd::pipeline", "Receiving from the broker failed: '{}'", err);
                    receive_error = Some(err);
                    break;
                }
            }
        }

        self.transition(PipelineState::Stopping);
        let unsubscribed = broker.unsubscribe(&self.settings.topic);
        if let Err(err) = &unsubscribed {
            log::error!(target: "tempfilterd::pipeline", "Unable to unsubscribe from '{}': '{}'", self.settings.topic, err);
        }
        self.disconnect(broker);
        let closed = self.finish(Some(drainer));
        log::info!(target: "tempfilterd::pipeline", "Pipeline stopped: {}", self.stats);

        if let Err(source) = unsubscribed {
            return Err(PipelineError::Unsubscribe {
                topic: self.settings.topic.clone(),
                source,
            });
        }
        if let Some(err) = receive_error {
            return Err(PipelineError::Receive(err));
        }
        closed.map_err(PipelineError::WriterClose)?;
        Ok(self.stats)
    }

    fn disconnect(&self, mut broker: B) {
        if let Err(err) = broker.disconnect(self.settings.disconnect_timeout) {
            log::error!(target: "tempfilterd::pipeline", "Could not disconnect from the broker: '{}'", err);
        }
    }

    /// Closes the writer, which also releases the database client, then waits for
    /// the error drain thread if the writer's workers all finished.
    fn finish(&mut self, drainer: Option<JoinHandle<()>>) -> Result<(), WriteError> {
        let closed = self.writer.close();
        match &closed {
            Ok(()) => {
                log::info!(target: "tempfilterd::pipeline", "Persistence writer closed");
                if let Some(drainer) = drainer {
                    if drainer.join().is_err() {
                        log::error!(target: "tempfilterd::pipeline", "Error drain thread panicked!");
                    }
                }
            }
            Err(err) => {
                log::error!(target: "tempfilterd::pipeline", "Persistence writer did not close cleanly: '{}'", err);
            }
        }
        self.transition(PipelineState::Stopped);
        closed
    }
}

impl<B: Broker + 'static> Program for IngestionPipeline<B> {
    type Error = PipelineError;

    fn run_until_stopped(mut self, stop: StopSignal) -> Result<(), PipelineError> {
        self.run(&stop).map(|_| ())
    }
}
