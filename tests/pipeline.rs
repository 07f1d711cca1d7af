use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use serde_json::json;

use tempfilterd::allowlist::IdentityAllowlist;
use tempfilterd::config::WriterParams;
use tempfilterd::influx::{PointSink, StoreError};
use tempfilterd::mqtt::{Broker, BrokerError};
use tempfilterd::pipeline::{IngestionPipeline, Outcome, PipelineError, PipelineSettings, PipelineState};
use tempfilterd::service::{ServiceError, ServiceLifecycle, StopSignal};
use tempfilterd::writer::{PersistenceWriter, WriteError};

/// Broker call that the test broker refuses.
#[derive(Clone, Copy, PartialEq)]
enum Refuse {
    Nothing,
    Subscribe,
    Unsubscribe,
}

/// Broker fed from a channel that records the calls made on it.
struct ChannelBroker {
    incoming: Receiver<Vec<u8>>,
    calls: Arc<Mutex<Vec<String>>>,
    refuse: Refuse,
}

impl Broker for ChannelBroker {
    fn subscribe(&mut self, topic: &str, qos: i32) -> Result<(), BrokerError> {
        self.calls.lock().unwrap().push(format!("subscribe {} {}", topic, qos));
        if self.refuse == Refuse::Subscribe {
            Err(BrokerError::Client(String::from("not authorized")))
        } else {
            Ok(())
        }
    }

    fn next_message(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BrokerError> {
        match self.incoming.recv_timeout(timeout) {
            Ok(payload) => Ok(Some(payload)),
            Err(err) if err.is_timeout() => Ok(None),
            Err(_) => Err(BrokerError::ConnectionLost),
        }
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.calls.lock().unwrap().push(format!("unsubscribe {}", topic));
        if self.refuse == Refuse::Unsubscribe {
            Err(BrokerError::NotConnected)
        } else {
            Ok(())
        }
    }

    fn disconnect(&mut self, _timeout: Duration) -> Result<(), BrokerError> {
        self.calls.lock().unwrap().push(String::from("disconnect"));
        Ok(())
    }
}

#[derive(Default)]
struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl PointSink for MemorySink {
    fn write_lines(&self, lines: &[String]) -> Result<(), StoreError> {
        self.lines.lock().unwrap().extend_from_slice(lines);
        Ok(())
    }
}

/// Accepts a write and never acknowledges it.
struct HangingSink {
    entered: Sender<()>,
}

impl PointSink for HangingSink {
    fn write_lines(&self, _lines: &[String]) -> Result<(), StoreError> {
        let _ = self.entered.send(());
        loop {
            std::thread::park();
        }
    }
}

struct Harness {
    feed: Sender<Vec<u8>>,
    calls: Arc<Mutex<Vec<String>>>,
    pipeline: IngestionPipeline<ChannelBroker>,
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        topic: String::from("rtl_433/#"),
        qos: 0,
        poll_interval: Duration::from_millis(10),
        disconnect_timeout: Duration::from_millis(10),
    }
}

fn writer_params() -> WriterParams {
    WriterParams {
        queue_capacity: 64,
        workers: 2,
        batch_size: 1,
        flush_interval_ms: 20,
        close_timeout_ms: 200,
    }
}

fn harness(sink: Arc<dyn PointSink>, refuse: Refuse) -> Harness {
    let (feed, incoming) = channel::unbounded();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let broker = ChannelBroker {
        incoming,
        calls: Arc::clone(&calls),
        refuse,
    };
    let writer = PersistenceWriter::new(sink, "sample", &writer_params()).unwrap();
    let pipeline = IngestionPipeline::new(settings(), IdentityAllowlist::default(), writer, move || Ok(broker));
    Harness { feed, calls, pipeline }
}

fn payload(id: u32, temperature: f64) -> Vec<u8> {
    json!({
        "time": "2021-12-31 08:00:14",
        "model": "Acurite-Tower",
        "id": id,
        "channel": "A",
        "battery_ok": 1,
        "temperature_C": temperature,
        "humidity": 40.0,
        "mic": "CHECKSUM"
    })
    .to_string()
    .into_bytes()
}

fn wait_for_lines(sink: &MemorySink, count: usize) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let lines = sink.lines.lock().unwrap().clone();
        if lines.len() >= count || Instant::now() > deadline {
            return lines;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn duplicates_and_unknown_sensors_are_not_written() {
    let sink = Arc::new(MemorySink::default());
    let Harness { feed, calls, pipeline } = harness(sink.clone(), Refuse::Nothing);
    let mut service = ServiceLifecycle::new("test", Duration::from_secs(5), pipeline);
    service.start().unwrap();

    feed.send(payload(9788, 20.5)).unwrap();
    feed.send(payload(9788, 20.5)).unwrap();
    feed.send(payload(9788, 21.0)).unwrap();
    feed.send(payload(99999, 15.0)).unwrap();

    let lines = wait_for_lines(&sink, 2);
    std::thread::sleep(Duration::from_millis(100));
    service.stop().unwrap();

    let mut lines = lines;
    lines.sort();
    assert_eq!(
        lines,
        vec![
            "sample,location=Garage Temperature=20.5,Humidity=40.0 1640937614".to_string(),
            "sample,location=Garage Temperature=21.0,Humidity=40.0 1640937614".to_string(),
        ]
    );
    assert_eq!(sink.lines.lock().unwrap().len(), 2);
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["subscribe rtl_433/# 0", "unsubscribe rtl_433/#", "disconnect"]
    );
}

#[test]
fn malformed_payload_does_not_stop_the_next_one() {
    let sink = Arc::new(MemorySink::default());
    let Harness { mut pipeline, .. } = harness(sink.clone(), Refuse::Nothing);

    assert_eq!(
        pipeline.handle_payload(b"{\"id\": 9788, \"time\": \"yesterday\"}"),
        Outcome::Malformed
    );
    assert_eq!(
        pipeline.handle_payload(&payload(12869, 3.5)),
        Outcome::Submitted { location: String::from("Porch") }
    );
    assert_eq!(
        wait_for_lines(&sink, 1),
        vec!["sample,location=Porch Temperature=3.5,Humidity=40.0 1640937614".to_string()]
    );
}

#[test]
fn repeat_after_a_different_payload_is_written_again() {
    let sink = Arc::new(MemorySink::default());
    let Harness { mut pipeline, .. } = harness(sink.clone(), Refuse::Nothing);

    let a = payload(9788, 20.5);
    let b = payload(13875, -2.0);
    assert!(matches!(pipeline.handle_payload(&a), Outcome::Submitted { .. }));
    assert!(matches!(pipeline.handle_payload(&b), Outcome::Submitted { .. }));
    assert!(matches!(pipeline.handle_payload(&a), Outcome::Submitted { .. }));
    assert_eq!(wait_for_lines(&sink, 3).len(), 3);
}

#[test]
fn stop_with_a_write_in_flight_is_bounded() {
    let (entered_tx, entered_rx) = channel::unbounded();
    let sink = Arc::new(HangingSink { entered: entered_tx });
    let Harness { feed, calls, pipeline } = harness(sink, Refuse::Nothing);
    let mut service = ServiceLifecycle::new("test", Duration::from_secs(3), pipeline);
    service.start().unwrap();

    feed.send(payload(9788, 20.5)).unwrap();
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let started = Instant::now();
    match service.stop() {
        Err(ServiceError::Program { source, .. }) => {
            let err = source.downcast_ref::<PipelineError>().expect("pipeline error");
            assert!(matches!(err, PipelineError::WriterClose(WriteError::CloseTimeout(_))));
        }
        other => panic!("expected the lost write to be reported, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["subscribe rtl_433/# 0", "unsubscribe rtl_433/#", "disconnect"]
    );
}

#[test]
fn unsubscribe_failure_fails_the_service() {
    let sink = Arc::new(MemorySink::default());
    let Harness { calls, pipeline, .. } = harness(sink, Refuse::Unsubscribe);
    let mut service = ServiceLifecycle::new("test", Duration::from_secs(3), pipeline);
    service.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));

    match service.stop() {
        Err(ServiceError::Program { source, .. }) => {
            let err = source.downcast_ref::<PipelineError>().expect("pipeline error");
            assert!(matches!(err, PipelineError::Unsubscribe { .. }));
        }
        other => panic!("expected a program failure, got {:?}", other),
    }
    // The broker is still disconnected after the failed unsubscribe.
    assert_eq!(calls.lock().unwrap().last().map(String::as_str), Some("disconnect"));
}

#[test]
fn lost_broker_ends_the_service() {
    let sink = Arc::new(MemorySink::default());
    let Harness { feed, pipeline, .. } = harness(sink, Refuse::Nothing);
    let mut service = ServiceLifecycle::new("test", Duration::from_secs(3), pipeline);
    service.start().unwrap();
    drop(feed);

    let (_shutdown_tx, shutdown_rx) = channel::unbounded::<()>();
    assert!(matches!(service.run_until(&shutdown_rx), Err(ServiceError::Program { .. })));
}

#[test]
fn other_devices_on_the_topic_tree_are_ignored() {
    let sink = Arc::new(MemorySink::default());
    let Harness { mut pipeline, .. } = harness(sink, Refuse::Nothing);
    let other_device = json!({
        "time": "2021-12-31 08:00:14",
        "model": "Acurite-609TXC",
        "id": 99999,
        "battery_ok": 1,
        "temperature_C": 15.0,
        "mic": "CHECKSUM"
    });

    assert_eq!(
        pipeline.handle_payload(other_device.to_string().as_bytes()),
        Outcome::UnknownSensor(Some(99999))
    );
    assert_eq!(pipeline.handle_payload(b"20.5"), Outcome::UnknownSensor(None));
    assert_eq!(pipeline.stats().malformed, 0);
}

#[test]
fn subscribe_failure_ends_the_run_and_releases_everything() {
    let sink = Arc::new(MemorySink::default());
    let Harness { calls, mut pipeline, .. } = harness(sink, Refuse::Subscribe);

    let result = pipeline.run(&StopSignal::new());
    assert!(matches!(result, Err(PipelineError::Subscribe { .. })));
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(*calls.lock().unwrap(), vec!["subscribe rtl_433/# 0", "disconnect"]);
    // The writer no longer takes points.
    assert!(matches!(pipeline.handle_payload(&payload(9788, 20.5)), Outcome::Dropped { .. }));
}

#[test]
fn subscribe_failure_fails_the_service() {
    let sink = Arc::new(MemorySink::default());
    let Harness { pipeline, .. } = harness(sink, Refuse::Subscribe);
    let mut service = ServiceLifecycle::new("test", Duration::from_secs(3), pipeline);
    service.start().unwrap();

    let (_shutdown_tx, shutdown_rx) = channel::unbounded::<()>();
    match service.run_until(&shutdown_rx) {
        Err(ServiceError::Program { source, .. }) => {
            let err = source.downcast_ref::<PipelineError>().expect("pipeline error");
            assert!(matches!(err, PipelineError::Subscribe { .. }));
        }
        other => panic!("expected a program failure, got {:?}", other),
    }
}
