//! Daemon that reads AcuRite sensor broadcasts relayed by `rtl_433` from an MQTT broker
//! and stores the readings of known sensors in InfluxDB.
//!
//! ```text
//! broker --> IngestionPipeline --> dedup --> decode --> allowlist --> PersistenceWriter --> InfluxDB
//! ```
pub mod allowlist;
pub mod config;
pub mod dedup;
pub mod influx;
pub mod mqtt;
pub mod pipeline;
pub mod record;
pub mod report;
pub mod service;
pub mod writer;
