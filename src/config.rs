//! YAML configuration of the daemon.
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::allowlist::IdentityAllowlist;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read the configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot deserialize the configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Top level configuration read from `tempfilterd.yml`.
pub struct Configuration {
    pub mqtt: MqttParams,
    pub influxdb: InfluxDbParams,
    #[serde(default)]
    pub writer: WriterParams,
    #[serde(default)]
    pub service: ServiceParams,
    /// Sensor identity to location name. The built-in table is used when absent.
    #[serde(default)]
    pub sensors: Option<BTreeMap<u32, String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Parameters for the mqtt connection.
pub struct MqttParams {
    /// The host name or ip address of the broker.
    pub address: String,
    /// The port of the broker.
    #[serde(default = "default_mqtt_port")]
    pub port: u32,
    /// Client identifier presented to the broker.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Topic filter carrying the receiver's sensor broadcasts.
    #[serde(default = "default_topic")]
    pub topic: String,
    /// The QoS to use for the subscription.
    #[serde(default)]
    pub qos: i32,
    /// Timeout for connect, subscribe and unsubscribe in milliseconds.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// Time granted to the broker to finish a disconnect in milliseconds.
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    /// Optional TLS parameters. Plain tcp is used when absent.
    #[serde(default)]
    pub tls_params: Option<MqttTlsParams>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// TLS parameters required for MQTT with TLS.
pub struct MqttTlsParams {
    /// The path to the CA certificate for TLS encryption.
    pub ca_path: String,
    /// The path to the certificate to use for TLS encryption.
    pub cert_path: String,
    /// The path to the key to use for TLS encryption.
    pub key_path: String,
    /// The password for the ssl private key.
    pub key_pass: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// InfluxDB v2 connection parameters.
pub struct InfluxDbParams {
    /// Base url of the server, e.g. `http://localhost:8086`.
    pub url: String,
    pub org: String,
    pub bucket: String,
    /// API token. InfluxDB 1.8 accepts `user:password` here.
    pub token: String,
    /// Measurement every point is written to.
    #[serde(default = "default_measurement")]
    pub measurement: String,
    /// Timeout of a single HTTP request in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Sizing of the persistence writer.
pub struct WriterParams {
    /// Points that may wait for a worker. Newer points are dropped once full.
    pub queue_capacity: usize,
    /// Number of threads posting to the database.
    pub workers: usize,
    /// Maximum points per request.
    pub batch_size: usize,
    /// Maximum time a point waits in a worker's batch in milliseconds.
    pub flush_interval_ms: u64,
    /// Time granted to the workers to flush on shutdown in milliseconds.
    pub close_timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServiceParams {
    pub name: String,
    /// Time `stop` may take before it reports a failure, in milliseconds.
    pub stop_timeout_ms: u64,
}

fn default_mqtt_port() -> u32 {
    1883
}

fn default_client_id() -> String {
    String::from("acurite_filterer")
}

fn default_topic() -> String {
    String::from("rtl_433/#")
}

fn default_operation_timeout_ms() -> u64 {
    4000
}

fn default_disconnect_timeout_ms() -> u64 {
    250
}

fn default_measurement() -> String {
    String::from("sample")
}

fn default_request_timeout_ms() -> u64 {
    5000
}

impl Default for WriterParams {
    fn default() -> Self {
        WriterParams {
            queue_capacity: 1024,
            workers: 2,
            batch_size: 64,
            flush_interval_ms: 1000,
            close_timeout_ms: 2000,
        }
    }
}

impl Default for ServiceParams {
    fn default() -> Self {
        ServiceParams {
            name: String::from("tempfilterd"),
            stop_timeout_ms: 8000,
        }
    }
}

impl Configuration {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let configuration: Configuration = serde_yaml::from_str(yaml)?;
        configuration.validate()?;
        Ok(configuration)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.writer.queue_capacity == 0 {
            return Err(ConfigError::Invalid(String::from("writer.queue_capacity must be positive")));
        }
        if self.writer.workers == 0 {
            return Err(ConfigError::Invalid(String::from("writer.workers must be positive")));
        }
        if self.writer.batch_size == 0 {
            return Err(ConfigError::Invalid(String::from("writer.batch_size must be positive")));
        }
        if !(0..=2).contains(&self.mqtt.qos) {
            return Err(ConfigError::Invalid(format!("mqtt.qos {} is not 0, 1 or 2", self.mqtt.qos)));
        }
        // Shutdown has to fit the unsubscribe, the broker disconnect and the writer flush.
        let teardown = self.mqtt.operation_timeout_ms + self.mqtt.disconnect_timeout_ms + self.writer.close_timeout_ms;
        if self.service.stop_timeout_ms < teardown {
            return Err(ConfigError::Invalid(format!(
                "service.stop_timeout_ms ({}) is shorter than the teardown budget ({})",
                self.service.stop_timeout_ms, teardown
            )));
        }
        Ok(())
    }

    /// The allowlist configured in `sensors`, or the built-in one.
    pub fn allowlist(&self) -> IdentityAllowlist {
        match &self.sensors {
            Some(sensors) => IdentityAllowlist::new(sensors.iter().map(|(id, name)| (*id, name.clone()))),
            None => IdentityAllowlist::default(),
        }
    }
}

impl MqttParams {
    /// Server uri for the paho client.
    pub fn server_uri(&self) -> String {
        match self.tls_params {
            Some(_) => format!("ssl://{}:{}", self.address, self.port),
            None => format!("tcp://{}:{}", self.address, self.port),
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

impl InfluxDbParams {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl WriterParams {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl ServiceParams {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}
