//! Connection to the MQTT broker the radio receiver publishes to.
extern crate paho_mqtt as mqtt;

use std::time::Duration;

use thiserror::Error;

use crate::config::{MqttParams, MqttTlsParams};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("mqtt client error: {0}")]
    Client(String),
    #[error("connection to the broker was lost")]
    ConnectionLost,
    #[error("broker is not connected")]
    NotConnected,
}

impl From<mqtt::Error> for BrokerError {
    fn from(err: mqtt::Error) -> Self {
        BrokerError::Client(err.to_string())
    }
}

/// The operations the ingestion pipeline needs from a broker session.
///
/// Delivery happens on the client's own thread, which only enqueues the payload;
/// `next_message` takes payloads off that queue in delivery order.
pub trait Broker: Send {
    fn subscribe(&mut self, topic: &str, qos: i32) -> Result<(), BrokerError>;

    /// Waits up to `timeout` for the next payload. `Ok(None)` means nothing arrived.
    fn next_message(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BrokerError>;

    fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    /// Disconnects, granting the broker `timeout` to complete the handshake.
    fn disconnect(&mut self, timeout: Duration) -> Result<(), BrokerError>;
}

/// [`Broker`] backed by the synchronous paho client.
///
/// Dropping a connected `MqttBroker` disconnects it.
pub struct MqttBroker {
    client: mqtt::Client,
    incoming: mqtt::Receiver<Option<mqtt::Message>>,
    subscription: Option<(String, i32)>,
    connected: bool,
    disconnect_timeout: Duration,
}

impl MqttBroker {
    /// Connects to the broker described by `params`.
    pub fn connect(params: &MqttParams) -> Result<Self, BrokerError> {
        let create_opts = mqtt::CreateOptionsBuilder::new()
            .server_uri(params.server_uri())
            .client_id(params.client_id.as_str())
            .finalize();

        let mut client = mqtt::Client::new(create_opts)?;
        client.set_timeout(params.operation_timeout());

        let mut connect_builder = mqtt::ConnectOptionsBuilder::new();
        connect_builder
            .connect_timeout(params.operation_timeout())
            .clean_session(true);
        if let Some(tls_params) = &params.tls_params {
            connect_builder.ssl_options(ssl_options(tls_params)?);
        }
        let connection_opts = connect_builder.finalize();

        // Start the queue first so nothing delivered right after the connect is lost.
        let incoming = client.start_consuming();
        client.connect(connection_opts)?;
        log::info!(target: "tempfilterd::mqtt", "Mqtt client connected to '{}' as '{}'", params.server_uri(), params.client_id);

        Ok(MqttBroker {
            client,
            incoming,
            subscription: None,
            connected: true,
            disconnect_timeout: params.disconnect_timeout(),
        })
    }
}

fn ssl_options(tls_params: &MqttTlsParams) -> Result<mqtt::SslOptions, BrokerError> {
    let mut builder = mqtt::SslOptionsBuilder::new();
    builder
        .trust_store(&tls_params.ca_path)?
        .key_store(&tls_params.cert_path)?
        .private_key(&tls_params.key_path)?;
    if let Some(key_pass) = &tls_params.key_pass {
        builder.private_key_password(key_pass.as_str());
    }
    Ok(builder.finalize())
}

/// The client calls needed to bring a dropped session back.
trait Session {
    fn reconnect(&self) -> Result<(), BrokerError>;
    fn subscribe(&self, topic: &str, qos: i32) -> Result<(), BrokerError>;
}

impl Session for mqtt::Client {
    fn reconnect(&self) -> Result<(), BrokerError> {
        mqtt::Client::reconnect(self)?;
        Ok(())
    }

    fn subscribe(&self, topic: &str, qos: i32) -> Result<(), BrokerError> {
        mqtt::Client::subscribe(self, topic, qos)?;
        Ok(())
    }
}

/// Reconnects once and restores the subscription, which a clean session loses.
fn resume<S: Session>(session: &S, subscription: Option<&(String, i32)>) -> Result<(), BrokerError> {
    if let Err(err) = session.reconnect() {
        log::error!(target: "tempfilterd::mqtt", "Unable to reconnect: '{}'", err);
        return Err(BrokerError::ConnectionLost);
    }
    log::info!(target: "tempfilterd::mqtt", "Mqtt client reconnected!");
    if let Some((topic, qos)) = subscription {
        if let Err(err) = session.subscribe(topic, *qos) {
            log::error!(target: "tempfilterd::mqtt", "Unable to subscribe to {} again: '{}'", topic, err);
            return Err(BrokerError::ConnectionLost);
        }
        log::debug!(target: "tempfilterd::mqtt", "Subscribed to topic {} again", topic);
    }
    Ok(())
}

impl Broker for MqttBroker {
    fn subscribe(&mut self, topic: &str, qos: i32) -> Result<(), BrokerError> {
        self.client.subscribe(topic, qos)?;
        self.subscription = Some((topic.to_string(), qos));
        log::debug!(target: "tempfilterd::mqtt", "Subscribed to topic {} with qos {}", topic, qos);
        Ok(())
    }

    fn next_message(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BrokerError> {
        if !self.connected {
            return Err(BrokerError::NotConnected);
        }
        match self.incoming.recv_timeout(timeout) {
            // Retained messages are stale replays of an old broadcast.
            Ok(Some(message)) if message.retained() => {
                log::trace!(target: "tempfilterd::mqtt", "Skipping retained message on '{}'", message.topic());
                Ok(None)
            }
            Ok(Some(message)) => Ok(Some(message.payload().to_vec())),
            Ok(None) => {
                log::warn!(target: "tempfilterd::mqtt", "Connection to the broker lost, reconnecting");
                resume(&self.client, self.subscription.as_ref())?;
                Ok(None)
            }
            Err(err) if err.is_timeout() => Ok(None),
            Err(_) => Err(BrokerError::ConnectionLost),
        }
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.client.unsubscribe(topic)?;
        self.subscription = None;
        log::debug!(target: "tempfilterd::mqtt", "Unsubscribed from topic {}", topic);
        Ok(())
    }

    fn disconnect(&mut self, timeout: Duration) -> Result<(), BrokerError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        let disconnect_opts = mqtt::DisconnectOptionsBuilder::new().timeout(timeout).finalize();
        self.client.stop_consuming();
        self.client.disconnect(disconnect_opts)?;
        log::info!(target: "tempfilterd::mqtt", "Disconnected from mqtt broker!");
        Ok(())
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        let timeout = self.disconnect_timeout;
        if let Err(err) = self.disconnect(timeout) {
            log::error!(target: "tempfilterd::mqtt", "Could not disconnect from mqtt broker: {}", err);
        }
    }
}
