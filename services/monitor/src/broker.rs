//! MQTT client plumbing: broker URL parsing, connection options, and the
//! [`BrokerClient`] seam the ingestion bridge talks through.

use crate::config::MqttConfig;
use crate::mqtt_bridge::BridgeError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS, Transport};
use tracing::debug;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

/// Outbound operations the bridge needs from a broker connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Queue a message for publication
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, topic: &str) -> Result<(), BridgeError>;

    /// Send a DISCONNECT to the broker
    async fn disconnect(&self) -> Result<(), BridgeError>;
}

/// Host, port, and transport extracted from a broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse a broker URL in format `mqtt://host:port`, `mqtts://host:port`,
/// `tcp://host:port`, `ssl://host:port`, or `host:port`
pub fn parse_broker_url(url: &str) -> Result<BrokerEndpoint, BridgeError> {
    let (rest, tls) = if let Some(rest) = url.strip_prefix("mqtts://") {
        (rest, true)
    } else if let Some(rest) = url.strip_prefix("ssl://") {
        (rest, true)
    } else if let Some(rest) = url.strip_prefix("mqtt://") {
        (rest, false)
    } else if let Some(rest) = url.strip_prefix("tcp://") {
        (rest, false)
    } else {
        (url, false)
    };

    let rest = rest.trim_end_matches('/');
    let default_port = if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT };

    let parts: Vec<&str> = rest.split(':').collect();
    let (host, port) = match parts.as_slice() {
        [host] => (*host, default_port),
        [host, port] => {
            let port = port.parse::<u16>().map_err(|_| {
                BridgeError::InvalidConfig(format!("Invalid port in broker URL: {}", port))
            })?;
            (*host, port)
        }
        _ => {
            return Err(BridgeError::InvalidConfig(format!(
                "Invalid broker URL format: {}",
                url
            )))
        }
    };

    if host.is_empty() {
        return Err(BridgeError::InvalidConfig(format!(
            "Missing host in broker URL: {}",
            url
        )));
    }

    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Build rumqttc options from configuration
pub fn mqtt_options(config: &MqttConfig) -> Result<MqttOptions, BridgeError> {
    let endpoint = parse_broker_url(&config.broker_url)?;

    let mut options = MqttOptions::new(&config.client_id, endpoint.host, endpoint.port);
    options.set_keep_alive(config.keep_alive());
    options.set_clean_session(true);
    options.set_max_packet_size(config.max_packet_size, config.max_packet_size);

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }

    if endpoint.tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    Ok(options)
}

/// Create the client handle and the event loop that drives it.
///
/// Nothing touches the network until the event loop is polled.
pub fn create_client(config: &MqttConfig) -> Result<(MqttClient, EventLoop), BridgeError> {
    let options = mqtt_options(config)?;
    let (client, eventloop) = AsyncClient::new(options, config.channel_capacity);

    debug!(
        broker_url = %config.broker_url,
        client_id = %config.client_id,
        "MQTT client created"
    );

    Ok((MqttClient { client }, eventloop))
}

/// [`BrokerClient`] over a rumqttc client handle
#[derive(Clone)]
pub struct MqttClient {
    client: AsyncClient,
}

#[async_trait]
impl BrokerClient for MqttClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        // try_* never blocks a request on a full channel
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| BridgeError::BrokerUnavailable(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BridgeError> {
        self.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| BridgeError::Subscribe {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        self.client
            .try_disconnect()
            .map_err(|e| BridgeError::BrokerUnavailable(e.to_string()))
    }
}
