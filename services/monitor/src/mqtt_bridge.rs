use crate::broker::BrokerClient;
use crate::config::{MqttConfig, DEFAULT_MAX_PACKET_SIZE};
use crate::document_store::{DocumentStore, StoreError};
use backoff::{backoff::Backoff, ExponentialBackoff};
use parking_lot::{Mutex, RwLock};
use rumqttc::{Event, EventLoop, Outgoing, Packet};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors raised by the ingestion bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Failed to subscribe to {topic}: {message}")]
    Subscribe { topic: String, message: String },

    #[error("Invalid broker configuration: {0}")]
    InvalidConfig(String),

    #[error("Maximum reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,
}

/// Connection state of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
    /// Gave up after too many consecutive connection failures
    Failed,
    /// Shut down on request
    Stopped,
}

#[derive(Debug, Clone)]
struct PendingMessage {
    topic: String,
    payload: String,
}

/// Bridges the broker subscription to the document store and forwards
/// publish requests to the broker.
pub struct IngestionBridge {
    broker: Arc<dyn BrokerClient>,
    store: Arc<dyn DocumentStore>,
    subscribe_topic: String,
    state: RwLock<BridgeState>,
    retry_queue: Mutex<VecDeque<PendingMessage>>,
    retry_queue_capacity: usize,
    max_packet_size: usize,
}

impl IngestionBridge {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn DocumentStore>,
        subscribe_topic: impl Into<String>,
        retry_queue_capacity: usize,
    ) -> Self {
        Self {
            broker,
            store,
            subscribe_topic: subscribe_topic.into(),
            state: RwLock::new(BridgeState::Disconnected),
            retry_queue: Mutex::new(VecDeque::with_capacity(retry_queue_capacity)),
            retry_queue_capacity,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Match the packet limit configured on the broker connection
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn state(&self) -> BridgeState {
        *self.state.read()
    }

    pub fn subscribe_topic(&self) -> &str {
        &self.subscribe_topic
    }

    /// Messages waiting for storage to come back
    pub fn pending_messages(&self) -> usize {
        self.retry_queue.lock().len()
    }

    fn set_state(&self, state: BridgeState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Bridge state changed");
        }
    }

    pub fn on_connecting(&self) {
        self.set_state(BridgeState::Connecting);
    }

    pub fn on_disconnected(&self) {
        self.set_state(BridgeState::Disconnected);
    }

    /// Mark the bridge connected and (re)subscribe; sessions are clean so
    /// the broker forgets subscriptions across reconnects.
    pub async fn on_connected(&self) -> Result<(), BridgeError> {
        self.set_state(BridgeState::Connected);
        info!("Connected to MQTT broker");

        self.broker.subscribe(&self.subscribe_topic).await?;

        info!(topic = %self.subscribe_topic, "Subscribed to MQTT topic");
        Ok(())
    }

    /// Persist one delivered message.
    ///
    /// Never fails: storage errors are logged and the message is dropped, or
    /// held in the retry queue when one is configured and storage is down.
    pub async fn on_message(&self, topic: &str, payload: &[u8]) {
        let span = info_span!(
            parent: Span::none(),
            "mqtt_message",
            topic = %topic,
            payload_size = payload.len(),
        );

        async {
            let payload = String::from_utf8_lossy(payload).into_owned();
            debug!("Received MQTT message");

            self.flush_retry_queue().await;

            match self.store.insert_message(topic, &payload).await {
                Ok(id) => {
                    info!(message_id = %id, "Message stored");
                }
                Err(e) => self.handle_store_failure(topic, payload, e),
            }
        }
        .instrument(span)
        .await
    }

    fn handle_store_failure(&self, topic: &str, payload: String, error: StoreError) {
        if error.is_unavailable() && self.retry_queue_capacity > 0 {
            let mut queue = self.retry_queue.lock();
            if queue.len() >= self.retry_queue_capacity {
                if let Some(evicted) = queue.pop_front() {
                    warn!(
                        topic = %evicted.topic,
                        payload = %evicted.payload,
                        "Retry queue full, dropping oldest message"
                    );
                    metrics::counter!("monitor.messages.dropped").increment(1);
                }
            }
            queue.push_back(PendingMessage {
                topic: topic.to_string(),
                payload,
            });
            warn!(
                error = %error,
                pending = queue.len(),
                "Storage unavailable, message queued for retry"
            );
            metrics::counter!("monitor.messages.requeued").increment(1);
            return;
        }

        error!(error = %error, payload = %payload, "Failed to store message, dropping it");
        metrics::counter!("monitor.messages.dropped").increment(1);
    }

    /// Store queued messages in arrival order until the queue is empty or
    /// storage is still unavailable.
    async fn flush_retry_queue(&self) {
        loop {
            let next = self.retry_queue.lock().pop_front();
            let Some(message) = next else {
                return;
            };

            match self
                .store
                .insert_message(&message.topic, &message.payload)
                .await
            {
                Ok(id) => {
                    info!(message_id = %id, topic = %message.topic, "Queued message stored");
                }
                Err(e) if e.is_unavailable() => {
                    self.retry_queue.lock().push_front(message);
                    return;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        topic = %message.topic,
                        payload = %message.payload,
                        "Failed to store queued message, dropping it"
                    );
                    metrics::counter!("monitor.messages.dropped").increment(1);
                }
            }
        }
    }

    /// Forward a message to the broker.
    ///
    /// Empty topics or payloads are rejected without touching the broker.
    #[instrument(skip(self, payload), fields(payload_size = payload.len()))]
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<(), BridgeError> {
        if topic.is_empty() || payload.is_empty() {
            return Err(BridgeError::InvalidRequest(
                "Topic and message are required".to_string(),
            ));
        }

        // The client queues oversized packets and only fails once the event
        // loop tries to send them, dropping the connection.
        let packet_size = publish_packet_size(topic, payload.len());
        if packet_size > self.max_packet_size {
            return Err(BridgeError::InvalidRequest(format!(
                "Message too large: {} bytes exceeds the {} byte packet limit",
                packet_size, self.max_packet_size
            )));
        }

        let state = self.state();
        if state != BridgeState::Connected {
            metrics::counter!("monitor.publish.failed").increment(1);
            return Err(BridgeError::BrokerUnavailable(format!(
                "bridge is {:?}",
                state
            )));
        }

        if let Err(e) = self.broker.publish(topic, payload.as_bytes().to_vec()).await {
            error!(error = %e, "Error publishing MQTT message");
            metrics::counter!("monitor.publish.failed").increment(1);
            return Err(e);
        }

        info!("Message published");
        Ok(())
    }

    /// Send a DISCONNECT and drive the event loop until it is on the wire.
    async fn disconnect(&self, eventloop: &mut EventLoop) {
        if self.state() == BridgeState::Connected && self.broker.disconnect().await.is_ok() {
            let flushed = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            })
            .await;

            if flushed.is_err() {
                warn!("Timed out waiting for MQTT disconnect");
            }
        }

        self.set_state(BridgeState::Stopped);
        info!("MQTT bridge stopped");
    }
}

/// Encoded size of a QoS 1 PUBLISH packet
fn publish_packet_size(topic: &str, payload_len: usize) -> usize {
    // topic length prefix + topic + packet id + payload
    let remaining = 2 + topic.len() + 2 + payload_len;
    let length_bytes = match remaining {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    };
    1 + length_bytes + remaining
}

/// Drive the MQTT event loop until shutdown.
///
/// Incoming messages are stored inline, so a slow store stalls delivery.
/// Connection errors move the bridge back to `Disconnected` and are retried
/// with jittered exponential backoff; rumqttc reconnects on the next poll.
pub async fn run_event_loop(
    bridge: Arc<IngestionBridge>,
    mut eventloop: EventLoop,
    config: MqttConfig,
    shutdown: CancellationToken,
) -> Result<(), BridgeError> {
    let mut backoff = ExponentialBackoff {
        initial_interval: config.reconnect_base_delay(),
        max_interval: config.reconnect_max_delay(),
        max_elapsed_time: None,
        ..Default::default()
    };

    let mut failures = 0u32;

    info!(
        broker_url = %config.broker_url,
        topic = %bridge.subscribe_topic(),
        "Starting MQTT bridge"
    );
    bridge.on_connecting();

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => {
                bridge.disconnect(&mut eventloop).await;
                return Ok(());
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                failures = 0;
                backoff.reset();
                if let Err(e) = bridge.on_connected().await {
                    error!(error = %e, "Failed to subscribe to topic");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                bridge.on_message(&publish.topic, &publish.payload).await;
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("Subscription acknowledged");
            }
            Ok(_) => {}
            Err(e) => {
                bridge.on_disconnected();
                metrics::counter!("monitor.mqtt.errors").increment(1);
                failures += 1;

                if config.max_reconnect_attempts > 0 && failures >= config.max_reconnect_attempts {
                    bridge.set_state(BridgeState::Failed);
                    error!(
                        attempts = failures,
                        error = %e,
                        "Max reconnection attempts exceeded"
                    );
                    return Err(BridgeError::MaxReconnectAttemptsExceeded);
                }

                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| config.reconnect_max_delay());

                warn!(
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "MQTT connection error, retrying"
                );

                tokio::select! {
                    _ = shutdown.cancelled() => {
                        bridge.set_state(BridgeState::Stopped);
                        info!("MQTT bridge stopped");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                bridge.on_connecting();
            }
        }
    }
}
