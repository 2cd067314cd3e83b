//! Async MQTT transport built on rumqttc

use crate::bus::{BusMessage, MessageBus};
use crate::config::MqttConfig;
use crate::error::ProtocolError;
use crate::topic::validate_pattern;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Delay before the event loop is polled again after a connection error
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the rumqttc request channel
const REQUEST_CAPACITY: usize = 64;

/// Capacity of the incoming message broadcast
const MESSAGE_CAPACITY: usize = 256;

/// Async transport for talking to the MQTT broker
pub struct MqttTransport {
    /// rumqttc request handle
    client: AsyncClient,
    /// Whether the broker has acknowledged our connection
    connected: Arc<AtomicBool>,
    /// Patterns re-subscribed on every ConnAck
    subscriptions: Arc<Mutex<Vec<String>>>,
    /// Broadcaster for incoming publishes
    message_tx: broadcast::Sender<BusMessage>,
    /// Event loop task
    event_loop: JoinHandle<()>,
}

impl MqttTransport {
    /// Create the client and start polling the broker connection.
    ///
    /// Returns immediately; the connection is established (and
    /// re-established) in the background.
    pub fn connect(config: &MqttConfig) -> Result<Self, ProtocolError> {
        let subscriptions = config.subscriptions();
        for pattern in &subscriptions {
            validate_pattern(pattern)?;
        }

        tracing::info!(
            "Connecting to MQTT broker at {}:{} as {}",
            config.broker_host,
            config.broker_port,
            config.client_id
        );

        let mut options = MqttOptions::new(
            config.client_id.clone(),
            config.broker_host.clone(),
            config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(u64::from(config.keep_alive_secs)));
        if let Some(username) = &config.username {
            options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (message_tx, _) = broadcast::channel(MESSAGE_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let subscriptions = Arc::new(Mutex::new(subscriptions));

        let event_loop = tokio::spawn(Self::event_loop_task(
            event_loop,
            client.clone(),
            Arc::clone(&connected),
            Arc::clone(&subscriptions),
            message_tx.clone(),
        ));

        Ok(Self {
            client,
            connected,
            subscriptions,
            message_tx,
            event_loop,
        })
    }

    /// Poll the connection forever, forwarding publishes to subscribers
    async fn event_loop_task(
        mut event_loop: EventLoop,
        client: AsyncClient,
        connected: Arc<AtomicBool>,
        subscriptions: Arc<Mutex<Vec<String>>>,
        message_tx: broadcast::Sender<BusMessage>,
    ) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected.store(true, Ordering::SeqCst);
                    tracing::info!("Connected to MQTT broker");

                    // The broker may have dropped our session, so re-subscribe every time
                    let patterns = subscriptions
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    for pattern in patterns {
                        match client.try_subscribe(pattern.as_str(), QoS::AtLeastOnce) {
                            Ok(()) => tracing::debug!("Subscribed to {}", pattern),
                            Err(e) => tracing::error!("Failed to subscribe to {}: {}", pattern, e),
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    tracing::debug!(
                        "MQTT RX: {} ({} bytes)",
                        publish.topic,
                        publish.payload.len()
                    );
                    // No receivers is fine, nothing is listening yet
                    let _ = message_tx.send(BusMessage::new(publish.topic, publish.payload));
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    connected.store(false, Ordering::SeqCst);
                    tracing::warn!("MQTT broker sent disconnect");
                }
                Ok(_) => {}
                Err(e) => {
                    connected.store(false, Ordering::SeqCst);
                    tracing::error!(
                        "MQTT connection error: {}. Reconnecting in {:?}",
                        e,
                        RECONNECT_DELAY
                    );
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    /// Subscribe to incoming bus messages
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.message_tx.subscribe()
    }

    /// Add a subscription pattern (kept across reconnects)
    pub fn add_subscription(&self, pattern: &str) -> Result<(), ProtocolError> {
        validate_pattern(pattern)?;

        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscriptions.iter().any(|p| p == pattern) {
            return Ok(());
        }
        subscriptions.push(pattern.to_string());
        drop(subscriptions);

        if self.is_connected() {
            self.client.try_subscribe(pattern, QoS::AtLeastOnce)?;
        }
        Ok(())
    }

    /// Whether the broker connection is currently up
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Disconnect from the broker and stop the event loop
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!("MQTT disconnect request failed: {}", e);
        }
        self.event_loop.abort();
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageBus for MqttTransport {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), ProtocolError> {
        if !self.is_connected() {
            tracing::warn!("Cannot publish to {}, MQTT not connected", topic);
            return Err(ProtocolError::NotConnected);
        }

        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await?;
        tracing::debug!("MQTT TX: {} -> {}", topic, payload);
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}
