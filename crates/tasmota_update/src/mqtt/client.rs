#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use rumqttc::Event;
use rumqttc::MqttOptions;
use rumqttc::Outgoing;
use rumqttc::Packet;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::MqttConfig;

/// MQTT message received from a subscription
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Transport-level MQTT failures
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("MQTT client not connected. Call connect() first.")]
    NotConnected,

    #[error("MQTT connection closed")]
    Closed,

    #[error("MQTT request not accepted within {0:?}")]
    Stalled(Duration),

    #[error(transparent)]
    Client(#[from] rumqttc::ClientError),
}

/// Trait for MQTT client operations
///
/// This trait allows for mocking the MQTT client for testing purposes
#[async_trait]
pub trait MqttClient: Send + Sync {
    /// Connect to the MQTT broker
    async fn connect(&mut self) -> Result<(), MqttError>;

    /// Subscribe to an MQTT topic
    async fn subscribe(&mut self, topic: &str) -> Result<(), MqttError>;

    /// Publish a message to an MQTT topic
    async fn publish(&mut self, topic: &str, payload: &[u8], retain: bool)
        -> Result<(), MqttError>;

    /// Wait for the next message from subscribed topics
    ///
    /// Returns None once the connection is gone for good
    async fn poll_message(&mut self) -> Option<MqttMessage>;

    /// Take the next message that has already arrived, without waiting
    fn try_poll_message(&mut self) -> Option<MqttMessage>;

    /// Flush queued publishes and close the connection
    async fn disconnect(&mut self) -> Result<(), MqttError>;
}

/// Mock MQTT client for testing
///
/// Publishing to a topic registered with `reply_to` queues the canned replies,
/// the way a device answers a command on its stat topic. With
/// `stall_requests` set, subscribe and publish never complete, like a client
/// whose request queue is full while the broker is unreachable.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockMqttClient {
    pub messages: VecDeque<MqttMessage>,
    pub subscriptions: Vec<String>,
    pub published: Vec<(String, Vec<u8>, bool)>,
    pub replies: HashMap<String, Vec<MqttMessage>>,
    pub fail_publish: bool,
    pub stall_requests: bool,
    pub closed: bool,
    pub is_connected: bool,
}

#[cfg(test)]
#[async_trait]
impl MqttClient for MockMqttClient {
    async fn connect(&mut self) -> Result<(), MqttError> {
        self.is_connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        if self.stall_requests {
            std::future::pending::<()>().await;
        }
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), MqttError> {
        if self.stall_requests {
            std::future::pending::<()>().await;
        }
        if self.fail_publish {
            return Err(MqttError::NotConnected);
        }
        self.published
            .push((topic.to_string(), payload.to_vec(), retain));
        if let Some(replies) = self.replies.get(topic) {
            self.messages.extend(replies.iter().cloned());
        }
        Ok(())
    }

    async fn poll_message(&mut self) -> Option<MqttMessage> {
        match self.messages.pop_front() {
            Some(msg) => Some(msg),
            None if self.closed => None,
            // A silent device: nothing ever arrives
            None => std::future::pending().await,
        }
    }

    fn try_poll_message(&mut self) -> Option<MqttMessage> {
        self.messages.pop_front()
    }

    async fn disconnect(&mut self) -> Result<(), MqttError> {
        self.is_connected = false;
        Ok(())
    }
}

#[cfg(test)]
impl MockMqttClient {
    /// Create a new mock MQTT client
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message to the mock client's queue
    pub fn add_message(&mut self, topic: &str, payload: &[u8]) {
        self.messages.push_back(MqttMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain: false,
        });
    }

    /// Answer every publish on `command_topic` with `payload` on `reply_topic`
    ///
    /// Registering several replies for one command queues them in order.
    pub fn reply_to(&mut self, command_topic: &str, reply_topic: &str, payload: &[u8]) {
        self.replies
            .entry(command_topic.to_string())
            .or_default()
            .push(MqttMessage {
                topic: reply_topic.to_string(),
                payload: payload.to_vec(),
                retain: false,
            });
    }
}

/// How long `disconnect` waits for queued requests to reach the broker
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Real MQTT client implementation using rumqttc
pub struct RumqttcClient {
    /// MQTT connection options (stored for lazy initialization)
    mqtt_options: MqttOptions,

    /// AsyncClient (created in connect())
    client: Option<AsyncClient>,

    /// Message receiver (created in connect())
    message_rx: Option<mpsc::UnboundedReceiver<MqttMessage>>,

    /// Background event loop task handle
    event_loop_task: Option<JoinHandle<()>>,
}

impl RumqttcClient {
    /// Create a new RumqttcClient from configuration
    pub fn new(config: &MqttConfig) -> Self {
        let mut mqtt_options =
            MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);

        mqtt_options.set_keep_alive(Duration::from_secs(30));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        Self {
            mqtt_options,
            client: None,
            message_rx: None,
            event_loop_task: None,
        }
    }

    fn connected(&self) -> Result<&AsyncClient, MqttError> {
        self.client.as_ref().ok_or(MqttError::NotConnected)
    }
}

#[async_trait]
impl MqttClient for RumqttcClient {
    async fn connect(&mut self) -> Result<(), MqttError> {
        let (client, mut event_loop) = AsyncClient::new(self.mqtt_options.clone(), 10);

        let (message_tx, message_rx) = mpsc::unbounded_channel();

        // Spawn background task to poll event loop
        let task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let msg = MqttMessage {
                            topic: publish.topic.to_string(),
                            payload: publish.payload.to_vec(),
                            retain: publish.retain,
                        };

                        // Send to channel; if receiver dropped, exit
                        if message_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::debug!("MQTT connection acknowledged");
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        tracing::debug!("MQTT disconnect sent");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("MQTT event loop error: {}", e);
                        // Sleep briefly before retrying
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            tracing::info!("MQTT event loop task exiting");
        });

        self.client = Some(client);
        self.message_rx = Some(message_rx);
        self.event_loop_task = Some(task);

        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        self.connected()?
            .subscribe(topic, QoS::AtMostOnce)
            .await?;
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), MqttError> {
        self.connected()?
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await?;
        Ok(())
    }

    async fn poll_message(&mut self) -> Option<MqttMessage> {
        match &mut self.message_rx {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    fn try_poll_message(&mut self) -> Option<MqttMessage> {
        self.message_rx.as_mut()?.try_recv().ok()
    }

    async fn disconnect(&mut self) -> Result<(), MqttError> {
        let client = self.client.take().ok_or(MqttError::NotConnected)?;
        let mut task = self.event_loop_task.take();

        // Requests are sent in order, so once the event loop has written the
        // DISCONNECT every earlier publish is on the wire. With the broker
        // unreachable the request queue never drains, so give up after a while.
        let flushed = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
            client.disconnect().await?;
            if let Some(task) = task.as_mut() {
                let _ = task.await;
            }
            Ok::<_, MqttError>(())
        })
        .await;

        if let Some(task) = task {
            task.abort();
        }
        match flushed {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Timed out waiting for MQTT disconnect");
                Err(MqttError::Stalled(DISCONNECT_TIMEOUT))
            }
        }
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop_task.take() {
            task.abort();
        }
    }
}
