//! Firmware queries and commands for a single Tasmota device over MQTT.
//!
//! Devices are addressed by their topic. Commands go to `{topic}/cmnd/<CMD>`
//! and the device answers on `{topic}/stat/<CMD>`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;

use crate::error::UpdateError;
use crate::mqtt::MqttClient;
use crate::mqtt::MqttError;

const STATUS_FIRMWARE: &str = "STATUS2";
const UPGRADE: &str = "Upgrade";

/// MQTT topic identifying a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceTopic(String);

impl DeviceTopic {
    pub fn new(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Topic the device listens on for `command`
    pub fn command(&self, command: &str) -> String {
        format!("{}/cmnd/{}", self.0, command)
    }

    /// Topic the device answers `command` on
    pub fn stat(&self, command: &str) -> String {
        format!("{}/stat/{}", self.0, command)
    }
}

impl fmt::Display for DeviceTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A configured device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    /// Human-readable name
    pub name: String,

    pub topic: DeviceTopic,
}

/// Reply to `STATUS2`
#[derive(Debug, Deserialize)]
struct FirmwareStatusReply {
    #[serde(rename = "StatusFWR")]
    firmware: FirmwareStatus,
}

#[derive(Debug, Deserialize)]
struct FirmwareStatus {
    #[serde(rename = "Version")]
    version: String,
}

/// Extract `StatusFWR.Version` from a `STATUS2` reply
fn parse_installed_version(topic: &str, payload: &[u8]) -> Result<String, UpdateError> {
    let reply: FirmwareStatusReply =
        serde_json::from_slice(payload).map_err(|e| UpdateError::MalformedResponse {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;

    if reply.firmware.version.is_empty() {
        return Err(UpdateError::MalformedResponse {
            topic: topic.to_string(),
            reason: "empty firmware version".to_string(),
        });
    }

    Ok(reply.firmware.version)
}

/// Queries installed firmware and issues upgrade commands
pub struct DeviceStatusClient<C: MqttClient> {
    client: Arc<Mutex<C>>,
    response_timeout: Duration,
}

impl<C: MqttClient> DeviceStatusClient<C> {
    pub fn new(client: C, response_timeout: Duration) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
            response_timeout,
        }
    }

    /// Connect the underlying MQTT client
    pub async fn connect(&self) -> Result<(), UpdateError> {
        let mut client = self.client.lock().await;
        client.connect().await?;
        Ok(())
    }

    /// Flush pending commands and disconnect
    pub async fn disconnect(&self) -> Result<(), UpdateError> {
        let mut client = self.client.lock().await;
        client.disconnect().await?;
        Ok(())
    }

    /// Ask the device for its running firmware version
    ///
    /// The client lock is held for the whole round trip so that concurrent
    /// requests never consume each other's replies. The response timeout
    /// covers the subscribe and publish as well as the wait for the reply.
    ///
    /// Replies that arrived after an earlier request gave up are discarded
    /// before the request is sent. A reply still in flight at that point can
    /// still be taken for the answer.
    pub async fn fetch_installed_version(
        &self,
        topic: &DeviceTopic,
    ) -> Result<String, UpdateError> {
        let request_topic = topic.command(STATUS_FIRMWARE);
        let reply_topic = topic.stat(STATUS_FIRMWARE);

        let mut client = self.client.lock().await;
        let client = &mut *client;

        let round_trip = async {
            client.subscribe(&reply_topic).await?;
            discard_pending(client);
            client
                .publish(&request_topic, b"", false)
                .await
                .map_err(|source| UpdateError::CommandDeliveryFailed {
                    topic: request_topic.clone(),
                    source,
                })?;
            debug!("Sent firmware status request to {}", request_topic);

            wait_for_reply(client, &reply_topic).await
        };

        let payload = tokio::time::timeout(self.response_timeout, round_trip)
            .await
            .map_err(|_| UpdateError::Timeout {
                topic: reply_topic.clone(),
                after: self.response_timeout,
            })??;

        parse_installed_version(&reply_topic, &payload)
    }

    /// Tell the device to upgrade to the firmware at its configured OTA URL
    ///
    /// Success means the broker accepted the publish; the device does not
    /// acknowledge the command.
    pub async fn send_upgrade(&self, topic: &DeviceTopic) -> Result<(), UpdateError> {
        let command_topic = topic.command(UPGRADE);

        let mut client = self.client.lock().await;
        tokio::time::timeout(
            self.response_timeout,
            client.publish(&command_topic, b"1", false),
        )
        .await
        .unwrap_or(Err(MqttError::Stalled(self.response_timeout)))
        .map_err(|source| UpdateError::CommandDeliveryFailed {
            topic: command_topic.clone(),
            source,
        })?;

        info!("Sent upgrade command to {}", command_topic);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn client(&self) -> &Arc<Mutex<C>> {
        &self.client
    }
}

fn discard_pending<C: MqttClient + ?Sized>(client: &mut C) {
    while let Some(msg) = client.try_poll_message() {
        debug!("Discarding stale message on {}", msg.topic);
    }
}

async fn wait_for_reply<C: MqttClient + ?Sized>(
    client: &mut C,
    reply_topic: &str,
) -> Result<Vec<u8>, UpdateError> {
    loop {
        match client.poll_message().await {
            Some(msg) if msg.topic == reply_topic => return Ok(msg.payload),
            Some(msg) => debug!(
                "Ignoring message on {} while waiting for {}",
                msg.topic, reply_topic
            ),
            None => return Err(MqttError::Closed.into()),
        }
    }
}
