//! Entity abstraction for tasmota-update
//!
//! Entities are what a host platform polls and renders.

use std::sync::Arc;

use tracing::debug;

use crate::device::DeviceTopic;
use crate::error::UpdateError;
use crate::feed::ReleaseFeed;
use crate::mqtt::MqttClient;
use crate::update::UpdateAggregator;
use crate::update::UpdateStatus;

/// Base trait that all entities must implement
pub trait Entity: Send + Sync {
    /// Serialize current state to JSON
    fn state_json(&self) -> serde_json::Value;

    /// Return the platform type of this entity (e.g. "update")
    fn platform(&self) -> &'static str;
}

/// Firmware update entity for one Tasmota device
///
/// The versions are captured when the entity is built and are not refreshed
/// in place; build a new entity to refresh.
pub struct FirmwareUpdateEntity<C: MqttClient, F: ReleaseFeed> {
    status: UpdateStatus,
    topic: DeviceTopic,
    aggregator: Arc<UpdateAggregator<C, F>>,
}

impl<C: MqttClient, F: ReleaseFeed> FirmwareUpdateEntity<C, F> {
    pub fn new(
        status: UpdateStatus,
        topic: DeviceTopic,
        aggregator: Arc<UpdateAggregator<C, F>>,
    ) -> Self {
        Self {
            status,
            topic,
            aggregator,
        }
    }

    pub fn title(&self) -> &str {
        &self.status.display_name
    }

    pub fn installed_version(&self) -> &str {
        &self.status.installed_version
    }

    pub fn latest_version(&self) -> &str {
        &self.status.latest_version
    }

    pub fn update_available(&self) -> bool {
        self.status.update_available()
    }

    pub fn topic(&self) -> &DeviceTopic {
        &self.topic
    }

    /// Start the upgrade
    ///
    /// Tasmota always upgrades to the image at its configured OTA URL, so a
    /// requested version or backup cannot be honoured.
    pub async fn install(&self, version: Option<&str>, backup: bool) -> Result<(), UpdateError> {
        if version.is_some() || backup {
            debug!(
                "Ignoring install options for {} (version={:?}, backup={})",
                self.topic, version, backup
            );
        }
        self.aggregator.install_firmware(&self.topic).await
    }
}

impl<C: MqttClient, F: ReleaseFeed> Entity for FirmwareUpdateEntity<C, F> {
    fn state_json(&self) -> serde_json::Value {
        serde_json::json!({
            "title": self.status.display_name,
            "topic": self.topic,
            "platform": self.platform(),
            "installed_version": self.status.installed_version,
            "latest_version": self.status.latest_version,
            "update_available": self.update_available(),
        })
    }

    fn platform(&self) -> &'static str {
        "update"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::device::Device;
    use crate::device::DeviceStatusClient;
    use crate::feed::StaticReleaseFeed;
    use crate::mqtt::MockMqttClient;

    async fn kitchen_entity() -> FirmwareUpdateEntity<MockMqttClient, StaticReleaseFeed> {
        let mut mock = MockMqttClient::new();
        mock.reply_to(
            "tasmota_kitchen/cmnd/STATUS2",
            "tasmota_kitchen/stat/STATUS2",
            br#"{"StatusFWR":{"Version":"12.5.0(release)"}}"#,
        );
        let aggregator = Arc::new(UpdateAggregator::new(
            DeviceStatusClient::new(mock, Duration::from_secs(1)),
            StaticReleaseFeed::tag("v13.2.0"),
        ));
        let device = Device {
            name: "Kitchen".to_string(),
            topic: DeviceTopic::new("tasmota_kitchen"),
        };

        aggregator.entity(&device).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_entity_properties() {
        let entity = kitchen_entity().await;
        assert_eq!(entity.title(), "Kitchen Firmware Update");
        assert_eq!(entity.installed_version(), "12.5.0(release)");
        assert_eq!(entity.latest_version(), "13.2.0");
        assert!(entity.update_available());
        assert_eq!(entity.platform(), "update");
    }

    #[tokio::test]
    async fn test_state_json() {
        let json = kitchen_entity().await.state_json();
        assert_eq!(json["title"], "Kitchen Firmware Update");
        assert_eq!(json["topic"], "tasmota_kitchen");
        assert_eq!(json["latest_version"], "13.2.0");
        assert_eq!(json["update_available"], true);
    }

    #[tokio::test]
    async fn test_install_ignores_version_and_backup() {
        let entity = kitchen_entity().await;
        entity.install(Some("13.2.0"), true).await.unwrap();

        let mock = entity.aggregator.device_client().client().lock().await;
        let upgrades: Vec<_> = mock
            .published
            .iter()
            .filter(|(topic, _, _)| topic == "tasmota_kitchen/cmnd/Upgrade")
            .collect();
        assert_eq!(upgrades.len(), 1);
        assert_eq!(upgrades[0].1, b"1".to_vec());
    }
}
