//! Combines the installed and latest firmware versions into an update status.

use std::sync::Arc;

use serde::Serialize;
use tracing::Instrument;
use tracing::Span;
use tracing::debug;
use tracing::info;

use crate::device::Device;
use crate::device::DeviceStatusClient;
use crate::device::DeviceTopic;
use crate::entity::FirmwareUpdateEntity;
use crate::error::UpdateError;
use crate::feed::ReleaseFeed;
use crate::mqtt::MqttClient;

/// Firmware update state of one device at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateStatus {
    pub display_name: String,
    pub installed_version: String,
    pub latest_version: String,
}

impl UpdateStatus {
    pub fn new(device_name: &str, installed_version: String, latest_version: String) -> Self {
        Self {
            display_name: format!("{} Firmware Update", device_name),
            installed_version,
            latest_version,
        }
    }

    /// Whether the latest release is newer than what the device runs
    ///
    /// Tasmota reports versions like `12.5.0(release)`; the build suffix is
    /// ignored. Development builds carry a fourth component (`14.3.0.2`) and
    /// sort after the release they build on. Versions that are neither
    /// dotted numbers nor semver compare by inequality.
    pub fn update_available(&self) -> bool {
        let installed = release_core(&self.installed_version);
        let latest = release_core(&self.latest_version);

        if let (Some(mut installed), Some(mut latest)) =
            (numeric_components(installed), numeric_components(latest))
        {
            let len = installed.len().max(latest.len());
            installed.resize(len, 0);
            latest.resize(len, 0);
            return latest > installed;
        }

        match (
            semver::Version::parse(installed),
            semver::Version::parse(latest),
        ) {
            (Ok(installed), Ok(latest)) => latest > installed,
            _ => installed != latest,
        }
    }
}

fn numeric_components(version: &str) -> Option<Vec<u64>> {
    version.split('.').map(|part| part.parse().ok()).collect()
}

fn release_core(version: &str) -> &str {
    version
        .split_once('(')
        .map_or(version, |(core, _)| core)
        .trim()
}

/// Queries a device and the release feed and reports the combined status
pub struct UpdateAggregator<C: MqttClient, F: ReleaseFeed> {
    device: DeviceStatusClient<C>,
    feed: F,
    span: Span,
}

impl<C: MqttClient, F: ReleaseFeed> UpdateAggregator<C, F> {
    pub fn new(device: DeviceStatusClient<C>, feed: F) -> Self {
        Self {
            device,
            feed,
            span: tracing::info_span!("firmware_update"),
        }
    }

    /// Log everything this aggregator does under `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn device_client(&self) -> &DeviceStatusClient<C> {
        &self.device
    }

    /// Build the update status for `device`
    ///
    /// Returns `Ok(None)` when the latest release could not be fetched; the
    /// reason is logged. Device-side failures are returned as errors.
    pub async fn build_update_status(
        &self,
        device: &Device,
    ) -> Result<Option<UpdateStatus>, UpdateError> {
        async {
            let (installed, latest) = tokio::join!(
                self.device.fetch_installed_version(&device.topic),
                self.feed.fetch_latest_version(),
            );

            let Some(latest) = latest else {
                debug!("Skipping update check for {}", device.topic);
                return Ok(None);
            };
            let installed = installed?;

            Ok::<_, UpdateError>(Some(UpdateStatus::new(&device.name, installed, latest)))
        }
        .instrument(self.span.clone())
        .await
    }

    /// Like `build_update_status`, but a feed failure is an error too
    pub async fn check(&self, device: &Device) -> Result<UpdateStatus, UpdateError> {
        async {
            let (installed, latest) = tokio::join!(
                self.device.fetch_installed_version(&device.topic),
                self.feed.try_fetch_latest_version(),
            );

            let latest = latest?;
            let installed = installed?;

            Ok::<_, UpdateError>(UpdateStatus::new(&device.name, installed, latest))
        }
        .instrument(self.span.clone())
        .await
    }

    /// Trigger a firmware upgrade on the device at `topic`
    pub async fn install_firmware(&self, topic: &DeviceTopic) -> Result<(), UpdateError> {
        async {
            self.device.send_upgrade(topic).await?;
            info!("Firmware upgrade requested for {}", topic);
            Ok::<_, UpdateError>(())
        }
        .instrument(self.span.clone())
        .await
    }

    /// Refresh `device` and wrap the result as a host-facing entity
    pub async fn entity(
        self: &Arc<Self>,
        device: &Device,
    ) -> Result<Option<FirmwareUpdateEntity<C, F>>, UpdateError> {
        let status = self.build_update_status(device).await?;
        Ok(status.map(|status| {
            FirmwareUpdateEntity::new(status, device.topic.clone(), self.clone())
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::feed::StaticReleaseFeed;
    use crate::mqtt::MockMqttClient;

    fn device() -> Device {
        Device {
            name: "Kitchen Plug".to_string(),
            topic: DeviceTopic::new("tasmota_kitchen"),
        }
    }

    fn aggregator(
        reply: Option<&[u8]>,
        feed: StaticReleaseFeed,
    ) -> UpdateAggregator<MockMqttClient, StaticReleaseFeed> {
        let mut mock = MockMqttClient::new();
        if let Some(payload) = reply {
            mock.reply_to(
                "tasmota_kitchen/cmnd/STATUS2",
                "tasmota_kitchen/stat/STATUS2",
                payload,
            );
        }
        let device = DeviceStatusClient::new(mock, Duration::from_millis(200));
        UpdateAggregator::new(device, feed)
    }

    const REPLY: &[u8] = br#"{"StatusFWR":{"Version":"12.5.0(release)"}}"#;

    #[tokio::test]
    async fn test_build_update_status() {
        let aggregator = aggregator(Some(REPLY), StaticReleaseFeed::tag("v13.2.0"));

        let status = aggregator.build_update_status(&device()).await.unwrap();
        assert_eq!(
            status,
            Some(UpdateStatus {
                display_name: "Kitchen Plug Firmware Update".to_string(),
                installed_version: "12.5.0(release)".to_string(),
                latest_version: "13.2.0".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_build_update_status_feed_failure_is_absent() {
        let aggregator = aggregator(Some(REPLY), StaticReleaseFeed::failing(503));
        let status = aggregator.build_update_status(&device()).await.unwrap();
        assert_eq!(status, None);
    }

    #[tokio::test]
    async fn test_build_update_status_feed_failure_with_silent_device() {
        let aggregator = aggregator(None, StaticReleaseFeed::failing(503));
        let status = aggregator.build_update_status(&device()).await.unwrap();
        assert_eq!(status, None);
    }

    #[tokio::test]
    async fn test_build_update_status_malformed_device_reply() {
        let aggregator = aggregator(
            Some(br#"{"StatusFWR":{}}"#),
            StaticReleaseFeed::tag("v13.2.0"),
        );
        let err = aggregator.build_update_status(&device()).await.unwrap_err();
        assert!(matches!(err, UpdateError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn test_check_reports_feed_failure() {
        let aggregator = aggregator(Some(REPLY), StaticReleaseFeed::failing(503));
        let err = aggregator.check(&device()).await.unwrap_err();
        assert!(matches!(
            err,
            UpdateError::Feed(crate::feed::FeedError::Status(503))
        ));
    }

    #[tokio::test]
    async fn test_check_timeout() {
        let aggregator = aggregator(None, StaticReleaseFeed::tag("v13.2.0"));
        let err = aggregator.check(&device()).await.unwrap_err();
        assert!(matches!(err, UpdateError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_install_firmware_publishes_once() {
        let aggregator = aggregator(None, StaticReleaseFeed::tag("v13.2.0"));
        aggregator
            .install_firmware(&DeviceTopic::new("tasmota_kitchen"))
            .await
            .unwrap();

        let mock = aggregator.device_client().client().lock().await;
        assert_eq!(
            mock.published,
            vec![("tasmota_kitchen/cmnd/Upgrade".to_string(), b"1".to_vec(), false)]
        );
    }

    fn status(installed: &str, latest: &str) -> UpdateStatus {
        UpdateStatus::new("Plug", installed.to_string(), latest.to_string())
    }

    #[test]
    fn test_update_available() {
        assert!(status("12.5.0(release)", "13.2.0").update_available());
        assert!(!status("13.2.0(tasmota)", "13.2.0").update_available());
        assert!(!status("14.0.0(release)", "13.2.0").update_available());
        assert!(status("9.10.0", "10.0.0").update_available());

        // Development builds are ahead of the release they build on
        assert!(!status("14.3.0.2(tasmota)", "14.3.0").update_available());
        assert!(status("14.3.0.2(tasmota)", "14.4.0").update_available());
        assert!(!status("14.3(tasmota)", "14.3.0").update_available());

        assert!(status("13.2.0-rc1", "13.2.0").update_available());
        assert!(status("custom", "13.2.0").update_available());
        assert!(!status("custom", "custom").update_available());
    }
}
