use std::time::Duration;

use crate::feed::FeedError;
use crate::mqtt::MqttError;

/// Errors from querying a device or triggering its upgrade
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// The device answered, but not with a usable firmware version
    #[error("malformed response on {topic}: {reason}")]
    MalformedResponse { topic: String, reason: String },

    #[error("no response on {topic} within {after:?}")]
    Timeout { topic: String, after: Duration },

    #[error("failed to deliver command to {topic}: {source}")]
    CommandDeliveryFailed {
        topic: String,
        #[source]
        source: MqttError,
    },

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("release feed unavailable: {0}")]
    Feed(#[from] FeedError),

    #[error("unknown device: {0}")]
    UnknownDevice(String),
}
