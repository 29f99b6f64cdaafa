pub mod api;
pub mod cli;
pub mod config;
pub mod device;
pub mod entity;
pub mod error;
pub mod feed;
pub mod mqtt;
pub mod update;

pub use config::Config;
pub use config::LogLevel;
pub use device::Device;
pub use device::DeviceStatusClient;
pub use device::DeviceTopic;
pub use entity::Entity;
pub use entity::FirmwareUpdateEntity;
pub use error::UpdateError;
pub use feed::FeedError;
pub use feed::ReleaseFeed;
pub use feed::ReleaseFeedClient;
pub use update::UpdateAggregator;
pub use update::UpdateStatus;
