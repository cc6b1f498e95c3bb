// edgesync-api: Async client for the device connection registry

pub mod client;
pub mod error;
pub mod transport;
pub mod types;

pub use client::RegistryClient;
pub use error::Error;
pub use transport::{TlsMode, TransportConfig};
pub use types::{AgentMessage, DeviceConnection, DeviceVersions};
