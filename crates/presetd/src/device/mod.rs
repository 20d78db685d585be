//! Speaker local control surface.
//!
//! [`DeviceClient`] is the seam everything above it talks through. The HTTP implementation
//! speaks the vendor's XML API; the fixture implementation answers for the offline device set.

mod client;
mod fixture;
mod http;
pub mod xml;

pub use client::base_url;
pub(crate) use client::host_ip;
pub use client::DeviceClient;
pub use client::DeviceError;
pub use client::DeviceInfo;
pub use client::DevicePreset;
pub use client::NowPlaying;
pub use fixture::FixtureDeviceClient;
pub use http::HttpDeviceClient;
