#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # mowerlink
//!
//! A Rust library for talking to robotic mowers over Bluetooth Low Energy and
//! through the vendor cloud.
//!
//! The mower speaks a framed binary protocol over two GATT characteristics:
//! one for app-to-device writes and one for device-to-app notifications.
//! Application messages are split into fragments no larger than the link's
//! package length, tagged with a per-link sequence number, and reassembled
//! on the other side. The device never echoes a request id, so the library
//! keeps at most one command in flight and treats the next new field group
//! from the device as its answer.
//!
//! The cloud path obtains a session through a signed multi-step handshake
//! and then correlates commands by the id the relay assigns to each one.
//!
//! ## Layers
//!
//! - **Frame codec** ([`protocol`]): framing, fragmentation, sequence
//!   tracking and reassembly
//! - **Connection lifecycle** ([`connection`]): on-demand connect with
//!   retries, idle disconnect, forced teardown on transport errors
//! - **Command correlation** ([`correlator`]): single-flight request/response
//!   over the local link
//! - **Device state** ([`state`]): merged snapshot of everything the device
//!   has reported
//! - **Cloud** ([`cloud`]): handshake, token refresh and relay correlation
//!
//! The application message schema is supplied through [`MessageCodec`].
//! [`JsonCodec`] stands in for it during development and in tests.
//!
//! ## Quick Start
//!
//! ```no_run
//! use mowerlink::{JsonCodec, MowerDevice};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Discover the closest mower and bind to it
//!     let mower = MowerDevice::connect_first(Arc::new(JsonCodec)).await?;
//!
//!     // Ask for a status report
//!     let report = mower.command("get_report_info", json!({})).await?;
//!     println!("{report:?}");
//!
//!     // Everything the mower has reported so far
//!     println!("{}", mower.snapshot().to_json());
//!
//!     mower.disconnect().await;
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy transport on btleplug
pub mod ble;
/// Cloud session handshake and relay
pub mod cloud;
/// Connection lifecycle management
pub mod connection;
/// Local command correlation
pub mod correlator;
/// Main device control interface
pub mod device;
/// Error types and handling
pub mod error;
/// Application messages and the command catalog
pub mod message;
/// Frame codec
pub mod protocol;
/// Device state store
pub mod state;
/// Wireless transport abstraction
pub mod transport;
/// Type definitions and configuration
pub mod types;

#[cfg(test)]
mod mock;

// Re-export the main types for convenient usage
pub use cloud::{CloudDevice, CloudGateway, CloudSession};
pub use device::MowerDevice;
pub use error::{MowerError, Result};
pub use message::{Category, CommandCatalog, DeviceMessage, JsonCodec, MessageCodec, SubMessage};
pub use state::{DeviceSnapshot, DeviceStateStore};
pub use types::{
    AppCredentials, CloudConfig, ConnectionParams, ConnectionState, DeviceInfo, TimeoutConfig,
};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Mower GATT service advertised during scanning
pub const MOWER_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_2a05_0000_1000_8000_0080_5f9b_34fb);

/// Characteristic the app writes frames to
pub const MOWER_WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_ff01_0000_1000_8000_0080_5f9b_34fb);

/// Characteristic the device notifies frames on
pub const MOWER_NOTIFY_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_ff02_0000_1000_8000_0080_5f9b_34fb);

/// Advertised name prefixes of supported mowers
pub const MOWER_NAME_PREFIXES: &[&str] = &["Luba", "Yuka"];
