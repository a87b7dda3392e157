//! Meshlink
//!
//! Bluetooth LE transport core for a mesh radio: discovery, bonding and a
//! supervised link to one device. Platform access goes through the traits in
//! [`transport::traits`]; [`transport::BluezCentral`] implements them on
//! Linux.

pub mod connection;
pub mod repository;
pub mod retry;
pub mod transport;

pub use meshlink_shared::{
    classify, profile, BleError, ConnectionState, DeviceIdentity, DisconnectReason, Permissions,
    TransportState,
};
