//! Meshlink Shared Types
//!
//! This crate provides the platform-independent vocabulary shared by the
//! transport core and its consumers: the mesh-radio GATT profile, device
//! identities, connection states, permission checks and the BLE error
//! taxonomy.

pub mod device;
pub mod error;
pub mod permissions;
pub mod state_machine;

pub use device::{is_valid_address, DeviceIdentity, TransportState};
pub use error::{classify, BleError, BluetoothFault, GattFault, RawFault};
pub use permissions::Permissions;
pub use state_machine::{is_valid_transition, ConnectionState, DisconnectReason};
pub use uuid::Uuid;

/// Identifiers of the mesh-radio GATT profile.
///
/// These must match the radio firmware bit-for-bit.
pub mod profile {
    use regex::Regex;
    use std::sync::OnceLock;
    use uuid::Uuid;

    /// Primary mesh-radio service
    pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6ba1b218_15a8_461f_9fa8_5dcae273eafd);

    /// Client writes packets for the radio here
    pub const TO_RADIO_UUID: Uuid = Uuid::from_u128(0xf75c76d2_129e_4dad_a1dd_7866124401e7);

    /// Client drains packets from the radio here
    pub const FROM_RADIO_UUID: Uuid = Uuid::from_u128(0x2c55e69e_4993_11ed_b878_0242ac120002);

    /// Notifies the client that FROM_RADIO has pending packets
    pub const FROM_NUM_UUID: Uuid = Uuid::from_u128(0xed9da18c_a800_4f66_a670_aa7547e34453);

    /// Streams firmware log records
    pub const LOG_RADIO_UUID: Uuid = Uuid::from_u128(0x5a3d6e49_06e6_4423_9944_e9de8cdf9547);

    /// Every characteristic a fully functional radio link needs
    pub const CHARACTERISTICS: [Uuid; 4] =
        [TO_RADIO_UUID, FROM_RADIO_UUID, FROM_NUM_UUID, LOG_RADIO_UUID];

    /// Advertised names end in an underscore and four hex digits, e.g. `Meshtastic_1A2B`
    pub const NAME_PATTERN: &str = r"^.*_[0-9A-Fa-f]{4}$";

    /// Compiled form of [`NAME_PATTERN`]
    pub fn name_regex() -> &'static Regex {
        static NAME_REGEX: OnceLock<Regex> = OnceLock::new();
        NAME_REGEX.get_or_init(|| Regex::new(NAME_PATTERN).expect("NAME_PATTERN is a valid regex"))
    }

    /// Check whether an advertised name looks like a mesh radio
    pub fn matches_device_name(name: &str) -> bool {
        name_regex().is_match(name)
    }
}
