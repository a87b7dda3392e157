//! BLE error taxonomy
//!
//! Backends report low-level failures as [`RawFault`]. [`classify`] collapses
//! them into the closed [`BleError`] set, where each variant carries whether a
//! reconnect attempt is warranted.

use thiserror::Error;

use crate::state_machine::DisconnectReason;

/// Failures raised by the attribute protocol layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattFault {
    #[error("connection attempt failed: {0}")]
    ConnectionFailed(String),

    #[error("peripheral not connected: {0}")]
    NotConnected(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("value does not match: {0}")]
    ValueMismatch(String),

    #[error("GATT status {status:?}: {message}")]
    Protocol { status: Option<u8>, message: String },
}

/// Failures raised by the local Bluetooth stack
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BluetoothFault {
    #[error("bluetooth unavailable: {0}")]
    Unavailable(String),

    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    #[error("scanning failed: {0}")]
    Scanning(String),

    #[error("bluetooth failure: {0}")]
    General(String),
}

/// A low-level failure as reported by a platform backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RawFault {
    #[error(transparent)]
    Gatt(#[from] GattFault),

    #[error(transparent)]
    Bluetooth(#[from] BluetoothFault),

    #[error("peer disconnected: {0}")]
    PeerDisconnected(DisconnectReason),

    #[error("peripheral not found: {0}")]
    PeripheralNotFound(String),

    #[error("manager closed: {0}")]
    ManagerClosed(String),

    #[error("{0}")]
    Other(String),
}

/// Closed set of BLE failures seen by callers of the transport core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Peripheral not found")]
    PeripheralNotFound,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Disconnected: {0}")]
    Disconnected(DisconnectReason),

    #[error("Transport fault: {0}")]
    TransportFault(String),

    #[error("Manager closed: {0}")]
    ManagerClosed(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Invalid attribute: {0}")]
    InvalidAttribute(String),

    #[error("Scanning error: {0}")]
    Scanning(String),

    #[error("Bluetooth unavailable: {0}")]
    BluetoothUnavailable(String),

    #[error("Peripheral not connected: {0}")]
    PeripheralNotConnected(String),

    #[error("Value does not match: {0}")]
    ValueDoesNotMatch(String),

    #[error("An unexpected error occurred: {0}")]
    Generic(String),
}

impl BleError {
    /// Whether the failure is worth a fresh connection attempt
    pub fn should_reconnect(&self) -> bool {
        match self {
            BleError::PeripheralNotFound
            | BleError::ManagerClosed(_)
            | BleError::BluetoothUnavailable(_) => false,

            BleError::ConnectionFailed(_)
            | BleError::DiscoveryFailed(_)
            | BleError::Disconnected(_)
            | BleError::TransportFault(_)
            | BleError::OperationFailed(_)
            | BleError::InvalidAttribute(_)
            | BleError::Scanning(_)
            | BleError::PeripheralNotConnected(_)
            | BleError::ValueDoesNotMatch(_)
            | BleError::Generic(_) => true,
        }
    }

    /// Human-readable description
    pub fn message(&self) -> String {
        self.to_string()
    }

    pub fn discovery_failed(message: impl Into<String>) -> Self {
        BleError::DiscoveryFailed(message.into())
    }
}

impl From<RawFault> for BleError {
    fn from(fault: RawFault) -> Self {
        classify(fault)
    }
}

/// Map a raw backend failure into the closed taxonomy
pub fn classify(fault: RawFault) -> BleError {
    match fault {
        RawFault::Gatt(gatt) => match gatt {
            GattFault::ConnectionFailed(msg) => BleError::ConnectionFailed(msg),
            GattFault::NotConnected(msg) => BleError::PeripheralNotConnected(msg),
            GattFault::OperationFailed(msg) => BleError::OperationFailed(msg),
            GattFault::ValueMismatch(msg) => BleError::ValueDoesNotMatch(msg),
            protocol @ GattFault::Protocol { .. } => BleError::TransportFault(protocol.to_string()),
        },
        RawFault::Bluetooth(bt) => match bt {
            BluetoothFault::Unavailable(msg) => BleError::BluetoothUnavailable(msg),
            BluetoothFault::InvalidAttribute(msg) => BleError::InvalidAttribute(msg),
            BluetoothFault::Scanning(msg) => BleError::Scanning(msg),
            // Generic stack faults are reported in the transport bucket
            BluetoothFault::General(msg) => BleError::TransportFault(msg),
        },
        RawFault::PeerDisconnected(reason) => BleError::Disconnected(reason),
        RawFault::PeripheralNotFound(_) => BleError::PeripheralNotFound,
        RawFault::ManagerClosed(msg) => BleError::ManagerClosed(msg),
        RawFault::Other(msg) => BleError::Generic(msg),
    }
}
