//! Device identities and the process-wide transport snapshot

use std::fmt;
use std::hash::{Hash, Hasher};

/// A remote device as seen by the transport core.
///
/// `handle` is the opaque platform object used to talk to the device. Two
/// identities refer to the same device iff their addresses match.
#[derive(Clone)]
pub struct DeviceIdentity<H> {
    pub handle: H,
    pub name: Option<String>,
    pub address: String,
}

impl<H> DeviceIdentity<H> {
    pub fn new(handle: H, name: Option<String>, address: impl Into<String>) -> Self {
        Self {
            handle,
            name,
            address: address.into(),
        }
    }

    /// Name for log lines, falling back to the address
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }

    /// Same device, regardless of handle or name
    pub fn same_device(&self, other: &DeviceIdentity<H>) -> bool {
        self.address == other.address
    }
}

impl<H> PartialEq for DeviceIdentity<H> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl<H> Eq for DeviceIdentity<H> {}

impl<H> Hash for DeviceIdentity<H> {
    fn hash<S: Hasher>(&self, state: &mut S) {
        self.address.hash(state);
    }
}

impl<H> fmt::Debug for DeviceIdentity<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("name", &self.name)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl<H> fmt::Display for DeviceIdentity<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Snapshot of Bluetooth availability.
///
/// Snapshots are rebuilt on every refresh, never patched. `bonded_devices`
/// is empty whenever the adapter is off or permissions are missing.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportState<H> {
    pub has_permissions: bool,
    pub enabled: bool,
    pub bonded_devices: Vec<DeviceIdentity<H>>,
}

impl<H> TransportState<H> {
    pub fn new(has_permissions: bool, enabled: bool, bonded_devices: Vec<DeviceIdentity<H>>) -> Self {
        let bonded_devices = if has_permissions && enabled {
            bonded_devices
        } else {
            Vec::new()
        };

        Self {
            has_permissions,
            enabled,
            bonded_devices,
        }
    }

    /// Whether scanning and connecting can work at all
    pub fn is_usable(&self) -> bool {
        self.has_permissions && self.enabled
    }
}

impl<H> Default for TransportState<H> {
    /// Permissions are assumed granted until the first real refresh so that
    /// observers are not told about a denial that never happened.
    fn default() -> Self {
        Self {
            has_permissions: true,
            enabled: false,
            bonded_devices: Vec::new(),
        }
    }
}

/// Check for the canonical `XX:XX:XX:XX:XX:XX` form (upper-case hex only)
pub fn is_valid_address(address: &str) -> bool {
    let bytes = address.as_bytes();
    if bytes.len() != 17 {
        return false;
    }

    bytes.iter().enumerate().all(|(i, &b)| {
        if i % 3 == 2 {
            b == b':'
        } else {
            b.is_ascii_digit() || (b'A'..=b'F').contains(&b)
        }
    })
}
