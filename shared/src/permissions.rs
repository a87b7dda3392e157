//! Bluetooth permission model

/// First platform level with explicit scan/connect permissions
pub const EXPLICIT_PERMISSION_LEVEL: u32 = 31;

/// Permission grants reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permissions {
    /// Older platforms gate BLE scanning behind location access
    LocationProxy { location: bool },
    /// Newer platforms grant scan and connect separately
    Explicit { scan: bool, connect: bool },
}

impl Permissions {
    /// Pick the model that applies to the given platform level
    pub fn for_platform(level: u32, location: bool, scan: bool, connect: bool) -> Self {
        if level >= EXPLICIT_PERMISSION_LEVEL {
            Permissions::Explicit { scan, connect }
        } else {
            Permissions::LocationProxy { location }
        }
    }

    /// Everything the transport core needs is granted
    pub fn granted(&self) -> bool {
        match *self {
            Permissions::LocationProxy { location } => location,
            Permissions::Explicit { scan, connect } => scan && connect,
        }
    }
}
