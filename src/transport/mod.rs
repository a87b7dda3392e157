//! BLE transport layer: platform seam, BlueZ backend and scanner

pub mod bluez;
#[cfg(test)]
pub(crate) mod fake;
pub mod scanner;
pub mod traits;

pub use bluez::{BluezCentral, BluezCharacteristic, BluezPeripheral};
pub use scanner::{ScanFilter, Scanner};
pub use traits::{
    Advertisement, Central, ConnectOptions, ConnectionParameters, ConnectionPriority, Peripheral,
    Phy, RadioEvent, RemoteCharacteristic, RemoteService, SystemEvent,
};
