//! Platform abstraction for pluggable BLE backends
//!
//! The transport core talks to the Bluetooth stack only through these traits.
//! Callback-style platform APIs are bridged into streams; dropping a returned
//! stream unregisters whatever the backend registered for it.

use async_trait::async_trait;
use futures::stream::BoxStream;
use meshlink_shared::{ConnectionState, DeviceIdentity, Permissions, RawFault, Uuid};

use crate::transport::scanner::ScanFilter;

/// Hints passed along with a link request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Let the platform re-establish the link when the device comes back in range
    pub auto_connect: bool,
    /// Negotiate the largest attribute value length the peer supports
    pub request_highest_value_length: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            auto_connect: true,
            request_highest_value_length: true,
        }
    }
}

/// Link-layer scheduling preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPriority {
    Balanced,
    High,
    LowPower,
}

/// Physical layer used on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phy {
    Le1M,
    Le2M,
    LeCoded,
}

/// Radio-level changes observed on a live link (diagnostics only)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent {
    Phy { tx: Phy, rx: Phy },
    Rssi(i16),
    TxPower(i16),
}

/// Negotiated connection parameters (diagnostics only)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionParameters {
    pub interval_ms: f32,
    pub peripheral_latency: u16,
    pub supervision_timeout_ms: u32,
}

/// One advertisement seen while scanning
#[derive(Debug, Clone)]
pub struct Advertisement<P> {
    pub device: DeviceIdentity<P>,
    pub service_uuids: Vec<Uuid>,
    pub rssi: Option<i16>,
}

/// A GATT service with its characteristics, as reported by the peer
#[derive(Debug, Clone)]
pub struct RemoteService<C> {
    pub uuid: Uuid,
    pub characteristics: Vec<C>,
}

/// System-level Bluetooth broadcasts the repository reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    AdapterPowerChanged(bool),
    BondStateChanged { address: String },
}

/// Handle to one characteristic of a remote service
pub trait RemoteCharacteristic: Clone + Send + Sync + 'static {
    fn uuid(&self) -> Uuid;
}

/// A remote device the central can link with
#[async_trait]
pub trait Peripheral: Clone + Send + Sync + 'static {
    type Characteristic: RemoteCharacteristic;

    /// Establish the link, resolving once it is up
    async fn connect(&self, options: ConnectOptions) -> Result<(), RawFault>;

    /// Tear the link down
    async fn disconnect(&self) -> Result<(), RawFault>;

    /// Current link state first, then every change
    async fn state_events(&self) -> Result<BoxStream<'static, ConnectionState>, RawFault>;

    async fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<(), RawFault>;

    async fn radio_events(&self) -> Result<BoxStream<'static, RadioEvent>, RawFault>;

    async fn connection_parameter_events(
        &self,
    ) -> Result<BoxStream<'static, ConnectionParameters>, RawFault>;

    /// Discover the services with the given UUIDs (all services if empty)
    async fn discover_services(
        &self,
        uuids: &[Uuid],
    ) -> Result<Vec<RemoteService<Self::Characteristic>>, RawFault>;

    /// Service UUIDs the platform already knows about, without remote I/O
    async fn cached_service_uuids(&self) -> Vec<Uuid>;

    /// Pair with the device, resolving once bonding has finished
    async fn create_bond(&self) -> Result<(), RawFault>;
}

/// The local Bluetooth adapter acting as central
#[async_trait]
pub trait Central: Send + Sync + 'static {
    type Peripheral: Peripheral;

    /// Start discovery; the scan runs until the returned stream is dropped
    async fn scan(
        &self,
        filter: &ScanFilter,
    ) -> Result<BoxStream<'static, Advertisement<Self::Peripheral>>, RawFault>;

    async fn bonded_peripherals(&self) -> Result<Vec<DeviceIdentity<Self::Peripheral>>, RawFault>;

    async fn adapter_powered(&self) -> Result<bool, RawFault>;

    async fn permissions(&self) -> Permissions;

    async fn system_events(&self) -> Result<BoxStream<'static, SystemEvent>, RawFault>;
}
