//! BlueZ backend for Linux centrals

use std::fmt;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
    DiscoveryFilter, DiscoveryTransport, ErrorKind, Session,
};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use meshlink_shared::{
    classify, BleError, BluetoothFault, ConnectionState, DeviceIdentity, DisconnectReason,
    GattFault, Permissions, RawFault, Uuid,
};
use tracing::{debug, info};

use crate::transport::scanner::ScanFilter;
use crate::transport::traits::{
    Advertisement, Central, ConnectOptions, ConnectionParameters, ConnectionPriority, Peripheral,
    RadioEvent, RemoteCharacteristic, RemoteService, SystemEvent,
};

/// Map a BlueZ error onto the backend fault taxonomy
pub fn fault_from(err: bluer::Error) -> RawFault {
    let message = err.to_string();
    match err.kind {
        ErrorKind::DoesNotExist | ErrorKind::NotFound | ErrorKind::InvalidAddress(_) => {
            RawFault::PeripheralNotFound(message)
        }
        ErrorKind::ConnectionAttemptFailed
        | ErrorKind::AuthenticationCanceled
        | ErrorKind::AuthenticationFailed
        | ErrorKind::AuthenticationRejected
        | ErrorKind::AuthenticationTimeout => GattFault::ConnectionFailed(message).into(),
        ErrorKind::NotReady | ErrorKind::NotAvailable => BluetoothFault::Unavailable(message).into(),
        ErrorKind::ServicesUnresolved => BluetoothFault::InvalidAttribute(message).into(),
        ErrorKind::InvalidLength | ErrorKind::InvalidOffset => GattFault::ValueMismatch(message).into(),
        ErrorKind::InProgress
        | ErrorKind::Failed
        | ErrorKind::NotSupported
        | ErrorKind::InvalidArguments
        | ErrorKind::NotAuthorized
        | ErrorKind::NotPermitted => GattFault::OperationFailed(message).into(),
        // D-Bus connection to bluetoothd lost
        ErrorKind::Internal(_) => RawFault::ManagerClosed(message),
        _ => RawFault::Other(message),
    }
}

/// Failures while starting discovery are scanning faults unless the radio is gone
fn scan_fault(err: bluer::Error) -> RawFault {
    match fault_from(err) {
        fault @ RawFault::Bluetooth(BluetoothFault::Unavailable(_)) => fault,
        fault => BluetoothFault::Scanning(fault.to_string()).into(),
    }
}

fn link_state(connected: bool) -> ConnectionState {
    if connected {
        ConnectionState::Connected
    } else {
        // BlueZ does not report why a link went away
        ConnectionState::Disconnected(DisconnectReason::Unknown)
    }
}

/// A characteristic of a remote GATT service
#[derive(Clone)]
pub struct BluezCharacteristic {
    uuid: Uuid,
    inner: Characteristic,
}

impl BluezCharacteristic {
    /// Underlying BlueZ characteristic, for reads, writes and notifications
    pub fn inner(&self) -> &Characteristic {
        &self.inner
    }
}

impl fmt::Debug for BluezCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BluezCharacteristic")
            .field("uuid", &self.uuid)
            .finish()
    }
}

impl RemoteCharacteristic for BluezCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

/// A remote device known to the BlueZ adapter
#[derive(Clone)]
pub struct BluezPeripheral {
    device: Device,
}

impl fmt::Debug for BluezPeripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BluezPeripheral")
            .field("address", &self.device.address())
            .finish()
    }
}

fn identity(device: Device, name: Option<String>) -> DeviceIdentity<BluezPeripheral> {
    let address = device.address().to_string();
    DeviceIdentity::new(BluezPeripheral { device }, name, address)
}

#[async_trait]
impl Peripheral for BluezPeripheral {
    type Characteristic = BluezCharacteristic;

    async fn connect(&self, options: ConnectOptions) -> Result<(), RawFault> {
        if options.auto_connect {
            // Trusted devices are reconnected by bluetoothd when they reappear
            if let Err(e) = self.device.set_trusted(true).await {
                debug!("[BLE] Could not trust {}: {}", self.device.address(), e);
            }
        }

        if self.device.is_connected().await.map_err(fault_from)? {
            debug!("[BLE] {} already connected", self.device.address());
            return Ok(());
        }

        // ATT MTU exchange is done by bluetoothd on connect
        self.device.connect().await.map_err(fault_from)
    }

    async fn disconnect(&self) -> Result<(), RawFault> {
        self.device.disconnect().await.map_err(fault_from)
    }

    async fn state_events(&self) -> Result<BoxStream<'static, ConnectionState>, RawFault> {
        let events = self.device.events().await.map_err(fault_from)?;
        let connected = self.device.is_connected().await.map_err(fault_from)?;

        let changes = events.filter_map(|event| {
            future::ready(match event {
                DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) => {
                    Some(link_state(connected))
                }
                _ => None,
            })
        });

        Ok(stream::once(future::ready(link_state(connected)))
            .chain(changes)
            .boxed())
    }

    async fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<(), RawFault> {
        Err(GattFault::OperationFailed(format!(
            "{:?} priority requested, but connection parameters are managed by BlueZ",
            priority
        ))
        .into())
    }

    async fn radio_events(&self) -> Result<BoxStream<'static, RadioEvent>, RawFault> {
        let events = self.device.events().await.map_err(fault_from)?;

        Ok(events
            .filter_map(|event| {
                future::ready(match event {
                    DeviceEvent::PropertyChanged(DeviceProperty::Rssi(rssi)) => Some(RadioEvent::Rssi(rssi)),
                    DeviceEvent::PropertyChanged(DeviceProperty::TxPower(power)) => {
                        Some(RadioEvent::TxPower(power))
                    }
                    _ => None,
                })
            })
            .boxed())
    }

    async fn connection_parameter_events(
        &self,
    ) -> Result<BoxStream<'static, ConnectionParameters>, RawFault> {
        // Not exposed over D-Bus
        Ok(stream::empty().boxed())
    }

    async fn discover_services(
        &self,
        uuids: &[Uuid],
    ) -> Result<Vec<RemoteService<BluezCharacteristic>>, RawFault> {
        let mut found = Vec::new();

        for service in self.device.services().await.map_err(fault_from)? {
            let uuid = service.uuid().await.map_err(fault_from)?;
            if !uuids.is_empty() && !uuids.contains(&uuid) {
                continue;
            }

            let mut characteristics = Vec::new();
            for inner in service.characteristics().await.map_err(fault_from)? {
                characteristics.push(BluezCharacteristic {
                    uuid: inner.uuid().await.map_err(fault_from)?,
                    inner,
                });
            }

            found.push(RemoteService {
                uuid,
                characteristics,
            });
        }

        Ok(found)
    }

    async fn cached_service_uuids(&self) -> Vec<Uuid> {
        match self.device.uuids().await {
            Ok(uuids) => uuids.unwrap_or_default().into_iter().collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn create_bond(&self) -> Result<(), RawFault> {
        if self.device.is_paired().await.map_err(fault_from)? {
            return Ok(());
        }

        info!("[BLE] Pairing with {}", self.device.address());
        self.device.pair().await.map_err(fault_from)
    }
}

/// The local BlueZ adapter
pub struct BluezCentral {
    // Keeps the D-Bus connection alive
    _session: Session,
    adapter: Adapter,
}

impl BluezCentral {
    /// Open a BlueZ session on the named adapter, or the default one
    pub async fn new(adapter_name: Option<&str>) -> anyhow::Result<Self> {
        let session = Session::new().await?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!("[BLE] Using adapter {}", adapter.name());

        Ok(Self {
            _session: session,
            adapter,
        })
    }

    /// Look up a device the adapter already knows by its address
    pub async fn peripheral(&self, address: &str) -> Result<DeviceIdentity<BluezPeripheral>, BleError> {
        let addr: Address = address.parse().map_err(|_| BleError::PeripheralNotFound)?;
        let device = self.adapter.device(addr).map_err(|e| classify(fault_from(e)))?;
        let name = device.name().await.map_err(|e| classify(fault_from(e)))?;
        Ok(identity(device, name))
    }
}

async fn advertisement(adapter: &Adapter, addr: Address) -> Option<Advertisement<BluezPeripheral>> {
    let device = adapter.device(addr).ok()?;
    let name = device.name().await.ok().flatten();
    let service_uuids = device
        .uuids()
        .await
        .ok()
        .flatten()
        .unwrap_or_default()
        .into_iter()
        .collect();
    let rssi = device.rssi().await.ok().flatten();

    Some(Advertisement {
        device: identity(device, name),
        service_uuids,
        rssi,
    })
}

#[async_trait]
impl Central for BluezCentral {
    type Peripheral = BluezPeripheral;

    async fn scan(
        &self,
        filter: &ScanFilter,
    ) -> Result<BoxStream<'static, Advertisement<BluezPeripheral>>, RawFault> {
        let discovery_filter = DiscoveryFilter {
            uuids: filter.service_uuids.iter().copied().collect(),
            transport: DiscoveryTransport::Le,
            ..Default::default()
        };
        self.adapter
            .set_discovery_filter(discovery_filter)
            .await
            .map_err(scan_fault)?;

        // Discovery stops when this stream is dropped
        let events = self.adapter.discover_devices().await.map_err(scan_fault)?;
        let adapter = self.adapter.clone();

        Ok(events
            .filter_map(move |event| {
                let adapter = adapter.clone();
                async move {
                    match event {
                        AdapterEvent::DeviceAdded(addr) => advertisement(&adapter, addr).await,
                        _ => None,
                    }
                }
            })
            .boxed())
    }

    async fn bonded_peripherals(&self) -> Result<Vec<DeviceIdentity<BluezPeripheral>>, RawFault> {
        let mut bonded = Vec::new();

        for addr in self.adapter.device_addresses().await.map_err(fault_from)? {
            let device = self.adapter.device(addr).map_err(fault_from)?;
            if device.is_paired().await.unwrap_or(false) {
                let name = device.name().await.ok().flatten();
                bonded.push(identity(device, name));
            }
        }

        Ok(bonded)
    }

    async fn adapter_powered(&self) -> Result<bool, RawFault> {
        self.adapter.is_powered().await.map_err(fault_from)
    }

    async fn permissions(&self) -> Permissions {
        // Access is granted by D-Bus policy; an unreachable adapter means no access
        let granted = match self.adapter.is_powered().await {
            Ok(_) => true,
            Err(e) => {
                debug!("[BLE] Adapter not accessible: {}", e);
                false
            }
        };

        Permissions::Explicit {
            scan: granted,
            connect: granted,
        }
    }

    async fn system_events(&self) -> Result<BoxStream<'static, SystemEvent>, RawFault> {
        let events = self.adapter.events().await.map_err(fault_from)?;

        Ok(events
            .filter_map(|event| {
                future::ready(match event {
                    AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) => {
                        Some(SystemEvent::AdapterPowerChanged(powered))
                    }
                    AdapterEvent::DeviceRemoved(addr) => Some(SystemEvent::BondStateChanged {
                        address: addr.to_string(),
                    }),
                    _ => None,
                })
            })
            .boxed())
    }
}
