//! Scriptable in-memory platform used by the unit tests

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{self, BoxStream, StreamExt};
use meshlink_shared::{
    BluetoothFault, ConnectionState, DeviceIdentity, DisconnectReason, GattFault, Permissions,
    RawFault, Uuid,
};

use crate::transport::scanner::ScanFilter;
use crate::transport::traits::{
    Advertisement, Central, ConnectOptions, ConnectionParameters, ConnectionPriority, Peripheral,
    RadioEvent, RemoteCharacteristic, RemoteService, SystemEvent,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq)]
pub struct FakeCharacteristic {
    uuid: Uuid,
}

impl FakeCharacteristic {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid }
    }
}

impl RemoteCharacteristic for FakeCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

/// Build a service exposing the given characteristics
pub fn service(uuid: Uuid, characteristics: &[Uuid]) -> RemoteService<FakeCharacteristic> {
    RemoteService {
        uuid,
        characteristics: characteristics.iter().copied().map(FakeCharacteristic::new).collect(),
    }
}

#[derive(Default)]
struct PeripheralInner {
    state: ConnectionState,
    state_senders: Vec<mpsc::UnboundedSender<ConnectionState>>,
    connect_results: VecDeque<Result<(), RawFault>>,
    connect_calls: usize,
    connect_delay: Option<Duration>,
    disconnect_calls: usize,
    priority_calls: usize,
    services: Vec<RemoteService<FakeCharacteristic>>,
    discovery_script: VecDeque<Result<Vec<RemoteService<FakeCharacteristic>>, RawFault>>,
    discover_calls: usize,
    cached_uuids: Vec<Uuid>,
    bond_fault: Option<RawFault>,
    bonded: bool,
    radio_fails: bool,
}

/// Peripheral whose link behaviour is driven by the test
#[derive(Clone, Default)]
pub struct FakePeripheral {
    inner: Arc<Mutex<PeripheralInner>>,
}

impl fmt::Debug for FakePeripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakePeripheral")
            .field("state", &lock(&self.inner).state)
            .finish()
    }
}

impl FakePeripheral {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap into an identity with the given name and address
    pub fn identity(&self, name: Option<&str>, address: &str) -> DeviceIdentity<FakePeripheral> {
        DeviceIdentity::new(self.clone(), name.map(str::to_string), address)
    }

    /// Services returned once the discovery script is exhausted
    pub fn set_services(&self, services: Vec<RemoteService<FakeCharacteristic>>) {
        lock(&self.inner).services = services;
    }

    /// Queue responses for the next discovery calls
    pub fn script_discovery(
        &self,
        responses: Vec<Result<Vec<RemoteService<FakeCharacteristic>>, RawFault>>,
    ) {
        lock(&self.inner).discovery_script.extend(responses);
    }

    /// Make every connect wait this long before the platform answers
    pub fn set_connect_delay(&self, delay: Duration) {
        lock(&self.inner).connect_delay = Some(delay);
    }

    pub fn fail_next_connect(&self, fault: RawFault) {
        lock(&self.inner).connect_results.push_back(Err(fault));
    }

    pub fn set_cached_uuids(&self, uuids: Vec<Uuid>) {
        lock(&self.inner).cached_uuids = uuids;
    }

    pub fn fail_bond(&self, fault: RawFault) {
        lock(&self.inner).bond_fault = Some(fault);
    }

    pub fn set_bonded(&self, bonded: bool) {
        lock(&self.inner).bonded = bonded;
    }

    pub fn fail_radio_events(&self) {
        lock(&self.inner).radio_fails = true;
    }

    /// Report a link state change from the platform side
    pub fn emit_state(&self, state: ConnectionState) {
        let mut inner = lock(&self.inner);
        inner.state = state.clone();
        inner
            .state_senders
            .retain(|tx| tx.unbounded_send(state.clone()).is_ok());
    }

    /// End every state subscription, as when the platform forgets the device
    pub fn close_state_streams(&self) {
        lock(&self.inner).state_senders.clear();
    }

    /// Number of live state subscriptions
    pub fn observers(&self) -> usize {
        let mut inner = lock(&self.inner);
        inner.state_senders.retain(|tx| !tx.is_closed());
        inner.state_senders.len()
    }

    pub fn is_bonded(&self) -> bool {
        lock(&self.inner).bonded
    }

    pub fn connect_calls(&self) -> usize {
        lock(&self.inner).connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        lock(&self.inner).disconnect_calls
    }

    pub fn discover_calls(&self) -> usize {
        lock(&self.inner).discover_calls
    }

    pub fn priority_calls(&self) -> usize {
        lock(&self.inner).priority_calls
    }
}

#[async_trait]
impl Peripheral for FakePeripheral {
    type Characteristic = FakeCharacteristic;

    async fn connect(&self, _options: ConnectOptions) -> Result<(), RawFault> {
        let (result, delay) = {
            let mut inner = lock(&self.inner);
            inner.connect_calls += 1;
            (inner.connect_results.pop_front().unwrap_or(Ok(())), inner.connect_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if result.is_ok() {
            self.emit_state(ConnectionState::Connected);
        }
        result
    }

    async fn disconnect(&self) -> Result<(), RawFault> {
        lock(&self.inner).disconnect_calls += 1;
        self.emit_state(ConnectionState::Disconnected(DisconnectReason::LocalRequest));
        Ok(())
    }

    async fn state_events(&self) -> Result<BoxStream<'static, ConnectionState>, RawFault> {
        let (tx, rx) = mpsc::unbounded();
        let mut inner = lock(&self.inner);
        let _ = tx.unbounded_send(inner.state.clone());
        inner.state_senders.push(tx);
        Ok(rx.boxed())
    }

    async fn request_connection_priority(&self, _priority: ConnectionPriority) -> Result<(), RawFault> {
        lock(&self.inner).priority_calls += 1;
        Ok(())
    }

    async fn radio_events(&self) -> Result<BoxStream<'static, RadioEvent>, RawFault> {
        if lock(&self.inner).radio_fails {
            return Err(GattFault::OperationFailed("phy read rejected".into()).into());
        }
        Ok(stream::pending().boxed())
    }

    async fn connection_parameter_events(
        &self,
    ) -> Result<BoxStream<'static, ConnectionParameters>, RawFault> {
        Ok(stream::pending().boxed())
    }

    async fn discover_services(
        &self,
        uuids: &[Uuid],
    ) -> Result<Vec<RemoteService<FakeCharacteristic>>, RawFault> {
        let mut inner = lock(&self.inner);
        inner.discover_calls += 1;

        let services = match inner.discovery_script.pop_front() {
            Some(response) => response?,
            None => inner.services.clone(),
        };

        Ok(services
            .into_iter()
            .filter(|s| uuids.is_empty() || uuids.contains(&s.uuid))
            .collect())
    }

    async fn cached_service_uuids(&self) -> Vec<Uuid> {
        lock(&self.inner).cached_uuids.clone()
    }

    async fn create_bond(&self) -> Result<(), RawFault> {
        let mut inner = lock(&self.inner);
        if let Some(fault) = inner.bond_fault.take() {
            return Err(fault);
        }
        inner.bonded = true;
        Ok(())
    }
}

/// Decrements the active scan count when the scan stream is dropped
struct ScanGuard(Arc<AtomicUsize>);

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct CentralInner {
    powered: bool,
    permissions: Permissions,
    known: Vec<DeviceIdentity<FakePeripheral>>,
    adverts: Vec<(Duration, Advertisement<FakePeripheral>)>,
    scan_fault: Option<RawFault>,
    scan_calls: usize,
    last_filter: Option<ScanFilter>,
    bonded_queries: usize,
    bonded_delay: Option<Duration>,
    event_senders: Vec<mpsc::UnboundedSender<SystemEvent>>,
}

/// Adapter whose radio environment is scripted by the test
pub struct FakeCentral {
    inner: Mutex<CentralInner>,
    active_scans: Arc<AtomicUsize>,
}

impl Default for FakeCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCentral {
    /// Powered adapter with every permission granted
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CentralInner {
                powered: true,
                permissions: Permissions::Explicit {
                    scan: true,
                    connect: true,
                },
                known: Vec::new(),
                adverts: Vec::new(),
                scan_fault: None,
                scan_calls: 0,
                last_filter: None,
                bonded_queries: 0,
                bonded_delay: None,
                event_senders: Vec::new(),
            }),
            active_scans: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_powered(&self, powered: bool) {
        lock(&self.inner).powered = powered;
    }

    pub fn set_permissions(&self, permissions: Permissions) {
        lock(&self.inner).permissions = permissions;
    }

    /// Make a device known to the adapter without bonding it
    pub fn add_known(&self, device: DeviceIdentity<FakePeripheral>) {
        lock(&self.inner).known.push(device);
    }

    /// Make a device known to the adapter and bond it
    pub fn add_bonded(&self, device: DeviceIdentity<FakePeripheral>) {
        device.handle.set_bonded(true);
        self.add_known(device);
    }

    /// Queue an advertisement, seen `delay` after the previous one
    pub fn advertise(&self, delay: Duration, device: DeviceIdentity<FakePeripheral>, service_uuids: Vec<Uuid>) {
        lock(&self.inner).adverts.push((
            delay,
            Advertisement {
                device,
                service_uuids,
                rssi: Some(-60),
            },
        ));
    }

    /// Make bonded-device enumeration take this long
    pub fn set_bonded_delay(&self, delay: Duration) {
        lock(&self.inner).bonded_delay = Some(delay);
    }

    pub fn fail_next_scan(&self, reason: &str) {
        lock(&self.inner).scan_fault = Some(BluetoothFault::Scanning(reason.to_string()).into());
    }

    /// Deliver a system broadcast to every listener
    pub fn emit_system_event(&self, event: SystemEvent) {
        lock(&self.inner)
            .event_senders
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    pub fn scan_calls(&self) -> usize {
        lock(&self.inner).scan_calls
    }

    pub fn active_scans(&self) -> usize {
        self.active_scans.load(Ordering::SeqCst)
    }

    pub fn last_filter(&self) -> Option<ScanFilter> {
        lock(&self.inner).last_filter.clone()
    }

    pub fn bonded_queries(&self) -> usize {
        lock(&self.inner).bonded_queries
    }
}

#[async_trait]
impl Central for FakeCentral {
    type Peripheral = FakePeripheral;

    async fn scan(
        &self,
        filter: &ScanFilter,
    ) -> Result<BoxStream<'static, Advertisement<FakePeripheral>>, RawFault> {
        let script = {
            let mut inner = lock(&self.inner);
            inner.scan_calls += 1;
            inner.last_filter = Some(filter.clone());
            if let Some(fault) = inner.scan_fault.take() {
                return Err(fault);
            }
            inner.adverts.clone()
        };

        self.active_scans.fetch_add(1, Ordering::SeqCst);
        let guard = ScanGuard(Arc::clone(&self.active_scans));

        // A real radio keeps scanning until told to stop
        let adverts = stream::iter(script)
            .then(|(delay, advert)| async move {
                tokio::time::sleep(delay).await;
                advert
            })
            .chain(stream::pending())
            .map(move |advert| {
                let _scan = &guard;
                advert
            });

        Ok(adverts.boxed())
    }

    async fn bonded_peripherals(&self) -> Result<Vec<DeviceIdentity<FakePeripheral>>, RawFault> {
        let delay = {
            let mut inner = lock(&self.inner);
            inner.bonded_queries += 1;
            inner.bonded_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let inner = lock(&self.inner);
        Ok(inner
            .known
            .iter()
            .filter(|d| d.handle.is_bonded())
            .cloned()
            .collect())
    }

    async fn adapter_powered(&self) -> Result<bool, RawFault> {
        Ok(lock(&self.inner).powered)
    }

    async fn permissions(&self) -> Permissions {
        lock(&self.inner).permissions
    }

    async fn system_events(&self) -> Result<BoxStream<'static, SystemEvent>, RawFault> {
        let (tx, rx) = mpsc::unbounded();
        lock(&self.inner).event_senders.push(tx);
        Ok(rx.boxed())
    }
}
