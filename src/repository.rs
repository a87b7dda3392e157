//! Process-wide view of the Bluetooth transport
//!
//! The [`Repository`] owns the [`TransportState`] snapshot, the scan
//! lifecycle and bonding. Observers read the current values or subscribe to
//! changes through watch channels; only the repository writes them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use meshlink_shared::profile::{self, SERVICE_UUID};
use meshlink_shared::{classify, BleError, DeviceIdentity, TransportState, Uuid};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::scanner::{ScanFilter, Scanner};
use crate::transport::traits::{Central, Peripheral, SystemEvent};

/// Configuration for the repository
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// How long a scan runs
    pub scan_duration: Duration,
    /// Service identifying mesh radios
    pub service_uuid: Uuid,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(5),
            service_uuid: SERVICE_UUID,
        }
    }
}

type Devices<C> = Vec<DeviceIdentity<<C as Central>::Peripheral>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner<C: Central> {
    central: Arc<C>,
    scanner: Scanner<C>,
    config: RepositoryConfig,
    state: watch::Sender<TransportState<C::Peripheral>>,
    scanned_devices: watch::Sender<Devices<C>>,
    is_scanning: watch::Sender<bool>,
    /// Bumped whenever a scan starts or is stopped
    scan_generation: AtomicU64,
    /// Held across a whole recompute so snapshots are published in order
    refresh_lock: tokio::sync::Mutex<()>,
}

/// Clears the scanning flag when a scan ends for any reason, unless a newer
/// scan has taken over in the meantime.
struct ScanningFlag<'a, C: Central> {
    inner: &'a Inner<C>,
    generation: u64,
}

impl<C: Central> Drop for ScanningFlag<'_, C> {
    fn drop(&mut self) {
        if self.inner.scan_generation.load(Ordering::SeqCst) == self.generation {
            self.inner.is_scanning.send_replace(false);
        }
    }
}

impl<C: Central> Inner<C> {
    async fn run_scan(&self, generation: u64) {
        let _flag = ScanningFlag {
            inner: self,
            generation,
        };

        let filter = ScanFilter::service(self.config.service_uuid);
        let mut results = self.scanner.scan(self.config.scan_duration, Some(filter));

        while let Some(result) = results.next().await {
            match result {
                Ok(device) => {
                    info!("[REPO] Discovered {}", device);
                    self.scanned_devices.send_modify(|devices| {
                        match devices.iter_mut().find(|d| d.same_device(&device)) {
                            Some(existing) => *existing = device,
                            None => devices.push(device),
                        }
                    });
                }
                Err(e) => {
                    warn!("[REPO] Scan failed: {}", e);
                    break;
                }
            }
        }

        info!(
            "[REPO] Scan finished, {} device(s) found",
            self.scanned_devices.borrow().len()
        );
    }

    async fn refresh_state(&self) -> TransportState<C::Peripheral> {
        let _refresh = self.refresh_lock.lock().await;

        let has_permissions = self.central.permissions().await.granted();
        let enabled = match self.central.adapter_powered().await {
            Ok(powered) => powered,
            Err(fault) => {
                warn!("[REPO] Cannot read adapter state: {}", classify(fault));
                false
            }
        };

        let bonded = if has_permissions && enabled {
            self.bonded_radios().await
        } else {
            Vec::new()
        };

        let state = TransportState::new(has_permissions, enabled, bonded);
        debug!(
            "[REPO] State: permissions={} enabled={} bonded={}",
            state.has_permissions,
            state.enabled,
            state.bonded_devices.len()
        );
        self.state.send_replace(state.clone());
        state
    }

    /// Bonded devices that look like mesh radios, by name or by service
    async fn bonded_radios(&self) -> Devices<C> {
        let devices = match self.central.bonded_peripherals().await {
            Ok(devices) => devices,
            Err(fault) => {
                warn!("[REPO] Cannot enumerate bonded devices: {}", classify(fault));
                return Vec::new();
            }
        };

        let mut radios = Vec::new();
        for device in devices {
            let name_matches = device
                .name
                .as_deref()
                .is_some_and(profile::matches_device_name);

            if name_matches
                || device
                    .handle
                    .cached_service_uuids()
                    .await
                    .contains(&self.config.service_uuid)
            {
                radios.push(device);
            }
        }
        radios
    }

    async fn handle_system_event(&self, event: SystemEvent) {
        match &event {
            SystemEvent::AdapterPowerChanged(powered) => {
                info!("[REPO] Adapter powered: {}", powered)
            }
            SystemEvent::BondStateChanged { address } => {
                info!("[REPO] Bond state changed for {}", address)
            }
        }
        self.refresh_state().await;
    }
}

/// Owner of the transport snapshot and the scan lifecycle
pub struct Repository<C: Central> {
    inner: Arc<Inner<C>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Central> Repository<C> {
    pub fn new(central: Arc<C>, config: RepositoryConfig) -> Self {
        let (state, _) = watch::channel(TransportState::default());
        let (scanned_devices, _) = watch::channel(Vec::new());
        let (is_scanning, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                scanner: Scanner::new(Arc::clone(&central)),
                central,
                config,
                state,
                scanned_devices,
                is_scanning,
                scan_generation: AtomicU64::new(0),
                refresh_lock: tokio::sync::Mutex::new(()),
            }),
            scan_task: Mutex::new(None),
            event_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.inner.config
    }

    /// Current transport snapshot
    pub fn state(&self) -> TransportState<C::Peripheral> {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TransportState<C::Peripheral>> {
        self.inner.state.subscribe()
    }

    /// Devices found by the current or last scan, in discovery order
    pub fn scanned_devices(&self) -> Devices<C> {
        self.inner.scanned_devices.borrow().clone()
    }

    pub fn subscribe_scanned_devices(&self) -> watch::Receiver<Devices<C>> {
        self.inner.scanned_devices.subscribe()
    }

    pub fn is_scanning(&self) -> bool {
        *self.inner.is_scanning.borrow()
    }

    pub fn subscribe_is_scanning(&self) -> watch::Receiver<bool> {
        self.inner.is_scanning.subscribe()
    }

    /// Recompute permissions, adapter state and bonded radios
    pub async fn refresh_state(&self) -> TransportState<C::Peripheral> {
        self.inner.refresh_state().await
    }

    /// Start a bounded scan for mesh radios. Does nothing if one is running.
    pub fn start_scan(&self) {
        let mut task = lock(&self.scan_task);
        if self.is_scanning() {
            debug!("[REPO] Scan already running");
            return;
        }

        if let Some(previous) = task.take() {
            previous.abort();
        }

        let generation = self.inner.scan_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.scanned_devices.send_replace(Vec::new());
        self.inner.is_scanning.send_replace(true);
        info!("[REPO] Starting scan for {:?}", self.inner.config.scan_duration);

        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move {
            inner.run_scan(generation).await;
        }));
    }

    /// Cancel the running scan, if any
    pub fn stop_scan(&self) {
        let mut task = lock(&self.scan_task);
        self.inner.scan_generation.fetch_add(1, Ordering::SeqCst);

        if let Some(running) = task.take() {
            if !running.is_finished() {
                info!("[REPO] Stopping scan");
            }
            running.abort();
        }
        self.inner.is_scanning.send_replace(false);
    }

    /// Pair with `device`, then refresh so it shows up as bonded
    pub async fn bond(&self, device: &DeviceIdentity<C::Peripheral>) -> Result<(), BleError> {
        info!("[REPO] Bonding with {}", device);

        if let Err(fault) = device.handle.create_bond().await {
            let err = classify(fault);
            warn!("[REPO] Bonding with {} failed: {}", device, err);
            return Err(err);
        }

        self.refresh_state().await;
        Ok(())
    }

    /// React to a platform broadcast
    pub async fn handle_system_event(&self, event: SystemEvent) {
        self.inner.handle_system_event(event).await;
    }

    /// Feed platform broadcasts into [`Self::handle_system_event`] until the
    /// repository is dropped
    pub async fn listen_for_system_events(&self) -> Result<(), BleError> {
        let mut events = self.inner.central.system_events().await.map_err(classify)?;
        let inner = Arc::clone(&self.inner);

        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                inner.handle_system_event(event).await;
            }
            debug!("[REPO] System event stream ended");
        });

        if let Some(previous) = lock(&self.event_task).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Check for the canonical `XX:XX:XX:XX:XX:XX` address form
    pub fn is_valid_address(address: &str) -> bool {
        meshlink_shared::is_valid_address(address)
    }
}

impl<C: Central> Drop for Repository<C> {
    fn drop(&mut self) {
        for task in [&self.scan_task, &self.event_task] {
            if let Some(task) = lock(task).take() {
                task.abort();
            }
        }
    }
}
