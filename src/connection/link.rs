//! Lifecycle of the link to a single remote device
//!
//! A [`Connection`] owns at most one device at a time. Connecting to a new
//! device cancels monitoring of the previous one before anything else
//! happens, so observers never see interleaved state from two devices.
//! Reconnection policy lives with the caller (see the supervisor).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use meshlink_shared::state_machine::{ConnectionStateMachine, TransitionResult};
use meshlink_shared::{classify, BleError, ConnectionState, DeviceIdentity, DisconnectReason, Uuid};
use tokio::sync::{broadcast, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::retry::{retry_if, RetryPolicy};
use crate::transport::traits::{ConnectOptions, ConnectionPriority, Peripheral, RemoteCharacteristic};

/// Configuration for a connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Retry policy for endpoint discovery
    pub discovery_retry: RetryPolicy,
    /// Ask the platform to re-establish the link on its own
    pub auto_connect: bool,
    /// Request high-priority link parameters once connected
    pub request_high_priority: bool,
    /// Buffered state events per subscriber
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            discovery_retry: RetryPolicy::default(),
            auto_connect: true,
            request_high_priority: true,
            event_capacity: 64,
        }
    }
}

/// Characteristics resolved from one service, all or nothing
#[derive(Debug, Clone)]
pub struct EndpointSet<C> {
    service: Uuid,
    endpoints: HashMap<Uuid, C>,
}

impl<C> EndpointSet<C> {
    /// UUID of the service the endpoints belong to
    pub fn service(&self) -> Uuid {
        self.service
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&C> {
        self.endpoints.get(uuid)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &C)> {
        self.endpoints.iter()
    }

    pub fn into_inner(self) -> HashMap<Uuid, C> {
        self.endpoints
    }
}

enum Link<P: Peripheral> {
    Idle,
    Connecting(DeviceIdentity<P>),
    Connected {
        device: DeviceIdentity<P>,
        monitor: JoinHandle<()>,
    },
    Disconnecting(DeviceIdentity<P>),
}

/// State shared with the monitoring task
struct Shared {
    fsm: Mutex<ConnectionStateMachine>,
    events: broadcast::Sender<ConnectionState>,
}

impl Shared {
    /// Apply a state and fan it out to observers.
    ///
    /// The lock is held while sending so observers see states in the order
    /// they were applied.
    fn publish(&self, state: ConnectionState) {
        let mut fsm = self.fsm.lock().unwrap_or_else(PoisonError::into_inner);

        match fsm.process(state.clone()) {
            TransitionResult::Changed { from, to } => {
                debug!("[LINK] {} -> {}", from, to);
            }
            TransitionResult::Unchanged(_) => return,
            TransitionResult::Invalid { from, to } => {
                warn!("[LINK] Unexpected transition {} -> {}", from, to);
            }
        }

        // No subscribers is fine
        let _ = self.events.send(state);
    }

    fn state(&self) -> ConnectionState {
        self.fsm
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
            .clone()
    }
}

/// Connection to one remote device at a time
pub struct Connection<P: Peripheral> {
    config: ConnectionConfig,
    link: tokio::sync::Mutex<Link<P>>,
    shared: Arc<Shared>,
    /// Wakes a connect that is still waiting on the platform
    abort_connect: Notify,
}

impl<P: Peripheral> Connection<P> {
    pub fn new(config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            link: tokio::sync::Mutex::new(Link::Idle),
            shared: Arc::new(Shared {
                fsm: Mutex::new(ConnectionStateMachine::new()),
                events,
            }),
            abort_connect: Notify::new(),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Receive every state change from now on, in order
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.events.subscribe()
    }

    /// The device whose link is currently up
    pub async fn current_device(&self) -> Option<DeviceIdentity<P>> {
        let link = self.link.lock().await;
        match &*link {
            Link::Connected { device, .. } if self.state().is_connected() => Some(device.clone()),
            _ => None,
        }
    }

    /// Connect to `device`, replacing whatever link this connection held.
    ///
    /// Concurrent calls are serialized; the last one wins. A [`disconnect`]
    /// issued while the platform is still connecting aborts the attempt.
    ///
    /// [`disconnect`]: Self::disconnect
    pub async fn connect(&self, device: DeviceIdentity<P>) -> Result<(), BleError> {
        let mut link = self.link.lock().await;

        if let Link::Connected {
            device: previous,
            monitor,
        } = std::mem::replace(&mut *link, Link::Connecting(device.clone()))
        {
            info!("[LINK] Releasing {} for {}", previous, device);
            monitor.abort();
            let _ = monitor.await;
        }

        info!("[LINK] Connecting to {}", device);
        self.shared.publish(ConnectionState::Connecting);

        let options = ConnectOptions {
            auto_connect: self.config.auto_connect,
            request_highest_value_length: true,
        };

        let outcome = tokio::select! {
            result = device.handle.connect(options) => Some(result),
            _ = self.abort_connect.notified() => None,
        };

        let Some(result) = outcome else {
            info!("[LINK] Connect to {} aborted", device);
            if let Err(fault) = device.handle.disconnect().await {
                debug!("[LINK] Cancelling pending connect to {}: {}", device, fault);
            }
            *link = Link::Idle;
            self.shared
                .publish(ConnectionState::Disconnected(DisconnectReason::LocalRequest));
            return Err(BleError::Disconnected(DisconnectReason::LocalRequest));
        };

        if let Err(fault) = result {
            let err = classify(fault);
            warn!("[LINK] Failed to connect to {}: {}", device, err);

            let reason = match &err {
                BleError::Disconnected(reason) => reason.clone(),
                _ => DisconnectReason::ConnectFailed,
            };
            *link = Link::Idle;
            self.shared.publish(ConnectionState::Disconnected(reason));
            return Err(err);
        }

        info!("[LINK] Connected to {}", device);
        self.shared.publish(ConnectionState::Connected);

        let monitor = tokio::spawn(monitor_link(
            device.clone(),
            Arc::clone(&self.shared),
            self.config.request_high_priority,
        ));
        *link = Link::Connected { device, monitor };

        Ok(())
    }

    /// Resolve `characteristics` within `service` on the connected device.
    ///
    /// Returns every requested endpoint or an error, never a partial set.
    /// Attempts are retried per the discovery policy. Each attempt targets
    /// whichever device is connected at that moment and fails with
    /// [`BleError::PeripheralNotFound`], without further attempts, when
    /// none is.
    pub async fn discover_characteristics(
        &self,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<EndpointSet<P::Characteristic>, BleError> {
        let result = retry_if(
            &self.config.discovery_retry,
            |err: &BleError| *err != BleError::PeripheralNotFound,
            move |attempt| async move {
                let Some(device) = self.current_device().await else {
                    warn!("[LINK] Discovery requested without a connected device");
                    return Err(BleError::PeripheralNotFound);
                };

                debug!("[LINK] Discovering {} on {} (attempt {})", service, device, attempt);
                let endpoints = discover_once(&device.handle, service, characteristics).await?;
                Ok((device, endpoints))
            },
        )
        .await;

        match result {
            Ok((device, endpoints)) => {
                info!("[LINK] Resolved {} endpoint(s) on {}", endpoints.len(), device);
                Ok(endpoints)
            }
            Err(err @ (BleError::DiscoveryFailed(_) | BleError::PeripheralNotFound)) => Err(err),
            Err(err) => Err(BleError::discovery_failed(err.to_string())),
        }
    }

    /// Tear the link down. Does nothing when already idle.
    pub async fn disconnect(&self) -> Result<(), BleError> {
        self.abort_connect.notify_waiters();
        let mut link = self.link.lock().await;

        let device = match std::mem::replace(&mut *link, Link::Idle) {
            Link::Idle => {
                debug!("[LINK] Already disconnected");
                return Ok(());
            }
            Link::Connected { device, monitor } => {
                monitor.abort();
                let _ = monitor.await;
                device
            }
            Link::Connecting(device) | Link::Disconnecting(device) => device,
        };

        info!("[LINK] Disconnecting from {}", device);
        *link = Link::Disconnecting(device.clone());
        if !self.state().is_disconnected() {
            self.shared.publish(ConnectionState::Disconnecting);
        }

        let result = device.handle.disconnect().await.map_err(classify);
        if let Err(e) = &result {
            warn!("[LINK] Disconnect from {} failed: {}", device, e);
        }

        *link = Link::Idle;
        self.shared
            .publish(ConnectionState::Disconnected(DisconnectReason::LocalRequest));

        result
    }
}

impl<P: Peripheral> Drop for Connection<P> {
    fn drop(&mut self) {
        if let Link::Connected { monitor, .. } = self.link.get_mut() {
            monitor.abort();
        }
    }
}

async fn discover_once<P: Peripheral>(
    peripheral: &P,
    service: Uuid,
    wanted: &[Uuid],
) -> Result<EndpointSet<P::Characteristic>, BleError> {
    let services = peripheral.discover_services(&[service]).await.map_err(classify)?;

    let remote = services
        .into_iter()
        .find(|s| s.uuid == service)
        .ok_or_else(|| BleError::discovery_failed(format!("service {} not found", service)))?;

    let mut endpoints = HashMap::with_capacity(wanted.len());
    let mut missing = Vec::new();
    for uuid in wanted {
        match remote.characteristics.iter().find(|c| c.uuid() == *uuid) {
            Some(characteristic) => {
                endpoints.insert(*uuid, characteristic.clone());
            }
            None => missing.push(uuid.to_string()),
        }
    }

    if !missing.is_empty() {
        return Err(BleError::discovery_failed(format!(
            "missing characteristic(s) {}",
            missing.join(", ")
        )));
    }

    Ok(EndpointSet { service, endpoints })
}

/// Mirror the platform's view of the link until the stream ends or the task
/// is aborted. A stream that ends on a live link counts as a loss.
async fn monitor_link<P: Peripheral>(
    device: DeviceIdentity<P>,
    shared: Arc<Shared>,
    request_high_priority: bool,
) {
    let mut states = match device.handle.state_events().await {
        Ok(states) => states,
        Err(fault) => {
            warn!("[LINK] Cannot observe {}: {}", device, classify(fault));
            shared.publish(ConnectionState::Disconnected(DisconnectReason::Unknown));
            return;
        }
    };

    let mut diagnostics = JoinSet::new();
    let mut diagnostics_running = false;

    while let Some(state) = states.next().await {
        let connected = state.is_connected();
        let disconnected = state.is_disconnected();
        shared.publish(state);

        if connected && !diagnostics_running {
            spawn_diagnostics(&mut diagnostics, &device, request_high_priority);
            diagnostics_running = true;
        } else if disconnected && diagnostics_running {
            diagnostics.shutdown().await;
            diagnostics_running = false;
        }
    }

    if !shared.state().is_disconnected() {
        warn!("[LINK] State stream for {} ended while the link was up", device);
        shared.publish(ConnectionState::Disconnected(DisconnectReason::Unknown));
    } else {
        debug!("[LINK] State stream for {} ended", device);
    }
}

/// Link tuning and diagnostic logging; failures here never touch the link state
fn spawn_diagnostics<P: Peripheral>(
    tasks: &mut JoinSet<()>,
    device: &DeviceIdentity<P>,
    request_high_priority: bool,
) {
    if request_high_priority {
        let handle = device.handle.clone();
        tasks.spawn(async move {
            if let Err(fault) = handle.request_connection_priority(ConnectionPriority::High).await {
                debug!("[LINK] Priority request not honoured: {}", fault);
            }
        });
    }

    let handle = device.handle.clone();
    let name = device.to_string();
    tasks.spawn(async move {
        match handle.radio_events().await {
            Ok(mut events) => {
                while let Some(event) = events.next().await {
                    debug!("[LINK] {} radio: {:?}", name, event);
                }
            }
            Err(fault) => debug!("[LINK] Radio diagnostics unavailable for {}: {}", name, fault),
        }
    });

    let handle = device.handle.clone();
    let name = device.to_string();
    tasks.spawn(async move {
        match handle.connection_parameter_events().await {
            Ok(mut events) => {
                while let Some(params) = events.next().await {
                    debug!(
                        "[LINK] {} parameters: interval {:.2} ms, latency {}, timeout {} ms",
                        name, params.interval_ms, params.peripheral_latency, params.supervision_timeout_ms
                    );
                }
            }
            Err(fault) => debug!("[LINK] Parameter diagnostics unavailable for {}: {}", name, fault),
        }
    });
}
