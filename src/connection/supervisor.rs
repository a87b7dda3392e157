//! Keeps one radio link alive with exponential backoff
//!
//! The supervisor is the caller-side reconnect policy for a [`Connection`]:
//! it connects, resolves the mesh-radio endpoints, then waits for the link
//! to drop. Reconnect-worthy failures are retried with a doubling delay;
//! terminal ones end supervision. A local disconnect always wins.

use std::sync::Arc;
use std::time::Duration;

use meshlink_shared::profile::{self, SERVICE_UUID};
use meshlink_shared::{BleError, ConnectionState, DeviceIdentity, DisconnectReason, Uuid};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::link::{Connection, EndpointSet};
use crate::transport::traits::Peripheral;

/// Configuration for link supervision
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Delay before the first reconnect
    pub reconnect_delay: Duration,
    /// Upper bound for the doubling delay
    pub max_reconnect_delay: Duration,
    /// Give up after this many reconnect attempts in a row (unbounded if
    /// `None`); the initial connect is not counted
    pub max_attempts: Option<u32>,
    /// Service holding the endpoints
    pub service: Uuid,
    /// Endpoints that must resolve for the link to count as ready
    pub characteristics: Vec<Uuid>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_attempts: None,
            service: SERVICE_UUID,
            characteristics: profile::CHARACTERISTICS.to_vec(),
        }
    }
}

/// Events emitted by the supervisor
#[derive(Debug, Clone)]
pub enum SupervisorEvent<C> {
    /// Link is up and every endpoint resolved
    Ready { endpoints: EndpointSet<C> },
    /// An established link went down
    LinkLost { error: BleError },
    /// Waiting before the next attempt
    Reconnecting { attempt: u32, delay: Duration },
    /// Supervision stopped on a terminal failure
    GaveUp { error: BleError },
}

/// Handle to a running supervision task
pub struct LinkSupervisor<P: Peripheral> {
    connection: Arc<Connection<P>>,
    event_rx: mpsc::Receiver<SupervisorEvent<P::Characteristic>>,
    task: Option<JoinHandle<()>>,
}

impl<P: Peripheral> LinkSupervisor<P> {
    /// Start supervising the link from `connection` to `device`
    pub fn spawn(
        connection: Arc<Connection<P>>,
        device: DeviceIdentity<P>,
        config: SupervisorConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(32);

        let task = tokio::spawn(supervise(
            Arc::clone(&connection),
            device,
            config,
            event_tx,
        ));

        Self {
            connection,
            event_rx,
            task: Some(task),
        }
    }

    /// Receive the next supervision event; `None` once supervision has ended
    pub async fn recv(&mut self) -> Option<SupervisorEvent<P::Characteristic>> {
        self.event_rx.recv().await
    }

    pub fn connection(&self) -> &Arc<Connection<P>> {
        &self.connection
    }

    /// Stop supervising and tear the link down
    pub async fn shutdown(&mut self) -> Result<(), BleError> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.connection.disconnect().await
    }
}

impl<P: Peripheral> Drop for LinkSupervisor<P> {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Supervision loop with reconnection logic
async fn supervise<P: Peripheral>(
    connection: Arc<Connection<P>>,
    device: DeviceIdentity<P>,
    config: SupervisorConfig,
    event_tx: mpsc::Sender<SupervisorEvent<P::Characteristic>>,
) {
    let mut reconnect_delay = config.reconnect_delay;
    let mut attempt: u32 = 0;

    loop {
        // Subscribe first so a drop right after discovery is not missed
        let mut states = connection.subscribe();

        let error = match establish(&connection, &device, &config).await {
            Ok(endpoints) => {
                info!("[LINK] {} ready with {} endpoint(s)", device, endpoints.len());
                attempt = 0;
                reconnect_delay = config.reconnect_delay;
                let _ = event_tx.send(SupervisorEvent::Ready { endpoints }).await;

                match wait_for_loss(&mut states).await {
                    Some(error) => {
                        warn!("[LINK] Lost {}: {}", device, error);
                        let _ = event_tx
                            .send(SupervisorEvent::LinkLost {
                                error: error.clone(),
                            })
                            .await;
                        error
                    }
                    None => {
                        info!("[LINK] {} disconnected locally, supervision finished", device);
                        return;
                    }
                }
            }
            Err(BleError::Disconnected(DisconnectReason::LocalRequest)) => {
                info!("[LINK] Connect to {} aborted locally, supervision finished", device);
                return;
            }
            Err(error) => error,
        };

        attempt += 1;
        let exhausted = config.max_attempts.is_some_and(|max| attempt > max);
        if !error.should_reconnect() || exhausted {
            warn!("[LINK] Giving up on {} after {} attempt(s): {}", device, attempt, error);
            let _ = event_tx.send(SupervisorEvent::GaveUp { error }).await;
            return;
        }

        info!(
            "[LINK] Reconnecting to {} in {:?} (attempt {})",
            device, reconnect_delay, attempt
        );
        let _ = event_tx
            .send(SupervisorEvent::Reconnecting {
                attempt,
                delay: reconnect_delay,
            })
            .await;

        tokio::time::sleep(reconnect_delay).await;

        // Exponential backoff
        reconnect_delay = std::cmp::min(reconnect_delay * 2, config.max_reconnect_delay);
    }
}

async fn establish<P: Peripheral>(
    connection: &Connection<P>,
    device: &DeviceIdentity<P>,
    config: &SupervisorConfig,
) -> Result<EndpointSet<P::Characteristic>, BleError> {
    connection.connect(device.clone()).await?;
    connection
        .discover_characteristics(config.service, &config.characteristics)
        .await
}

/// Wait for the link to go down; `None` means it was taken down locally
async fn wait_for_loss(states: &mut broadcast::Receiver<ConnectionState>) -> Option<BleError> {
    loop {
        match states.recv().await {
            Ok(ConnectionState::Disconnected(DisconnectReason::LocalRequest)) => return None,
            Ok(ConnectionState::Disconnected(reason)) => return Some(BleError::Disconnected(reason)),
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                debug!("[LINK] Supervisor skipped {} state event(s)", skipped);
            }
            Err(RecvError::Closed) => {
                return Some(BleError::ManagerClosed("connection state stream closed".into()));
            }
        }
    }
}
