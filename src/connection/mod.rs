//! Connection management for the radio link
//!
//! This module handles:
//! - The per-device link lifecycle and endpoint discovery
//! - Reconnection with exponential backoff

mod link;
mod supervisor;

pub use link::{Connection, ConnectionConfig, EndpointSet};
pub use supervisor::{LinkSupervisor, SupervisorConfig, SupervisorEvent};
