//! In-process notification fan-out
//!
//! One broadcast channel per notification kind. Delivery is fire-and-forget:
//! a send with no live receivers is not an error, and lagging receivers drop
//! the oldest entries. Nothing here crosses a process boundary.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Device connection-state transition
#[derive(Debug, Clone)]
pub struct DeviceStateChanged {
    pub device_id: u32,
    pub connected: bool,
    pub error: Option<String>,
}

/// Which broker property changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerProperty {
    Connection,
}

/// Broker state transition, tagged with the changed property
#[derive(Debug, Clone)]
pub struct ServerChanged {
    pub server_id: u32,
    pub property: ServerProperty,
    pub connected: bool,
}

/// A variable picked up a new converted value
#[derive(Debug, Clone)]
pub struct ValueChanged {
    pub variable_id: u32,
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

/// Which alarm bound was breached
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlarmBound {
    Min(f64),
    Max(f64),
}

/// A variable breached its configured alarm bounds
#[derive(Debug, Clone)]
pub struct AlarmRaised {
    pub variable_id: u32,
    pub value: f64,
    pub bound: AlarmBound,
}

/// Publish/subscribe hub for core notifications
///
/// The "registry reloaded" channel doubles as the reload trigger for the poll
/// scheduler and the broker manager.
#[derive(Debug)]
pub struct NotificationHub {
    device_state: broadcast::Sender<DeviceStateChanged>,
    server_changed: broadcast::Sender<ServerChanged>,
    value_changed: broadcast::Sender<ValueChanged>,
    alarm_raised: broadcast::Sender<AlarmRaised>,
    reloaded: broadcast::Sender<()>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        Self {
            device_state: broadcast::channel(CHANNEL_CAPACITY).0,
            server_changed: broadcast::channel(CHANNEL_CAPACITY).0,
            value_changed: broadcast::channel(CHANNEL_CAPACITY).0,
            alarm_raised: broadcast::channel(CHANNEL_CAPACITY).0,
            reloaded: broadcast::channel(8).0,
        }
    }

    pub fn device_state_changed(&self, event: DeviceStateChanged) {
        let _ = self.device_state.send(event);
    }

    pub fn server_changed(&self, event: ServerChanged) {
        let _ = self.server_changed.send(event);
    }

    pub fn value_changed(&self, event: ValueChanged) {
        let _ = self.value_changed.send(event);
    }

    pub fn alarm_raised(&self, event: AlarmRaised) {
        let _ = self.alarm_raised.send(event);
    }

    /// Signal that a registry bulk load completed
    pub fn registry_reloaded(&self) {
        let _ = self.reloaded.send(());
    }

    pub fn subscribe_device_state(&self) -> broadcast::Receiver<DeviceStateChanged> {
        self.device_state.subscribe()
    }

    pub fn subscribe_server_changed(&self) -> broadcast::Receiver<ServerChanged> {
        self.server_changed.subscribe()
    }

    pub fn subscribe_value_changed(&self) -> broadcast::Receiver<ValueChanged> {
        self.value_changed.subscribe()
    }

    pub fn subscribe_alarm_raised(&self) -> broadcast::Receiver<AlarmRaised> {
        self.alarm_raised.subscribe()
    }

    pub fn subscribe_reloaded(&self) -> broadcast::Receiver<()> {
        self.reloaded.subscribe()
    }
}
