//! Protocol session management
//!
//! One connection context per device: the protocol client, the tracked
//! variable set, a connected flag and a reconnect counter. Connect fan-out is
//! bounded by a counting semaphore so a registry reload with many devices
//! cannot saturate the host network stack. Per-device reads are serialized by
//! the context's client mutex; the protocol stacks are single-session.

pub mod driver;
pub mod modbus;
pub mod opcua;
pub mod s7;

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{GatewaySrvError, Result};
use crate::events::{DeviceStateChanged, NotificationHub};
use crate::model::{DataType, Device, FieldValue};
use crate::registry::Registry;
use self::driver::{create_client, FieldClient, ReadRequest};

/// Static polling facts for one tracked variable; live value state stays in
/// the registry.
#[derive(Debug, Clone)]
pub struct PollVariable {
    pub variable_id: u32,
    pub address: String,
    pub data_type: DataType,
    pub interval: Duration,
}

/// Connection context owned by the session manager, one per device id
pub struct DeviceContext {
    pub device_id: u32,
    client: Mutex<Box<dyn FieldClient>>,
    variables: Mutex<Vec<PollVariable>>,
    connected: AtomicBool,
    reconnect_attempts: AtomicU32,
}

impl DeviceContext {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub async fn tracked_variables(&self) -> Vec<PollVariable> {
        self.variables.lock().await.clone()
    }
}

/// Session manager for all field devices
pub struct DeviceManager {
    contexts: DashMap<u32, Arc<DeviceContext>>,
    connect_permits: Arc<Semaphore>,
    connect_timeout: Duration,
    registry: Arc<Registry>,
    hub: Arc<NotificationHub>,
}

impl DeviceManager {
    pub fn new(
        registry: Arc<Registry>,
        hub: Arc<NotificationHub>,
        connect_limit: usize,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            contexts: DashMap::new(),
            connect_permits: Arc::new(Semaphore::new(connect_limit)),
            connect_timeout,
            registry,
            hub,
        }
    }

    /// Register a context for a device, idle and disconnected. Re-adding a
    /// device replaces its context.
    pub fn add_device(&self, device: &Device) -> Result<()> {
        let client = create_client(device)?;
        self.add_device_with_client(device.id, client);
        Ok(())
    }

    /// Register a context with an externally-built client (embedders, tests)
    pub fn add_device_with_client(&self, device_id: u32, client: Box<dyn FieldClient>) {
        let context = Arc::new(DeviceContext {
            device_id,
            client: Mutex::new(client),
            variables: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
        });
        if self.contexts.insert(device_id, context).is_some() {
            debug!(device_id, "Replaced existing device context");
        }
    }

    pub fn remove_device(&self, device_id: u32) {
        self.contexts.remove(&device_id);
    }

    pub fn context(&self, device_id: u32) -> Option<Arc<DeviceContext>> {
        self.contexts.get(&device_id).map(|c| Arc::clone(&c))
    }

    pub fn contexts(&self) -> Vec<Arc<DeviceContext>> {
        self.contexts.iter().map(|c| Arc::clone(&c)).collect()
    }

    /// Atomically replace the tracked variable set of a device context
    pub async fn update_variables(&self, device_id: u32, variables: Vec<PollVariable>) -> Result<()> {
        let context = self.context(device_id).ok_or_else(|| {
            GatewaySrvError::device(format!("no context for device {device_id}"))
        })?;
        *context.variables.lock().await = variables;
        Ok(())
    }

    /// Open the field-protocol session for a device.
    ///
    /// Runs under the shared connect semaphore with a fixed per-attempt
    /// timeout that is independent of the overall cancellation signal.
    /// Success resets the reconnect counter, failure increments it; both
    /// outcomes are reported as a device-state-changed notification.
    pub async fn connect(&self, device_id: u32) -> Result<()> {
        let context = self.context(device_id).ok_or_else(|| {
            GatewaySrvError::device(format!("no context for device {device_id}"))
        })?;

        let _permit = self
            .connect_permits
            .acquire()
            .await
            .map_err(|_| GatewaySrvError::internal("connect semaphore closed"))?;

        let mut client = context.client.lock().await;
        let outcome = match timeout(self.connect_timeout, client.connect()).await {
            Ok(result) => result,
            Err(_) => Err(GatewaySrvError::timeout(format!(
                "connect to device {device_id} exceeded {:?}",
                self.connect_timeout
            ))),
        };
        drop(client);

        match outcome {
            Ok(()) => {
                context.connected.store(true, Ordering::Release);
                context.reconnect_attempts.store(0, Ordering::Relaxed);
                self.registry.set_device_connection(device_id, true, None);
                self.hub.device_state_changed(DeviceStateChanged {
                    device_id,
                    connected: true,
                    error: None,
                });
                info!(device_id, "Device connected");
                Ok(())
            }
            Err(e) => {
                let attempts = context.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
                context.connected.store(false, Ordering::Release);
                self.registry
                    .set_device_connection(device_id, false, Some(e.to_string()));
                self.hub.device_state_changed(DeviceStateChanged {
                    device_id,
                    connected: false,
                    error: Some(e.to_string()),
                });
                warn!(device_id, attempts, "Device connect failed: {e}");
                Err(e)
            }
        }
    }

    /// Close a device session. Disconnecting an unknown or already
    /// disconnected device is a no-op.
    pub async fn disconnect(&self, device_id: u32) {
        let Some(context) = self.context(device_id) else {
            return;
        };
        let was_connected = context.connected.swap(false, Ordering::AcqRel);
        let mut client = context.client.lock().await;
        if let Err(e) = client.disconnect().await {
            warn!(device_id, "Disconnect error: {e}");
        }
        drop(client);
        if was_connected {
            self.registry.set_device_connection(device_id, false, None);
            self.hub.device_state_changed(DeviceStateChanged {
                device_id,
                connected: false,
                error: None,
            });
        }
    }

    pub async fn disconnect_all(&self) {
        let ids: Vec<u32> = self.contexts.iter().map(|c| c.device_id).collect();
        for id in ids {
            self.disconnect(id).await;
        }
    }

    /// One round-trip read of a set of addresses. Session failures propagate
    /// to the caller without retry; retry policy belongs to the scheduler.
    pub async fn read_batch(
        &self,
        device_id: u32,
        requests: &[ReadRequest],
    ) -> Result<HashMap<String, FieldValue>> {
        let context = self.context(device_id).ok_or_else(|| {
            GatewaySrvError::device(format!("no context for device {device_id}"))
        })?;
        if !context.is_connected() {
            return Err(GatewaySrvError::connection(format!(
                "device {device_id} is not connected"
            )));
        }
        let mut client = context.client.lock().await;
        let result = client.read_batch(requests).await;
        drop(client);
        if let Err(e) = &result {
            // A failed round-trip means the session state is suspect; flag it
            // so the next reload or manual reconnect re-establishes it.
            if context.connected.swap(false, Ordering::AcqRel) {
                self.registry
                    .set_device_connection(device_id, false, Some(e.to_string()));
                self.hub.device_state_changed(DeviceStateChanged {
                    device_id,
                    connected: false,
                    error: Some(e.to_string()),
                });
            }
        }
        result
    }
}
