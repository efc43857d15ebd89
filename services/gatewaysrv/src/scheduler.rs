//! Interval-driven poll scheduler
//!
//! A single cooperative background loop woken by the registry-reloaded
//! signal. On wake it rebuilds the per-device variable sets, connects every
//! active device, and then runs poll cycles until the next reload or
//! cancellation: compute the due subset per device, batch-read it, and emit
//! one pipeline update per address that produced a value. A fixed quantum
//! sleep between cycles bounds the read rate, and a failure on one device
//! never aborts the cycle for the others.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::{UpdateContext, UpdatePipeline};
use crate::registry::Registry;
use crate::session::driver::ReadRequest;
use crate::session::{DeviceManager, PollVariable};

pub struct PollScheduler {
    registry: Arc<Registry>,
    devices: Arc<DeviceManager>,
    pipeline: Arc<UpdatePipeline>,
    quantum: Duration,
    token: CancellationToken,
    reload_rx: broadcast::Receiver<()>,
}

impl PollScheduler {
    pub fn new(
        registry: Arc<Registry>,
        devices: Arc<DeviceManager>,
        pipeline: Arc<UpdatePipeline>,
        quantum: Duration,
        token: CancellationToken,
        reload_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            registry,
            devices,
            pipeline,
            quantum,
            token,
            reload_rx,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("Poll scheduler started");
        let mut reload_pending = false;

        'outer: loop {
            if !reload_pending {
                tokio::select! {
                    _ = self.token.cancelled() => break 'outer,
                    signal = self.reload_rx.recv() => match signal {
                        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break 'outer,
                    },
                }
            }
            reload_pending = false;

            if self.registry.is_empty() {
                debug!("Registry is empty, waiting for next reload");
                continue;
            }

            self.rebuild_device_sets().await;
            self.connect_active_devices().await;

            loop {
                self.poll_once().await;
                tokio::select! {
                    _ = self.token.cancelled() => break 'outer,
                    _ = tokio::time::sleep(self.quantum) => {}
                    signal = self.reload_rx.recv() => match signal {
                        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            info!("Reload signal received, rebuilding poll sets");
                            reload_pending = true;
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break 'outer,
                    },
                }
            }
        }

        self.devices.disconnect_all().await;
        info!("Poll scheduler stopped");
    }

    /// Sync the session manager's contexts and tracked variable sets with
    /// the registry.
    async fn rebuild_device_sets(&self) {
        let active = self.registry.active_devices();

        // Drop contexts for devices that are gone or deactivated
        for context in self.devices.contexts() {
            if !active.iter().any(|d| d.id == context.device_id) {
                self.devices.disconnect(context.device_id).await;
                self.devices.remove_device(context.device_id);
            }
        }

        for device in &active {
            if self.devices.context(device.id).is_none() {
                if let Err(e) = self.devices.add_device(device) {
                    warn!(device_id = device.id, "Cannot create device context: {e}");
                    continue;
                }
            }
            let variables: Vec<PollVariable> = self
                .registry
                .pollable_variables(device.id)
                .into_iter()
                .map(|v| PollVariable {
                    variable_id: v.id,
                    address: v.address,
                    data_type: v.data_type,
                    interval: Duration::from_millis(v.polling_interval_ms),
                })
                .collect();
            debug!(
                device_id = device.id,
                variables = variables.len(),
                "Rebuilt poll set"
            );
            if let Err(e) = self.devices.update_variables(device.id, variables).await {
                warn!(device_id = device.id, "Cannot update poll set: {e}");
            }
        }
    }

    /// Connect every active device that is not already connected. Attempts
    /// run concurrently but are bounded by the session manager's semaphore.
    async fn connect_active_devices(&self) {
        let pending: Vec<u32> = self
            .devices
            .contexts()
            .into_iter()
            .filter(|c| !c.is_connected())
            .map(|c| c.device_id)
            .collect();
        let attempts = pending.into_iter().map(|device_id| {
            let devices = Arc::clone(&self.devices);
            async move {
                // Failures are already logged and notified by the manager
                let _ = devices.connect(device_id).await;
            }
        });
        futures::future::join_all(attempts).await;
    }

    /// One poll cycle over all device contexts
    async fn poll_once(&self) {
        let now = Utc::now();
        for context in self.devices.contexts() {
            if self.token.is_cancelled() {
                return;
            }
            if !context.is_connected() {
                continue;
            }
            // Membership comes from the tracked set, but address, interval
            // and active flag are resolved against the registry so
            // incremental management-layer edits apply without a reload.
            let due: Vec<_> = context
                .tracked_variables()
                .await
                .into_iter()
                .filter_map(|pv| self.registry.variable(pv.variable_id))
                .filter(|v| v.active && v.is_due(now))
                .collect();
            if due.is_empty() {
                continue;
            }

            let requests: Vec<ReadRequest> = due
                .iter()
                .map(|v| ReadRequest::new(v.address.clone(), v.data_type))
                .collect();

            match self.devices.read_batch(context.device_id, &requests).await {
                Ok(values) => {
                    let polled_at = Utc::now();
                    for polled in &due {
                        let Some(value) = values.get(&polled.address) else {
                            continue;
                        };
                        self.registry.mark_polled(polled.id, polled_at);
                        let Some(variable) = self.registry.variable(polled.id) else {
                            continue;
                        };
                        let update = UpdateContext::new(variable, value.clone(), polled_at);
                        self.pipeline.process(update).await;
                    }
                }
                Err(e) => {
                    // Isolate the failure to this device and keep the cycle
                    // going for the others
                    warn!(
                        device_id = context.device_id,
                        "Batch read failed: {e}"
                    );
                }
            }
        }
    }
}
