//! Shared test support: a scripted field client and entity builders

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gatewaysrv::error::{GatewaySrvError, Result};
use gatewaysrv::model::{DataType, Device, FieldValue, ProtocolKind, Variable, VariableTable};
use gatewaysrv::session::driver::{FieldClient, ReadRequest};

/// Field client that serves values from an in-memory map and records
/// per-address read counts plus connect concurrency.
#[derive(Default)]
pub struct MockProbe {
    pub values: DashMap<String, FieldValue>,
    pub read_counts: DashMap<String, usize>,
    pub connects: AtomicUsize,
    pub inflight_connects: AtomicUsize,
    pub max_inflight_connects: AtomicUsize,
    pub fail_reads: AtomicBool,
    pub fail_connects: AtomicBool,
}

impl MockProbe {
    pub fn with_values(values: &[(&str, FieldValue)]) -> Arc<Self> {
        let probe = Self::default();
        for (address, value) in values {
            probe.values.insert((*address).to_string(), value.clone());
        }
        Arc::new(probe)
    }

    pub fn read_count(&self, address: &str) -> usize {
        self.read_counts.get(address).map(|c| *c).unwrap_or(0)
    }

    pub fn set_value(&self, address: &str, value: FieldValue) {
        self.values.insert(address.to_string(), value);
    }
}

pub struct MockClient {
    pub probe: Arc<MockProbe>,
    pub connect_delay: Duration,
    connected: bool,
}

impl MockClient {
    pub fn new(probe: Arc<MockProbe>) -> Self {
        Self {
            probe,
            connect_delay: Duration::ZERO,
            connected: false,
        }
    }

    pub fn with_connect_delay(probe: Arc<MockProbe>, delay: Duration) -> Self {
        Self {
            probe,
            connect_delay: delay,
            connected: false,
        }
    }
}

#[async_trait]
impl FieldClient for MockClient {
    async fn connect(&mut self) -> Result<()> {
        let inflight = self.probe.inflight_connects.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe
            .max_inflight_connects
            .fetch_max(inflight, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        self.probe.inflight_connects.fetch_sub(1, Ordering::SeqCst);
        self.probe.connects.fetch_add(1, Ordering::SeqCst);
        if self.probe.fail_connects.load(Ordering::SeqCst) {
            return Err(GatewaySrvError::connection("mock connect refused"));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn read_batch(
        &mut self,
        requests: &[ReadRequest],
    ) -> Result<HashMap<String, FieldValue>> {
        if self.probe.fail_reads.load(Ordering::SeqCst) {
            return Err(GatewaySrvError::io("mock read failure"));
        }
        let mut result = HashMap::new();
        for request in requests {
            *self
                .probe
                .read_counts
                .entry(request.address.clone())
                .or_insert(0) += 1;
            if let Some(value) = self.probe.values.get(&request.address) {
                result.insert(request.address.clone(), value.clone());
            }
        }
        Ok(result)
    }
}

pub fn device(id: u32) -> Device {
    Device {
        id,
        name: format!("plc-{id}"),
        protocol: ProtocolKind::S7,
        address: "127.0.0.1".into(),
        port: 102,
        rack: 0,
        slot: 1,
        endpoint_url: None,
        active: true,
        connected: false,
        last_error: None,
    }
}

pub fn table(id: u32, device_id: u32) -> VariableTable {
    VariableTable {
        id,
        device_id,
        name: format!("table-{id}"),
        active: true,
    }
}

pub fn variable(id: u32, table_id: u32, address: &str, interval_ms: u64) -> Variable {
    Variable {
        id,
        table_id,
        name: format!("var-{id}"),
        address: address.into(),
        data_type: DataType::Int16,
        polling_interval_ms: interval_ms,
        active: true,
        last_raw: None,
        last_value: None,
        last_numeric: None,
        last_update: None,
        history_enabled: false,
        history_deadband: None,
        alarm_enabled: false,
        alarm_min: None,
        alarm_max: None,
        alarm_deadband: None,
    }
}
