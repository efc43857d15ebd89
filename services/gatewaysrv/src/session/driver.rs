//! Field-protocol client abstraction
//!
//! One session per device. A request is an address string plus the runtime
//! type used to decode the payload; a response is a typed value or an error.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::{GatewaySrvError, Result};
use crate::model::{DataType, Device, FieldValue, ProtocolKind};
use crate::session::{modbus::ModbusTcpClient, opcua::OpcUaClient, s7::S7Client};

/// One address to read in a batch round-trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub address: String,
    pub data_type: DataType,
}

impl ReadRequest {
    pub fn new(address: impl Into<String>, data_type: DataType) -> Self {
        Self {
            address: address.into(),
            data_type,
        }
    }
}

/// Protocol session owned by one device context
///
/// `read_batch` performs a single round-trip for the given addresses and
/// returns whatever subset produced values; a session-level failure is
/// propagated to the caller without retry. Addresses that fail individually
/// (bad address, type mismatch) are logged and omitted from the result map.
#[async_trait]
pub trait FieldClient: Send + Sync {
    async fn connect(&mut self) -> Result<()>;

    /// Idempotent; disconnecting a closed session is a no-op
    async fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn read_batch(
        &mut self,
        requests: &[ReadRequest],
    ) -> Result<HashMap<String, FieldValue>>;
}

/// Build the protocol client matching a device's configuration
pub fn create_client(device: &Device) -> Result<Box<dyn FieldClient>> {
    match device.protocol {
        ProtocolKind::S7 => Ok(Box::new(S7Client::new(
            device.address.clone(),
            device.port,
            device.rack,
            device.slot,
        ))),
        ProtocolKind::OpcUa => {
            let url = device.endpoint_url.clone().ok_or_else(|| {
                GatewaySrvError::config(format!(
                    "OPC UA device {} has no endpoint URL",
                    device.id
                ))
            })?;
            Ok(Box::new(OpcUaClient::new(url)))
        }
        ProtocolKind::Modbus => Ok(Box::new(ModbusTcpClient::new(
            device.address.clone(),
            device.port,
            device.rack as u8,
        ))),
    }
}
