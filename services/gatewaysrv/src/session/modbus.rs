//! Modbus TCP field-protocol client
//!
//! Address syntax: `HR<n>` (holding register), `IR<n>` (input register),
//! `CO<n>` (coil), `DI<n>` (discrete input). Multi-register values are read
//! high word first. The device's rack field doubles as the Modbus unit id.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio_modbus::client::{tcp, Context, Reader};
use tokio_modbus::slave::Slave;
use tracing::{debug, warn};

use crate::error::{GatewaySrvError, Result};
use crate::model::{DataType, FieldValue};
use crate::session::driver::{FieldClient, ReadRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegisterKind {
    Holding,
    Input,
    Coil,
    Discrete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ModbusAddress {
    kind: RegisterKind,
    offset: u16,
}

impl ModbusAddress {
    fn parse(input: &str) -> Result<Self> {
        let s = input.trim().to_ascii_uppercase();
        let (kind, rest) = if let Some(rest) = s.strip_prefix("HR") {
            (RegisterKind::Holding, rest)
        } else if let Some(rest) = s.strip_prefix("IR") {
            (RegisterKind::Input, rest)
        } else if let Some(rest) = s.strip_prefix("CO") {
            (RegisterKind::Coil, rest)
        } else if let Some(rest) = s.strip_prefix("DI") {
            (RegisterKind::Discrete, rest)
        } else {
            return Err(GatewaySrvError::variable(format!(
                "invalid Modbus address '{input}'"
            )));
        };
        let offset = rest.parse().map_err(|_| {
            GatewaySrvError::variable(format!("invalid Modbus address '{input}'"))
        })?;
        Ok(Self { kind, offset })
    }
}

fn register_count(data_type: DataType) -> u16 {
    match data_type {
        DataType::Int32 | DataType::UInt32 | DataType::Float32 => 2,
        DataType::Float64 => 4,
        _ => 1,
    }
}

fn decode_registers(registers: &[u16], data_type: DataType) -> Result<FieldValue> {
    let words_to_u64 = |regs: &[u16]| {
        regs.iter()
            .fold(0u64, |acc, &word| (acc << 16) | word as u64)
    };
    let value = match data_type {
        DataType::Bool => FieldValue::Bool(registers[0] != 0),
        DataType::Byte => FieldValue::UInt((registers[0] & 0xFF) as u64),
        DataType::Int16 => FieldValue::Int(registers[0] as i16 as i64),
        DataType::UInt16 => FieldValue::UInt(registers[0] as u64),
        DataType::Int32 => {
            require(registers, 2, data_type)?;
            FieldValue::Int(words_to_u64(&registers[..2]) as u32 as i32 as i64)
        }
        DataType::UInt32 => {
            require(registers, 2, data_type)?;
            FieldValue::UInt(words_to_u64(&registers[..2]))
        }
        DataType::Float32 => {
            require(registers, 2, data_type)?;
            FieldValue::Float(f32::from_bits(words_to_u64(&registers[..2]) as u32) as f64)
        }
        DataType::Float64 => {
            require(registers, 4, data_type)?;
            FieldValue::Float(f64::from_bits(words_to_u64(&registers[..4])))
        }
        DataType::Text => {
            return Err(GatewaySrvError::data(
                "text variables are not supported on Modbus",
            ))
        }
    };
    Ok(value)
}

fn require(registers: &[u16], need: usize, data_type: DataType) -> Result<()> {
    if registers.len() < need {
        return Err(GatewaySrvError::data(format!(
            "need {need} registers for {}, got {}",
            data_type.as_str(),
            registers.len()
        )));
    }
    Ok(())
}

pub struct ModbusTcpClient {
    host: String,
    port: u16,
    unit_id: u8,
    context: Mutex<Option<Context>>,
}

impl ModbusTcpClient {
    pub fn new(host: String, port: u16, unit_id: u8) -> Self {
        Self {
            host,
            port,
            unit_id,
            context: Mutex::new(None),
        }
    }
}

#[async_trait]
impl FieldClient for ModbusTcpClient {
    async fn connect(&mut self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| GatewaySrvError::config(format!("invalid Modbus address: {e}")))?;
        let context = tcp::connect_slave(addr, Slave(self.unit_id))
            .await
            .map_err(|e| GatewaySrvError::connection(e.to_string()))?;
        debug!(host = %self.host, unit = self.unit_id, "Modbus session established");
        *self.context.get_mut().expect("modbus context mutex poisoned") = Some(context);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        *self.context.get_mut().expect("modbus context mutex poisoned") = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.context
            .lock()
            .expect("modbus context mutex poisoned")
            .is_some()
    }

    async fn read_batch(
        &mut self,
        requests: &[ReadRequest],
    ) -> Result<HashMap<String, FieldValue>> {
        let context = self
            .context
            .get_mut()
            .expect("modbus context mutex poisoned")
            .as_mut()
            .ok_or_else(|| GatewaySrvError::connection("Modbus session not connected"))?;

        let mut values = HashMap::with_capacity(requests.len());
        for request in requests {
            let addr = match ModbusAddress::parse(&request.address) {
                Ok(addr) => addr,
                Err(e) => {
                    warn!(address = %request.address, "Skipping unreadable Modbus address: {e}");
                    continue;
                }
            };

            // Transport errors fail the whole batch; a per-item exception
            // (illegal address, bad register) only skips that item.
            let value = match addr.kind {
                RegisterKind::Holding | RegisterKind::Input => {
                    let count = register_count(request.data_type);
                    let response = match addr.kind {
                        RegisterKind::Holding => {
                            context.read_holding_registers(addr.offset, count).await
                        }
                        _ => context.read_input_registers(addr.offset, count).await,
                    }
                    .map_err(|e| GatewaySrvError::io(e.to_string()))?;
                    match response {
                        Ok(registers) => decode_registers(&registers, request.data_type),
                        Err(exception) => Err(GatewaySrvError::protocol(format!(
                            "Modbus exception: {exception}"
                        ))),
                    }
                }
                RegisterKind::Coil | RegisterKind::Discrete => {
                    let response = match addr.kind {
                        RegisterKind::Coil => context.read_coils(addr.offset, 1).await,
                        _ => context.read_discrete_inputs(addr.offset, 1).await,
                    }
                    .map_err(|e| GatewaySrvError::io(e.to_string()))?;
                    match response {
                        Ok(bits) => Ok(FieldValue::Bool(bits.first().copied().unwrap_or(false))),
                        Err(exception) => Err(GatewaySrvError::protocol(format!(
                            "Modbus exception: {exception}"
                        ))),
                    }
                }
            };

            match value {
                Ok(v) => {
                    values.insert(request.address.clone(), v);
                }
                Err(e) => warn!(address = %request.address, "Skipping Modbus item: {e}"),
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_register_addresses() {
        assert_eq!(
            ModbusAddress::parse("HR100").unwrap(),
            ModbusAddress {
                kind: RegisterKind::Holding,
                offset: 100
            }
        );
        assert_eq!(
            ModbusAddress::parse("di3").unwrap().kind,
            RegisterKind::Discrete
        );
        assert!(ModbusAddress::parse("XX1").is_err());
        assert!(ModbusAddress::parse("HR").is_err());
    }

    #[test]
    fn decodes_multi_register_values() {
        // 0x41BC0000 == 23.5f32, high word first
        assert_eq!(
            decode_registers(&[0x41BC, 0x0000], DataType::Float32).unwrap(),
            FieldValue::Float(23.5)
        );
        assert_eq!(
            decode_registers(&[0xFFFF, 0xFFFE], DataType::Int32).unwrap(),
            FieldValue::Int(-2)
        );
        assert_eq!(
            decode_registers(&[0x8000], DataType::Int16).unwrap(),
            FieldValue::Int(-32768)
        );
        assert!(decode_registers(&[0x0001], DataType::Float32).is_err());
    }
}
