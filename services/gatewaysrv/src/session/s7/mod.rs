//! S7 field-protocol client
//!
//! A read-only S7comm session over TCP port 102: COTP connection, PDU-size
//! negotiation, then multi-item read-var jobs chunked to the PDU budget.

pub mod address;
pub mod frame;

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{GatewaySrvError, Result};
use crate::model::{DataType, FieldValue};
use crate::session::driver::{FieldClient, ReadRequest};
use self::address::{S7Address, S7Width};

const LOCAL_TSAP: u16 = 0x0100;
const REQUESTED_PDU_SIZE: u16 = 480;

/// One S7 session per device; reads are serialized by the owning context
pub struct S7Client {
    host: String,
    port: u16,
    rack: u16,
    slot: u16,
    stream: Option<TcpStream>,
    pdu_ref: u16,
}

impl S7Client {
    pub fn new(host: String, port: u16, rack: u16, slot: u16) -> Self {
        Self {
            host,
            port,
            rack,
            slot,
            stream: None,
            pdu_ref: 0,
        }
    }

    fn remote_tsap(&self) -> u16 {
        // Connection type 0x03 (S7 basic) in the high byte, rack/slot packed
        // into the low byte the way S7-300/400 CPUs expect.
        0x0300 | ((self.rack & 0x07) << 5) | (self.slot & 0x1F)
    }

    fn next_pdu_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    /// Send one TPKT frame and read the next one off the wire
    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| GatewaySrvError::connection("S7 session not connected"))?;
        stream.write_all(request).await?;

        let mut header = [0u8; frame::TPKT_HEADER_LEN];
        stream.read_exact(&mut header).await?;
        let total = u16::from_be_bytes([header[2], header[3]]) as usize;
        if total < frame::TPKT_HEADER_LEN {
            return Err(GatewaySrvError::protocol("TPKT frame shorter than header"));
        }
        let mut body = vec![0u8; total - frame::TPKT_HEADER_LEN];
        stream.read_exact(&mut body).await?;
        Ok(body)
    }

    fn decode(payload: &[u8], addr: &S7Address, data_type: DataType) -> Result<FieldValue> {
        let need = addr.width.byte_len() as usize;
        if payload.len() < need {
            return Err(GatewaySrvError::data(format!(
                "S7 payload too short: {} < {need}",
                payload.len()
            )));
        }
        let value = match (addr.width, data_type) {
            (S7Width::Bit, _) => FieldValue::Bool(payload[0] & 1 != 0),
            (S7Width::Byte, DataType::Bool) => FieldValue::Bool(payload[0] != 0),
            (S7Width::Byte, _) => FieldValue::UInt(payload[0] as u64),
            (S7Width::Word, DataType::Int16) => {
                FieldValue::Int(i16::from_be_bytes([payload[0], payload[1]]) as i64)
            }
            (S7Width::Word, _) => {
                FieldValue::UInt(u16::from_be_bytes([payload[0], payload[1]]) as u64)
            }
            (S7Width::DWord, DataType::Float32 | DataType::Float64) => {
                let bits = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                FieldValue::Float(f32::from_bits(bits) as f64)
            }
            (S7Width::DWord, DataType::Int32) => FieldValue::Int(i32::from_be_bytes([
                payload[0], payload[1], payload[2], payload[3],
            ]) as i64),
            (S7Width::DWord, _) => FieldValue::UInt(u32::from_be_bytes([
                payload[0], payload[1], payload[2], payload[3],
            ]) as u64),
        };
        Ok(value)
    }
}

#[async_trait]
impl FieldClient for S7Client {
    async fn connect(&mut self) -> Result<()> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);

        let response = self
            .exchange(&frame::connect_request(LOCAL_TSAP, self.remote_tsap()))
            .await?;
        frame::parse_connect_confirm(&response)?;

        let pdu_ref = self.next_pdu_ref();
        let response = self
            .exchange(&frame::setup_request(pdu_ref, REQUESTED_PDU_SIZE))
            .await?;
        let negotiated = frame::parse_setup_response(&response)?;
        debug!(
            host = %self.host,
            rack = self.rack,
            slot = self.slot,
            pdu_size = negotiated,
            "S7 session established"
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_batch(
        &mut self,
        requests: &[ReadRequest],
    ) -> Result<HashMap<String, FieldValue>> {
        // Unparseable addresses are configuration errors: skip them for this
        // cycle instead of failing the whole batch.
        let mut parsed = Vec::with_capacity(requests.len());
        for request in requests {
            match S7Address::parse(&request.address) {
                Ok(addr) => parsed.push((request, addr)),
                Err(e) => warn!(address = %request.address, "Skipping unreadable S7 address: {e}"),
            }
        }

        let mut values = HashMap::with_capacity(parsed.len());
        for chunk in parsed.chunks(frame::MAX_ITEMS_PER_JOB) {
            let items: Vec<S7Address> = chunk.iter().map(|(_, a)| *a).collect();
            let pdu_ref = self.next_pdu_ref();
            let response = self.exchange(&frame::read_request(pdu_ref, &items)).await?;
            let payloads = frame::parse_read_response(&response, items.len())?;

            for ((request, addr), payload) in chunk.iter().zip(payloads) {
                let Some(payload) = payload else {
                    warn!(address = %request.address, "PLC rejected read item");
                    continue;
                };
                match Self::decode(&payload, addr, request.data_type) {
                    Ok(value) => {
                        values.insert(request.address.clone(), value);
                    }
                    Err(e) => warn!(address = %request.address, "Undecodable S7 payload: {e}"),
                }
            }
        }
        Ok(values)
    }
}
