//! S7 wire framing: TPKT + COTP + S7 job/ack-data PDUs
//!
//! Only the subset the gateway needs: connection setup, communication
//! negotiation, and multi-item variable reads.

use bytes::{BufMut, BytesMut};

use crate::error::{GatewaySrvError, Result};
use super::address::{S7Address, S7Width};

pub const TPKT_HEADER_LEN: usize = 4;
const TPKT_VERSION: u8 = 0x03;
const COTP_DT: [u8; 3] = [0x02, 0xF0, 0x80];
const COTP_PDU_CC: u8 = 0xD0;
const S7_PROTOCOL_ID: u8 = 0x32;
const S7_JOB: u8 = 0x01;
const S7_ACK_DATA: u8 = 0x03;
const FN_SETUP: u8 = 0xF0;
const FN_READ_VAR: u8 = 0x04;
const RET_OK: u8 = 0xFF;

/// Items per read job; conservative bound that fits a 480-byte PDU
pub const MAX_ITEMS_PER_JOB: usize = 16;

fn tpkt_frame(body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(TPKT_HEADER_LEN + body.len());
    buf.put_u8(TPKT_VERSION);
    buf.put_u8(0x00);
    buf.put_u16((TPKT_HEADER_LEN + body.len()) as u16);
    buf.put_slice(body);
    buf.to_vec()
}

/// COTP connection request carrying the calling/called TSAP pair
pub fn connect_request(local_tsap: u16, remote_tsap: u16) -> Vec<u8> {
    let mut body = BytesMut::with_capacity(18);
    body.put_u8(17); // header length excluding this byte
    body.put_u8(0xE0); // CR
    body.put_u16(0x0000); // destination reference
    body.put_u16(0x0001); // source reference
    body.put_u8(0x00); // class 0
    body.put_slice(&[0xC0, 0x01, 0x0A]); // TPDU size 1024
    body.put_slice(&[0xC1, 0x02]);
    body.put_u16(local_tsap);
    body.put_slice(&[0xC2, 0x02]);
    body.put_u16(remote_tsap);
    tpkt_frame(&body)
}

/// Validate a COTP connection confirm
pub fn parse_connect_confirm(body: &[u8]) -> Result<()> {
    if body.len() < 2 || body[1] != COTP_PDU_CC {
        return Err(GatewaySrvError::protocol(
            "S7 connect refused: expected COTP connection confirm",
        ));
    }
    Ok(())
}

fn s7_job(pdu_ref: u16, parameters: &[u8]) -> Vec<u8> {
    let mut body = BytesMut::with_capacity(COTP_DT.len() + 10 + parameters.len());
    body.put_slice(&COTP_DT);
    body.put_u8(S7_PROTOCOL_ID);
    body.put_u8(S7_JOB);
    body.put_u16(0x0000); // reserved
    body.put_u16(pdu_ref);
    body.put_u16(parameters.len() as u16);
    body.put_u16(0x0000); // no data section
    body.put_slice(parameters);
    tpkt_frame(&body)
}

/// Setup-communication job negotiating the PDU size
pub fn setup_request(pdu_ref: u16, pdu_size: u16) -> Vec<u8> {
    let mut params = BytesMut::with_capacity(8);
    params.put_u8(FN_SETUP);
    params.put_u8(0x00);
    params.put_u16(0x0001); // max AMQ calling
    params.put_u16(0x0001); // max AMQ called
    params.put_u16(pdu_size);
    s7_job(pdu_ref, &params)
}

/// Extract the negotiated PDU size from a setup-communication ack
pub fn parse_setup_response(body: &[u8]) -> Result<u16> {
    let s7 = strip_cotp_and_header(body)?;
    if s7.params.first() != Some(&FN_SETUP) || s7.params.len() < 8 {
        return Err(GatewaySrvError::protocol(
            "S7 setup response with unexpected function",
        ));
    }
    Ok(u16::from_be_bytes([s7.params[6], s7.params[7]]))
}

/// Read-var job for up to [`MAX_ITEMS_PER_JOB`] addresses
pub fn read_request(pdu_ref: u16, items: &[S7Address]) -> Vec<u8> {
    debug_assert!(!items.is_empty() && items.len() <= MAX_ITEMS_PER_JOB);
    let mut params = BytesMut::with_capacity(2 + items.len() * 12);
    params.put_u8(FN_READ_VAR);
    params.put_u8(items.len() as u8);
    for item in items {
        params.put_u8(0x12); // variable specification
        params.put_u8(0x0A); // remaining item length
        params.put_u8(0x10); // syntax id: S7-Any
        // Bit reads use the BIT transport size; everything else is a byte run
        let (transport, count) = match item.width {
            S7Width::Bit => (0x01u8, 1u16),
            _ => (0x02u8, item.width.byte_len()),
        };
        params.put_u8(transport);
        params.put_u16(count);
        params.put_u16(item.db_number);
        params.put_u8(item.area.code());
        let bit_address = item.byte_offset * 8 + item.bit as u32;
        params.put_u8((bit_address >> 16) as u8);
        params.put_u16((bit_address & 0xFFFF) as u16);
    }
    s7_job(pdu_ref, &params)
}

/// Per-item payload of a read-var ack: `None` when the PLC reported an error
/// for that item (bad address, missing block).
pub fn parse_read_response(body: &[u8], expected_items: usize) -> Result<Vec<Option<Vec<u8>>>> {
    let s7 = strip_cotp_and_header(body)?;
    if s7.params.first() != Some(&FN_READ_VAR) {
        return Err(GatewaySrvError::protocol(
            "S7 read response with unexpected function",
        ));
    }
    let item_count = *s7.params.get(1).unwrap_or(&0) as usize;
    if item_count != expected_items {
        return Err(GatewaySrvError::protocol(format!(
            "S7 read response item count mismatch: expected {expected_items}, got {item_count}"
        )));
    }

    let data = s7.data;
    let mut items = Vec::with_capacity(item_count);
    let mut pos = 0usize;
    for index in 0..item_count {
        if pos + 4 > data.len() {
            return Err(GatewaySrvError::protocol(
                "S7 read response truncated item header",
            ));
        }
        let return_code = data[pos];
        let transport = data[pos + 1];
        let raw_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;

        if return_code != RET_OK {
            items.push(None);
            continue;
        }

        // Transport 0x03/0x04 report the length in bits, 0x09 in bytes
        let byte_len = match transport {
            0x03 => raw_len.max(1).div_ceil(8),
            0x04 | 0x05 => raw_len / 8,
            _ => raw_len,
        };
        if pos + byte_len > data.len() {
            return Err(GatewaySrvError::protocol(
                "S7 read response truncated item data",
            ));
        }
        items.push(Some(data[pos..pos + byte_len].to_vec()));
        pos += byte_len;
        // Items are padded to even offsets, except after the last one
        if byte_len % 2 == 1 && index + 1 < item_count {
            pos += 1;
        }
    }
    Ok(items)
}

struct S7Pdu<'a> {
    params: &'a [u8],
    data: &'a [u8],
}

/// Skip the COTP DT header and the S7 ack-data header, checking the error class
fn strip_cotp_and_header(body: &[u8]) -> Result<S7Pdu<'_>> {
    if body.len() < 3 || body[1] != 0xF0 {
        return Err(GatewaySrvError::protocol("expected COTP data TPDU"));
    }
    let s7 = &body[3..];
    if s7.len() < 12 || s7[0] != S7_PROTOCOL_ID {
        return Err(GatewaySrvError::protocol("malformed S7 header"));
    }
    if s7[1] != S7_ACK_DATA {
        return Err(GatewaySrvError::protocol(format!(
            "unexpected S7 PDU type 0x{:02X}",
            s7[1]
        )));
    }
    let param_len = u16::from_be_bytes([s7[6], s7[7]]) as usize;
    let data_len = u16::from_be_bytes([s7[8], s7[9]]) as usize;
    let (error_class, error_code) = (s7[10], s7[11]);
    if error_class != 0x00 {
        return Err(GatewaySrvError::protocol(format!(
            "S7 job failed: class 0x{error_class:02X} code 0x{error_code:02X}"
        )));
    }
    let params_start = 12;
    let data_start = params_start + param_len;
    if s7.len() < data_start + data_len {
        return Err(GatewaySrvError::protocol("S7 PDU shorter than declared"));
    }
    Ok(S7Pdu {
        params: &s7[params_start..data_start],
        data: &s7[data_start..data_start + data_len],
    })
}
