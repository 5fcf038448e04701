// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus wire format
//!
//! Framing for both transports plus request decoding and reply construction:
//!
//! * MBAP (TCP): 7-byte header carrying transaction id, protocol id (always
//!   0), remaining length and unit id;
//! * RTU: address byte + PDU + CRC-16/MODBUS, CRC transmitted little-endian.
//!
//! A [`ModbusQuery`] keeps the raw ADU bytes together with the header length
//! of its transport, so all PDU offsets below are relative to that header
//! length. Unit tests use a header length of 0 (bare PDU).

use crc::{Crc, CRC_16_MODBUS};
use thiserror::Error;

use super::StoreKind;

pub const MBAP_HEADER_LEN: usize = 7;
pub const RTU_HEADER_LEN: usize = 1;
/// Largest ADU either transport can carry.
pub const MAX_ADU_LEN: usize = 260;

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

pub const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Store targeted by a function code.
pub fn store_for_function(function: u8) -> Option<StoreKind> {
    match function {
        FC_READ_COILS | FC_WRITE_SINGLE_COIL | FC_WRITE_MULTIPLE_COILS => Some(StoreKind::Coil),
        FC_READ_DISCRETE_INPUTS => Some(StoreKind::DiscreteInput),
        FC_READ_HOLDING_REGISTERS | FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_REGISTERS => {
            Some(StoreKind::HoldingRegister)
        }
        FC_READ_INPUT_REGISTERS => Some(StoreKind::InputRegister),
        _ => None,
    }
}

pub fn is_write_function(function: u8) -> bool {
    matches!(
        function,
        FC_WRITE_SINGLE_COIL
            | FC_WRITE_SINGLE_REGISTER
            | FC_WRITE_MULTIPLE_COILS
            | FC_WRITE_MULTIPLE_REGISTERS
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("truncated frame")]
    Truncated,
    #[error("unsupported function code 0x{0:02x}")]
    UnsupportedFunction(u8),
    #[error("count {count} out of range for function 0x{function:02x}")]
    BadCount { function: u8, count: u16 },
    #[error("byte count does not match the requested cell count")]
    BadByteCount,
    #[error("illegal single-coil value")]
    BadValue,
    #[error("bad MBAP header")]
    BadHeader,
    #[error("CRC mismatch")]
    CrcMismatch,
}

/// One raw request as received from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusQuery {
    /// Full ADU without any trailing CRC.
    pub data: Vec<u8>,
    /// Transport header length; the PDU starts at this offset.
    pub header_length: usize,
    /// Transport-specific connection index used to route the reply.
    pub connection: usize,
}

impl ModbusQuery {
    pub fn new(data: Vec<u8>, header_length: usize, connection: usize) -> Self {
        Self {
            data,
            header_length,
            connection,
        }
    }

    /// Addressed slave: the byte right before the PDU, 0 for bare PDUs.
    pub fn slave_id(&self) -> u8 {
        if self.header_length == 0 {
            0
        } else {
            self.data.get(self.header_length - 1).copied().unwrap_or(0)
        }
    }

    pub fn function(&self) -> u8 {
        self.data.get(self.header_length).copied().unwrap_or(0)
    }
}

/// Decoded request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub function: u8,
    /// First addressed cell.
    pub start: u16,
    /// Number of addressed cells; 1 for the single-write functions.
    pub count: u16,
    /// Index of the first payload byte within the ADU, 0 for reads.
    pub payload_offset: usize,
}

/// Validates and decodes the PDU of an ADU with the given header length.
pub fn parse_request(data: &[u8], header_length: usize) -> Result<Request, FrameError> {
    let pdu = data.get(header_length..).ok_or(FrameError::Truncated)?;
    let function = *pdu.first().ok_or(FrameError::Truncated)?;
    match function {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS | FC_READ_HOLDING_REGISTERS
        | FC_READ_INPUT_REGISTERS => {
            if pdu.len() < 5 {
                return Err(FrameError::Truncated);
            }
            let start = u16::from_be_bytes([pdu[1], pdu[2]]);
            let count = u16::from_be_bytes([pdu[3], pdu[4]]);
            let limit = if function <= FC_READ_DISCRETE_INPUTS {
                2000
            } else {
                125
            };
            if count == 0 || count > limit {
                return Err(FrameError::BadCount { function, count });
            }
            Ok(Request {
                function,
                start,
                count,
                payload_offset: 0,
            })
        }
        FC_WRITE_SINGLE_COIL | FC_WRITE_SINGLE_REGISTER => {
            if pdu.len() < 5 {
                return Err(FrameError::Truncated);
            }
            let start = u16::from_be_bytes([pdu[1], pdu[2]]);
            if function == FC_WRITE_SINGLE_COIL {
                let value = u16::from_be_bytes([pdu[3], pdu[4]]);
                if value != 0x0000 && value != 0xFF00 {
                    return Err(FrameError::BadValue);
                }
            }
            Ok(Request {
                function,
                start,
                count: 1,
                payload_offset: header_length + 3,
            })
        }
        FC_WRITE_MULTIPLE_COILS | FC_WRITE_MULTIPLE_REGISTERS => {
            if pdu.len() < 6 {
                return Err(FrameError::Truncated);
            }
            let start = u16::from_be_bytes([pdu[1], pdu[2]]);
            let count = u16::from_be_bytes([pdu[3], pdu[4]]);
            let limit = if function == FC_WRITE_MULTIPLE_COILS {
                1968
            } else {
                123
            };
            if count == 0 || count > limit {
                return Err(FrameError::BadCount { function, count });
            }
            let expected = if function == FC_WRITE_MULTIPLE_COILS {
                (count as usize + 7) / 8
            } else {
                count as usize * 2
            };
            if pdu[5] as usize != expected {
                return Err(FrameError::BadByteCount);
            }
            if pdu.len() < 6 + expected {
                return Err(FrameError::Truncated);
            }
            Ok(Request {
                function,
                start,
                count,
                payload_offset: header_length + 6,
            })
        }
        _ => Err(FrameError::UnsupportedFunction(function)),
    }
}

/// Examines the head of a TCP read buffer. Returns the total ADU length once
/// a complete frame is buffered, `None` when more bytes are needed.
pub fn mbap_frame_len(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    if buf.len() < MBAP_HEADER_LEN {
        return Ok(None);
    }
    let protocol = u16::from_be_bytes([buf[2], buf[3]]);
    if protocol != 0 {
        return Err(FrameError::BadHeader);
    }
    let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    if length < 2 || 6 + length > MAX_ADU_LEN {
        return Err(FrameError::BadHeader);
    }
    let total = 6 + length;
    Ok(if buf.len() >= total { Some(total) } else { None })
}

/// Examines the head of a serial read buffer. Returns the total request ADU
/// length (CRC included) once the function code and any byte count are
/// readable, `None` while more bytes are needed to tell.
pub fn rtu_frame_len(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let function = buf[1];
    let total = match function {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS | FC_READ_HOLDING_REGISTERS
        | FC_READ_INPUT_REGISTERS | FC_WRITE_SINGLE_COIL | FC_WRITE_SINGLE_REGISTER => {
            RTU_HEADER_LEN + 5 + 2
        }
        FC_WRITE_MULTIPLE_COILS | FC_WRITE_MULTIPLE_REGISTERS => match buf.get(6) {
            Some(&byte_count) => RTU_HEADER_LEN + 6 + byte_count as usize + 2,
            None => return Ok(None),
        },
        other => return Err(FrameError::UnsupportedFunction(other)),
    };
    if total > MAX_ADU_LEN {
        return Err(FrameError::BadHeader);
    }
    Ok(if buf.len() >= total { Some(total) } else { None })
}

/// Verifies the trailing CRC of an RTU frame and strips it.
pub fn rtu_check(frame: &[u8]) -> Result<&[u8], FrameError> {
    if frame.len() < RTU_HEADER_LEN + 3 {
        return Err(FrameError::Truncated);
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    if MODBUS_CRC.checksum(body) != received {
        return Err(FrameError::CrcMismatch);
    }
    Ok(body)
}

/// Appends the CRC to an RTU ADU.
pub fn rtu_frame(adu: &[u8]) -> Vec<u8> {
    let mut out = adu.to_vec();
    out.extend_from_slice(&MODBUS_CRC.checksum(adu).to_le_bytes());
    out
}

/// Packs bit cells (`0`/nonzero) LSB-first into payload bytes.
pub fn pack_bits(bits: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; (bits.len() + 7) / 8];
    for (i, &bit) in bits.iter().enumerate() {
        if bit != 0 {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

/// Unpacks `count` LSB-first payload bits into `0`/`1` cells.
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<u8> {
    (0..count)
        .map(|i| {
            bytes
                .get(i / 8)
                .map(|b| (b >> (i % 8)) & 1)
                .unwrap_or(0)
        })
        .collect()
}

/// Serializes register cells big-endian.
pub fn words_to_be_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Deserializes big-endian register cells; a trailing odd byte is ignored.
pub fn be_bytes_to_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

// Copies the request header in front of a reply PDU, patching the MBAP
// length field when the header is an MBAP one.
fn with_header(query: &ModbusQuery, pdu: &[u8]) -> Vec<u8> {
    let mut out = query.data[..query.header_length].to_vec();
    if query.header_length == MBAP_HEADER_LEN {
        let length = (pdu.len() as u16 + 1).to_be_bytes();
        out[4] = length[0];
        out[5] = length[1];
    }
    out.extend_from_slice(pdu);
    out
}

/// Reply to a bit-store read: byte count followed by packed bits.
pub fn build_read_bits_reply(query: &ModbusQuery, bits: &[u8]) -> Vec<u8> {
    let packed = pack_bits(bits);
    let mut pdu = Vec::with_capacity(2 + packed.len());
    pdu.push(query.function());
    pdu.push(packed.len() as u8);
    pdu.extend_from_slice(&packed);
    with_header(query, &pdu)
}

/// Reply to a register read: byte count followed by big-endian registers.
pub fn build_read_words_reply(query: &ModbusQuery, words: &[u16]) -> Vec<u8> {
    let payload = words_to_be_bytes(words);
    let mut pdu = Vec::with_capacity(2 + payload.len());
    pdu.push(query.function());
    pdu.push(payload.len() as u8);
    pdu.extend_from_slice(&payload);
    with_header(query, &pdu)
}

/// Reply to a write: echo of the function, address and value (single writes)
/// or count (multi writes).
pub fn build_write_reply(query: &ModbusQuery) -> Vec<u8> {
    let pdu_end = (query.header_length + 5).min(query.data.len());
    let pdu = &query.data[query.header_length..pdu_end];
    with_header(query, pdu)
}

/// Exception reply: `function | 0x80` followed by the exception code.
pub fn build_exception_reply(query: &ModbusQuery, exception: u8) -> Vec<u8> {
    with_header(query, &[query.function() | 0x80, exception])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_read_requests() {
        let req = parse_request(&[0x03, 0x00, 0x10, 0x00, 0x02], 0).unwrap();
        assert_eq!(
            req,
            Request {
                function: 0x03,
                start: 0x10,
                count: 2,
                payload_offset: 0
            }
        );
        assert_eq!(
            parse_request(&[0x01, 0x00, 0x00, 0x08, 0x00], 0),
            Err(FrameError::BadCount {
                function: 0x01,
                count: 0x0800
            })
        );
        assert_eq!(
            parse_request(&[0x03, 0x00, 0x10], 0),
            Err(FrameError::Truncated)
        );
    }

    #[test]
    fn parses_write_requests() {
        let req =
            parse_request(&[0x10, 0x00, 0x00, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78], 0)
                .unwrap();
        assert_eq!(req.start, 0);
        assert_eq!(req.count, 2);
        assert_eq!(req.payload_offset, 6);

        let req = parse_request(&[0x05, 0x00, 0x07, 0xFF, 0x00], 0).unwrap();
        assert_eq!(req.start, 7);
        assert_eq!(req.count, 1);
        assert_eq!(req.payload_offset, 3);

        assert_eq!(
            parse_request(&[0x05, 0x00, 0x07, 0x12, 0x00], 0),
            Err(FrameError::BadValue)
        );
        assert_eq!(
            parse_request(&[0x10, 0x00, 0x00, 0x00, 0x02, 0x03, 0x12, 0x34, 0x56], 0),
            Err(FrameError::BadByteCount)
        );
        assert_eq!(
            parse_request(&[0x2B, 0x00, 0x00, 0x00, 0x01], 0),
            Err(FrameError::UnsupportedFunction(0x2B))
        );
    }

    #[test]
    fn header_offsets_shift_the_pdu() {
        // MBAP: unit 9, read 1 holding register at 4.
        let adu = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x09, 0x03, 0x00, 0x04, 0x00, 0x01];
        let query = ModbusQuery::new(adu.to_vec(), MBAP_HEADER_LEN, 0);
        assert_eq!(query.slave_id(), 9);
        assert_eq!(query.function(), 0x03);
        let req = parse_request(&query.data, query.header_length).unwrap();
        assert_eq!(req.start, 4);
    }

    #[test]
    fn bit_packing_is_lsb_first() {
        assert_eq!(pack_bits(&[1, 0, 1, 1, 0, 0, 0, 0, 1]), vec![0x0D, 0x01]);
        assert_eq!(unpack_bits(&[0x0D, 0x01], 9), vec![1, 0, 1, 1, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn word_serialization_is_big_endian() {
        assert_eq!(words_to_be_bytes(&[0x1234, 0x5678]), vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(be_bytes_to_words(&[0x12, 0x34, 0x56, 0x78]), vec![0x1234, 0x5678]);
    }

    #[test]
    fn rtu_frame_length_detection() {
        // Fixed-length request: addr + fc + 4 + crc.
        let read = rtu_frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(rtu_frame_len(&read).unwrap(), Some(8));
        assert_eq!(rtu_frame_len(&read[..5]).unwrap(), None);
        assert_eq!(rtu_frame_len(&read[..1]).unwrap(), None);

        // Multi-write: the byte count at offset 6 sets the length.
        let write = rtu_frame(&[0x01, 0x10, 0x00, 0x00, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78]);
        assert_eq!(rtu_frame_len(&write).unwrap(), Some(13));
        assert_eq!(rtu_frame_len(&write[..6]).unwrap(), None);
        assert_eq!(rtu_frame_len(&write[..9]).unwrap(), None);

        assert_eq!(
            rtu_frame_len(&[0x01, 0x2B]),
            Err(FrameError::UnsupportedFunction(0x2B))
        );
    }

    #[test]
    fn rtu_crc_round_trip() {
        let framed = rtu_frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(rtu_check(&framed).unwrap(), &framed[..framed.len() - 2]);
        let mut corrupted = framed.clone();
        corrupted[2] ^= 0xFF;
        assert_eq!(rtu_check(&corrupted), Err(FrameError::CrcMismatch));
    }

    #[test]
    fn mbap_frame_length_detection() {
        let adu = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x09, 0x03, 0x00, 0x04, 0x00, 0x01];
        assert_eq!(mbap_frame_len(&adu).unwrap(), Some(12));
        assert_eq!(mbap_frame_len(&adu[..8]).unwrap(), None);
        assert_eq!(mbap_frame_len(&adu[..4]).unwrap(), None);
        let bad_protocol = [0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x09, 0x03];
        assert_eq!(mbap_frame_len(&bad_protocol), Err(FrameError::BadHeader));
    }

    #[test]
    fn read_reply_echoes_the_mbap_header() {
        let adu = [0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x02, 0x03, 0x00, 0x00, 0x00, 0x02];
        let query = ModbusQuery::new(adu.to_vec(), MBAP_HEADER_LEN, 0);
        let reply = build_read_words_reply(&query, &[0x1234, 0x5678]);
        assert_eq!(
            reply,
            vec![0x00, 0x07, 0x00, 0x00, 0x00, 0x07, 0x02, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78]
        );
    }

    #[test]
    fn write_and_exception_replies() {
        let query = ModbusQuery::new(
            vec![0x10, 0x00, 0x00, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78],
            0,
            0,
        );
        assert_eq!(build_write_reply(&query), vec![0x10, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(build_exception_reply(&query, 0x02), vec![0x90, 0x02]);
    }
}
