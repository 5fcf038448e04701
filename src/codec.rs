// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Value codecs between register cells and bus payload strings
//!
//! Each codec spans a fixed number of cache cells ([`ValueCodec::cell_count`])
//! and converts both ways: [`unpack`](ValueCodec::unpack) turns cells into
//! the string published on the bus, [`pack`](ValueCodec::pack) turns an
//! incoming payload back into cells.
//!
//! Multi-register values are most-significant-word first. The `byteswap`
//! flag swaps the two bytes inside each register, `wordswap` reverses the
//! register order; both can be combined for the various vendor layouts.

use thiserror::Error;

use crate::modbus::{CacheCells, ValueCells};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unparsable payload {0:?}")]
    BadPayload(String),
    #[error("value does not fit the register area")]
    BadLength,
    #[error("codec does not apply to this cell kind")]
    WrongKind,
}

/// Converter between a fixed-size cell area and a payload string.
pub trait ValueCodec: Send + Sync {
    /// Number of cache cells this codec spans.
    fn cell_count(&self) -> usize;

    fn unpack(&self, cells: &ValueCells<'_>) -> Result<String, CodecError>;

    fn pack(&self, payload: &str, cells: &mut CacheCells<'_>) -> Result<(), CodecError>;
}

fn expect_words<'a, 'b>(
    cells: &'a ValueCells<'b>,
    count: usize,
) -> Result<&'a [u16], CodecError> {
    match cells {
        ValueCells::Words(words) if words.len() == count => Ok(words),
        ValueCells::Words(_) => Err(CodecError::BadLength),
        ValueCells::Bits(_) => Err(CodecError::WrongKind),
    }
}

fn expect_words_mut<'a, 'b>(
    cells: &'a mut CacheCells<'b>,
    count: usize,
) -> Result<&'a mut [u16], CodecError> {
    match cells {
        CacheCells::Words(words) if words.len() == count => Ok(words),
        CacheCells::Words(_) => Err(CodecError::BadLength),
        CacheCells::Bits(_) => Err(CodecError::WrongKind),
    }
}

// Applies the transport layout to a most-significant-word-first register
// sequence (and undoes it, the transform is an involution).
fn apply_swaps(regs: &mut [u16], byteswap: bool, wordswap: bool) {
    if byteswap {
        for reg in regs.iter_mut() {
            *reg = reg.swap_bytes();
        }
    }
    if wordswap {
        regs.reverse();
    }
}

// Integer formatting for scaled values: whole numbers print without a
// fractional part.
fn format_number(value: f64) -> String {
    if value.is_finite() && value == value.trunc() && value.abs() < 9.0e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

fn parse_number(payload: &str) -> Result<f64, CodecError> {
    payload
        .trim()
        .parse::<f64>()
        .map_err(|_| CodecError::BadPayload(payload.to_string()))
}

fn bcd_to_int(mut bcd: u64) -> u64 {
    let mut result = 0;
    let mut weight = 1;
    while bcd != 0 {
        result += (bcd & 0x0F) * weight;
        weight *= 10;
        bcd >>= 4;
    }
    result
}

fn int_to_bcd(mut value: u64) -> u64 {
    let mut bcd = 0;
    let mut shift = 0;
    while value != 0 {
        bcd |= (value % 10) << shift;
        shift += 4;
        value /= 10;
    }
    bcd
}

// Rounds a configured byte width up to 2, 4 or 8.
fn normalize_size(size: usize) -> usize {
    if size > 4 {
        8
    } else if size > 2 {
        4
    } else {
        2
    }
}

/// Codec for single-bit cells: `"0"` / `"1"`.
pub struct DiscreteCodec;

impl ValueCodec for DiscreteCodec {
    fn cell_count(&self) -> usize {
        1
    }

    fn unpack(&self, cells: &ValueCells<'_>) -> Result<String, CodecError> {
        match cells {
            ValueCells::Bits(bits) => match bits.first() {
                Some(&bit) => Ok(if bit != 0 { "1" } else { "0" }.to_string()),
                None => Err(CodecError::BadLength),
            },
            ValueCells::Words(_) => Err(CodecError::WrongKind),
        }
    }

    fn pack(&self, payload: &str, cells: &mut CacheCells<'_>) -> Result<(), CodecError> {
        let value = payload
            .trim()
            .parse::<f64>()
            .map(|v| v != 0.0)
            .unwrap_or(false);
        match cells {
            CacheCells::Bits(bits) => match bits.first_mut() {
                Some(bit) => {
                    *bit = u8::from(value);
                    Ok(())
                }
                None => Err(CodecError::BadLength),
            },
            CacheCells::Words(_) => Err(CodecError::WrongKind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntFormat {
    Signed,
    Unsigned,
    /// Binary-coded decimal.
    Bcd,
}

/// Integer codec over 1, 2 or 4 registers with a fixed-point scale.
pub struct IntCodec {
    format: IntFormat,
    size: usize,
    scale: f64,
    byteswap: bool,
    wordswap: bool,
}

impl IntCodec {
    /// `size` is the value width in bytes, rounded up to 2, 4 or 8. A zero
    /// scale counts as 1.
    pub fn new(format: IntFormat, size: usize, scale: f64, byteswap: bool, wordswap: bool) -> Self {
        Self {
            format,
            size: normalize_size(size),
            scale: if scale == 0.0 { 1.0 } else { scale },
            byteswap,
            wordswap,
        }
    }
}

impl ValueCodec for IntCodec {
    fn cell_count(&self) -> usize {
        self.size / 2
    }

    fn unpack(&self, cells: &ValueCells<'_>) -> Result<String, CodecError> {
        let words = expect_words(cells, self.cell_count())?;
        let mut regs = words.to_vec();
        apply_swaps(&mut regs, self.byteswap, self.wordswap);
        let raw = regs.iter().fold(0u64, |acc, &reg| (acc << 16) | reg as u64);
        let value = match self.format {
            IntFormat::Signed => {
                let unused = 64 - self.size as u32 * 8;
                (((raw << unused) as i64) >> unused) as f64
            }
            IntFormat::Unsigned => raw as f64,
            IntFormat::Bcd => bcd_to_int(raw) as f64,
        };
        Ok(format_number(value / self.scale))
    }

    fn pack(&self, payload: &str, cells: &mut CacheCells<'_>) -> Result<(), CodecError> {
        let words = expect_words_mut(cells, self.cell_count())?;
        let scaled = parse_number(payload)? * self.scale;
        let mut raw = match self.format {
            IntFormat::Signed => (scaled as i64) as u64,
            IntFormat::Unsigned => scaled as u64,
            IntFormat::Bcd => int_to_bcd(scaled as u64),
        };
        let count = self.cell_count();
        let mut regs = vec![0u16; count];
        for slot in regs.iter_mut().rev() {
            *slot = raw as u16;
            raw >>= 16;
        }
        apply_swaps(&mut regs, self.byteswap, self.wordswap);
        words.copy_from_slice(&regs);
        Ok(())
    }
}

/// IEEE 754 codec over 2 (`f32`) or 4 (`f64`) registers.
///
/// Arithmetic happens at the stored precision so a round-tripped `f32` does
/// not grow spurious digits.
pub struct FloatCodec {
    size: usize,
    scale: f64,
    byteswap: bool,
    wordswap: bool,
}

impl FloatCodec {
    /// `size` is 4 or 8 bytes; anything above 4 selects `f64`.
    pub fn new(size: usize, scale: f64, byteswap: bool, wordswap: bool) -> Self {
        Self {
            size: if size > 4 { 8 } else { 4 },
            scale: if scale == 0.0 { 1.0 } else { scale },
            byteswap,
            wordswap,
        }
    }
}

impl ValueCodec for FloatCodec {
    fn cell_count(&self) -> usize {
        self.size / 2
    }

    fn unpack(&self, cells: &ValueCells<'_>) -> Result<String, CodecError> {
        let words = expect_words(cells, self.cell_count())?;
        let mut regs = words.to_vec();
        apply_swaps(&mut regs, self.byteswap, self.wordswap);
        if self.size == 4 {
            let bits = ((regs[0] as u32) << 16) | regs[1] as u32;
            let value = f32::from_bits(bits) / self.scale as f32;
            Ok(format!("{}", value))
        } else {
            let bits = regs.iter().fold(0u64, |acc, &reg| (acc << 16) | reg as u64);
            let value = f64::from_bits(bits) / self.scale;
            Ok(format!("{}", value))
        }
    }

    fn pack(&self, payload: &str, cells: &mut CacheCells<'_>) -> Result<(), CodecError> {
        let words = expect_words_mut(cells, self.cell_count())?;
        let number = parse_number(payload)?;
        let mut regs = if self.size == 4 {
            let bits = ((number as f32) * self.scale as f32).to_bits();
            vec![(bits >> 16) as u16, bits as u16]
        } else {
            let bits = (number * self.scale).to_bits();
            vec![
                (bits >> 48) as u16,
                (bits >> 32) as u16,
                (bits >> 16) as u16,
                bits as u16,
            ]
        };
        apply_swaps(&mut regs, self.byteswap, self.wordswap);
        words.copy_from_slice(&regs);
        Ok(())
    }
}

/// Text codec: one character per register.
///
/// The character sits in the low byte of its register (`byteswap` moves it
/// to the high byte); `wordswap` reverses the register order. Unused
/// trailing registers are zeroed and stripped again on unpack.
pub struct TextCodec {
    size: usize,
    byteswap: bool,
    wordswap: bool,
}

impl TextCodec {
    /// `size` is the string length in characters, one register each.
    pub fn new(size: usize, byteswap: bool, wordswap: bool) -> Self {
        Self {
            size: size.max(1),
            byteswap,
            wordswap,
        }
    }
}

impl ValueCodec for TextCodec {
    fn cell_count(&self) -> usize {
        self.size
    }

    fn unpack(&self, cells: &ValueCells<'_>) -> Result<String, CodecError> {
        let words = expect_words(cells, self.size)?;
        let mut regs = words.to_vec();
        if self.wordswap {
            regs.reverse();
        }
        let mut bytes: Vec<u8> = regs
            .iter()
            .map(|&reg| {
                if self.byteswap {
                    (reg >> 8) as u8
                } else {
                    reg as u8
                }
            })
            .collect();
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn pack(&self, payload: &str, cells: &mut CacheCells<'_>) -> Result<(), CodecError> {
        let words = expect_words_mut(cells, self.size)?;
        let bytes = payload.as_bytes();
        let mut regs: Vec<u16> = (0..self.size)
            .map(|i| {
                let c = bytes.get(i).copied().unwrap_or(0) as u16;
                if self.byteswap {
                    c << 8
                } else {
                    c
                }
            })
            .collect();
        if self.wordswap {
            regs.reverse();
        }
        words.copy_from_slice(&regs);
        Ok(())
    }
}
