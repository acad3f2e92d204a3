//! Binary codec for graph descriptions.
//!
//! Encoding happens on the control thread with a [`WireWriter`]; decoding happens on the render
//! thread with a [`WireReader`]. Both ends are the same build, so the format carries no version,
//! but every read is bounds checked and every count is validated against the bytes that remain.
//! A malformed buffer always yields a [`WireError`].
//!
//! All integers and floats are fixed width, little endian, with no padding.

use crate::error::WireError;

/// Append-only byte buffer for encoding.
#[derive(Default, Debug, Clone)]
pub struct WireWriter {
    bytes: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn append_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn append_bool(&mut self, value: bool) {
        self.append_u8(value as u8);
    }

    pub fn append_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn append_u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn append_f32(&mut self, value: f32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn append_f64(&mut self, value: f64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// `None` is written as a zero flag byte, `Some(v)` as a one followed by `v`.
    pub fn append_optional_u64(&mut self, value: Option<u64>) {
        match value {
            Some(v) => {
                self.append_u8(1);
                self.append_u64(v);
            }
            None => self.append_u8(0),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Overwrite a previously appended `u32` at `offset`.
    pub(crate) fn patch_u32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Bounds-checked cursor over an encoded buffer.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if len > self.remaining() {
            return Err(WireError::Truncated {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self, field: &'static str) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(WireError::InvalidEnum { field, value }),
        }
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    /// Read an `f32` and reject NaN and infinities.
    pub fn read_finite_f32(&mut self, field: &'static str) -> Result<f32, WireError> {
        let value = self.read_f32()?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(WireError::NonFinite(field))
        }
    }

    pub fn read_finite_f64(&mut self, field: &'static str) -> Result<f64, WireError> {
        let value = self.read_f64()?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(WireError::NonFinite(field))
        }
    }

    pub fn read_optional_u64(&mut self, field: &'static str) -> Result<Option<u64>, WireError> {
        if self.read_bool(field)? {
            Ok(Some(self.read_u64()?))
        } else {
            Ok(None)
        }
    }

    /// Read an element count and check that `count * min_element_size` bytes remain.
    pub fn read_count(&mut self, min_element_size: usize) -> Result<usize, WireError> {
        let count = self.read_u32()?;
        let needed = (count as usize).checked_mul(min_element_size);
        match needed {
            Some(needed) if needed <= self.remaining() => Ok(count as usize),
            _ => Err(WireError::CountOutOfRange {
                count,
                remaining: self.remaining(),
            }),
        }
    }

    /// Split off a sub-reader over the next `len` bytes.
    pub fn sub_reader(&mut self, len: usize) -> Result<WireReader<'a>, WireError> {
        Ok(WireReader::new(self.take(len)?))
    }
}

/// A value with a self-contained wire representation.
///
/// Every node descriptor implements this; the update envelope frames each payload with its
/// node type tag, node id and byte length.
pub trait WirePayload: Sized {
    fn encode_wire_payload(&self, writer: &mut WireWriter);

    fn decode_wire_payload(reader: &mut WireReader<'_>) -> Result<Self, WireError>;
}
