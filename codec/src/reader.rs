// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::DecodeError;
use crate::tag::{ValueTag, MAX_PAYLOAD_LEN};

/// Cursor over a BSATN byte slice.
///
/// The reader records the first error it hits; every later read returns a
/// clone of that error without consuming further bytes. An optional byte
/// limit constrains reads while decoding embedded length-delimited
/// sub-messages.
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
    error: Option<DecodeError>,
    limit: Option<usize>,
}

impl<'a> Reader<'a> {
    /// Create a new reader over `data`.
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            error: None,
            limit: None,
        }
    }

    /// First error recorded by this reader, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&DecodeError> {
        self.error.as_ref()
    }

    /// Total number of bytes successfully consumed.
    #[must_use]
    pub const fn bytes_read(&self) -> usize {
        self.offset
    }

    /// Number of bytes left before the end of buffer or the active limit.
    #[must_use]
    pub fn remaining(&self) -> usize {
        let rest = self.data.len() - self.offset;
        match self.limit {
            Some(limit) => rest.min(limit),
            None => rest,
        }
    }

    /// Constrain the next `len` bytes as a sub-message window.
    ///
    /// Reads beyond the window fail with [`DecodeError::LimitExceeded`].
    pub fn push_limit(&mut self, len: usize) {
        self.limit = Some(len);
    }

    /// Drop the active sub-message window.
    pub fn clear_limit(&mut self) {
        self.limit = None;
    }

    fn fail(&mut self, err: DecodeError) -> DecodeError {
        if self.error.is_none() {
            self.error = Some(err.clone());
        }
        err
    }

    fn check_sticky(&self) -> Result<(), DecodeError> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Read one raw byte.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer or the active limit is exhausted.
    pub fn read_byte(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Read exactly `len` raw bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer or the active limit is exhausted.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.check_sticky()?;
        if let Some(limit) = self.limit {
            if len > limit {
                return Err(self.fail(DecodeError::LimitExceeded));
            }
        }
        if self.offset + len > self.data.len() {
            return Err(self.fail(DecodeError::UnexpectedEof));
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        if let Some(limit) = self.limit.as_mut() {
            *limit -= len;
        }
        Ok(bytes)
    }

    /// Read and validate the next tag byte.
    ///
    /// # Errors
    ///
    /// Returns error if the byte does not name a known value type.
    pub fn read_tag(&mut self) -> Result<ValueTag, DecodeError> {
        let byte = self.read_byte()?;
        match ValueTag::try_from(byte) {
            Ok(tag) => Ok(tag),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Read the next tag byte and require it to be `expected`.
    ///
    /// # Errors
    ///
    /// Returns error if a different tag is found.
    pub fn expect_tag(&mut self, expected: ValueTag) -> Result<(), DecodeError> {
        let tag = self.read_tag()?;
        if tag == expected {
            Ok(())
        } else {
            Err(self.fail(DecodeError::InvalidTag(tag.byte())))
        }
    }

    /// Read a tagged boolean.
    ///
    /// # Errors
    ///
    /// Returns error if the tag is not one of the boolean tags.
    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        let tag = self.read_tag()?;
        match tag {
            ValueTag::BoolFalse => Ok(false),
            ValueTag::BoolTrue => Ok(true),
            other => Err(self.fail(DecodeError::InvalidTag(other.byte()))),
        }
    }

    /// Read a tagged u8.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch or short buffer.
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        self.expect_tag(ValueTag::U8)?;
        self.read_byte()
    }

    /// Read a tagged i8.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch or short buffer.
    pub fn read_i8(&mut self) -> Result<i8, DecodeError> {
        self.expect_tag(ValueTag::I8)?;
        Ok(self.read_byte()? as i8)
    }

    /// Read a tagged u16.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch or short buffer.
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        self.expect_tag(ValueTag::U16)?;
        Ok(LittleEndian::read_u16(self.read_bytes(2)?))
    }

    /// Read a tagged i16.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch or short buffer.
    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        self.expect_tag(ValueTag::I16)?;
        Ok(LittleEndian::read_i16(self.read_bytes(2)?))
    }

    /// Read a tagged u32.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch or short buffer.
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.expect_tag(ValueTag::U32)?;
        self.read_u32_raw()
    }

    /// Read a tagged i32.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch or short buffer.
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        self.expect_tag(ValueTag::I32)?;
        Ok(LittleEndian::read_i32(self.read_bytes(4)?))
    }

    /// Read a tagged u64.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch or short buffer.
    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        self.expect_tag(ValueTag::U64)?;
        Ok(LittleEndian::read_u64(self.read_bytes(8)?))
    }

    /// Read a tagged i64.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch or short buffer.
    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        self.expect_tag(ValueTag::I64)?;
        Ok(LittleEndian::read_i64(self.read_bytes(8)?))
    }

    /// Read a tagged u128.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch or short buffer.
    pub fn read_u128(&mut self) -> Result<u128, DecodeError> {
        self.expect_tag(ValueTag::U128)?;
        Ok(LittleEndian::read_u128(self.read_bytes(16)?))
    }

    /// Read a tagged i128.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch or short buffer.
    pub fn read_i128(&mut self) -> Result<i128, DecodeError> {
        self.expect_tag(ValueTag::I128)?;
        Ok(LittleEndian::read_i128(self.read_bytes(16)?))
    }

    /// Read the 32-byte payload of a tagged u256.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch or short buffer.
    pub fn read_u256_bytes(&mut self) -> Result<[u8; 32], DecodeError> {
        self.expect_tag(ValueTag::U256)?;
        let bytes = self.read_bytes(32)?;
        let mut out = [0_u8; 32];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Read the 32-byte payload of a tagged i256.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch or short buffer.
    pub fn read_i256_bytes(&mut self) -> Result<[u8; 32], DecodeError> {
        self.expect_tag(ValueTag::I256)?;
        let bytes = self.read_bytes(32)?;
        let mut out = [0_u8; 32];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Read a tagged f32, rejecting NaN and infinities.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch, short buffer or invalid float.
    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        self.expect_tag(ValueTag::F32)?;
        let value = LittleEndian::read_f32(self.read_bytes(4)?);
        if value.is_finite() {
            Ok(value)
        } else {
            Err(self.fail(DecodeError::InvalidFloat))
        }
    }

    /// Read a tagged f64, rejecting NaN and infinities.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch, short buffer or invalid float.
    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        self.expect_tag(ValueTag::F64)?;
        let value = LittleEndian::read_f64(self.read_bytes(8)?);
        if value.is_finite() {
            Ok(value)
        } else {
            Err(self.fail(DecodeError::InvalidFloat))
        }
    }

    /// Read a tagged UTF-8 string.
    ///
    /// The payload cap is checked before any string bytes are consumed.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch, oversized payload or invalid UTF-8.
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        self.expect_tag(ValueTag::String)?;
        let len = self.read_u32_raw()? as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(self.fail(DecodeError::PayloadTooLarge(len)));
        }
        let bytes = self.read_bytes(len)?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_string()),
            Err(_) => Err(self.fail(DecodeError::InvalidUtf8)),
        }
    }

    /// Read a tagged byte slice.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch or oversized payload.
    pub fn read_byte_slice(&mut self) -> Result<&'a [u8], DecodeError> {
        self.expect_tag(ValueTag::Bytes)?;
        let len = self.read_u32_raw()? as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(self.fail(DecodeError::PayloadTooLarge(len)));
        }
        self.read_bytes(len)
    }

    /// Read a list header, returning the element count.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch or short buffer.
    pub fn read_list_header(&mut self) -> Result<u32, DecodeError> {
        self.expect_tag(ValueTag::List)?;
        self.read_u32_raw()
    }

    /// Read an array header, returning the element count.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch or short buffer.
    pub fn read_array_header(&mut self) -> Result<u32, DecodeError> {
        self.expect_tag(ValueTag::Array)?;
        self.read_u32_raw()
    }

    /// Read a product header, returning the field count.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch or short buffer.
    pub fn read_product_header(&mut self) -> Result<u32, DecodeError> {
        self.expect_tag(ValueTag::Product)?;
        self.read_u32_raw()
    }

    /// Read a sum header, returning the variant index.
    ///
    /// # Errors
    ///
    /// Returns error on tag mismatch or short buffer.
    pub fn read_sum_header(&mut self) -> Result<u32, DecodeError> {
        self.expect_tag(ValueTag::Sum)?;
        self.read_u32_raw()
    }

    /// Read a product field name: u8 length followed by UTF-8 bytes.
    ///
    /// # Errors
    ///
    /// Returns error on short buffer or invalid UTF-8.
    pub fn read_field_name(&mut self) -> Result<String, DecodeError> {
        let len = self.read_byte()? as usize;
        let bytes = self.read_bytes(len)?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_string()),
            Err(_) => Err(self.fail(DecodeError::InvalidUtf8)),
        }
    }

    /// Read a raw little-endian u32 without a tag byte.
    ///
    /// Length prefixes and headers use this layout.
    ///
    /// # Errors
    ///
    /// Returns error on short buffer.
    pub fn read_u32_raw(&mut self) -> Result<u32, DecodeError> {
        Ok(LittleEndian::read_u32(self.read_bytes(4)?))
    }

    /// Skip one complete value, tag byte included, without constructing it.
    ///
    /// Used by product decoders to tolerate unknown field names.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes do not form a valid value.
    pub fn skip_value(&mut self) -> Result<(), DecodeError> {
        let tag = self.read_tag()?;
        match tag {
            ValueTag::BoolFalse | ValueTag::BoolTrue | ValueTag::OptionNone => Ok(()),
            ValueTag::U8 | ValueTag::I8 => self.read_bytes(1).map(drop),
            ValueTag::U16 | ValueTag::I16 => self.read_bytes(2).map(drop),
            ValueTag::U32 | ValueTag::I32 | ValueTag::F32 => self.read_bytes(4).map(drop),
            ValueTag::U64 | ValueTag::I64 | ValueTag::F64 => self.read_bytes(8).map(drop),
            ValueTag::U128 | ValueTag::I128 => self.read_bytes(16).map(drop),
            ValueTag::U256 | ValueTag::I256 => self.read_bytes(32).map(drop),
            ValueTag::String | ValueTag::Bytes => {
                let len = self.read_u32_raw()? as usize;
                if len > MAX_PAYLOAD_LEN {
                    return Err(self.fail(DecodeError::PayloadTooLarge(len)));
                }
                self.read_bytes(len).map(drop)
            }
            ValueTag::List | ValueTag::Array => {
                let count = self.read_u32_raw()?;
                for _ in 0..count {
                    self.skip_value()?;
                }
                Ok(())
            }
            ValueTag::Product => {
                let field_count = self.read_u32_raw()?;
                for _ in 0..field_count {
                    let name_len = self.read_byte()? as usize;
                    self.read_bytes(name_len)?;
                    self.skip_value()?;
                }
                Ok(())
            }
            ValueTag::Sum => {
                let _variant = self.read_u32_raw()?;
                self.skip_value()
            }
            ValueTag::OptionSome => self.skip_value(),
        }
    }
}
