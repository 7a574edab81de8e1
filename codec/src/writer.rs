// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{LittleEndian, WriteBytesExt};
use bytes::Bytes;

use crate::error::EncodeError;
use crate::tag::{ValueTag, MAX_FIELD_NAME_LEN, MAX_PAYLOAD_LEN};

/// Append-only BSATN byte stream builder.
///
/// The writer records the first error it hits; every later write returns a
/// clone of that error and leaves the buffer untouched. The emitted byte
/// stream is only valid if no error was recorded, which
/// [`Writer::into_bytes`] enforces.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
    error: Option<EncodeError>,
}

impl Writer {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with `capacity` bytes preallocated.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            error: None,
        }
    }

    /// First error recorded by this writer, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&EncodeError> {
        self.error.as_ref()
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn bytes_written(&self) -> usize {
        self.buf.len()
    }

    /// Finish writing and take the byte stream.
    ///
    /// # Errors
    ///
    /// Returns the recorded error if any write failed; the buffer is
    /// discarded in that case.
    pub fn into_bytes(self) -> Result<Bytes, EncodeError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(Bytes::from(self.buf)),
        }
    }

    fn fail(&mut self, err: EncodeError) -> EncodeError {
        if self.error.is_none() {
            self.error = Some(err.clone());
        }
        err
    }

    fn check_sticky(&self) -> Result<(), EncodeError> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn push_tag(&mut self, tag: ValueTag) {
        self.buf.push(tag.byte());
    }

    /// Write a tagged boolean.
    ///
    /// # Errors
    ///
    /// Returns the sticky error if one was recorded.
    pub fn write_bool(&mut self, value: bool) -> Result<(), EncodeError> {
        self.check_sticky()?;
        self.push_tag(if value {
            ValueTag::BoolTrue
        } else {
            ValueTag::BoolFalse
        });
        Ok(())
    }

    /// Write a tagged u8.
    ///
    /// # Errors
    ///
    /// Returns the sticky error if one was recorded.
    pub fn write_u8(&mut self, value: u8) -> Result<(), EncodeError> {
        self.check_sticky()?;
        self.push_tag(ValueTag::U8);
        self.buf.push(value);
        Ok(())
    }

    /// Write a tagged i8.
    ///
    /// # Errors
    ///
    /// Returns the sticky error if one was recorded.
    pub fn write_i8(&mut self, value: i8) -> Result<(), EncodeError> {
        self.check_sticky()?;
        self.push_tag(ValueTag::I8);
        self.buf.push(value as u8);
        Ok(())
    }

    /// Write a tagged u16.
    ///
    /// # Errors
    ///
    /// Returns the sticky error if one was recorded.
    pub fn write_u16(&mut self, value: u16) -> Result<(), EncodeError> {
        self.check_sticky()?;
        self.push_tag(ValueTag::U16);
        let _ = self.buf.write_u16::<LittleEndian>(value);
        Ok(())
    }

    /// Write a tagged i16.
    ///
    /// # Errors
    ///
    /// Returns the sticky error if one was recorded.
    pub fn write_i16(&mut self, value: i16) -> Result<(), EncodeError> {
        self.check_sticky()?;
        self.push_tag(ValueTag::I16);
        let _ = self.buf.write_i16::<LittleEndian>(value);
        Ok(())
    }

    /// Write a tagged u32.
    ///
    /// # Errors
    ///
    /// Returns the sticky error if one was recorded.
    pub fn write_u32(&mut self, value: u32) -> Result<(), EncodeError> {
        self.check_sticky()?;
        self.push_tag(ValueTag::U32);
        let _ = self.buf.write_u32::<LittleEndian>(value);
        Ok(())
    }

    /// Write a tagged i32.
    ///
    /// # Errors
    ///
    /// Returns the sticky error if one was recorded.
    pub fn write_i32(&mut self, value: i32) -> Result<(), EncodeError> {
        self.check_sticky()?;
        self.push_tag(ValueTag::I32);
        let _ = self.buf.write_i32::<LittleEndian>(value);
        Ok(())
    }

    /// Write a tagged u64.
    ///
    /// # Errors
    ///
    /// Returns the sticky error if one was recorded.
    pub fn write_u64(&mut self, value: u64) -> Result<(), EncodeError> {
        self.check_sticky()?;
        self.push_tag(ValueTag::U64);
        let _ = self.buf.write_u64::<LittleEndian>(value);
        Ok(())
    }

    /// Write a tagged i64.
    ///
    /// # Errors
    ///
    /// Returns the sticky error if one was recorded.
    pub fn write_i64(&mut self, value: i64) -> Result<(), EncodeError> {
        self.check_sticky()?;
        self.push_tag(ValueTag::I64);
        let _ = self.buf.write_i64::<LittleEndian>(value);
        Ok(())
    }

    /// Write a tagged u128.
    ///
    /// # Errors
    ///
    /// Returns the sticky error if one was recorded.
    pub fn write_u128(&mut self, value: u128) -> Result<(), EncodeError> {
        self.check_sticky()?;
        self.push_tag(ValueTag::U128);
        let _ = self.buf.write_u128::<LittleEndian>(value);
        Ok(())
    }

    /// Write a tagged i128.
    ///
    /// # Errors
    ///
    /// Returns the sticky error if one was recorded.
    pub fn write_i128(&mut self, value: i128) -> Result<(), EncodeError> {
        self.check_sticky()?;
        self.push_tag(ValueTag::I128);
        let _ = self.buf.write_i128::<LittleEndian>(value);
        Ok(())
    }

    /// Write a tagged u256 from its 32-byte little-endian form.
    ///
    /// # Errors
    ///
    /// Returns the sticky error if one was recorded.
    pub fn write_u256(&mut self, value: &[u8; 32]) -> Result<(), EncodeError> {
        self.check_sticky()?;
        self.push_tag(ValueTag::U256);
        self.buf.extend_from_slice(value);
        Ok(())
    }

    /// Write a tagged i256 from its 32-byte little-endian form.
    ///
    /// # Errors
    ///
    /// Returns the sticky error if one was recorded.
    pub fn write_i256(&mut self, value: &[u8; 32]) -> Result<(), EncodeError> {
        self.check_sticky()?;
        self.push_tag(ValueTag::I256);
        self.buf.extend_from_slice(value);
        Ok(())
    }

    /// Write a tagged f32.
    ///
    /// # Errors
    ///
    /// Returns error if the value is NaN or infinite.
    pub fn write_f32(&mut self, value: f32) -> Result<(), EncodeError> {
        self.check_sticky()?;
        if !value.is_finite() {
            return Err(self.fail(EncodeError::InvalidFloat));
        }
        self.push_tag(ValueTag::F32);
        let _ = self.buf.write_f32::<LittleEndian>(value);
        Ok(())
    }

    /// Write a tagged f64.
    ///
    /// # Errors
    ///
    /// Returns error if the value is NaN or infinite.
    pub fn write_f64(&mut self, value: f64) -> Result<(), EncodeError> {
        self.check_sticky()?;
        if !value.is_finite() {
            return Err(self.fail(EncodeError::InvalidFloat));
        }
        self.push_tag(ValueTag::F64);
        let _ = self.buf.write_f64::<LittleEndian>(value);
        Ok(())
    }

    /// Write a tagged UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns error if the string exceeds the 1 MiB payload cap.
    pub fn write_string(&mut self, value: &str) -> Result<(), EncodeError> {
        self.check_sticky()?;
        let bytes = value.as_bytes();
        if bytes.len() > MAX_PAYLOAD_LEN {
            return Err(self.fail(EncodeError::PayloadTooLarge(bytes.len())));
        }
        self.push_tag(ValueTag::String);
        let _ = self.buf.write_u32::<LittleEndian>(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Write a tagged byte slice.
    ///
    /// # Errors
    ///
    /// Returns error if the slice exceeds the 1 MiB payload cap.
    pub fn write_byte_slice(&mut self, value: &[u8]) -> Result<(), EncodeError> {
        self.check_sticky()?;
        if value.len() > MAX_PAYLOAD_LEN {
            return Err(self.fail(EncodeError::PayloadTooLarge(value.len())));
        }
        self.push_tag(ValueTag::Bytes);
        let _ = self.buf.write_u32::<LittleEndian>(value.len() as u32);
        self.buf.extend_from_slice(value);
        Ok(())
    }

    /// Write the none variant of an option.
    ///
    /// # Errors
    ///
    /// Returns the sticky error if one was recorded.
    pub fn write_none(&mut self) -> Result<(), EncodeError> {
        self.check_sticky()?;
        self.push_tag(ValueTag::OptionNone);
        Ok(())
    }

    /// Write the some tag of an option. Caller writes the payload next.
    ///
    /// # Errors
    ///
    /// Returns the sticky error if one was recorded.
    pub fn write_some_tag(&mut self) -> Result<(), EncodeError> {
        self.check_sticky()?;
        self.push_tag(ValueTag::OptionSome);
        Ok(())
    }

    /// Write a list header. Caller writes `count` values next.
    ///
    /// # Errors
    ///
    /// Returns error if `count` does not fit the u32 prefix.
    pub fn write_list_header(&mut self, count: usize) -> Result<(), EncodeError> {
        self.write_counted_header(ValueTag::List, count)
    }

    /// Write an array header. Caller writes `count` values next.
    ///
    /// # Errors
    ///
    /// Returns error if `count` does not fit the u32 prefix.
    pub fn write_array_header(&mut self, count: usize) -> Result<(), EncodeError> {
        self.write_counted_header(ValueTag::Array, count)
    }

    /// Write a product header. Caller writes `count` named fields next.
    ///
    /// # Errors
    ///
    /// Returns error if `count` does not fit the u32 prefix.
    pub fn write_product_header(&mut self, count: usize) -> Result<(), EncodeError> {
        self.write_counted_header(ValueTag::Product, count)
    }

    /// Write a sum header. Caller writes the payload value next.
    ///
    /// # Errors
    ///
    /// Returns the sticky error if one was recorded.
    pub fn write_sum_header(&mut self, variant: u32) -> Result<(), EncodeError> {
        self.check_sticky()?;
        self.push_tag(ValueTag::Sum);
        let _ = self.buf.write_u32::<LittleEndian>(variant);
        Ok(())
    }

    /// Write a product field name: u8 length followed by UTF-8 bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the name is longer than 255 bytes.
    pub fn write_field_name(&mut self, name: &str) -> Result<(), EncodeError> {
        self.check_sticky()?;
        let bytes = name.as_bytes();
        if bytes.len() > MAX_FIELD_NAME_LEN {
            return Err(self.fail(EncodeError::FieldNameTooLong(bytes.len())));
        }
        self.buf.push(bytes.len() as u8);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn write_counted_header(&mut self, tag: ValueTag, count: usize) -> Result<(), EncodeError> {
        self.check_sticky()?;
        let Ok(count) = u32::try_from(count) else {
            return Err(self.fail(EncodeError::TooManyElements(count)));
        };
        self.push_tag(tag);
        let _ = self.buf.write_u32::<LittleEndian>(count);
        Ok(())
    }
}
