// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{ByteOrder, LittleEndian};

use crate::base::{DecodeValue, EncodeValue};
use crate::error::{DecodeError, EncodeError};
use crate::reader::Reader;
use crate::tag::{ValueTag, MAX_PAYLOAD_LEN};
use crate::writer::Writer;

/// Dynamically typed BSATN value, one arm per wire tag.
///
/// Server messages carry schema-less payloads; this sum type lets the
/// client traverse them without compile-time knowledge of their shape.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    U128(u128),
    I128(i128),
    U256([u8; 32]),
    I256([u8; 32]),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Array(Vec<Value>),
    OptionNone,
    OptionSome(Box<Value>),
    /// Named fields in declaration order.
    Product(Vec<(String, Value)>),
    /// Variant index plus payload.
    Sum(u32, Box<Value>),
}

impl Value {
    /// Wire tag of this value.
    #[must_use]
    pub const fn tag(&self) -> ValueTag {
        match self {
            Self::Bool(false) => ValueTag::BoolFalse,
            Self::Bool(true) => ValueTag::BoolTrue,
            Self::U8(_) => ValueTag::U8,
            Self::I8(_) => ValueTag::I8,
            Self::U16(_) => ValueTag::U16,
            Self::I16(_) => ValueTag::I16,
            Self::U32(_) => ValueTag::U32,
            Self::I32(_) => ValueTag::I32,
            Self::U64(_) => ValueTag::U64,
            Self::I64(_) => ValueTag::I64,
            Self::U128(_) => ValueTag::U128,
            Self::I128(_) => ValueTag::I128,
            Self::U256(_) => ValueTag::U256,
            Self::I256(_) => ValueTag::I256,
            Self::F32(_) => ValueTag::F32,
            Self::F64(_) => ValueTag::F64,
            Self::String(_) => ValueTag::String,
            Self::Bytes(_) => ValueTag::Bytes,
            Self::List(_) => ValueTag::List,
            Self::Array(_) => ValueTag::Array,
            Self::OptionNone => ValueTag::OptionNone,
            Self::OptionSome(_) => ValueTag::OptionSome,
            Self::Product(_) => ValueTag::Product,
            Self::Sum(..) => ValueTag::Sum,
        }
    }

    /// Field value of a product by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Product(fields) => fields
                .iter()
                .find(|(field, _)| field == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }
}

impl EncodeValue for Value {
    fn encode(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        match self {
            Self::Bool(v) => writer.write_bool(*v),
            Self::U8(v) => writer.write_u8(*v),
            Self::I8(v) => writer.write_i8(*v),
            Self::U16(v) => writer.write_u16(*v),
            Self::I16(v) => writer.write_i16(*v),
            Self::U32(v) => writer.write_u32(*v),
            Self::I32(v) => writer.write_i32(*v),
            Self::U64(v) => writer.write_u64(*v),
            Self::I64(v) => writer.write_i64(*v),
            Self::U128(v) => writer.write_u128(*v),
            Self::I128(v) => writer.write_i128(*v),
            Self::U256(v) => writer.write_u256(v),
            Self::I256(v) => writer.write_i256(v),
            Self::F32(v) => writer.write_f32(*v),
            Self::F64(v) => writer.write_f64(*v),
            Self::String(v) => writer.write_string(v),
            Self::Bytes(v) => writer.write_byte_slice(v),
            Self::List(items) => {
                writer.write_list_header(items.len())?;
                for item in items {
                    item.encode(writer)?;
                }
                Ok(())
            }
            Self::Array(items) => {
                writer.write_array_header(items.len())?;
                for item in items {
                    item.encode(writer)?;
                }
                Ok(())
            }
            Self::OptionNone => writer.write_none(),
            Self::OptionSome(inner) => {
                writer.write_some_tag()?;
                inner.encode(writer)
            }
            Self::Product(fields) => {
                writer.write_product_header(fields.len())?;
                for (name, value) in fields {
                    writer.write_field_name(name)?;
                    value.encode(writer)?;
                }
                Ok(())
            }
            Self::Sum(variant, payload) => {
                writer.write_sum_header(*variant)?;
                payload.encode(writer)
            }
        }
    }
}

impl DecodeValue for Value {
    fn decode(reader: &mut Reader) -> Result<Self, DecodeError> {
        let tag = reader.read_tag()?;
        Self::decode_after_tag(reader, tag)
    }
}

impl Value {
    /// Decode the payload of a value whose tag byte was already consumed.
    ///
    /// # Errors
    ///
    /// Returns error if the payload bytes are invalid for `tag`.
    pub fn decode_after_tag(reader: &mut Reader, tag: ValueTag) -> Result<Self, DecodeError> {
        match tag {
            ValueTag::BoolFalse => Ok(Self::Bool(false)),
            ValueTag::BoolTrue => Ok(Self::Bool(true)),
            ValueTag::U8 => Ok(Self::U8(reader.read_byte()?)),
            ValueTag::I8 => Ok(Self::I8(reader.read_byte()? as i8)),
            ValueTag::U16 => Ok(Self::U16(LittleEndian::read_u16(reader.read_bytes(2)?))),
            ValueTag::I16 => Ok(Self::I16(LittleEndian::read_i16(reader.read_bytes(2)?))),
            ValueTag::U32 => Ok(Self::U32(reader.read_u32_raw()?)),
            ValueTag::I32 => Ok(Self::I32(LittleEndian::read_i32(reader.read_bytes(4)?))),
            ValueTag::U64 => Ok(Self::U64(LittleEndian::read_u64(reader.read_bytes(8)?))),
            ValueTag::I64 => Ok(Self::I64(LittleEndian::read_i64(reader.read_bytes(8)?))),
            ValueTag::U128 => Ok(Self::U128(LittleEndian::read_u128(reader.read_bytes(16)?))),
            ValueTag::I128 => Ok(Self::I128(LittleEndian::read_i128(reader.read_bytes(16)?))),
            ValueTag::U256 => {
                let mut out = [0_u8; 32];
                out.copy_from_slice(reader.read_bytes(32)?);
                Ok(Self::U256(out))
            }
            ValueTag::I256 => {
                let mut out = [0_u8; 32];
                out.copy_from_slice(reader.read_bytes(32)?);
                Ok(Self::I256(out))
            }
            ValueTag::F32 => {
                let value = LittleEndian::read_f32(reader.read_bytes(4)?);
                if value.is_finite() {
                    Ok(Self::F32(value))
                } else {
                    Err(DecodeError::InvalidFloat)
                }
            }
            ValueTag::F64 => {
                let value = LittleEndian::read_f64(reader.read_bytes(8)?);
                if value.is_finite() {
                    Ok(Self::F64(value))
                } else {
                    Err(DecodeError::InvalidFloat)
                }
            }
            ValueTag::String => {
                let len = reader.read_u32_raw()? as usize;
                if len > MAX_PAYLOAD_LEN {
                    return Err(DecodeError::PayloadTooLarge(len));
                }
                let bytes = reader.read_bytes(len)?;
                Ok(Self::String(std::str::from_utf8(bytes)?.to_string()))
            }
            ValueTag::Bytes => {
                let len = reader.read_u32_raw()? as usize;
                if len > MAX_PAYLOAD_LEN {
                    return Err(DecodeError::PayloadTooLarge(len));
                }
                Ok(Self::Bytes(reader.read_bytes(len)?.to_vec()))
            }
            ValueTag::List => {
                let count = reader.read_u32_raw()?;
                let mut items = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    items.push(Self::decode(reader)?);
                }
                Ok(Self::List(items))
            }
            ValueTag::Array => {
                let count = reader.read_u32_raw()?;
                let mut items = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    items.push(Self::decode(reader)?);
                }
                Ok(Self::Array(items))
            }
            ValueTag::OptionNone => Ok(Self::OptionNone),
            ValueTag::OptionSome => Ok(Self::OptionSome(Box::new(Self::decode(reader)?))),
            ValueTag::Product => {
                let field_count = reader.read_u32_raw()?;
                let mut fields = Vec::with_capacity(field_count.min(256) as usize);
                for _ in 0..field_count {
                    let name = reader.read_field_name()?;
                    fields.push((name, Self::decode(reader)?));
                }
                Ok(Self::Product(fields))
            }
            ValueTag::Sum => {
                let variant = reader.read_u32_raw()?;
                Ok(Self::Sum(variant, Box::new(Self::decode(reader)?)))
            }
        }
    }
}
