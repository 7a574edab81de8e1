// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

use crate::base::{DecodeValue, EncodeValue};
use crate::error::{DecodeError, EncodeError};
use crate::identity::{decode_hex, encode_hex};
use crate::reader::Reader;
use crate::writer::Writer;

/// Stable 128-bit identifier the server assigns to a physical connection.
///
/// On the wire a connection id is a fixed 16-byte value carrying the
/// u128 tag.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct ConnectionId {
    data: [u8; 16],
}

impl ConnectionId {
    pub const LEN: usize = 16;

    /// Wrap 16 raw bytes.
    #[must_use]
    pub const fn new(data: [u8; 16]) -> Self {
        Self { data }
    }

    /// The all-zero connection id, used before the handshake assigns one.
    #[must_use]
    pub const fn zero() -> Self {
        Self { data: [0; 16] }
    }

    /// Wrap a byte slice.
    ///
    /// # Errors
    ///
    /// Returns error if the slice is not exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != Self::LEN {
            return Err(DecodeError::InvalidLength {
                expected: Self::LEN,
                got: bytes.len(),
            });
        }
        let mut data = [0_u8; 16];
        data.copy_from_slice(bytes);
        Ok(Self { data })
    }

    /// Build from two u64 halves, high first.
    #[must_use]
    pub fn from_u64_pair(high: u64, low: u64) -> Self {
        let mut data = [0_u8; 16];
        LittleEndian::write_u64(&mut data[..8], high);
        LittleEndian::write_u64(&mut data[8..], low);
        Self { data }
    }

    /// Split into two u64 halves, high first.
    #[must_use]
    pub fn as_u64_pair(&self) -> (u64, u64) {
        (
            LittleEndian::read_u64(&self.data[..8]),
            LittleEndian::read_u64(&self.data[8..]),
        )
    }

    /// Parse a 32-character hex string.
    ///
    /// # Errors
    ///
    /// Returns error if the string is not valid hex of the right length.
    pub fn from_hex(hex: &str) -> Result<Self, DecodeError> {
        let bytes = decode_hex(hex)?;
        Self::from_slice(&bytes)
    }

    /// Hex form of this connection id.
    #[must_use]
    pub fn to_hex(&self) -> String {
        encode_hex(&self.data)
    }

    /// Raw bytes of this connection id.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.data
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnectionId({})", self.to_hex())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl EncodeValue for ConnectionId {
    fn encode(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        writer.write_u128(u128::from_le_bytes(self.data))
    }
}

impl DecodeValue for ConnectionId {
    fn decode(reader: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self::new(reader.read_u128()?.to_le_bytes()))
    }
}
