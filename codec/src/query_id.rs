// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::base::{DecodeValue, EncodeValue};
use crate::error::{DecodeError, EncodeError};
use crate::reader::Reader;
use crate::writer::Writer;

/// Client-minted identifier naming a subscription for its lifetime.
///
/// On the wire a query id is a one-field product `{ id: u32 }`.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
pub struct QueryId {
    id: u32,
}

impl QueryId {
    /// Wrap a numeric id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self { id }
    }

    /// Numeric id.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "QueryId({})", self.id)
    }
}

impl EncodeValue for QueryId {
    fn encode(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        writer.write_product_header(1)?;
        writer.write_field_name("id")?;
        writer.write_u32(self.id)
    }
}

impl DecodeValue for QueryId {
    fn decode(reader: &mut Reader) -> Result<Self, DecodeError> {
        let field_count = reader.read_product_header()?;
        let mut id = 0;
        for _ in 0..field_count {
            let name = reader.read_field_name()?;
            if name == "id" {
                id = reader.read_u32()?;
            } else {
                log::trace!("Skip unknown query id field: {name}");
                reader.skip_value()?;
            }
        }
        Ok(Self { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let query_id = QueryId::new(42);
        let mut writer = Writer::new();
        query_id.encode(&mut writer).unwrap();
        let bytes = writer.into_bytes().unwrap();
        let mut reader = Reader::new(&bytes);
        assert_eq!(QueryId::decode(&mut reader), Ok(query_id));
    }

    #[test]
    fn test_json_shape() {
        let query_id = QueryId::new(7);
        let json = serde_json::to_string(&query_id).unwrap();
        assert_eq!(json, r#"{"id":7}"#);
    }
}
