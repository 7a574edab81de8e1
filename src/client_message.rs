// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::Bytes;
use serde_json::json;

use codec::{EncodeValue, QueryId, Writer};

use crate::connect_options::Protocol;
use crate::error::Error;

/// Flags controlling how the server reports a reducer run back.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CallReducerFlags {
    /// Full database update after the reducer executes.
    #[default]
    FullUpdate = 0,

    /// Suppress the success notification for this call.
    NoSuccessNotify = 1,
}

impl CallReducerFlags {
    #[must_use]
    pub const fn value(self) -> u8 {
        self as u8
    }
}

/// Client to server message variants.
///
/// In the binary protocol a message is a tagged sum over named-field
/// products; in the JSON protocol it is a single-key tagged object.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    /// Request a reducer run.
    CallReducer {
        reducer: String,
        args: Bytes,
        request_id: u32,
        flags: CallReducerFlags,
    },

    /// Register a set of queries for subscription updates.
    Subscribe {
        query_strings: Vec<String>,
        request_id: u32,
    },

    /// Register one query under a client-minted query id.
    SubscribeSingle {
        query: String,
        request_id: u32,
        query_id: QueryId,
    },

    /// Register several queries under one client-minted query id.
    SubscribeMulti {
        query_strings: Vec<String>,
        request_id: u32,
        query_id: QueryId,
    },

    /// Remove a single-query subscription.
    Unsubscribe { request_id: u32, query_id: QueryId },

    /// Remove a multi-query subscription.
    UnsubscribeMulti { request_id: u32, query_id: QueryId },

    /// A one-off query submission.
    OneOffQuery {
        message_id: [u8; 16],
        query_string: String,
    },
}

/// Rewrite a bare table name into the SQL the server expects.
///
/// Queries that already look like SQL pass through untouched. The rewrite
/// happens uniformly before encoding, for both wire protocols.
#[must_use]
pub fn normalize_query(query: &str) -> String {
    let trimmed = query.trim();
    let lowered = trimmed.to_lowercase();
    let is_bare_name = !trimmed.is_empty()
        && !trimmed.contains(' ')
        && !["select", "from", "where", "join"]
            .iter()
            .any(|keyword| lowered.contains(keyword));
    if is_bare_name {
        format!("SELECT * FROM {trimmed}")
    } else {
        trimmed.to_string()
    }
}

impl ClientMessage {
    /// Sum variant index of this message in the binary protocol.
    #[must_use]
    pub const fn variant(&self) -> u32 {
        match self {
            Self::CallReducer { .. } => 0,
            Self::Subscribe { .. } => 1,
            Self::SubscribeSingle { .. } => 2,
            Self::SubscribeMulti { .. } => 3,
            Self::Unsubscribe { .. } => 4,
            Self::UnsubscribeMulti { .. } => 5,
            Self::OneOffQuery { .. } => 6,
        }
    }

    /// Encode for the negotiated wire protocol.
    ///
    /// # Errors
    ///
    /// Returns error if a payload violates a wire limit.
    pub fn encode(&self, protocol: Protocol) -> Result<Vec<u8>, Error> {
        match protocol {
            Protocol::Bsatn => Ok(self.encode_bsatn()?.to_vec()),
            Protocol::Json => Ok(self.encode_json().into_bytes()),
        }
    }

    /// Encode as a BSATN tagged sum.
    ///
    /// # Errors
    ///
    /// Returns error if a payload violates a wire limit.
    pub fn encode_bsatn(&self) -> Result<Bytes, Error> {
        let mut writer = Writer::new();
        writer.write_sum_header(self.variant())?;
        match self {
            Self::CallReducer {
                reducer,
                args,
                request_id,
                flags,
            } => {
                writer.write_product_header(4)?;
                writer.write_field_name("reducer")?;
                writer.write_string(reducer)?;
                writer.write_field_name("args")?;
                writer.write_byte_slice(args)?;
                writer.write_field_name("request_id")?;
                writer.write_u32(*request_id)?;
                writer.write_field_name("flags")?;
                writer.write_u8(flags.value())?;
            }
            Self::Subscribe {
                query_strings,
                request_id,
            } => {
                writer.write_product_header(2)?;
                writer.write_field_name("query_strings")?;
                writer.write_array_header(query_strings.len())?;
                for query in query_strings {
                    writer.write_string(query)?;
                }
                writer.write_field_name("request_id")?;
                writer.write_u32(*request_id)?;
            }
            Self::SubscribeSingle {
                query,
                request_id,
                query_id,
            } => {
                writer.write_product_header(3)?;
                writer.write_field_name("query")?;
                writer.write_string(query)?;
                writer.write_field_name("request_id")?;
                writer.write_u32(*request_id)?;
                writer.write_field_name("query_id")?;
                query_id.encode(&mut writer)?;
            }
            Self::SubscribeMulti {
                query_strings,
                request_id,
                query_id,
            } => {
                writer.write_product_header(3)?;
                writer.write_field_name("query_strings")?;
                writer.write_array_header(query_strings.len())?;
                for query in query_strings {
                    writer.write_string(query)?;
                }
                writer.write_field_name("request_id")?;
                writer.write_u32(*request_id)?;
                writer.write_field_name("query_id")?;
                query_id.encode(&mut writer)?;
            }
            Self::Unsubscribe {
                request_id,
                query_id,
            }
            | Self::UnsubscribeMulti {
                request_id,
                query_id,
            } => {
                writer.write_product_header(2)?;
                writer.write_field_name("request_id")?;
                writer.write_u32(*request_id)?;
                writer.write_field_name("query_id")?;
                query_id.encode(&mut writer)?;
            }
            Self::OneOffQuery {
                message_id,
                query_string,
            } => {
                writer.write_product_header(2)?;
                writer.write_field_name("message_id")?;
                writer.write_byte_slice(message_id)?;
                writer.write_field_name("query_string")?;
                writer.write_string(query_string)?;
            }
        }
        Ok(writer.into_bytes()?)
    }

    /// Encode as a JSON tagged object.
    #[must_use]
    pub fn encode_json(&self) -> String {
        let value = match self {
            Self::CallReducer {
                reducer,
                args,
                request_id,
                flags,
            } => json!({
                "CallReducer": {
                    "reducer": reducer,
                    "args": String::from_utf8_lossy(args),
                    "request_id": request_id,
                    "flags": flags.value(),
                }
            }),
            Self::Subscribe {
                query_strings,
                request_id,
            } => json!({
                "Subscribe": {
                    "query_strings": query_strings,
                    "request_id": request_id,
                }
            }),
            Self::SubscribeSingle {
                query,
                request_id,
                query_id,
            } => json!({
                "SubscribeSingle": {
                    "query": query,
                    "request_id": request_id,
                    "query_id": query_id,
                }
            }),
            Self::SubscribeMulti {
                query_strings,
                request_id,
                query_id,
            } => json!({
                "SubscribeMulti": {
                    "query_strings": query_strings,
                    "request_id": request_id,
                    "query_id": query_id,
                }
            }),
            Self::Unsubscribe {
                request_id,
                query_id,
            } => json!({
                "Unsubscribe": {
                    "request_id": request_id,
                    "query_id": query_id,
                }
            }),
            Self::UnsubscribeMulti {
                request_id,
                query_id,
            } => json!({
                "UnsubscribeMulti": {
                    "request_id": request_id,
                    "query_id": query_id,
                }
            }),
            Self::OneOffQuery {
                message_id,
                query_string,
            } => json!({
                "OneOffQuery": {
                    "message_id": message_id.to_vec(),
                    "query_string": query_string,
                }
            }),
        };
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{DecodeValue, Reader, Value};

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("users"), "SELECT * FROM users");
        assert_eq!(
            normalize_query("SELECT * FROM users"),
            "SELECT * FROM users"
        );
        assert_eq!(
            normalize_query("select id from users where id > 3"),
            "select id from users where id > 3"
        );
        assert_eq!(normalize_query(""), "");
    }

    #[test]
    fn test_call_reducer_bsatn_shape() {
        let message = ClientMessage::CallReducer {
            reducer: "create_user".to_string(),
            args: Bytes::from_static(b"{}"),
            request_id: 9,
            flags: CallReducerFlags::FullUpdate,
        };
        let bytes = message.encode_bsatn().unwrap();
        let mut reader = Reader::new(&bytes);
        let value = Value::decode(&mut reader).unwrap();
        let Value::Sum(variant, payload) = value else {
            panic!("expected sum");
        };
        assert_eq!(variant, 0);
        assert_eq!(
            payload.field("reducer"),
            Some(&Value::String("create_user".to_string()))
        );
        assert_eq!(payload.field("request_id"), Some(&Value::U32(9)));
        assert_eq!(payload.field("flags"), Some(&Value::U8(0)));
    }

    #[test]
    fn test_subscribe_single_variants() {
        let message = ClientMessage::SubscribeSingle {
            query: "SELECT * FROM users".to_string(),
            request_id: 3,
            query_id: QueryId::new(7),
        };
        let bytes = message.encode_bsatn().unwrap();
        let mut reader = Reader::new(&bytes);
        let Value::Sum(variant, payload) = Value::decode(&mut reader).unwrap() else {
            panic!("expected sum");
        };
        assert_eq!(variant, 2);
        let query_id = payload.field("query_id").unwrap();
        assert_eq!(query_id.field("id"), Some(&Value::U32(7)));
    }

    #[test]
    fn test_unsubscribe_variant_indexes() {
        let single = ClientMessage::Unsubscribe {
            request_id: 1,
            query_id: QueryId::new(2),
        };
        let multi = ClientMessage::UnsubscribeMulti {
            request_id: 1,
            query_id: QueryId::new(2),
        };
        assert_eq!(single.variant(), 4);
        assert_eq!(multi.variant(), 5);
    }

    #[test]
    fn test_json_tagged_object() {
        let message = ClientMessage::SubscribeSingle {
            query: "SELECT * FROM users".to_string(),
            request_id: 3,
            query_id: QueryId::new(7),
        };
        let json: serde_json::Value =
            serde_json::from_str(&message.encode_json()).unwrap();
        assert_eq!(
            json["SubscribeSingle"]["query"],
            json!("SELECT * FROM users")
        );
        assert_eq!(json["SubscribeSingle"]["query_id"]["id"], json!(7));
    }

    #[test]
    fn test_one_off_query_json_message_id() {
        let message = ClientMessage::OneOffQuery {
            message_id: [1; 16],
            query_string: "SELECT * FROM users".to_string(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&message.encode_json()).unwrap();
        assert_eq!(json["OneOffQuery"]["message_id"].as_array().unwrap().len(), 16);
    }
}
