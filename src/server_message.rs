// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::Bytes;

use codec::{
    ConnectionId, DecodeValue, EnergyQuanta, Identity, QueryId, Reader, TimeDuration, Timestamp,
};

use crate::connect_options::Protocol;
use crate::error::{Error, ErrorKind};

/// Changes to a single table within one transaction.
///
/// Row payloads stay opaque at this layer; applications decode them
/// against their own schema.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableUpdate {
    pub table_id: u32,
    pub table_name: String,
    pub num_rows: u64,
    pub inserts: Vec<Bytes>,
    pub deletes: Vec<Bytes>,
}

/// A collection of table updates from one committed transaction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DatabaseUpdate {
    pub tables: Vec<TableUpdate>,
}

/// Outcome of a reducer run.
///
/// The tagged shape from the wire is preserved; a committed transaction
/// carries its database update inline.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateStatus {
    Committed(DatabaseUpdate),
    Failed(String),
    OutOfEnergy,
}

/// Metadata about the reducer invocation a transaction belongs to.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReducerCallInfo {
    pub reducer_name: String,
    pub reducer_id: u32,
    pub args: Bytes,
    pub request_id: u32,
}

/// One table of a one-off query result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OneOffTable {
    pub table_name: String,
    pub rows: Vec<Bytes>,
}

/// Server to client message variants.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    /// Handshake completion: the server assigned identity and
    /// connection id.
    IdentityToken {
        identity: Identity,
        token: String,
        connection_id: ConnectionId,
    },

    /// Initial rows matching a legacy subscribe.
    InitialSubscription {
        database_update: DatabaseUpdate,
        request_id: u32,
        total_host_execution_duration: TimeDuration,
    },

    /// Result of a reducer run, with full metadata.
    TransactionUpdate {
        status: UpdateStatus,
        timestamp: Timestamp,
        caller_identity: Identity,
        caller_connection_id: ConnectionId,
        reducer_call: ReducerCallInfo,
        energy_quanta_used: EnergyQuanta,
        total_host_execution_duration: TimeDuration,
    },

    /// Table changes only, for sessions in light mode.
    TransactionUpdateLight {
        request_id: u32,
        update: DatabaseUpdate,
    },

    /// A single-query subscription is live.
    SubscribeApplied {
        request_id: u32,
        total_host_execution_duration_micros: u64,
        query_id: QueryId,
        table_id: u32,
        table_name: String,
        table_rows: TableUpdate,
    },

    /// A single-query subscription ended.
    UnsubscribeApplied {
        request_id: u32,
        total_host_execution_duration_micros: u64,
        query_id: QueryId,
        table_id: u32,
        table_name: String,
        table_rows: TableUpdate,
    },

    /// A subscription failed, at registration or later.
    SubscriptionError {
        total_host_execution_duration_micros: u64,
        request_id: Option<u32>,
        query_id: Option<u32>,
        table_id: Option<u32>,
        error: String,
    },

    /// A multi-query subscription is live.
    SubscribeMultiApplied {
        request_id: u32,
        total_host_execution_duration_micros: u64,
        query_id: QueryId,
        update: DatabaseUpdate,
    },

    /// A multi-query subscription ended.
    UnsubscribeMultiApplied {
        request_id: u32,
        total_host_execution_duration_micros: u64,
        query_id: QueryId,
        update: DatabaseUpdate,
    },

    /// Result of a one-off query.
    OneOffQueryResponse {
        message_id: Bytes,
        error: Option<String>,
        tables: Vec<OneOffTable>,
        total_host_execution_duration: TimeDuration,
    },
}

impl ServerMessage {
    /// Decode one frame for the negotiated wire protocol.
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a valid server message; such
    /// frames are fatal for the connection.
    pub fn decode(payload: &[u8], protocol: Protocol) -> Result<Self, Error> {
        match protocol {
            Protocol::Bsatn => Self::decode_bsatn(payload),
            Protocol::Json => Self::decode_json(payload),
        }
    }

    /// Decode from the binary protocol.
    ///
    /// # Errors
    ///
    /// Returns error on an unknown variant or malformed payload.
    pub fn decode_bsatn(payload: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(payload);
        let variant = reader.read_sum_header()?;
        match variant {
            0 => Self::decode_identity_token(&mut reader),
            1 => Self::decode_initial_subscription(&mut reader),
            2 => Self::decode_transaction_update(&mut reader),
            3 => Self::decode_transaction_update_light(&mut reader),
            4 => Self::decode_subscribe_applied(&mut reader, false),
            5 => Self::decode_subscribe_applied(&mut reader, true),
            6 => Self::decode_subscription_error(&mut reader),
            7 => Self::decode_multi_applied(&mut reader, false),
            8 => Self::decode_multi_applied(&mut reader, true),
            9 => Self::decode_one_off_response(&mut reader),
            other => Err(Error::from_string(
                ErrorKind::DecodeError,
                format!("Unknown server message variant: {other}"),
            )),
        }
    }

    fn decode_identity_token(reader: &mut Reader) -> Result<Self, Error> {
        let field_count = reader.read_product_header()?;
        let mut identity = Identity::zero();
        let mut token = String::new();
        let mut connection_id = ConnectionId::zero();
        for _ in 0..field_count {
            match reader.read_field_name()?.as_str() {
                "identity" => identity = Identity::decode(reader)?,
                "token" => token = reader.read_string()?,
                "connection_id" => connection_id = ConnectionId::decode(reader)?,
                _ => reader.skip_value()?,
            }
        }
        Ok(Self::IdentityToken {
            identity,
            token,
            connection_id,
        })
    }

    fn decode_initial_subscription(reader: &mut Reader) -> Result<Self, Error> {
        let field_count = reader.read_product_header()?;
        let mut database_update = DatabaseUpdate::default();
        let mut request_id = 0;
        let mut duration = TimeDuration::zero();
        for _ in 0..field_count {
            match reader.read_field_name()?.as_str() {
                "database_update" => database_update = decode_database_update(reader)?,
                "request_id" => request_id = reader.read_u32()?,
                "total_host_execution_duration" => duration = TimeDuration::decode(reader)?,
                _ => reader.skip_value()?,
            }
        }
        Ok(Self::InitialSubscription {
            database_update,
            request_id,
            total_host_execution_duration: duration,
        })
    }

    fn decode_transaction_update(reader: &mut Reader) -> Result<Self, Error> {
        let field_count = reader.read_product_header()?;
        let mut status = UpdateStatus::Committed(DatabaseUpdate::default());
        let mut timestamp = Timestamp::epoch();
        let mut caller_identity = Identity::zero();
        let mut caller_connection_id = ConnectionId::zero();
        let mut reducer_call = ReducerCallInfo::default();
        let mut energy = EnergyQuanta::zero();
        let mut duration = TimeDuration::zero();
        for _ in 0..field_count {
            match reader.read_field_name()?.as_str() {
                "status" => status = decode_update_status(reader)?,
                "timestamp" => timestamp = Timestamp::decode(reader)?,
                "caller_identity" => caller_identity = Identity::decode(reader)?,
                "caller_connection_id" => {
                    caller_connection_id = ConnectionId::decode(reader)?;
                }
                "reducer_call" => reducer_call = decode_reducer_call(reader)?,
                "energy_quanta_used" => energy = EnergyQuanta::decode(reader)?,
                "total_host_execution_duration" => duration = TimeDuration::decode(reader)?,
                _ => reader.skip_value()?,
            }
        }
        Ok(Self::TransactionUpdate {
            status,
            timestamp,
            caller_identity,
            caller_connection_id,
            reducer_call,
            energy_quanta_used: energy,
            total_host_execution_duration: duration,
        })
    }

    fn decode_transaction_update_light(reader: &mut Reader) -> Result<Self, Error> {
        let field_count = reader.read_product_header()?;
        let mut request_id = 0;
        let mut update = DatabaseUpdate::default();
        for _ in 0..field_count {
            match reader.read_field_name()?.as_str() {
                "request_id" => request_id = reader.read_u32()?,
                "update" => update = decode_database_update(reader)?,
                _ => reader.skip_value()?,
            }
        }
        Ok(Self::TransactionUpdateLight { request_id, update })
    }

    fn decode_subscribe_applied(reader: &mut Reader, unsubscribe: bool) -> Result<Self, Error> {
        let field_count = reader.read_product_header()?;
        let mut request_id = 0;
        let mut duration_micros = 0;
        let mut query_id = QueryId::default();
        let mut table_id = 0;
        let mut table_name = String::new();
        let mut table_rows = TableUpdate::default();
        for _ in 0..field_count {
            match reader.read_field_name()?.as_str() {
                "request_id" => request_id = reader.read_u32()?,
                "total_host_execution_duration_micros" => {
                    duration_micros = reader.read_u64()?;
                }
                "query_id" => query_id = QueryId::decode(reader)?,
                "table_id" => table_id = reader.read_u32()?,
                "table_name" => table_name = reader.read_string()?,
                "table_rows" => table_rows = decode_table_update(reader)?,
                _ => reader.skip_value()?,
            }
        }
        if unsubscribe {
            Ok(Self::UnsubscribeApplied {
                request_id,
                total_host_execution_duration_micros: duration_micros,
                query_id,
                table_id,
                table_name,
                table_rows,
            })
        } else {
            Ok(Self::SubscribeApplied {
                request_id,
                total_host_execution_duration_micros: duration_micros,
                query_id,
                table_id,
                table_name,
                table_rows,
            })
        }
    }

    fn decode_subscription_error(reader: &mut Reader) -> Result<Self, Error> {
        let field_count = reader.read_product_header()?;
        let mut duration_micros = 0;
        let mut request_id = None;
        let mut query_id = None;
        let mut table_id = None;
        let mut error = String::new();
        for _ in 0..field_count {
            match reader.read_field_name()?.as_str() {
                "total_host_execution_duration_micros" => {
                    duration_micros = reader.read_u64()?;
                }
                "request_id" => request_id = read_optional_u32(reader)?,
                "query_id" => query_id = read_optional_u32(reader)?,
                "table_id" => table_id = read_optional_u32(reader)?,
                "error" => error = reader.read_string()?,
                _ => reader.skip_value()?,
            }
        }
        Ok(Self::SubscriptionError {
            total_host_execution_duration_micros: duration_micros,
            request_id,
            query_id,
            table_id,
            error,
        })
    }

    fn decode_multi_applied(reader: &mut Reader, unsubscribe: bool) -> Result<Self, Error> {
        let field_count = reader.read_product_header()?;
        let mut request_id = 0;
        let mut duration_micros = 0;
        let mut query_id = QueryId::default();
        let mut update = DatabaseUpdate::default();
        for _ in 0..field_count {
            match reader.read_field_name()?.as_str() {
                "request_id" => request_id = reader.read_u32()?,
                "total_host_execution_duration_micros" => {
                    duration_micros = reader.read_u64()?;
                }
                "query_id" => query_id = QueryId::decode(reader)?,
                "update" => update = decode_database_update(reader)?,
                _ => reader.skip_value()?,
            }
        }
        if unsubscribe {
            Ok(Self::UnsubscribeMultiApplied {
                request_id,
                total_host_execution_duration_micros: duration_micros,
                query_id,
                update,
            })
        } else {
            Ok(Self::SubscribeMultiApplied {
                request_id,
                total_host_execution_duration_micros: duration_micros,
                query_id,
                update,
            })
        }
    }

    fn decode_one_off_response(reader: &mut Reader) -> Result<Self, Error> {
        let field_count = reader.read_product_header()?;
        let mut message_id = Bytes::new();
        let mut error = None;
        let mut tables = Vec::new();
        let mut duration = TimeDuration::zero();
        for _ in 0..field_count {
            match reader.read_field_name()?.as_str() {
                "message_id" => message_id = Bytes::copy_from_slice(reader.read_byte_slice()?),
                "error" => error = read_optional_string(reader)?,
                "tables" => {
                    let count = reader.read_list_header()?;
                    for _ in 0..count {
                        tables.push(decode_one_off_table(reader)?);
                    }
                }
                "total_host_execution_duration" => duration = TimeDuration::decode(reader)?,
                _ => reader.skip_value()?,
            }
        }
        Ok(Self::OneOffQueryResponse {
            message_id,
            error,
            tables,
            total_host_execution_duration: duration,
        })
    }

    /// Decode from the JSON protocol's single-key tagged object.
    ///
    /// # Errors
    ///
    /// Returns error on unknown message keys or malformed JSON.
    pub fn decode_json(payload: &[u8]) -> Result<Self, Error> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;
        let object = value.as_object().ok_or_else(|| {
            Error::new(ErrorKind::DecodeError, "Server message is not an object")
        })?;
        let (key, body) = object.iter().next().ok_or_else(|| {
            Error::new(ErrorKind::DecodeError, "Server message object is empty")
        })?;
        match key.as_str() {
            "IdentityToken" => Ok(Self::IdentityToken {
                identity: json_identity(&body["identity"]),
                token: json_str(&body["token"]),
                connection_id: json_connection_id(&body["connection_id"]),
            }),
            "InitialSubscription" => Ok(Self::InitialSubscription {
                database_update: json_database_update(&body["database_update"]),
                request_id: json_u32(&body["request_id"]),
                total_host_execution_duration: TimeDuration::from_micros(json_i64(
                    &body["total_host_execution_duration"],
                )),
            }),
            "TransactionUpdate" => Ok(Self::TransactionUpdate {
                status: json_update_status(&body["status"]),
                timestamp: Timestamp::from_micros(json_i64(&body["timestamp"])),
                caller_identity: json_identity(&body["caller_identity"]),
                caller_connection_id: json_connection_id(&body["caller_connection_id"]),
                reducer_call: ReducerCallInfo {
                    reducer_name: json_str(&body["reducer_call"]["reducer_name"]),
                    reducer_id: json_u32(&body["reducer_call"]["reducer_id"]),
                    args: Bytes::new(),
                    request_id: json_u32(&body["reducer_call"]["request_id"]),
                },
                energy_quanta_used: EnergyQuanta::new(
                    body["energy_quanta_used"].as_u64().unwrap_or(0),
                ),
                total_host_execution_duration: TimeDuration::from_micros(json_i64(
                    &body["total_host_execution_duration"],
                )),
            }),
            "TransactionUpdateLight" => Ok(Self::TransactionUpdateLight {
                request_id: json_u32(&body["request_id"]),
                update: json_database_update(&body["update"]),
            }),
            "SubscribeApplied" | "UnsubscribeApplied" => {
                let request_id = json_u32(&body["request_id"]);
                let duration_micros =
                    body["total_host_execution_duration_micros"].as_u64().unwrap_or(0);
                let query_id = QueryId::new(json_u32(&body["query_id"]["id"]));
                let table_id = json_u32(&body["table_id"]);
                let table_name = json_str(&body["table_name"]);
                let table_rows = json_table_update(&body["table_rows"]);
                if key == "SubscribeApplied" {
                    Ok(Self::SubscribeApplied {
                        request_id,
                        total_host_execution_duration_micros: duration_micros,
                        query_id,
                        table_id,
                        table_name,
                        table_rows,
                    })
                } else {
                    Ok(Self::UnsubscribeApplied {
                        request_id,
                        total_host_execution_duration_micros: duration_micros,
                        query_id,
                        table_id,
                        table_name,
                        table_rows,
                    })
                }
            }
            "SubscriptionError" => Ok(Self::SubscriptionError {
                total_host_execution_duration_micros: body
                    ["total_host_execution_duration_micros"]
                    .as_u64()
                    .unwrap_or(0),
                request_id: body["request_id"].as_u64().map(|id| id as u32),
                query_id: body["query_id"].as_u64().map(|id| id as u32),
                table_id: body["table_id"].as_u64().map(|id| id as u32),
                error: json_str(&body["error"]),
            }),
            "SubscribeMultiApplied" | "UnsubscribeMultiApplied" => {
                let request_id = json_u32(&body["request_id"]);
                let duration_micros =
                    body["total_host_execution_duration_micros"].as_u64().unwrap_or(0);
                let query_id = QueryId::new(json_u32(&body["query_id"]["id"]));
                let update = json_database_update(&body["update"]);
                if key == "SubscribeMultiApplied" {
                    Ok(Self::SubscribeMultiApplied {
                        request_id,
                        total_host_execution_duration_micros: duration_micros,
                        query_id,
                        update,
                    })
                } else {
                    Ok(Self::UnsubscribeMultiApplied {
                        request_id,
                        total_host_execution_duration_micros: duration_micros,
                        query_id,
                        update,
                    })
                }
            }
            "OneOffQueryResponse" => Ok(Self::OneOffQueryResponse {
                message_id: Bytes::from(
                    body["message_id"]
                        .as_array()
                        .map(|items| {
                            items
                                .iter()
                                .filter_map(serde_json::Value::as_u64)
                                .map(|byte| byte as u8)
                                .collect::<Vec<u8>>()
                        })
                        .unwrap_or_default(),
                ),
                error: body["error"].as_str().map(str::to_string),
                tables: body["tables"]
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .map(|table| OneOffTable {
                                table_name: json_str(&table["table_name"]),
                                rows: json_rows(&table["rows"]),
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
                total_host_execution_duration: TimeDuration::from_micros(json_i64(
                    &body["total_host_execution_duration"],
                )),
            }),
            other => Err(Error::from_string(
                ErrorKind::DecodeError,
                format!("Unknown server message key: {other}"),
            )),
        }
    }
}

fn decode_update_status(reader: &mut Reader) -> Result<UpdateStatus, Error> {
    let variant = reader.read_sum_header()?;
    match variant {
        0 => Ok(UpdateStatus::Committed(decode_database_update(reader)?)),
        1 => Ok(UpdateStatus::Failed(reader.read_string()?)),
        2 => {
            reader.skip_value()?;
            Ok(UpdateStatus::OutOfEnergy)
        }
        other => Err(Error::from_string(
            ErrorKind::DecodeError,
            format!("Unknown update status variant: {other}"),
        )),
    }
}

fn decode_reducer_call(reader: &mut Reader) -> Result<ReducerCallInfo, Error> {
    let field_count = reader.read_product_header()?;
    let mut info = ReducerCallInfo::default();
    for _ in 0..field_count {
        match reader.read_field_name()?.as_str() {
            "reducer_name" => info.reducer_name = reader.read_string()?,
            "reducer_id" => info.reducer_id = reader.read_u32()?,
            "args" => info.args = Bytes::copy_from_slice(reader.read_byte_slice()?),
            "request_id" => info.request_id = reader.read_u32()?,
            _ => reader.skip_value()?,
        }
    }
    Ok(info)
}

fn decode_database_update(reader: &mut Reader) -> Result<DatabaseUpdate, Error> {
    let field_count = reader.read_product_header()?;
    let mut update = DatabaseUpdate::default();
    for _ in 0..field_count {
        match reader.read_field_name()?.as_str() {
            "tables" => {
                let count = reader.read_list_header()?;
                for _ in 0..count {
                    update.tables.push(decode_table_update(reader)?);
                }
            }
            _ => reader.skip_value()?,
        }
    }
    Ok(update)
}

fn decode_table_update(reader: &mut Reader) -> Result<TableUpdate, Error> {
    let field_count = reader.read_product_header()?;
    let mut table = TableUpdate::default();
    for _ in 0..field_count {
        match reader.read_field_name()?.as_str() {
            "table_id" => table.table_id = reader.read_u32()?,
            "table_name" => table.table_name = reader.read_string()?,
            "num_rows" => table.num_rows = reader.read_u64()?,
            "inserts" => table.inserts = decode_row_list(reader)?,
            "deletes" => table.deletes = decode_row_list(reader)?,
            _ => reader.skip_value()?,
        }
    }
    Ok(table)
}

fn decode_row_list(reader: &mut Reader) -> Result<Vec<Bytes>, Error> {
    let count = reader.read_list_header()?;
    let mut rows = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        rows.push(Bytes::copy_from_slice(reader.read_byte_slice()?));
    }
    Ok(rows)
}

fn decode_one_off_table(reader: &mut Reader) -> Result<OneOffTable, Error> {
    let field_count = reader.read_product_header()?;
    let mut table = OneOffTable::default();
    for _ in 0..field_count {
        match reader.read_field_name()?.as_str() {
            "table_name" => table.table_name = reader.read_string()?,
            "rows" => table.rows = decode_row_list(reader)?,
            _ => reader.skip_value()?,
        }
    }
    Ok(table)
}

/// Read a u32 that may be wrapped in an option on the wire.
fn read_optional_u32(reader: &mut Reader) -> Result<Option<u32>, Error> {
    use codec::ValueTag;
    let tag = reader.read_tag()?;
    match tag {
        ValueTag::OptionNone => Ok(None),
        ValueTag::OptionSome => Ok(Some(reader.read_u32()?)),
        ValueTag::U32 => Ok(Some(reader.read_u32_raw()?)),
        other => Err(codec::DecodeError::InvalidTag(other.byte()).into()),
    }
}

/// Read a string that may be wrapped in an option on the wire.
fn read_optional_string(reader: &mut Reader) -> Result<Option<String>, Error> {
    use codec::ValueTag;
    let tag = reader.read_tag()?;
    match tag {
        ValueTag::OptionNone => Ok(None),
        ValueTag::OptionSome => Ok(Some(reader.read_string()?)),
        ValueTag::String => {
            let len = reader.read_u32_raw()? as usize;
            let bytes = reader.read_bytes(len)?;
            Ok(Some(
                std::str::from_utf8(bytes)
                    .map_err(codec::DecodeError::from)?
                    .to_string(),
            ))
        }
        other => Err(codec::DecodeError::InvalidTag(other.byte()).into()),
    }
}

fn json_str(value: &serde_json::Value) -> String {
    value.as_str().unwrap_or_default().to_string()
}

fn json_u32(value: &serde_json::Value) -> u32 {
    value.as_u64().unwrap_or(0) as u32
}

fn json_i64(value: &serde_json::Value) -> i64 {
    value.as_i64().unwrap_or(0)
}

/// Tolerant identity parser for the JSON path; malformed values fall
/// back to the zero identity rather than dropping the whole frame.
fn json_identity(value: &serde_json::Value) -> Identity {
    match value {
        serde_json::Value::String(hex) => Identity::from_hex(hex).unwrap_or_else(|_| Identity::zero()),
        serde_json::Value::Array(items) => {
            let bytes: Vec<u8> = items
                .iter()
                .filter_map(serde_json::Value::as_u64)
                .map(|byte| byte as u8)
                .collect();
            Identity::from_slice(&bytes).unwrap_or_else(|_| Identity::zero())
        }
        serde_json::Value::Object(map) => map
            .get("data")
            .map_or_else(Identity::zero, json_identity),
        _ => Identity::zero(),
    }
}

/// Tolerant connection id parser for the JSON path.
fn json_connection_id(value: &serde_json::Value) -> ConnectionId {
    match value {
        serde_json::Value::String(hex) => {
            ConnectionId::from_hex(hex).unwrap_or_else(|_| ConnectionId::zero())
        }
        serde_json::Value::Array(items) => {
            let bytes: Vec<u8> = items
                .iter()
                .filter_map(serde_json::Value::as_u64)
                .map(|byte| byte as u8)
                .collect();
            ConnectionId::from_slice(&bytes).unwrap_or_else(|_| ConnectionId::zero())
        }
        serde_json::Value::Object(map) => map
            .get("data")
            .map_or_else(ConnectionId::zero, json_connection_id),
        _ => ConnectionId::zero(),
    }
}

fn json_update_status(value: &serde_json::Value) -> UpdateStatus {
    if let Some(object) = value.as_object() {
        if let Some(failed) = object.get("Failed") {
            return UpdateStatus::Failed(json_str(failed));
        }
        if let Some(committed) = object.get("Committed") {
            return UpdateStatus::Committed(json_database_update(committed));
        }
        if object.contains_key("OutOfEnergy") {
            return UpdateStatus::OutOfEnergy;
        }
    }
    if value.as_str() == Some("OutOfEnergy") {
        return UpdateStatus::OutOfEnergy;
    }
    UpdateStatus::Committed(DatabaseUpdate::default())
}

fn json_database_update(value: &serde_json::Value) -> DatabaseUpdate {
    DatabaseUpdate {
        tables: value["tables"]
            .as_array()
            .map(|items| items.iter().map(json_table_update).collect())
            .unwrap_or_default(),
    }
}

fn json_table_update(value: &serde_json::Value) -> TableUpdate {
    TableUpdate {
        table_id: json_u32(&value["table_id"]),
        table_name: json_str(&value["table_name"]),
        num_rows: value["num_rows"].as_u64().unwrap_or(0),
        inserts: json_rows(&value["inserts"]),
        deletes: json_rows(&value["deletes"]),
    }
}

fn json_rows(value: &serde_json::Value) -> Vec<Bytes> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|row| Bytes::from(row.to_string().into_bytes()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod test_encode {
    //! Frame builders used by dispatch tests to play the server's part.

    use codec::{EncodeValue, Writer};

    use super::{DatabaseUpdate, ServerMessage, TableUpdate, UpdateStatus};

    fn write_database_update(
        writer: &mut Writer,
        update: &DatabaseUpdate,
    ) -> Result<(), codec::EncodeError> {
        writer.write_product_header(1)?;
        writer.write_field_name("tables")?;
        writer.write_list_header(update.tables.len())?;
        for table in &update.tables {
            write_table_update(writer, table)?;
        }
        Ok(())
    }

    fn write_table_update(
        writer: &mut Writer,
        table: &TableUpdate,
    ) -> Result<(), codec::EncodeError> {
        writer.write_product_header(5)?;
        writer.write_field_name("table_id")?;
        writer.write_u32(table.table_id)?;
        writer.write_field_name("table_name")?;
        writer.write_string(&table.table_name)?;
        writer.write_field_name("num_rows")?;
        writer.write_u64(table.num_rows)?;
        writer.write_field_name("inserts")?;
        writer.write_list_header(table.inserts.len())?;
        for row in &table.inserts {
            writer.write_byte_slice(row)?;
        }
        writer.write_field_name("deletes")?;
        writer.write_list_header(table.deletes.len())?;
        for row in &table.deletes {
            writer.write_byte_slice(row)?;
        }
        Ok(())
    }

    /// Encode a server message the way the server would.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn encode_bsatn(message: &ServerMessage) -> Vec<u8> {
        let mut writer = Writer::new();
        let result = match message {
            ServerMessage::IdentityToken {
                identity,
                token,
                connection_id,
            } => (|| {
                writer.write_sum_header(0)?;
                writer.write_product_header(3)?;
                writer.write_field_name("identity")?;
                identity.encode(&mut writer)?;
                writer.write_field_name("token")?;
                writer.write_string(token)?;
                writer.write_field_name("connection_id")?;
                connection_id.encode(&mut writer)
            })(),
            ServerMessage::InitialSubscription {
                database_update,
                request_id,
                total_host_execution_duration,
            } => (|| {
                writer.write_sum_header(1)?;
                writer.write_product_header(3)?;
                writer.write_field_name("database_update")?;
                write_database_update(&mut writer, database_update)?;
                writer.write_field_name("request_id")?;
                writer.write_u32(*request_id)?;
                writer.write_field_name("total_host_execution_duration")?;
                total_host_execution_duration.encode(&mut writer)
            })(),
            ServerMessage::TransactionUpdate {
                status,
                timestamp,
                caller_identity,
                caller_connection_id,
                reducer_call,
                energy_quanta_used,
                total_host_execution_duration,
            } => (|| {
                writer.write_sum_header(2)?;
                writer.write_product_header(7)?;
                writer.write_field_name("status")?;
                match status {
                    UpdateStatus::Committed(update) => {
                        writer.write_sum_header(0)?;
                        write_database_update(&mut writer, update)?;
                    }
                    UpdateStatus::Failed(message) => {
                        writer.write_sum_header(1)?;
                        writer.write_string(message)?;
                    }
                    UpdateStatus::OutOfEnergy => {
                        writer.write_sum_header(2)?;
                        writer.write_none()?;
                    }
                }
                writer.write_field_name("timestamp")?;
                timestamp.encode(&mut writer)?;
                writer.write_field_name("caller_identity")?;
                caller_identity.encode(&mut writer)?;
                writer.write_field_name("caller_connection_id")?;
                caller_connection_id.encode(&mut writer)?;
                writer.write_field_name("reducer_call")?;
                writer.write_product_header(4)?;
                writer.write_field_name("reducer_name")?;
                writer.write_string(&reducer_call.reducer_name)?;
                writer.write_field_name("reducer_id")?;
                writer.write_u32(reducer_call.reducer_id)?;
                writer.write_field_name("args")?;
                writer.write_byte_slice(&reducer_call.args)?;
                writer.write_field_name("request_id")?;
                writer.write_u32(reducer_call.request_id)?;
                writer.write_field_name("energy_quanta_used")?;
                energy_quanta_used.encode(&mut writer)?;
                writer.write_field_name("total_host_execution_duration")?;
                total_host_execution_duration.encode(&mut writer)
            })(),
            ServerMessage::TransactionUpdateLight { request_id, update } => (|| {
                writer.write_sum_header(3)?;
                writer.write_product_header(2)?;
                writer.write_field_name("request_id")?;
                writer.write_u32(*request_id)?;
                writer.write_field_name("update")?;
                write_database_update(&mut writer, update)
            })(),
            ServerMessage::SubscribeApplied {
                request_id,
                total_host_execution_duration_micros,
                query_id,
                table_id,
                table_name,
                table_rows,
            }
            | ServerMessage::UnsubscribeApplied {
                request_id,
                total_host_execution_duration_micros,
                query_id,
                table_id,
                table_name,
                table_rows,
            } => (|| {
                let variant = if matches!(message, ServerMessage::SubscribeApplied { .. }) {
                    4
                } else {
                    5
                };
                writer.write_sum_header(variant)?;
                writer.write_product_header(6)?;
                writer.write_field_name("request_id")?;
                writer.write_u32(*request_id)?;
                writer.write_field_name("total_host_execution_duration_micros")?;
                writer.write_u64(*total_host_execution_duration_micros)?;
                writer.write_field_name("query_id")?;
                query_id.encode(&mut writer)?;
                writer.write_field_name("table_id")?;
                writer.write_u32(*table_id)?;
                writer.write_field_name("table_name")?;
                writer.write_string(table_name)?;
                writer.write_field_name("table_rows")?;
                write_table_update(&mut writer, table_rows)
            })(),
            ServerMessage::SubscriptionError {
                total_host_execution_duration_micros,
                request_id,
                query_id,
                table_id,
                error,
            } => (|| {
                writer.write_sum_header(6)?;
                writer.write_product_header(5)?;
                writer.write_field_name("total_host_execution_duration_micros")?;
                writer.write_u64(*total_host_execution_duration_micros)?;
                writer.write_field_name("request_id")?;
                write_optional_u32(&mut writer, *request_id)?;
                writer.write_field_name("query_id")?;
                write_optional_u32(&mut writer, *query_id)?;
                writer.write_field_name("table_id")?;
                write_optional_u32(&mut writer, *table_id)?;
                writer.write_field_name("error")?;
                writer.write_string(error)
            })(),
            ServerMessage::SubscribeMultiApplied {
                request_id,
                total_host_execution_duration_micros,
                query_id,
                update,
            }
            | ServerMessage::UnsubscribeMultiApplied {
                request_id,
                total_host_execution_duration_micros,
                query_id,
                update,
            } => (|| {
                let variant =
                    if matches!(message, ServerMessage::SubscribeMultiApplied { .. }) {
                        7
                    } else {
                        8
                    };
                writer.write_sum_header(variant)?;
                writer.write_product_header(4)?;
                writer.write_field_name("request_id")?;
                writer.write_u32(*request_id)?;
                writer.write_field_name("total_host_execution_duration_micros")?;
                writer.write_u64(*total_host_execution_duration_micros)?;
                writer.write_field_name("query_id")?;
                query_id.encode(&mut writer)?;
                writer.write_field_name("update")?;
                write_database_update(&mut writer, update)
            })(),
            ServerMessage::OneOffQueryResponse {
                message_id,
                error,
                tables,
                total_host_execution_duration,
            } => (|| {
                writer.write_sum_header(9)?;
                writer.write_product_header(4)?;
                writer.write_field_name("message_id")?;
                writer.write_byte_slice(message_id)?;
                writer.write_field_name("error")?;
                match error {
                    Some(message) => {
                        writer.write_some_tag()?;
                        writer.write_string(message)?;
                    }
                    None => writer.write_none()?,
                }
                writer.write_field_name("tables")?;
                writer.write_list_header(tables.len())?;
                for table in tables {
                    writer.write_product_header(2)?;
                    writer.write_field_name("table_name")?;
                    writer.write_string(&table.table_name)?;
                    writer.write_field_name("rows")?;
                    writer.write_list_header(table.rows.len())?;
                    for row in &table.rows {
                        writer.write_byte_slice(row)?;
                    }
                }
                writer.write_field_name("total_host_execution_duration")?;
                total_host_execution_duration.encode(&mut writer)
            })(),
        };
        result.expect("server frame encodes");
        writer.into_bytes().expect("server frame encodes").to_vec()
    }

    fn write_optional_u32(
        writer: &mut Writer,
        value: Option<u32>,
    ) -> Result<(), codec::EncodeError> {
        match value {
            Some(value) => {
                writer.write_some_tag()?;
                writer.write_u32(value)
            }
            None => writer.write_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::MICROS_PER_SEC;

    fn sample_update() -> DatabaseUpdate {
        DatabaseUpdate {
            tables: vec![TableUpdate {
                table_id: 11,
                table_name: "users".to_string(),
                num_rows: 2,
                inserts: vec![Bytes::from_static(b"row-a"), Bytes::from_static(b"row-b")],
                deletes: vec![],
            }],
        }
    }

    #[test]
    fn test_identity_token_round_trip() {
        let message = ServerMessage::IdentityToken {
            identity: Identity::new([0xaa; 32]),
            token: "jwt-token".to_string(),
            connection_id: ConnectionId::new([0xbb; 16]),
        };
        let bytes = test_encode::encode_bsatn(&message);
        assert_eq!(ServerMessage::decode_bsatn(&bytes).unwrap(), message);
    }

    #[test]
    fn test_transaction_update_round_trip_preserves_status() {
        let committed = ServerMessage::TransactionUpdate {
            status: UpdateStatus::Committed(sample_update()),
            timestamp: Timestamp::from_micros(5 * MICROS_PER_SEC),
            caller_identity: Identity::new([1; 32]),
            caller_connection_id: ConnectionId::new([2; 16]),
            reducer_call: ReducerCallInfo {
                reducer_name: "create_user".to_string(),
                reducer_id: 3,
                args: Bytes::from_static(b"args"),
                request_id: 17,
            },
            energy_quanta_used: EnergyQuanta::new(42),
            total_host_execution_duration: TimeDuration::from_millis(7),
        };
        let bytes = test_encode::encode_bsatn(&committed);
        assert_eq!(ServerMessage::decode_bsatn(&bytes).unwrap(), committed);

        let failed = ServerMessage::TransactionUpdate {
            status: UpdateStatus::Failed("constraint violated".to_string()),
            timestamp: Timestamp::epoch(),
            caller_identity: Identity::zero(),
            caller_connection_id: ConnectionId::zero(),
            reducer_call: ReducerCallInfo::default(),
            energy_quanta_used: EnergyQuanta::zero(),
            total_host_execution_duration: TimeDuration::zero(),
        };
        let bytes = test_encode::encode_bsatn(&failed);
        let decoded = ServerMessage::decode_bsatn(&bytes).unwrap();
        let ServerMessage::TransactionUpdate { status, .. } = decoded else {
            panic!("expected transaction update");
        };
        assert_eq!(status, UpdateStatus::Failed("constraint violated".to_string()));
    }

    #[test]
    fn test_subscription_error_optional_fields() {
        let message = ServerMessage::SubscriptionError {
            total_host_execution_duration_micros: 10,
            request_id: Some(4),
            query_id: None,
            table_id: Some(9),
            error: "no such table".to_string(),
        };
        let bytes = test_encode::encode_bsatn(&message);
        assert_eq!(ServerMessage::decode_bsatn(&bytes).unwrap(), message);
    }

    #[test]
    fn test_one_off_response_round_trip() {
        let message = ServerMessage::OneOffQueryResponse {
            message_id: Bytes::from_static(&[7; 16]),
            error: None,
            tables: vec![OneOffTable {
                table_name: "users".to_string(),
                rows: vec![Bytes::from_static(b"row")],
            }],
            total_host_execution_duration: TimeDuration::from_micros(55),
        };
        let bytes = test_encode::encode_bsatn(&message);
        assert_eq!(ServerMessage::decode_bsatn(&bytes).unwrap(), message);
    }

    #[test]
    fn test_unknown_variant_rejected() {
        let mut writer = codec::Writer::new();
        writer.write_sum_header(99).unwrap();
        writer.write_none().unwrap();
        let bytes = writer.into_bytes().unwrap();
        assert!(ServerMessage::decode_bsatn(&bytes).is_err());
    }

    #[test]
    fn test_json_identity_token() {
        let identity_hex = "ab".repeat(32);
        let connection_hex = "cd".repeat(16);
        let payload = format!(
            r#"{{"IdentityToken": {{"identity": "{identity_hex}", "token": "tok", "connection_id": "{connection_hex}"}}}}"#
        );
        let message = ServerMessage::decode_json(payload.as_bytes()).unwrap();
        let ServerMessage::IdentityToken {
            identity,
            token,
            connection_id,
        } = message
        else {
            panic!("expected identity token");
        };
        assert_eq!(identity.to_hex(), identity_hex);
        assert_eq!(token, "tok");
        assert_eq!(connection_id.to_hex(), connection_hex);
    }

    #[test]
    fn test_json_transaction_update_structured_status() {
        let payload = br#"{"TransactionUpdate": {
            "status": {"Failed": "boom"},
            "timestamp": 123,
            "caller_identity": "00",
            "caller_connection_id": "00",
            "reducer_call": {"reducer_name": "f", "reducer_id": 1, "request_id": 2},
            "energy_quanta_used": 9,
            "total_host_execution_duration": 77
        }}"#;
        let message = ServerMessage::decode_json(payload).unwrap();
        let ServerMessage::TransactionUpdate { status, .. } = message else {
            panic!("expected transaction update");
        };
        assert_eq!(status, UpdateStatus::Failed("boom".to_string()));
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        // A frame with an extra field the client does not know.
        let mut writer = codec::Writer::new();
        writer.write_sum_header(3).unwrap();
        writer.write_product_header(3).unwrap();
        writer.write_field_name("request_id").unwrap();
        writer.write_u32(5).unwrap();
        writer.write_field_name("future_field").unwrap();
        writer.write_string("ignored").unwrap();
        writer.write_field_name("update").unwrap();
        writer.write_product_header(1).unwrap();
        writer.write_field_name("tables").unwrap();
        writer.write_list_header(0).unwrap();
        let bytes = writer.into_bytes().unwrap();
        let message = ServerMessage::decode_bsatn(&bytes).unwrap();
        assert_eq!(
            message,
            ServerMessage::TransactionUpdateLight {
                request_id: 5,
                update: DatabaseUpdate::default(),
            }
        );
    }
}
