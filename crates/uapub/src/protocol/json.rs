// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! JSON NetworkMessage mapping (Part 14 Section 7.2.3) for mqtt-json groups.
//!
//! The JSON form is self-describing: one `ua-data` object with a `Messages`
//! array, field values keyed by field name. The PublisherId is a String in
//! the JSON mapping regardless of the binary variant; readers on JSON
//! groups therefore configure String publisher ids. Security metadata is
//! never carried in JSON messages (such configurations are rejected at
//! enable time).

use crate::protocol::uadp::{
    DataSetMessage, DataSetMessageHeader, DataSetMessageType, DataSetPayload, FieldEncoding,
    NetworkMessage,
};
use crate::protocol::{EncodingMetaData, PublisherId};
use crate::types::{BuiltInType, DataValue, DateTime, StatusCode, Variant};
use base64::Engine;
use serde_json::{json, Map, Value};

fn message_type_name(t: DataSetMessageType) -> &'static str {
    match t {
        DataSetMessageType::KeyFrame => "ua-keyframe",
        DataSetMessageType::DeltaFrame => "ua-deltaframe",
        DataSetMessageType::Event => "ua-event",
        DataSetMessageType::KeepAlive => "ua-keepalive",
    }
}

fn message_type_from_name(s: &str) -> DataSetMessageType {
    match s {
        "ua-deltaframe" => DataSetMessageType::DeltaFrame,
        "ua-event" => DataSetMessageType::Event,
        "ua-keepalive" => DataSetMessageType::KeepAlive,
        _ => DataSetMessageType::KeyFrame,
    }
}

// ============================================================================
// ISO 8601 timestamps
// ============================================================================

/// Days since 1970-01-01 to (year, month, day); Howard Hinnant's
/// civil_from_days.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = if m > 2 { m - 3 } else { m + 9 } as i64;
    let doy = (153 * mp + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn datetime_to_iso(dt: DateTime) -> String {
    let unix = dt.0 - crate::types::UNIX_EPOCH_TICKS;
    let secs = unix.div_euclid(crate::types::TICKS_PER_SEC);
    let millis = unix.rem_euclid(crate::types::TICKS_PER_SEC) / 10_000;
    let days = secs.div_euclid(86_400);
    let tod = secs.rem_euclid(86_400);
    let (y, m, d) = civil_from_days(days);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        y,
        m,
        d,
        tod / 3600,
        (tod % 3600) / 60,
        tod % 60,
        millis
    )
}

fn datetime_from_iso(s: &str) -> Option<DateTime> {
    let bytes = s.as_bytes();
    if bytes.len() < 19 {
        return None;
    }
    let num = |r: std::ops::Range<usize>| s.get(r)?.parse::<i64>().ok();
    let y = num(0..4)?;
    let m = num(5..7)? as u32;
    let d = num(8..10)? as u32;
    let hh = num(11..13)?;
    let mm = num(14..16)?;
    let ss = num(17..19)?;
    let millis = if bytes.len() > 20 && bytes[19] == b'.' {
        s.get(20..23)?.parse::<i64>().ok()?
    } else {
        0
    };
    let secs = days_from_civil(y, m, d) * 86_400 + hh * 3600 + mm * 60 + ss;
    Some(DateTime(
        crate::types::UNIX_EPOCH_TICKS + secs * crate::types::TICKS_PER_SEC + millis * 10_000,
    ))
}

// ============================================================================
// Variant <-> JSON (reversible form)
// ============================================================================

fn variant_to_json(v: &Variant) -> Value {
    let Some(ty) = v.built_in_type() else { return Value::Null };
    json!({ "Type": ty as u8, "Body": variant_body_to_json(v) })
}

fn variant_body_to_json(v: &Variant) -> Value {
    match v {
        Variant::Empty => Value::Null,
        Variant::Boolean(b) => json!(b),
        Variant::SByte(x) => json!(x),
        Variant::Byte(x) => json!(x),
        Variant::Int16(x) => json!(x),
        Variant::UInt16(x) => json!(x),
        Variant::Int32(x) => json!(x),
        Variant::UInt32(x) => json!(x),
        // 64-bit integers are JSON strings per the OPC UA mapping
        Variant::Int64(x) => json!(x.to_string()),
        Variant::UInt64(x) => json!(x.to_string()),
        Variant::Float(x) => json!(x),
        Variant::Double(x) => json!(x),
        Variant::String(s) => json!(s),
        Variant::DateTime(dt) => json!(datetime_to_iso(*dt)),
        Variant::Guid(g) => json!(g.to_string()),
        Variant::ByteString(b) => {
            json!(base64::engine::general_purpose::STANDARD.encode(b))
        }
        Variant::StatusCode(sc) => json!(sc.0),
        Variant::NodeId(id) => json!(id.to_string()),
        Variant::QualifiedName(qn) => json!(format!("{}:{}", qn.namespace, qn.name)),
        Variant::LocalizedText(lt) => json!({ "Locale": lt.locale, "Text": lt.text }),
        Variant::ExtensionObject(_) => Value::Null,
        Variant::Array { values, .. } => {
            Value::Array(values.iter().map(variant_body_to_json).collect())
        }
    }
}

fn variant_from_json(v: &Value) -> crate::Result<Variant> {
    let obj = v.as_object().ok_or(StatusCode::BAD_DECODING_ERROR)?;
    let ty = obj
        .get("Type")
        .and_then(Value::as_u64)
        .and_then(|t| BuiltInType::from_u8(t as u8))
        .ok_or(StatusCode::BAD_DECODING_ERROR)?;
    let body = obj.get("Body").unwrap_or(&Value::Null);
    if let Value::Array(items) = body {
        let values = items
            .iter()
            .map(|item| scalar_from_json(ty, item))
            .collect::<crate::Result<Vec<_>>>()?;
        return Ok(Variant::Array { elem: ty, values, dimensions: None });
    }
    scalar_from_json(ty, body)
}

fn scalar_from_json(ty: BuiltInType, body: &Value) -> crate::Result<Variant> {
    let err = StatusCode::BAD_DECODING_ERROR;
    Ok(match ty {
        BuiltInType::Boolean => Variant::Boolean(body.as_bool().ok_or(err)?),
        BuiltInType::SByte => Variant::SByte(body.as_i64().ok_or(err)? as i8),
        BuiltInType::Byte => Variant::Byte(body.as_u64().ok_or(err)? as u8),
        BuiltInType::Int16 => Variant::Int16(body.as_i64().ok_or(err)? as i16),
        BuiltInType::UInt16 => Variant::UInt16(body.as_u64().ok_or(err)? as u16),
        BuiltInType::Int32 => Variant::Int32(body.as_i64().ok_or(err)? as i32),
        BuiltInType::UInt32 => Variant::UInt32(body.as_u64().ok_or(err)? as u32),
        BuiltInType::Int64 => {
            let s = body.as_str().ok_or(err)?;
            Variant::Int64(s.parse().map_err(|_| err)?)
        }
        BuiltInType::UInt64 => {
            let s = body.as_str().ok_or(err)?;
            Variant::UInt64(s.parse().map_err(|_| err)?)
        }
        BuiltInType::Float => Variant::Float(body.as_f64().ok_or(err)? as f32),
        BuiltInType::Double => Variant::Double(body.as_f64().ok_or(err)?),
        BuiltInType::String => Variant::String(body.as_str().ok_or(err)?.to_string()),
        BuiltInType::DateTime => {
            Variant::DateTime(datetime_from_iso(body.as_str().ok_or(err)?).ok_or(err)?)
        }
        BuiltInType::ByteString => {
            let s = body.as_str().ok_or(err)?;
            Variant::ByteString(
                base64::engine::general_purpose::STANDARD.decode(s).map_err(|_| err)?,
            )
        }
        BuiltInType::StatusCode => Variant::StatusCode(StatusCode(body.as_u64().ok_or(err)? as u32)),
        _ => return Err(StatusCode::BAD_NOT_SUPPORTED),
    })
}

fn data_value_to_json(dv: &DataValue) -> Value {
    let mut obj = Map::new();
    if let Some(v) = &dv.value {
        obj.insert("Value".into(), variant_to_json(v));
    }
    if let Some(sc) = dv.status {
        obj.insert("StatusCode".into(), json!(sc.0));
    }
    if let Some(ts) = dv.source_timestamp {
        obj.insert("SourceTimestamp".into(), json!(datetime_to_iso(ts)));
    }
    if let Some(ts) = dv.server_timestamp {
        obj.insert("ServerTimestamp".into(), json!(datetime_to_iso(ts)));
    }
    Value::Object(obj)
}

fn data_value_from_json(v: &Value) -> crate::Result<DataValue> {
    let obj = v.as_object().ok_or(StatusCode::BAD_DECODING_ERROR)?;
    let mut dv = DataValue::default();
    if let Some(value) = obj.get("Value") {
        dv.value = Some(variant_from_json(value)?);
    }
    if let Some(sc) = obj.get("StatusCode").and_then(Value::as_u64) {
        dv.status = Some(StatusCode(sc as u32));
    }
    if let Some(ts) = obj.get("SourceTimestamp").and_then(Value::as_str) {
        dv.source_timestamp = datetime_from_iso(ts);
    }
    if let Some(ts) = obj.get("ServerTimestamp").and_then(Value::as_str) {
        dv.server_timestamp = datetime_from_iso(ts);
    }
    Ok(dv)
}

// ============================================================================
// NetworkMessage <-> JSON
// ============================================================================

fn publisher_id_string(pid: &PublisherId) -> String {
    match pid {
        PublisherId::Byte(v) => v.to_string(),
        PublisherId::UInt16(v) => v.to_string(),
        PublisherId::UInt32(v) => v.to_string(),
        PublisherId::UInt64(v) => v.to_string(),
        PublisherId::String(s) => s.clone(),
    }
}

fn field_name(meta: Option<&EncodingMetaData>, index: usize) -> String {
    meta.and_then(|m| m.fields.get(index))
        .map(|f| f.name.clone())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("Field{}", index))
}

/// Encode a NetworkMessage as a `ua-data` JSON buffer.
pub fn encode(nm: &NetworkMessage, meta: &[EncodingMetaData]) -> crate::Result<Vec<u8>> {
    let pid = nm
        .publisher_id
        .as_ref()
        .map(publisher_id_string)
        .unwrap_or_default();

    let mut messages = Vec::with_capacity(nm.messages.len());
    for (i, dsm) in nm.messages.iter().enumerate() {
        let writer_id = nm.writer_id_at(i).unwrap_or_default();
        let m = crate::protocol::find_meta(meta, writer_id);

        let mut obj = Map::new();
        obj.insert("DataSetWriterId".into(), json!(writer_id));
        obj.insert("MessageType".into(), json!(message_type_name(dsm.header.message_type)));
        if dsm.header.sequence_number_enabled {
            obj.insert("SequenceNumber".into(), json!(dsm.header.sequence_number));
        }
        if dsm.header.timestamp_enabled {
            obj.insert("Timestamp".into(), json!(datetime_to_iso(dsm.header.timestamp)));
        }
        if dsm.header.status_enabled {
            obj.insert("Status".into(), json!((dsm.header.status as u32) << 16));
        }
        if dsm.header.config_version_major_enabled || dsm.header.config_version_minor_enabled {
            obj.insert(
                "MetaDataVersion".into(),
                json!({
                    "MajorVersion": dsm.header.config_version_major,
                    "MinorVersion": dsm.header.config_version_minor,
                }),
            );
        }

        let mut payload = Map::new();
        match &dsm.payload {
            DataSetPayload::KeyFrame(fields) => {
                for (fi, dv) in fields.iter().enumerate() {
                    let name = field_name(m, fi);
                    let value = if dsm.header.field_encoding == FieldEncoding::DataValue {
                        data_value_to_json(dv)
                    } else {
                        variant_to_json(dv.value.as_ref().unwrap_or(&Variant::Empty))
                    };
                    payload.insert(name, value);
                }
            }
            DataSetPayload::DeltaFrame(fields) => {
                for (index, dv) in fields {
                    let name = field_name(m, *index as usize);
                    let value = if dsm.header.field_encoding == FieldEncoding::DataValue {
                        data_value_to_json(dv)
                    } else {
                        variant_to_json(dv.value.as_ref().unwrap_or(&Variant::Empty))
                    };
                    payload.insert(name, value);
                }
            }
            DataSetPayload::KeepAlive => {}
            // Raw framing has no JSON form.
            DataSetPayload::RawKeyFrame(_) => return Err(StatusCode::BAD_NOT_SUPPORTED),
        }
        if !payload.is_empty() || dsm.header.message_type != DataSetMessageType::KeepAlive {
            obj.insert("Payload".into(), Value::Object(payload));
        }
        messages.push(Value::Object(obj));
    }

    let doc = json!({
        "MessageId": format!("{}-{}", pid, nm.group_header.sequence_number),
        "MessageType": "ua-data",
        "PublisherId": pid,
        "Messages": messages,
    });
    serde_json::to_vec(&doc).map_err(|_| StatusCode::BAD_ENCODING_ERROR)
}

/// Decode a `ua-data` JSON buffer. Field values are ordered by the matching
/// reader metadata; unknown field names are ignored.
pub fn decode(bytes: &[u8], meta: &[EncodingMetaData]) -> crate::Result<NetworkMessage> {
    let doc: Value =
        serde_json::from_slice(bytes).map_err(|_| StatusCode::BAD_DECODING_ERROR)?;
    let obj = doc.as_object().ok_or(StatusCode::BAD_DECODING_ERROR)?;
    if obj.get("MessageType").and_then(Value::as_str) != Some("ua-data") {
        return Err(StatusCode::BAD_DECODING_ERROR);
    }

    let mut nm = NetworkMessage::new();
    if let Some(pid) = obj.get("PublisherId") {
        nm.publisher_id_enabled = true;
        nm.publisher_id = Some(match pid {
            Value::String(s) => PublisherId::String(s.clone()),
            Value::Number(n) => PublisherId::String(n.to_string()),
            _ => return Err(StatusCode::BAD_DECODING_ERROR),
        });
    }
    nm.payload_header_enabled = true;

    let messages = obj
        .get("Messages")
        .and_then(Value::as_array)
        .ok_or(StatusCode::BAD_DECODING_ERROR)?;
    for msg in messages {
        let m = msg.as_object().ok_or(StatusCode::BAD_DECODING_ERROR)?;
        let writer_id = m.get("DataSetWriterId").and_then(Value::as_u64).unwrap_or(0) as u16;
        nm.dataset_writer_ids.push(writer_id);

        let mut header = DataSetMessageHeader {
            valid: true,
            message_type: message_type_from_name(
                m.get("MessageType").and_then(Value::as_str).unwrap_or("ua-keyframe"),
            ),
            ..Default::default()
        };
        if let Some(seq) = m.get("SequenceNumber").and_then(Value::as_u64) {
            header.sequence_number_enabled = true;
            header.sequence_number = seq as u16;
        }
        if let Some(ts) = m.get("Timestamp").and_then(Value::as_str) {
            if let Some(dt) = datetime_from_iso(ts) {
                header.timestamp_enabled = true;
                header.timestamp = dt;
            }
        }
        if let Some(status) = m.get("Status").and_then(Value::as_u64) {
            header.status_enabled = true;
            header.status = (status >> 16) as u16;
        }
        if let Some(v) = m.get("MetaDataVersion").and_then(Value::as_object) {
            header.config_version_major_enabled = true;
            header.config_version_minor_enabled = true;
            header.config_version_major =
                v.get("MajorVersion").and_then(Value::as_u64).unwrap_or(0) as u32;
            header.config_version_minor =
                v.get("MinorVersion").and_then(Value::as_u64).unwrap_or(0) as u32;
        }

        let payload = match m.get("Payload").and_then(Value::as_object) {
            None => DataSetPayload::KeepAlive,
            Some(fields_obj) => {
                // Order the fields by the reader's metadata.
                let layout = crate::protocol::find_meta(meta, writer_id);
                let mut fields = Vec::new();
                if let Some(layout) = layout {
                    for fm in &layout.fields {
                        let Some(value) = fields_obj.get(&fm.name) else {
                            fields.push(DataValue::default());
                            continue;
                        };
                        let dv = if value.get("Type").is_some() {
                            DataValue::from_variant(variant_from_json(value)?)
                        } else {
                            data_value_from_json(value)?
                        };
                        fields.push(dv);
                    }
                } else {
                    for value in fields_obj.values() {
                        let dv = if value.get("Type").is_some() {
                            DataValue::from_variant(variant_from_json(value)?)
                        } else {
                            data_value_from_json(value)?
                        };
                        fields.push(dv);
                    }
                }
                header.field_encoding = FieldEncoding::Variant;
                DataSetPayload::KeyFrame(fields)
            }
        };
        nm.messages.push(DataSetMessage { header, payload });
    }

    Ok(nm)
}
