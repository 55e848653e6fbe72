//! # Record Classifier
//!
//! Classifies a radio line into exactly one [`ClassifiedRecord`].
//!
//! Two wire generations are accepted:
//!
//! - **Enveloped**: carries a `protocol` marker; `meta.data_type` selects the
//!   record kind (`coded_id`, `node_coded_id`, `node_health`, `telemetry`).
//! - **Legacy**: no marker; the record kind is given by which key is present
//!   (`tag`, `node_beep` + `node_tag`, `node_alive`), either at the top level
//!   or under `data`.
//!
//! Fields are matched by pattern rather than strict schema: ids may be
//! strings or numbers, numeric fields may be integers or floats, and unknown
//! keys are ignored.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

use super::types::*;
use crate::serial::RawMessage;

/// Key whose presence marks the enveloped generation
pub const GENERATION_MARKER: &str = "protocol";

/// Length of a tag id carrying a 2-character CRC suffix
pub const CRC_TAG_ID_LEN: usize = 10;

/// Length of a bare tag id
pub const BASE_TAG_ID_LEN: usize = 8;

type Classification = std::result::Result<ClassifiedRecord, String>;

/// Classify one radio line
///
/// Never fails: anything that is not a recognised record, including lines
/// that are not valid JSON, comes back as [`ClassifiedRecord::Unrecognized`]
/// with the reason attached.
///
/// # Examples
///
/// ```
/// use station_core::record::{classify, ClassifiedRecord};
/// use station_core::serial::RawMessage;
///
/// let msg = RawMessage::now(2, r#"{"tag":{"id":"ABCD1234"},"rssi":-71}"#);
/// match classify(&msg) {
///     ClassifiedRecord::Beep(beep) => assert_eq!(beep.tag_id, "ABCD1234"),
///     other => panic!("unexpected {:?}", other),
/// }
/// ```
pub fn classify(msg: &RawMessage) -> ClassifiedRecord {
    let value: Value = match serde_json::from_str(&msg.line) {
        Ok(value) => value,
        Err(e) => return unrecognized(msg, format!("not a JSON document: {}", e)),
    };

    let Some(object) = value.as_object() else {
        return unrecognized(msg, "not a JSON object".to_string());
    };

    let result = if object.contains_key(GENERATION_MARKER) {
        classify_enveloped(msg, object)
    } else {
        classify_legacy(msg, object)
    };

    result.unwrap_or_else(|reason| unrecognized(msg, reason))
}

/// Strip a CRC suffix from a tag id
///
/// Returns the base id and whether it was validated by the radio.
pub fn normalize_tag_id(id: &str) -> (String, bool) {
    if id.len() == CRC_TAG_ID_LEN && id.is_char_boundary(BASE_TAG_ID_LEN) {
        (id[..BASE_TAG_ID_LEN].to_string(), true)
    } else {
        (id.to_string(), false)
    }
}

/// Detection time of a relayed record; never later than receipt
pub fn relay_recorded_at(received_at: DateTime<Utc>, offset_ms: i64) -> DateTime<Utc> {
    received_at - Duration::milliseconds(offset_ms.max(0))
}

fn classify_enveloped(msg: &RawMessage, object: &Map<String, Value>) -> Classification {
    let meta = object
        .get("meta")
        .and_then(Value::as_object)
        .ok_or("envelope without meta")?;
    let data_type = meta
        .get("data_type")
        .and_then(Value::as_str)
        .ok_or("envelope without meta.data_type")?;
    let data = object.get("data").and_then(Value::as_object);
    let rssi = meta.get("rssi").and_then(as_i32);
    let source_id = object
        .get("source")
        .and_then(|s| s.get("id"))
        .and_then(id_string);

    match data_type {
        "coded_id" | "node_coded_id" => {
            let data = data.ok_or_else(|| format!("{} without data", data_type))?;
            let raw_id = data.get("id").and_then(id_string).ok_or("coded id without data.id")?;
            let (tag_id, validated) = normalize_tag_id(&raw_id);

            let (node_id, recorded_at) = if data_type == "node_coded_id" {
                let node_id = source_id
                    .or_else(|| data.get("node_id").and_then(id_string))
                    .ok_or("node_coded_id without source node id")?;
                let offset = data.get("offset_ms").and_then(as_i64).unwrap_or(0);
                (Some(node_id), relay_recorded_at(msg.received_at, offset))
            } else {
                (None, msg.received_at)
            };

            Ok(ClassifiedRecord::Beep(BeepRecord {
                channel: msg.channel,
                received_at: msg.received_at,
                recorded_at,
                tag_id,
                rssi,
                node_id,
                validated,
                error_bits: data.get("error_bits").and_then(as_u32),
            }))
        }
        "node_health" => {
            let data = data.ok_or("node_health without data")?;
            let node_id = source_id
                .or_else(|| data.get("id").and_then(id_string))
                .ok_or("node_health without node id")?;
            Ok(ClassifiedRecord::NodeHealth(node_health(msg, node_id, rssi, data)))
        }
        "telemetry" => {
            let data = data.ok_or("telemetry without data")?;
            let hardware_id = data
                .get("id")
                .and_then(id_string)
                .or(source_id)
                .ok_or("telemetry without hardware id")?;
            Ok(ClassifiedRecord::Telemetry(TelemetryRecord {
                channel: msg.channel,
                received_at: msg.received_at,
                recorded_at: msg.received_at,
                hardware_id,
                rssi,
                payload: Value::Object(data.clone()),
            }))
        }
        other => Err(format!("unknown data_type '{}'", other)),
    }
}

fn classify_legacy(msg: &RawMessage, object: &Map<String, Value>) -> Classification {
    let body = legacy_body(object);
    let rssi = object.get("rssi").and_then(as_i32);

    if let Some(tag) = body.get("tag") {
        let (raw_id, error_bits) = match tag {
            Value::Object(tag) => (
                tag.get("id").or_else(|| tag.get("tag_id")).and_then(id_string),
                tag.get("error_bits").and_then(as_u32),
            ),
            other => (id_string(other), body.get("error_bits").and_then(as_u32)),
        };
        let tag_id = raw_id.ok_or("tag without id")?;
        return Ok(ClassifiedRecord::Beep(BeepRecord {
            channel: msg.channel,
            received_at: msg.received_at,
            recorded_at: msg.received_at,
            tag_id,
            rssi,
            node_id: None,
            validated: false,
            error_bits,
        }));
    }

    if let (Some(node_beep), Some(node_tag)) = (body.get("node_beep"), body.get("node_tag")) {
        let node_id = node_beep.get("id").and_then(id_string).ok_or("node_beep without id")?;
        let tag_id = node_tag
            .get("tag_id")
            .or_else(|| node_tag.get("id"))
            .and_then(id_string)
            .ok_or("node_tag without tag_id")?;
        let offset_ms = node_beep.get("offset_ms").and_then(as_i64).unwrap_or(0);

        return Ok(ClassifiedRecord::NodeRelayBeep(NodeRelayBeepRecord {
            beep: BeepRecord {
                channel: msg.channel,
                received_at: msg.received_at,
                recorded_at: relay_recorded_at(msg.received_at, offset_ms),
                tag_id,
                rssi: node_beep.get("tag_rssi").and_then(as_i32),
                node_id: Some(node_id),
                validated: false,
                error_bits: node_tag.get("error_bits").and_then(as_u32),
            },
            node_rssi: rssi,
            offset_ms,
        }));
    }

    if let Some(node_alive) = body.get("node_alive").and_then(Value::as_object) {
        let node_id = node_alive.get("id").and_then(id_string).ok_or("node_alive without id")?;
        return Ok(ClassifiedRecord::NodeHealth(node_health(msg, node_id, rssi, node_alive)));
    }

    Err("no recognised record keys".to_string())
}

/// Legacy records nest their payload under `data` in later firmware
fn legacy_body(object: &Map<String, Value>) -> &Map<String, Value> {
    match object.get("data").and_then(Value::as_object) {
        Some(data) if ["tag", "node_beep", "node_alive"].iter().any(|k| data.contains_key(*k)) => data,
        _ => object,
    }
}

fn node_health(
    msg: &RawMessage,
    node_id: String,
    rssi: Option<i32>,
    data: &Map<String, Value>,
) -> NodeHealthRecord {
    NodeHealthRecord {
        channel: msg.channel,
        received_at: msg.received_at,
        recorded_at: msg.received_at,
        node_id,
        rssi,
        firmware: data.get("firmware").or_else(|| data.get("fw")).and_then(id_string),
        battery_mv: data.get("battery_mv").or_else(|| data.get("bat_mv")).and_then(as_u32),
        celsius: data.get("celsius").or_else(|| data.get("temp_c")).and_then(Value::as_f64),
    }
}

fn unrecognized(msg: &RawMessage, reason: String) -> ClassifiedRecord {
    ClassifiedRecord::Unrecognized(UnrecognizedRecord {
        channel: msg.channel,
        received_at: msg.received_at,
        line: msg.line.clone(),
        reason,
    })
}

/// Ids arrive as strings or bare numbers
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_f64().map(|f| f.round() as i64))
}

fn as_i32(value: &Value) -> Option<i32> {
    as_i64(value).and_then(|v| i32::try_from(v).ok())
}

fn as_u32(value: &Value) -> Option<u32> {
    as_i64(value).and_then(|v| u32::try_from(v).ok())
}
