//! SHIP envelope and the EEBUS-JSON transform.
//!
//! On the wire every frame is a one-byte type prefix followed by
//! "EEBUS-JSON": a JSON encoding where each object is rewritten into an
//! array of single-key objects so that field order survives transport. The
//! transform is a bijection on all SHIP control models.
//!
//! SPINE payloads inside `Data` frames must pass through byte-structure
//! intact; the encoder therefore transforms the payload separately and
//! splices it over a placeholder after the envelope transform ran.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::api::ShipError;
use crate::ship::model::{ShipData, ShipDataHeader, ShipDataType, MSG_TYPE_DATA, SHIP_PROTOCOL_ID};

const PAYLOAD_PLACEHOLDER: &str = r#"{"place":"holder"}"#;

// ────────────────────────────────────────────────────────────────────────────
// EEBUS-JSON transform
// ────────────────────────────────────────────────────────────────────────────

/// Plain JSON → EEBUS-JSON: objects become arrays of single-key objects,
/// arrays are walked element-wise, scalars pass through.
pub(crate) fn json_to_eebus(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Array(
            map.iter()
                .map(|(key, inner)| {
                    let mut entry = Map::new();
                    entry.insert(key.clone(), json_to_eebus(inner));
                    Value::Object(entry)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(json_to_eebus).collect()),
        other => other.clone(),
    }
}

/// EEBUS-JSON → plain JSON, inverse of [`json_to_eebus`].
///
/// An array whose elements are all single-key objects with distinct keys is
/// folded back into one object; an empty array folds into an empty object
/// (SHIP models have no empty list fields, so this stays unambiguous).
pub(crate) fn eebus_to_json(value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Value::Object(Map::new());
            }
            let single_keyed = items
                .iter()
                .all(|item| matches!(item, Value::Object(map) if map.len() == 1));
            if single_keyed {
                let mut merged = Map::new();
                let mut distinct = true;
                for item in items {
                    let map = item.as_object().expect("checked above");
                    let (key, inner) = map.iter().next().expect("checked above");
                    if merged.insert(key.clone(), eebus_to_json(inner)).is_some() {
                        distinct = false;
                        break;
                    }
                }
                if distinct {
                    return Value::Object(merged);
                }
            }
            Value::Array(items.iter().map(eebus_to_json).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| (key.clone(), eebus_to_json(inner)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Frame encode / decode
// ────────────────────────────────────────────────────────────────────────────

/// Serialize a SHIP model into a framed wire message: type byte plus the
/// EEBUS-JSON body.
pub(crate) fn encode_model<T: Serialize>(msg_type: u8, model: &T) -> Result<Vec<u8>, ShipError> {
    let value = serde_json::to_value(model)
        .map_err(|err| ShipError::Protocol(format!("serializing ship model: {err}")))?;
    let body = serde_json::to_string(&json_to_eebus(&value))
        .map_err(|err| ShipError::Protocol(format!("encoding ship model: {err}")))?;

    let mut frame = Vec::with_capacity(1 + body.len());
    frame.push(msg_type);
    frame.extend_from_slice(body.as_bytes());
    Ok(frame)
}

/// Split a frame into its type byte and the plain-JSON body.
pub(crate) fn decode_frame(frame: &[u8]) -> Option<(u8, Value)> {
    let (&msg_type, body) = frame.split_first()?;
    let value: Value = serde_json::from_slice(body).ok()?;
    Some((msg_type, eebus_to_json(&value)))
}

/// Decode a control frame body into a concrete SHIP model.
pub(crate) fn decode_model<T: DeserializeOwned>(frame: &[u8]) -> Option<T> {
    let (_, value) = decode_frame(frame)?;
    serde_json::from_value(value).ok()
}

// ────────────────────────────────────────────────────────────────────────────
// SPINE data frames
// ────────────────────────────────────────────────────────────────────────────

/// Envelope a SPINE payload into a SHIP `Data` frame.
///
/// The payload is transformed on its own and spliced over a placeholder so
/// the envelope transform cannot re-wrap it.
pub(crate) fn encode_spine_payload(payload: &[u8]) -> Result<Vec<u8>, ShipError> {
    let spine: Value = serde_json::from_slice(payload)
        .map_err(|err| ShipError::Protocol(format!("invalid spine payload: {err}")))?;
    let spine_eebus = serde_json::to_string(&json_to_eebus(&spine))
        .map_err(|err| ShipError::Protocol(format!("encoding spine payload: {err}")))?;

    let placeholder: Value =
        serde_json::from_str(PAYLOAD_PLACEHOLDER).expect("static placeholder is valid json");
    let envelope = ShipData {
        data: ShipDataType {
            header: ShipDataHeader {
                protocol_id: SHIP_PROTOCOL_ID.to_string(),
            },
            payload: placeholder,
        },
    };

    let value = serde_json::to_value(&envelope)
        .map_err(|err| ShipError::Protocol(format!("serializing data envelope: {err}")))?;
    let body = serde_json::to_string(&json_to_eebus(&value))
        .map_err(|err| ShipError::Protocol(format!("encoding data envelope: {err}")))?;
    let body = body.replace(&format!("[{PAYLOAD_PLACEHOLDER}]"), &spine_eebus);

    let mut frame = Vec::with_capacity(1 + body.len());
    frame.push(MSG_TYPE_DATA);
    frame.extend_from_slice(body.as_bytes());
    Ok(frame)
}

/// Extract the SPINE payload from a SHIP `Data` frame as plain JSON bytes.
pub(crate) fn decode_spine_payload(frame: &[u8]) -> Result<Vec<u8>, ShipError> {
    let (_, value) =
        decode_frame(frame).ok_or_else(|| ShipError::Protocol("invalid data frame".into()))?;
    let data: ShipData = serde_json::from_value(value)
        .map_err(|err| ShipError::Protocol(format!("invalid data envelope: {err}")))?;
    if data.data.payload.is_null() {
        return Err(ShipError::Protocol("received no valid payload".into()));
    }
    serde_json::to_vec(&data.data.payload)
        .map_err(|err| ShipError::Protocol(format!("decoding spine payload: {err}")))
}

/// A frame carrying a SPINE datagram rather than SHIP control traffic.
pub(crate) fn has_spine_datagram(frame: &[u8]) -> bool {
    frame
        .windows(b"datagram".len())
        .any(|window| window == b"datagram")
}
