//! Bidirectional codec between Rhai's `Dynamic` and the canonical JSON
//! encoded-value wire format used at every FFI crossing.

use rhai::Dynamic;
use serde_json::{json, Value as JsonValue};

use crate::error::CoreError;

const TOKEN_INFINITY: &str = "__INFINITY__";
const TOKEN_NEG_INFINITY: &str = "__NEG_INFINITY__";
const TOKEN_NAN: &str = "__NAN__";

/// Encodes a Rhai value as a JSON text string.
pub fn encode_value(value: &Dynamic) -> Result<String, CoreError> {
    let json_value = dynamic_to_json(value)?;
    serde_json::to_string(&json_value)
        .map_err(|e| CoreError::ffi(format!("encode error: {e}")))
}

fn dynamic_to_json(value: &Dynamic) -> Result<JsonValue, CoreError> {
    if value.is_unit() {
        return Ok(JsonValue::Null);
    }
    if value.is_bool() {
        return Ok(json!(value.as_bool().unwrap()));
    }
    if value.is_int() {
        return Ok(json!(value.as_int().unwrap()));
    }
    if value.is_float() {
        let f = value.as_float().unwrap();
        if f.is_infinite() {
            return Ok(json!(if f.is_sign_positive() {
                TOKEN_INFINITY
            } else {
                TOKEN_NEG_INFINITY
            }));
        }
        if f.is_nan() {
            return Ok(json!(TOKEN_NAN));
        }
        return Ok(json!(f));
    }
    if value.is_string() {
        return Ok(json!(value.clone().cast::<String>()));
    }
    if value.is_array() {
        let array = value.clone().cast::<rhai::Array>();
        let encoded: Result<Vec<JsonValue>, CoreError> =
            array.iter().map(dynamic_to_json).collect();
        return Ok(JsonValue::Array(encoded?));
    }
    if value.is_map() {
        let map = value.clone().cast::<rhai::Map>();
        let mut object = serde_json::Map::new();
        for (key, value) in map.iter() {
            object.insert(key.to_string(), dynamic_to_json(value)?);
        }
        return Ok(JsonValue::Object(object));
    }

    Err(CoreError::ffi(format!(
        "type not convertible: {}",
        value.type_name()
    )))
}

/// Decodes a JSON text string into a Rhai value.
pub fn decode_value(encoded: &str) -> Result<Dynamic, CoreError> {
    let json_value: JsonValue = serde_json::from_str(encoded)
        .map_err(|e| CoreError::ffi(format!("decode error: {e}")))?;
    json_to_dynamic(&json_value)
}

fn json_to_dynamic(value: &JsonValue) -> Result<Dynamic, CoreError> {
    match value {
        JsonValue::Null => Ok(Dynamic::UNIT),
        JsonValue::Bool(b) => Ok(Dynamic::from(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Dynamic::from(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Dynamic::from(f))
            } else {
                Err(CoreError::ffi(format!("unsupported number: {n}")))
            }
        }
        JsonValue::String(s) => match s.as_str() {
            TOKEN_INFINITY => Ok(Dynamic::from(f64::INFINITY)),
            TOKEN_NEG_INFINITY => Ok(Dynamic::from(f64::NEG_INFINITY)),
            TOKEN_NAN => Ok(Dynamic::from(f64::NAN)),
            _ => Ok(Dynamic::from(s.clone())),
        },
        JsonValue::Array(items) => {
            let decoded: Result<Vec<Dynamic>, CoreError> =
                items.iter().map(json_to_dynamic).collect();
            Ok(Dynamic::from(decoded?))
        }
        JsonValue::Object(fields) => {
            let mut map = rhai::Map::new();
            for (key, value) in fields.iter() {
                map.insert(key.clone().into(), json_to_dynamic(value)?);
            }
            Ok(Dynamic::from(map))
        }
    }
}

/// Encodes a `Vec<Dynamic>` as a JSON array string, used to marshal callback
/// argument lists.
pub fn encode_args(args: &[Dynamic]) -> Result<String, CoreError> {
    let encoded: Result<Vec<JsonValue>, CoreError> = args.iter().map(dynamic_to_json).collect();
    serde_json::to_string(&JsonValue::Array(encoded?))
        .map_err(|e| CoreError::ffi(format!("encode error: {e}")))
}
