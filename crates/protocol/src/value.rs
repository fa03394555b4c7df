//! Value model carried by the RPC bridge.
//!
//! [`RpcValue`] is JSON extended with raw byte buffers. On the wire a byte
//! buffer travels as a single-key object `{"$bytes": "<base64>"}` so that a
//! message stays plain JSON end to end. A user mapping whose only key is one
//! of the tags is wrapped as `{"$object": {...}}` so it cannot be mistaken
//! for one.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

/// Object key marking an encoded byte buffer.
pub const BYTES_KEY: &str = "$bytes";
/// Object key wrapping a mapping that would otherwise look tagged.
pub const OBJECT_KEY: &str = "$object";

fn looks_tagged<V>(map: &BTreeMap<String, V>) -> bool {
	map.len() == 1 && map.keys().all(|k| k == BYTES_KEY || k == OBJECT_KEY)
}

/// A value exchanged with an instrumentation payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RpcValue {
	#[default]
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	String(String),
	Bytes(Vec<u8>),
	Array(Vec<RpcValue>),
	Object(BTreeMap<String, RpcValue>),
}

impl RpcValue {
	/// Converts a JSON value, decoding `{"$bytes": ...}` objects into
	/// [`RpcValue::Bytes`] and unwrapping `{"$object": {...}}`.
	///
	/// # Errors
	///
	/// Returns a description of the problem when a `$bytes` payload is not valid base64.
	pub fn from_json(value: Value) -> Result<Self, String> {
		Ok(match value {
			Value::Null => RpcValue::Null,
			Value::Bool(b) => RpcValue::Bool(b),
			Value::Number(n) => match n.as_i64() {
				Some(i) => RpcValue::Int(i),
				None => RpcValue::Float(n.as_f64().unwrap_or(f64::NAN)),
			},
			Value::String(s) => RpcValue::String(s),
			Value::Array(items) => RpcValue::Array(
				items
					.into_iter()
					.map(RpcValue::from_json)
					.collect::<Result<_, _>>()?,
			),
			Value::Object(mut map) => {
				if map.len() == 1 {
					if let Some(Value::String(encoded)) = map.get(BYTES_KEY) {
						let bytes = STANDARD
							.decode(encoded)
							.map_err(|e| format!("invalid byte buffer: {e}"))?;
						return Ok(RpcValue::Bytes(bytes));
					}
					if matches!(map.get(OBJECT_KEY), Some(Value::Object(_))) {
						if let Some(Value::Object(wrapped)) = map.remove(OBJECT_KEY) {
							map = wrapped;
						}
						return Ok(RpcValue::Object(decode_entries(map)?));
					}
				}
				RpcValue::Object(decode_entries(map)?)
			}
		})
	}

	/// Converts into JSON, encoding byte buffers as `{"$bytes": ...}`.
	pub fn to_json(&self) -> Value {
		match self {
			RpcValue::Null => Value::Null,
			RpcValue::Bool(b) => Value::Bool(*b),
			RpcValue::Int(i) => Value::Number((*i).into()),
			RpcValue::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
			RpcValue::String(s) => Value::String(s.clone()),
			RpcValue::Bytes(bytes) => {
				let mut map = Map::new();
				map.insert(BYTES_KEY.to_string(), Value::String(STANDARD.encode(bytes)));
				Value::Object(map)
			}
			RpcValue::Array(items) => Value::Array(items.iter().map(RpcValue::to_json).collect()),
			RpcValue::Object(map) => {
				let entries: Map<String, Value> = map
					.iter()
					.map(|(k, v)| (k.clone(), v.to_json()))
					.collect();
				if looks_tagged(map) {
					let mut wrapper = Map::new();
					wrapper.insert(OBJECT_KEY.to_string(), Value::Object(entries));
					Value::Object(wrapper)
				} else {
					Value::Object(entries)
				}
			}
		}
	}

	/// Returns true for [`RpcValue::Null`].
	pub fn is_null(&self) -> bool {
		matches!(self, RpcValue::Null)
	}

	pub fn as_bool(&self) -> Option<bool> {
		match self {
			RpcValue::Bool(b) => Some(*b),
			_ => None,
		}
	}

	pub fn as_i64(&self) -> Option<i64> {
		match self {
			RpcValue::Int(i) => Some(*i),
			_ => None,
		}
	}

	pub fn as_f64(&self) -> Option<f64> {
		match self {
			RpcValue::Int(i) => Some(*i as f64),
			RpcValue::Float(f) => Some(*f),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			RpcValue::String(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_bytes(&self) -> Option<&[u8]> {
		match self {
			RpcValue::Bytes(b) => Some(b),
			_ => None,
		}
	}

	pub fn as_array(&self) -> Option<&[RpcValue]> {
		match self {
			RpcValue::Array(items) => Some(items),
			_ => None,
		}
	}

	pub fn as_object(&self) -> Option<&BTreeMap<String, RpcValue>> {
		match self {
			RpcValue::Object(map) => Some(map),
			_ => None,
		}
	}

	/// Looks up a key when this value is an object.
	pub fn get(&self, key: &str) -> Option<&RpcValue> {
		self.as_object().and_then(|map| map.get(key))
	}
}

fn decode_entries(map: Map<String, Value>) -> Result<BTreeMap<String, RpcValue>, String> {
	map.into_iter()
		.map(|(k, v)| RpcValue::from_json(v).map(|v| (k, v)))
		.collect()
}

impl Serialize for RpcValue {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		self.to_json().serialize(serializer)
	}
}

impl<'de> Deserialize<'de> for RpcValue {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let value = Value::deserialize(deserializer)?;
		RpcValue::from_json(value).map_err(D::Error::custom)
	}
}

impl fmt::Display for RpcValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_json())
	}
}

impl From<bool> for RpcValue {
	fn from(b: bool) -> Self {
		RpcValue::Bool(b)
	}
}

impl From<i64> for RpcValue {
	fn from(i: i64) -> Self {
		RpcValue::Int(i)
	}
}

impl From<i32> for RpcValue {
	fn from(i: i32) -> Self {
		RpcValue::Int(i.into())
	}
}

impl From<u32> for RpcValue {
	fn from(i: u32) -> Self {
		RpcValue::Int(i.into())
	}
}

impl From<f64> for RpcValue {
	fn from(f: f64) -> Self {
		RpcValue::Float(f)
	}
}

impl From<&str> for RpcValue {
	fn from(s: &str) -> Self {
		RpcValue::String(s.to_string())
	}
}

impl From<String> for RpcValue {
	fn from(s: String) -> Self {
		RpcValue::String(s)
	}
}

impl From<Vec<u8>> for RpcValue {
	fn from(bytes: Vec<u8>) -> Self {
		RpcValue::Bytes(bytes)
	}
}

impl From<&[u8]> for RpcValue {
	fn from(bytes: &[u8]) -> Self {
		RpcValue::Bytes(bytes.to_vec())
	}
}

impl From<Vec<RpcValue>> for RpcValue {
	fn from(items: Vec<RpcValue>) -> Self {
		RpcValue::Array(items)
	}
}

impl From<BTreeMap<String, RpcValue>> for RpcValue {
	fn from(map: BTreeMap<String, RpcValue>) -> Self {
		RpcValue::Object(map)
	}
}

impl<T: Into<RpcValue>> From<Option<T>> for RpcValue {
	fn from(value: Option<T>) -> Self {
		value.map_or(RpcValue::Null, Into::into)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn bytes_encode_as_tagged_object() {
		let value = RpcValue::Bytes(vec![0, 1, 2, 255]);
		assert_eq!(value.to_json(), json!({"$bytes": "AAEC/w=="}));
	}

	#[test]
	fn nested_value_survives_json() {
		let mut inner = BTreeMap::new();
		inner.insert("blob".to_string(), RpcValue::Bytes(b"\x00hello".to_vec()));
		inner.insert("count".to_string(), RpcValue::Int(-7));
		let value = RpcValue::Array(vec![
			RpcValue::from("text"),
			RpcValue::Object(inner),
			RpcValue::Null,
		]);

		let text = serde_json::to_string(&value).unwrap();
		let back: RpcValue = serde_json::from_str(&text).unwrap();
		assert_eq!(back, value);
	}

	#[test]
	fn objects_with_extra_keys_are_not_bytes() {
		let value = RpcValue::from_json(json!({"$bytes": "AA==", "other": 1})).unwrap();
		assert!(value.as_object().is_some());
		assert_eq!(value.get("other"), Some(&RpcValue::Int(1)));
	}

	#[test]
	fn mappings_shaped_like_tags_keep_their_shape() {
		let mut lookalike = BTreeMap::new();
		lookalike.insert(BYTES_KEY.to_string(), RpcValue::from("hello"));
		let mut wrapped = BTreeMap::new();
		wrapped.insert(OBJECT_KEY.to_string(), RpcValue::Object(BTreeMap::new()));
		let value = RpcValue::Array(vec![RpcValue::Object(lookalike), RpcValue::Object(wrapped)]);

		let json = value.to_json();
		assert_eq!(json[0], json!({"$object": {"$bytes": "hello"}}));
		assert_eq!(json[1], json!({"$object": {"$object": {}}}));
		assert_eq!(RpcValue::from_json(json).unwrap(), value);
	}

	#[test]
	fn invalid_base64_is_rejected() {
		let err = RpcValue::from_json(json!({"$bytes": "!!!"})).unwrap_err();
		assert!(err.contains("invalid byte buffer"));
	}

	#[test]
	fn large_unsigned_numbers_become_floats() {
		let value = RpcValue::from_json(json!(u64::MAX)).unwrap();
		assert!(matches!(value, RpcValue::Float(_)));
	}
}
