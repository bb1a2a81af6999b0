use serde::{Serialize, Serializer};

/// The OTLP AnyValue union. Serialization matches the protobuf JSON mapping:
/// an object with exactly one of the variant keys, and 64-bit integers
/// rendered as decimal strings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AnyValue {
    StringValue(String),
    BoolValue(bool),
    #[serde(serialize_with = "serialize_i64_as_string")]
    IntValue(i64),
    DoubleValue(f64),
    ArrayValue(ArrayValue),
    KvlistValue(KeyValueList),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrayValue {
    pub values: Vec<AnyValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyValueList {
    pub values: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyValue {
    pub key: String,
    pub value: AnyValue,
}

impl KeyValue {
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> KeyValue {
        KeyValue {
            key: key.into(),
            value: AnyValue::StringValue(value.into()),
        }
    }

    pub fn int(key: impl Into<String>, value: i64) -> KeyValue {
        KeyValue {
            key: key.into(),
            value: AnyValue::IntValue(value),
        }
    }
}

impl AnyValue {
    /// Re-shapes a JSON tree into the AnyValue union: objects become kvlists,
    /// arrays become arrays, numbers split into int/double, and anything
    /// without a structured mapping is stringified.
    pub fn from_json(value: &serde_json::Value) -> AnyValue {
        match value {
            serde_json::Value::Bool(b) => AnyValue::BoolValue(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    AnyValue::IntValue(i)
                } else if let Some(f) = n.as_f64() {
                    AnyValue::DoubleValue(f)
                } else {
                    AnyValue::StringValue(n.to_string())
                }
            }
            serde_json::Value::String(s) => AnyValue::StringValue(s.clone()),
            serde_json::Value::Array(items) => AnyValue::ArrayValue(ArrayValue {
                values: items.iter().map(AnyValue::from_json).collect(),
            }),
            serde_json::Value::Object(entries) => AnyValue::KvlistValue(KeyValueList {
                values: entries
                    .iter()
                    .map(|(key, value)| KeyValue {
                        key: key.clone(),
                        value: AnyValue::from_json(value),
                    })
                    .collect(),
            }),
            other => AnyValue::StringValue(other.to_string()),
        }
    }
}

pub(crate) fn serialize_i64_as_string<S: Serializer>(
    value: &i64,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string())
}

pub(crate) fn serialize_u64_as_string<S: Serializer>(
    value: &u64,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_shaping() {
        assert_eq!(
            AnyValue::from_json(&json!("text")),
            AnyValue::StringValue("text".to_owned())
        );
        assert_eq!(AnyValue::from_json(&json!(true)), AnyValue::BoolValue(true));
        assert_eq!(AnyValue::from_json(&json!(42)), AnyValue::IntValue(42));
        assert_eq!(
            AnyValue::from_json(&json!(2.5)),
            AnyValue::DoubleValue(2.5)
        );
        assert_eq!(
            AnyValue::from_json(&json!(null)),
            AnyValue::StringValue("null".to_owned())
        );
    }

    #[test]
    fn nested_shaping() {
        let shaped = AnyValue::from_json(&json!({
            "message": "hello",
            "counts": [1, 2],
            "labels": {"app": "web"}
        }));

        let AnyValue::KvlistValue(list) = shaped else {
            panic!("expected kvlist");
        };
        assert_eq!(list.values.len(), 3);
        assert_eq!(list.values[0].key, "counts");
        assert_eq!(
            list.values[0].value,
            AnyValue::ArrayValue(ArrayValue {
                values: vec![AnyValue::IntValue(1), AnyValue::IntValue(2)],
            })
        );
    }

    #[test]
    fn wire_encoding() {
        let encoded = serde_json::to_value(AnyValue::IntValue(1_620_000_000)).unwrap();
        assert_eq!(encoded, json!({"intValue": "1620000000"}));

        let encoded = serde_json::to_value(AnyValue::StringValue("x".into())).unwrap();
        assert_eq!(encoded, json!({"stringValue": "x"}));

        let encoded = serde_json::to_value(AnyValue::KvlistValue(KeyValueList {
            values: vec![KeyValue::string("k", "v")],
        }))
        .unwrap();
        assert_eq!(
            encoded,
            json!({"kvlistValue": {"values": [{"key": "k", "value": {"stringValue": "v"}}]}})
        );
    }
}
