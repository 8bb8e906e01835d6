//! IOP value model: categories, declared types and typed values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which collection of an agent interface an IOP belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IopCategory {
    /// Value received from other agents through mappings.
    Input,
    /// Value published to other agents.
    Output,
    /// Local configuration value, never published.
    Parameter,
}

impl IopCategory {
    /// All categories, in definition order.
    pub const ALL: [IopCategory; 3] = [
        IopCategory::Parameter,
        IopCategory::Input,
        IopCategory::Output,
    ];
}

impl fmt::Display for IopCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IopCategory::Input => write!(f, "input"),
            IopCategory::Output => write!(f, "output"),
            IopCategory::Parameter => write!(f, "parameter"),
        }
    }
}

/// Declared value type of an IOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IopType {
    Integer,
    Double,
    String,
    Bool,
    /// Payload-less trigger.
    Impulsion,
    /// Opaque binary blob.
    Data,
}

impl IopType {
    /// Canonical upper-case name, as used in definition JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            IopType::Integer => "INTEGER",
            IopType::Double => "DOUBLE",
            IopType::String => "STRING",
            IopType::Bool => "BOOL",
            IopType::Impulsion => "IMPULSION",
            IopType::Data => "DATA",
        }
    }
}

impl fmt::Display for IopType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed IOP value.
///
/// Every consumer matches exhaustively; there is no implicit coercion
/// between variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IopValue {
    Integer(i64),
    /// Non-finite values travel as `"NaN"`, `"inf"` or `"-inf"`.
    #[serde(with = "double_repr")]
    Double(f64),
    String(String),
    Bool(bool),
    Impulsion,
    Data(Vec<u8>),
}

impl IopValue {
    /// The type this value carries.
    pub fn value_type(&self) -> IopType {
        match self {
            IopValue::Integer(_) => IopType::Integer,
            IopValue::Double(_) => IopType::Double,
            IopValue::String(_) => IopType::String,
            IopValue::Bool(_) => IopType::Bool,
            IopValue::Impulsion => IopType::Impulsion,
            IopValue::Data(_) => IopType::Data,
        }
    }

    /// Whether this value may be stored in an IOP declared as `declared`.
    pub fn is_compatible_with(&self, declared: IopType) -> bool {
        self.value_type() == declared
    }

    /// Approximate payload size in bytes.
    pub fn payload_len(&self) -> usize {
        match self {
            IopValue::Integer(_) => std::mem::size_of::<i64>(),
            IopValue::Double(_) => std::mem::size_of::<f64>(),
            IopValue::String(s) => s.len(),
            IopValue::Bool(_) => 1,
            IopValue::Impulsion => 0,
            IopValue::Data(d) => d.len(),
        }
    }
}

/// JSON has no literal for NaN or the infinities, so those are written
/// as strings. Finite values stay plain numbers.
mod double_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() {
            serializer.serialize_str(if *value > 0.0 { "inf" } else { "-inf" })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(serde::de::Error::custom(format!(
                    "invalid DOUBLE value: {other:?}"
                ))),
            },
        }
    }
}

impl fmt::Display for IopValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IopValue::Integer(i) => write!(f, "{i}"),
            IopValue::Double(d) => write!(f, "{d}"),
            IopValue::String(s) => f.write_str(s),
            IopValue::Bool(b) => write!(f, "{b}"),
            IopValue::Impulsion => f.write_str("<impulsion>"),
            IopValue::Data(d) => write!(f, "<{} bytes>", d.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_finite_double_survives_json() {
        let nan = serde_json::to_string(&IopValue::Double(f64::NAN)).unwrap();
        assert_eq!(nan, r#"{"type":"DOUBLE","value":"NaN"}"#);
        match serde_json::from_str::<IopValue>(&nan).unwrap() {
            IopValue::Double(v) => assert!(v.is_nan()),
            other => panic!("expected a double, got {other:?}"),
        }

        for v in [f64::INFINITY, f64::NEG_INFINITY, -2.5] {
            let json = serde_json::to_string(&IopValue::Double(v)).unwrap();
            assert_eq!(serde_json::from_str::<IopValue>(&json).unwrap(), IopValue::Double(v));
        }
        assert!(serde_json::from_str::<IopValue>(r#"{"type":"DOUBLE","value":"big"}"#).is_err());
        assert!(serde_json::from_str::<IopValue>(r#"{"type":"DOUBLE","value":null}"#).is_err());
    }

    #[test]
    fn test_value_type_is_exact() {
        assert!(IopValue::Double(1.5).is_compatible_with(IopType::Double));
        assert!(!IopValue::Integer(1).is_compatible_with(IopType::Double));
        assert!(IopValue::Impulsion.is_compatible_with(IopType::Impulsion));
        assert!(!IopValue::Bool(true).is_compatible_with(IopType::Impulsion));
    }

    #[test]
    fn test_value_wire_shape() {
        let json = serde_json::to_string(&IopValue::Double(21.5)).unwrap();
        assert_eq!(json, r#"{"type":"DOUBLE","value":21.5}"#);

        let json = serde_json::to_string(&IopValue::Impulsion).unwrap();
        assert_eq!(json, r#"{"type":"IMPULSION"}"#);
        let back: IopValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, IopValue::Impulsion);
    }

    #[test]
    fn test_type_names() {
        let t: IopType = serde_json::from_str("\"BOOL\"").unwrap();
        assert_eq!(t, IopType::Bool);
        assert_eq!(IopType::Data.to_string(), "DATA");
        assert_eq!(IopCategory::Parameter.to_string(), "parameter");
    }
}
