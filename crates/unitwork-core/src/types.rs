//! Property type abstraction.
//!
//! A [`PropertyType`] knows how to compare, copy and serialize the values of
//! one property. The unit of work uses it exclusively for snapshot creation
//! and dirty checking; it never compares property values with `==` directly.
//!
//! Standard types are exposed as constants so entity shapes can reference them
//! from `const` property tables:
//!
//! ```ignore
//! const PROPS: &[PropertyInfo] = &[
//!     PropertyInfo::basic("name", &types::TEXT),
//!     PropertyInfo::basic("payload", &types::BINARY),
//! ];
//! ```

use crate::value::Value;
use std::fmt::Debug;

/// Comparison, copy and serialization rules for one property's values.
///
/// Implementations must be safe for concurrent read-only use; they are shared
/// by every unit of work opened from the same session factory.
pub trait PropertyType: Debug + Send + Sync {
    /// Type name used in logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Whether values of this type can be mutated in place.
    ///
    /// Snapshots of mutable values are taken with [`PropertyType::deep_copy`].
    fn is_mutable(&self) -> bool {
        false
    }

    /// Domain equality of two values.
    fn are_equal(&self, a: &Value, b: &Value) -> bool {
        a == b
    }

    /// Copy a value for use as a snapshot.
    fn deep_copy(&self, value: &Value) -> Value {
        value.clone()
    }

    /// JSON rendering of a value, used by debug dumps.
    fn to_json(&self, value: &Value) -> serde_json::Value {
        serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BooleanType;

impl PropertyType for BooleanType {
    fn name(&self) -> &'static str {
        "boolean"
    }

    fn to_json(&self, value: &Value) -> serde_json::Value {
        value
            .as_bool()
            .map_or(serde_json::Value::Null, serde_json::Value::Bool)
    }
}

/// 32 and 64 bit integers. `Int(3)` and `BigInt(3)` are equal.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerType;

impl PropertyType for IntegerType {
    fn name(&self) -> &'static str {
        "integer"
    }

    fn are_equal(&self, a: &Value, b: &Value) -> bool {
        match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        }
    }

    fn to_json(&self, value: &Value) -> serde_json::Value {
        value
            .as_i64()
            .map_or(serde_json::Value::Null, serde_json::Value::from)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DoubleType;

impl PropertyType for DoubleType {
    fn name(&self) -> &'static str {
        "double"
    }

    fn are_equal(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Double(x), Value::Double(y)) => x == y || (x.is_nan() && y.is_nan()),
            _ => a == b,
        }
    }
}

/// Decimal strings compared by numeric value: `"1.50"` equals `"1.5"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecimalType;

fn normalize_decimal(raw: &str) -> String {
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    let int_part = int_part.trim_start_matches('0');
    let frac_part = frac_part.trim_end_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    let is_zero = int_part == "0" && frac_part.is_empty();
    let sign = if negative && !is_zero { "-" } else { "" };
    if frac_part.is_empty() {
        format!("{sign}{int_part}")
    } else {
        format!("{sign}{int_part}.{frac_part}")
    }
}

impl PropertyType for DecimalType {
    fn name(&self) -> &'static str {
        "decimal"
    }

    fn are_equal(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Decimal(x), Value::Decimal(y)) => normalize_decimal(x) == normalize_decimal(y),
            _ => a == b,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TextType;

impl PropertyType for TextType {
    fn name(&self) -> &'static str {
        "text"
    }
}

/// Byte arrays. Mutable: compared by content, copied on snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryType;

impl PropertyType for BinaryType {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn is_mutable(&self) -> bool {
        true
    }

    fn are_equal(&self, a: &Value, b: &Value) -> bool {
        match (a.as_bytes(), b.as_bytes()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DateType;

impl PropertyType for DateType {
    fn name(&self) -> &'static str {
        "date"
    }

    fn is_mutable(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampType;

impl PropertyType for TimestampType {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn is_mutable(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UuidType;

impl PropertyType for UuidType {
    fn name(&self) -> &'static str {
        "uuid"
    }

    fn to_json(&self, value: &Value) -> serde_json::Value {
        match value {
            Value::Uuid(_) => serde_json::Value::String(value.to_string()),
            _ => serde_json::Value::Null,
        }
    }
}

/// JSON documents. Mutable; object key order is not significant.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonType;

impl PropertyType for JsonType {
    fn name(&self) -> &'static str {
        "json"
    }

    fn is_mutable(&self) -> bool {
        true
    }

    fn to_json(&self, value: &Value) -> serde_json::Value {
        match value {
            Value::Json(j) => j.clone(),
            _ => serde_json::Value::Null,
        }
    }
}

pub const BOOLEAN: BooleanType = BooleanType;
pub const INTEGER: IntegerType = IntegerType;
pub const DOUBLE: DoubleType = DoubleType;
pub const DECIMAL: DecimalType = DecimalType;
pub const TEXT: TextType = TextType;
pub const BINARY: BinaryType = BinaryType;
pub const DATE: DateType = DateType;
pub const TIMESTAMP: TimestampType = TimestampType;
pub const UUID: UuidType = UuidType;
pub const JSON: JsonType = JsonType;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widths_compare_equal() {
        assert!(INTEGER.are_equal(&Value::Int(3), &Value::BigInt(3)));
        assert!(!INTEGER.are_equal(&Value::Int(3), &Value::BigInt(4)));
        assert!(INTEGER.are_equal(&Value::Null, &Value::Null));
        assert!(!INTEGER.are_equal(&Value::Null, &Value::Int(0)));
    }

    #[test]
    fn test_decimal_scale_is_ignored() {
        let a = Value::Decimal("1.50".into());
        let b = Value::Decimal("001.5".into());
        assert!(DECIMAL.are_equal(&a, &b));
        assert!(DECIMAL.are_equal(
            &Value::Decimal("-0.00".into()),
            &Value::Decimal("0".into())
        ));
        assert!(!DECIMAL.are_equal(&a, &Value::Decimal("1.05".into())));
    }

    #[test]
    fn test_binary_compares_contents() {
        let a = Value::Bytes(vec![1, 2, 3]);
        let mut copy = BINARY.deep_copy(&a);
        assert!(BINARY.are_equal(&a, &copy));
        if let Value::Bytes(bytes) = &mut copy {
            bytes[0] = 9;
        }
        assert!(!BINARY.are_equal(&a, &copy));
        assert!(BINARY.is_mutable());
    }

    #[test]
    fn test_double_nan_is_stable() {
        assert!(DOUBLE.are_equal(&Value::Double(f64::NAN), &Value::Double(f64::NAN)));
        assert!(DOUBLE.are_equal(&Value::Double(0.0), &Value::Double(-0.0)));
    }

    #[test]
    fn test_json_ignores_key_order() {
        let a = Value::Json(serde_json::json!({"a": 1, "b": [1, 2]}));
        let b = Value::Json(serde_json::json!({"b": [1, 2], "a": 1}));
        assert!(JSON.are_equal(&a, &b));
        assert_eq!(JSON.to_json(&a), serde_json::json!({"a": 1, "b": [1, 2]}));
    }
}
