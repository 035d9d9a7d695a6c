use std::time::SystemTime;

use hashbrown::DefaultHashBuilder;

use indexmap::map::IndexMap;

use serde::{Deserialize, Serialize};

use serde_json::Value;

use crate::macros::map;

/// All [`DataType`]s.
pub const ALL_DATA_TYPES: &[DataType] = &[
    DataType::Any,
    DataType::Boolean,
    DataType::Integer,
    DataType::Float,
    DataType::String,
    DataType::Array,
    DataType::Object,
];

/// The type of the data stored in a resource.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Any value.
    Any,
    /// A boolean.
    Boolean,
    /// An integer number.
    Integer,
    /// A floating point number.
    Float,
    /// A string.
    String,
    /// An array of values.
    Array,
    /// A key-value object.
    Object,
}

impl std::fmt::Debug for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name().fmt(f)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name().fmt(f)
    }
}

impl DataType {
    /// Returns the [`DataType`] name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    /// Infers the [`DataType`] of a value.
    ///
    /// A null value has no type of its own, so it is mapped to
    /// [`DataType::Any`].
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Any,
            Value::Bool(_) => Self::Boolean,
            Value::Number(number) if number.is_f64() => Self::Float,
            Value::Number(_) => Self::Integer,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    /// Checks whether a value can be stored in a resource of this type.
    ///
    /// Null is accepted by every type. A float resource accepts integers too.
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (Self::Any, _) => true,
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::Integer, Value::Number(number)) => !number.is_f64(),
            (Self::Float, Value::Number(_)) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Array, Value::Array(_)) => true,
            (Self::Object, Value::Object(_)) => true,
            _ => false,
        }
    }
}

/// A value along with the instant it refers to.
///
/// A value equal to JSON null is stored as an absent value, so an empty
/// [`TimedValue`] and a null one are indistinguishable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimedValue {
    value: Option<Value>,
    timestamp: Option<SystemTime>,
}

impl std::fmt::Display for TimedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{value}")?,
            None => write!(f, "<empty>")?,
        }
        if let Some(timestamp) = self.timestamp {
            write!(f, " @ {timestamp:?}")?;
        }
        Ok(())
    }
}

impl TimedValue {
    /// Creates a [`TimedValue`].
    #[must_use]
    #[inline]
    pub fn new(value: impl Into<Value>, timestamp: SystemTime) -> Self {
        Self::with_optional(Some(value.into()), Some(timestamp))
    }

    /// Creates a [`TimedValue`] from optional parts.
    #[must_use]
    #[inline]
    pub fn with_optional(value: Option<Value>, timestamp: Option<SystemTime>) -> Self {
        Self {
            value: value.filter(|value| !value.is_null()),
            timestamp,
        }
    }

    /// Creates an empty [`TimedValue`].
    #[must_use]
    #[inline]
    pub const fn empty() -> Self {
        Self {
            value: None,
            timestamp: None,
        }
    }

    /// Returns the value, if any.
    #[must_use]
    #[inline]
    pub const fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Returns the timestamp, if any.
    #[must_use]
    #[inline]
    pub const fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }

    /// Checks whether there is no value.
    #[must_use]
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// Consumes the [`TimedValue`], returning its value.
    #[must_use]
    #[inline]
    pub fn into_value(self) -> Option<Value> {
        self.value
    }
}

map! {
  /// Metadata attached to a resource.
  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  pub struct Metadata(IndexMap<String, Value, DefaultHashBuilder>);
}

impl Metadata {
    /// Merges another metadata map into this one.
    ///
    /// Keys bound to null are removed. When `remove_missing` is set, keys
    /// absent from `update` are removed too.
    ///
    /// Returns `true` when the merge changed the map.
    pub fn merge(&mut self, update: &Metadata, remove_missing: bool) -> bool {
        let before = self.clone();

        for (key, value) in update {
            if value.is_null() {
                let _ = self.remove(key);
            } else {
                let _ = self.insert(key.clone(), value.clone());
            }
        }

        if remove_missing {
            self.retain(|key, _| update.get(key).is_some_and(|value| !value.is_null()));
        }

        *self != before
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use serde_json::{Value, json};

    use crate::{deserialize, serialize};

    use super::{ALL_DATA_TYPES, DataType, Metadata, TimedValue};

    #[test]
    fn test_data_type() {
        assert_eq!(DataType::of(&json!(true)), DataType::Boolean);
        assert_eq!(DataType::of(&json!(3)), DataType::Integer);
        assert_eq!(DataType::of(&json!(3.5)), DataType::Float);
        assert_eq!(DataType::of(&json!("on")), DataType::String);
        assert_eq!(DataType::of(&json!([1, 2])), DataType::Array);
        assert_eq!(DataType::of(&json!({"a": 1})), DataType::Object);
        assert_eq!(DataType::of(&Value::Null), DataType::Any);

        assert!(DataType::Float.accepts(&json!(3)));
        assert!(!DataType::Integer.accepts(&json!(3.5)));
        assert!(!DataType::Boolean.accepts(&json!("true")));

        for data_type in ALL_DATA_TYPES {
            assert!(data_type.accepts(&Value::Null));
            assert_eq!(deserialize::<DataType>(serialize(data_type)), *data_type);
        }
    }

    #[test]
    fn test_timed_value() {
        let timestamp = SystemTime::UNIX_EPOCH + Duration::from_secs(10);

        let null = TimedValue::new(Value::Null, timestamp);
        assert!(null.is_empty());
        assert_eq!(null.timestamp(), Some(timestamp));

        let value = TimedValue::new(21.5, timestamp);
        assert_eq!(value.value(), Some(&json!(21.5)));
        assert_eq!(deserialize::<TimedValue>(serialize(&value)), value);

        assert_eq!(TimedValue::empty(), TimedValue::default());
    }

    #[test]
    fn test_metadata_merge() {
        let mut metadata: Metadata = [("unit", json!("°C")), ("accuracy", json!(0.5))]
            .into_iter()
            .collect();

        // Same content, nothing changes.
        let same: Metadata = [("unit", json!("°C"))].into_iter().collect();
        assert!(!metadata.merge(&same, false));

        // A null value removes the key.
        let removal: Metadata = [("accuracy", Value::Null)].into_iter().collect();
        assert!(metadata.merge(&removal, false));
        assert!(!metadata.contains_key("accuracy"));

        // Keys absent from the update are dropped on request.
        let _ = metadata.insert("source", json!("sensor"));
        let replacement: Metadata = [("unit", json!("K"))].into_iter().collect();
        assert!(metadata.merge(&replacement, true));
        assert_eq!(metadata, replacement);
    }
}
