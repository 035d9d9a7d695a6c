use hashbrown::DefaultHashBuilder;

use indexmap::map::IndexMap;

use serde::{Deserialize, Serialize};

use serde_json::Value;

use crate::macros::map;
use crate::value::DataType;

map! {
  /// The ordered, name-unique parameters of an action.
  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  pub struct Parameters(IndexMap<String, DataType, DefaultHashBuilder>);
}

impl Parameters {
    /// Adds a parameter.
    #[must_use]
    #[inline]
    pub fn parameter(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        let _ = self.insert(name, data_type);
        self
    }

    /// Checks the given arguments against the declared parameters.
    ///
    /// Every declared parameter must be supplied with a non-null value of
    /// its type, and no undeclared argument is allowed.
    ///
    /// # Errors
    ///
    /// Returns the first [`ParameterMismatch`] found.
    pub fn check(&self, values: &ParametersValues) -> Result<(), ParameterMismatch> {
        for (name, data_type) in self {
            let value = values
                .get(name)
                .filter(|value| !value.is_null())
                .ok_or_else(|| ParameterMismatch::Missing(name.clone()))?;

            if !data_type.accepts(value) {
                return Err(ParameterMismatch::WrongType {
                    name: name.clone(),
                    expected: *data_type,
                    found: DataType::of(value),
                });
            }
        }

        if let Some(name) = values.keys().find(|name| !self.contains_key(name)) {
            return Err(ParameterMismatch::Unexpected(name.clone()));
        }

        Ok(())
    }
}

/// Why a set of arguments does not match the declared parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterMismatch {
    /// A declared parameter was not supplied.
    Missing(String),
    /// An argument was supplied but never declared.
    Unexpected(String),
    /// An argument has a type different from the declared one.
    WrongType {
        /// Parameter name.
        name: String,
        /// Declared type.
        expected: DataType,
        /// Type of the supplied value.
        found: DataType,
    },
}

impl std::fmt::Display for ParameterMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing(name) => write!(f, "missing argument `{name}`"),
            Self::Unexpected(name) => write!(f, "unexpected argument `{name}`"),
            Self::WrongType {
                name,
                expected,
                found,
            } => write!(
                f,
                "argument `{name}` must be of type {expected}, found {found}"
            ),
        }
    }
}

impl std::error::Error for ParameterMismatch {}

map! {
  /// Named argument values passed to an action.
  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  pub struct ParametersValues(IndexMap<String, Value, DefaultHashBuilder>);
}

impl ParametersValues {
    /// Adds a boolean argument.
    #[must_use]
    #[inline]
    pub fn bool(self, name: impl Into<String>, value: bool) -> Self {
        self.value(name, value)
    }

    /// Adds an integer argument.
    #[must_use]
    #[inline]
    pub fn integer(self, name: impl Into<String>, value: i64) -> Self {
        self.value(name, value)
    }

    /// Adds a floating point argument.
    #[must_use]
    #[inline]
    pub fn float(self, name: impl Into<String>, value: f64) -> Self {
        self.value(name, value)
    }

    /// Adds a string argument.
    #[must_use]
    #[inline]
    pub fn string(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.value(name, value.into())
    }

    /// Adds an argument of any type.
    #[must_use]
    #[inline]
    pub fn value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.insert(name, value.into());
        self
    }

    /// Returns a boolean argument.
    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// Returns an integer argument.
    #[must_use]
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    /// Returns a floating point argument.
    #[must_use]
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    /// Returns a string argument.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }
}
