use serde::{Deserialize, Serialize};

use serde_json::Value;

use crate::parameters::Parameters;
use crate::value::{DataType, Metadata};

/// Who is allowed to write the value of a resource.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    /// Set once by the device, never changed afterwards.
    Fixed,
    /// Set by consumers through `SET`, and by the device.
    Modifiable,
    /// Written only by device pushes.
    Updatable,
}

impl std::fmt::Debug for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name().fmt(f)
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name().fmt(f)
    }
}

impl ValueType {
    /// Returns the [`ValueType`] name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Fixed => "FIXED",
            Self::Modifiable => "MODIFIABLE",
            Self::Updatable => "UPDATABLE",
        }
    }
}

/// The kind of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// A data point holding a value.
    Property,
    /// An operation that can be invoked with arguments.
    Action,
}

/// How fresh a value returned by a `GET` must be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GetLevel {
    /// Return the stored value, never call the getter.
    Cached,
    /// Call the getter unless the stored value is younger than the cache
    /// period bound to the resource.
    #[default]
    Normal,
    /// Always call the getter when one is bound.
    Strong,
}

/// The declaration of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    /// Resource name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Who may write the value.
    pub value_type: ValueType,
    /// Type of the value, or of the result for an action.
    pub data_type: DataType,
    /// Action parameters.
    #[serde(default, skip_serializing_if = "Parameters::is_empty")]
    pub parameters: Parameters,
    /// Initial metadata.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl ResourceDeclaration {
    /// Declares an [`ValueType::Updatable`] property.
    #[must_use]
    #[inline]
    pub fn property(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            kind: ResourceKind::Property,
            value_type: ValueType::Updatable,
            data_type,
            parameters: Parameters::new(),
            metadata: Metadata::new(),
        }
    }

    /// Declares an action returning a value of the given type.
    #[must_use]
    #[inline]
    pub fn action(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            kind: ResourceKind::Action,
            value_type: ValueType::Fixed,
            data_type,
            parameters: Parameters::new(),
            metadata: Metadata::new(),
        }
    }

    /// Sets the [`ValueType`].
    #[must_use]
    #[inline]
    pub const fn value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// Makes the property [`ValueType::Modifiable`].
    #[must_use]
    #[inline]
    pub const fn modifiable(self) -> Self {
        self.value_type(ValueType::Modifiable)
    }

    /// Makes the property [`ValueType::Fixed`].
    #[must_use]
    #[inline]
    pub const fn fixed(self) -> Self {
        self.value_type(ValueType::Fixed)
    }

    /// Adds an action parameter.
    #[must_use]
    #[inline]
    pub fn parameter(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        let _ = self.parameters.insert(name, data_type);
        self
    }

    /// Replaces all action parameters.
    #[must_use]
    #[inline]
    pub fn parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Adds an initial metadata entry.
    #[must_use]
    #[inline]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.metadata.insert(key, value.into());
        self
    }

    /// Checks whether the declaration describes an action.
    #[must_use]
    #[inline]
    pub fn is_action(&self) -> bool {
        self.kind == ResourceKind::Action
    }
}
