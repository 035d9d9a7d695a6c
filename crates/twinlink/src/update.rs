use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use serde_json::Value;

use crate::path::ResourcePath;
use crate::value::{DataType, Metadata};

/// What a push update does when its value is null or absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NullAction {
    /// Leave the stored value untouched.
    #[default]
    Ignore,
    /// Clear the stored value.
    Update,
}

/// A value pushed by a device into a twin.
///
/// The provider, service and resource are created when missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataUpdate {
    /// Package URI of the provider model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_package_uri: Option<String>,
    /// Provider model name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Provider name.
    pub provider: String,
    /// Service name.
    pub service: String,
    /// Resource name.
    pub resource: String,
    /// The pushed value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Data type used when the resource has to be created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    /// Timestamp of the value, the current time when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<SystemTime>,
    /// Metadata merged into the resource metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// What to do with a null value.
    #[serde(default)]
    pub null_action: NullAction,
    /// Remove the metadata keys absent from [`DataUpdate::metadata`].
    #[serde(default)]
    pub remove_missing_metadata: bool,
    /// Notify a null value even when nothing changed.
    #[serde(default)]
    pub propagate_nulls: bool,
}

impl DataUpdate {
    /// Creates a [`DataUpdate`] for a resource, without any value.
    #[must_use]
    #[inline]
    pub fn new(
        provider: impl Into<String>,
        service: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            model_package_uri: None,
            model: None,
            provider: provider.into(),
            service: service.into(),
            resource: resource.into(),
            value: None,
            data_type: None,
            timestamp: None,
            metadata: None,
            null_action: NullAction::Ignore,
            remove_missing_metadata: false,
            propagate_nulls: false,
        }
    }

    /// Creates a [`DataUpdate`] for the given path.
    #[must_use]
    #[inline]
    pub fn for_path(path: &ResourcePath) -> Self {
        Self::new(
            path.provider.clone(),
            path.service.clone(),
            path.resource.clone(),
        )
    }

    /// Sets the provider model.
    #[must_use]
    #[inline]
    pub fn model(mut self, model_package_uri: impl Into<String>, model: impl Into<String>) -> Self {
        self.model_package_uri = Some(model_package_uri.into());
        self.model = Some(model.into());
        self
    }

    /// Sets the value.
    #[must_use]
    #[inline]
    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Sets the data type used when the resource is created.
    #[must_use]
    #[inline]
    pub const fn data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    /// Sets the timestamp.
    #[must_use]
    #[inline]
    pub const fn timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Adds a metadata entry. A null value removes the key.
    #[must_use]
    #[inline]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self
            .metadata
            .get_or_insert_with(Metadata::new)
            .insert(key, value.into());
        self
    }

    /// Sets the [`NullAction`].
    #[must_use]
    #[inline]
    pub const fn null_action(mut self, null_action: NullAction) -> Self {
        self.null_action = null_action;
        self
    }

    /// Removes the metadata keys absent from this update.
    #[must_use]
    #[inline]
    pub const fn remove_missing_metadata(mut self) -> Self {
        self.remove_missing_metadata = true;
        self
    }

    /// Notifies null values even when nothing changed.
    #[must_use]
    #[inline]
    pub const fn propagate_nulls(mut self) -> Self {
        self.propagate_nulls = true;
        self
    }

    /// Returns the path of the updated resource.
    #[must_use]
    #[inline]
    pub fn path(&self) -> ResourcePath {
        ResourcePath::new(
            self.provider.clone(),
            self.service.clone(),
            self.resource.clone(),
        )
    }

    /// Checks whether the value is null or absent.
    #[must_use]
    #[inline]
    pub fn is_null(&self) -> bool {
        self.value.as_ref().is_none_or(Value::is_null)
    }
}

/// An ordered list of [`DataUpdate`]s.
///
/// Each update is applied on its own, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkUpdate(Vec<DataUpdate>);

impl BulkUpdate {
    /// Creates an empty [`BulkUpdate`].
    #[must_use]
    #[inline]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends an update.
    #[must_use]
    #[inline]
    pub fn update(mut self, update: DataUpdate) -> Self {
        self.0.push(update);
        self
    }

    /// Appends an update in place.
    #[inline]
    pub fn push(&mut self, update: DataUpdate) {
        self.0.push(update);
    }

    /// Returns the number of updates.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks whether there are no updates.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns an iterator over the updates.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, DataUpdate> {
        self.0.iter()
    }
}

impl From<DataUpdate> for BulkUpdate {
    fn from(update: DataUpdate) -> Self {
        Self(vec![update])
    }
}

impl From<Vec<DataUpdate>> for BulkUpdate {
    fn from(updates: Vec<DataUpdate>) -> Self {
        Self(updates)
    }
}

impl FromIterator<DataUpdate> for BulkUpdate {
    fn from_iter<I: IntoIterator<Item = DataUpdate>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for BulkUpdate {
    type Item = DataUpdate;
    type IntoIter = std::vec::IntoIter<DataUpdate>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a BulkUpdate {
    type Item = &'a DataUpdate;
    type IntoIter = std::slice::Iter<'a, DataUpdate>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
