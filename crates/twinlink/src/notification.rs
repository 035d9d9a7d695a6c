use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use serde_json::Value;

use crate::path::ResourcePath;
use crate::value::{DataType, Metadata, TimedValue};

/// The element of a twin a notification refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationTarget {
    /// Package URI of the provider model.
    pub model_package_uri: String,
    /// Provider model name.
    pub model: String,
    /// Provider name.
    pub provider: String,
    /// Service name, absent for provider notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Resource name, absent for provider and service notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

impl NotificationTarget {
    /// Creates a [`NotificationTarget`] for a provider.
    #[must_use]
    #[inline]
    pub fn provider(
        model_package_uri: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            model_package_uri: model_package_uri.into(),
            model: model.into(),
            provider: provider.into(),
            service: None,
            resource: None,
        }
    }

    /// Narrows the target to a service.
    #[must_use]
    #[inline]
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Narrows the target to a resource.
    #[must_use]
    #[inline]
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Returns the topic of the target.
    ///
    /// It is the `/`-separated path of the target, so it can be a
    /// provider, a service or a resource path.
    #[must_use]
    pub fn topic(&self) -> String {
        let mut topic = self.provider.clone();
        for segment in [&self.service, &self.resource].into_iter().flatten() {
            topic.push('/');
            topic.push_str(segment);
        }
        topic
    }

    /// Returns the resource path, when the target is a resource.
    #[must_use]
    pub fn resource_path(&self) -> Option<ResourcePath> {
        match (&self.service, &self.resource) {
            (Some(service), Some(resource)) => Some(ResourcePath::new(
                self.provider.clone(),
                service.clone(),
                resource.clone(),
            )),
            _ => None,
        }
    }
}

/// A structural change of a twin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleStatus {
    /// A provider has been created.
    ProviderCreated,
    /// A provider has been deleted.
    ProviderDeleted,
    /// A service has been created.
    ServiceCreated,
    /// A service has been deleted.
    ServiceDeleted,
    /// A resource has been created.
    ResourceCreated,
    /// A resource has been deleted.
    ResourceDeleted,
}

impl LifecycleStatus {
    /// Checks whether the status reports a creation.
    #[must_use]
    pub const fn is_created(&self) -> bool {
        matches!(
            self,
            Self::ProviderCreated | Self::ServiceCreated | Self::ResourceCreated
        )
    }

    /// Checks whether the status reports a deletion.
    #[must_use]
    #[inline]
    pub const fn is_deleted(&self) -> bool {
        !self.is_created()
    }
}

/// The kind of a [`Notification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NotificationKind {
    /// A [`LifecycleNotification`].
    Lifecycle,
    /// A [`DataNotification`].
    Data,
    /// A [`MetadataNotification`].
    Metadata,
}

/// A provider, service or resource has been created or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleNotification {
    /// Notification target.
    pub target: NotificationTarget,
    /// What happened.
    pub status: LifecycleStatus,
    /// Value of a created resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<TimedValue>,
    /// Metadata of a created resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_metadata: Option<Metadata>,
}

/// The value of a resource has changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataNotification {
    /// Notification target.
    pub target: NotificationTarget,
    /// Declared type of the resource.
    pub data_type: DataType,
    /// Value before the change.
    pub old_value: Option<Value>,
    /// Value after the change.
    pub new_value: Option<Value>,
    /// Timestamp of the new value.
    pub timestamp: Option<SystemTime>,
    /// Resource metadata after the change.
    #[serde(default)]
    pub metadata: Metadata,
}

/// The metadata of a resource has changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataNotification {
    /// Notification target.
    pub target: NotificationTarget,
    /// Metadata before the change.
    pub old_metadata: Metadata,
    /// Metadata after the change.
    pub new_metadata: Metadata,
    /// When the change happened.
    pub timestamp: Option<SystemTime>,
}

/// An event emitted when a command commits a visible change to a twin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Notification {
    /// A structural change.
    Lifecycle(LifecycleNotification),
    /// A value change.
    Data(DataNotification),
    /// A metadata change.
    Metadata(MetadataNotification),
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lifecycle(lifecycle) => {
                write!(f, "[{}] {:?}", self.topic(), lifecycle.status)
            }
            Self::Data(data) => write!(
                f,
                "[{}] {} -> {}",
                self.topic(),
                display_value(data.old_value.as_ref()),
                display_value(data.new_value.as_ref())
            ),
            Self::Metadata(metadata) => write!(
                f,
                "[{}] metadata: {} keys -> {} keys",
                self.topic(),
                metadata.old_metadata.len(),
                metadata.new_metadata.len()
            ),
        }
    }
}

fn display_value(value: Option<&Value>) -> String {
    value.map_or_else(|| "null".into(), ToString::to_string)
}

impl Notification {
    /// Returns the [`NotificationTarget`].
    #[must_use]
    pub const fn target(&self) -> &NotificationTarget {
        match self {
            Self::Lifecycle(lifecycle) => &lifecycle.target,
            Self::Data(data) => &data.target,
            Self::Metadata(metadata) => &metadata.target,
        }
    }

    /// Returns the [`NotificationKind`].
    #[must_use]
    pub const fn kind(&self) -> NotificationKind {
        match self {
            Self::Lifecycle(_) => NotificationKind::Lifecycle,
            Self::Data(_) => NotificationKind::Data,
            Self::Metadata(_) => NotificationKind::Metadata,
        }
    }

    /// Returns the topic the notification is published on.
    #[must_use]
    #[inline]
    pub fn topic(&self) -> String {
        self.target().topic()
    }

    /// Returns the data notification, if this is one.
    #[must_use]
    pub const fn as_data(&self) -> Option<&DataNotification> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use serde_json::json;

    use crate::path::ResourcePath;
    use crate::value::{DataType, Metadata};
    use crate::{deserialize, serialize};

    use super::{
        DataNotification, LifecycleNotification, LifecycleStatus, Notification, NotificationKind,
        NotificationTarget,
    };

    fn target() -> NotificationTarget {
        NotificationTarget::provider("https://example.org/model", "sensor", "p1")
    }

    #[test]
    fn test_topic() {
        let provider = target();
        assert_eq!(provider.topic(), "p1");
        assert_eq!(provider.resource_path(), None);

        let resource = target().service("s1").resource("r1");
        assert_eq!(resource.topic(), "p1/s1/r1");
        assert_eq!(
            resource.resource_path(),
            Some(ResourcePath::new("p1", "s1", "r1"))
        );
    }

    #[test]
    fn test_data_notification() {
        let timestamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1);
        let notification = Notification::Data(DataNotification {
            target: target().service("s1").resource("r1"),
            data_type: DataType::Integer,
            old_value: None,
            new_value: Some(json!(4)),
            timestamp: Some(timestamp),
            metadata: Metadata::new(),
        });

        assert_eq!(notification.kind(), NotificationKind::Data);
        assert_eq!(notification.topic(), "p1/s1/r1");
        assert_eq!(notification.to_string(), "[p1/s1/r1] null -> 4");
        assert!(notification.as_data().is_some());

        let value = serialize(&notification);
        assert_eq!(value["type"], json!("Data"));
        assert_eq!(value["new_value"], json!(4));
        assert_eq!(deserialize::<Notification>(value), notification);
    }

    #[test]
    fn test_lifecycle_notification() {
        let notification = Notification::Lifecycle(LifecycleNotification {
            target: target().service("s1"),
            status: LifecycleStatus::ServiceCreated,
            initial_value: None,
            initial_metadata: None,
        });

        assert_eq!(notification.kind(), NotificationKind::Lifecycle);
        assert_eq!(notification.topic(), "p1/s1");
        assert!(LifecycleStatus::ServiceCreated.is_created());
        assert!(LifecycleStatus::ResourceDeleted.is_deleted());

        assert_eq!(
            serialize(&notification),
            json!({
                "type": "Lifecycle",
                "target": {
                    "model_package_uri": "https://example.org/model",
                    "model": "sensor",
                    "provider": "p1",
                    "service": "s1",
                },
                "status": "ServiceCreated",
            })
        );
        assert_eq!(
            deserialize::<Notification>(serialize(&notification)),
            notification
        );
    }
}
