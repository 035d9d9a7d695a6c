use std::time::SystemTime;

use twinlink::location::Location;
use twinlink::notification::DataNotification;
use twinlink::parameters::Parameters;
use twinlink::resource::{ResourceKind, ValueType};
use twinlink::value::{DataType, Metadata, TimedValue};

use serde::{Deserialize, Serialize};

use crate::criterion::Criterion;
use crate::error::{Error, ErrorKind, Result};
use crate::twin::ModelIdentity;

/// A point-in-time view of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Resource name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Who may write the value, unknown for views built from notifications.
    pub value_type: Option<ValueType>,
    /// Declared data type.
    pub data_type: DataType,
    /// The value, absent for actions and for callers without read access.
    pub value: Option<TimedValue>,
    /// The metadata, empty for callers without read access.
    pub metadata: Metadata,
    /// Action parameters.
    pub parameters: Parameters,
}

impl ResourceSnapshot {
    /// Checks whether the snapshot holds a non-empty value.
    #[must_use]
    #[inline]
    pub fn has_value(&self) -> bool {
        self.value.as_ref().is_some_and(|value| !value.is_empty())
    }
}

/// A point-in-time view of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    /// Service name.
    pub name: String,
    /// Visible resources.
    pub resources: Vec<ResourceSnapshot>,
}

impl ServiceSnapshot {
    /// Returns a resource.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceSnapshot> {
        self.resources.iter().find(|resource| resource.name == name)
    }
}

/// A point-in-time view of a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    /// Provider model.
    pub model: ModelIdentity,
    /// Provider name.
    pub name: String,
    /// Provider location.
    pub location: Option<Location>,
    /// When the snapshot has been taken.
    pub snapshot_time: SystemTime,
    /// Visible services.
    pub services: Vec<ServiceSnapshot>,
}

impl ProviderSnapshot {
    /// Returns a service.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceSnapshot> {
        self.services.iter().find(|service| service.name == name)
    }

    /// Returns a resource.
    #[must_use]
    #[inline]
    pub fn resource(&self, service: &str, resource: &str) -> Option<&ResourceSnapshot> {
        self.service(service)?.resource(resource)
    }

    /// Returns all resources along with the name of their service.
    pub fn resources(&self) -> impl Iterator<Item = (&str, &ResourceSnapshot)> {
        self.services.iter().flat_map(|service| {
            service
                .resources
                .iter()
                .map(move |resource| (service.name.as_str(), resource))
        })
    }

    // A single-resource view of the provider a data notification refers to.
    pub(crate) fn from_notification(
        notification: &DataNotification,
        location: Option<Location>,
    ) -> Self {
        let target = &notification.target;
        let resource = ResourceSnapshot {
            name: target.resource.clone().unwrap_or_default(),
            kind: ResourceKind::Property,
            value_type: None,
            data_type: notification.data_type,
            value: Some(TimedValue::with_optional(
                notification.new_value.clone(),
                notification.timestamp,
            )),
            metadata: notification.metadata.clone(),
            parameters: Parameters::new(),
        };

        Self {
            model: ModelIdentity::new(target.model_package_uri.clone(), target.model.clone()),
            name: target.provider.clone(),
            location,
            snapshot_time: notification.timestamp.unwrap_or_else(SystemTime::now),
            services: vec![ServiceSnapshot {
                name: target.service.clone().unwrap_or_default(),
                resources: vec![resource],
            }],
        }
    }
}

// Second filtering phase, run by the caller once the snapshot is valued.
pub(crate) fn filter_values(
    criterion: &Criterion,
    snapshots: Vec<ProviderSnapshot>,
) -> Result<Vec<ProviderSnapshot>> {
    if !criterion.has_value_predicate() {
        return Ok(snapshots);
    }

    let mut accepted = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        let keep = criterion.evaluate_value(&snapshot).map_err(|e| {
            Error::new(
                ErrorKind::Evaluation,
                format!(
                    "The value filter failed on provider `{}`: {}",
                    snapshot.name,
                    e.description()
                ),
            )
        })?;
        if keep {
            accepted.push(snapshot);
        }
    }
    Ok(accepted)
}
