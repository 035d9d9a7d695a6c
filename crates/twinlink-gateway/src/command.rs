use std::time::SystemTime;

use serde_json::Value;

use tracing::{debug, warn};

use twinlink::location::Location;
use twinlink::parameters::ParametersValues;
use twinlink::path::ResourcePath;
use twinlink::permission::PermissionLevel;
use twinlink::resource::{GetLevel, ResourceDeclaration};
use twinlink::update::{DataUpdate, NullAction};
use twinlink::value::{DataType, Metadata, TimedValue};

use crate::accumulator::NotificationAccumulator;
use crate::authorizer::Authorizer;
use crate::criterion::{Criterion, ProviderRef};
use crate::error::{Error, ErrorKind, Result};
use crate::resource::{Binding, Origin, WriteOutcome};
use crate::snapshot::{ProviderSnapshot, ResourceSnapshot, ServiceSnapshot};
use crate::twin::{DigitalTwin, ModelIdentity, Provider, ProviderBuilder, check_name};

fn forbidden(level: PermissionLevel, element: &str) -> Error {
    Error::new(
        ErrorKind::Forbidden,
        format!("{level} permission denied on `{element}`"),
    )
}

// The elements of a provider selected by the first filtering phase.
struct ProviderPlan {
    name: String,
    model: ModelIdentity,
    location: Option<Location>,
    services: Vec<(String, Vec<String>)>,
}

/// The handle a command receives on the gateway thread.
///
/// Every operation checks the permissions of the session which submitted the
/// command before touching the twin, and records the notifications of the
/// changes it commits. Those notifications are published once the command
/// returns.
pub struct CommandContext<'a> {
    twin: &'a mut DigitalTwin,
    authorizer: &'a dyn Authorizer,
    events: &'a mut NotificationAccumulator,
}

impl std::fmt::Debug for CommandContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("twin", &self.twin)
            .finish_non_exhaustive()
    }
}

impl<'a> CommandContext<'a> {
    pub(crate) fn new(
        twin: &'a mut DigitalTwin,
        authorizer: &'a dyn Authorizer,
        events: &'a mut NotificationAccumulator,
    ) -> Self {
        Self {
            twin,
            authorizer,
            events,
        }
    }

    /// Returns a read-only view of the twin.
    ///
    /// The view is not filtered by the session permissions.
    #[must_use]
    #[inline]
    pub fn twin(&self) -> &DigitalTwin {
        self.twin
    }

    /// Returns the authorizer of the session which submitted the command.
    #[must_use]
    #[inline]
    pub fn authorizer(&self) -> &dyn Authorizer {
        self.authorizer
    }

    /// Returns the value of a resource.
    ///
    /// Any level but [`GetLevel::Cached`] may call the getter bound to the
    /// resource.
    ///
    /// # Errors
    ///
    /// Requires the [`PermissionLevel::Read`] permission on the resource.
    pub fn get_value(&mut self, path: &ResourcePath, level: GetLevel) -> Result<TimedValue> {
        self.require_resource(PermissionLevel::Read, path)?;

        let (target, resource) = self.twin.lookup_mut(path)?;
        let outcome = resource.read(level)?;
        if let Some(previous) = &outcome.previous {
            self.events.data(
                target,
                resource.data_type(),
                previous,
                &outcome.value,
                resource.metadata(),
            );
        }
        Ok(outcome.value)
    }

    /// Sets the value of a modifiable resource.
    ///
    /// The setter bound to the resource, if any, is called before the value
    /// is stored. A value older than the stored one is ignored.
    ///
    /// # Errors
    ///
    /// Requires the [`PermissionLevel::Update`] permission on the resource.
    pub fn set_value(
        &mut self,
        path: &ResourcePath,
        value: impl Into<Value>,
        timestamp: Option<SystemTime>,
    ) -> Result<()> {
        self.require_resource(PermissionLevel::Update, path)?;

        let value = Some(value.into()).filter(|value| !value.is_null());
        let (target, resource) = self.twin.lookup_mut(path)?;
        let outcome = resource.write(
            value,
            timestamp.unwrap_or_else(SystemTime::now),
            Origin::Northbound,
        )?;

        if let WriteOutcome::Applied { old } = outcome {
            self.events.data(
                target,
                resource.data_type(),
                &old,
                resource.value(),
                resource.metadata(),
            );
        }
        Ok(())
    }

    /// Invokes an action.
    ///
    /// # Errors
    ///
    /// Requires the [`PermissionLevel::Act`] permission on the resource.
    pub fn act(&mut self, path: &ResourcePath, arguments: &ParametersValues) -> Result<Value> {
        self.require_resource(PermissionLevel::Act, path)?;
        self.twin.lookup(path)?.act(arguments)
    }

    /// Returns the metadata of a resource.
    ///
    /// # Errors
    ///
    /// Requires the [`PermissionLevel::Read`] permission on the resource.
    pub fn get_metadata(&mut self, path: &ResourcePath) -> Result<Metadata> {
        self.require_resource(PermissionLevel::Read, path)?;
        Ok(self.twin.lookup(path)?.metadata().clone())
    }

    /// Sets a metadata field of a resource, a null value removes it.
    ///
    /// # Errors
    ///
    /// Requires the [`PermissionLevel::Update`] permission on the resource.
    pub fn set_metadata(
        &mut self,
        path: &ResourcePath,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        self.require_resource(PermissionLevel::Update, path)?;

        let (target, resource) = self.twin.lookup_mut(path)?;
        if let Some(old) = resource.set_metadata(key, value.into()) {
            self.events
                .metadata(target, old, resource.metadata(), SystemTime::now());
        }
        Ok(())
    }

    /// Applies a push update coming from a device.
    ///
    /// Missing providers, services and resources are created on the fly,
    /// except in exclusively owned providers. An update older than the
    /// stored value is dropped along with its metadata.
    ///
    /// # Errors
    ///
    /// Requires the [`PermissionLevel::Update`] permission on the resource.
    pub fn apply_update(&mut self, update: &DataUpdate) -> Result<()> {
        let path = update.path();
        let declared = update.model.as_ref().map(|model| {
            ModelIdentity::new(
                update
                    .model_package_uri
                    .clone()
                    .unwrap_or_else(|| self.twin.default_model().package_uri.clone()),
                model.clone(),
            )
        });
        let model = self
            .twin
            .provider(&path.provider)
            .map(|provider| provider.model().clone())
            .or_else(|| declared.clone())
            .unwrap_or_else(|| self.twin.default_model().clone());
        self.require_resource_of(PermissionLevel::Update, &model, &path)?;

        self.twin
            .ensure_provider(&path.provider, declared.as_ref(), self.events)?;

        if self.twin.resource(&path).is_none() {
            self.create_pushed_resource(&path, update)?;
        }

        let (target, resource) = self.twin.lookup_mut(&path)?;
        let timestamp = update.timestamp.unwrap_or_else(SystemTime::now);
        let value = update.value.clone().filter(|value| !value.is_null());

        let old = if value.is_none() && update.null_action == NullAction::Ignore {
            None
        } else {
            match resource.write(value, timestamp, Origin::Southbound)? {
                WriteOutcome::Stale => return Ok(()),
                WriteOutcome::Applied { old } => Some(old),
                WriteOutcome::Unchanged
                    if update.propagate_nulls && resource.value().is_empty() =>
                {
                    Some(resource.value().clone())
                }
                WriteOutcome::Unchanged => None,
            }
        };

        let old_metadata = update.metadata.as_ref().and_then(|metadata| {
            resource.merge_metadata(metadata, update.remove_missing_metadata)
        });

        if let Some(old) = old {
            self.events.data(
                target.clone(),
                resource.data_type(),
                &old,
                resource.value(),
                resource.metadata(),
            );
        }
        if let Some(old_metadata) = old_metadata {
            self.events
                .metadata(target, old_metadata, resource.metadata(), timestamp);
        }
        Ok(())
    }

    /// Creates a provider.
    ///
    /// # Errors
    ///
    /// Requires the [`PermissionLevel::Update`] permission on the provider.
    pub fn create_provider(&mut self, builder: &ProviderBuilder) -> Result<()> {
        let model = builder
            .model
            .clone()
            .unwrap_or_else(|| self.twin.default_model().clone());
        if !self
            .authorizer
            .has_provider_permission(PermissionLevel::Update, &model, builder.name())
        {
            return Err(forbidden(PermissionLevel::Update, builder.name()));
        }
        self.twin.create_provider(builder, self.events)
    }

    /// Adds a resource to a service, creating the provider and the service
    /// when missing.
    ///
    /// # Errors
    ///
    /// Requires the [`PermissionLevel::Update`] permission on the resource.
    pub fn create_resource(
        &mut self,
        provider: &str,
        service: &str,
        declaration: ResourceDeclaration,
        binding: Binding,
    ) -> Result<()> {
        let path = ResourcePath::new(provider, service, declaration.name.clone());
        self.require_resource(PermissionLevel::Update, &path)?;

        self.twin.ensure_provider(provider, None, self.events)?;
        self.twin
            .add_resource(provider, service, declaration, binding, self.events)
    }

    // Attaches device functions to a resource, creating it when missing. A
    // resource created by push updates can be bound later on.
    pub(crate) fn bind_resource(
        &mut self,
        provider: &ProviderBuilder,
        service: &str,
        declaration: ResourceDeclaration,
        binding: Binding,
    ) -> Result<()> {
        let path = ResourcePath::new(provider.name(), service, declaration.name.clone());
        let model = provider
            .model
            .clone()
            .unwrap_or_else(|| self.twin.model_of(provider.name()));
        self.require_resource_of(PermissionLevel::Update, &model, &path)?;

        // Nothing is created for a resource that cannot be added.
        check_name("service", service)?;
        check_name("resource", &declaration.name)?;

        if self.twin.provider(provider.name()).is_none() {
            self.twin.create_provider(provider, self.events)?;
        } else {
            self.twin
                .ensure_provider(provider.name(), provider.model.as_ref(), self.events)?;
        }

        match self.twin.lookup_mut(&path) {
            Ok((_, resource)) if resource.is_bound() => Err(Error::new(
                ErrorKind::Conflict,
                format!("`{path}` is already bound"),
            )),
            Ok((_, resource)) if resource.kind() != declaration.kind => Err(Error::new(
                ErrorKind::Conflict,
                format!("`{path}` is not a {:?}", declaration.kind),
            )),
            Ok((_, resource)) => {
                resource.bind(binding);
                Ok(())
            }
            Err(_) => self.twin.add_resource(
                provider.name(),
                service,
                declaration,
                binding,
                self.events,
            ),
        }
    }

    /// Removes a provider along with its services and resources.
    ///
    /// # Errors
    ///
    /// Requires the [`PermissionLevel::Update`] permission on the provider.
    pub fn remove_provider(&mut self, provider: &str) -> Result<()> {
        self.require_provider(PermissionLevel::Update, provider)?;
        self.twin.remove_provider(provider, self.events)
    }

    /// Removes a service along with its resources.
    ///
    /// # Errors
    ///
    /// Requires the [`PermissionLevel::Update`] permission on the service.
    pub fn remove_service(&mut self, provider: &str, service: &str) -> Result<()> {
        let model = self.twin.model_of(provider);
        if !self.authorizer.has_service_permission(
            PermissionLevel::Update,
            &model,
            provider,
            service,
        ) {
            return Err(forbidden(
                PermissionLevel::Update,
                &format!("{provider}/{service}"),
            ));
        }
        self.twin.remove_service(provider, service, self.events)
    }

    /// Removes a resource.
    ///
    /// # Errors
    ///
    /// Requires the [`PermissionLevel::Update`] permission on the resource.
    pub fn remove_resource(&mut self, path: &ResourcePath) -> Result<()> {
        self.require_resource(PermissionLevel::Update, path)?;
        self.twin.remove_resource(path, self.events)
    }

    /// Takes a snapshot of a provider, valued at the given level.
    ///
    /// Services and resources the session may not describe are left out,
    /// and values and metadata are only filled for readable resources.
    ///
    /// # Errors
    ///
    /// Requires the [`PermissionLevel::Describe`] permission on the provider.
    pub fn snapshot_provider(
        &mut self,
        provider: &str,
        level: GetLevel,
    ) -> Result<ProviderSnapshot> {
        self.require_provider(PermissionLevel::Describe, provider)?;

        let plan = {
            let provider = self.twin.provider(provider).ok_or_else(|| {
                Error::new(
                    ErrorKind::NotFound,
                    format!("Provider `{provider}` does not exist"),
                )
            })?;
            self.plan_provider(provider, &Criterion::new())
        };
        self.value_provider(plan, level, SystemTime::now())
    }

    /// Takes a snapshot of a service, valued at the given level.
    ///
    /// # Errors
    ///
    /// Requires the [`PermissionLevel::Describe`] permission on the service.
    pub fn snapshot_service(
        &mut self,
        provider: &str,
        service: &str,
        level: GetLevel,
    ) -> Result<ServiceSnapshot> {
        let model = self.twin.model_of(provider);
        if !self.authorizer.has_service_permission(
            PermissionLevel::Describe,
            &model,
            provider,
            service,
        ) {
            return Err(forbidden(
                PermissionLevel::Describe,
                &format!("{provider}/{service}"),
            ));
        }

        let resources = self
            .twin
            .service(provider, service)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::NotFound,
                    format!("Service `{provider}/{service}` does not exist"),
                )
            })?
            .resources()
            .filter(|resource| {
                self.authorizer.has_resource_permission(
                    PermissionLevel::Describe,
                    &model,
                    provider,
                    service,
                    resource.name(),
                )
            })
            .map(|resource| resource.name().to_owned())
            .collect::<Vec<_>>();

        let mut snapshot = ServiceSnapshot {
            name: service.into(),
            resources: Vec::with_capacity(resources.len()),
        };
        for resource in resources {
            let path = ResourcePath::new(provider, service, resource);
            snapshot
                .resources
                .push(self.value_resource(&path, &model, level)?);
        }
        Ok(snapshot)
    }

    /// Takes a snapshot of a resource, valued at the given level.
    ///
    /// # Errors
    ///
    /// Requires the [`PermissionLevel::Describe`] permission on the resource.
    pub fn snapshot_resource(
        &mut self,
        path: &ResourcePath,
        level: GetLevel,
    ) -> Result<ResourceSnapshot> {
        let model = self.twin.model_of(&path.provider);
        self.require_resource_of(PermissionLevel::Describe, &model, path)?;
        self.value_resource(path, &model, level)
    }

    /// Runs the first filtering phase of a [`Criterion`] and values what is
    /// left at the given level.
    ///
    /// Getters are only called on the resources which passed the location,
    /// provider, service and resource predicates. Elements the session may
    /// not describe are silently left out. The value predicate is not
    /// evaluated here.
    ///
    /// # Errors
    ///
    /// Fails when a selected element disappears while the snapshot is taken.
    pub fn filtered_snapshot(
        &mut self,
        criterion: &Criterion,
        level: GetLevel,
    ) -> Result<Vec<ProviderSnapshot>> {
        let snapshot_time = SystemTime::now();

        let plans = self
            .twin
            .providers()
            .filter(|provider| {
                self.authorizer.has_provider_permission(
                    PermissionLevel::Describe,
                    provider.model(),
                    provider.name(),
                )
            })
            .filter(|provider| {
                criterion.accepts_location(provider.location().as_ref())
                    && criterion.accepts_provider(&ProviderRef {
                        model: provider.model(),
                        name: provider.name(),
                    })
            })
            .map(|provider| self.plan_provider(provider, criterion))
            .filter(|plan| !(criterion.filters_content() && plan.services.is_empty()))
            .collect::<Vec<_>>();

        debug!("{} providers passed the first filtering phase", plans.len());

        let mut snapshots = Vec::with_capacity(plans.len());
        for plan in plans {
            snapshots.push(self.value_provider(plan, level, snapshot_time)?);
        }
        Ok(snapshots)
    }

    fn plan_provider(&self, provider: &Provider, criterion: &Criterion) -> ProviderPlan {
        let model = provider.model();
        let services = provider
            .services()
            .filter(|service| {
                criterion.accepts_service(service.name())
                    && self.authorizer.has_service_permission(
                        PermissionLevel::Describe,
                        model,
                        provider.name(),
                        service.name(),
                    )
            })
            .map(|service| {
                let resources = service
                    .resources()
                    .filter(|resource| {
                        criterion.accepts_resource(resource.name())
                            && self.authorizer.has_resource_permission(
                                PermissionLevel::Describe,
                                model,
                                provider.name(),
                                service.name(),
                                resource.name(),
                            )
                    })
                    .map(|resource| resource.name().to_owned())
                    .collect::<Vec<_>>();
                (service.name().to_owned(), resources)
            })
            .filter(|(_, resources)| !resources.is_empty())
            .collect();

        ProviderPlan {
            name: provider.name().to_owned(),
            model: model.clone(),
            location: provider.location(),
            services,
        }
    }

    fn value_provider(
        &mut self,
        plan: ProviderPlan,
        level: GetLevel,
        snapshot_time: SystemTime,
    ) -> Result<ProviderSnapshot> {
        let mut services = Vec::with_capacity(plan.services.len());
        for (service, resources) in plan.services {
            let mut snapshot = ServiceSnapshot {
                name: service,
                resources: Vec::with_capacity(resources.len()),
            };
            for resource in resources {
                let path = ResourcePath::new(plan.name.as_str(), snapshot.name.as_str(), resource);
                snapshot
                    .resources
                    .push(self.value_resource(&path, &plan.model, level)?);
            }
            services.push(snapshot);
        }

        Ok(ProviderSnapshot {
            model: plan.model,
            name: plan.name,
            location: plan.location,
            snapshot_time,
            services,
        })
    }

    fn value_resource(
        &mut self,
        path: &ResourcePath,
        model: &ModelIdentity,
        level: GetLevel,
    ) -> Result<ResourceSnapshot> {
        let readable = self.authorizer.has_resource_permission(
            PermissionLevel::Read,
            model,
            &path.provider,
            &path.service,
            &path.resource,
        );

        let (target, resource) = self.twin.lookup_mut(path)?;

        let value = if resource.is_action() || !readable {
            None
        } else {
            match resource.read(level) {
                Ok(outcome) => {
                    if let Some(previous) = &outcome.previous {
                        self.events.data(
                            target,
                            resource.data_type(),
                            previous,
                            &outcome.value,
                            resource.metadata(),
                        );
                    }
                    Some(outcome.value)
                }
                Err(e) => {
                    warn!("Using the cached value of `{path}`: {e}");
                    Some(resource.value().clone())
                }
            }
        };

        Ok(ResourceSnapshot {
            name: resource.name().to_owned(),
            kind: resource.kind(),
            value_type: Some(resource.value_type()),
            data_type: resource.data_type(),
            value,
            metadata: if readable {
                resource.metadata().clone()
            } else {
                Metadata::new()
            },
            parameters: resource.parameters().clone(),
        })
    }

    fn create_pushed_resource(&mut self, path: &ResourcePath, update: &DataUpdate) -> Result<()> {
        if self
            .twin
            .provider(&path.provider)
            .is_some_and(Provider::is_exclusively_owned)
        {
            return Err(Error::new(
                ErrorKind::Conflict,
                format!(
                    "Provider `{}` is exclusively owned, `{path}` cannot be created by an update",
                    path.provider
                ),
            ));
        }

        let data_type = update.data_type.unwrap_or_else(|| {
            update
                .value
                .as_ref()
                .map_or(DataType::Any, DataType::of)
        });
        self.twin.add_resource(
            &path.provider,
            &path.service,
            ResourceDeclaration::property(path.resource.clone(), data_type),
            Binding::new(),
            self.events,
        )
    }

    fn require_provider(&self, level: PermissionLevel, provider: &str) -> Result<()> {
        let model = self.twin.model_of(provider);
        if self
            .authorizer
            .has_provider_permission(level, &model, provider)
        {
            Ok(())
        } else {
            Err(forbidden(level, provider))
        }
    }

    fn require_resource(&self, level: PermissionLevel, path: &ResourcePath) -> Result<()> {
        let model = self.twin.model_of(&path.provider);
        self.require_resource_of(level, &model, path)
    }

    fn require_resource_of(
        &self,
        level: PermissionLevel,
        model: &ModelIdentity,
        path: &ResourcePath,
    ) -> Result<()> {
        if self.authorizer.has_resource_permission(
            level,
            model,
            &path.provider,
            &path.service,
            &path.resource,
        ) {
            Ok(())
        } else {
            Err(forbidden(level, &path.topic()))
        }
    }
}
