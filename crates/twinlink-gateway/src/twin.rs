use std::time::SystemTime;

use hashbrown::DefaultHashBuilder;

use indexmap::map::IndexMap;

use twinlink::location::Location;
use twinlink::notification::{LifecycleStatus, NotificationTarget};
use twinlink::path::ResourcePath;
use twinlink::resource::ResourceDeclaration;
use twinlink::value::{DataType, TimedValue};

use serde::{Deserialize, Serialize};

use tracing::info;

use crate::accumulator::NotificationAccumulator;
use crate::config::GatewayConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::resource::{Binding, Resource};

/// Name of the service describing a provider itself.
pub const ADMIN_SERVICE: &str = "admin";
/// Name of the admin resource holding a human readable provider name.
pub const FRIENDLY_NAME: &str = "friendlyName";
/// Name of the admin resource holding the provider location.
pub const LOCATION: &str = "location";

fn not_found(description: String) -> Error {
    Error::new(ErrorKind::NotFound, description)
}

pub(crate) fn check_name(element: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "*" || name == "+" {
        Err(Error::new(
            ErrorKind::InvalidValue,
            format!("`{name}` is not a valid {element} name"),
        ))
    } else {
        Ok(())
    }
}

/// The model a provider is an instance of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelIdentity {
    /// Package URI of the model.
    pub package_uri: String,
    /// Model name.
    pub model: String,
}

impl std::fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.package_uri, self.model)
    }
}

impl ModelIdentity {
    /// Creates a [`ModelIdentity`].
    #[must_use]
    #[inline]
    pub fn new(package_uri: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            package_uri: package_uri.into(),
            model: model.into(),
        }
    }

    pub(crate) fn target(&self, provider: &str) -> NotificationTarget {
        NotificationTarget::provider(self.package_uri.clone(), self.model.clone(), provider)
    }
}

/// The description of a provider to create.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderBuilder {
    pub(crate) name: String,
    pub(crate) model: Option<ModelIdentity>,
    exclusively_owned: bool,
    auto_deletion: bool,
    friendly_name: Option<String>,
    location: Option<Location>,
}

impl ProviderBuilder {
    /// Creates a [`ProviderBuilder`] for a provider of the default model.
    #[must_use]
    #[inline]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: None,
            exclusively_owned: false,
            auto_deletion: false,
            friendly_name: None,
            location: None,
        }
    }

    /// Sets the provider model.
    #[must_use]
    #[inline]
    pub fn model(mut self, package_uri: impl Into<String>, model: impl Into<String>) -> Self {
        self.model = Some(ModelIdentity::new(package_uri, model));
        self
    }

    /// Prevents push updates from adding services or resources to the
    /// provider.
    #[must_use]
    #[inline]
    pub const fn exclusively_owned(mut self) -> Self {
        self.exclusively_owned = true;
        self
    }

    /// Deletes the provider when its last resource is removed.
    #[must_use]
    #[inline]
    pub const fn auto_deletion(mut self) -> Self {
        self.auto_deletion = true;
        self
    }

    /// Sets the initial friendly name.
    #[must_use]
    #[inline]
    pub fn friendly_name(mut self, friendly_name: impl Into<String>) -> Self {
        self.friendly_name = Some(friendly_name.into());
        self
    }

    /// Sets the initial location.
    #[must_use]
    #[inline]
    pub const fn location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Returns the provider name.
    #[must_use]
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A functional grouping of resources.
#[derive(Debug)]
pub struct Service {
    name: String,
    resources: IndexMap<String, Resource, DefaultHashBuilder>,
}

impl Service {
    fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            resources: IndexMap::default(),
        }
    }

    /// Returns the service name.
    #[must_use]
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the resources.
    #[inline]
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    /// Returns a resource.
    #[must_use]
    #[inline]
    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    fn insert_resource(
        &mut self,
        target: NotificationTarget,
        resource: Resource,
        events: &mut NotificationAccumulator,
    ) {
        events.lifecycle(
            target,
            LifecycleStatus::ResourceCreated,
            Some((resource.value(), resource.metadata())),
        );
        let _ = self.resources.insert(resource.name().into(), resource);
    }
}

/// A device of the twin.
#[derive(Debug)]
pub struct Provider {
    name: String,
    model: ModelIdentity,
    created: SystemTime,
    exclusively_owned: bool,
    auto_deletion: bool,
    services: IndexMap<String, Service, DefaultHashBuilder>,
}

impl Provider {
    /// Returns the provider name.
    #[must_use]
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the provider model.
    #[must_use]
    #[inline]
    pub const fn model(&self) -> &ModelIdentity {
        &self.model
    }

    /// Returns when the provider has been created.
    #[must_use]
    #[inline]
    pub const fn created(&self) -> SystemTime {
        self.created
    }

    /// Checks whether push updates are prevented from extending the
    /// provider.
    #[must_use]
    #[inline]
    pub const fn is_exclusively_owned(&self) -> bool {
        self.exclusively_owned
    }

    /// Checks whether the provider is deleted with its last resource.
    #[must_use]
    #[inline]
    pub const fn has_auto_deletion(&self) -> bool {
        self.auto_deletion
    }

    /// Returns the services.
    #[inline]
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    /// Returns a service.
    #[must_use]
    #[inline]
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    /// Returns the location stored in the admin service.
    #[must_use]
    pub fn location(&self) -> Option<Location> {
        self.service(ADMIN_SERVICE)?
            .resource(LOCATION)?
            .value()
            .value()
            .and_then(Location::from_value)
    }

    /// Returns the friendly name stored in the admin service.
    #[must_use]
    pub fn friendly_name(&self) -> Option<&str> {
        self.service(ADMIN_SERVICE)?
            .resource(FRIENDLY_NAME)?
            .value()
            .value()?
            .as_str()
    }

    pub(crate) fn target(&self) -> NotificationTarget {
        self.model.target(&self.name)
    }

    // Resources outside the admin service.
    fn user_resources(&self) -> usize {
        self.services
            .values()
            .filter(|service| service.name != ADMIN_SERVICE)
            .map(|service| service.resources.len())
            .sum()
    }

    fn create_admin(&mut self, builder: &ProviderBuilder, events: &mut NotificationAccumulator) {
        let now = SystemTime::now();
        let target = self.target().service(ADMIN_SERVICE);
        events.lifecycle(target.clone(), LifecycleStatus::ServiceCreated, None);

        let mut admin = Service::new(ADMIN_SERVICE);

        let mut friendly_name = Resource::new(
            ResourceDeclaration::property(FRIENDLY_NAME, DataType::String).modifiable(),
            Binding::new(),
        );
        if let Some(name) = &builder.friendly_name {
            friendly_name.initialize(TimedValue::new(name.as_str(), now));
        }
        admin.insert_resource(target.clone().resource(FRIENDLY_NAME), friendly_name, events);

        let mut location = Resource::new(
            ResourceDeclaration::property(LOCATION, DataType::Object).modifiable(),
            Binding::new(),
        );
        if let Some(value) = &builder.location {
            location.initialize(TimedValue::new(value.to_value(), now));
        }
        admin.insert_resource(target.resource(LOCATION), location, events);

        let _ = self.services.insert(ADMIN_SERVICE.into(), admin);
    }

    fn remove_service(&mut self, name: &str, events: &mut NotificationAccumulator) -> bool {
        let Some(service) = self.services.shift_remove(name) else {
            return false;
        };

        let target = self.target().service(name);
        for resource in service.resources.keys() {
            events.lifecycle(
                target.clone().resource(resource),
                LifecycleStatus::ResourceDeleted,
                None,
            );
        }
        events.lifecycle(target, LifecycleStatus::ServiceDeleted, None);
        true
    }
}

/// The in-memory tree of all providers, services and resources.
///
/// It is owned by the gateway thread and only accessed from commands, so it
/// has no synchronization of its own.
#[derive(Debug)]
pub struct DigitalTwin {
    providers: IndexMap<String, Provider, DefaultHashBuilder>,
    default_model: ModelIdentity,
    auto_create_admin: bool,
}

impl DigitalTwin {
    pub(crate) fn new(config: &GatewayConfig) -> Self {
        Self {
            providers: IndexMap::default(),
            default_model: ModelIdentity::new(
                config.default_model_package_uri.clone(),
                config.default_model.clone(),
            ),
            auto_create_admin: config.auto_create_admin,
        }
    }

    /// Returns all providers.
    #[inline]
    pub fn providers(&self) -> impl Iterator<Item = &Provider> {
        self.providers.values()
    }

    /// Returns the providers of a model.
    #[inline]
    pub fn providers_of<'a>(
        &'a self,
        model: &'a ModelIdentity,
    ) -> impl Iterator<Item = &'a Provider> {
        self.providers()
            .filter(move |provider| provider.model() == model)
    }

    /// Returns a provider.
    #[must_use]
    #[inline]
    pub fn provider(&self, name: &str) -> Option<&Provider> {
        self.providers.get(name)
    }

    /// Returns a service.
    #[must_use]
    #[inline]
    pub fn service(&self, provider: &str, service: &str) -> Option<&Service> {
        self.provider(provider)?.service(service)
    }

    /// Returns a resource.
    #[must_use]
    #[inline]
    pub fn resource(&self, path: &ResourcePath) -> Option<&Resource> {
        self.service(&path.provider, &path.service)?
            .resource(&path.resource)
    }

    /// Returns the model assigned to providers created without one.
    #[must_use]
    #[inline]
    pub const fn default_model(&self) -> &ModelIdentity {
        &self.default_model
    }

    /// Returns the model of a provider, or the default model when the
    /// provider does not exist.
    #[must_use]
    pub fn model_of(&self, provider: &str) -> ModelIdentity {
        self.provider(provider)
            .map_or_else(|| self.default_model.clone(), |provider| provider.model.clone())
    }

    pub(crate) fn lookup(&self, path: &ResourcePath) -> Result<&Resource> {
        let provider = self
            .provider(&path.provider)
            .ok_or_else(|| not_found(format!("Provider `{}` does not exist", path.provider)))?;
        let service = provider.service(&path.service).ok_or_else(|| {
            not_found(format!(
                "Service `{}/{}` does not exist",
                path.provider, path.service
            ))
        })?;
        service
            .resource(&path.resource)
            .ok_or_else(|| not_found(format!("Resource `{path}` does not exist")))
    }

    pub(crate) fn lookup_mut(
        &mut self,
        path: &ResourcePath,
    ) -> Result<(NotificationTarget, &mut Resource)> {
        let provider = self
            .providers
            .get_mut(&path.provider)
            .ok_or_else(|| not_found(format!("Provider `{}` does not exist", path.provider)))?;
        let target = provider
            .target()
            .service(path.service.clone())
            .resource(path.resource.clone());
        let service = provider.services.get_mut(&path.service).ok_or_else(|| {
            not_found(format!(
                "Service `{}/{}` does not exist",
                path.provider, path.service
            ))
        })?;
        let resource = service
            .resources
            .get_mut(&path.resource)
            .ok_or_else(|| not_found(format!("Resource `{path}` does not exist")))?;
        Ok((target, resource))
    }

    pub(crate) fn create_provider(
        &mut self,
        builder: &ProviderBuilder,
        events: &mut NotificationAccumulator,
    ) -> Result<()> {
        check_name("provider", &builder.name)?;

        if self.providers.contains_key(&builder.name) {
            return Err(Error::new(
                ErrorKind::Conflict,
                format!("Provider `{}` already exists", builder.name),
            ));
        }

        let mut provider = Provider {
            name: builder.name.clone(),
            model: builder
                .model
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
            created: SystemTime::now(),
            exclusively_owned: builder.exclusively_owned,
            auto_deletion: builder.auto_deletion,
            services: IndexMap::default(),
        };

        events.lifecycle(provider.target(), LifecycleStatus::ProviderCreated, None);
        if self.auto_create_admin {
            provider.create_admin(builder, events);
        }

        info!("Provider `{}` of model `{}` created", provider.name, provider.model);
        let _ = self.providers.insert(provider.name.clone(), provider);
        Ok(())
    }

    // Creates the provider when missing. An existing provider must be of the
    // requested model, if any.
    pub(crate) fn ensure_provider(
        &mut self,
        name: &str,
        model: Option<&ModelIdentity>,
        events: &mut NotificationAccumulator,
    ) -> Result<()> {
        if let Some(provider) = self.providers.get(name) {
            return match model {
                Some(model) if provider.model != *model => Err(Error::new(
                    ErrorKind::Conflict,
                    format!(
                        "Provider `{name}` is of model `{}`, not `{model}`",
                        provider.model
                    ),
                )),
                _ => Ok(()),
            };
        }

        let mut builder = ProviderBuilder::new(name);
        builder.model = model.cloned();
        self.create_provider(&builder, events)
    }

    pub(crate) fn ensure_service(
        &mut self,
        provider: &str,
        service: &str,
        events: &mut NotificationAccumulator,
    ) -> Result<()> {
        check_name("service", service)?;

        let provider = self
            .providers
            .get_mut(provider)
            .ok_or_else(|| not_found(format!("Provider `{provider}` does not exist")))?;

        if !provider.services.contains_key(service) {
            events.lifecycle(
                provider.target().service(service),
                LifecycleStatus::ServiceCreated,
                None,
            );
            let _ = provider
                .services
                .insert(service.into(), Service::new(service));
        }
        Ok(())
    }

    pub(crate) fn add_resource(
        &mut self,
        provider: &str,
        service: &str,
        declaration: ResourceDeclaration,
        binding: Binding,
        events: &mut NotificationAccumulator,
    ) -> Result<()> {
        check_name("resource", &declaration.name)?;
        self.ensure_service(provider, service, events)?;

        let provider = self
            .providers
            .get_mut(provider)
            .ok_or_else(|| not_found(format!("Provider `{provider}` does not exist")))?;
        let target = provider
            .target()
            .service(service)
            .resource(declaration.name.clone());
        let service = provider
            .services
            .get_mut(service)
            .ok_or_else(|| not_found(format!("Service `{service}` does not exist")))?;

        if service.resources.contains_key(&declaration.name) {
            return Err(Error::new(
                ErrorKind::Conflict,
                format!("Resource `{}` already exists", target.topic()),
            ));
        }

        service.insert_resource(target, Resource::new(declaration, binding), events);
        Ok(())
    }

    pub(crate) fn remove_provider(
        &mut self,
        name: &str,
        events: &mut NotificationAccumulator,
    ) -> Result<()> {
        let mut provider = self
            .providers
            .shift_remove(name)
            .ok_or_else(|| not_found(format!("Provider `{name}` does not exist")))?;

        let services = provider.services.keys().cloned().collect::<Vec<_>>();
        for service in services {
            let _ = provider.remove_service(&service, events);
        }
        events.lifecycle(provider.target(), LifecycleStatus::ProviderDeleted, None);

        info!("Provider `{name}` removed");
        Ok(())
    }

    pub(crate) fn remove_service(
        &mut self,
        provider_name: &str,
        service: &str,
        events: &mut NotificationAccumulator,
    ) -> Result<()> {
        let provider = self
            .providers
            .get_mut(provider_name)
            .ok_or_else(|| not_found(format!("Provider `{provider_name}` does not exist")))?;

        if !provider.remove_service(service, events) {
            return Err(not_found(format!(
                "Service `{provider_name}/{service}` does not exist"
            )));
        }

        self.remove_if_orphan(provider_name, events)
    }

    pub(crate) fn remove_resource(
        &mut self,
        path: &ResourcePath,
        events: &mut NotificationAccumulator,
    ) -> Result<()> {
        let (target, _) = self.lookup_mut(path)?;

        if let Some(service) = self
            .providers
            .get_mut(&path.provider)
            .and_then(|provider| provider.services.get_mut(&path.service))
        {
            let _ = service.resources.shift_remove(&path.resource);
        }
        events.lifecycle(target, LifecycleStatus::ResourceDeleted, None);

        self.remove_if_orphan(&path.provider, events)
    }

    // Deletes an auto-deletion provider left without resources.
    fn remove_if_orphan(&mut self, name: &str, events: &mut NotificationAccumulator) -> Result<()> {
        let orphan = self
            .providers
            .get(name)
            .is_some_and(|provider| provider.auto_deletion && provider.user_resources() == 0);

        if orphan {
            self.remove_provider(name, events)
        } else {
            Ok(())
        }
    }
}
