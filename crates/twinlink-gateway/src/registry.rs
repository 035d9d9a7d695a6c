use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hashbrown::HashMap;

use serde_json::Value;

use tracing::info;

use twinlink::parameters::ParametersValues;
use twinlink::path::ResourcePath;
use twinlink::resource::ResourceDeclaration;
use twinlink::value::TimedValue;

use crate::authorizer::{AllowAll, Authorizer};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::{CommandExecutor, CommandFuture};
use crate::resource::Binding;
use crate::twin::ProviderBuilder;

/// A resource offered by a device bridge, along with the functions reading,
/// writing or invoking it.
#[derive(Debug)]
pub struct CapabilityDescriptor {
    provider: ProviderBuilder,
    service: String,
    declaration: ResourceDeclaration,
    binding: Binding,
}

impl CapabilityDescriptor {
    /// Creates a [`CapabilityDescriptor`] without bound functions.
    #[must_use]
    #[inline]
    pub fn new(
        provider: ProviderBuilder,
        service: impl Into<String>,
        declaration: ResourceDeclaration,
    ) -> Self {
        Self {
            provider,
            service: service.into(),
            declaration,
            binding: Binding::new(),
        }
    }

    /// Binds a getter.
    #[must_use]
    #[inline]
    pub fn getter<F>(mut self, getter: F) -> Self
    where
        F: Fn() -> Result<TimedValue> + Send + Sync + 'static,
    {
        self.binding = self.binding.getter(getter);
        self
    }

    /// Binds a setter.
    #[must_use]
    #[inline]
    pub fn setter<F>(mut self, setter: F) -> Self
    where
        F: Fn(&TimedValue) -> Result<()> + Send + Sync + 'static,
    {
        self.binding = self.binding.setter(setter);
        self
    }

    /// Binds an action handler.
    #[must_use]
    #[inline]
    pub fn action<F>(mut self, action: F) -> Self
    where
        F: Fn(&ParametersValues) -> Result<Value> + Send + Sync + 'static,
    {
        self.binding = self.binding.action(action);
        self
    }

    /// Sets how long a pulled value is reused by normal reads.
    #[must_use]
    #[inline]
    pub fn cache_period(mut self, cache_period: Duration) -> Self {
        self.binding = self.binding.cache_period(cache_period);
        self
    }

    /// Returns the path of the described resource.
    #[must_use]
    pub fn path(&self) -> ResourcePath {
        ResourcePath::new(
            self.provider.name(),
            self.service.as_str(),
            self.declaration.name.as_str(),
        )
    }
}

/// Identifier of a registered capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationHandle(u64);

impl std::fmt::Display for RegistrationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Registrations = Arc<Mutex<HashMap<RegistrationHandle, ResourcePath>>>;

/// Turns the capabilities offered by device bridges into resources of the
/// twin.
///
/// Registering a capability creates its resource, and its provider and
/// service when missing. Unregistering it removes the resource.
pub struct CapabilityRegistry {
    executor: Arc<CommandExecutor>,
    authorizer: Arc<dyn Authorizer>,
    registrations: Registrations,
    next_id: AtomicU64,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("registered", &self.registered())
            .finish_non_exhaustive()
    }
}

impl CapabilityRegistry {
    pub(crate) fn new(executor: Arc<CommandExecutor>) -> Self {
        Self {
            executor,
            authorizer: Arc::new(AllowAll),
            registrations: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a capability.
    ///
    /// The future fails with [`ErrorKind::Conflict`] when functions are
    /// already bound to the resource.
    pub fn register(&self, descriptor: CapabilityDescriptor) -> CommandFuture<RegistrationHandle> {
        let handle = RegistrationHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let registrations = Arc::clone(&self.registrations);

        self.executor
            .submit(Arc::clone(&self.authorizer), move |ctx| {
                let path = descriptor.path();
                let CapabilityDescriptor {
                    provider,
                    service,
                    declaration,
                    binding,
                } = descriptor;

                ctx.bind_resource(&provider, &service, declaration, binding)?;

                info!("Capability `{path}` registered as {handle}");
                let _ = registrations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(handle, path);
                Ok(handle)
            })
    }

    /// Unregisters a capability, removing its resource.
    pub fn unregister(&self, handle: RegistrationHandle) -> CommandFuture<()> {
        let registrations = Arc::clone(&self.registrations);

        self.executor
            .submit(Arc::clone(&self.authorizer), move |ctx| {
                let path = registrations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&handle)
                    .ok_or_else(|| {
                        Error::new(
                            ErrorKind::NotFound,
                            format!("No capability is registered as {handle}"),
                        )
                    })?;

                info!("Capability `{path}` unregistered");
                match ctx.remove_resource(&path) {
                    // The resource may have been removed in the meantime.
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    result => result,
                }
            })
    }

    /// Returns the registered capabilities.
    #[must_use]
    pub fn registered(&self) -> Vec<(RegistrationHandle, ResourcePath)> {
        let mut registered = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(handle, path)| (*handle, path.clone()))
            .collect::<Vec<_>>();
        registered.sort();
        registered
    }
}
