use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;

use serde_json::Value;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use tracing::info;

use twinlink::notification::Notification;
use twinlink::parameters::ParametersValues;
use twinlink::path::ResourcePath;
use twinlink::resource::GetLevel;
use twinlink::update::BulkUpdate;
use twinlink::value::{Metadata, TimedValue};

use crate::authorizer::{AllowAll, Authorizer, CachedAuthorizer};
use crate::bus::{NotificationBus, NotificationListener, SubscriptionId, SubscriptionOptions};
use crate::command::CommandContext;
use crate::config::GatewayConfig;
use crate::criterion::Criterion;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::{BoxedCommand, CommandExecutor, CommandFuture, Engine};
use crate::filter::FilterRegistry;
use crate::registry::CapabilityRegistry;
use crate::snapshot::{ProviderSnapshot, ResourceSnapshot, ServiceSnapshot, filter_values};
use crate::twin::DigitalTwin;

// Submits every update at once, then waits for all of them. The first
// failure is returned.
fn push_updates(
    executor: &CommandExecutor,
    authorizer: &Arc<dyn Authorizer>,
    updates: BulkUpdate,
) -> impl Future<Output = Result<()>> + Send + 'static {
    let futures = updates
        .into_iter()
        .map(|update| {
            executor.submit(Arc::clone(authorizer), move |ctx| {
                ctx.apply_update(&update)
            })
        })
        .collect::<Vec<_>>();

    async move {
        let mut outcome = Ok(());
        for future in futures {
            if let Err(e) = future.await
                && outcome.is_ok()
            {
                outcome = Err(e);
            }
        }
        outcome
    }
}

/// The notifications of a channel subscription.
///
/// Dropping the stream removes its subscription.
#[derive(Debug)]
pub struct NotificationStream {
    id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<Notification>,
    bus: Arc<NotificationBus>,
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        let _ = self.bus.unsubscribe(self.id);
    }
}

impl NotificationStream {
    /// Returns the subscription identifier.
    #[must_use]
    #[inline]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next notification.
    ///
    /// Returns `None` once the subscription has been removed and every
    /// delivered notification has been received.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    /// Returns the next notification if one is available.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }
}

/// The gateway, owner of the digital twin.
///
/// Every read and write of the twin is a command run on the gateway thread.
/// The gateway itself acts on behalf of devices and is not subject to
/// authorization, consumers go through a [`Session`].
///
/// Cloning a gateway is cheap, all clones share the same twin.
#[derive(Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
    executor: Arc<CommandExecutor>,
    bus: Arc<NotificationBus>,
    filters: Arc<FilterRegistry>,
    registry: Arc<CapabilityRegistry>,
    authorizer: Arc<dyn Authorizer>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("bus", &self.bus)
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Starts a gateway and its thread.
    ///
    /// Notifications are delivered by tasks of the current `Tokio` runtime.
    ///
    /// # Errors
    ///
    /// Fails when called outside a `Tokio` runtime or when the gateway
    /// thread cannot be spawned.
    pub fn start(config: GatewayConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            Error::new(
                ErrorKind::Closed,
                format!("The gateway must be started within a Tokio runtime: {e}"),
            )
        })?;

        let bus = Arc::new(NotificationBus::new(runtime));
        let engine = Engine::new(DigitalTwin::new(&config), Arc::clone(&bus));
        let executor = Arc::new(CommandExecutor::start(&config, engine)?);
        let registry = Arc::new(CapabilityRegistry::new(Arc::clone(&executor)));

        info!("Gateway `{}` started", config.thread_name);

        Ok(Self {
            config: Arc::new(config),
            executor,
            bus,
            filters: Arc::new(FilterRegistry::new()),
            registry,
            authorizer: Arc::new(AllowAll),
        })
    }

    /// Returns the configuration.
    #[must_use]
    #[inline]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Opens a session checking every operation with an authorizer.
    #[must_use]
    pub fn session<A>(&self, authorizer: A) -> Session
    where
        A: Authorizer + 'static,
    {
        Session {
            executor: Arc::clone(&self.executor),
            bus: Arc::clone(&self.bus),
            authorizer: Arc::new(authorizer),
        }
    }

    /// Opens a session whose authorizer decisions are cached.
    #[must_use]
    pub fn cached_session<A>(&self, authorizer: A) -> Session
    where
        A: Authorizer + 'static,
    {
        self.session(CachedAuthorizer::new(
            authorizer,
            self.config.authorization_cache_capacity,
        ))
    }

    /// Submits a command.
    pub fn submit<T, F>(&self, command: F) -> CommandFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut CommandContext<'_>) -> Result<T> + Send + 'static,
    {
        self.executor.submit(Arc::clone(&self.authorizer), command)
    }

    /// Submits independent commands, run in order.
    ///
    /// Each command succeeds or fails on its own, and commands of other
    /// submitters may run in between.
    pub fn submit_batch<T>(&self, commands: Vec<BoxedCommand<T>>) -> Vec<CommandFuture<T>>
    where
        T: Send + 'static,
    {
        self.executor.submit_batch(&self.authorizer, commands)
    }

    /// Applies updates pushed by devices.
    ///
    /// The updates are submitted when this method is called, awaiting the
    /// returned future only waits for them.
    pub fn push_update(
        &self,
        updates: impl Into<BulkUpdate>,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        push_updates(&self.executor, &self.authorizer, updates.into())
    }

    /// Returns the registry of device capabilities.
    #[must_use]
    #[inline]
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Returns the registry of filter languages.
    #[must_use]
    #[inline]
    pub fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    /// Parses a filter with the registered languages.
    ///
    /// # Errors
    ///
    /// Fails when no parser supports the language or when the query is
    /// invalid.
    pub fn parse_filter(&self, language: &str, query: &str) -> Result<Criterion> {
        self.filters.parse_filter(language, query)
    }

    /// Adds an unrestricted listener.
    pub fn add_listener<L>(&self, options: SubscriptionOptions, listener: L) -> SubscriptionId
    where
        L: NotificationListener,
    {
        self.bus.subscribe(options, listener)
    }

    /// Removes a listener.
    ///
    /// Returns `false` when the subscription does not exist.
    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Returns the number of active listeners, streams included.
    #[must_use]
    #[inline]
    pub fn listener_count(&self) -> usize {
        self.bus.len()
    }

    /// Checks whether the gateway has been shut down.
    #[must_use]
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.executor.is_closed()
    }

    /// Stops the gateway once the commands already submitted have run.
    ///
    /// Later commands fail with [`ErrorKind::Closed`]. Listeners receive the
    /// notifications of the commands already run, then stop.
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
        self.bus.shutdown().await;
        info!("Gateway `{}` stopped", self.config.thread_name);
    }
}

/// A consumer of the twin.
///
/// Every operation and notification is checked against the session
/// authorizer.
#[derive(Clone)]
pub struct Session {
    executor: Arc<CommandExecutor>,
    bus: Arc<NotificationBus>,
    authorizer: Arc<dyn Authorizer>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    /// Submits a command with the session permissions.
    pub fn submit<T, F>(&self, command: F) -> CommandFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut CommandContext<'_>) -> Result<T> + Send + 'static,
    {
        self.executor.submit(Arc::clone(&self.authorizer), command)
    }

    /// Returns the value of a resource.
    pub fn get_value(&self, path: ResourcePath, level: GetLevel) -> CommandFuture<TimedValue> {
        self.submit(move |ctx| ctx.get_value(&path, level))
    }

    /// Sets the value of a resource, timestamped now when no timestamp is
    /// given.
    pub fn set_value(
        &self,
        path: ResourcePath,
        value: impl Into<Value>,
        timestamp: Option<SystemTime>,
    ) -> CommandFuture<()> {
        let value = value.into();
        self.submit(move |ctx| ctx.set_value(&path, value, timestamp))
    }

    /// Invokes an action.
    pub fn act(&self, path: ResourcePath, arguments: ParametersValues) -> CommandFuture<Value> {
        self.submit(move |ctx| ctx.act(&path, &arguments))
    }

    /// Returns the metadata of a resource.
    pub fn get_metadata(&self, path: ResourcePath) -> CommandFuture<Metadata> {
        self.submit(move |ctx| ctx.get_metadata(&path))
    }

    /// Sets a metadata field of a resource.
    pub fn set_metadata(
        &self,
        path: ResourcePath,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> CommandFuture<()> {
        let key = key.into();
        let value = value.into();
        self.submit(move |ctx| ctx.set_metadata(&path, &key, value))
    }

    /// Takes a snapshot of a provider.
    pub fn snapshot_provider(
        &self,
        provider: impl Into<String>,
        level: GetLevel,
    ) -> CommandFuture<ProviderSnapshot> {
        let provider = provider.into();
        self.submit(move |ctx| ctx.snapshot_provider(&provider, level))
    }

    /// Takes a snapshot of a service.
    pub fn snapshot_service(
        &self,
        provider: impl Into<String>,
        service: impl Into<String>,
        level: GetLevel,
    ) -> CommandFuture<ServiceSnapshot> {
        let provider = provider.into();
        let service = service.into();
        self.submit(move |ctx| ctx.snapshot_service(&provider, &service, level))
    }

    /// Takes a snapshot of a resource.
    pub fn snapshot_resource(
        &self,
        path: ResourcePath,
        level: GetLevel,
    ) -> CommandFuture<ResourceSnapshot> {
        self.submit(move |ctx| ctx.snapshot_resource(&path, level))
    }

    /// Takes a filtered snapshot of the twin.
    ///
    /// The location, provider, service and resource predicates run on the
    /// gateway thread, the value predicate runs once the future resolves.
    pub fn filtered_snapshot(
        &self,
        criterion: Criterion,
        level: GetLevel,
    ) -> impl Future<Output = Result<Vec<ProviderSnapshot>>> + Send + 'static {
        let pruning = criterion.clone();
        let snapshot = self.submit(move |ctx| ctx.filtered_snapshot(&pruning, level));

        async move { filter_values(&criterion, snapshot.await?) }
    }

    /// Applies updates with the session permissions.
    pub fn push_update(
        &self,
        updates: impl Into<BulkUpdate>,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        push_updates(&self.executor, &self.authorizer, updates.into())
    }

    /// Adds a listener on topic patterns, such as `p1/*` or `+/sensor/*`.
    ///
    /// Only the notifications the session may see are delivered.
    pub fn add_listener<I, S, L>(&self, patterns: I, listener: L) -> SubscriptionId
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        L: NotificationListener,
    {
        self.bus.subscribe(
            SubscriptionOptions::topics(patterns).authorizer(Arc::clone(&self.authorizer)),
            listener,
        )
    }

    /// Adds a listener on the data notifications accepted by a criterion.
    pub fn add_criterion_listener<L>(&self, criterion: Criterion, listener: L) -> SubscriptionId
    where
        L: NotificationListener,
    {
        self.bus.subscribe(
            SubscriptionOptions::criterion(criterion).authorizer(Arc::clone(&self.authorizer)),
            listener,
        )
    }

    /// Subscribes to topic patterns through a channel.
    pub fn subscribe<I, S>(&self, patterns: I) -> NotificationStream
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.add_listener(patterns, move |notification: &Notification| -> Result<()> {
            // A dropped stream unsubscribes, late notifications are discarded.
            let _ = sender.send(notification.clone());
            Ok(())
        });
        NotificationStream {
            id,
            receiver,
            bus: Arc::clone(&self.bus),
        }
    }

    /// Removes a listener.
    ///
    /// Returns `false` when the subscription does not exist.
    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }
}
