use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use hashbrown::HashMap;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use tracing::{debug, error, warn};

use twinlink::location::Location;
use twinlink::notification::{LifecycleStatus, Notification};
use twinlink::path::TopicFilter;
use twinlink::permission::PermissionLevel;

use crate::authorizer::Authorizer;
use crate::criterion::Criterion;
use crate::error::Result;
use crate::twin::{ADMIN_SERVICE, LOCATION, ModelIdentity};

/// Receives the notifications of a subscription.
///
/// A listener is called on the blocking thread pool of the runtime, never
/// from the gateway thread, and always in the order the changes have been
/// committed. A listener may block: it only delays its own subscription.
/// A failing or panicking listener is logged and keeps receiving later
/// notifications.
pub trait NotificationListener: Send + Sync + 'static {
    /// Handles a notification.
    ///
    /// # Errors
    ///
    /// A failure is logged by the delivery task.
    fn notify(&self, notification: &Notification) -> Result<()>;
}

impl<F> NotificationListener for F
where
    F: Fn(&Notification) -> Result<()> + Send + Sync + 'static,
{
    fn notify(&self, notification: &Notification) -> Result<()> {
        self(notification)
    }
}

/// Identifier of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a subscription receives.
#[derive(Default)]
pub struct SubscriptionOptions {
    pub(crate) filters: Vec<TopicFilter>,
    pub(crate) authorizer: Option<Arc<dyn Authorizer>>,
    pub(crate) criterion: Option<Criterion>,
}

impl SubscriptionOptions {
    /// Subscribes to the given topic patterns.
    #[must_use]
    pub fn topics<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            filters: patterns
                .into_iter()
                .map(|pattern| TopicFilter::new(pattern.as_ref()))
                .collect(),
            ..Self::default()
        }
    }

    /// Subscribes to the data notifications accepted by a criterion, on the
    /// topics it declares.
    #[must_use]
    pub fn criterion(criterion: Criterion) -> Self {
        Self {
            filters: criterion.data_topics(),
            criterion: Some(criterion),
            ..Self::default()
        }
    }

    /// Delivers only the notifications an authorizer allows.
    #[must_use]
    #[inline]
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }
}

// A notification along with the location of its provider at commit time.
struct Envelope {
    notification: Notification,
    location: Option<Location>,
}

struct Subscriber {
    id: SubscriptionId,
    filters: Vec<TopicFilter>,
    sender: mpsc::UnboundedSender<Arc<Envelope>>,
    cancellation_token: CancellationToken,
}

struct Delivery {
    id: SubscriptionId,
    authorizer: Option<Arc<dyn Authorizer>>,
    criterion: Option<Criterion>,
}

impl Delivery {
    fn accepts(&self, envelope: &Envelope) -> bool {
        if let Some(authorizer) = &self.authorizer
            && !is_permitted(authorizer.as_ref(), &envelope.notification)
        {
            return false;
        }

        let Some(criterion) = &self.criterion else {
            return true;
        };

        // Criteria only select data notifications.
        let Some(data) = envelope.notification.as_data() else {
            return false;
        };

        match criterion.matches_notification(data, envelope.location.as_ref()) {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(
                    "Subscription {} could not evaluate its criterion on `{}`: {e}",
                    self.id,
                    data.target.topic()
                );
                false
            }
        }
    }
}

fn is_permitted(authorizer: &dyn Authorizer, notification: &Notification) -> bool {
    let target = notification.target();
    let model = ModelIdentity::new(target.model_package_uri.clone(), target.model.clone());
    let level = match notification {
        Notification::Lifecycle(_) => PermissionLevel::Describe,
        Notification::Data(_) | Notification::Metadata(_) => PermissionLevel::Read,
    };

    match (target.service.as_deref(), target.resource.as_deref()) {
        (Some(service), Some(resource)) => {
            authorizer.has_resource_permission(level, &model, &target.provider, service, resource)
        }
        (Some(service), None) => {
            authorizer.has_service_permission(level, &model, &target.provider, service)
        }
        _ => authorizer.has_provider_permission(level, &model, &target.provider),
    }
}

async fn deliver<L: NotificationListener>(
    delivery: &Delivery,
    listener: &Arc<L>,
    envelope: Arc<Envelope>,
) {
    if !delivery.accepts(&envelope) {
        return;
    }

    let handler = Arc::clone(listener);
    let notification = Arc::clone(&envelope);
    match tokio::task::spawn_blocking(move || handler.notify(&notification.notification)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(
            "Subscription {} failed to handle `{}`: {e}",
            delivery.id, envelope.notification
        ),
        Err(e) if e.is_panic() => error!(
            "Subscription {} panicked while handling `{}`",
            delivery.id, envelope.notification
        ),
        Err(e) => warn!(
            "Subscription {} could not handle `{}`: {e}",
            delivery.id, envelope.notification
        ),
    }
}

async fn run_delivery<L: NotificationListener>(
    delivery: Delivery,
    listener: L,
    mut receiver: mpsc::UnboundedReceiver<Arc<Envelope>>,
    removed: CancellationToken,
    shutdown: CancellationToken,
) {
    let listener = Arc::new(listener);
    loop {
        tokio::select! {
            biased;
            () = removed.cancelled() => { break; }
            () = shutdown.cancelled() => {
                // The notifications already queued are still delivered.
                receiver.close();
                while let Some(envelope) = receiver.recv().await {
                    if removed.is_cancelled() {
                        break;
                    }
                    deliver(&delivery, &listener, envelope).await;
                }
                break;
            }
            envelope = receiver.recv() => {
                let Some(envelope) = envelope else {
                    break;
                };
                deliver(&delivery, &listener, envelope).await;
            }
        }
    }
    debug!("Delivery task of subscription {} stopped", delivery.id);
}

/// Fans out committed changes to the subscribers.
///
/// The gateway thread publishes the notifications of each command as soon as
/// it returns. Every subscriber owns an unbounded queue drained by its own
/// task, so a slow subscriber never slows down the gateway thread nor the
/// other subscribers.
///
/// Removing a subscription stops its delivery at once. On shutdown instead,
/// every notification already queued is delivered before the tasks stop.
///
/// The subscriber list is copied on write: adding or removing a subscriber
/// never waits for a publication in progress.
pub struct NotificationBus {
    runtime: Handle,
    subscribers: RwLock<Arc<Vec<Arc<Subscriber>>>>,
    locations: RwLock<HashMap<String, Location>>,
    next_id: AtomicU64,
    cancellation_token: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("subscribers", &self.len())
            .finish_non_exhaustive()
    }
}

impl NotificationBus {
    pub(crate) fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            subscribers: RwLock::new(Arc::new(Vec::new())),
            locations: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            cancellation_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Returns the number of active subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Checks whether there is no active subscription.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn subscribe<L>(&self, options: SubscriptionOptions, listener: L) -> SubscriptionId
    where
        L: NotificationListener,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancellation_token = CancellationToken::new();

        let SubscriptionOptions {
            filters,
            authorizer,
            criterion,
        } = options;

        debug!(
            "Adding subscription {id} on {:?}",
            filters.iter().map(TopicFilter::pattern).collect::<Vec<_>>()
        );

        let delivery = Delivery {
            id,
            authorizer,
            criterion,
        };
        drop(self.tracker.spawn_on(
            run_delivery(
                delivery,
                listener,
                receiver,
                cancellation_token.clone(),
                self.cancellation_token.clone(),
            ),
            &self.runtime,
        ));

        let subscriber = Arc::new(Subscriber {
            id,
            filters,
            sender,
            cancellation_token,
        });

        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut updated = Vec::with_capacity(subscribers.len() + 1);
        updated.extend(subscribers.iter().cloned());
        updated.push(subscriber);
        *subscribers = Arc::new(updated);

        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(removed) = subscribers.iter().find(|subscriber| subscriber.id == id).cloned()
        else {
            return false;
        };

        *subscribers = Arc::new(
            subscribers
                .iter()
                .filter(|subscriber| subscriber.id != id)
                .cloned()
                .collect(),
        );
        removed.cancellation_token.cancel();
        debug!("Removed subscription {id}");
        true
    }

    pub(crate) fn publish(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }

        // Snapshot of the subscribers, the lock is not held while sending.
        let subscribers = Arc::clone(
            &self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        );

        for notification in notifications {
            self.track_location(&notification);

            let topic = notification.topic();
            let mut envelope = None;
            for subscriber in subscribers.iter() {
                if !TopicFilter::any_matches(&subscriber.filters, &topic) {
                    continue;
                }

                let envelope = envelope
                    .get_or_insert_with(|| {
                        Arc::new(Envelope {
                            location: self.location_of(&notification.target().provider),
                            notification: notification.clone(),
                        })
                    })
                    .clone();

                if subscriber.sender.send(envelope).is_err() {
                    debug!(
                        "Subscription {} is no longer running, skipping `{topic}`",
                        subscriber.id
                    );
                }
            }
        }
    }

    // Waits until every delivery task has handed over its queued
    // notifications.
    pub(crate) async fn shutdown(&self) {
        self.cancellation_token.cancel();
        *self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(Vec::new());

        let _ = self.tracker.close();
        self.tracker.wait().await;
    }

    fn location_of(&self, provider: &str) -> Option<Location> {
        self.locations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
            .copied()
    }

    // Keeps the provider locations seen by the location predicates in sync
    // with the admin service.
    fn track_location(&self, notification: &Notification) {
        let target = notification.target();
        let is_location = target.service.as_deref() == Some(ADMIN_SERVICE)
            && target.resource.as_deref() == Some(LOCATION);

        let update = match notification {
            Notification::Data(data) if is_location => Some(
                data.new_value
                    .as_ref()
                    .and_then(Location::from_value),
            ),
            Notification::Lifecycle(lifecycle)
                if lifecycle.status == LifecycleStatus::ProviderDeleted =>
            {
                Some(None)
            }
            Notification::Lifecycle(lifecycle)
                if is_location && lifecycle.status == LifecycleStatus::ResourceCreated =>
            {
                Some(
                    lifecycle
                        .initial_value
                        .as_ref()
                        .and_then(|value| value.value())
                        .and_then(Location::from_value),
                )
            }
            _ => None,
        };

        let Some(location) = update else {
            return;
        };

        let mut locations = self.locations.write().unwrap_or_else(PoisonError::into_inner);
        match location {
            Some(location) => {
                let _ = locations.insert(target.provider.clone(), location);
            }
            None => {
                let _ = locations.remove(&target.provider);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime};

    use serial_test::serial;

    use serde_json::json;

    use twinlink::location::Location;
    use twinlink::notification::{
        DataNotification, LifecycleNotification, LifecycleStatus, Notification, NotificationTarget,
    };
    use twinlink::permission::PermissionLevel;
    use twinlink::value::{DataType, Metadata};

    use tokio::runtime::Handle;

    use crate::authorizer::{Policy, Scope};
    use crate::criterion::Criterion;
    use crate::error::{Error, ErrorKind};

    use super::{NotificationBus, SubscriptionOptions};

    const URI: &str = "https://example.org/model";

    fn data(
        provider: &str,
        service: &str,
        resource: &str,
        value: serde_json::Value,
    ) -> Notification {
        Notification::Data(DataNotification {
            target: NotificationTarget::provider(URI, "sensor", provider)
                .service(service)
                .resource(resource),
            data_type: DataType::Any,
            old_value: None,
            new_value: Some(value),
            timestamp: Some(SystemTime::now()),
            metadata: Metadata::new(),
        })
    }

    fn collector() -> (
        Arc<Mutex<Vec<String>>>,
        impl Fn(&Notification) -> crate::error::Result<()> + Send + Sync + 'static,
    ) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        (received, move |notification: &Notification| -> crate::error::Result<()> {
            sink.lock().unwrap().push(notification.topic());
            Ok(())
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[serial]
    async fn test_topic_matching() {
        let bus = NotificationBus::new(Handle::current());
        let (received, listener) = collector();
        let _ = bus.subscribe(SubscriptionOptions::topics(["p1/*"]), listener);

        bus.publish(vec![
            data("p1", "s1", "r1", json!(1)),
            data("p1", "s2", "r2", json!(2)),
            data("p2", "s1", "r1", json!(3)),
        ]);
        settle().await;

        assert_eq!(*received.lock().unwrap(), ["p1/s1/r1", "p1/s2/r2"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[serial]
    async fn test_failing_listener_is_isolated() {
        let bus = NotificationBus::new(Handle::current());
        let (received, listener) = collector();

        let _ = bus.subscribe(
            SubscriptionOptions::topics(["*"]),
            |_: &Notification| -> crate::error::Result<()> {
                Err(Error::new(ErrorKind::Handler, "listener failure"))
            },
        );
        let _ = bus.subscribe(
            SubscriptionOptions::topics(["*"]),
            |_: &Notification| -> crate::error::Result<()> { panic!("listener panic") },
        );
        let id = bus.subscribe(SubscriptionOptions::topics(["*"]), listener);

        bus.publish(vec![data("p1", "s1", "r1", json!(1))]);
        bus.publish(vec![data("p1", "s1", "r1", json!(2))]);
        settle().await;
        assert_eq!(received.lock().unwrap().len(), 2);

        assert_eq!(bus.len(), 3);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(vec![data("p1", "s1", "r1", json!(3))]);
        settle().await;
        assert_eq!(received.lock().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[serial]
    async fn test_authorized_subscription() {
        let bus = NotificationBus::new(Handle::current());
        let (received, listener) = collector();
        let policy = Policy::new().allow(Scope::Resource, &[PermissionLevel::Read], "p1/*");
        let _ = bus.subscribe(
            SubscriptionOptions::topics(["*"]).authorizer(Arc::new(policy)),
            listener,
        );

        bus.publish(vec![
            data("p1", "s1", "r1", json!(1)),
            data("p2", "s1", "r1", json!(2)),
            Notification::Lifecycle(LifecycleNotification {
                target: NotificationTarget::provider(URI, "sensor", "p1"),
                status: LifecycleStatus::ProviderCreated,
                initial_value: None,
                initial_metadata: None,
            }),
        ]);
        settle().await;

        // Lifecycle notifications need the describe level.
        assert_eq!(*received.lock().unwrap(), ["p1/s1/r1"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[serial]
    async fn test_criterion_subscription() {
        let bus = NotificationBus::new(Handle::current());
        let (received, listener) = collector();
        let criterion = Criterion::new()
            .near(Location::new(45.0, 7.0), 1_000.)
            .value(|snapshot| {
                Ok(snapshot
                    .resources()
                    .any(|(_, resource)| resource.has_value()))
            });
        let _ = bus.subscribe(SubscriptionOptions::criterion(criterion), listener);

        bus.publish(vec![
            data("p1", "admin", "location", Location::new(45.0, 7.0).to_value()),
            data("p1", "s1", "r1", json!(1)),
            data("p2", "s1", "r1", json!(2)),
            data("p1", "s1", "r1", serde_json::Value::Null),
        ]);
        settle().await;

        // p2 has no location and the null value is rejected by the value
        // predicate.
        assert_eq!(*received.lock().unwrap(), ["p1/admin/location", "p1/s1/r1"]);
    }
}
