use std::sync::Arc;

use twinlink::location::Location;
use twinlink::notification::DataNotification;
use twinlink::path::TopicFilter;

use crate::error::Result;
use crate::snapshot::ProviderSnapshot;
use crate::twin::ModelIdentity;

/// A predicate on the location of a provider.
pub type LocationPredicate = Arc<dyn Fn(Option<&Location>) -> bool + Send + Sync>;
/// A predicate on the identity of a provider.
pub type ProviderPredicate = Arc<dyn Fn(&ProviderRef<'_>) -> bool + Send + Sync>;
/// A predicate on a service or resource name.
pub type NamePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;
/// A predicate on a fully valued provider snapshot.
pub type ValuePredicate = Arc<dyn Fn(&ProviderSnapshot) -> Result<bool> + Send + Sync>;

/// The identity of a provider as seen by a [`ProviderPredicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderRef<'a> {
    /// Provider model.
    pub model: &'a ModelIdentity,
    /// Provider name.
    pub name: &'a str,
}

/// A two-phase filter used to build filtered snapshots of the twin.
///
/// The location, provider, service and resource predicates only look at
/// names and locations. They run on the gateway thread while the snapshot
/// is built, before any value is pulled, so excluded providers and resources
/// never reach their getters.
///
/// The value predicate looks at the fully valued snapshot of a provider and
/// runs on the caller side, once the snapshot has left the gateway thread.
///
/// An absent predicate accepts everything.
#[derive(Clone, Default)]
pub struct Criterion {
    location: Option<LocationPredicate>,
    provider: Option<ProviderPredicate>,
    service: Option<NamePredicate>,
    resource: Option<NamePredicate>,
    value: Option<ValuePredicate>,
    topics: Vec<String>,
}

impl std::fmt::Debug for Criterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Criterion")
            .field("location", &self.location.is_some())
            .field("provider", &self.provider.is_some())
            .field("service", &self.service.is_some())
            .field("resource", &self.resource.is_some())
            .field("value", &self.value.is_some())
            .field("topics", &self.topics)
            .finish()
    }
}

impl Criterion {
    /// Creates a [`Criterion`] accepting everything.
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the location predicate.
    #[must_use]
    #[inline]
    pub fn location<F>(mut self, predicate: F) -> Self
    where
        F: Fn(Option<&Location>) -> bool + Send + Sync + 'static,
    {
        self.location = Some(Arc::new(predicate));
        self
    }

    /// Accepts providers located within `radius` meters of `center`.
    #[must_use]
    #[inline]
    pub fn near(self, center: Location, radius: f64) -> Self {
        self.location(move |location| {
            location.is_some_and(|location| location.within(&center, radius))
        })
    }

    /// Sets the provider predicate.
    #[must_use]
    #[inline]
    pub fn provider<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ProviderRef<'_>) -> bool + Send + Sync + 'static,
    {
        self.provider = Some(Arc::new(predicate));
        self
    }

    /// Accepts only the providers with the given names.
    #[must_use]
    #[inline]
    pub fn providers<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names.into_iter().map(Into::into).collect::<Vec<String>>();
        self.provider(move |provider| names.iter().any(|name| name == provider.name))
    }

    /// Accepts only the providers of a model.
    #[must_use]
    #[inline]
    pub fn model(self, model: ModelIdentity) -> Self {
        self.provider(move |provider| *provider.model == model)
    }

    /// Sets the service predicate.
    #[must_use]
    #[inline]
    pub fn service<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.service = Some(Arc::new(predicate));
        self
    }

    /// Accepts only the services with the given names.
    #[must_use]
    #[inline]
    pub fn services<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names.into_iter().map(Into::into).collect::<Vec<String>>();
        self.service(move |service| names.iter().any(|name| name == service))
    }

    /// Sets the resource predicate.
    #[must_use]
    #[inline]
    pub fn resource<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.resource = Some(Arc::new(predicate));
        self
    }

    /// Accepts only the resources with the given names.
    #[must_use]
    #[inline]
    pub fn resources<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names.into_iter().map(Into::into).collect::<Vec<String>>();
        self.resource(move |resource| names.iter().any(|name| name == resource))
    }

    /// Sets the value predicate.
    #[must_use]
    #[inline]
    pub fn value<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ProviderSnapshot) -> Result<bool> + Send + Sync + 'static,
    {
        self.value = Some(Arc::new(predicate));
        self
    }

    /// Restricts the topics a listener using this criterion subscribes to.
    #[must_use]
    #[inline]
    pub fn topics<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Returns the topic patterns of the data notifications this criterion
    /// can match, every topic when none has been set.
    #[must_use]
    pub fn data_topics(&self) -> Vec<TopicFilter> {
        if self.topics.is_empty() {
            vec![TopicFilter::new("*")]
        } else {
            self.topics
                .iter()
                .map(|pattern| TopicFilter::new(pattern))
                .collect()
        }
    }

    /// Combines two criteria so that both must accept.
    ///
    /// Service and resource predicates are combined with a logical or, and
    /// dropped when absent on one side, since each side may need rows the
    /// other one excludes. The value predicates decide in the end.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self {
            location: both(self.location, other.location, |a, b| {
                Arc::new(move |location: Option<&Location>| a(location) && b(location))
                    as LocationPredicate
            }),
            provider: both(self.provider, other.provider, |a, b| {
                Arc::new(move |provider: &ProviderRef<'_>| a(provider) && b(provider))
                    as ProviderPredicate
            }),
            service: either(self.service, other.service),
            resource: either(self.resource, other.resource),
            value: both(self.value, other.value, |a, b| {
                Arc::new(move |snapshot: &ProviderSnapshot| Ok(a(snapshot)? && b(snapshot)?))
                    as ValuePredicate
            }),
            topics: union(self.topics, other.topics),
        }
    }

    /// Combines two criteria so that at least one must accept.
    ///
    /// A predicate absent on either side accepts everything, so it is
    /// absent in the result too.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self {
            location: self.location.zip(other.location).map(|(a, b)| {
                Arc::new(move |location: Option<&Location>| a(location) || b(location))
                    as LocationPredicate
            }),
            provider: self.provider.zip(other.provider).map(|(a, b)| {
                Arc::new(move |provider: &ProviderRef<'_>| a(provider) || b(provider))
                    as ProviderPredicate
            }),
            service: either(self.service, other.service),
            resource: either(self.resource, other.resource),
            value: self.value.zip(other.value).map(|(a, b)| {
                Arc::new(move |snapshot: &ProviderSnapshot| Ok(a(snapshot)? || b(snapshot)?))
                    as ValuePredicate
            }),
            topics: union(self.topics, other.topics),
        }
    }

    /// Checks whether a location passes the first phase.
    #[must_use]
    #[inline]
    pub fn accepts_location(&self, location: Option<&Location>) -> bool {
        self.location
            .as_ref()
            .is_none_or(|predicate| predicate(location))
    }

    /// Checks whether a provider passes the first phase.
    #[must_use]
    #[inline]
    pub fn accepts_provider(&self, provider: &ProviderRef<'_>) -> bool {
        self.provider
            .as_ref()
            .is_none_or(|predicate| predicate(provider))
    }

    /// Checks whether a service passes the first phase.
    #[must_use]
    #[inline]
    pub fn accepts_service(&self, service: &str) -> bool {
        self.service
            .as_ref()
            .is_none_or(|predicate| predicate(service))
    }

    /// Checks whether a resource passes the first phase.
    #[must_use]
    #[inline]
    pub fn accepts_resource(&self, resource: &str) -> bool {
        self.resource
            .as_ref()
            .is_none_or(|predicate| predicate(resource))
    }

    /// Evaluates the value predicate on a valued provider snapshot.
    ///
    /// # Errors
    ///
    /// Returns the failure of the value predicate.
    pub fn evaluate_value(&self, snapshot: &ProviderSnapshot) -> Result<bool> {
        self.value
            .as_ref()
            .map_or(Ok(true), |predicate| predicate(snapshot))
    }

    /// Checks whether a data notification satisfies every predicate.
    ///
    /// The predicates see the provider as if it only had the notified
    /// resource, holding the new value.
    ///
    /// # Errors
    ///
    /// Returns the failure of the value predicate.
    pub fn matches_notification(
        &self,
        notification: &DataNotification,
        location: Option<&Location>,
    ) -> Result<bool> {
        let target = &notification.target;
        let model = ModelIdentity::new(target.model_package_uri.clone(), target.model.clone());
        let provider = ProviderRef {
            model: &model,
            name: &target.provider,
        };

        let phase_one = self.accepts_location(location)
            && self.accepts_provider(&provider)
            && target
                .service
                .as_deref()
                .is_some_and(|service| self.accepts_service(service))
            && target
                .resource
                .as_deref()
                .is_some_and(|resource| self.accepts_resource(resource));

        if !phase_one {
            return Ok(false);
        }

        self.evaluate_value(&ProviderSnapshot::from_notification(
            notification,
            location.copied(),
        ))
    }

    pub(crate) const fn has_value_predicate(&self) -> bool {
        self.value.is_some()
    }

    // Providers left without services are dropped only when services or
    // resources are filtered.
    pub(crate) const fn filters_content(&self) -> bool {
        self.service.is_some() || self.resource.is_some()
    }
}

fn both<T: ?Sized>(
    a: Option<Arc<T>>,
    b: Option<Arc<T>>,
    combine: impl FnOnce(Arc<T>, Arc<T>) -> Arc<T>,
) -> Option<Arc<T>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(combine(a, b)),
        (a, b) => a.or(b),
    }
}

fn either(a: Option<NamePredicate>, b: Option<NamePredicate>) -> Option<NamePredicate> {
    let (a, b) = a.zip(b)?;
    Some(Arc::new(move |name: &str| a(name) || b(name)))
}

fn union(mut a: Vec<String>, b: Vec<String>) -> Vec<String> {
    // An empty list stands for every topic.
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    for pattern in b {
        if !a.contains(&pattern) {
            a.push(pattern);
        }
    }
    a
}
