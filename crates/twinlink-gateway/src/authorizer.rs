use std::sync::{PoisonError, RwLock};

use hashbrown::HashMap;

use twinlink::path::TopicFilter;
use twinlink::permission::PermissionLevel;

use crate::twin::ModelIdentity;

// An empty name never identifies an element of the twin.
fn is_present(names: &[&str]) -> bool {
    names.iter().all(|name| !name.is_empty())
}

/// Decides whether a caller may access an element of the twin.
///
/// Implementations are consulted from the gateway thread and from the
/// notification delivery tasks at the same time, so they must be free of
/// side effects. The three checks are independent: a permission granted on
/// a provider says nothing about its services or resources.
pub trait Authorizer: Send + Sync {
    /// Checks a permission on a provider.
    fn has_provider_permission(
        &self,
        level: PermissionLevel,
        model: &ModelIdentity,
        provider: &str,
    ) -> bool;

    /// Checks a permission on a service.
    fn has_service_permission(
        &self,
        level: PermissionLevel,
        model: &ModelIdentity,
        provider: &str,
        service: &str,
    ) -> bool;

    /// Checks a permission on a resource.
    fn has_resource_permission(
        &self,
        level: PermissionLevel,
        model: &ModelIdentity,
        provider: &str,
        service: &str,
        resource: &str,
    ) -> bool;
}

/// Grants every permission on every existing element.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn has_provider_permission(
        &self,
        _: PermissionLevel,
        _: &ModelIdentity,
        provider: &str,
    ) -> bool {
        is_present(&[provider])
    }

    fn has_service_permission(
        &self,
        _: PermissionLevel,
        _: &ModelIdentity,
        provider: &str,
        service: &str,
    ) -> bool {
        is_present(&[provider, service])
    }

    fn has_resource_permission(
        &self,
        _: PermissionLevel,
        _: &ModelIdentity,
        provider: &str,
        service: &str,
        resource: &str,
    ) -> bool {
        is_present(&[provider, service, resource])
    }
}

/// Denies every permission.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn has_provider_permission(&self, _: PermissionLevel, _: &ModelIdentity, _: &str) -> bool {
        false
    }

    fn has_service_permission(
        &self,
        _: PermissionLevel,
        _: &ModelIdentity,
        _: &str,
        _: &str,
    ) -> bool {
        false
    }

    fn has_resource_permission(
        &self,
        _: PermissionLevel,
        _: &ModelIdentity,
        _: &str,
        _: &str,
        _: &str,
    ) -> bool {
        false
    }
}

/// The level of the twin a [`Policy`] rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Provider checks, matched against `provider` topics.
    Provider,
    /// Service checks, matched against `provider/service` topics.
    Service,
    /// Resource checks, matched against `provider/service/resource` topics.
    Resource,
}

#[derive(Debug, Clone, PartialEq)]
struct Rule {
    scope: Scope,
    levels: Vec<PermissionLevel>,
    filter: Option<TopicFilter>,
    model: Option<ModelIdentity>,
}

impl Rule {
    fn grants(
        &self,
        scope: Scope,
        level: PermissionLevel,
        model: &ModelIdentity,
        topic: &str,
    ) -> bool {
        self.scope == scope
            && self.levels.contains(&level)
            && self.model.as_ref().is_none_or(|expected| expected == model)
            && self
                .filter
                .as_ref()
                .is_none_or(|filter| filter.matches(topic))
    }
}

/// A rule based authorizer.
///
/// Everything is denied unless a rule grants it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Policy {
    rules: Vec<Rule>,
}

impl Policy {
    /// Creates a [`Policy`] which denies everything.
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants the given levels on the elements of a scope whose topic
    /// matches a pattern.
    #[must_use]
    #[inline]
    pub fn allow(mut self, scope: Scope, levels: &[PermissionLevel], pattern: &str) -> Self {
        self.rules.push(Rule {
            scope,
            levels: levels.to_vec(),
            filter: Some(TopicFilter::new(pattern)),
            model: None,
        });
        self
    }

    /// Grants the given levels on the elements of a scope belonging to
    /// providers of a model.
    #[must_use]
    #[inline]
    pub fn allow_model(
        mut self,
        scope: Scope,
        levels: &[PermissionLevel],
        model: ModelIdentity,
    ) -> Self {
        self.rules.push(Rule {
            scope,
            levels: levels.to_vec(),
            filter: None,
            model: Some(model),
        });
        self
    }

    fn grants(
        &self,
        scope: Scope,
        level: PermissionLevel,
        model: &ModelIdentity,
        names: &[&str],
    ) -> bool {
        if !is_present(names) {
            return false;
        }
        let topic = names.join("/");
        self.rules
            .iter()
            .any(|rule| rule.grants(scope, level, model, &topic))
    }
}

impl Authorizer for Policy {
    fn has_provider_permission(
        &self,
        level: PermissionLevel,
        model: &ModelIdentity,
        provider: &str,
    ) -> bool {
        self.grants(Scope::Provider, level, model, &[provider])
    }

    fn has_service_permission(
        &self,
        level: PermissionLevel,
        model: &ModelIdentity,
        provider: &str,
        service: &str,
    ) -> bool {
        self.grants(Scope::Service, level, model, &[provider, service])
    }

    fn has_resource_permission(
        &self,
        level: PermissionLevel,
        model: &ModelIdentity,
        provider: &str,
        service: &str,
        resource: &str,
    ) -> bool {
        self.grants(Scope::Resource, level, model, &[provider, service, resource])
    }
}

type CacheKey = (Scope, PermissionLevel, ModelIdentity, String);

/// An [`Authorizer`] remembering the decisions of another one.
///
/// Decisions are keyed by scope, level, model and path. When the cache is
/// full it is emptied before storing a new decision.
#[derive(Debug)]
pub struct CachedAuthorizer<A> {
    inner: A,
    capacity: usize,
    cache: RwLock<HashMap<CacheKey, bool>>,
}

impl<A: Authorizer> CachedAuthorizer<A> {
    /// Creates a [`CachedAuthorizer`] keeping up to `capacity` decisions.
    #[must_use]
    #[inline]
    pub fn new(inner: A, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Forgets every decision, for instance after the rules of the wrapped
    /// authorizer changed.
    pub fn invalidate(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Returns the number of cached decisions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Checks whether no decision is cached.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn decide(
        &self,
        scope: Scope,
        level: PermissionLevel,
        model: &ModelIdentity,
        names: &[&str],
        check: impl FnOnce(&A) -> bool,
    ) -> bool {
        if !is_present(names) {
            return false;
        }

        let key = (scope, level, model.clone(), names.join("/"));
        if let Some(decision) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return *decision;
        }

        let decision = check(&self.inner);

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.len() >= self.capacity {
            cache.clear();
        }
        if self.capacity > 0 {
            let _ = cache.insert(key, decision);
        }
        decision
    }
}

impl<A: Authorizer> Authorizer for CachedAuthorizer<A> {
    fn has_provider_permission(
        &self,
        level: PermissionLevel,
        model: &ModelIdentity,
        provider: &str,
    ) -> bool {
        self.decide(Scope::Provider, level, model, &[provider], |inner| {
            inner.has_provider_permission(level, model, provider)
        })
    }

    fn has_service_permission(
        &self,
        level: PermissionLevel,
        model: &ModelIdentity,
        provider: &str,
        service: &str,
    ) -> bool {
        self.decide(Scope::Service, level, model, &[provider, service], |inner| {
            inner.has_service_permission(level, model, provider, service)
        })
    }

    fn has_resource_permission(
        &self,
        level: PermissionLevel,
        model: &ModelIdentity,
        provider: &str,
        service: &str,
        resource: &str,
    ) -> bool {
        self.decide(
            Scope::Resource,
            level,
            model,
            &[provider, service, resource],
            |inner| inner.has_resource_permission(level, model, provider, service, resource),
        )
    }
}

impl<A: Authorizer + ?Sized> Authorizer for std::sync::Arc<A> {
    fn has_provider_permission(
        &self,
        level: PermissionLevel,
        model: &ModelIdentity,
        provider: &str,
    ) -> bool {
        (**self).has_provider_permission(level, model, provider)
    }

    fn has_service_permission(
        &self,
        level: PermissionLevel,
        model: &ModelIdentity,
        provider: &str,
        service: &str,
    ) -> bool {
        (**self).has_service_permission(level, model, provider, service)
    }

    fn has_resource_permission(
        &self,
        level: PermissionLevel,
        model: &ModelIdentity,
        provider: &str,
        service: &str,
        resource: &str,
    ) -> bool {
        (**self).has_resource_permission(level, model, provider, service, resource)
    }
}
