use std::sync::Arc;
use std::time::{Duration, SystemTime};

use twinlink::parameters::{Parameters, ParametersValues};
use twinlink::resource::{GetLevel, ResourceDeclaration, ResourceKind, ValueType};
use twinlink::value::{DataType, Metadata, TimedValue};

use serde_json::Value;

use tracing::debug;

use crate::error::{Error, ErrorKind, Result};

/// A function pulling the current value of a resource from its device.
///
/// It runs on the gateway thread, so it must return quickly.
pub type Getter = Arc<dyn Fn() -> Result<TimedValue> + Send + Sync>;

/// A function pushing a value set by a consumer to the device.
///
/// It runs on the gateway thread, so it must return quickly.
pub type Setter = Arc<dyn Fn(&TimedValue) -> Result<()> + Send + Sync>;

/// A function executing an action on the device.
///
/// It runs on the gateway thread, so it must return quickly.
pub type ActionHandler = Arc<dyn Fn(&ParametersValues) -> Result<Value> + Send + Sync>;

/// The device functions bound to a resource.
///
/// A resource without any binding only stores the values pushed to it.
#[derive(Clone, Default)]
pub struct Binding {
    getter: Option<Getter>,
    setter: Option<Setter>,
    action: Option<ActionHandler>,
    cache_period: Option<Duration>,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("getter", &self.getter.is_some())
            .field("setter", &self.setter.is_some())
            .field("action", &self.action.is_some())
            .field("cache_period", &self.cache_period)
            .finish()
    }
}

impl Binding {
    /// Creates an empty [`Binding`].
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a getter.
    #[must_use]
    #[inline]
    pub fn getter<F>(mut self, getter: F) -> Self
    where
        F: Fn() -> Result<TimedValue> + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(getter));
        self
    }

    /// Binds a setter.
    #[must_use]
    #[inline]
    pub fn setter<F>(mut self, setter: F) -> Self
    where
        F: Fn(&TimedValue) -> Result<()> + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(setter));
        self
    }

    /// Binds an action handler.
    #[must_use]
    #[inline]
    pub fn action<F>(mut self, action: F) -> Self
    where
        F: Fn(&ParametersValues) -> Result<Value> + Send + Sync + 'static,
    {
        self.action = Some(Arc::new(action));
        self
    }

    /// Sets how long a pulled value is served from the cache to
    /// [`GetLevel::Normal`] reads.
    #[must_use]
    #[inline]
    pub const fn cache_period(mut self, cache_period: Duration) -> Self {
        self.cache_period = Some(cache_period);
        self
    }

    /// Checks whether no function is bound.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.getter.is_none() && self.setter.is_none() && self.action.is_none()
    }
}

// Who is writing a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    // A consumer through `SET`.
    Northbound,
    // A device through a push update.
    Southbound,
}

#[derive(Debug, PartialEq)]
pub(crate) enum WriteOutcome {
    Applied { old: TimedValue },
    Unchanged,
    Stale,
}

#[derive(Debug, PartialEq)]
pub(crate) struct ReadOutcome {
    pub(crate) value: TimedValue,
    // The replaced value, when a pull changed the stored one.
    pub(crate) previous: Option<TimedValue>,
}

impl ReadOutcome {
    const fn cached(value: TimedValue) -> Self {
        Self {
            value,
            previous: None,
        }
    }
}

/// A resource of a twin.
#[derive(Debug)]
pub struct Resource {
    declaration: ResourceDeclaration,
    value: TimedValue,
    metadata: Metadata,
    binding: Binding,
}

impl Resource {
    pub(crate) fn new(declaration: ResourceDeclaration, binding: Binding) -> Self {
        let metadata = declaration.metadata.clone();
        Self {
            declaration,
            value: TimedValue::empty(),
            metadata,
            binding,
        }
    }

    /// Returns the resource name.
    #[must_use]
    #[inline]
    pub fn name(&self) -> &str {
        &self.declaration.name
    }

    /// Returns the [`ResourceKind`].
    #[must_use]
    #[inline]
    pub const fn kind(&self) -> ResourceKind {
        self.declaration.kind
    }

    /// Returns the [`ValueType`].
    #[must_use]
    #[inline]
    pub const fn value_type(&self) -> ValueType {
        self.declaration.value_type
    }

    /// Returns the declared [`DataType`].
    #[must_use]
    #[inline]
    pub const fn data_type(&self) -> DataType {
        self.declaration.data_type
    }

    /// Returns the action parameters.
    #[must_use]
    #[inline]
    pub const fn parameters(&self) -> &Parameters {
        &self.declaration.parameters
    }

    /// Returns the stored value.
    #[must_use]
    #[inline]
    pub const fn value(&self) -> &TimedValue {
        &self.value
    }

    /// Returns the metadata.
    #[must_use]
    #[inline]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Checks whether the resource is an action.
    #[must_use]
    #[inline]
    pub fn is_action(&self) -> bool {
        self.declaration.is_action()
    }

    /// Checks whether device functions are bound to the resource.
    #[must_use]
    #[inline]
    pub fn is_bound(&self) -> bool {
        !self.binding.is_empty()
    }

    // Seeds the value of a resource which has just been created.
    pub(crate) fn initialize(&mut self, value: TimedValue) {
        self.value = value;
    }

    pub(crate) fn bind(&mut self, binding: Binding) {
        self.binding = binding;
    }

    pub(crate) fn read(&mut self, level: GetLevel) -> Result<ReadOutcome> {
        if self.is_action() {
            return Err(self.not_a_property());
        }

        let Some(getter) = self.binding.getter.clone() else {
            return Ok(ReadOutcome::cached(self.value.clone()));
        };

        match level {
            GetLevel::Cached => return Ok(ReadOutcome::cached(self.value.clone())),
            GetLevel::Normal if self.is_fresh() => {
                return Ok(ReadOutcome::cached(self.value.clone()));
            }
            GetLevel::Normal | GetLevel::Strong => {}
        }

        let pulled = getter().map_err(|e| self.handler_error("getter", &e))?;

        if let Some(value) = pulled.value()
            && !self.data_type().accepts(value)
        {
            return Err(Error::new(
                ErrorKind::Handler,
                format!(
                    "The getter of `{}` returned a {} value instead of {}",
                    self.name(),
                    DataType::of(value),
                    self.data_type()
                ),
            ));
        }

        let pulled = TimedValue::with_optional(
            pulled.value().cloned(),
            Some(pulled.timestamp().unwrap_or_else(SystemTime::now)),
        );

        if self.is_stale(pulled.timestamp()) {
            debug!("Ignore the value pulled for `{}`: too old", self.name());
            return Ok(ReadOutcome::cached(self.value.clone()));
        }

        if pulled == self.value {
            return Ok(ReadOutcome::cached(pulled));
        }

        let previous = std::mem::replace(&mut self.value, pulled);
        Ok(ReadOutcome {
            value: self.value.clone(),
            previous: Some(previous),
        })
    }

    pub(crate) fn write(
        &mut self,
        value: Option<Value>,
        timestamp: SystemTime,
        origin: Origin,
    ) -> Result<WriteOutcome> {
        if self.is_action() {
            return Err(self.not_a_property());
        }

        match (origin, self.value_type()) {
            (Origin::Northbound, ValueType::Fixed | ValueType::Updatable) => {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!(
                        "`{}` is {} and cannot be set",
                        self.name(),
                        self.value_type()
                    ),
                ));
            }
            (Origin::Southbound, ValueType::Fixed) if self.value.timestamp().is_some() => {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("`{}` is FIXED and already has a value", self.name()),
                ));
            }
            _ => {}
        }

        if let Some(value) = &value
            && !self.data_type().accepts(value)
        {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!(
                    "`{}` expects a {} value, found {}",
                    self.name(),
                    self.data_type(),
                    DataType::of(value)
                ),
            ));
        }

        if self.is_stale(Some(timestamp)) {
            debug!(
                "Drop the update of `{}`: {timestamp:?} is older than the stored value",
                self.name()
            );
            return Ok(WriteOutcome::Stale);
        }

        let value = TimedValue::with_optional(value, Some(timestamp));

        if origin == Origin::Northbound
            && let Some(setter) = self.binding.setter.clone()
        {
            setter(&value).map_err(|e| self.handler_error("setter", &e))?;
        }

        if value == self.value {
            return Ok(WriteOutcome::Unchanged);
        }

        let old = std::mem::replace(&mut self.value, value);
        Ok(WriteOutcome::Applied { old })
    }

    pub(crate) fn act(&self, arguments: &ParametersValues) -> Result<Value> {
        if !self.is_action() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("`{}` is not an action", self.name()),
            ));
        }

        self.parameters().check(arguments)?;

        let action = self.binding.action.as_ref().ok_or_else(|| {
            Error::new(
                ErrorKind::Handler,
                format!("No action handler is bound to `{}`", self.name()),
            )
        })?;

        action(arguments).map_err(|e| self.handler_error("action handler", &e))
    }

    // Returns the old metadata when the merge changed it.
    pub(crate) fn merge_metadata(
        &mut self,
        update: &Metadata,
        remove_missing: bool,
    ) -> Option<Metadata> {
        let old = self.metadata.clone();
        self.metadata
            .merge(update, remove_missing)
            .then_some(old)
    }

    pub(crate) fn set_metadata(&mut self, key: &str, value: Value) -> Option<Metadata> {
        let mut update = Metadata::new();
        let _ = update.insert(key, value);
        self.merge_metadata(&update, false)
    }

    fn is_fresh(&self) -> bool {
        match (self.binding.cache_period, self.value.timestamp()) {
            (Some(period), Some(timestamp)) => SystemTime::now()
                .duration_since(timestamp)
                .is_ok_and(|age| age < period),
            _ => false,
        }
    }

    fn is_stale(&self, timestamp: Option<SystemTime>) -> bool {
        match (timestamp, self.value.timestamp()) {
            (Some(timestamp), Some(stored)) => timestamp < stored,
            _ => false,
        }
    }

    fn not_a_property(&self) -> Error {
        Error::new(
            ErrorKind::InvalidValue,
            format!("`{}` is an action and has no value", self.name()),
        )
    }

    fn handler_error(&self, handler: &str, e: &Error) -> Error {
        Error::new(
            ErrorKind::Handler,
            format!(
                "The {handler} of `{}` failed: {}",
                self.name(),
                e.description()
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime};

    use twinlink::parameters::ParametersValues;
    use twinlink::resource::{GetLevel, ResourceDeclaration};
    use twinlink::value::{DataType, TimedValue};

    use serde_json::json;

    use crate::error::{Error, ErrorKind};

    use super::{Binding, Origin, ReadOutcome, Resource, WriteOutcome};

    fn at(seconds: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)
    }

    fn modifiable(binding: Binding) -> Resource {
        Resource::new(
            ResourceDeclaration::property("level", DataType::Integer).modifiable(),
            binding,
        )
    }

    #[test]
    fn test_set_then_get_cached() {
        let mut resource = modifiable(Binding::new());

        assert_eq!(
            resource.write(Some(json!(4)), at(1), Origin::Northbound),
            Ok(WriteOutcome::Applied {
                old: TimedValue::empty()
            })
        );
        assert_eq!(
            resource.read(GetLevel::Cached),
            Ok(ReadOutcome {
                value: TimedValue::new(4, at(1)),
                previous: None,
            })
        );

        // Same value and timestamp.
        assert_eq!(
            resource.write(Some(json!(4)), at(1), Origin::Northbound),
            Ok(WriteOutcome::Unchanged)
        );
    }

    #[test]
    fn test_write_rules() {
        let mut updatable =
            Resource::new(ResourceDeclaration::property("power", DataType::Float), Binding::new());
        assert_eq!(
            updatable
                .write(Some(json!(1.5)), at(1), Origin::Northbound)
                .map_err(|e| e.kind()),
            Err(ErrorKind::InvalidValue)
        );
        assert!(
            updatable
                .write(Some(json!(1.5)), at(1), Origin::Southbound)
                .is_ok()
        );

        let mut fixed = Resource::new(
            ResourceDeclaration::property("serial", DataType::String).fixed(),
            Binding::new(),
        );
        assert!(
            fixed
                .write(Some(json!("A-1")), at(1), Origin::Southbound)
                .is_ok()
        );
        assert_eq!(
            fixed
                .write(Some(json!("B-2")), at(2), Origin::Southbound)
                .map_err(|e| e.kind()),
            Err(ErrorKind::InvalidValue)
        );

        let mut integer = modifiable(Binding::new());
        assert_eq!(
            integer
                .write(Some(json!("four")), at(1), Origin::Northbound)
                .map_err(|e| e.kind()),
            Err(ErrorKind::InvalidValue)
        );
        assert!(integer.value().is_empty());
    }

    #[test]
    fn test_stale_write() {
        let mut resource = modifiable(Binding::new());

        let _ = resource
            .write(Some(json!(5)), at(10), Origin::Southbound)
            .unwrap();
        assert_eq!(
            resource.write(Some(json!(4)), at(9), Origin::Southbound),
            Ok(WriteOutcome::Stale)
        );
        assert_eq!(resource.value(), &TimedValue::new(5, at(10)));

        // Equal timestamps are applied.
        assert_eq!(
            resource.write(Some(json!(6)), at(10), Origin::Southbound),
            Ok(WriteOutcome::Applied {
                old: TimedValue::new(5, at(10))
            })
        );
    }

    #[test]
    fn test_setter_failure() {
        let mut resource = modifiable(
            Binding::new()
                .setter(|_| Err(Error::new(ErrorKind::Handler, "device unreachable"))),
        );

        let error = resource
            .write(Some(json!(1)), at(1), Origin::Northbound)
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Handler);
        assert!(resource.value().is_empty());

        // Pushes come from the device, so the setter is not involved.
        assert!(
            resource
                .write(Some(json!(1)), at(1), Origin::Southbound)
                .is_ok()
        );
    }

    #[test]
    fn test_get_levels() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut resource = modifiable(
            Binding::new()
                .getter(move || {
                    let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(TimedValue::new(count as i64, SystemTime::now()))
                })
                .cache_period(Duration::from_secs(3600)),
        );

        // Nothing cached yet, the getter is invoked.
        let outcome = resource.read(GetLevel::Normal).unwrap();
        assert_eq!(outcome.value.value(), Some(&json!(1)));
        assert_eq!(outcome.previous, Some(TimedValue::empty()));

        // Fresh enough for a normal read.
        let _ = resource.read(GetLevel::Normal).unwrap();
        let _ = resource.read(GetLevel::Cached).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A strong read always pulls.
        let outcome = resource.read(GetLevel::Strong).unwrap();
        assert_eq!(outcome.value.value(), Some(&json!(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_act() {
        let blink = ResourceDeclaration::action("blink", DataType::Integer)
            .parameter("times", DataType::Integer);
        let resource = Resource::new(
            blink,
            Binding::new()
                .action(|arguments| Ok(json!(arguments.get_i64("times").unwrap_or(0) * 2))),
        );

        assert_eq!(
            resource.act(&ParametersValues::new().integer("times", 3)),
            Ok(json!(6))
        );
        assert_eq!(
            resource
                .act(&ParametersValues::new().string("times", "3"))
                .map_err(|e| e.kind()),
            Err(ErrorKind::InvalidValue)
        );
        assert_eq!(
            resource
                .act(&ParametersValues::new())
                .map_err(|e| e.kind()),
            Err(ErrorKind::InvalidValue)
        );

        let mut resource = resource;
        assert_eq!(
            resource.read(GetLevel::Cached).map_err(|e| e.kind()),
            Err(ErrorKind::InvalidValue)
        );

        // Acting on a property is a validation failure.
        let property = modifiable(Binding::new());
        assert_eq!(
            property
                .act(&ParametersValues::new())
                .map_err(|e| e.kind()),
            Err(ErrorKind::InvalidValue)
        );
    }

    #[test]
    fn test_metadata() {
        let mut resource = modifiable(Binding::new());

        let old = resource.set_metadata("unit", json!("%"));
        assert_eq!(old.map(|old| old.len()), Some(0));
        assert_eq!(resource.set_metadata("unit", json!("%")), None);
        assert_eq!(resource.metadata().get("unit"), Some(&json!("%")));
    }
}
