use serde::{Deserialize, Serialize};

use crate::error::Result;

// Default name of the gateway thread.
const THREAD_NAME: &str = "twinlink-gateway";

// Default number of cached authorization decisions.
const AUTHORIZATION_CACHE_CAPACITY: usize = 1024;

/// Default package URI of providers created without an explicit model.
pub const DEFAULT_MODEL_PACKAGE_URI: &str = "https://twinlink.io/models/default";

/// Default model name of providers created without an explicit model.
pub const DEFAULT_MODEL: &str = "provider";

/// The gateway configuration.
///
/// Every field has a default value, so a configuration can be read from a
/// partial `JSON` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Name of the gateway thread.
    pub thread_name: String,
    /// Maximum number of queued commands, [`None`] for an unbounded queue.
    pub queue_capacity: Option<usize>,
    /// Number of decisions kept by a cached session authorizer.
    pub authorization_cache_capacity: usize,
    /// Whether every new provider receives an `admin` service.
    pub auto_create_admin: bool,
    /// Package URI assigned to providers created without a model.
    pub default_model_package_uri: String,
    /// Model assigned to providers created without a model.
    pub default_model: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            thread_name: THREAD_NAME.into(),
            queue_capacity: None,
            authorization_cache_capacity: AUTHORIZATION_CACHE_CAPACITY,
            auto_create_admin: true,
            default_model_package_uri: DEFAULT_MODEL_PACKAGE_URI.into(),
            default_model: DEFAULT_MODEL.into(),
        }
    }
}

impl GatewayConfig {
    /// Creates a [`GatewayConfig`] with default values.
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a [`GatewayConfig`] from a `JSON` document.
    ///
    /// # Errors
    ///
    /// An error is returned when the document is not valid `JSON` or a
    /// field has a wrong type.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Sets the name of the gateway thread.
    #[must_use]
    #[inline]
    pub fn thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Bounds the command queue.
    ///
    /// Submissions beyond the capacity fail with
    /// [`crate::error::ErrorKind::Busy`].
    #[must_use]
    #[inline]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Sets the number of decisions kept by a cached session authorizer.
    #[must_use]
    #[inline]
    pub const fn authorization_cache_capacity(mut self, capacity: usize) -> Self {
        self.authorization_cache_capacity = capacity;
        self
    }

    /// Disables the automatic creation of the `admin` service.
    #[must_use]
    #[inline]
    pub const fn without_admin(mut self) -> Self {
        self.auto_create_admin = false;
        self
    }

    /// Sets the model assigned to providers created without a model.
    #[must_use]
    #[inline]
    pub fn default_model(
        mut self,
        model_package_uri: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        self.default_model_package_uri = model_package_uri.into();
        self.default_model = model.into();
        self
    }
}
