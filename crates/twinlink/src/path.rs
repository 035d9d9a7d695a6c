use serde::{Deserialize, Serialize};

/// The path of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourcePath {
    /// Provider name.
    pub provider: String,
    /// Service name.
    pub service: String,
    /// Resource name.
    pub resource: String,
}

impl std::fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.provider, self.service, self.resource)
    }
}

impl std::str::FromStr for ResourcePath {
    type Err = InvalidPath;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let mut segments = path.split('/');
        match (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) {
            (Some(provider), Some(service), Some(resource), None)
                if !provider.is_empty() && !service.is_empty() && !resource.is_empty() =>
            {
                Ok(Self::new(provider, service, resource))
            }
            _ => Err(InvalidPath(path.into())),
        }
    }
}

impl ResourcePath {
    /// Creates a [`ResourcePath`].
    #[must_use]
    #[inline]
    pub fn new(
        provider: impl Into<String>,
        service: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            service: service.into(),
            resource: resource.into(),
        }
    }

    /// Returns the topic of the resource, in the `provider/service/resource`
    /// form.
    #[must_use]
    #[inline]
    pub fn topic(&self) -> String {
        self.to_string()
    }
}

/// A string that is not a valid `provider/service/resource` path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPath(pub String);

impl std::fmt::Display for InvalidPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "`{}` is not a `provider/service/resource` path", self.0)
    }
}

impl std::error::Error for InvalidPath {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    // Exactly one component.
    Single,
    // One or more trailing components.
    Tail,
}

/// A compiled topic pattern.
///
/// Patterns are `/`-separated like topics. A final `*` segment matches any
/// topic strictly longer than the preceding segments, while a `+` segment,
/// or a `*` which is not the last one, matches exactly one component.
/// Every other segment matches literally.
///
/// ```
/// use twinlink::path::TopicFilter;
///
/// let filter = TopicFilter::new("p1/*");
/// assert!(filter.matches("p1/s1/r1"));
/// assert!(!filter.matches("p2/s1/r1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pattern: String,
    segments: Vec<Segment>,
}

impl std::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.pattern.fmt(f)
    }
}

impl From<&str> for TopicFilter {
    fn from(pattern: &str) -> Self {
        Self::new(pattern)
    }
}

impl From<String> for TopicFilter {
    fn from(pattern: String) -> Self {
        Self::new(&pattern)
    }
}

impl TopicFilter {
    /// Compiles a [`TopicFilter`] from a pattern.
    #[must_use]
    pub fn new(pattern: &str) -> Self {
        let trimmed = pattern.trim_matches('/');
        let count = trimmed.split('/').count();

        let segments = trimmed
            .split('/')
            .enumerate()
            .map(|(index, segment)| match segment {
                "*" if index + 1 == count => Segment::Tail,
                "*" | "+" => Segment::Single,
                literal => Segment::Literal(literal.into()),
            })
            .collect();

        Self {
            pattern: pattern.into(),
            segments,
        }
    }

    /// Returns the pattern the filter was compiled from.
    #[must_use]
    #[inline]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Checks whether a topic matches the filter.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        let components = topic.trim_matches('/').split('/').collect::<Vec<_>>();

        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Tail => return components.len() > index,
                Segment::Single => {
                    if index >= components.len() {
                        return false;
                    }
                }
                Segment::Literal(literal) => {
                    if components.get(index) != Some(&literal.as_str()) {
                        return false;
                    }
                }
            }
        }

        components.len() == self.segments.len()
    }

    /// Checks whether the topic of a resource matches the filter.
    #[must_use]
    #[inline]
    pub fn matches_path(&self, path: &ResourcePath) -> bool {
        self.matches(&path.topic())
    }

    /// Checks whether any of the given filters matches a topic.
    #[must_use]
    #[inline]
    pub fn any_matches(filters: &[Self], topic: &str) -> bool {
        filters.iter().any(|filter| filter.matches(topic))
    }
}
