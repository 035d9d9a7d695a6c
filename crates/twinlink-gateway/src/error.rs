use std::borrow::Cow;

use twinlink::parameters::ParameterMismatch;
use twinlink::path::InvalidPath;

/// All possible error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A provider, service, resource or registration does not exist.
    NotFound,
    /// The caller is not allowed to perform the operation.
    Forbidden,
    /// A value or an argument list is not valid for the target resource.
    InvalidValue,
    /// The operation would break the integrity of the twin.
    Conflict,
    /// A bound getter, setter or action handler failed.
    Handler,
    /// A command panicked.
    Command,
    /// The command queue is full.
    Busy,
    /// The gateway has been shut down.
    Closed,
    /// A filter query could not be parsed.
    FilterParse,
    /// No parser is registered for a filter language.
    UnsupportedLanguage,
    /// A valid criterion failed while being evaluated.
    Evaluation,
}

impl ErrorKind {
    pub(crate) const fn description(self) -> &'static str {
        match self {
            Self::NotFound => "Not Found",
            Self::Forbidden => "Forbidden",
            Self::InvalidValue => "Invalid Value",
            Self::Conflict => "Conflict",
            Self::Handler => "Handler",
            Self::Command => "Command",
            Self::Busy => "Busy",
            Self::Closed => "Closed",
            Self::FilterParse => "Filter Parse",
            Self::UnsupportedLanguage => "Unsupported Language",
            Self::Evaluation => "Evaluation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.description().fmt(f)
    }
}

/// A gateway error.
#[derive(Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    description: Cow<'static, str>,
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error().fmt(f)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error().fmt(f)
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Creates an [`Error`] from an [`ErrorKind`] and a description.
    #[must_use]
    #[inline]
    pub fn new(kind: ErrorKind, description: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    /// Returns the [`ErrorKind`].
    #[must_use]
    #[inline]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the description.
    #[must_use]
    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn closed() -> Self {
        Self::new(ErrorKind::Closed, "The gateway thread has been stopped")
    }

    fn error(&self) -> String {
        format!("{}: {}", self.kind, self.description)
    }
}

impl From<ParameterMismatch> for Error {
    fn from(e: ParameterMismatch) -> Self {
        Self::new(ErrorKind::InvalidValue, e.to_string())
    }
}

impl From<InvalidPath> for Error {
    fn from(e: InvalidPath) -> Self {
        Self::new(ErrorKind::InvalidValue, e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::InvalidValue, format!("Json error caused by {e}"))
    }
}

/// A specialized [`Result`] type for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
