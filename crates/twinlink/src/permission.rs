use serde::{Deserialize, Serialize};

/// All [`PermissionLevel`]s, in ascending order.
pub const ALL_LEVELS: &[PermissionLevel] = &[
    PermissionLevel::Read,
    PermissionLevel::Update,
    PermissionLevel::Act,
    PermissionLevel::Describe,
];

/// An ordered access level checked by an authorizer.
///
/// Levels are ordered as `Read < Update < Act < Describe`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PermissionLevel {
    /// Read values and metadata.
    Read,
    /// Write values and metadata.
    Update,
    /// Invoke actions.
    Act,
    /// Know that an element exists and list it.
    Describe,
}

impl std::fmt::Debug for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name().fmt(f)
    }
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name().fmt(f)
    }
}

impl PermissionLevel {
    /// Returns the [`PermissionLevel`] name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Update => "UPDATE",
            Self::Act => "ACT",
            Self::Describe => "DESCRIBE",
        }
    }
}
