//! The data model shared by a `twinlink` gateway, the southbound code that
//! feeds it with device data, and the northbound code that consumes it.
//!
//! This crate provides APIs to:
//!
//! - Describe resources. A resource is the smallest addressable piece of
//!   data of a device, identified by a `provider/service/resource` path.
//!   Each resource has a data type, a value type that states who may write
//!   it, and optionally a set of action parameters.
//! - Represent timestamped values and metadata.
//! - Encode notifications emitted whenever the state of a device twin
//!   changes, along with the topics used to route them to listeners.
//! - Express permission levels and geographic locations.
//! - Build southbound data updates, either one at a time or in bulk.
//!
//! Every structure is serializable and deserializable, so it can be moved
//! between a gateway and any transport layer placed in front of it.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod macros;

/// Geographic locations of providers.
pub mod location;
/// Notifications emitted when a twin changes.
pub mod notification;
/// Action parameters and their values.
pub mod parameters;
/// Resource paths and topic filters.
pub mod path;
/// Permission levels checked by authorizers.
pub mod permission;
/// Resource declarations.
pub mod resource;
/// Southbound data updates.
pub mod update;
/// Data types, timestamped values and metadata.
pub mod value;

#[cfg(test)]
pub(crate) fn serialize<T: serde::Serialize>(value: T) -> serde_json::Value {
    serde_json::to_value(value).unwrap()
}

#[cfg(test)]
pub(crate) fn deserialize<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> T {
    serde_json::from_value(value).unwrap()
}
