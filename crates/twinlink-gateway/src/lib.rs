//! The `twinlink-gateway` library crate keeps a live digital twin of the
//! devices connected to a gateway, and lets any number of device bridges and
//! consumers read and change it concurrently.
//!
//! The twin is a tree of providers, services and resources owned by a single
//! gateway thread. Every read and write is a command submitted to that
//! thread, which runs commands one at a time in submission order. This makes
//! the twin consistent without any lock, and keeps submission non-blocking:
//! each command immediately returns a future resolved once it has run.
//!
//! Core functionalities of this crate include:
//!
//! - Reading, setting and invoking resources, pulling values from device
//!   getters or storing values pushed by devices
//! - Notifying listeners of every committed change, from delivery tasks
//!   running outside the gateway thread
//! - Checking each operation and each notification against an authorizer
//! - Building snapshots of the twin, filtered in two phases by a criterion
//! - Registering device capabilities and filter languages at runtime
//!
//! Notifications are delivered by `tokio` tasks, so a gateway must be started
//! within a `tokio` runtime.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod accumulator;

/// Authorizers deciding what a session may access.
pub mod authorizer;
/// Notification fan-out to listeners.
pub mod bus;
/// The operations a command can perform on the twin.
pub mod command;
/// Gateway configuration.
pub mod config;
/// Two-phase snapshot filters.
pub mod criterion;
/// Error management.
pub mod error;
/// The gateway thread and command futures.
pub mod executor;
/// Filter language parsers.
pub mod filter;
/// The gateway and its sessions.
pub mod gateway;
/// Device capabilities registration.
pub mod registry;
/// Resources of the twin and the device functions bound to them.
pub mod resource;
/// Point-in-time views of the twin.
pub mod snapshot;
/// The digital twin.
pub mod twin;

#[cfg(test)]
mod tests;
