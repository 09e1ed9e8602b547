//! Core primitives for the agent-mesh control plane.
//!
//! This crate holds everything the other control-plane crates build on:
//! - [`error`] - the shared error taxonomy and retry policy
//! - [`config`] - environment-driven configuration with validated defaults
//! - [`events`] - the event model, the bounded event store, and the pub/sub bus
//! - [`credit`] - Shapley-inspired credit assignment and lazy-agent detection

pub mod config;
pub mod credit;
pub mod error;
pub mod events;

pub use config::CoreConfig;
pub use error::MeshError;
pub use events::{Event, EventKind, EventStore};
