//! Core types shared across the Conductor crates.
//!
//! # Main types
//!
//! - [`ConductorError`]: Unified error enum for graph, planning and execution failures.
//! - [`ConductorResult`]: Convenience alias for `Result<T, ConductorError>`.
//! - [`EventBus`]: Broadcast channel for [`OrchestrationEvent`]s.

/// Error taxonomy.
pub mod error;
/// Progress events and the event bus.
pub mod event;

pub use error::{is_permanent_message, ConductorError, ConductorResult};
pub use event::{EventBus, OrchestrationEvent, DEFAULT_EVENT_CAPACITY};
