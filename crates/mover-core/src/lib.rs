//! Shared domain types for the structure animation engine.
//!
//! Nothing in here schedules or animates anything; these are the values that
//! flow between the activity registry, animation runs, hooks and event
//! subscribers.

pub mod errors;
pub mod events;
pub mod geometry;
pub mod hooks;
pub mod ids;
pub mod structure;
