//! Cross-cutting runtime helpers.

pub mod affinity;

pub use affinity::pin_thread_to_core;
