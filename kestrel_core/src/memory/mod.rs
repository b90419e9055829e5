//! Pre-allocated packet memory for the receive hot path.

pub mod arena;

pub use arena::PacketArena;
