//! # Kestrel Core
//!
//! A single-threaded Linux reactor for low-latency UDP ingestion, with a
//! symmetric offline replay path for pcap/pcapng captures.
//!
//! The crate provides four tightly coupled building blocks:
//!
//! - **Reactor**: an epoll loop with a timer-descriptor-backed sorted timer
//!   queue and a deferred-task queue ([`EventLoop`])
//! - **Live UDP receiver**: dual-stack sockets drained in bursts through
//!   `recvmmsg`, with per-packet kernel timestamps ([`UdpReceiver`])
//! - **Capture replay**: memory-mapped pcap/pcapng files replayed against
//!   the same handler contract, paced, flooded, or stepped ([`PcapReceiver`])
//! - **Receiver substrate**: the hugepage-backed packet arena, owner-thread
//!   discipline, and per-port subscription tables both receivers share
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kestrel_core::{EventLoop, ReceiverConfig, UdpReceiver};
//!
//! let event_loop = EventLoop::new()?;
//! let mut receiver = UdpReceiver::new(&event_loop, ReceiverConfig::default())?;
//!
//! let port = receiver.subscribe(0, |packet| {
//!     // `packet.data` is only valid during this call; copy what you keep.
//!     println!("{} bytes at {}.{:09}", packet.data.len(),
//!              packet.timestamp.sec, packet.timestamp.nsec);
//! })?;
//! println!("listening on {}", port);
//!
//! // Drive the reactor from the owner thread; -1 blocks until work arrives.
//! event_loop.run_once(100)?;
//! # Ok::<(), kestrel_core::KestrelError>(())
//! ```
//!
//! ## Threading model
//!
//! One reactor and everything bound to it live on a single owner thread;
//! receivers are thread-hostile and assert the owner on every entry point.
//! Scale horizontally with independent reactors on pinned threads (see
//! [`pin_thread_to_core`]); nothing is shared between them.

// Everything here sits directly on epoll, timerfd, recvmmsg, and the Linux
// cmsg layout; there is no fallback surface to offer elsewhere. Fail the
// build up front instead of on missing libc symbols.
#[cfg(not(target_os = "linux"))]
compile_error!("kestrel_core requires Linux (epoll, timerfd, recvmmsg)");

pub mod core;
pub mod error;
pub mod memory;
pub mod reactor;
pub mod receiver;

// Re-export the common surface so applications need a single `use`.
pub use crate::core::pin_thread_to_core;
pub use error::{KestrelError, KestrelResult};
pub use memory::PacketArena;
pub use reactor::{EventLoop, TimerId};
pub use receiver::pcap::{PcapConfig, PcapReceiver, ReplayMode};
pub use receiver::udp::UdpReceiver;
pub use receiver::{PacketStatus, PacketTimestamp, PacketView, ReceiverConfig};
