//! Receiver substrate shared by the live UDP and capture-replay receivers.
//!
//! Both receiver families deliver packets through the same handler contract:
//! a closure receiving a [`PacketView`] whose payload borrow is only valid
//! for the duration of the call. Everything a handler wants to keep must be
//! copied out before returning.
//!
//! Receivers are **thread-hostile**, not merely non-thread-safe: all of a
//! receiver's state (including the packet arena the kernel writes into) is
//! owned by the thread that created it, and cross-thread access corrupts
//! shared buffers. The owner thread is recorded at construction and asserted
//! on every entry point.

pub mod pcap;
pub mod udp;

use std::cell::RefCell;
use std::rc::Rc;
use std::thread::{self, ThreadId};

use serde::{Deserialize, Serialize};

use crate::error::{KestrelError, KestrelResult};

/// Packet receive timestamp: kernel clock for live traffic, capture clock
/// for replay. `{0, 0}` when the kernel supplied none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketTimestamp {
    pub sec: i64,
    pub nsec: i64,
}

/// Per-packet delivery status bitmask. Bits beyond [`PacketStatus::TRUNCATED`]
/// are reserved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketStatus(u32);

impl PacketStatus {
    /// Nothing noteworthy happened to the packet.
    pub const OK: PacketStatus = PacketStatus(0);
    /// The datagram exceeded the slot payload size and was cut short.
    pub const TRUNCATED: PacketStatus = PacketStatus(1);

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_truncated(self) -> bool {
        self.0 & Self::TRUNCATED.0 != 0
    }
}

impl std::ops::BitOrAssign for PacketStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One delivered packet. The `data` borrow is only valid during the handler
/// call; the underlying slot is reused by the next burst.
#[derive(Debug)]
pub struct PacketView<'a> {
    pub data: &'a [u8],
    pub status: PacketStatus,
    pub timestamp: PacketTimestamp,
}

/// The single handler signature shared by live reception and replay.
pub type PacketHandler = Box<dyn FnMut(&PacketView<'_>)>;

/// Handler storage shared between a receiver's table and the reactor's
/// source record for the same subscription.
pub(crate) type SharedHandler = Rc<RefCell<PacketHandler>>;

pub(crate) fn shared_handler<F: FnMut(&PacketView<'_>) + 'static>(handler: F) -> SharedHandler {
    Rc::new(RefCell::new(Box::new(handler)))
}

/// Tuning parameters shared by every receiver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Cap on concurrent subscriptions for one receiver; 0 disables the cap.
    pub max_fds: usize,
    /// Packets pulled from the kernel per batch-receive syscall.
    pub batch_size: usize,
    /// Payload bytes per packet slot. Datagrams beyond this are truncated.
    pub buffer_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_fds: 128,
            batch_size: 64,
            buffer_size: 2048,
        }
    }
}

/// Owner-thread identity, asserted on every receiver entry point.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OwnerThread(ThreadId);

impl OwnerThread {
    pub fn capture() -> Self {
        Self(thread::current().id())
    }

    #[inline]
    pub fn check(&self) {
        assert_eq!(
            thread::current().id(),
            self.0,
            "receiver accessed from a thread other than its owner"
        );
    }
}

/// Subscription pre-flight shared by both receiver families.
pub(crate) fn preflight_subscribe(
    config: &ReceiverConfig,
    active_subscriptions: usize,
    port_in_use: bool,
    port: u16,
) -> KestrelResult<()> {
    if config.max_fds > 0 && active_subscriptions >= config.max_fds {
        return Err(KestrelError::TooManyDescriptors {
            limit: config.max_fds,
        });
    }
    if port_in_use {
        return Err(KestrelError::AddressInUse(port));
    }
    Ok(())
}
