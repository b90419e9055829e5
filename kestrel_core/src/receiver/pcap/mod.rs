//! Capture replay: pcap/pcapng files delivered through the live handler
//! contract.
//!
//! The capture is memory-mapped read-only and iterated in place; matching
//! UDP payloads are handed to per-port handlers exactly like live traffic.
//! Three replay disciplines:
//! - `TIMED` — wall-clock paced against the capture's own timestamps,
//!   optionally scaled by a speed multiplier, anchored on the first packet.
//! - `FLOOD` — as fast as possible, yielding to the reactor every 10 000
//!   packets through the deferred-task queue.
//! - `STEP` — exactly one packet per caller-driven [`PcapReceiver::step`].

pub(crate) mod decode;
pub(crate) mod format;

use std::cell::RefCell;
use std::fs::File;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use memmap2::{Advice, Mmap};
use serde::{Deserialize, Serialize};

use crate::error::{KestrelError, KestrelResult};
use crate::memory::PacketArena;
use crate::reactor::{monotonic_now_ns, EventLoop};

use super::{
    preflight_subscribe, shared_handler, OwnerThread, PacketStatus, PacketTimestamp, PacketView,
    ReceiverConfig, SharedHandler,
};
use format::{CaptureKind, Interface};

/// Dense port table: every possible UDP destination port.
const PORT_TABLE_SIZE: usize = 65536;

/// Packets per scheduling slice in FLOOD mode.
const FLOOD_BATCH_LIMIT: usize = 10_000;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// How the capture's packets are paced onto the handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayMode {
    /// Respect capture timestamps relative to the wall clock.
    Timed,
    /// Replay as fast as the CPU allows, in batches.
    Flood,
    /// Wait for a manual [`PcapReceiver::step`] per packet.
    Step,
}

/// Replay tuning: the shared receiver parameters plus pacing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PcapConfig {
    pub receiver: ReceiverConfig,
    pub mode: ReplayMode,
    /// 1.0 = capture speed, 2.0 = twice as fast. Must be positive.
    pub speed_multiplier: f64,
}

impl Default for PcapConfig {
    fn default() -> Self {
        Self {
            receiver: ReceiverConfig::default(),
            mode: ReplayMode::Timed,
            speed_multiplier: 1.0,
        }
    }
}

/// An open, mapped capture. Immutable once loaded; shared between the core
/// and in-flight dispatches so a handler-triggered `open`/`rewind` can never
/// pull the mapping out from under a delivery.
struct LoadedCapture {
    map: Mmap,
    kind: CaptureKind,
    _file: File,
}

impl LoadedCapture {
    #[inline]
    fn data(&self) -> &[u8] {
        &self.map
    }
}

/// Pacing anchor: capture time and wall time of the first replayed packet.
#[derive(Debug, Clone, Copy)]
struct ReplayAnchor {
    pcap_start: PacketTimestamp,
    wall_start_ns: u64,
}

/// The next packet found in the capture, not yet consumed.
struct PendingFrame {
    ts: PacketTimestamp,
    link_type: u32,
    frame_start: usize,
    caplen: usize,
    origlen: usize,
    next_cursor: usize,
}

enum StepOutcome {
    Dispatched,
    Wait,
    Finished,
}

pub(crate) struct PcapCore {
    config: PcapConfig,
    owner: OwnerThread,
    // Substrate-owned batch arena. The replay path delivers payload views
    // straight out of the capture mapping, so it stays cold here; it exists
    // so live and replay receivers share one construction path and memory
    // contract.
    #[allow(dead_code)]
    arena: PacketArena,
    capture: Option<Rc<LoadedCapture>>,
    cursor: usize,
    interfaces: Vec<Interface>,
    handlers: Vec<Option<SharedHandler>>,
    subscription_count: usize,
    anchor: Option<ReplayAnchor>,
    finished: bool,
}

impl PcapCore {
    fn new(config: PcapConfig) -> KestrelResult<Self> {
        let arena = PacketArena::new(config.receiver.batch_size, config.receiver.buffer_size)?;
        Ok(Self {
            config,
            owner: OwnerThread::capture(),
            arena,
            capture: None,
            cursor: 0,
            interfaces: Vec::new(),
            handlers: vec![None; PORT_TABLE_SIZE],
            subscription_count: 0,
            anchor: None,
            finished: false,
        })
    }

    /// Locate the next packet at or after the cursor.
    ///
    /// Non-packet pcapng blocks are consumed permanently (IDBs register
    /// their interface as a side effect); the cursor is left *on* the packet
    /// so a paced TIMED wait can resume exactly here. `None` means end of
    /// capture or a malformed block; either way iteration is over.
    fn scan_next_packet(&mut self, data: &[u8]) -> Option<PendingFrame> {
        // Copy the kind out so the capture borrow does not outlive the
        // scrutinee (IDB registration below mutates `self`).
        let kind = self.capture.as_ref()?.kind;
        match kind {
            CaptureKind::Legacy {
                swap,
                nanosecond,
                link_type,
            } => {
                let record = format::parse_record(data, self.cursor, swap)?;
                Some(PendingFrame {
                    ts: format::record_timestamp(&record, nanosecond),
                    link_type,
                    frame_start: self.cursor + format::LEGACY_RECORD_LEN,
                    caplen: record.caplen,
                    origlen: record.origlen,
                    next_cursor: self.cursor + format::LEGACY_RECORD_LEN + record.caplen,
                })
            }
            CaptureKind::PcapNg { swap } => loop {
                let block = format::parse_block(data, self.cursor, swap)?;
                match block.block_type {
                    format::BLOCK_IDB => {
                        // Interfaces are keyed by order of appearance; a
                        // malformed IDB still occupies its index.
                        let interface =
                            format::parse_idb(data, &block, swap).unwrap_or(Interface {
                                link_type: u32::MAX,
                                ts_divisor: format::DEFAULT_TS_DIVISOR,
                            });
                        self.interfaces.push(interface);
                        self.cursor += block.total_len;
                    }
                    format::BLOCK_EPB => {
                        let epb = format::parse_epb(data, &block, swap)?;
                        let (link_type, divisor) =
                            match self.interfaces.get(epb.interface_id as usize) {
                                Some(interface) => (interface.link_type, interface.ts_divisor),
                                None => {
                                    log::debug!(
                                        "packet references undeclared interface {}",
                                        epb.interface_id
                                    );
                                    (u32::MAX, format::DEFAULT_TS_DIVISOR)
                                }
                            };
                        return Some(PendingFrame {
                            ts: format::epb_timestamp(epb.raw_ts, divisor),
                            link_type,
                            frame_start: epb.frame_start,
                            caplen: epb.caplen,
                            origlen: epb.origlen,
                            next_cursor: self.cursor + block.total_len,
                        });
                    }
                    // Section headers, statistics, name resolution, ...
                    _ => self.cursor += block.total_len,
                }
            },
        }
    }

    /// TIMED pacing: the wall instant this packet is due. Anchors the replay
    /// on its first call after `open`/`rewind`/`start`.
    fn target_wall_ns(&mut self, ts: &PacketTimestamp, now_ns: u64) -> u64 {
        let anchor = match &self.anchor {
            Some(anchor) => *anchor,
            None => {
                self.anchor = Some(ReplayAnchor {
                    pcap_start: *ts,
                    wall_start_ns: now_ns,
                });
                return now_ns;
            }
        };

        let mut delta_sec = ts.sec - anchor.pcap_start.sec;
        let mut delta_nsec = ts.nsec - anchor.pcap_start.nsec;
        // Borrow a second on a negative nanosecond component.
        if delta_nsec < 0 {
            delta_sec -= 1;
            delta_nsec += NANOS_PER_SEC;
        }

        let mut delta = delta_sec as i128 * NANOS_PER_SEC as i128 + delta_nsec as i128;
        let speed = self.config.speed_multiplier;
        if speed != 1.0 {
            delta = (delta as f64 / speed) as i128;
        }

        if delta <= 0 {
            // Out-of-order capture timestamps: due immediately.
            return anchor.wall_start_ns;
        }
        anchor.wall_start_ns.saturating_add(delta as u64)
    }
}

/// Process one packet: pace (TIMED), decode, and deliver.
///
/// The core borrow is released before the handler runs, so handlers may call
/// back into the receiver (rewind, unsubscribe, even open a new file).
fn step_once(core: &Rc<RefCell<PcapCore>>, event_loop: &EventLoop) -> StepOutcome {
    let (capture, frame) = {
        let mut c = core.borrow_mut();
        c.owner.check();
        if c.finished {
            return StepOutcome::Finished;
        }
        let capture = match &c.capture {
            Some(capture) => Rc::clone(capture),
            None => return StepOutcome::Finished,
        };

        let frame = match c.scan_next_packet(capture.data()) {
            Some(frame) => frame,
            None => {
                c.finished = true;
                log::debug!("capture replay reached end of file");
                return StepOutcome::Finished;
            }
        };

        if c.config.mode == ReplayMode::Timed {
            let now = monotonic_now_ns();
            let target = c.target_wall_ns(&frame.ts, now);
            if target > now {
                // Too early: leave the cursor on this packet and come back.
                let replay = Rc::clone(core);
                event_loop.run_after(Duration::from_nanos(target - now), move |lp| {
                    process_batch(&replay, lp)
                });
                return StepOutcome::Wait;
            }
        }

        c.cursor = frame.next_cursor;
        (capture, frame)
    };

    // The capture itself truncated this packet; replay never delivers
    // partial datagrams.
    if frame.caplen != frame.origlen {
        return StepOutcome::Dispatched;
    }

    let data = capture.data();
    let frame_bytes = &data[frame.frame_start..frame.frame_start + frame.caplen];
    if let Some(datagram) = decode::decode_udp_frame(frame_bytes, frame.link_type) {
        let handler = core.borrow().handlers[datagram.dst_port as usize].clone();
        if let Some(handler) = handler {
            let view = PacketView {
                data: &frame_bytes[datagram.payload],
                status: PacketStatus::OK,
                timestamp: frame.ts,
            };
            let mut callback = handler.borrow_mut();
            (*callback)(&view);
        }
    }
    StepOutcome::Dispatched
}

/// Replay up to one scheduling slice of packets, then hand control back to
/// the reactor.
fn process_batch(core: &Rc<RefCell<PcapCore>>, event_loop: &EventLoop) {
    let (mode, batch_size) = {
        let c = core.borrow();
        if c.capture.is_none() || c.finished {
            return;
        }
        (c.config.mode, c.config.receiver.batch_size)
    };

    let limit = if mode == ReplayMode::Flood {
        FLOOD_BATCH_LIMIT
    } else {
        batch_size
    };

    let mut processed = 0;
    while processed < limit {
        match step_once(core, event_loop) {
            StepOutcome::Dispatched => processed += 1,
            // TIMED waits rescheduled themselves; Finished is terminal.
            StepOutcome::Wait | StepOutcome::Finished => return,
        }
    }

    // Slice limit hit with capture left. FLOOD must requeue through the
    // deferred-task queue: the reactor forces a non-blocking poll while
    // tasks are queued, whereas a zero-delay timer per slice would starve
    // the other sources.
    let replay = Rc::clone(core);
    match mode {
        ReplayMode::Flood => event_loop.run_in_loop(move |lp| process_batch(&replay, lp)),
        ReplayMode::Timed => {
            // Catch-up: behind the wall clock, continue right after a poll.
            event_loop.run_after(Duration::ZERO, move |lp| process_batch(&replay, lp));
        }
        ReplayMode::Step => {}
    }
}

/// Offline capture receiver bound to one reactor.
///
/// Subscriptions are plain port-table entries (no sockets); packets whose
/// decoded UDP destination matches a subscribed port are delivered with the
/// capture timestamp. Payload views point into the mapped file and are only
/// valid during the handler call.
pub struct PcapReceiver<'l> {
    event_loop: &'l EventLoop,
    core: Rc<RefCell<PcapCore>>,
}

impl<'l> PcapReceiver<'l> {
    pub fn new(event_loop: &'l EventLoop, config: PcapConfig) -> KestrelResult<Self> {
        if !(config.speed_multiplier > 0.0) {
            return Err(KestrelError::invalid_input(
                "replay speed multiplier must be positive",
            ));
        }
        Ok(Self {
            event_loop,
            core: Rc::new(RefCell::new(PcapCore::new(config)?)),
        })
    }

    /// Map a capture file and decode its container format.
    ///
    /// On failure the descriptor is closed and no mapping is retained; the
    /// receiver keeps whatever capture it had before.
    pub fn open<P: AsRef<Path>>(&mut self, path: P) -> KestrelResult<()> {
        let path = path.as_ref();
        let mut c = self.core.borrow_mut();
        c.owner.check();

        let file = File::open(path)?;
        let size = file.metadata()?.len() as usize;
        if size < format::LEGACY_HEADER_LEN {
            return Err(KestrelError::capture(format!(
                "{}: {} bytes is too small for any capture header",
                path.display(),
                size
            )));
        }

        // SAFETY: read-only private mapping of a regular file; the mapping
        // and the file live together inside LoadedCapture.
        let map = unsafe { Mmap::map(&file)? };
        // Purely advisory; ignore failures.
        let _ = map.advise(Advice::Sequential);
        let _ = map.advise(Advice::WillNeed);

        let kind = CaptureKind::detect(&map).ok_or_else(|| {
            KestrelError::capture(format!("{}: unrecognized capture magic", path.display()))
        })?;

        c.cursor = kind.data_start();
        c.interfaces.clear();
        c.anchor = None;
        c.finished = false;
        c.capture = Some(Rc::new(LoadedCapture {
            map,
            kind,
            _file: file,
        }));
        Ok(())
    }

    /// Register a handler for a destination port seen in the capture.
    /// Returns the port, which doubles as the subscription handle.
    pub fn subscribe<F: FnMut(&PacketView<'_>) + 'static>(
        &mut self,
        port: u16,
        handler: F,
    ) -> KestrelResult<u16> {
        let mut c = self.core.borrow_mut();
        c.owner.check();
        preflight_subscribe(
            &c.config.receiver,
            c.subscription_count,
            c.handlers[port as usize].is_some(),
            port,
        )?;
        c.handlers[port as usize] = Some(shared_handler(handler));
        c.subscription_count += 1;
        Ok(port)
    }

    pub fn unsubscribe(&mut self, port: u16) -> KestrelResult<()> {
        let mut c = self.core.borrow_mut();
        c.owner.check();
        if c.handlers[port as usize].take().is_none() {
            return Err(KestrelError::not_found(format!("port {}", port)));
        }
        c.subscription_count -= 1;
        Ok(())
    }

    /// Begin replay. STEP mode returns immediately (drive with [`step`]);
    /// TIMED and FLOOD schedule the first batch onto the reactor.
    ///
    /// [`step`]: PcapReceiver::step
    pub fn start(&self) {
        let ready = {
            let mut c = self.core.borrow_mut();
            c.owner.check();
            c.anchor = None;
            c.capture.is_some() && c.config.mode != ReplayMode::Step
        };
        if !ready {
            return;
        }
        let replay = Rc::clone(&self.core);
        self.event_loop
            .run_after(Duration::ZERO, move |lp| process_batch(&replay, lp));
    }

    /// Replay exactly one packet. Returns false once the capture is
    /// exhausted (or, in TIMED mode, when the next packet is not yet due).
    pub fn step(&self) -> bool {
        matches!(
            step_once(&self.core, self.event_loop),
            StepOutcome::Dispatched
        )
    }

    /// Reset the cursor to the first packet, clearing the pacing anchor and
    /// the finished flag. Interfaces are re-discovered on the next pass.
    pub fn rewind(&mut self) {
        let mut c = self.core.borrow_mut();
        c.owner.check();
        let data_start = c.capture.as_ref().map(|capture| capture.kind.data_start());
        if let Some(start) = data_start {
            c.cursor = start;
        }
        c.interfaces.clear();
        c.anchor = None;
        c.finished = false;
    }

    /// True once replay has consumed the whole capture.
    pub fn finished(&self) -> bool {
        self.core.borrow().finished
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.core.borrow().subscription_count
    }
}

impl Drop for PcapReceiver<'_> {
    fn drop(&mut self) {
        // Pending replay timers hold the core alive; make them no-ops.
        let mut c = self.core.borrow_mut();
        c.finished = true;
        c.capture = None;
    }
}
