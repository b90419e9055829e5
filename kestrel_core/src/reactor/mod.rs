//! The single-threaded event reactor.
//!
//! One `EventLoop` owns an epoll instance, a monotonic timer descriptor, and
//! a deferred-task queue, and multiplexes every descriptor and timer bound to
//! it on the calling thread:
//!
//! - **Descriptors**: registered sources are dispatched at most once per
//!   ready event per `run_once` epoch, in the order the kernel reports them.
//! - **Timers**: a sorted queue drives the single timer descriptor in
//!   absolute CLOCK_MONOTONIC mode; callbacks fire in strict expiration
//!   order, repeating timers re-arm drift-free.
//! - **Deferred tasks**: run after all dispatches of the epoch; tasks queued
//!   by tasks run in the *next* epoch. A non-empty queue forces the next
//!   poll to be non-blocking.
//!
//! Callbacks run synchronously on the owner thread and may freely register
//! or cancel timers, register or unregister descriptors, and enqueue
//! deferred tasks. A panic escaping a user callback is caught at the
//! dispatch boundary, logged, and the reactor keeps running.

pub mod source;
pub mod timer;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crate::error::{KestrelError, KestrelResult};
use source::{Dispatch, SourceRecord, SourceTable};
use timer::{TimerKind, TimerQueue};

pub use timer::TimerId;

/// Ready events pulled per epoll_wait call.
const MAX_EVENTS: usize = 128;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A task queued with [`EventLoop::run_in_loop`].
pub type DeferredTask = Box<dyn FnOnce(&EventLoop) + 'static>;

/// Current CLOCK_MONOTONIC time in nanoseconds.
pub(crate) fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer; CLOCK_MONOTONIC is always readable.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * NANOS_PER_SEC + ts.tv_nsec as u64
}

/// A lightweight epoll reactor with timers and deferred tasks.
///
/// One instance is owned by exactly one thread; receivers bound to it borrow
/// it for their whole lifetime, so the loop always outlives them.
pub struct EventLoop {
    epoll_fd: OwnedFd,
    timer_fd: OwnedFd,
    sources: RefCell<SourceTable>,
    timers: RefCell<TimerQueue>,
    deferred: RefCell<VecDeque<DeferredTask>>,
    next_timer_id: Cell<u64>,
}

impl EventLoop {
    /// Create the epoll instance and the timer descriptor, and register the
    /// latter as the reactor's internal timer source.
    pub fn new() -> KestrelResult<Self> {
        // SAFETY: plain syscall; the result is checked before wrapping.
        let raw_epoll = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw_epoll < 0 {
            return Err(KestrelError::last_os_error());
        }
        // SAFETY: raw_epoll is a freshly created, unowned descriptor.
        let epoll_fd = unsafe { OwnedFd::from_raw_fd(raw_epoll) };

        // SAFETY: plain syscall; the result is checked before wrapping.
        let raw_timer = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if raw_timer < 0 {
            return Err(KestrelError::last_os_error());
        }
        // SAFETY: raw_timer is a freshly created, unowned descriptor.
        let timer_fd = unsafe { OwnedFd::from_raw_fd(raw_timer) };

        let event_loop = Self {
            epoll_fd,
            timer_fd,
            sources: RefCell::new(SourceTable::new()),
            timers: RefCell::new(TimerQueue::default()),
            deferred: RefCell::new(VecDeque::new()),
            next_timer_id: Cell::new(1),
        };

        let timer_raw = event_loop.timer_fd.as_raw_fd();
        event_loop.add_source(timer_raw, libc::EPOLLIN as u32, Dispatch::Timer)?;
        Ok(event_loop)
    }

    // ------------------------------------------------------------------
    // Source registration
    // ------------------------------------------------------------------

    /// Register a descriptor with the kernel and store its dispatch record.
    ///
    /// The record goes into the source table first so a ready event arriving
    /// in the same epoch resolves; on `epoll_ctl` failure the slot is cleared
    /// again and the error is returned.
    pub(crate) fn add_source(&self, fd: RawFd, events: u32, dispatch: Dispatch) -> KestrelResult<()> {
        if fd < 0 {
            return Err(KestrelError::BadDescriptor(fd));
        }

        self.sources
            .borrow_mut()
            .insert(fd, SourceRecord { dispatch });

        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // SAFETY: epoll_fd and fd are valid descriptors; ev is initialized.
        let rc =
            unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            self.sources.borrow_mut().remove(fd);
            return Err(err.into());
        }
        Ok(())
    }

    /// Drop the dispatch record for `fd` and remove the kernel interest.
    ///
    /// A kernel `ENOENT` (interest already gone, e.g. the descriptor raced
    /// with close) is surfaced to the caller but leaves the table consistent.
    pub(crate) fn remove_source(&self, fd: RawFd) -> KestrelResult<()> {
        if self.sources.borrow_mut().remove(fd).is_none() {
            return Err(KestrelError::not_found(format!("descriptor {}", fd)));
        }

        // Some older kernels want a non-null event even for DEL; none that
        // this crate targets do.
        // SAFETY: epoll_fd is a valid epoll descriptor.
        let rc = unsafe {
            libc::epoll_ctl(
                self.epoll_fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                log::warn!("epoll DEL for fd {}: interest already removed", fd);
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Number of registered sources (including the internal timer).
    pub fn source_count(&self) -> usize {
        self.sources.borrow().len()
    }

    // ------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------

    /// Wait for and dispatch pending events, then run deferred tasks.
    ///
    /// `timeout_ms`: -1 = block indefinitely, 0 = non-blocking poll. The
    /// timeout is coerced to 0 whenever deferred tasks are queued, so they
    /// are never starved by a long poll. `EINTR` is not a failure: the call
    /// returns `Ok` having done no work.
    pub fn run_once(&self, timeout_ms: i32) -> KestrelResult<()> {
        let timeout = if self.deferred.borrow().is_empty() {
            timeout_ms
        } else {
            0
        };

        // SAFETY: zeroed epoll_event is a valid (if meaningless) value; the
        // kernel only writes the first `ready` entries.
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        // SAFETY: epoll_fd is valid; events points at MAX_EVENTS writable slots.
        let ready = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout,
            )
        };

        if ready < 0 {
            let err = io::Error::last_os_error();
            // A signal woke us up; that is not a failure.
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(err.into());
        }

        for event in events.iter().take(ready as usize) {
            let fd = event.u64 as RawFd;
            // Clone the dispatch handle out so callbacks can freely mutate
            // the source table while we invoke them.
            let dispatch = self.sources.borrow().get(fd).map(|r| r.dispatch.clone());
            match dispatch {
                Some(Dispatch::Timer) => self.handle_timer_read(),
                Some(Dispatch::Udp {
                    receiver,
                    handler,
                    fd,
                }) => {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        receiver.borrow_mut().drain(fd, &handler);
                    }));
                    if result.is_err() {
                        log::error!("packet handler panicked on fd {}; reactor continues", fd);
                    }
                }
                // Unregistered by an earlier callback in this same epoch.
                None => {}
            }
        }

        self.run_deferred();
        Ok(())
    }

    /// Enqueue a task to run after the current (or next) poll completes.
    pub fn run_in_loop<F: FnOnce(&EventLoop) + 'static>(&self, task: F) {
        self.deferred.borrow_mut().push_back(Box::new(task));
    }

    fn run_deferred(&self) {
        // Swap the queue into a local list: tasks enqueued by these tasks
        // belong to the next epoch.
        let tasks = std::mem::take(&mut *self.deferred.borrow_mut());
        for task in tasks {
            if panic::catch_unwind(AssertUnwindSafe(|| task(self))).is_err() {
                log::error!("deferred task panicked; reactor continues");
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Run `callback` once after `delay`.
    ///
    /// Returns the id to cancel the timer with. A zero delay fires on the
    /// next timer sweep.
    pub fn run_after<F: FnOnce(&EventLoop) + 'static>(&self, delay: Duration, callback: F) -> TimerId {
        let id = self.allocate_timer_id();
        let expiration = monotonic_now_ns().saturating_add(delay.as_nanos() as u64);
        self.insert_timer(id, expiration, TimerKind::Once(Box::new(callback)));
        id
    }

    /// Run `callback` every `interval`, drift-free relative to the first
    /// expiration. Rejects a zero interval.
    ///
    /// Cancelling a repeating timer from inside its own callback is a no-op
    /// (the firing entry is detached at that point); defer the cancel with
    /// [`EventLoop::run_in_loop`] instead.
    pub fn run_every<F: FnMut(&EventLoop) + 'static>(
        &self,
        interval: Duration,
        callback: F,
    ) -> KestrelResult<TimerId> {
        if interval.is_zero() {
            return Err(KestrelError::invalid_input(
                "periodic timer interval must be non-zero",
            ));
        }
        let interval_ns = interval.as_nanos() as u64;
        let id = self.allocate_timer_id();
        let expiration = monotonic_now_ns().saturating_add(interval_ns);
        self.insert_timer(
            id,
            expiration,
            TimerKind::Repeating {
                interval_ns,
                callback: Box::new(callback),
            },
        );
        Ok(id)
    }

    /// Cancel a pending timer. Cancellation is terminal: the callback will
    /// never fire afterwards, and cancelling the same id again is `NotFound`.
    pub fn cancel_timer(&self, id: TimerId) -> KestrelResult<()> {
        if self.timers.borrow_mut().cancel(id) {
            // The earliest timer may just have gone away.
            self.rearm_timer_fd();
            Ok(())
        } else {
            Err(KestrelError::not_found(format!("timer {}", id.0)))
        }
    }

    /// Number of pending timers.
    pub fn pending_timers(&self) -> usize {
        self.timers.borrow().len()
    }

    fn allocate_timer_id(&self) -> TimerId {
        let id = self.next_timer_id.get();
        self.next_timer_id.set(id + 1);
        TimerId(id)
    }

    fn insert_timer(&self, id: TimerId, expiration_ns: u64, kind: TimerKind) {
        let earliest_changed = self.timers.borrow_mut().insert(id, expiration_ns, kind);
        if earliest_changed {
            self.rearm_timer_fd();
        }
    }

    /// The timer descriptor is readable: clear it, fire everything due, and
    /// reprogram it for the new earliest expiration.
    fn handle_timer_read(&self) {
        let mut expirations: u64 = 0;
        // SAFETY: reading 8 bytes into a u64, the timerfd wire format. The
        // read must happen or epoll reports the descriptor ready forever.
        let n = unsafe {
            libc::read(
                self.timer_fd.as_raw_fd(),
                &mut expirations as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            // Spurious wakeup (EAGAIN): the queue is the source of truth,
            // sweep it anyway.
            log::debug!("timerfd read: {}", io::Error::last_os_error());
        }

        let now = monotonic_now_ns();
        // Snapshot the expired set before invoking anything: callbacks may
        // insert or cancel timers, and must see the live queue.
        let expired = self.timers.borrow_mut().take_expired(now);

        for entry in expired {
            match entry.kind {
                TimerKind::Once(callback) => {
                    if panic::catch_unwind(AssertUnwindSafe(|| callback(self))).is_err() {
                        log::error!("timer callback panicked; reactor continues");
                    }
                }
                TimerKind::Repeating {
                    interval_ns,
                    mut callback,
                } => {
                    if panic::catch_unwind(AssertUnwindSafe(|| callback(self))).is_err() {
                        log::error!("periodic timer callback panicked; reactor continues");
                    }
                    // Drift-free: advance from the scheduled expiration, not
                    // from `now`.
                    self.timers.borrow_mut().insert(
                        entry.id,
                        entry.expiration_ns + interval_ns,
                        TimerKind::Repeating {
                            interval_ns,
                            callback,
                        },
                    );
                }
            }
        }

        self.rearm_timer_fd();
    }

    /// Program the timer descriptor for the earliest pending expiration, in
    /// absolute monotonic mode, or disarm it when the queue is empty.
    fn rearm_timer_fd(&self) {
        let next = self.timers.borrow().next_expiration_ns();

        // SAFETY: zeroed itimerspec = disarm, a valid value.
        let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        let mut flags = 0;
        if let Some(expiration_ns) = next {
            // An all-zero it_value disarms, so clamp to 1 ns; an absolute
            // expiration already in the past fires immediately.
            let when = expiration_ns.max(1);
            spec.it_value.tv_sec = (when / NANOS_PER_SEC) as libc::time_t;
            spec.it_value.tv_nsec = (when % NANOS_PER_SEC) as libc::c_long;
            flags = libc::TFD_TIMER_ABSTIME;
        }

        // SAFETY: timer_fd is a valid timerfd; spec is fully initialized.
        let rc = unsafe {
            libc::timerfd_settime(self.timer_fd.as_raw_fd(), flags, &spec, std::ptr::null_mut())
        };
        if rc != 0 {
            log::warn!("timerfd_settime: {}", io::Error::last_os_error());
        }
    }
}
