//! Live UDP reception: dual-stack sockets drained in bursts.
//!
//! One receiver owns a pre-allocated, cache-aligned batch buffer (the packet
//! arena) plus the `iovec`/`mmsghdr` scaffolding for `recvmmsg`, and any
//! number of per-port sockets registered with the reactor. When a socket is
//! ready the reactor calls back into the receiver, which drains an entire
//! burst before returning.
//!
//! Linux-specific details that matter on this path:
//! - `recvmmsg(MSG_DONTWAIT)` pulls up to `batch_size` datagrams per syscall.
//! - `SO_TIMESTAMPNS` makes the kernel attach a nanosecond receive timestamp
//!   as a `SCM_TIMESTAMPNS` control message, captured before any userspace
//!   scheduling jitter.
//! - `msg_namelen` and `msg_controllen` must be reset to their full buffer
//!   sizes before *every* batch receive: the kernel shrinks both to the size
//!   it last used and would silently stop delivering ancillary data.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::rc::Rc;

use crate::error::{KestrelError, KestrelResult};
use crate::memory::PacketArena;
use crate::reactor::source::Dispatch;
use crate::reactor::EventLoop;

use super::{
    preflight_subscribe, shared_handler, OwnerThread, PacketStatus, PacketTimestamp, PacketView,
    ReceiverConfig, SharedHandler,
};

/// The burst-drain state machine: arena, scatter-gather scaffolding, and the
/// pre-allocated ancillary buffers, wired together once at construction.
pub(crate) struct UdpCore {
    pub(crate) config: ReceiverConfig,
    pub(crate) owner: OwnerThread,
    arena: PacketArena,
    headers: Vec<libc::mmsghdr>,
    // The next three are only reached through raw pointers wired into
    // `headers`; they exist to keep those allocations alive and in place.
    #[allow(dead_code)]
    iovecs: Vec<libc::iovec>,
    #[allow(dead_code)]
    addrs: Vec<libc::sockaddr_storage>,
    #[allow(dead_code)]
    controls: Vec<Vec<u8>>,
    control_len: usize,
}

impl UdpCore {
    pub(crate) fn new(config: ReceiverConfig) -> KestrelResult<Self> {
        let arena = PacketArena::new(config.batch_size, config.buffer_size)?;
        let batch = config.batch_size;

        // Room for one cmsghdr carrying a timespec (the kernel timestamp).
        // SAFETY: CMSG_SPACE is a pure size computation with no preconditions.
        let control_len =
            unsafe { libc::CMSG_SPACE(mem::size_of::<libc::timespec>() as u32) } as usize;

        let mut iovecs = vec![
            libc::iovec {
                iov_base: ptr::null_mut(),
                iov_len: 0,
            };
            batch
        ];
        // SAFETY: mmsghdr and sockaddr_storage are C structs for which
        // all-zeros is a valid initial state.
        let mut headers: Vec<libc::mmsghdr> = vec![unsafe { mem::zeroed() }; batch];
        let mut addrs: Vec<libc::sockaddr_storage> = vec![unsafe { mem::zeroed() }; batch];
        let mut controls: Vec<Vec<u8>> = (0..batch).map(|_| vec![0u8; control_len]).collect();

        // Wire each message header to its arena slot, sender-address slot and
        // control buffer. The backing allocations never move afterwards.
        for i in 0..batch {
            iovecs[i] = libc::iovec {
                iov_base: arena.slot_ptr(i) as *mut libc::c_void,
                // The slot payload limit, NOT the batch size.
                iov_len: config.buffer_size,
            };

            let hdr = &mut headers[i].msg_hdr;
            hdr.msg_name = &mut addrs[i] as *mut libc::sockaddr_storage as *mut libc::c_void;
            hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            hdr.msg_iov = &mut iovecs[i];
            hdr.msg_iovlen = 1;
            hdr.msg_control = controls[i].as_mut_ptr() as *mut libc::c_void;
            hdr.msg_controllen = control_len;
        }

        Ok(Self {
            config,
            owner: OwnerThread::capture(),
            arena,
            iovecs,
            headers,
            addrs,
            controls,
            control_len,
        })
    }

    /// Drain one ready socket: a single `recvmmsg`, then one handler call per
    /// delivered datagram. Runs on the owner thread only.
    pub(crate) fn drain(&mut self, fd: RawFd, handler: &SharedHandler) {
        self.owner.check();

        // Mandatory reset before the syscall: the kernel shrinks these to
        // the previously observed sizes and would corrupt ancillary delivery
        // across bursts.
        for header in self.headers.iter_mut() {
            header.msg_hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            header.msg_hdr.msg_controllen = self.control_len;
            header.msg_hdr.msg_flags = 0;
            header.msg_len = 0;
        }

        // SAFETY: every header was wired to stable heap buffers at
        // construction; fd is a live socket owned by this receiver.
        let received = unsafe {
            libc::recvmmsg(
                fd,
                self.headers.as_mut_ptr(),
                self.config.batch_size as libc::c_uint,
                libc::MSG_DONTWAIT,
                ptr::null_mut(),
            )
        };
        if received < 0 {
            // Raced with another wakeup or spurious readiness: nothing to do.
            log::debug!(
                "recvmmsg on fd {}: nothing to drain ({})",
                fd,
                io::Error::last_os_error()
            );
            return;
        }

        let mut callback = handler.borrow_mut();
        for k in 0..received as usize {
            let header = &self.headers[k];

            let mut status = PacketStatus::OK;
            if header.msg_hdr.msg_flags & libc::MSG_TRUNC != 0 {
                status |= PacketStatus::TRUNCATED;
            }

            let timestamp = extract_timestamp(&header.msg_hdr).unwrap_or_default();

            let len = header.msg_len as usize;
            if len == 0 {
                continue;
            }
            debug_assert!(len <= self.config.buffer_size);

            // SAFETY: the kernel wrote `len` bytes into slot k this burst.
            let data = unsafe { self.arena.slot(k, len) };
            let view = PacketView {
                data,
                status,
                timestamp,
            };
            (*callback)(&view);
        }
    }
}

/// Take the first SOL_SOCKET/SCM_TIMESTAMPNS control message as the packet
/// timestamp. `None` when the kernel attached no timestamp.
fn extract_timestamp(header: &libc::msghdr) -> Option<PacketTimestamp> {
    // SAFETY: msg_control points at this receiver's pre-allocated control
    // buffer; the CMSG_* macros walk it bounded by msg_controllen.
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(header) };
    while !cmsg.is_null() {
        // SAFETY: cmsg is non-null and inside the control buffer.
        let c = unsafe { &*cmsg };
        if c.cmsg_level == libc::SOL_SOCKET && c.cmsg_type == libc::SCM_TIMESTAMPNS {
            // SAFETY: an SCM_TIMESTAMPNS cmsg carries a timespec payload;
            // it may be unaligned inside the control buffer.
            let ts: libc::timespec =
                unsafe { ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::timespec) };
            return Some(PacketTimestamp {
                sec: ts.tv_sec as i64,
                nsec: ts.tv_nsec as i64,
            });
        }
        // SAFETY: header and cmsg are valid; CMSG_NXTHDR returns null at the end.
        cmsg = unsafe { libc::CMSG_NXTHDR(header, cmsg) };
    }
    None
}

/// Set a single `c_int` socket option.
fn set_socket_option(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> KestrelResult<()> {
    // SAFETY: value points at a c_int and optlen matches.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(KestrelError::last_os_error());
    }
    Ok(())
}

/// Open a non-blocking wildcard datagram socket for `port` and resolve the
/// actually bound port (required for port 0).
///
/// IPv6 dual-stack is preferred; hosts without IPv6 fall back to IPv4.
fn open_wildcard_socket(port: u16) -> KestrelResult<(OwnedFd, u16)> {
    // SAFETY: plain socket(2) call; result checked below.
    let mut raw = unsafe {
        libc::socket(
            libc::AF_INET6,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    let mut is_v6 = true;
    if raw < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EAFNOSUPPORT) {
        // IPv6 is disabled in this kernel; v4-only still works.
        is_v6 = false;
        // SAFETY: plain socket(2) call; result checked below.
        raw = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
    }
    if raw < 0 {
        return Err(KestrelError::last_os_error());
    }
    // SAFETY: raw is a freshly created, unowned descriptor. From here on any
    // failure closes it on the way out.
    let socket = unsafe { OwnedFd::from_raw_fd(raw) };
    let fd = socket.as_raw_fd();

    // Immediate restart after a crash, and parallel sockets on one port.
    set_socket_option(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    set_socket_option(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
    // Kernel receive timestamps in nanoseconds.
    set_socket_option(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMPNS, 1)?;

    if is_v6 {
        // Accept v4-mapped traffic on the same socket. Not fatal where the
        // kernel refuses.
        let _ = set_socket_option(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 0);

        // SAFETY: all-zeros sockaddr_in6 is valid; the zero address is
        // in6addr_any.
        let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        addr.sin6_port = port.to_be();
        // SAFETY: addr is a fully initialized sockaddr_in6 of the given size.
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_in6 as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(KestrelError::last_os_error());
        }
    } else {
        // SAFETY: all-zeros sockaddr_in is valid; zero s_addr is INADDR_ANY.
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        // SAFETY: addr is a fully initialized sockaddr_in of the given size.
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(KestrelError::last_os_error());
        }
    }

    // Resolve the actually bound port.
    // SAFETY: zeroed sockaddr_storage is a valid out-buffer.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage/len describe a writable sockaddr_storage.
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(KestrelError::last_os_error());
    }

    let local_port = match storage.ss_family as libc::c_int {
        libc::AF_INET6 => {
            // SAFETY: ss_family says the storage holds a sockaddr_in6.
            u16::from_be(unsafe {
                (*(&storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)).sin6_port
            })
        }
        libc::AF_INET => {
            // SAFETY: ss_family says the storage holds a sockaddr_in.
            u16::from_be(unsafe {
                (*(&storage as *const libc::sockaddr_storage as *const libc::sockaddr_in)).sin_port
            })
        }
        _ => port,
    };

    Ok((socket, local_port))
}

/// Live UDP receiver bound to one reactor.
///
/// Subscribing to a port opens a wildcard dual-stack socket, registers it
/// with the reactor, and delivers every datagram addressed to the port
/// through the subscription's handler. Handlers must not call back into the
/// receiver that is delivering to them; reactor operations (timers, deferred
/// tasks, other receivers) are fine.
pub struct UdpReceiver<'l> {
    event_loop: &'l EventLoop,
    core: Rc<RefCell<UdpCore>>,
    ports: BTreeMap<u16, OwnedFd>,
}

impl<'l> UdpReceiver<'l> {
    /// Allocate the arena and batch scaffolding for this receiver.
    pub fn new(event_loop: &'l EventLoop, config: ReceiverConfig) -> KestrelResult<Self> {
        Ok(Self {
            event_loop,
            core: Rc::new(RefCell::new(UdpCore::new(config)?)),
            ports: BTreeMap::new(),
        })
    }

    /// Open a socket for `port` (0 = OS-assigned), wire it to the reactor,
    /// and return the resolved local port.
    ///
    /// On any failure the socket is closed and no state changes: the port
    /// table and the reactor are exactly as before the call.
    pub fn subscribe<F: FnMut(&PacketView<'_>) + 'static>(
        &mut self,
        port: u16,
        handler: F,
    ) -> KestrelResult<u16> {
        {
            let core = self.core.borrow();
            core.owner.check();
            preflight_subscribe(
                &core.config,
                self.ports.len(),
                self.ports.contains_key(&port),
                port,
            )?;
        }

        let (socket, local_port) = open_wildcard_socket(port)?;
        let fd = socket.as_raw_fd();

        self.event_loop.add_source(
            fd,
            libc::EPOLLIN as u32,
            Dispatch::Udp {
                receiver: Rc::clone(&self.core),
                handler: shared_handler(handler),
                fd,
            },
        )?;

        // Only after the reactor accepted the source does the socket enter
        // the table.
        self.ports.insert(local_port, socket);
        Ok(local_port)
    }

    /// Deregister the port's socket from the reactor, then close it.
    pub fn unsubscribe(&mut self, port: u16) -> KestrelResult<()> {
        self.core.borrow().owner.check();

        let socket = self
            .ports
            .get(&port)
            .ok_or_else(|| KestrelError::not_found(format!("port {}", port)))?;

        let result = self.event_loop.remove_source(socket.as_raw_fd());
        // Deregistration precedes close: dropping the entry closes the fd.
        self.ports.remove(&port);
        result
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.ports.len()
    }
}

impl Drop for UdpReceiver<'_> {
    fn drop(&mut self) {
        // Deregister everything before the sockets close underneath epoll.
        for socket in self.ports.values() {
            let _ = self.event_loop.remove_source(socket.as_raw_fd());
        }
    }
}
