// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::os::fd::RawFd;
use std::time::Duration;

use io_uring::{cqueue, opcode, squeue, types, IoUring};
use log::{error, trace, warn};
use nix::errno::Errno;

use crate::buffer_group::{BufferGroup, DEFAULT_SLOT_SIZE};
use crate::error::Error;
use crate::tag::{self, EventKind};

/// Default number of submission/completion ring entries. Matches the
/// teacher's `RpcServer::new`.
pub const DEFAULT_RING_ENTRIES: u32 = 1024;

/// Number of slots in the default provided-buffer group, and the group id
/// every read/recv submission in this engine uses.
pub const DEFAULT_BUFFER_SLOTS: u16 = 1024;
const DEFAULT_GROUP_ID: u16 = 7;

/// A completion queue entry, wrapped so callers outside this module don't
/// need to depend on `io_uring::cqueue` directly.
#[derive(Debug, Clone, Copy)]
pub struct Completion(cqueue::Entry);

impl Completion {
    pub fn user_data(&self) -> u64 {
        self.0.user_data()
    }

    pub fn result(&self) -> i32 {
        self.0.result()
    }

    pub fn is_err(&self) -> bool {
        self.result() < 0
    }

    /// The negated kernel errno, if this completion failed.
    pub fn errno(&self) -> Option<Errno> {
        if self.result() < 0 {
            Some(Errno::from_raw(-self.result()))
        } else {
            None
        }
    }

    pub fn more(&self) -> bool {
        cqueue::more(self.0.flags())
    }

    /// The provided-buffer slot index, if the buffer-selected flag is set.
    pub fn buffer_id(&self) -> Option<u16> {
        cqueue::buffer_select(self.0.flags())
    }
}

/// Owns the kernel io_uring ring and the default provided-buffer group.
///
/// Provides a minimal, typed submission API (§4.1) and a non-blocking reap
/// API. All loads/stores on the kernel-shared submission/completion head and
/// tail counters are handled internally by the `io-uring` crate with the
/// acquire/release ordering §9 calls for; the one exception is the
/// buffer-ring tail, published by hand in [`crate::buffer_group`] exactly as
/// the design requires.
pub struct RingDriver {
    ring: IoUring,
    buffers: BufferGroup,
    /// Scratch `msghdr`/sockaddr storage for the one recvmsg operation
    /// outstanding at a time per listener fd. Keyed by fd so multiple UDP
    /// listeners (unusual, but not forbidden) don't clobber each other.
    msg_scratch: std::collections::HashMap<RawFd, Box<RecvmsgScratch>>,
    /// Owns every `Timespec` a timeout submission pointed the kernel at.
    /// A one-shot timeout's completion doesn't tell the driver it's safe
    /// to free the backing memory, and a multishot timeout's never does
    /// until cancelled, so these are retained for the driver's lifetime
    /// and freed on `Drop` rather than leaked with `Box::leak` per call.
    timeout_scratch: Vec<Box<types::Timespec>>,
}

/// Pre-zeroed storage a `recvmsg` submission points its `msghdr` at so the
/// kernel can fill in the remote address. Boxed so its address is stable
/// across the `HashMap` it lives in.
pub(crate) struct RecvmsgScratch {
    pub addr: libc::sockaddr_storage,
    pub msghdr: libc::msghdr,
}

impl RecvmsgScratch {
    fn new() -> Box<Self> {
        let mut scratch = Box::new(Self {
            addr: unsafe { std::mem::zeroed() },
            msghdr: unsafe { std::mem::zeroed() },
        });
        scratch.msghdr.msg_name = &mut scratch.addr as *mut _ as *mut libc::c_void;
        scratch.msghdr.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as u32;
        scratch
    }
}

impl RingDriver {
    pub fn new(entries: u32) -> Result<Self, Error> {
        let mut ring = IoUring::new(entries).map_err(Error::SetupFatal)?;
        let buffers = BufferGroup::new(
            &mut ring,
            DEFAULT_GROUP_ID,
            DEFAULT_BUFFER_SLOTS,
            DEFAULT_SLOT_SIZE,
        )
        .map_err(Error::SetupFatal)?;

        Ok(Self {
            ring,
            buffers,
            msg_scratch: std::collections::HashMap::new(),
            timeout_scratch: Vec::new(),
        })
    }

    pub(crate) fn buffers_mut(&mut self) -> &mut BufferGroup {
        &mut self.buffers
    }

    fn push(&mut self, entry: squeue::Entry) -> Result<(), Error> {
        // SAFETY: every submission built by this module either carries no
        // external pointer (accept, timeout, cancel use only values valid
        // for the call's duration) or points into memory this driver (the
        // buffer group) or the caller's Peer keeps alive until the matching
        // completion is observed, per the memory-safety contract in §9.
        unsafe {
            self.ring.submission().push(&entry).map_err(|_| Error::QueueFull)?;
        }
        Ok(())
    }

    /// Submits the entry and immediately enters the kernel with
    /// submit-count 1. Batching multiple pushes per enter is an available
    /// optimization this driver doesn't take, matching the teacher.
    fn submit_now(&mut self, entry: squeue::Entry) -> Result<(), Error> {
        self.push(entry)?;
        self.ring.submit().map_err(Error::Io)?;
        Ok(())
    }

    pub fn accept_multishot(&mut self, listening_fd: RawFd) -> Result<(), Error> {
        let tag = tag::encode(EventKind::Accept, listening_fd);
        let entry = opcode::AcceptMulti::new(types::Fd(listening_fd))
            .build()
            .user_data(tag);
        self.submit_now(entry)
    }

    /// Submits a single-shot buffer-selected recvmsg. UDP never uses
    /// multishot here: the kernel re-initializes the message header on each
    /// multishot completion, which would lose the source address (§4.1).
    pub fn recvmsg(&mut self, fd: RawFd) -> Result<(), Error> {
        let scratch = self
            .msg_scratch
            .entry(fd)
            .or_insert_with(RecvmsgScratch::new);
        let msghdr_ptr: *mut libc::msghdr = &mut scratch.msghdr;

        let tag = tag::encode(EventKind::Recvmsg, fd);
        let entry = opcode::RecvMsg::new(types::Fd(fd), msghdr_ptr)
            .buf_group(self.buffers.group_id())
            .build()
            .flags(squeue::Flags::BUFFER_SELECT)
            .user_data(tag);
        self.submit_now(entry)
    }

    /// Submits a multishot read (recv) with buffer selection, per §9's
    /// resolution of the two-read-strategies open question: this engine
    /// always uses the multishot form and re-arms it on termination.
    pub fn read_multishot(&mut self, fd: RawFd) -> Result<(), Error> {
        let tag = tag::encode(EventKind::Read, fd);
        let entry = opcode::RecvMulti::new(types::Fd(fd), self.buffers.group_id())
            .build()
            .user_data(tag);
        self.submit_now(entry)
    }

    /// Submits a write of `buf`. `buf` must remain valid and unmoved until
    /// the matching completion is observed; callers satisfy this by
    /// pointing into a `Peer`'s write ring, which is heap-stable for the
    /// peer's lifetime.
    pub fn write(&mut self, fd: RawFd, buf: &[u8]) -> Result<(), Error> {
        let tag = tag::encode(EventKind::Write, fd);
        let entry = opcode::Write::new(types::Fd(fd), buf.as_ptr(), buf.len() as u32)
            .build()
            .user_data(tag);
        self.submit_now(entry)
    }

    pub fn cancel(&mut self, target_tag: u64, fd: RawFd) -> Result<(), Error> {
        let tag = tag::encode(EventKind::Cancel, fd);
        let entry = opcode::AsyncCancel::new(target_tag).build().user_data(tag);
        self.submit_now(entry)
    }

    pub fn timeout(&mut self, duration: Duration, tag_fd: RawFd) -> Result<(), Error> {
        self.submit_timeout(duration, tag_fd, false)
    }

    pub fn timeout_multishot(&mut self, duration: Duration, tag_fd: RawFd) -> Result<(), Error> {
        self.submit_timeout(duration, tag_fd, true)
    }

    fn submit_timeout(&mut self, duration: Duration, tag_fd: RawFd, multishot: bool) -> Result<(), Error> {
        let ts = Box::new(types::Timespec::new().sec(duration.as_secs()).nsec(duration.subsec_nanos()));
        let ts_ptr: *const types::Timespec = ts.as_ref();
        self.timeout_scratch.push(ts);

        let mut flags = types::TimeoutFlags::ETIME_SUCCESS;
        if multishot {
            flags |= types::TimeoutFlags::MULTISHOT;
        }

        let tag = tag::encode(EventKind::Timeout, tag_fd);
        let entry = opcode::Timeout::new(ts_ptr)
            .flags(flags)
            .build()
            .user_data(tag);
        self.submit_now(entry)
    }

    /// Returns at most `max` ready completions, advancing completion-head
    /// as it drains them. Fails with [`Error::WouldBlock`] if none are
    /// ready.
    pub fn peek_batch(&mut self, max: usize) -> Result<Vec<Completion>, Error> {
        let mut out = Vec::new();
        {
            let mut cq = self.ring.completion();
            cq.sync();
            for entry in cq.by_ref().take(max) {
                out.push(Completion(entry));
            }
        }
        if out.is_empty() {
            Err(Error::WouldBlock)
        } else {
            Ok(out)
        }
    }

    /// Blocks inside the kernel-enter syscall until at least one completion
    /// is ready or `timeout` elapses. An expiry is folded into
    /// [`Error::WouldBlock`] — ring-empty and timer-expired are the same
    /// "nothing to do" signal to the outer loop (§4.1).
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        let submit_result = match timeout {
            None => self.ring.submit_and_wait(1),
            Some(d) => {
                let ts = types::Timespec::new().sec(d.as_secs()).nsec(d.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args)
            }
        };

        match submit_result {
            Ok(_) => Ok(()),
            Err(e) => match e.raw_os_error().map(Errno::from_raw) {
                Some(Errno::EAGAIN) | Some(Errno::ETIME) => Err(Error::WouldBlock),
                _ => {
                    error!("unexpected io_uring_enter failure: {e}");
                    Err(Error::Io(e))
                }
            },
        }
    }

    /// Converts the scratch `sockaddr_storage` left behind by the most
    /// recent `recvmsg` on `fd` into a [`std::net::SocketAddr`]. Returns
    /// `None` if no recvmsg scratch is tracked for `fd`, or the kernel left
    /// behind a family this engine doesn't understand (should not happen
    /// for AF_INET/AF_INET6 sockets).
    pub fn last_recvmsg_addr(&self, fd: RawFd) -> Option<std::net::SocketAddr> {
        let scratch = self.msg_scratch.get(&fd)?;
        sockaddr_storage_to_std(&scratch.addr)
    }

    /// Copies the payload of provided-buffer slot `id` out and replenishes
    /// the slot, making it available to the kernel again.
    ///
    /// # Safety
    /// `id` must come from a completion that set the buffer-selected flag
    /// and has not already been consumed.
    pub unsafe fn take_and_replenish(&mut self, id: u16, len: usize) -> Vec<u8> {
        let slot = self.buffers.take(id);
        let bytes = slot[..len].to_vec();
        self.buffers.give(slot, id);
        bytes
    }
}

impl std::fmt::Debug for RingDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingDriver").finish_non_exhaustive()
    }
}

/// Checks a completion for error classes that always indicate a driver bug
/// (a dangling or invalid fd/pointer), as opposed to an ordinary recoverable
/// failure the dispatcher classifies. Matches the teacher's
/// `check_completion_error`.
pub(crate) fn assert_not_driver_bug(c: &Completion) {
    if let Some(errno) = c.errno() {
        match errno {
            Errno::EBADF => panic!("completion returned EBADF: {c:?} — driver bug"),
            Errno::EFAULT => panic!("completion returned EFAULT: {c:?} — driver bug"),
            _ => {}
        }
    }
}

pub(crate) fn log_ignored_cancel_ack(tag: u64) {
    trace!("swallowed cancel-ack completion for tag {tag:#x}");
}

pub(crate) fn warn_protocol_violation(reason: &str) {
    warn!("protocol violation: {reason}");
}

fn sockaddr_storage_to_std(storage: &libc::sockaddr_storage) -> Option<std::net::SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

    match storage.ss_family as i32 {
        libc::AF_INET => {
            let addr: libc::sockaddr_in = unsafe {
                std::ptr::read(storage as *const _ as *const libc::sockaddr_in)
            };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let addr: libc::sockaddr_in6 = unsafe {
                std::ptr::read(storage as *const _ as *const libc::sockaddr_in6)
            };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Some(SocketAddr::V6(SocketAddrV6::new(ip, port, addr.sin6_flowinfo, addr.sin6_scope_id)))
        }
        _ => None,
    }
}
