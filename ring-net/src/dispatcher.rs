// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::net::SocketAddr;
use std::os::fd::RawFd;

use log::{debug, trace};
use nix::errno::Errno;

use crate::driver::{self, Completion, RingDriver};
use crate::tag::{self, EventKind};

/// The events a completion can resolve into, surfaced to
/// [`crate::server::NetworkServer`]'s control loop.
///
/// Cancel acknowledgements and tag-decode failures never appear here: both
/// are internal bookkeeping the dispatcher logs and swallows (§4.2, §7).
#[derive(Debug)]
pub enum NetEvent {
    /// `more` mirrors the completion's "more completions will follow" flag:
    /// when clear, the multishot accept has terminated and the listener
    /// must be re-armed with a fresh `accept_multishot` (§4.2).
    Accept { new_fd: RawFd, more: bool },
    /// `more` as above — an accept error completion can also terminate the
    /// multishot, in which case the listener must be re-armed too (§4.5/§7).
    AcceptError { errno: Errno, more: bool },
    /// `more` mirrors the completion's "more completions will follow" flag:
    /// when clear, the multishot read has terminated and the caller must
    /// resubmit even though this particular completion carried data (§4.2).
    Read { fd: RawFd, bytes: Vec<u8>, more: bool },
    ReadError { fd: RawFd, errno: Errno },
    /// The connection reached EOF (`result == 0`): the peer closed its
    /// write side. Resubmitting a multishot recv against an EOF'd socket
    /// would immediately complete with `0` again, pegging the CPU in a hot
    /// re-arm loop, so this is kept distinct from a data-bearing
    /// `Read { more: false, .. }`, and the caller closes the peer instead
    /// of re-arming (teacher's `handle_receive`, `original_source`'s
    /// `handleRead`).
    ReadClosed { fd: RawFd },
    /// The provided-buffer group ran out of slots while a read was ready.
    /// The read itself is not lost — the kernel reports `ENOBUFS` and the
    /// operation must be resubmitted once slots are replenished.
    BufferStarvation { fd: RawFd },
    Recvmsg { fd: RawFd, bytes: Vec<u8>, from: Option<SocketAddr> },
    RecvmsgError { fd: RawFd, errno: Errno },
    WriteDone { fd: RawFd, bytes_written: usize },
    WriteError { fd: RawFd, errno: Errno },
    Timeout,
}

/// Stateless translator from raw completions to [`NetEvent`]s.
///
/// Holds no fields of its own: every piece of state a translation needs
/// (provided-buffer payloads, listener addresses) lives on the
/// [`RingDriver`] it's given, matching §4.2's description of the dispatcher
/// as a pure function of a completion plus ring-owned state.
#[derive(Default)]
pub struct EventDispatcher;

impl EventDispatcher {
    pub fn new() -> Self {
        Self
    }

    /// Translates one completion. Returns `None` for completions this layer
    /// fully handles itself (cancel acks, unparseable tags) rather than
    /// surfacing to the caller.
    pub fn translate(&mut self, driver: &mut RingDriver, cqe: Completion) -> Option<NetEvent> {
        let Some((kind, fd)) = tag::decode(cqe.user_data()) else {
            driver::warn_protocol_violation(&format!(
                "completion carried an unrecognized tag {:#x}",
                cqe.user_data()
            ));
            return None;
        };

        driver::assert_not_driver_bug(&cqe);

        match kind {
            EventKind::Accept => Some(self.translate_accept(cqe)),
            EventKind::Read => self.translate_read(driver, fd, cqe),
            EventKind::Recvmsg => self.translate_recvmsg(driver, fd, cqe),
            EventKind::Write => Some(self.translate_write(fd, cqe)),
            EventKind::Timeout => Some(NetEvent::Timeout),
            EventKind::Cancel => {
                driver::log_ignored_cancel_ack(cqe.user_data());
                None
            }
        }
    }

    fn translate_accept(&self, cqe: Completion) -> NetEvent {
        let more = cqe.more();
        if let Some(errno) = cqe.errno() {
            return NetEvent::AcceptError { errno, more };
        }
        NetEvent::Accept { new_fd: cqe.result(), more }
    }

    fn translate_read(&self, driver: &mut RingDriver, fd: RawFd, cqe: Completion) -> Option<NetEvent> {
        if let Some(errno) = cqe.errno() {
            if errno == Errno::ENOBUFS {
                trace!("fd {fd}: buffer group starved on a ready read");
                return Some(NetEvent::BufferStarvation { fd });
            }
            return Some(NetEvent::ReadError { fd, errno });
        }

        let len = cqe.result() as usize;
        if len == 0 {
            debug!("fd {fd}: read multishot reported EOF");
            return Some(NetEvent::ReadClosed { fd });
        }

        let Some(bid) = cqe.buffer_id() else {
            driver::warn_protocol_violation(&format!(
                "fd {fd}: positive read result without buffer-selected flag"
            ));
            return None;
        };
        // SAFETY: bid was returned by this same completion's buffer-select
        // flag and has not been consumed elsewhere.
        let bytes = unsafe { driver.take_and_replenish(bid, len) };

        let more = cqe.more();
        if !more {
            trace!("fd {fd}: multishot read terminated on this completion, caller must re-arm");
        }

        Some(NetEvent::Read { fd, bytes, more })
    }

    fn translate_recvmsg(&self, driver: &mut RingDriver, fd: RawFd, cqe: Completion) -> Option<NetEvent> {
        if let Some(errno) = cqe.errno() {
            return Some(NetEvent::RecvmsgError { fd, errno });
        }

        let len = cqe.result() as usize;
        let Some(bid) = cqe.buffer_id() else {
            driver::warn_protocol_violation(&format!(
                "fd {fd}: positive recvmsg result without buffer-selected flag"
            ));
            return None;
        };
        // SAFETY: see translate_read.
        let bytes = unsafe { driver.take_and_replenish(bid, len) };
        let from = driver.last_recvmsg_addr(fd);

        Some(NetEvent::Recvmsg { fd, bytes, from })
    }

    fn translate_write(&self, fd: RawFd, cqe: Completion) -> NetEvent {
        if let Some(errno) = cqe.errno() {
            return NetEvent::WriteError { fd, errno };
        }
        NetEvent::WriteDone { fd, bytes_written: cqe.result() as usize }
    }
}

#[cfg(test)]
mod tests {
    // EventDispatcher's translation logic is exercised end-to-end in
    // tests/ against a real ring, since Completion has no public
    // constructor outside of a live io_uring cqe — there is no cheap way
    // to fabricate one in a unit test.
}
