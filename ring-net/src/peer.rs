// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use log::trace;
use uuid::Uuid;

use crate::error::Error;
use crate::ringbuf::RingBuffer;

/// Default size of a peer's read and write ring buffers (§3: "a read ring
/// buffer (default 4096 B) and a write ring buffer (default 4096 B)").
/// Already a power of two, so [`RingBuffer::new`]'s rounding is a no-op.
pub const DEFAULT_PEER_BUFFER_SIZE: usize = 4096;

/// A connection's lifecycle stage (§5).
///
/// `New` is assigned on accept and never observed again once the first
/// read or write event arrives; `Idle` is assigned by
/// [`crate::server::NetworkServer`]'s periodic tick, which compares
/// `last_active` against a policy timeout rather than this type tracking
/// time on its own. Transitions are monotonic except `Idle -> Active`,
/// which any fresh activity performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    New = 0,
    Active = 1,
    Idle = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::New,
            1 => Self::Active,
            2 => Self::Idle,
            _ => Self::Closed,
        }
    }
}

/// One accepted connection's buffers and bookkeeping.
///
/// `fd` is owned by this peer: dropping a `Peer` without having closed `fd`
/// leaks the descriptor, so [`crate::server::NetworkServer`] always closes
/// it explicitly once `inflight_writes` reaches zero (§5's note that a
/// peer's memory — and now its fd — cannot be freed while the kernel still
/// holds a reference to either).
pub struct Peer {
    session_id: Uuid,
    fd: RawFd,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    read_ring: RingBuffer,
    write_ring: RingBuffer,
    /// Bytes enqueued into `write_ring` that have not yet completed being
    /// written to the socket. Kept in lockstep with `write_ring.length()`
    /// at every enqueue and every completed-write advance, instead of
    /// tracking it only on one side of that pair the way the source this
    /// was distilled from did.
    queued_bytes: usize,
    /// Number of write submissions currently outstanding at the kernel,
    /// each pointing into `write_ring`'s backing memory. Must reach zero
    /// before the peer can be torn down.
    inflight_writes: u32,
    status: AtomicU8,
    last_active: Instant,
}

impl Peer {
    pub fn new(fd: RawFd, local_addr: Option<SocketAddr>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            fd,
            local_addr,
            remote_addr,
            read_ring: RingBuffer::new(DEFAULT_PEER_BUFFER_SIZE),
            write_ring: RingBuffer::new(DEFAULT_PEER_BUFFER_SIZE),
            queued_bytes: 0,
            inflight_writes: 0,
            status: AtomicU8::new(ConnState::New as u8),
            last_active: Instant::now(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn status(&self) -> ConnState {
        ConnState::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: ConnState) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
        if self.status() == ConnState::Idle {
            self.set_status(ConnState::Active);
        }
    }

    pub fn inflight_writes(&self) -> u32 {
        self.inflight_writes
    }

    pub fn can_be_reclaimed(&self) -> bool {
        self.status() == ConnState::Closed && self.inflight_writes == 0
    }

    /// Copies received bytes into the read ring. Fails with
    /// [`Error::BufferFull`] if the peer is reading faster than the
    /// consumer is draining it.
    pub fn feed(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.touch();
        self.read_ring.write(data)
    }

    pub fn peek(&self, dst: &mut [u8]) -> bool {
        self.read_ring.peek(dst)
    }

    pub fn peek_out(&self) -> Vec<u8> {
        self.read_ring.peek_out()
    }

    pub fn view(&self, n: usize) -> Option<(&[u8], &[u8])> {
        self.read_ring.view(n)
    }

    pub fn advance_read(&mut self, n: usize) {
        self.read_ring.advance(n);
    }

    pub fn read_len(&self) -> usize {
        self.read_ring.length()
    }

    /// Queues `data` to be written. The caller is responsible for actually
    /// submitting a write against the bytes this makes visible via
    /// [`Peer::write_view`] — enqueueing alone does not submit anything.
    pub fn write_enqueue(&mut self, data: &[u8]) -> Result<usize, Error> {
        let n = self.write_ring.write(data)?;
        self.queued_bytes += n;
        Ok(n)
    }

    /// A contiguous-or-split view of the next `n` queued write bytes,
    /// suitable for handing to [`crate::driver::RingDriver::write`]. The
    /// caller must bump `inflight_writes` before submitting, since the
    /// submission will point directly into this peer's memory.
    pub fn write_view(&self, n: usize) -> Option<(&[u8], &[u8])> {
        self.write_ring.view(n)
    }

    pub fn write_queued_len(&self) -> usize {
        self.queued_bytes
    }

    pub fn begin_write(&mut self) {
        self.inflight_writes += 1;
    }

    /// Call once a submitted write's completion has been observed
    /// successfully, advancing the write ring by the bytes the kernel
    /// actually accepted and releasing one in-flight slot.
    pub fn complete_write(&mut self, bytes_written: usize) {
        self.write_ring.advance(bytes_written);
        self.queued_bytes = self.queued_bytes.saturating_sub(bytes_written);
        self.inflight_writes = self.inflight_writes.saturating_sub(1);
        trace!(
            "fd {}: write completed {bytes_written} bytes, {} still queued",
            self.fd,
            self.queued_bytes
        );
    }

    /// Call when a submitted write's completion failed; the peer is about
    /// to be closed, so the ring state doesn't matter beyond releasing the
    /// in-flight slot so teardown can proceed.
    pub fn fail_write(&mut self) {
        self.inflight_writes = self.inflight_writes.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_peer_starts_in_new_state_with_no_inflight_writes() {
        let peer = Peer::new(3, None, None);
        assert_eq!(peer.status(), ConnState::New);
        assert_eq!(peer.inflight_writes(), 0);
        assert!(!peer.can_be_reclaimed());
    }

    #[test]
    fn feed_then_peek_round_trips_and_advance_drains() {
        let mut peer = Peer::new(3, None, None);
        peer.feed(b"hello").unwrap();
        assert_eq!(peer.read_len(), 5);
        let out = peer.peek_out();
        assert_eq!(out, b"hello");
        peer.advance_read(5);
        assert_eq!(peer.read_len(), 0);
    }

    #[test]
    fn write_enqueue_tracks_queued_bytes_until_completion() {
        let mut peer = Peer::new(3, None, None);
        peer.write_enqueue(b"abc").unwrap();
        assert_eq!(peer.write_queued_len(), 3);

        peer.begin_write();
        assert_eq!(peer.inflight_writes(), 1);

        peer.complete_write(3);
        assert_eq!(peer.write_queued_len(), 0);
        assert_eq!(peer.inflight_writes(), 0);
    }

    #[test]
    fn idle_peer_returns_to_active_on_touch() {
        let mut peer = Peer::new(3, None, None);
        peer.set_status(ConnState::Idle);
        peer.touch();
        assert_eq!(peer.status(), ConnState::Active);
    }

    #[test]
    fn closed_peer_with_inflight_write_cannot_be_reclaimed() {
        let mut peer = Peer::new(3, None, None);
        peer.begin_write();
        peer.set_status(ConnState::Closed);
        assert!(!peer.can_be_reclaimed());
        peer.complete_write(0);
        assert!(peer.can_be_reclaimed());
    }
}
