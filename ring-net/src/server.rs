// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::sys::socket::{getpeername, getsockname, SockaddrStorage};

use crate::dispatcher::{EventDispatcher, NetEvent};
use crate::driver::{RingDriver, DEFAULT_RING_ENTRIES};
use crate::error::Error;
use crate::listener::{BoundSocket, Proto};
use crate::peer::{ConnState, Peer};
use crate::tag::{self, EventKind};

/// How long [`NetworkServer::serve`] waits for in-flight writes to drain
/// after a shutdown signal before closing connections out from under them
/// (§6).
pub const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// How long a `wait()` call blocks the event loop when there is otherwise
/// nothing to do, bounding how quickly the loop notices a shutdown signal.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

const COMPLETION_BATCH: usize = 256;

/// Period of the ring-driven tick that sweeps peers into `idle` (§4.5, §5).
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// How long a peer may sit with no read/write activity before a tick marks
/// it `idle`. Not specified by name anywhere upstream; chosen generously
/// relative to `IDLE_SWEEP_INTERVAL` so a peer gets several sweeps of grace.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// The sole interface between this crate's event loop and application
/// logic (§6). Implementations never see raw completions, fds, or ring
/// buffers directly beyond what `Peer`'s accessor methods expose.
pub trait Transport {
    /// Inspect a newly accepted peer before it is registered for reads.
    /// Returning `Err` rejects the connection (§4.7): the caller drops the
    /// fd from the registry and never arms a read on it.
    fn on_connect(&mut self, peer: &Peer) -> Result<(), Error>;

    /// Called once new bytes have been appended to `peer`'s read ring.
    /// Implementations consume what they understand via `peer.view`/`peek`
    /// and `peer.advance_read`, and queue replies via `peer.write_enqueue`;
    /// [`NetworkServer`] notices the newly queued bytes and submits them.
    fn on_data(&mut self, peer: &mut Peer) -> Result<(), Error>;

    fn on_disconnect(&mut self, peer: &Peer);
}

/// The server's own lifecycle (§4.5, distinct from a single peer's
/// [`ConnState`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerStatus {
    Running,
    Draining,
    Stopped,
}

/// Drives one io_uring-backed event loop over one bound socket (§4, §6).
///
/// Single-threaded and cooperative: everything from accept through
/// teardown happens on the thread that calls [`NetworkServer::serve`],
/// with the one suspension point being the call into [`RingDriver::wait`].
pub struct NetworkServer<T: Transport> {
    driver: RingDriver,
    dispatcher: EventDispatcher,
    listener: BoundSocket,
    peers: HashMap<RawFd, Peer>,
    transport: T,
    shutdown: Arc<AtomicBool>,
    status: ServerStatus,
}

impl<T: Transport> NetworkServer<T> {
    pub fn new(listener: BoundSocket, transport: T) -> Result<Self, Error> {
        Self::with_entries(listener, transport, DEFAULT_RING_ENTRIES)
    }

    pub fn with_entries(listener: BoundSocket, transport: T, ring_entries: u32) -> Result<Self, Error> {
        Ok(Self {
            driver: RingDriver::new(ring_entries)?,
            dispatcher: EventDispatcher::new(),
            listener,
            peers: HashMap::new(),
            transport,
            shutdown: Arc::new(AtomicBool::new(false)),
            status: ServerStatus::Running,
        })
    }

    /// A clone of the shutdown flag this server polls every loop
    /// iteration. A caller wires SIGINT/SIGTERM (or any other condition)
    /// to set it, which starts the drain-then-stop sequence (§6).
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Runs the event loop until the shutdown handle is set and either
    /// every peer has drained or `drain_deadline` elapses, whichever comes
    /// first.
    ///
    /// Only setup-fatal conditions — failing to arm the initial
    /// accept/recvmsg or the periodic tick, or a driver-level I/O error out
    /// of `wait`/`peek_batch` — return `Err` and end `serve` early. Every
    /// per-event error (a bad peer, a full write ring, a transport
    /// failure) is handled inline by [`Self::handle_event`] and never
    /// reaches here (§7).
    pub fn serve(&mut self, drain_deadline: Duration) -> Result<(), Error> {
        let listening_fd = self.listener.fd();
        match self.listener.proto() {
            Proto::Tcp => self.driver.accept_multishot(listening_fd)?,
            Proto::Udp => self.driver.recvmsg(listening_fd)?,
        }
        self.driver.timeout_multishot(IDLE_SWEEP_INTERVAL, listening_fd)?;

        info!(
            "serving {:?} on {} (fd {listening_fd})",
            self.listener.proto(),
            self.listener.local_addr()
        );

        let mut drain_deadline_at: Option<Instant> = None;

        loop {
            // §4.5's pseudocode drains whatever is already available before
            // looking at cancellation, so a completion that arrived just
            // before a shutdown signal still gets handled this iteration
            // instead of racing the drain-entry peer sweep below.
            let mut had_events = false;
            loop {
                let batch = match self.driver.peek_batch(COMPLETION_BATCH) {
                    Ok(b) => b,
                    Err(Error::WouldBlock) => break,
                    Err(e) => return Err(e),
                };
                had_events = true;

                for cqe in batch {
                    if let Some(event) = self.dispatcher.translate(&mut self.driver, cqe) {
                        self.handle_event(listening_fd, event);
                    }
                }
            }
            self.reap_closed_peers();

            if self.status == ServerStatus::Running && self.shutdown.load(Ordering::Acquire) {
                info!("shutdown requested, entering drain");
                self.begin_drain(listening_fd);
                drain_deadline_at = Some(Instant::now() + drain_deadline);
            }

            if self.status == ServerStatus::Draining {
                if self.peers.is_empty() {
                    info!("all peers drained, stopping");
                    self.status = ServerStatus::Stopped;
                    return Ok(());
                }
                if drain_deadline_at.is_some_and(|at| Instant::now() >= at) {
                    warn!("drain deadline exceeded, closing {} remaining peer(s)", self.peers.len());
                    self.status = ServerStatus::Stopped;
                    return Ok(());
                }
            }

            if !had_events {
                match self.driver.wait(Some(POLL_INTERVAL)) {
                    Ok(()) => {}
                    Err(Error::WouldBlock) => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }

    /// Transitions into the drain state (§4.5): cancels the outstanding
    /// accept (TCP) or stops resubmitting recvmsg (UDP) so no new work is
    /// accepted, then closes any peer that already has nothing in flight.
    /// Peers still mid-exchange are left running and picked up by
    /// [`Self::close_if_drain_quiescent`] or the next [`Self::tick`] as
    /// they quiesce, until `drain_deadline` forces the issue in `serve`.
    fn begin_drain(&mut self, listening_fd: RawFd) {
        self.status = ServerStatus::Draining;

        if self.listener.proto() == Proto::Tcp {
            let accept_tag = tag::encode(EventKind::Accept, listening_fd);
            if let Err(e) = self.driver.cancel(accept_tag, listening_fd) {
                warn!("failed to cancel outstanding accept during drain: {e}");
            }
        }

        let quiescent: Vec<RawFd> = self
            .peers
            .iter()
            .filter(|(_, p)| p.write_queued_len() == 0 && p.inflight_writes() == 0)
            .map(|(fd, _)| *fd)
            .collect();
        for fd in quiescent {
            self.close_peer(fd);
        }
        self.reap_closed_peers();
    }

    /// Closes `fd` immediately if draining and it has no work left in
    /// flight — the "peers that complete naturally during drain are
    /// closed as they become idle" half of §4.5, checked right where a
    /// peer's queue empties rather than waiting for the next tick.
    fn close_if_drain_quiescent(&mut self, fd: RawFd) {
        if self.status != ServerStatus::Draining {
            return;
        }
        let quiescent = self
            .peers
            .get(&fd)
            .is_some_and(|p| p.write_queued_len() == 0 && p.inflight_writes() == 0);
        if quiescent {
            self.close_peer(fd);
        }
    }

    /// Driven by the periodic ring timeout (`NetEvent::Timeout`). Sweeps
    /// peers with no recent activity into `ConnState::Idle`; while
    /// draining, also closes every currently idle peer, so a quiet
    /// connection doesn't sit around until the drain deadline.
    fn tick(&mut self) {
        let now = Instant::now();
        let stale: Vec<RawFd> = self
            .peers
            .iter()
            .filter(|(_, p)| {
                p.status() == ConnState::Active
                    && p.write_queued_len() == 0
                    && p.inflight_writes() == 0
                    && now.duration_since(p.last_active()) >= IDLE_TIMEOUT
            })
            .map(|(fd, _)| *fd)
            .collect();
        for fd in &stale {
            if let Some(peer) = self.peers.get(fd) {
                peer.set_status(ConnState::Idle);
            }
        }

        if self.status == ServerStatus::Draining {
            let idle: Vec<RawFd> = self
                .peers
                .iter()
                .filter(|(_, p)| p.status() == ConnState::Idle)
                .map(|(fd, _)| *fd)
                .collect();
            for fd in idle {
                self.close_peer(fd);
            }
            self.reap_closed_peers();
        }
    }

    fn reap_closed_peers(&mut self) {
        let dead: Vec<RawFd> = self
            .peers
            .iter()
            .filter(|(_, p)| p.can_be_reclaimed())
            .map(|(fd, _)| *fd)
            .collect();

        for fd in dead {
            if let Some(peer) = self.peers.remove(&fd) {
                self.transport.on_disconnect(&peer);
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }

    /// Routes one translated completion. Nothing here returns an error:
    /// per §7, only setup-fatal conditions may end `serve`, so every
    /// recoverable failure (a full submission queue, a transport error, a
    /// bad peer) is logged and contained to the offending peer or
    /// operation right where it happens.
    fn handle_event(&mut self, listening_fd: RawFd, event: NetEvent) {
        match event {
            NetEvent::Accept { new_fd, more } => {
                self.handle_accept(new_fd);
                if !more {
                    self.rearm_accept(listening_fd);
                }
            }
            NetEvent::AcceptError { errno, more } => {
                warn!("accept on fd {listening_fd} failed: {errno}");
                if !more {
                    self.rearm_accept(listening_fd);
                }
            }
            NetEvent::Read { fd, bytes, more } => self.handle_read(fd, &bytes, more),
            NetEvent::ReadError { fd, errno } => {
                debug!("fd {fd}: read failed: {errno}");
                self.close_peer(fd);
            }
            NetEvent::ReadClosed { fd } => {
                debug!("fd {fd}: peer closed the connection");
                self.close_peer(fd);
            }
            NetEvent::BufferStarvation { fd } => {
                warn!("fd {fd}: provided buffer group starved, re-arming read");
                self.rearm_read(fd);
            }
            NetEvent::Recvmsg { bytes, from, .. } => self.handle_recvmsg(listening_fd, &bytes, from),
            NetEvent::RecvmsgError { fd, errno } => {
                warn!("fd {fd}: recvmsg failed: {errno}");
                self.rearm_recvmsg(listening_fd);
            }
            NetEvent::WriteDone { fd, bytes_written } => self.handle_write_done(fd, bytes_written),
            NetEvent::WriteError { fd, errno } => {
                debug!("fd {fd}: write failed: {errno}");
                if let Some(peer) = self.peers.get_mut(&fd) {
                    peer.fail_write();
                }
                self.close_peer(fd);
            }
            NetEvent::Timeout => self.tick(),
        }
    }

    fn handle_accept(&mut self, new_fd: RawFd) {
        if self.status == ServerStatus::Draining {
            debug!("fd {new_fd}: rejecting accept, server is draining");
            unsafe {
                libc::close(new_fd);
            }
            return;
        }

        let local = sockaddr_of(getsockname::<SockaddrStorage>(new_fd));
        let remote = sockaddr_of(getpeername::<SockaddrStorage>(new_fd));

        let peer = Peer::new(new_fd, local, remote);
        debug!("accepted fd {new_fd} from {remote:?} (session {})", peer.session_id());

        if let Err(e) = self.transport.on_connect(&peer) {
            debug!("fd {new_fd}: transport rejected connection: {e}");
            unsafe {
                libc::close(new_fd);
            }
            return;
        }
        peer.set_status(ConnState::Active);

        if let Err(e) = self.driver.read_multishot(new_fd) {
            warn!("fd {new_fd}: failed to arm read, dropping connection: {e}");
            self.transport.on_disconnect(&peer);
            unsafe {
                libc::close(new_fd);
            }
            return;
        }

        self.peers.insert(new_fd, peer);
    }

    fn handle_read(&mut self, fd: RawFd, bytes: &[u8], more: bool) {
        let Some(peer) = self.peers.get_mut(&fd) else {
            return;
        };

        if peer.feed(bytes).is_err() {
            warn!("fd {fd}: read ring overflowed, closing peer");
            self.close_peer(fd);
            return;
        }

        if let Err(e) = self.transport.on_data(peer) {
            debug!("fd {fd}: transport error, closing peer: {e}");
            self.close_peer(fd);
            return;
        }

        self.flush_pending_write(fd);
        self.close_if_drain_quiescent(fd);

        // The completion that just delivered data was also the multishot's
        // last: re-arm even though this wasn't the zero-byte EOF case (§4.2).
        if !more {
            self.rearm_read(fd);
        }
    }

    /// Re-arms the listener's multishot accept once it has terminated
    /// (`more` unset on an accept completion, successful or not), unless
    /// the server is draining — draining cancels the outstanding accept on
    /// purpose and must not immediately resubmit a fresh one (§4.2, §4.5,
    /// §7: "on accept it is logged and the listener is re-armed").
    fn rearm_accept(&mut self, listening_fd: RawFd) {
        if self.status == ServerStatus::Draining {
            return;
        }
        if let Err(e) = self.driver.accept_multishot(listening_fd) {
            warn!("fd {listening_fd}: failed to re-arm accept: {e}");
        }
    }

    /// Re-arms a multishot read that terminated (no error, not EOF) or was
    /// starved of provided buffers. A peer that can't be re-armed can never
    /// receive another byte, so a failed resubmission closes it rather than
    /// leaving it silently stalled.
    fn rearm_read(&mut self, fd: RawFd) {
        let Some(peer) = self.peers.get(&fd) else {
            return;
        };
        if peer.status() == ConnState::Closed {
            return;
        }
        if let Err(e) = self.driver.read_multishot(fd) {
            warn!("fd {fd}: failed to re-arm read, closing: {e}");
            self.close_peer(fd);
        }
    }

    /// Re-arms the listener's single-shot recvmsg, unless the server is
    /// draining — draining means refusing new datagrams the same way it
    /// refuses new TCP accepts.
    fn rearm_recvmsg(&mut self, listening_fd: RawFd) {
        if self.status == ServerStatus::Draining {
            return;
        }
        if let Err(e) = self.driver.recvmsg(listening_fd) {
            warn!("failed to re-arm recvmsg on fd {listening_fd}: {e}");
        }
    }

    fn handle_recvmsg(&mut self, listening_fd: RawFd, bytes: &[u8], from: Option<SocketAddr>) {
        // UDP has no persistent connection, so each datagram gets an
        // ephemeral Peer keyed by the listening fd's one socket; the
        // Transport still sees a uniform on_connect/on_data/on_disconnect
        // shape per datagram, matching how the source material's
        // `Application` interface treats connectionless transports.
        let mut peer = Peer::new(listening_fd, Some(self.listener.local_addr()), from);

        if let Err(e) = self.transport.on_connect(&peer) {
            debug!("datagram from {from:?} rejected by transport: {e}");
            self.rearm_recvmsg(listening_fd);
            return;
        }

        if let Err(e) = peer.feed(bytes) {
            warn!("datagram from {from:?} dropped, read ring rejected it: {e}");
        } else if let Err(e) = self.transport.on_data(&mut peer) {
            debug!("datagram from {from:?}: transport error, dropping reply: {e}");
        } else if peer.write_queued_len() > 0 {
            if let Some((a, b)) = peer.write_view(peer.write_queued_len()) {
                let mut payload = a.to_vec();
                payload.extend_from_slice(b);
                if let Err(e) = self.send_udp_reply(listening_fd, &payload, from) {
                    warn!("failed to send UDP reply to {from:?}: {e}");
                }
            }
        }

        self.transport.on_disconnect(&peer);
        self.rearm_recvmsg(listening_fd);
    }

    fn send_udp_reply(&self, fd: RawFd, payload: &[u8], to: Option<SocketAddr>) -> Result<(), Error> {
        let Some(to) = to else {
            warn!("fd {fd}: dropping UDP reply with no known source address");
            return Ok(());
        };
        // A one-off sendto rather than a ring submission: UDP replies here
        // are small and infrequent relative to the accept/read hot path
        // this engine's ring API is built around.
        let result = match to {
            SocketAddr::V4(v4) => {
                let sockaddr = nix::sys::socket::SockaddrIn::from(v4);
                nix::sys::socket::sendto(fd, payload, &sockaddr, nix::sys::socket::MsgFlags::empty())
            }
            SocketAddr::V6(v6) => {
                let sockaddr = nix::sys::socket::SockaddrIn6::from(v6);
                nix::sys::socket::sendto(fd, payload, &sockaddr, nix::sys::socket::MsgFlags::empty())
            }
        };
        result.map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        Ok(())
    }

    /// Submits the next queued write chunk for `fd`, if any and if none is
    /// already in flight. A submission failure (most likely `QueueFull`)
    /// is recoverable: the bytes stay queued and `begin_write`'s slot is
    /// released so the next read or write completion on this peer retries
    /// it, instead of tearing the peer down over transient backpressure.
    fn flush_pending_write(&mut self, fd: RawFd) {
        let Some(peer) = self.peers.get_mut(&fd) else {
            return;
        };
        // At most one write submission in flight per peer at a time: the
        // next chunk is only submitted once the previous completion
        // arrives, in `handle_write_done`. This keeps the write chain
        // ordered without needing IOSQE_IO_LINK (§9's skip-success open
        // question, resolved in favor of always observing completions).
        if peer.inflight_writes() > 0 || peer.write_queued_len() == 0 {
            return;
        }

        let len = peer.write_queued_len();
        // Only the first (possibly wrap-truncated) segment is submitted
        // per write; a queued chunk that straddles the ring's wraparound
        // drains over two completions instead of one. Simpler than
        // gathering a two-iovec writev for a case that's rare in practice.
        let Some((a, _)) = peer.write_view(len) else {
            return;
        };
        let chunk_len = a.len();
        let ptr = a.as_ptr();
        peer.begin_write();
        // SAFETY: `ptr`/`chunk_len` describe a window into this peer's
        // write ring, which stays allocated and unmoved until the peer is
        // torn down; `begin_write` records that a submission now depends
        // on it so teardown waits for the matching completion first.
        let slice = unsafe { std::slice::from_raw_parts(ptr, chunk_len) };
        if let Err(e) = self.driver.write(fd, slice) {
            warn!("fd {fd}: write submission failed, will retry: {e}");
            if let Some(peer) = self.peers.get_mut(&fd) {
                peer.fail_write();
            }
        }
    }

    fn handle_write_done(&mut self, fd: RawFd, bytes_written: usize) {
        if let Some(peer) = self.peers.get_mut(&fd) {
            peer.complete_write(bytes_written);
        }
        self.flush_pending_write(fd);
        self.close_if_drain_quiescent(fd);
    }

    fn close_peer(&mut self, fd: RawFd) {
        if let Some(peer) = self.peers.get(&fd) {
            peer.set_status(ConnState::Closed);
            // Stop the outstanding multishot read; its completions would
            // otherwise keep arriving for a peer no one is draining.
            let read_tag = tag::encode(EventKind::Read, fd);
            let _ = self.driver.cancel(read_tag, fd);
        }
    }
}

fn sockaddr_of(result: nix::Result<SockaddrStorage>) -> Option<SocketAddr> {
    let storage = result.ok()?;
    if let Some(v4) = storage.as_sockaddr_in() {
        Some(SocketAddr::V4(std::net::SocketAddrV4::new(
            std::net::Ipv4Addr::from(v4.ip()),
            v4.port(),
        )))
    } else if let Some(v6) = storage.as_sockaddr_in6() {
        Some(SocketAddr::V6(std::net::SocketAddrV6::new(
            v6.ip(),
            v6.port(),
            v6.flowinfo(),
            v6.scope_id(),
        )))
    } else {
        None
    }
}
