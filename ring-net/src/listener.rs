// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::Error;

/// Default TCP listen backlog (§4.6, §6).
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Which transport a [`BoundSocket`] was bound for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

/// A bound, listening (TCP) or bound (UDP) socket, reduced to the one thing
/// the ring driver needs from it: a raw file descriptor to submit
/// operations against.
///
/// Construction goes through `socket2` rather than `std::net::TcpListener::
/// bind`/`UdpSocket::bind` directly, since §4.6 calls for address-reuse and
/// an explicit listen backlog — options `std::net`'s bind helpers don't
/// expose. `socket2::Socket` is the options surface; the finished socket is
/// converted into the matching `std::net` type so the fd keeps its normal
/// RAII close-on-drop behavior, the same split the teacher's siblings use
/// `nix`/`libc` for the calls `std::net` doesn't cover.
pub struct BoundSocket {
    proto: Proto,
    local_addr: SocketAddr,
    // Kept alive so the fd isn't closed out from under the ring driver;
    // never read from or written to directly once `fd()` is submitted.
    _tcp: Option<TcpListener>,
    _udp: Option<UdpSocket>,
}

impl BoundSocket {
    pub fn bind_tcp(addr: SocketAddr) -> Result<Self, Error> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(Error::SetupFatal)?;
        socket.set_reuse_address(true).map_err(Error::SetupFatal)?;
        socket.bind(&addr.into()).map_err(Error::SetupFatal)?;
        socket.listen(DEFAULT_BACKLOG).map_err(Error::SetupFatal)?;

        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr().map_err(Error::SetupFatal)?;
        Ok(Self {
            proto: Proto::Tcp,
            local_addr,
            _tcp: Some(listener),
            _udp: None,
        })
    }

    pub fn bind_udp(addr: SocketAddr) -> Result<Self, Error> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(Error::SetupFatal)?;
        socket.set_reuse_address(true).map_err(Error::SetupFatal)?;
        socket.bind(&addr.into()).map_err(Error::SetupFatal)?;

        let udp: UdpSocket = socket.into();
        let local_addr = udp.local_addr().map_err(Error::SetupFatal)?;
        Ok(Self {
            proto: Proto::Udp,
            local_addr,
            _tcp: None,
            _udp: Some(udp),
        })
    }

    pub fn proto(&self) -> Proto {
        self.proto
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn fd(&self) -> RawFd {
        match (&self._tcp, &self._udp) {
            (Some(t), None) => t.as_raw_fd(),
            (None, Some(u)) => u.as_raw_fd(),
            _ => unreachable!("a BoundSocket always holds exactly one of tcp/udp"),
        }
    }
}
