// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::io;

/// The errors this crate's public API can return.
///
/// `setup-fatal` conditions (ring setup, mmap, buffer-ring registration,
/// listener bind/listen) are the only variant meant to propagate out of
/// [`crate::server::NetworkServer::serve`]; everything else is handled
/// inside the event loop.
#[derive(Debug)]
pub enum Error {
    /// Ring setup, memory mapping, buffer-ring registration, or listener
    /// bind/listen failed. Fatal: the caller should abort startup.
    SetupFatal(io::Error),

    /// The submission ring is saturated (`tail - head >= capacity`).
    /// Recoverable: the caller should back off or drop the operation.
    QueueFull,

    /// No completions are ready, or a timed wait expired. Expected, not an
    /// error condition worth logging above debug.
    WouldBlock,

    /// The peer's ring buffer could not hold the requested bytes.
    BufferFull,

    /// An I/O error not covered by the above.
    Io(io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetupFatal(e) => write!(f, "fatal setup error: {e}"),
            Self::QueueFull => write!(f, "submission queue is full"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::BufferFull => write!(f, "ring buffer is full"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
