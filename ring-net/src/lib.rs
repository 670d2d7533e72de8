// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A single-threaded, io_uring-backed TCP/UDP network engine.
//!
//! The pieces, bottom-up: [`ringbuf`] is the plain byte ring every peer's
//! read and write sides are built from; [`buffer_group`] is the
//! kernel-provided buffer ring reads are satisfied out of; [`driver`] owns
//! the `io_uring` instance and exposes the handful of operations this
//! engine submits; [`dispatcher`] turns raw completions into typed
//! [`dispatcher::NetEvent`]s; [`peer`] tracks one connection's buffers and
//! lifecycle; [`listener`] binds the one socket a server listens on; and
//! [`server`] ties all of it into the control loop applications drive
//! through the [`server::Transport`] trait.
//!
//! This crate is Linux-only — `io_uring` has no equivalent on other
//! platforms.

pub mod buffer_group;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod listener;
pub mod peer;
pub mod ringbuf;
pub mod server;
pub mod tag;
pub mod transports;

pub use dispatcher::{EventDispatcher, NetEvent};
pub use driver::RingDriver;
pub use error::Error;
pub use listener::{BoundSocket, Proto};
pub use peer::{ConnState, Peer};
pub use ringbuf::RingBuffer;
pub use server::{NetworkServer, Transport};
pub use transports::{EchoTransport, FramedTransport};
