// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use ring_net::error::Error;
use ring_net::listener::BoundSocket;
use ring_net::peer::{Peer, DEFAULT_PEER_BUFFER_SIZE};
use ring_net::server::{NetworkServer, Transport};

/// Echoes back, but never drains its read ring past what it can also
/// queue to write — used to drive a peer's write ring to capacity and
/// observe that the engine reports [`Error::BufferFull`] rather than
/// silently growing or corrupting the ring.
struct OverflowProneEcho;

impl Transport for OverflowProneEcho {
    fn on_connect(&mut self, _peer: &Peer) -> Result<(), Error> {
        Ok(())
    }

    fn on_data(&mut self, peer: &mut Peer) -> Result<(), Error> {
        let n = peer.read_len();
        let data = peer.peek_out();
        peer.advance_read(n);
        // Intentionally ignore the BufferFull this produces once the
        // write ring (same default size as the read ring) is saturated by
        // a client that isn't reading its replies.
        let _ = peer.write_enqueue(&data);
        Ok(())
    }

    fn on_disconnect(&mut self, _peer: &Peer) {}
}

fn spawn_server() -> SocketAddr {
    let socket = BoundSocket::bind_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = socket.local_addr();
    let mut server = NetworkServer::new(socket, OverflowProneEcho).unwrap();

    std::thread::spawn(move || {
        server.serve(Duration::from_secs(5)).unwrap();
    });

    addr
}

fn wait_for_server(addr: SocketAddr) -> TcpStream {
    let mut attempts = 50;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return stream,
            Err(_) if attempts > 0 => {
                attempts -= 1;
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => panic!("could not connect to {addr}: {e}"),
        }
    }
}

#[test]
fn a_client_that_never_reads_its_replies_does_not_crash_the_server() {
    let addr = spawn_server();
    let mut stream = wait_for_server(addr);

    // Send well past the peer's write-ring capacity without ever reading
    // the echoed replies back out. The server must keep running (and keep
    // accepting new connections) rather than panicking on the resulting
    // BufferFull.
    let chunk = vec![b'x'; 4096];
    for _ in 0..(DEFAULT_PEER_BUFFER_SIZE / chunk.len() + 4) {
        if stream.write_all(&chunk).is_err() {
            break; // the kernel's own socket buffer filled; that's fine.
        }
    }

    // The server should still be alive: a fresh connection succeeds.
    let mut other = wait_for_server(addr);
    other.write_all(b"still alive").unwrap();
    let mut out = vec![0u8; "still alive".len()];
    other.read_exact(&mut out).unwrap();
    assert_eq!(out, b"still alive");
}
