// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use ring_net::listener::BoundSocket;
use ring_net::server::NetworkServer;
use ring_net::transports::EchoTransport;

fn spawn_server() -> SocketAddr {
    let socket = BoundSocket::bind_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = socket.local_addr();
    let mut server = NetworkServer::new(socket, EchoTransport).unwrap();

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

/// Hammers the server with enough concurrent reads to put real pressure
/// on the shared provided-buffer group (1024 slots by default). This
/// can't deterministically force the kernel to report `ENOBUFS` — that
/// depends on scheduling — but it exercises the code path the dispatcher
/// takes when a read's buffer-selected completion can't be satisfied, via
/// sheer concurrency, and confirms the server keeps serving afterward
/// either way.
#[test]
fn many_concurrent_connections_surviving_a_write_burst_stay_healthy() {
    let addr = spawn_server();

    let handles: Vec<_> = (0..64)
        .map(|i| {
            std::thread::spawn(move || {
                let mut stream = wait_for_server(addr);
                let payload = format!("burst-{i}").into_bytes();
                stream.write_all(&payload).unwrap();
                let mut out = vec![0u8; payload.len()];
                stream.read_exact(&mut out).unwrap();
                assert_eq!(out, payload);
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    // The server should still accept new work after the burst.
    let mut stream = wait_for_server(addr);
    stream.write_all(b"after-burst").unwrap();
    let mut out = vec![0u8; "after-burst".len()];
    stream.read_exact(&mut out).unwrap();
    assert_eq!(out, b"after-burst");
}
