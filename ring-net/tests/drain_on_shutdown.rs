// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use ring_net::listener::BoundSocket;
use ring_net::server::NetworkServer;
use ring_net::transports::EchoTransport;

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
fn shutdown_drains_queued_writes_instead_of_cutting_them_off() {
    let socket = BoundSocket::bind_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = socket.local_addr();
    let mut server = NetworkServer::new(socket, EchoTransport).unwrap();
    let shutdown = server.shutdown_handle();

    let handle = std::thread::spawn(move || {
        server.serve(Duration::from_secs(10)).unwrap();
    });

    let mut stream = wait_for_server(addr);
    stream.write_all(b"drain me").unwrap();

    // Signal shutdown immediately after sending, racing the reply.
    shutdown.store(true, Ordering::Release);

    let mut out = vec![0u8; "drain me".len()];
    stream.read_exact(&mut out).unwrap();
    assert_eq!(out, b"drain me");

    let started = Instant::now();
    handle.join().unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "serve() should return once drained, well before the deadline"
    );
}
