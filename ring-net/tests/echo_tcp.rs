// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ring_net::error::Error;
use ring_net::listener::BoundSocket;
use ring_net::peer::Peer;
use ring_net::server::{NetworkServer, Transport};

struct Echo;

impl Transport for Echo {
    fn on_connect(&mut self, _peer: &Peer) -> Result<(), Error> {
        Ok(())
    }

    fn on_data(&mut self, peer: &mut Peer) -> Result<(), Error> {
        let n = peer.read_len();
        let data = peer.peek_out();
        peer.advance_read(n);
        peer.write_enqueue(&data)?;
        Ok(())
    }

    fn on_disconnect(&mut self, _peer: &Peer) {}
}

fn spawn_echo_server() -> (SocketAddr, Arc<AtomicBool>) {
    let socket = BoundSocket::bind_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = socket.local_addr();
    let mut server = NetworkServer::new(socket, Echo).unwrap();
    let shutdown = server.shutdown_handle();

    std::thread::spawn(move || {
        server.serve(Duration::from_secs(5)).unwrap();
    });

    (addr, shutdown)
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
fn echoes_back_exactly_what_was_sent() {
    let (addr, shutdown) = spawn_echo_server();
    let mut stream = wait_for_server(addr);

    stream.write_all(b"hello ring").unwrap();

    let mut buf = [0u8; 10];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello ring");

    shutdown.store(true, Ordering::Release);
}

#[test]
fn handles_several_small_writes_as_one_stream() {
    let (addr, shutdown) = spawn_echo_server();
    let mut stream = wait_for_server(addr);

    for chunk in [&b"ab"[..], &b"cd"[..], &b"ef"[..]] {
        stream.write_all(chunk).unwrap();
    }

    let mut buf = [0u8; 6];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"abcdef");

    shutdown.store(true, Ordering::Release);
}

#[test]
fn two_concurrent_connections_do_not_cross_talk() {
    let (addr, shutdown) = spawn_echo_server();
    let mut a = wait_for_server(addr);
    let mut b = TcpStream::connect(addr).unwrap();

    a.write_all(b"from-a").unwrap();
    b.write_all(b"from-b").unwrap();

    let mut out_a = [0u8; 6];
    let mut out_b = [0u8; 6];
    a.read_exact(&mut out_a).unwrap();
    b.read_exact(&mut out_b).unwrap();

    assert_eq!(&out_a, b"from-a");
    assert_eq!(&out_b, b"from-b");

    shutdown.store(true, Ordering::Release);
}
