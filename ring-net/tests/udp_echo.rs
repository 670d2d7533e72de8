// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use ring_net::listener::BoundSocket;
use ring_net::server::NetworkServer;
use ring_net::transports::EchoTransport;

fn spawn_udp_echo_server() -> SocketAddr {
    let socket = BoundSocket::bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = socket.local_addr();
    let mut server = NetworkServer::new(socket, EchoTransport).unwrap();

    std::thread::spawn(move || {
        server.serve(Duration::from_secs(5)).unwrap();
    });

    addr
}

#[test]
fn a_datagram_is_echoed_back_to_its_sender() {
    let addr = spawn_udp_echo_server();
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    client.send_to(b"ping", addr).unwrap();

    let mut buf = [0u8; 32];
    let (n, from) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from, addr);
}

#[test]
fn two_datagrams_from_different_clients_each_get_their_own_reply() {
    let addr = spawn_udp_echo_server();
    let a = UdpSocket::bind("127.0.0.1:0").unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").unwrap();
    a.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    b.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    a.send_to(b"from-a", addr).unwrap();
    b.send_to(b"from-b", addr).unwrap();

    let mut buf_a = [0u8; 32];
    let (n, _) = a.recv_from(&mut buf_a).unwrap();
    assert_eq!(&buf_a[..n], b"from-a");

    let mut buf_b = [0u8; 32];
    let (n, _) = b.recv_from(&mut buf_b).unwrap();
    assert_eq!(&buf_b[..n], b"from-b");
}
