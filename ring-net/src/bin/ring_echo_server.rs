// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use nix::sys::signal::{self, SigHandler, Signal};

use ring_net::error::Error;
use ring_net::listener::BoundSocket;
use ring_net::server::{NetworkServer, Transport, DEFAULT_DRAIN_DEADLINE};
use ring_net::transports::{EchoTransport, FramedTransport};

#[derive(Parser, Debug)]
#[command(about = "An io_uring-backed TCP/UDP echo server")]
struct Cli {
    #[arg(long, alias = "address", default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(long, default_value_t = 8080)]
    port: u16,

    #[arg(long)]
    udp: bool,

    /// Speak the framed (magic/type/length) protocol instead of plain echo.
    #[arg(long)]
    framed: bool,

    #[arg(long)]
    debug: bool,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_: i32) {
    SHUTDOWN.store(true, Ordering::Release);
}

fn install_shutdown_handlers() {
    let handler = SigHandler::Handler(on_shutdown_signal);
    // SAFETY: the handler only stores to a static atomic, which is
    // async-signal-safe.
    unsafe {
        let _ = signal::signal(Signal::SIGINT, handler);
        let _ = signal::signal(Signal::SIGTERM, handler);
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let addr = SocketAddr::new(cli.host, cli.port);

    if cli.udp {
        let socket = BoundSocket::bind_udp(addr)?;
        info!("listening (udp) on {}", socket.local_addr());
        let mut server = NetworkServer::new(socket, EchoTransport)?;
        run_with_shutdown(&mut server)
    } else if cli.framed {
        let socket = BoundSocket::bind_tcp(addr)?;
        info!("listening (tcp, framed) on {}", socket.local_addr());
        let mut server = NetworkServer::new(socket, FramedTransport)?;
        run_with_shutdown(&mut server)
    } else {
        let socket = BoundSocket::bind_tcp(addr)?;
        info!("listening (tcp) on {}", socket.local_addr());
        let mut server = NetworkServer::new(socket, EchoTransport)?;
        run_with_shutdown(&mut server)
    }
}

fn run_with_shutdown<T: Transport>(server: &mut NetworkServer<T>) -> Result<(), Error> {
    let flag = server.shutdown_handle();
    std::thread::spawn(move || loop {
        if SHUTDOWN.load(Ordering::Acquire) {
            flag.store(true, Ordering::Release);
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    });
    server.serve(DEFAULT_DRAIN_DEADLINE)
}

fn main() {
    let cli = Cli::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if cli.debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    install_shutdown_handlers();

    if let Err(e) = run(cli) {
        error!("server exited with error: {e}");
        std::process::exit(1);
    }
}
