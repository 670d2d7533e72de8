// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Two small [`crate::server::Transport`] implementations demonstrating the
//! engine end to end: a byte-for-byte echo, and a length-prefixed framing
//! protocol grounded in `transport/protocol/protocol.go` from the source
//! this design was distilled from.

use log::{info, warn};

use crate::error::Error;
use crate::peer::Peer;
use crate::server::Transport;

/// Echoes every byte it receives straight back, unexamined. Generalized
/// from the teacher's `null_procedure` handler, which did the RPC-call
/// equivalent of this for exactly one call rather than a standing stream.
pub struct EchoTransport;

impl Transport for EchoTransport {
    fn on_connect(&mut self, peer: &Peer) -> Result<(), Error> {
        info!("session {} connected from {:?}", peer.session_id(), peer.remote_addr());
        Ok(())
    }

    fn on_data(&mut self, peer: &mut Peer) -> Result<(), Error> {
        let n = peer.read_len();
        if n == 0 {
            return Ok(());
        }
        let data = peer.peek_out();
        peer.advance_read(n);
        peer.write_enqueue(&data)?;
        Ok(())
    }

    fn on_disconnect(&mut self, peer: &Peer) {
        info!("session {} disconnected", peer.session_id());
    }
}

pub const FRAME_MAGIC: u16 = 0x616F;
pub const FRAME_HEADER_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 1,
    Control = 2,
    Heartbeat = 3,
}

impl FrameType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Data),
            2 => Some(Self::Control),
            3 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// A length-prefixed framing transport: `magic(2) | type(1) | len(4 be) |
/// payload`. Echoes each complete frame's payload back under the same
/// type, reassembling frames that arrive split across several reads —
/// the `NeedHeader -> NeedPayload -> Ready` automaton this engine's
/// framing layer is built around.
#[derive(Default)]
pub struct FramedTransport;

impl Transport for FramedTransport {
    fn on_connect(&mut self, peer: &Peer) -> Result<(), Error> {
        info!("session {} connected (framed)", peer.session_id());
        Ok(())
    }

    fn on_data(&mut self, peer: &mut Peer) -> Result<(), Error> {
        loop {
            if peer.read_len() < FRAME_HEADER_LEN {
                return Ok(());
            }

            let mut header = [0u8; FRAME_HEADER_LEN];
            peer.peek(&mut header);

            let magic = u16::from_be_bytes([header[0], header[1]]);
            if magic != FRAME_MAGIC {
                warn!("protocol violation: bad frame magic {magic:#x}");
                peer.advance_read(peer.read_len());
                return Ok(());
            }

            let Some(frame_type) = FrameType::from_u8(header[2]) else {
                warn!("protocol violation: unknown frame type {}", header[2]);
                peer.advance_read(peer.read_len());
                return Ok(());
            };

            let payload_len = u32::from_be_bytes([header[3], header[4], header[5], header[6]]) as usize;
            let total = FRAME_HEADER_LEN + payload_len;
            if peer.read_len() < total {
                return Ok(()); // NeedPayload: wait for the rest to arrive.
            }

            let frame = peer.view(total).map(|(a, b)| {
                let mut v = a.to_vec();
                v.extend_from_slice(b);
                v
            });
            peer.advance_read(total);

            if let Some(frame) = frame {
                let payload = &frame[FRAME_HEADER_LEN..];
                let mut reply = Vec::with_capacity(total);
                reply.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
                reply.push(frame_type as u8);
                reply.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                reply.extend_from_slice(payload);
                peer.write_enqueue(&reply)?;
            }
        }
    }

    fn on_disconnect(&mut self, peer: &Peer) {
        info!("session {} disconnected (framed)", peer.session_id());
    }
}
