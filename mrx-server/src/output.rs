// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! PCM output: per-channel frame assembly and the two sinks — an
//! in-process broadcast channel for attached consumers and a raw UDP
//! datagram stream for the network transport.
//!
//! The daemon emits normalized float PCM plus parameters; any further
//! encoding (Opus and friends) belongs to the transport.

use std::net::{SocketAddr, UdpSocket};

use mrx_protocol::Encoding;
use tokio::sync::broadcast;

/// One finished PCM frame with its stream parameters.
#[derive(Debug, Clone)]
pub struct PcmFrame {
    pub ssrc: u32,
    /// RTP-like media timestamp: count of channel frames since start.
    pub timestamp: u32,
    pub sequence: u16,
    pub samprate: u32,
    pub channels: u32,
    pub encoding: Encoding,
    pub pcm: Vec<f32>,
}

/// Samples per UDP datagram ceiling, keeping payloads under typical MTU.
const MAX_DGRAM_SAMPLES: usize = 480;

pub struct OutputStream {
    ssrc: u32,
    socket: Option<UdpSocket>,
    dest: Option<SocketAddr>,
    tx: broadcast::Sender<PcmFrame>,
    encoding: Encoding,
    channels: u32,
    samprate: u32,
    /// Channel frames per block; minpacket counts these.
    block_frames: usize,
    minpacket: u32,
    sequence: u16,
    timestamp: u32,
    accum: Vec<f32>,
    power_acc: f64,
    power_frames: u64,
    pub samples: u64,
    pub packets: u64,
    pub errors: u64,
}

impl OutputStream {
    pub fn new(
        ssrc: u32,
        dest: Option<SocketAddr>,
        encoding: Encoding,
        samprate: u32,
        channels: u32,
        block_frames: usize,
        minpacket: u32,
    ) -> Self {
        let socket = dest.and_then(|_| UdpSocket::bind("0.0.0.0:0").ok());
        let (tx, _rx) = broadcast::channel(32);
        Self {
            ssrc,
            socket,
            dest,
            tx,
            encoding,
            channels: channels.max(1),
            samprate,
            block_frames: block_frames.max(1),
            minpacket,
            sequence: 0,
            timestamp: 0,
            accum: Vec::new(),
            power_acc: 0.0,
            power_frames: 0,
            samples: 0,
            packets: 0,
            errors: 0,
        }
    }

    /// Subscribe to finished frames (the in-process consumer interface).
    pub fn subscribe(&self) -> broadcast::Receiver<PcmFrame> {
        self.tx.subscribe()
    }

    /// Mean output power of everything emitted since the last reset.
    pub fn mean_power(&self) -> f32 {
        if self.power_frames == 0 {
            0.0
        } else {
            (self.power_acc / self.power_frames as f64) as f32
        }
    }

    pub fn reset_power(&mut self) {
        self.power_acc = 0.0;
        self.power_frames = 0;
    }

    /// Append one block of PCM (interleaved when stereo) and emit frames
    /// once the minpacket aggregation threshold is met.
    pub fn push(&mut self, pcm: &[f32]) {
        if pcm.is_empty() {
            return;
        }
        self.accum.extend_from_slice(pcm);
        let threshold = self.block_frames * self.minpacket.max(1) as usize * self.channels as usize;
        if self.accum.len() < threshold {
            return;
        }
        while !self.accum.is_empty() {
            let take = self
                .accum
                .len()
                .min(MAX_DGRAM_SAMPLES * self.channels as usize);
            let frame: Vec<f32> = self.accum.drain(..take).collect();
            self.emit(frame);
        }
    }

    /// Emit whatever is buffered, e.g. before a restart or at teardown.
    pub fn flush(&mut self) {
        if self.accum.is_empty() {
            return;
        }
        let frame: Vec<f32> = self.accum.drain(..).collect();
        self.emit(frame);
    }

    fn emit(&mut self, pcm: Vec<f32>) {
        for &sample in &pcm {
            self.power_acc += (sample * sample) as f64;
        }
        self.power_frames += pcm.len() as u64;
        self.samples += pcm.len() as u64;

        if let (Some(socket), Some(dest)) = (&self.socket, self.dest) {
            let payload = encode_payload(&pcm, self.encoding);
            if socket.send_to(&payload, dest).is_err() {
                self.errors += 1;
            }
        }
        self.packets += 1;

        let frames = pcm.len() as u32 / self.channels;
        let frame = PcmFrame {
            ssrc: self.ssrc,
            timestamp: self.timestamp,
            sequence: self.sequence,
            samprate: self.samprate,
            channels: self.channels,
            encoding: self.encoding,
            pcm,
        };
        let _ = self.tx.send(frame);
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(frames);
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }
}

/// Serialize PCM for the wire. Opus and None fall back to float; the
/// transport owns real encoding.
fn encode_payload(pcm: &[f32], encoding: Encoding) -> Vec<u8> {
    match encoding {
        Encoding::S16Be => pcm
            .iter()
            .flat_map(|&s| {
                let v = (s.clamp(-1.0, 1.0) * 32_767.0) as i16;
                v.to_be_bytes()
            })
            .collect(),
        Encoding::S16Le => pcm
            .iter()
            .flat_map(|&s| {
                let v = (s.clamp(-1.0, 1.0) * 32_767.0) as i16;
                v.to_le_bytes()
            })
            .collect(),
        Encoding::F32Le | Encoding::Opus | Encoding::None => {
            pcm.iter().flat_map(|&s| s.to_le_bytes()).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(minpacket: u32) -> OutputStream {
        OutputStream::new(17, None, Encoding::S16Be, 24_000, 1, 480, minpacket)
    }

    #[test]
    fn test_emits_after_one_block_by_default() {
        let mut out = stream(0);
        let mut rx = out.subscribe();
        out.push(&vec![0.5; 480]);
        let frame = rx.try_recv().expect("frame after one block");
        assert_eq!(frame.pcm.len(), 480);
        assert_eq!(frame.sequence, 0);
        assert_eq!(out.packets, 1);
    }

    #[test]
    fn test_minpacket_aggregates_blocks() {
        let mut out = stream(2);
        let mut rx = out.subscribe();
        out.push(&vec![0.1; 480]);
        assert!(rx.try_recv().is_err(), "first block must be held back");
        out.push(&vec![0.1; 480]);
        let frame = rx.try_recv().expect("two blocks aggregated");
        assert_eq!(frame.pcm.len() + rx.try_recv().map(|f| f.pcm.len()).unwrap_or(0), 960);
    }

    #[test]
    fn test_flush_drains_partial_block() {
        let mut out = stream(4);
        let mut rx = out.subscribe();
        out.push(&vec![0.2; 100]);
        out.flush();
        let frame = rx.try_recv().expect("flush emits remainder");
        assert_eq!(frame.pcm.len(), 100);
    }

    #[test]
    fn test_timestamp_advances_by_frames() {
        let mut out = OutputStream::new(1, None, Encoding::F32Le, 48_000, 2, 240, 0);
        out.push(&vec![0.0; 480]); // 240 stereo frames
        assert_eq!(out.timestamp(), 240);
    }

    #[test]
    fn test_s16be_payload_layout() {
        let payload = encode_payload(&[1.0, -1.0], Encoding::S16Be);
        assert_eq!(payload.len(), 4);
        assert_eq!(i16::from_be_bytes([payload[0], payload[1]]), 32_767);
        assert_eq!(i16::from_be_bytes([payload[2], payload[3]]), -32_767);
    }

    #[test]
    fn test_mean_power_tracks_output() {
        let mut out = stream(0);
        out.push(&vec![0.5; 480]);
        assert!((out.mean_power() - 0.25).abs() < 1e-6);
        out.reset_power();
        assert_eq!(out.mean_power(), 0.0);
    }
}
