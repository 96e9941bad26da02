// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! End-to-end tests: a live in-process daemon (synthesized frontend,
//! master FFT, workers, control thread) driven over loopback UDP with
//! the TLV protocol.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use num_complex::Complex;
use rustfft::FftPlanner;

use mrx_core::fft::{BlockBoard, InputDomain, MasterFft, MasterFftParams};
use mrx_core::input::{InputRing, RingRead};
use mrx_protocol::decode::{decode_double, decode_float, decode_int, decode_vector, TlvScanner};
use mrx_protocol::encode::*;
use mrx_protocol::{PacketType, Tag};

use mrx_server::config::Defaults;
use mrx_server::control;
use mrx_server::frontend::{source_loop, Frontend, SampleSource, SignalSource};
use mrx_server::preset::PresetTable;
use mrx_server::registry::Registry;
use mrx_server::status::StatusSender;
use mrx_server::ServerContext;

/// 96 kHz input, 10 ms blocks: small enough that tests run in real time.
const SAMPRATE: u32 = 96_000;
const BLOCK: usize = 960;
const IMPULSE: usize = 481;
const BLOCK_RATE: f64 = 100.0;

struct TestServer {
    ctx: Arc<ServerContext>,
    client: UdpSocket,
    status_rx: UdpSocket,
    data_rx: UdpSocket,
    control_addr: std::net::SocketAddr,
    stop: Arc<AtomicBool>,
}

impl TestServer {
    /// Frontend LO at 100 MHz with a low noise floor and a strong
    /// carrier 20 kHz above the LO. The default idle timeout is long
    /// enough that channels survive a whole scenario.
    fn start() -> Self {
        Self::start_with_timeout(500)
    }

    fn start_with_timeout(idle_timeout_blocks: u32) -> Self {
        let master = MasterFftParams {
            block: BLOCK,
            impulse_length: IMPULSE,
            domain: InputDomain::Complex,
            sample_rate: SAMPRATE,
        };
        let frontend = Arc::new(Frontend::new(
            "e2e".into(),
            SAMPRATE,
            InputDomain::Complex,
            16,
            0.0,
            100_000_000.0,
        ));

        let control_socket = UdpSocket::bind("127.0.0.1:0").expect("control bind");
        let control_addr = control_socket.local_addr().expect("control addr");
        let status_rx = UdpSocket::bind("127.0.0.1:0").expect("status bind");
        let data_rx = UdpSocket::bind("127.0.0.1:0").expect("data bind");
        let status_dest = status_rx.local_addr().expect("status addr");
        let data_dest = data_rx.local_addr().expect("data addr");

        let ring = Arc::new(InputRing::new(4 * master.n_fft().next_power_of_two()));
        let board = Arc::new(BlockBoard::new());
        let stop = Arc::new(AtomicBool::new(false));

        let ctx = Arc::new(ServerContext {
            frontend: frontend.clone(),
            master_params: master,
            ring: ring.clone(),
            board: board.clone(),
            registry: Arc::new(Registry::new()),
            presets: Arc::new(PresetTable::builtin()),
            defaults: Defaults {
                data_dest: Some(data_dest),
                status_dest: Some(status_dest),
                idle_timeout_blocks,
                block_rate: BLOCK_RATE,
            },
            status: Arc::new(StatusSender::new(
                control_socket.try_clone().expect("status clone"),
                Some(status_dest),
            )),
            stop: stop.clone(),
        });

        let source = SignalSource::new(SAMPRATE, 100_000_000.0, 0.0)
            .with_tone(20_000.0, 0.5)
            .with_noise(0.01);
        {
            let frontend = frontend.clone();
            let ring = ring.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                source_loop(
                    Box::new(source) as Box<dyn SampleSource>,
                    frontend,
                    ring,
                    BLOCK,
                    stop,
                )
            });
        }
        {
            let ring = ring.clone();
            let board = board.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut planner = FftPlanner::new();
                let mut fft = MasterFft::new(&mut planner, master);
                let mut window = vec![Complex::new(0.0_f32, 0.0); master.n_fft()];
                while !stop.load(Ordering::Acquire) {
                    match ring.read_window(&mut window, BLOCK) {
                        RingRead::Window => board.publish(fft.process_window(&window, 0)),
                        RingRead::Shutdown => break,
                    }
                }
                board.poison();
            });
        }
        {
            let ctx = ctx.clone();
            std::thread::spawn(move || control::control_loop(ctx, control_socket));
        }

        let client = UdpSocket::bind("127.0.0.1:0").expect("client bind");
        status_rx
            .set_read_timeout(Some(Duration::from_millis(100)))
            .expect("status timeout");
        data_rx
            .set_read_timeout(Some(Duration::from_millis(100)))
            .expect("data timeout");

        Self {
            ctx,
            client,
            status_rx,
            data_rx,
            control_addr,
            stop,
        }
    }

    fn send_cmd(&self, build: impl FnOnce(&mut Vec<u8>)) {
        let mut packet = vec![PacketType::Cmd as u8];
        build(&mut packet);
        encode_eol(&mut packet);
        self.client
            .send_to(&packet, self.control_addr)
            .expect("send command");
    }

    /// Collect status packets for `ssrc` until the deadline, or until
    /// `limit` packets have arrived.
    fn recv_statuses_limited(
        &self,
        ssrc: u32,
        deadline: Duration,
        limit: usize,
    ) -> Vec<HashMap<u8, Vec<u8>>> {
        let start = Instant::now();
        let mut out = Vec::new();
        let mut buf = [0u8; 65_536];
        while start.elapsed() < deadline && out.len() < limit {
            let len = match self.status_rx.recv(&mut buf) {
                Ok(len) => len,
                Err(_) => continue,
            };
            if len < 1 || buf[0] != PacketType::Status as u8 {
                continue;
            }
            let mut map = HashMap::new();
            for entry in TlvScanner::new(&buf[1..len]) {
                map.insert(entry.tag, entry.value.to_vec());
            }
            let pkt_ssrc = map
                .get(&(Tag::OutputSsrc as u8))
                .map(|v| decode_int(v) as u32);
            if pkt_ssrc == Some(ssrc) {
                out.push(map);
            }
        }
        out
    }

    fn recv_statuses(&self, ssrc: u32, deadline: Duration) -> Vec<HashMap<u8, Vec<u8>>> {
        self.recv_statuses_limited(ssrc, deadline, usize::MAX)
    }

    /// First status for `ssrc`, returning as soon as it arrives.
    fn recv_status(&self, ssrc: u32, deadline: Duration) -> Option<HashMap<u8, Vec<u8>>> {
        self.recv_statuses_limited(ssrc, deadline, 1).into_iter().next()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.ctx.ring.shutdown();
        self.ctx.board.poison();
    }
}

fn tag(map: &HashMap<u8, Vec<u8>>, tag: Tag) -> Option<&Vec<u8>> {
    map.get(&(tag as u8))
}

#[test]
fn test_dynamic_fm_create_and_expire() {
    let server = TestServer::start_with_timeout(20);
    // Channel on the synthesized carrier, 20 kHz above the LO.
    server.send_cmd(|buf| {
        encode_int32(buf, Tag::OutputSsrc, 17);
        encode_string(buf, Tag::Preset, "fm");
        encode_double(buf, Tag::RadioFrequency, 100_020_000.0);
    });

    let status = server
        .recv_status(17, Duration::from_secs(2))
        .expect("creation status reply");
    let demod = decode_int(tag(&status, Tag::DemodType).expect("demod type"));
    assert_eq!(demod, 1, "preset fm selects the FM demodulator");
    let freq = decode_double(tag(&status, Tag::RadioFrequency).expect("frequency"));
    assert_eq!(freq, 100_020_000.0);
    assert!(server.ctx.registry.lookup(17).is_some());

    // No keepalive commands: the channel must idle out and release its
    // ssrc (20 blocks = 200 ms, plus scheduling slack).
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && server.ctx.registry.lookup(17).is_some() {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(
        server.ctx.registry.lookup(17).is_none(),
        "channel should expire after the idle timeout"
    );
}

#[test]
fn test_squelch_sentinel_keeps_audio_open() {
    let server = TestServer::start();
    // Tune away from the carrier so only noise fills the passband.
    server.send_cmd(|buf| {
        encode_int32(buf, Tag::OutputSsrc, 18);
        encode_string(buf, Tag::Preset, "fm");
        encode_double(buf, Tag::RadioFrequency, 100_040_000.0);
        encode_float(buf, Tag::SquelchOpen, -999.0);
        encode_float(buf, Tag::SquelchClose, -999.0);
    });

    let status = server
        .recv_status(18, Duration::from_secs(2))
        .expect("creation status reply");
    let open = decode_float(tag(&status, Tag::SquelchOpen).expect("squelch open"));
    assert_eq!(open, f32::NEG_INFINITY, "sentinel reports -inf dB");
    let close = decode_float(tag(&status, Tag::SquelchClose).expect("squelch close"));
    assert_eq!(close, f32::NEG_INFINITY);

    // Pure noise must still produce PCM with the squelch forced open.
    let mut buf = [0u8; 65_536];
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut nonzero = false;
    while Instant::now() < deadline {
        let len = match server.data_rx.recv(&mut buf) {
            Ok(len) => len,
            Err(_) => continue,
        };
        let power: i64 = buf[..len]
            .chunks_exact(2)
            .map(|c| {
                let v = i16::from_be_bytes([c[0], c[1]]) as i64;
                v * v
            })
            .sum();
        if power > 0 {
            nonzero = true;
            break;
        }
    }
    assert!(nonzero, "always-open squelch must emit audible noise");
}

#[test]
fn test_preset_override_order() {
    let server = TestServer::start();
    // Explicit edges before the preset; the edges must win.
    server.send_cmd(|buf| {
        encode_int32(buf, Tag::OutputSsrc, 19);
        encode_float(buf, Tag::LowEdge, -1_500.0);
        encode_float(buf, Tag::HighEdge, 1_500.0);
        encode_string(buf, Tag::Preset, "ft8");
        encode_double(buf, Tag::RadioFrequency, 100_010_000.0);
    });

    let status = server
        .recv_status(19, Duration::from_secs(2))
        .expect("creation status reply");
    let low = decode_float(tag(&status, Tag::LowEdge).expect("low edge"));
    let high = decode_float(tag(&status, Tag::HighEdge).expect("high edge"));
    assert_eq!(low, -1_500.0, "explicit LOW_EDGE overrides preset");
    assert_eq!(high, 1_500.0, "explicit HIGH_EDGE overrides preset");
}

#[test]
fn test_restart_on_samprate_change() {
    let server = TestServer::start();
    server.send_cmd(|buf| {
        encode_int32(buf, Tag::OutputSsrc, 20);
        encode_string(buf, Tag::Preset, "fm");
        encode_double(buf, Tag::RadioFrequency, 100_020_000.0);
    });
    assert!(server.recv_status(20, Duration::from_secs(2)).is_some());

    server.send_cmd(|buf| {
        encode_int32(buf, Tag::OutputSsrc, 20);
        encode_int32(buf, Tag::OutputSamprate, 12_000);
    });
    let status = server
        .recv_status(20, Duration::from_secs(2))
        .expect("first restart status");
    assert_eq!(
        decode_int(tag(&status, Tag::OutputSamprate).expect("samprate")),
        12_000
    );

    server.send_cmd(|buf| {
        encode_int32(buf, Tag::OutputSsrc, 20);
        encode_int32(buf, Tag::OutputSamprate, 48_000);
    });
    let status = server
        .recv_status(20, Duration::from_secs(2))
        .expect("second restart status");
    assert_eq!(
        decode_int(tag(&status, Tag::OutputSamprate).expect("samprate")),
        48_000
    );
    // The restarts must not wedge the channel into falling behind.
    let drops = decode_int(tag(&status, Tag::FilterDrops).expect("drops"));
    assert!(drops < 50, "excessive drops after restarts: {}", drops);
}

#[test]
fn test_broadcast_poll_staggers_all_channels() {
    let server = TestServer::start();
    for ssrc in [31u32, 32, 33] {
        server.send_cmd(|buf| {
            encode_int32(buf, Tag::OutputSsrc, ssrc as i32);
            encode_string(buf, Tag::Preset, "fm");
            encode_double(buf, Tag::RadioFrequency, 100_020_000.0);
        });
        assert!(
            server.recv_status(ssrc, Duration::from_secs(2)).is_some(),
            "creation reply for {}",
            ssrc
        );
    }

    // All-channels poll: every channel answers within a few blocks.
    server.send_cmd(|buf| {
        encode_int32(buf, Tag::OutputSsrc, -1); // 0xFFFFFFFF
    });
    let start = Instant::now();
    let mut seen = std::collections::HashSet::new();
    let mut buf = [0u8; 65_536];
    while Instant::now() - start < Duration::from_secs(2) && seen.len() < 3 {
        let len = match server.status_rx.recv(&mut buf) {
            Ok(len) => len,
            Err(_) => continue,
        };
        if len < 1 || buf[0] != PacketType::Status as u8 {
            continue;
        }
        for entry in TlvScanner::new(&buf[1..len]) {
            if entry.tag == Tag::OutputSsrc as u8 {
                seen.insert(decode_int(entry.value) as u32);
            }
        }
    }
    assert_eq!(
        seen,
        [31u32, 32, 33].into_iter().collect(),
        "broadcast must reach every channel"
    );
}

#[test]
fn test_spectrum_bin_reconfigure_is_safe() {
    let server = TestServer::start();
    server.send_cmd(|buf| {
        encode_int32(buf, Tag::OutputSsrc, 21);
        encode_int32(buf, Tag::DemodType, 3); // SPECT
        encode_double(buf, Tag::RadioFrequency, 100_020_000.0);
        encode_int32(buf, Tag::BinCount, 128);
        encode_float(buf, Tag::NoncoherentBinBw, 500.0);
        encode_int32(buf, Tag::StatusInterval, 2);
    });
    assert!(server.recv_status(21, Duration::from_secs(2)).is_some());

    // Periodic statuses must carry a 128-entry vector.
    let statuses = server.recv_statuses(21, Duration::from_millis(500));
    let with_bins = statuses
        .iter()
        .find(|map| tag(map, Tag::BinData).is_some())
        .expect("periodic spectrum status with bins");
    let bins = decode_vector(tag(with_bins, Tag::BinData).unwrap()).expect("bin vector");
    assert_eq!(bins.len(), 128);

    // Reconfigure to 256 bins: every subsequent status either has no
    // vector (reallocation in flight) or a consistent 256-entry one.
    server.send_cmd(|buf| {
        encode_int32(buf, Tag::OutputSsrc, 21);
        encode_int32(buf, Tag::BinCount, 256);
    });
    let statuses = server.recv_statuses(21, Duration::from_secs(1));
    assert!(!statuses.is_empty());
    let mut saw_new_grid = false;
    for map in &statuses {
        let count = decode_int(tag(map, Tag::BinCount).expect("bin count"));
        if count == 256 {
            saw_new_grid = true;
            if let Some(raw) = tag(map, Tag::BinData) {
                let bins = decode_vector(raw).expect("bin vector");
                assert_eq!(
                    bins.len(),
                    256,
                    "bin vector must never mismatch the bin count"
                );
            }
        }
    }
    assert!(saw_new_grid, "new bin count must be reported");
}
