// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! mrxd: the multichannel receiver daemon.
//!
//! One frontend producer feeds the input ring; one master FFT thread
//! publishes frequency-domain blocks; every channel runs its own worker
//! thread; the control thread answers the TLV protocol.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use rustfft::FftPlanner;
use tokio::signal;
use tracing::{error, info};

use mrx_core::fft::{BlockBoard, InputDomain, MasterFft, MasterFftParams};
use mrx_core::input::{InputRing, RingRead};

use mrx_server::channel::{Channel, ChannelState};
use mrx_server::config::ServerConfig;
use mrx_server::control;
use mrx_server::frontend::{source_loop, Frontend, SampleSource, SignalSource};
use mrx_server::logging::init_logging;
use mrx_server::preset::PresetTable;
use mrx_server::registry::Registry;
use mrx_server::status::StatusSender;
use mrx_server::{worker, DynResult, ServerContext};

const PKG_DESCRIPTION: &str = concat!(env!("CARGO_PKG_NAME"), " - multichannel SDR daemon");

#[derive(Debug, Parser)]
#[command(
    version = env!("CARGO_PKG_VERSION"),
    about = PKG_DESCRIPTION,
)]
struct Cli {
    /// Path to configuration file
    #[arg(long = "config", short = 'C', value_name = "FILE")]
    config: Option<PathBuf>,
    /// Print example configuration and exit
    #[arg(long = "print-config")]
    print_config: bool,
    /// Override the control/status listen address
    #[arg(short = 'l', long = "listen")]
    listen: Option<std::net::SocketAddr>,
}

fn master_fft_loop(
    mut fft: MasterFft,
    ring: Arc<InputRing>,
    board: Arc<BlockBoard>,
    stop: Arc<AtomicBool>,
) {
    let params = fft.params();
    let mut window = vec![num_complex::Complex::new(0.0_f32, 0.0); params.n_fft()];
    while !stop.load(Ordering::Acquire) {
        match ring.read_window(&mut window, params.block) {
            RingRead::Window => {
                let now_ns = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos() as i64)
                    .unwrap_or(0);
                board.publish(fft.process_window(&window, now_ns));
            }
            RingRead::Shutdown => break,
        }
    }
    board.poison();
}

/// Build the statically configured channels and start their workers.
fn start_config_channels(config: &ServerConfig, ctx: &Arc<ServerContext>) {
    for chan_cfg in &config.channels {
        if chan_cfg.ssrc == 0 || chan_cfg.ssrc == u32::MAX {
            error!("config channel ssrc {} is reserved, skipping", chan_cfg.ssrc);
            continue;
        }
        let mut state = ChannelState::template(&ctx.frontend, ctx.defaults.block_rate);
        if let Some(name) = &chan_cfg.preset {
            match ctx.presets.get(name) {
                Ok(preset) => {
                    preset.apply(&mut state, &ctx.frontend, ctx.defaults.block_rate);
                    state.preset = name.clone();
                }
                Err(err) => error!("channel {}: {}", chan_cfg.ssrc, err),
            }
        }
        state.tune.freq = chan_cfg.freq;
        if let Some(samprate) = chan_cfg.samprate {
            state.output.samprate =
                mrx_server::channel::round_samprate(samprate, ctx.defaults.block_rate);
        }
        if let Some(low) = chan_cfg.low {
            state.filter.min_if = low;
        }
        if let Some(high) = chan_cfg.high {
            state.filter.max_if = high;
        }
        state.output.dest = chan_cfg.data.or(ctx.defaults.data_dest);
        state.output.status_dest = ctx.defaults.status_dest;
        state.output.rtp_type = mrx_server::channel::pt_from_info(
            state.output.samprate,
            state.output.channels,
            state.output.encoding,
        );
        state.clamp_passband(&ctx.frontend);
        state.inuse = true;
        // Static channels never idle out.
        state.lifetime = 0;

        let chan = Arc::new(Channel::new(chan_cfg.ssrc, ctx.frontend.clone(), state));
        match ctx.registry.insert(chan.clone()) {
            Ok(()) => {
                worker::spawn(chan, ctx.clone());
                info!(
                    "started channel ssrc {} at {:.0} Hz",
                    chan_cfg.ssrc, chan_cfg.freq
                );
            }
            Err(err) => error!("channel {}: {}", chan_cfg.ssrc, err),
        }
    }
}

fn run(cli: Cli) -> DynResult<()> {
    let mut config = match ServerConfig::find_config_file(cli.config.as_deref()) {
        Some(path) => {
            let config = ServerConfig::load(&path)?;
            info!("loaded configuration from {}", path.display());
            config
        }
        None => ServerConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.global.status_listen = listen;
    }

    let domain = if config.frontend.isreal {
        InputDomain::Real
    } else {
        InputDomain::Complex
    };
    let master_params = MasterFftParams {
        block: config.block_size(),
        impulse_length: config.impulse_length(),
        domain,
        sample_rate: config.frontend.samprate,
    };
    info!(
        "master FFT: {} samples/block, N_fft {}, {} bins, {:.1} blocks/s",
        master_params.block,
        master_params.n_fft(),
        master_params.n_bins(),
        master_params.block_rate()
    );

    let frontend = Arc::new(Frontend::new(
        config.frontend.description.clone(),
        config.frontend.samprate,
        domain,
        config.frontend.bits_per_sample,
        config.frontend.calibrate,
        config.frontend.frequency,
    ));

    let mut source = SignalSource::new(
        config.frontend.samprate,
        config.frontend.frequency,
        config.frontend.calibrate,
    );
    for tone in &config.frontend.tones {
        source = source.with_tone(tone[0], tone[1] as f32);
    }
    if config.frontend.noise > 0.0 {
        source = source.with_noise(config.frontend.noise);
    }

    let ring = Arc::new(InputRing::new(
        2 * (master_params.block + master_params.impulse_length).next_power_of_two(),
    ));
    let board = Arc::new(BlockBoard::new());
    let stop = Arc::new(AtomicBool::new(false));

    let control_socket = std::net::UdpSocket::bind(config.global.status_listen)?;
    info!("control/status socket on {}", config.global.status_listen);
    let status_socket = control_socket.try_clone()?;

    let mut presets = PresetTable::builtin();
    presets.merge(config.presets.clone());

    let ctx = Arc::new(ServerContext {
        frontend: frontend.clone(),
        master_params,
        ring: ring.clone(),
        board: board.clone(),
        registry: Arc::new(Registry::new()),
        presets: Arc::new(presets),
        defaults: config.defaults(),
        status: Arc::new(StatusSender::new(status_socket, config.global.status_dest)),
        stop: stop.clone(),
    });

    start_config_channels(&config, &ctx);

    // Producer.
    let producer = {
        let frontend = frontend.clone();
        let ring = ring.clone();
        let stop = stop.clone();
        let block = master_params.block;
        std::thread::Builder::new()
            .name("frontend".to_string())
            .spawn(move || {
                source_loop(
                    Box::new(source) as Box<dyn SampleSource>,
                    frontend,
                    ring,
                    block,
                    stop,
                )
            })?
    };

    // Master FFT.
    let fft_thread = {
        let mut planner = FftPlanner::new();
        let fft = MasterFft::new(&mut planner, master_params);
        let ring = ring.clone();
        let board = board.clone();
        let stop = stop.clone();
        std::thread::Builder::new()
            .name("master-fft".to_string())
            .spawn(move || master_fft_loop(fft, ring, board, stop))?
    };

    // Control reader.
    let control_thread = {
        let ctx = ctx.clone();
        std::thread::Builder::new()
            .name("control".to_string())
            .spawn(move || control::control_loop(ctx, control_socket))?
    };

    // Park on SIGINT, then unwind everything.
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let _ = signal::ctrl_c().await;
    });
    info!("shutting down");
    stop.store(true, Ordering::Release);
    ring.shutdown();
    board.poison();

    let _ = producer.join();
    let _ = fft_thread.join();
    let _ = control_thread.join();
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if cli.print_config {
        println!("{}", ServerConfig::example());
        return;
    }
    // Config may carry the log level, so peek at it before full startup.
    let log_level = ServerConfig::find_config_file(cli.config.as_deref())
        .and_then(|path| ServerConfig::load(&path).ok())
        .map(|config| config.global.log_level)
        .unwrap_or_default();
    init_logging(log_level);

    if let Err(err) = run(cli) {
        error!("fatal: {}", err);
        std::process::exit(1);
    }
}
