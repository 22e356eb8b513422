//! Finloop CLI
//!
//! Runs a closed-loop session against the synthetic camera: tracking,
//! estimation and a logging stimulus, with optional CSV export and a
//! Prometheus endpoint.

use clap::Parser;
use finloop::{
    capture::{FrameGrabber, SyntheticCamera},
    config::FileConfig,
    experiment::{Collector, StimulusLoop, TickReport},
    metrics::{MetricsRegistry, MetricsSnapshot},
    tracking::TrackingWorker,
    ControlSignal,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Command line arguments for a closed-loop run
#[derive(Parser, Debug)]
#[command(author, version, about = "Closed-loop larva tracking")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run duration in seconds (runs until Ctrl-C when unset)
    #[arg(short = 't', long)]
    duration: Option<f64>,

    /// Pipeline preset (tail, tail_and_eyes, free_swimming)
    #[arg(short, long)]
    preset: Option<String>,

    /// Directory for the protocol CSV exports
    #[arg(long)]
    csv_dir: Option<PathBuf>,

    /// Port for the Prometheus endpoint
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Forward raw frames to the recording queue
    #[arg(long)]
    record: bool,

    /// Capture as fast as frames can be rendered instead of at the configured rate
    #[arg(long)]
    unpaced: bool,
}

fn load_config(args: &Args) -> Result<FileConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => FileConfig::from_file(path)?,
        None => FileConfig::default(),
    };
    if let Some(duration) = args.duration {
        config.output.duration_s = Some(duration);
    }
    if let Some(preset) = &args.preset {
        config.pipeline.preset = preset.clone();
    }
    if args.csv_dir.is_some() {
        config.output.csv_dir = args.csv_dir.clone();
    }
    if args.metrics_port.is_some() {
        config.output.metrics_port = args.metrics_port;
    }
    config.validate()?;
    Ok(config)
}

#[cfg(feature = "metrics")]
fn start_metrics_server(port: u16, registry: Arc<MetricsRegistry>) {
    use finloop::metrics::{MetricsServer, MetricsServerConfig};

    match MetricsServer::new(MetricsServerConfig::with_port(port), registry).spawn() {
        Ok(_) => info!(port, "Metrics endpoint enabled"),
        Err(e) => warn!(error = %e, "Metrics server failed to start"),
    }
}

#[cfg(not(feature = "metrics"))]
fn start_metrics_server(port: u16, _registry: Arc<MetricsRegistry>) {
    warn!(port, "Built without the `metrics` feature; endpoint disabled");
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    let spec = config.pipeline.spec()?;

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        info!("Got Ctrl-C, shutting down");
        handler_stop.store(true, Ordering::Relaxed);
    })?;

    let registry = Arc::new(MetricsRegistry::new()?);
    if let Some(port) = config.output.metrics_port {
        start_metrics_server(port, Arc::clone(&registry));
    }

    // frame timestamps and estimator ticks are both seconds since this
    let epoch = Instant::now();
    let (frames_tx, frames_rx) = crossbeam_channel::bounded(config.capture.queue_capacity);
    let grabber = FrameGrabber::spawn(
        SyntheticCamera::new(),
        &config.capture,
        frames_tx,
        Arc::clone(&stop),
        !args.unpaced,
        epoch,
    )?;
    let (worker, channels) =
        TrackingWorker::spawn(spec, frames_rx, &config.tracking, Arc::clone(&stop))?;
    info!(
        preset = %config.pipeline.preset,
        fields = ?worker.initial_schema().fields(),
        "Tracking pipeline ready"
    );
    if !config.pipeline.params.is_empty() {
        channels.params.send(config.pipeline.params.clone())?;
    }
    worker.set_recording(args.record);

    let collector = Collector::new(config.accumulator.clone(), channels.output)
        .with_framerate(channels.framerate)
        .with_status(channels.status);
    let tracking = collector.tracking().clone();
    let estimator = config
        .estimator
        .build(tracking.clone(), config.accumulator.clone());
    info!(estimator = estimator.name(), "Estimator ready");

    let sink = |t: f64, signal: ControlSignal| {
        tracing::trace!(t, ?signal, "Stimulus update");
    };
    let mut stimulus = StimulusLoop::new(config.stimulus.clone(), collector, estimator, sink);

    let display = channels.display;
    let recording = channels.recording;
    let mut recorded = 0u64;
    let observer = |report: &TickReport| {
        display.try_iter().for_each(drop);
        recorded += recording.try_iter().count() as u64;
        let snapshot = MetricsSnapshot::from_components(
            &worker.stats(),
            grabber.dropped(),
            worker.framerate(),
            &tracking,
            Some(&report.signal),
        );
        registry.update(&snapshot);
    };

    stimulus.start_protocol();
    let duration = config.output.duration_s.map(Duration::from_secs_f64);
    let ticks = stimulus.run(epoch, duration, &stop, observer);
    let written = stimulus.end_protocol(config.output.csv_dir.as_deref())?;
    for path in &written {
        info!(path = %path.display(), "Exported");
    }

    stop.store(true, Ordering::Relaxed);
    let dropped = grabber.dropped();
    grabber.join();
    let stats = worker.join()?;
    info!(
        ticks,
        frames = stats.frames_processed,
        dropped,
        recorded,
        pipeline_errors = stats.pipeline_errors,
        "Session finished"
    );
    Ok(())
}

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Finloop v{}", finloop::VERSION);

    if let Err(e) = run(Args::parse()) {
        error!("{}", e);
        std::process::exit(1);
    }
}
