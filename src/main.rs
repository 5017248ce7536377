use anyhow::{Context, Result};
use camgrid::assets::DEFAULT_STREAM_COUNT;
use camgrid::config::{app_name, version, Config};
use camgrid::convert::DownscalePolicy;
use camgrid::delivery::SlotBoard;
use camgrid::media::PixelFormat;
use camgrid::pipeline::{HealthMonitor, Supervisor};
use clap::{value_parser, Arg, ArgAction, Command};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::{panic, thread};
use tokio::sync::{mpsc, Notify};

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

struct Options {
    config: Config,
    address: String,
    streams: usize,
    duration: Option<Duration>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .value_name("ADDRESS")
                .help("Source every stream opens: a file path, file:// or tcp:// URL.")
                .required(true),
        )
        .arg(
            Arg::new("streams")
                .short('n')
                .long("streams")
                .value_name("COUNT")
                .help("Number of concurrent streams on the address (default 8).")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_name("PIXEL FORMAT")
                .help("Output pixel format (bgra, rgba, rgb24, bgr24)."),
        )
        .arg(
            Arg::new("no-downscale")
                .long("no-downscale")
                .help("Deliver frames at source resolution.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("depth")
                .long("depth")
                .value_name("FRAMES")
                .help("Frames buffered per stream before the oldest is replaced.")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("SECONDS")
                .help("Stop the session after this many seconds.")
                .value_parser(value_parser!(u64)),
        )
        .get_matches();

    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(format) = matches.get_one::<String>("format") {
        config.output.pixel_format = format.parse::<PixelFormat>()?;
    }
    if matches.get_flag("no-downscale") {
        config.output.downscale = DownscalePolicy::Disabled;
    }
    if let Some(depth) = matches.get_one::<usize>("depth") {
        config.delivery.frame_depth = *depth;
    }
    config.validate()?;

    let options = Options {
        config,
        address: matches
            .get_one::<String>("address")
            .cloned()
            .unwrap_or_default(),
        streams: matches
            .get_one::<usize>("streams")
            .copied()
            .unwrap_or(DEFAULT_STREAM_COUNT),
        duration: matches.get_one::<u64>("duration").map(|s| Duration::from_secs(*s)),
    };

    // a panicking worker is reported by its pipeline, the process keeps running
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        error!(
            "Thread {} panicked",
            thread::current().name().unwrap_or("<unnamed>")
        );
        orig_hook(panic_info);
    }));

    // stop the session cleanly on SIGINT, SIGTERM, or SIGHUP
    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    ctrlc::set_handler(move || signal.notify_one()).context("Error setting Ctrl-C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("camgrid-runtime")
        .build()?;
    runtime.block_on(run(options, shutdown))
}

async fn run(options: Options, shutdown: Arc<Notify>) -> Result<()> {
    let mut supervisor = Supervisor::with_default_backend(&options.config);
    let dispatcher = supervisor.dispatcher();
    let session = supervisor.start_session(&options.address, options.streams)?;

    let (alert_tx, mut alert_rx) = mpsc::channel(64);
    for pipeline in supervisor.registry().iter() {
        let monitor = HealthMonitor::new(pipeline.index(), pipeline.health().clone(), alert_tx.clone())
            .with_drop_rate_threshold(options.config.delivery.drop_alert_percent);
        tokio::spawn(async move { monitor.run().await });
    }
    drop(alert_tx);

    let deadline = async {
        match options.duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut board = SlotBoard::new();
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;

    loop {
        tokio::select! {
            event = dispatcher.next() => event.deliver_to(&mut board),
            Some((index, alert)) = alert_rx.recv() => warn!("Stream #{}: {:?}", index, alert),
            _ = status.tick() => log_status(&supervisor, &board),
            _ = shutdown.notified() => {
                info!("Interrupted, stopping session {}", session);
                break;
            }
            _ = &mut deadline => {
                info!("Duration elapsed, stopping session {}", session);
                break;
            }
        }
    }

    let (frames, failed) = (board.total_frames(), board.failed_slots());
    supervisor.stop_session();
    let timeout = options.config.stop_join_timeout();
    let clean = tokio::task::block_in_place(|| supervisor.wait_retired(timeout));
    if !clean {
        warn!("{} workers still running at exit", supervisor.retired_count());
    }

    info!(
        "Session {} finished: {} frames delivered, {} streams failed",
        session, frames, failed
    );
    Ok(())
}

fn log_status(supervisor: &Supervisor, board: &SlotBoard) {
    for report in supervisor.health_summary() {
        info!(
            "#{} {} [{}]: {}",
            report.slot.index,
            report.state,
            report.slot.stream.short(),
            report.health
        );
    }
    info!(
        "{} frames delivered, {} of {} slots failed",
        board.total_frames(),
        board.failed_slots(),
        board.slots().len()
    );
}
