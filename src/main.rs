use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use confique::Config;
use crossbeam_channel::{select, tick, unbounded, Sender};
use log::{error, info, LevelFilter};
use rhythm_daq::{
    amplifier_array, amplifier_microvolts, data_block_size_bytes,
    sim::{SimulatedBoard, SyntheticPattern},
    Board, CaptureOptions, CaptureStats, Conf, DeviceConfig,
};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::{
    fs::File,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use time::OffsetDateTime;

#[derive(Parser, Debug)]
#[command(version, about = "Timed captures from a Rhythm RHD2000 board")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, default_value = "rhythm.toml")]
    config: PathBuf,
    /// Override the number of captures
    #[arg(long)]
    runs: Option<usize>,
    /// Override the data blocks per capture
    #[arg(long)]
    blocks: Option<u32>,
    /// Seed of the simulated board's noise
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Log file, defaults to a dated file in the working directory
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// More output, repeat for trace
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// Print a configuration template and exit
    #[arg(long)]
    print_config: bool,
}

/// What the acquisition thread reports after each capture.
#[derive(Debug)]
struct CaptureSummary {
    run: usize,
    blocks: usize,
    bytes: usize,
    first_timestamp: u32,
    last_timestamp: u32,
    mean_uv: f64,
}

fn default_log_file() -> PathBuf {
    let now = OffsetDateTime::now_utc();
    PathBuf::from(format!(
        "rhythm_{:04}{:02}{:02}.log",
        now.year(),
        u8::from(now.month()),
        now.day()
    ))
}

fn init_logging(verbose: u8, log_file: &Path) -> Result<()> {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let config = ConfigBuilder::new().set_time_format_rfc3339().build();
    let file = File::create(log_file)
        .with_context(|| format!("creating log file {}", log_file.display()))?;
    let loggers: Vec<Box<dyn SharedLogger>> = vec![
        TermLogger::new(level, config.clone(), TerminalMode::Mixed, ColorChoice::Auto),
        WriteLogger::new(LevelFilter::Debug.max(level), config, file),
    ];
    CombinedLogger::init(loggers)?;
    Ok(())
}

fn data_taking(
    mut board: Board<SimulatedBoard>,
    runs: usize,
    blocks: usize,
    tx: Sender<CaptureSummary>,
) -> Result<()> {
    let bytes = data_block_size_bytes(board.config().num_data_streams) * blocks;
    for run in 0..runs {
        let data = board
            .capture(blocks)
            .with_context(|| format!("capture {run}"))?;
        let mean_uv = amplifier_array(&data)
            .mapv(amplifier_microvolts)
            .mean()
            .unwrap_or(0.0);
        let summary = CaptureSummary {
            run,
            blocks: data.len(),
            bytes,
            first_timestamp: data.first().map_or(0, |b| b.timestamp),
            last_timestamp: data.last().map_or(0, |b| b.timestamp),
            mean_uv,
        };
        if tx.send(summary).is_err() {
            break;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!(
            "{}",
            confique::toml::template::<Conf>(confique::toml::FormatOptions::default())
        );
        return Ok(());
    }

    let mut conf = Conf::builder()
        .env()
        .file(&args.config)
        .load()
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(runs) = args.runs {
        conf.run.runs = runs;
    }
    if let Some(blocks) = args.blocks {
        conf.device.capture_duration = blocks;
    }

    let log_file = args
        .log_file
        .clone()
        .or_else(|| conf.run.log_file.clone())
        .unwrap_or_else(default_log_file);
    init_logging(args.verbose, &log_file)?;

    let device = DeviceConfig::try_from(&conf.device).context("invalid device settings")?;
    info!(
        "Simulated board at {}, {} streams, {} blocks per capture, {} captures",
        device.sample_rate, device.num_data_streams, device.capture_duration_blocks, conf.run.runs
    );

    let transport = SimulatedBoard::new(SyntheticPattern::Noise { seed: args.seed });
    let blocks = device.capture_duration_blocks as usize;
    let mut board = Board::open(transport, device).context("opening board")?;
    board.set_capture_options(CaptureOptions {
        timeout: conf.run.capture_timeout(),
        poll_interval: conf.run.poll_interval(),
    });

    let (tx, rx) = unbounded();
    let runs = conf.run.runs;
    let handle = thread::spawn(move || data_taking(board, runs, blocks, tx));

    let ticker = tick(Duration::from_secs(1));
    let mut stats = CaptureStats::new();
    loop {
        select! {
            recv(rx) -> msg => match msg {
                Ok(summary) => {
                    stats.record(summary.blocks, summary.bytes);
                    info!(
                        "Run {}: {} blocks, timestamps {}..={}, mean {:.1} uV",
                        summary.run,
                        summary.blocks,
                        summary.first_timestamp,
                        summary.last_timestamp,
                        summary.mean_uv
                    );
                }
                Err(_) => break,
            },
            recv(ticker) -> _ => {
                info!(
                    "{} captures, {} blocks, {:.2} MB/s",
                    stats.captures,
                    stats.blocks,
                    stats.rate()
                );
            }
        }
    }

    match handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Acquisition stopped: {:#}", e);
            return Err(e);
        }
        Err(_) => anyhow::bail!("acquisition thread panicked"),
    }

    info!(
        "Done: {} captures, {} blocks, {} bytes, {:.2} MB/s average",
        stats.captures,
        stats.blocks,
        stats.bytes,
        stats.average_rate()
    );
    Ok(())
}
