use clap::{Parser, Subcommand};
use eyre::{Context, Result};
use handoff::{ConsumerSession, HandoffError, ProducerSession, PublishOutcome, SessionEvent};
use handoffctl::config::Config;
use handoffctl::frames::{checksum, synthetic_frame};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::sleep;
use std::time::{Duration, Instant};

static LONG_VERSION: OnceLock<String> = OnceLock::new();

fn get_long_version() -> &'static str {
    LONG_VERSION.get_or_init(|| {
        format!(
            "{} (commit: {}, protocol: {})",
            env!("CARGO_PKG_VERSION"),
            env!("GIT_REVISION", "unknown"),
            protocol::PROTOCOL_VERSION
        )
    })
}

#[derive(Parser)]
#[command(name = "handoffctl")]
#[command(about = "zero-copy media buffer handoff between processes")]
#[command(version = None, long_version = get_long_version())]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve synthetic frames to one consumer.
    Produce {
        #[arg(help = "configuration file path (toml format)")]
        config: PathBuf,

        #[arg(short, long, help = "stop after publishing this many frames")]
        frames: Option<u64>,

        #[arg(
            short,
            long,
            default_value = "33ms",
            value_parser = humantime::parse_duration,
            help = "delay between frames (e.g. 33ms, 1s)"
        )]
        interval: Duration,

        #[arg(long, default_value_t = 320)]
        width: u32,

        #[arg(long, default_value_t = 240)]
        height: u32,
    },
    /// Pull frames from a producer and hand them back.
    Consume {
        #[arg(help = "configuration file path (toml format)")]
        config: PathBuf,

        #[arg(short, long, help = "stop after receiving this many frames")]
        frames: Option<u64>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Produce {
            config,
            frames,
            interval,
            width,
            height,
        } => {
            let config = load_config(&config)?;
            produce(config, frames, interval, width, height)
        }
        Command::Consume { config, frames } => {
            let config = load_config(&config)?;
            consume(config, frames)
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load(path)
        .with_context(|| format!("failed to load config path={}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .init();

    Ok(config)
}

fn produce(
    config: Config,
    frames: Option<u64>,
    interval: Duration,
    width: u32,
    height: u32,
) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        tracing::info!("received ctrl+c, shutting down gracefully...");
        r.store(false, Ordering::SeqCst);
    })?;

    let mut session = ProducerSession::new(config.producer);
    session.start().wrap_err("failed to start producer")?;
    let events = session.events();

    let started = Instant::now();
    let mut index = 0u64;
    while running.load(Ordering::SeqCst) && frames.is_none_or(|n| index < n) {
        for event in events.try_iter() {
            match event {
                SessionEvent::ClientConnected { client_id } => {
                    tracing::info!(client_id, "consumer attached")
                }
                SessionEvent::ClientDisconnected { client_id } => {
                    tracing::info!(client_id, "consumer detached")
                }
            }
        }

        let buffer = synthetic_frame(width, height, index)?.with_timing(
            Some(started.elapsed().as_nanos() as u64),
            Some(interval.as_nanos() as u64),
        );
        let sum = checksum(buffer.planes()[0].data());

        match session.publish(Arc::new(buffer)) {
            Ok(PublishOutcome::Delivered {
                generation,
                acknowledged,
            }) => {
                tracing::debug!(generation, acknowledged, checksum = sum, "frame published");
                index += 1;
            }
            Ok(outcome) => tracing::trace!(?outcome, "frame not delivered"),
            Err(e) if !e.is_fatal() => tracing::warn!(error = %e, "frame dropped"),
            Err(e) => return Err(e).wrap_err("publish failed"),
        }

        sleep(interval);
    }

    session.stop()?;
    let stats = session.stats();
    tracing::info!(
        published = stats.published,
        released = stats.released,
        force_released = stats.force_released,
        ack_timeouts = stats.ack_timeouts,
        "producer finished"
    );
    Ok(())
}

fn consume(config: Config, frames: Option<u64>) -> Result<()> {
    let socket_path = config.consumer.socket_path.clone();
    let mut session = ConsumerSession::open(config.consumer)
        .with_context(|| format!("failed to connect path={}", socket_path.display()))?;

    let flush = session.flush_handle();
    ctrlc::set_handler(move || {
        tracing::info!("received ctrl+c, shutting down gracefully...");
        if let Err(e) = flush.set_flushing(true) {
            tracing::warn!(error = %e, "failed to interrupt pull");
        }
    })?;

    let mut received = 0u64;
    while frames.is_none_or(|n| received < n) {
        match session.pull() {
            Ok(Some(buffer)) => {
                for (index, plane) in buffer.planes().iter().enumerate() {
                    tracing::info!(
                        generation = buffer.generation(),
                        plane = index,
                        size = plane.data().len(),
                        checksum = checksum(plane.data()),
                        "frame received"
                    );
                }
                received += 1;
            }
            Ok(None) => {
                tracing::info!("producer ended the session");
                break;
            }
            Err(HandoffError::Flushing) => break,
            Err(e) if !e.is_fatal() => tracing::warn!(error = %e, "frame skipped"),
            Err(e) => return Err(e).wrap_err("pull failed"),
        }
    }

    session.stop()?;
    tracing::info!(received, "consumer finished");
    Ok(())
}
