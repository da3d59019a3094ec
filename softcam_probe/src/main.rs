mod pattern;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use softcam_core::{FrameBuffer, FrameBufferConfig, SoftcamError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "softcam_probe", version, about = "Produce or watch a softcam frame buffer")]
struct Cli {
    /// Config file (TOML or YAML); standard search paths are used if omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Region name, overriding the config
    #[arg(long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the region and stream a moving test pattern
    Produce {
        #[arg(long, default_value_t = 640)]
        width: i32,

        #[arg(long, default_value_t = 480)]
        height: i32,

        #[arg(long, default_value_t = 30.0)]
        fps: f32,

        /// Stop after this many frames (runs until Ctrl+C otherwise)
        #[arg(long)]
        frames: Option<u64>,

        /// Do not start streaming until a consumer attaches
        #[arg(long)]
        wait_for_consumer: bool,
    },

    /// Attach to the region and report frames as they arrive
    Watch {
        /// Seconds to wait for each frame before checking again
        #[arg(long, default_value_t = 1.0)]
        timeout: f32,
    },

    /// Print the header of the current region
    Info,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "softcam_probe=info,softcam_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => FrameBufferConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => FrameBufferConfig::load_or_default()?,
    };
    if let Some(name) = cli.name {
        config.name = name;
    }

    match cli.command {
        Command::Produce {
            width,
            height,
            fps,
            frames,
            wait_for_consumer,
        } => produce(&config, width, height, fps, frames, wait_for_consumer),
        Command::Watch { timeout } => watch(&config, timeout),
        Command::Info => info(&config),
    }
}

fn produce(
    config: &FrameBufferConfig,
    width: i32,
    height: i32,
    fps: f32,
    frames: Option<u64>,
    wait_for_consumer: bool,
) -> Result<()> {
    let mut camera = FrameBuffer::try_create(config, width, height, fps)
        .with_context(|| format!("creating frame buffer '{}'", config.name))?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("installing Ctrl+C handler")?;
    }

    if wait_for_consumer {
        tracing::info!("Waiting for a consumer to attach to '{}'", config.name);
        while running.load(Ordering::SeqCst)
            && !camera.wait_for_connection(Duration::from_millis(500))
        {}
    }

    let interval = if fps > 0.0 {
        Duration::from_secs_f32(1.0 / fps)
    } else {
        Duration::from_millis(33)
    };

    let mut frame = vec![0u8; camera.frame_size()];
    let mut written = 0u64;
    let mut next = Instant::now();

    while running.load(Ordering::SeqCst) && frames.is_none_or(|limit| written < limit) {
        pattern::render(&mut frame, width as usize, height as usize, written);
        let Some(counter) = publish(&camera, &frame)? else {
            tracing::warn!("Frame buffer went inactive, stopping");
            break;
        };
        written += 1;

        if counter % 100 == 0 {
            tracing::info!(
                counter,
                consumers = camera.connected_count(),
                "Streaming"
            );
        }

        next += interval;
        match next.checked_duration_since(Instant::now()) {
            Some(delay) => std::thread::sleep(delay),
            // Fell behind; do not try to catch up with a burst
            None => next = Instant::now(),
        }
    }

    camera.deactivate()?;
    tracing::info!(frames = written, "Producer finished");
    camera.release();
    Ok(())
}

/// Write one frame; `None` once a consumer's watchdog has expired the region
fn publish(camera: &FrameBuffer, frame: &[u8]) -> Result<Option<u64>> {
    match camera.write(frame) {
        Ok(counter) => Ok(Some(counter)),
        Err(SoftcamError::Inactive) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// A zero timeout would make every wait return at once
fn watch_timeout(config: &FrameBufferConfig, seconds: f32) -> Duration {
    let requested = if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f32(seconds)
    } else {
        Duration::ZERO
    };
    requested.max(config.recheck_interval())
}

fn watch(config: &FrameBufferConfig, timeout: f32) -> Result<()> {
    let viewer = FrameBuffer::try_open(config)
        .with_context(|| format!("opening frame buffer '{}'", config.name))?;
    tracing::info!(
        width = viewer.width(),
        height = viewer.height(),
        framerate = viewer.framerate(),
        "Attached to '{}'",
        config.name
    );

    let timeout = watch_timeout(config, timeout);
    let mut pixels = vec![0u8; viewer.frame_size()];
    let mut seen = viewer.frame_counter();
    let mut received = 0u64;

    while viewer.wait_for_new_frame(seen, timeout) {
        if viewer.frame_counter() == seen {
            tracing::debug!("No new frame within {:?}", timeout);
            continue;
        }

        let counter = viewer.read_frame(&mut pixels)?;
        let skipped = counter.saturating_sub(seen + 1);
        received += 1;
        tracing::debug!(
            counter,
            skipped,
            checksum = pattern::checksum(&pixels),
            "Frame"
        );
        if skipped > 0 {
            tracing::warn!(skipped, "Consumer fell behind");
        }
        seen = counter;
    }

    tracing::info!(received, last = seen, "Producer is no longer active");
    Ok(())
}

fn info(config: &FrameBufferConfig) -> Result<()> {
    let fb = FrameBuffer::try_open(config)
        .with_context(|| format!("opening frame buffer '{}'", config.name))?;

    println!("name:         {}", config.name);
    println!("directory:    {}", config.shm_dir().display());
    println!("size:         {}x{}", fb.width(), fb.height());
    println!("framerate:    {}", fb.framerate());
    println!("frame bytes:  {}", fb.frame_size());
    println!("frame count:  {}", fb.frame_counter());
    println!("active:       {}", fb.active());
    println!("producer:     {}", if fb.connected() { "alive" } else { "gone" });
    if let Some(pid) = fb.producer_pid() {
        println!("producer pid: {}", pid);
    }
    // This probe is attached too
    println!("consumers:    {}", fb.connected_count().saturating_sub(1));
    Ok(())
}
