//! Frame-grabber binary for testing camera capture.

use std::io::BufRead;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;
use frame_grabber::{DeviceRuntime, DeviceSession, SessionConfig, V4L2Driver};
use tracing::{info, warn};

/// Stream frames from the first connected camera.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Stop after this many frames instead of waiting for Enter.
    #[arg(long)]
    frames: Option<u64>,

    /// Per-dequeue timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    dequeue_timeout_ms: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    if let Err(err) = run(&Args::parse()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> frame_grabber::Result<()> {
    let runtime = DeviceRuntime::<V4L2Driver>::instance()?;
    let timeout = Duration::from_millis(args.dequeue_timeout_ms);
    let config = SessionConfig::default().with_dequeue_timeout(timeout);

    let (frame_tx, frame_rx) = mpsc::channel();
    let mut session = DeviceSession::open_with_config(&runtime, config, move |view| {
        println!("received {}x{}", view.height(), view.width());
        let _ = frame_tx.send(());
        true
    })?;

    print!("{}", session.device_info());
    info!(payload_size = session.payload_size(), "device configured");

    session.run()?;
    let mut received = 0u64;
    match args.frames {
        Some(limit) => {
            // The session reports no failures; a silent stream means the loop died.
            while received < limit {
                if frame_rx.recv_timeout(timeout.saturating_mul(5)).is_err() {
                    warn!(received, "no frames arriving, stopping");
                    break;
                }
                received += 1;
            }
        }
        None => {
            println!("Press Enter to stop");
            let _ = std::io::stdin().lock().lines().next();
            received = frame_rx.try_iter().count() as u64;
        }
    }
    session.stop();

    println!("done, {received} frames");
    Ok(())
}
