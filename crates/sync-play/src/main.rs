//! sync-play: play the audio track of a video file the way a video player would,
//! starting with the picture and stopping on Ctrl-C (or after `--duration`).
//!
//! Decoding is done by an external `ffmpeg`; see the `audio-sync` crate for the
//! session lifecycle.

mod cli;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use audio_sync::device::{AudioOutput, CpalOutput, PacedSink};
use audio_sync::log_sink::{FileSink, SinkLayer};
use audio_sync::{PlaybackSession, SessionConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Frames per pull for `--null-output`, close to a typical device period.
const NULL_OUTPUT_FRAMES: usize = 1024;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    init_tracing(args.log_file.as_deref())?;

    if args.list_devices {
        for (i, name) in audio_sync::device::list_devices()?.iter().enumerate() {
            println!("#{i}: {name}");
        }
        return Ok(());
    }

    let Some(video) = args.video.clone() else {
        bail!("no video file given");
    };
    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    args.apply(&mut config);

    let output: Arc<dyn AudioOutput> = if args.null_output {
        Arc::new(PacedSink::new(NULL_OUTPUT_FRAMES))
    } else {
        Arc::new(CpalOutput {
            device: args.device.clone(),
            env_var: config.backend.env_var.clone(),
        })
    };

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("install Ctrl-C handler")?;

    let session = PlaybackSession::with_output(video, config, Some(output));
    if !session.start() {
        bail!("audio playback could not be started");
    }

    let interrupted = match args.duration {
        Some(secs) => {
            let limit = Duration::try_from_secs_f64(secs)
                .with_context(|| format!("invalid --duration {secs}"))?;
            stop_rx.recv_timeout(limit).is_ok()
        }
        None => stop_rx.recv().is_ok(),
    };
    tracing::info!(interrupted, "stopping");

    session.stop();
    let status = session.status();
    let stats = session.stats();
    tracing::info!(
        state = %status.state,
        end_reason = ?status.end_reason,
        pulls = stats.pulls,
        frames = stats.frames,
        padded_frames = stats.padded_frames,
        underrun_events = stats.underrun_events,
        "session finished"
    );
    Ok(())
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let sink = FileSink::create(path)
                .with_context(|| format!("open log file {:?}", path))?;
            Some(SinkLayer::new(Arc::new(sink)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,audio_sync=info,sync_play=info")
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}
