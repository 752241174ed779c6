//! cb2link - monitor, record and replay a CB2 controller from the command line
//!
//! - `monitor` prints every decoded snapshot as a JSON line on stdout
//! - `record` captures telemetry into a track file until Ctrl+C or `--duration`
//! - `play` replays a track file; Ctrl+C cancels and stops the arm

use anyhow::{bail, Context, Result};
use cb2link::{CommandChannel, Config, Player, Recorder, RecordingMode, Session, Track};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "cb2link")]
#[command(about = "Telemetry monitor and record/playback tool for UR CB2 controllers")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Controller host, overriding the configuration file
    #[arg(long)]
    host: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print live telemetry as JSON lines
    Monitor {
        /// Stop after this many snapshots
        #[arg(long)]
        count: Option<usize>,
    },

    /// Record telemetry into a track file
    Record {
        /// Where to write the track
        #[arg(short, long)]
        output: PathBuf,

        /// Stop after this many seconds instead of waiting for Ctrl+C
        #[arg(long)]
        duration: Option<f64>,

        /// Only record a waypoint when Enter is pressed
        #[arg(long)]
        on_demand: bool,
    },

    /// Replay a track file
    Play {
        /// Track to replay
        #[arg(short, long)]
        track: PathBuf,

        /// Playback speed factor, overriding the configuration file
        #[arg(long)]
        time_scale: Option<f64>,
    },
}

impl Args {
    fn get_config_path(&self) -> PathBuf {
        self.config
            .clone()
            .or_else(|| std::env::var("CB2LINK_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/cb2link.yaml"))
    }

    fn load_config(&self) -> Result<Config> {
        let path = self.get_config_path();
        let mut config = if path.exists() {
            info!("Using config: {}", path.display());
            Config::load_from_path(&path).with_context(|| format!("Failed to load {}", path.display()))?
        } else {
            warn!("No config at {}, using defaults", path.display());
            Config::default()
        };
        if let Some(host) = &self.host {
            config.controller.host = host.clone();
        }
        if let Commands::Record { on_demand: true, .. } = self.command {
            config.recording.mode = RecordingMode::OnDemand;
        }
        if let Commands::Play { time_scale: Some(scale), .. } = self.command {
            config.playback.time_scale = scale;
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Turn `--duration` into a recording limit, rejecting values that are not a usable length of time
fn recording_limit(secs: Option<f64>) -> Result<Option<Duration>> {
    let Some(secs) = secs else {
        return Ok(None);
    };
    if !(secs.is_finite() && secs > 0.0) {
        bail!("--duration must be a positive number of seconds, got {}", secs);
    }
    let limit = Duration::try_from_secs_f64(secs).with_context(|| format!("--duration {} is too long", secs))?;
    Ok(Some(limit))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let config = args.load_config()?;
    let limit = match &args.command {
        Commands::Record { duration, .. } => recording_limit(*duration)?,
        _ => None,
    };
    let session = Session::connect(&config)
        .await
        .context("Failed to connect to controller")?;

    let outcome = match args.command {
        Commands::Monitor { count } => monitor(&session, count).await,
        Commands::Record { output, .. } => record(&session, &config, output, limit).await,
        Commands::Play { track, .. } => play(&session, &config, track).await,
    };

    let stats = session.handle().stats();
    info!(
        "Link stats: {} states, {} acks, {} frames sent, {} malformed, {} reconnects",
        stats.states_received, stats.acks_received, stats.frames_sent, stats.malformed_frames, stats.reconnects
    );
    session.close().await.context("Failed during shutdown")?;
    outcome
}

async fn monitor(session: &Session, count: Option<usize>) -> Result<()> {
    let mut subscription = session.handle().subscribe();
    let mut printed = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            received = subscription.recv() => match received {
                Ok(state) => {
                    println!("{}", serde_json::to_string(&state)?);
                    printed += 1;
                    if count.is_some_and(|limit| printed >= limit) {
                        break;
                    }
                }
                Err(reason) => {
                    error!("Telemetry ended: {}", reason);
                    break;
                }
            },
        }
    }
    if subscription.dropped() > 0 {
        warn!("Output fell behind; {} snapshots skipped", subscription.dropped());
    }
    Ok(())
}

async fn record(session: &Session, config: &Config, output: PathBuf, limit: Option<Duration>) -> Result<()> {
    let mut recorder = Recorder::new(config.recording.clone());
    recorder.start(session.handle().telemetry())?;

    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    if recorder.mode() == RecordingMode::OnDemand {
        info!("Press Enter to capture a waypoint, Ctrl+C to finish");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = &mut deadline => break,
                line = lines.next_line() => match line? {
                    Some(_) => recorder.capture()?,
                    None => break,
                },
            }
        }
    } else {
        info!("Recording, press Ctrl+C to finish");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = &mut deadline => {}
        }
    }

    let track = recorder.stop().await?;
    track
        .save(&output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!(
        "Saved {} waypoints ({:?}) to {}",
        track.len(),
        track.duration(),
        output.display()
    );
    Ok(())
}

async fn play(session: &Session, config: &Config, path: PathBuf) -> Result<()> {
    let track = Track::load(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let channel = Arc::new(CommandChannel::new(session.handle()));
    let mut player = Player::new(channel, config.playback.clone());
    player.play(Arc::new(track))?;

    let mut state = player.watch_state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping playback");
            if let Err(e) = player.cancel() {
                warn!("Playback already finished: {}", e);
            }
        }
        _ = state.wait_for(|s| !s.is_active()) => {}
    }

    let report = player.wait().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.degraded.is_empty() {
        warn!("{} waypoints were sent late", report.degraded.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_limit() {
        assert_eq!(recording_limit(None).unwrap(), None);
        assert_eq!(recording_limit(Some(2.5)).unwrap(), Some(Duration::from_millis(2500)));

        for bad in [0.0, -3.0, f64::NAN, f64::INFINITY, 1e30] {
            assert!(recording_limit(Some(bad)).is_err(), "{} should be rejected", bad);
        }
    }
}
