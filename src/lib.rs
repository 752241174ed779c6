//! cb2link - telemetry, command and record/playback engine for CB2 controllers
//!
//! The engine keeps one TCP connection to the robot controller, decodes the
//! binary status stream into [`RobotState`] snapshots, sends validated motion
//! commands back, and records telemetry into tracks that can be replayed later
//! with the original timing.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cb2link::{CommandChannel, Config, Player, Recorder, Session};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_from_path("config/cb2link.yaml")?;
//!     let session = Session::connect(&config).await?;
//!
//!     // Record five seconds of motion
//!     let mut recorder = Recorder::new(config.recording.clone());
//!     recorder.start(session.handle().telemetry())?;
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     let track = recorder.stop().await?;
//!
//!     // Replay it
//!     let channel = Arc::new(CommandChannel::new(session.handle()));
//!     let mut player = Player::new(channel, config.playback.clone());
//!     player.play(Arc::new(track))?;
//!     let report = player.wait().await?;
//!     println!("Sent {} commands", report.commands_sent);
//!
//!     session.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **codec**: frame encoding and decoding, no I/O
//! - **session**: connection lifecycle, framing, reconnects and the write queue
//! - **telemetry**: per-subscriber bounded snapshot queues
//! - **command**: safety envelope validation in front of the write queue
//! - **recorder** / **track**: telemetry capture and the track file format
//! - **player**: deadline-driven replay of a track

pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod player;
pub mod recorder;
pub mod session;
pub mod telemetry;
pub mod track;

pub use codec::{
    AckStatus, Acknowledgement, Command, CommandMessage, CorrelationId, RobotMode, RobotState, SafetyMode,
};
pub use command::{CommandChannel, CommandSink};
pub use config::{Config, PlaybackMode, RecordingMode, SafetyEnvelope};
pub use error::{LinkError, Result};
pub use player::{PlaybackReport, Player, PlayerState};
pub use recorder::{Recorder, RecorderState};
pub use session::{Session, SessionHandle, SessionState, StatsSnapshot};
pub use telemetry::{CloseReason, Subscription, TelemetryHub};
pub use track::{Track, Waypoint};
