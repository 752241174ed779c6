//! Timed track playback
//!
//! The player walks a track in its own task and turns each waypoint into a
//! motion command at `start + offset / time_scale`, shifted by any time spent
//! paused. A deadline that has already passed is sent immediately: relative
//! order is kept even when absolute timing is lost.

use crate::codec::{Command, CorrelationId};
use crate::command::CommandSink;
use crate::config::{PlaybackConfig, PlaybackMode, MAX_TIME_SCALE};
use crate::session::SessionState;
use crate::track::{Track, Waypoint};
use crate::{LinkError, Result};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// How late a waypoint may be before it counts as degraded
pub const DEADLINE_SLACK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlayerState {
    Idle,
    Playing,
    Paused,
    Cancelled,
    Completed,
}

impl PlayerState {
    pub fn is_active(self) -> bool {
        matches!(self, PlayerState::Playing | PlayerState::Paused)
    }
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlayerState::Idle => "idle",
            PlayerState::Playing => "playing",
            PlayerState::Paused => "paused",
            PlayerState::Cancelled => "cancelled",
            PlayerState::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// A waypoint sent after its deadline had already passed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradedDeadline {
    pub waypoint: usize,
    pub lateness: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CancelReason {
    Requested,
    LinkLost,
    CommandFailed(String),
    /// The waypoint's scaled offset does not fit the clock
    UnschedulableWaypoint(usize),
}

/// What happened to the Stop issued when playback was cancelled
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StopOutcome {
    NotRequired,
    Sent(CorrelationId),
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaybackReport {
    pub commands_sent: usize,
    pub degraded: Vec<DegradedDeadline>,
    pub final_state: PlayerState,
    pub cancel_reason: Option<CancelReason>,
    pub stop: StopOutcome,
}

async fn link_lost(link: &mut watch::Receiver<SessionState>) {
    let _ = link.wait_for(|state| *state != SessionState::Connected).await;
}

struct Run {
    sink: Arc<dyn CommandSink>,
    config: PlaybackConfig,
    track: Arc<Track>,
    state: Arc<watch::Sender<PlayerState>>,
}

impl Run {
    fn command_for(&self, waypoint: &Waypoint) -> Command {
        match self.config.mode {
            PlaybackMode::Joint => Command::MoveJoint {
                target: waypoint.joints,
                speed: self.config.speed,
                acceleration: self.config.acceleration,
            },
            PlaybackMode::Linear => Command::MoveLinear {
                target: waypoint.pose,
                speed: self.config.speed,
                acceleration: self.config.acceleration,
            },
        }
    }

    async fn drive(self) -> PlaybackReport {
        let mut control = self.state.subscribe();
        let mut link = self.sink.link_state();
        let start = Instant::now();
        let mut paused_total = Duration::ZERO;
        let mut commands_sent = 0;
        let mut degraded = Vec::new();
        let mut cancel_reason = None;

        'waypoints: for (index, waypoint) in self.track.waypoints().iter().enumerate() {
            let offset = match Duration::try_from_secs_f64(waypoint.offset / self.config.time_scale) {
                Ok(offset) => offset,
                Err(e) => {
                    error!("Waypoint {} offset {} cannot be scheduled: {}", index, waypoint.offset, e);
                    cancel_reason = Some(CancelReason::UnschedulableWaypoint(index));
                    break;
                }
            };

            // Wait for this waypoint's deadline, following pause and cancel requests
            loop {
                let current = *control.borrow_and_update();
                match current {
                    PlayerState::Cancelled => {
                        cancel_reason = Some(CancelReason::Requested);
                        break 'waypoints;
                    }
                    PlayerState::Paused => {
                        let paused_at = Instant::now();
                        debug!("Playback paused before waypoint {}", index);
                        tokio::select! {
                            _ = control.changed() => {}
                            _ = link_lost(&mut link) => {
                                cancel_reason = Some(CancelReason::LinkLost);
                                break 'waypoints;
                            }
                        }
                        paused_total += paused_at.elapsed();
                        continue;
                    }
                    _ => {}
                }

                let Some(deadline) = offset.checked_add(paused_total).and_then(|d| start.checked_add(d)) else {
                    error!("Waypoint {} deadline overflows the clock", index);
                    cancel_reason = Some(CancelReason::UnschedulableWaypoint(index));
                    break 'waypoints;
                };
                let now = Instant::now();
                let lateness = now.saturating_duration_since(deadline);
                if lateness > DEADLINE_SLACK {
                    warn!("Waypoint {} is {:?} behind schedule, sending immediately", index, lateness);
                    degraded.push(DegradedDeadline { waypoint: index, lateness });
                    break;
                }

                tokio::select! {
                    _ = sleep_until(deadline) => break,
                    _ = control.changed() => continue,
                    _ = link_lost(&mut link) => {
                        cancel_reason = Some(CancelReason::LinkLost);
                        break 'waypoints;
                    }
                }
            }

            match self.sink.send(self.command_for(waypoint)) {
                Ok(id) => {
                    commands_sent += 1;
                    debug!("Waypoint {} sent as {}", index, id);
                }
                Err(LinkError::NotConnected) => {
                    cancel_reason = Some(CancelReason::LinkLost);
                    break;
                }
                Err(e) => {
                    error!("Waypoint {} could not be sent: {}", index, e);
                    cancel_reason = Some(CancelReason::CommandFailed(e.to_string()));
                    break;
                }
            }
        }

        // Only a cancel can leave the active states while this task runs, so a
        // failed transition means one landed after the last waypoint went out
        if cancel_reason.is_none() {
            let completed = self.state.send_if_modified(|state| {
                let active = state.is_active();
                if active {
                    *state = PlayerState::Completed;
                }
                active
            });
            if !completed {
                cancel_reason = Some(CancelReason::Requested);
            }
        }

        let (final_state, stop) = match &cancel_reason {
            None => {
                info!("Playback completed: {} commands sent", commands_sent);
                (PlayerState::Completed, StopOutcome::NotRequired)
            }
            Some(reason) => {
                self.state.send_replace(PlayerState::Cancelled);
                info!("Playback cancelled ({:?}) after {} commands", reason, commands_sent);
                let stop = Command::Stop {
                    deceleration: self.config.stop_deceleration,
                };
                let outcome = match self.sink.send(stop) {
                    Ok(id) => StopOutcome::Sent(id),
                    Err(e) => {
                        warn!("Stop after cancelled playback failed: {}", e);
                        StopOutcome::Failed(e.to_string())
                    }
                };
                (PlayerState::Cancelled, outcome)
            }
        };

        if !degraded.is_empty() {
            warn!("{} waypoints missed their deadline", degraded.len());
        }

        PlaybackReport {
            commands_sent,
            degraded,
            final_state,
            cancel_reason,
            stop,
        }
    }
}

/// Replays tracks through a command sink
pub struct Player {
    sink: Arc<dyn CommandSink>,
    config: PlaybackConfig,
    state: Arc<watch::Sender<PlayerState>>,
    run: Option<JoinHandle<PlaybackReport>>,
}

impl Player {
    pub fn new(sink: Arc<dyn CommandSink>, config: PlaybackConfig) -> Self {
        let (state, _) = watch::channel(PlayerState::Idle);
        Self {
            sink,
            config,
            state: Arc::new(state),
            run: None,
        }
    }

    pub fn state(&self) -> PlayerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PlayerState> {
        self.state.subscribe()
    }

    /// Start playing `track`; returns once the playback task is running
    pub fn play(&mut self, track: Arc<Track>) -> Result<()> {
        if !track.is_playable() {
            return Err(LinkError::InvalidTrack("track has no waypoints".to_string()));
        }
        let scale = self.config.time_scale;
        if !(scale.is_finite() && scale > 0.0 && scale <= MAX_TIME_SCALE) {
            return Err(LinkError::Config(format!(
                "time scale {} outside (0, {}]",
                scale, MAX_TIME_SCALE
            )));
        }

        let started = self.state.send_if_modified(|state| {
            if state.is_active() {
                return false;
            }
            *state = PlayerState::Playing;
            true
        });
        if !started {
            return Err(LinkError::Playback("a track is already playing".to_string()));
        }

        info!(
            "Playing {} waypoints over {:.3}s at {}x",
            track.len(),
            track.duration().as_secs_f64() / scale,
            scale
        );
        let run = Run {
            sink: Arc::clone(&self.sink),
            config: self.config.clone(),
            track,
            state: Arc::clone(&self.state),
        };
        self.run = Some(tokio::spawn(run.drive()));
        Ok(())
    }

    /// Hold playback at the current waypoint
    pub fn pause(&self) -> Result<()> {
        self.transition(PlayerState::Playing, PlayerState::Paused)
    }

    pub fn resume(&self) -> Result<()> {
        self.transition(PlayerState::Paused, PlayerState::Playing)
    }

    /// Abandon playback; the playback task issues a Stop
    pub fn cancel(&self) -> Result<()> {
        let cancelled = self.state.send_if_modified(|state| {
            if !state.is_active() {
                return false;
            }
            *state = PlayerState::Cancelled;
            true
        });
        if cancelled {
            info!("Playback cancel requested");
            Ok(())
        } else {
            Err(LinkError::Playback(format!("cannot cancel while {}", self.state())))
        }
    }

    /// Wait for the current run to finish
    pub async fn wait(&mut self) -> Result<PlaybackReport> {
        let run = self
            .run
            .take()
            .ok_or_else(|| LinkError::Playback("no playback started".to_string()))?;
        match run.await {
            Ok(report) => Ok(report),
            Err(e) => {
                // A dead task can no longer leave the active states itself
                self.state.send_if_modified(|state| {
                    let active = state.is_active();
                    if active {
                        *state = PlayerState::Cancelled;
                    }
                    active
                });
                Err(e.into())
            }
        }
    }

    fn transition(&self, from: PlayerState, to: PlayerState) -> Result<()> {
        let changed = self.state.send_if_modified(|state| {
            if *state != from {
                return false;
            }
            *state = to;
            true
        });
        if changed {
            Ok(())
        } else {
            Err(LinkError::Playback(format!("cannot go to {} while {}", to, self.state())))
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        // The playback task sees the cancel and stops the arm
        self.state.send_if_modified(|state| {
            let active = state.is_active();
            if active {
                *state = PlayerState::Cancelled;
            }
            active
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_command, CommandMessage, Decoded, MOVE_FRAME_LEN, STOP_FRAME_LEN};
    use crate::command::CommandChannel;
    use crate::config::Config;
    use crate::session::Session;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    /// Sink that records what it was sent and when
    struct FakeSink {
        sent: Mutex<Vec<(Instant, Command)>>,
        link: watch::Sender<SessionState>,
        next_id: AtomicU64,
        first_send_delay: Option<Duration>,
    }

    impl FakeSink {
        fn new() -> Arc<Self> {
            Self::with_first_send_delay(None)
        }

        fn with_first_send_delay(delay: Option<Duration>) -> Arc<Self> {
            let (link, _) = watch::channel(SessionState::Connected);
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                link,
                next_id: AtomicU64::new(1),
                first_send_delay: delay,
            })
        }

        fn sent(&self) -> Vec<(Instant, Command)> {
            self.sent.lock().clone()
        }
    }

    impl CommandSink for FakeSink {
        fn send(&self, command: Command) -> Result<CorrelationId> {
            if *self.link.borrow() != SessionState::Connected {
                return Err(LinkError::NotConnected);
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 1 {
                if let Some(delay) = self.first_send_delay {
                    // Stall the caller the way a blocked write would
                    std::thread::sleep(delay);
                }
            }
            self.sent.lock().push((Instant::now(), command));
            Ok(CorrelationId(id))
        }

        fn link_state(&self) -> watch::Receiver<SessionState> {
            self.link.subscribe()
        }
    }

    fn track(offsets: &[f64]) -> Arc<Track> {
        let waypoints = offsets
            .iter()
            .enumerate()
            .map(|(i, offset)| Waypoint {
                offset: *offset,
                joints: [0.1 * i as f64; 6],
                pose: [0.4, 0.0, 0.1 * i as f64, 0.0, 3.14, 0.0],
            })
            .collect();
        Arc::new(Track::from_waypoints(Utc::now(), waypoints).unwrap())
    }

    fn elapsed_secs(sent: &[(Instant, Command)], start: Instant) -> Vec<f64> {
        sent.iter().map(|(at, _)| (*at - start).as_secs_f64()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_follow_offsets() {
        let sink = FakeSink::new();
        let mut player = Player::new(sink.clone(), PlaybackConfig::default());
        let start = Instant::now();
        player.play(track(&[0.0, 0.5, 1.0])).unwrap();

        let report = player.wait().await.unwrap();
        assert_eq!(report.commands_sent, 3);
        assert_eq!(report.final_state, PlayerState::Completed);
        assert_eq!(report.stop, StopOutcome::NotRequired);
        assert!(report.degraded.is_empty());
        assert_eq!(player.state(), PlayerState::Completed);

        let sent = sink.sent();
        let times = elapsed_secs(&sent, start);
        assert_eq!(times.len(), 3);
        assert!(times[0] < 0.01);
        assert!(times[1] >= 0.5 && times[1] < 0.51, "{:?}", times);
        assert!(times[2] >= 1.0 && times[2] < 1.01, "{:?}", times);
        assert!(matches!(sent[1].1, Command::MoveJoint { target, .. } if target == [0.1; 6]));
    }

    #[tokio::test]
    async fn test_delayed_first_send_keeps_schedule() {
        let sink = FakeSink::with_first_send_delay(Some(Duration::from_millis(300)));
        let mut player = Player::new(sink.clone(), PlaybackConfig::default());
        let start = Instant::now();
        player.play(track(&[0.0, 0.5, 1.0])).unwrap();

        let report = player.wait().await.unwrap();
        assert_eq!(report.commands_sent, 3);
        assert!(report.degraded.is_empty());

        let times = elapsed_secs(&sink.sent(), start);
        assert!(times[0] >= 0.3);
        assert!(times[1] >= 0.5 && times[1] < 0.65, "{:?}", times);
    }

    #[tokio::test]
    async fn test_missed_deadline_is_degraded_not_error() {
        let sink = FakeSink::with_first_send_delay(Some(Duration::from_millis(700)));
        let mut player = Player::new(sink.clone(), PlaybackConfig::default());
        let start = Instant::now();
        player.play(track(&[0.0, 0.5, 1.0])).unwrap();

        let report = player.wait().await.unwrap();
        assert_eq!(report.commands_sent, 3);
        assert_eq!(report.final_state, PlayerState::Completed);
        assert_eq!(report.degraded.len(), 1);
        assert_eq!(report.degraded[0].waypoint, 1);
        assert!(report.degraded[0].lateness >= Duration::from_millis(150));

        let times = elapsed_secs(&sink.sent(), start);
        assert!(times[1] >= 0.7 && times[1] < 0.85, "{:?}", times);
        assert!(times[2] >= 1.0, "{:?}", times);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_sends_stop_last() {
        let sink = FakeSink::new();
        let mut player = Player::new(sink.clone(), PlaybackConfig::default());
        player.play(track(&[0.0, 1.0, 2.0, 3.0])).unwrap();

        sleep(Duration::from_millis(1500)).await;
        player.cancel().unwrap();
        let report = player.wait().await.unwrap();

        assert_eq!(report.final_state, PlayerState::Cancelled);
        assert_eq!(report.cancel_reason, Some(CancelReason::Requested));
        assert_eq!(report.commands_sent, 2);
        assert!(matches!(report.stop, StopOutcome::Sent(_)));

        sleep(Duration::from_secs(5)).await;
        let sent = sink.sent();
        assert_eq!(sent.len(), 3);
        assert!(matches!(sent[2].1, Command::Stop { deceleration } if deceleration == 2.0));
        assert!(player.cancel().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_shifts_deadlines() {
        let sink = FakeSink::new();
        let mut player = Player::new(sink.clone(), PlaybackConfig::default());
        let start = Instant::now();
        player.play(track(&[0.0, 1.0])).unwrap();

        sleep(Duration::from_millis(200)).await;
        player.pause().unwrap();
        assert_eq!(player.state(), PlayerState::Paused);
        assert!(player.pause().is_err());

        sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.sent().len(), 1);
        player.resume().unwrap();

        let report = player.wait().await.unwrap();
        assert_eq!(report.commands_sent, 2);
        assert!(report.degraded.is_empty());
        let times = elapsed_secs(&sink.sent(), start);
        assert!(times[1] >= 3.0 && times[1] < 3.01, "{:?}", times);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_scale_and_linear_mode() {
        let sink = FakeSink::new();
        let config = PlaybackConfig {
            mode: PlaybackMode::Linear,
            time_scale: 2.0,
            ..PlaybackConfig::default()
        };
        let mut player = Player::new(sink.clone(), config);
        let start = Instant::now();
        player.play(track(&[0.0, 1.0])).unwrap();
        player.wait().await.unwrap();

        let sent = sink.sent();
        let times = elapsed_secs(&sent, start);
        assert!(times[1] >= 0.5 && times[1] < 0.51, "{:?}", times);
        assert!(matches!(sent[1].1, Command::MoveLinear { target, .. } if target[2] == 0.1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_cancels_playback() {
        let sink = FakeSink::new();
        let mut player = Player::new(sink.clone(), PlaybackConfig::default());
        player.play(track(&[0.0, 1.0, 2.0])).unwrap();

        sleep(Duration::from_millis(500)).await;
        sink.link.send_replace(SessionState::Reconnecting);
        let report = player.wait().await.unwrap();

        assert_eq!(report.final_state, PlayerState::Cancelled);
        assert_eq!(report.cancel_reason, Some(CancelReason::LinkLost));
        assert_eq!(report.commands_sent, 1);
        assert!(matches!(report.stop, StopOutcome::Failed(_)));
        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offset_beyond_clock_cancels_with_stop() {
        let sink = FakeSink::new();
        let config = PlaybackConfig {
            time_scale: 1e-15,
            ..PlaybackConfig::default()
        };
        let mut player = Player::new(sink.clone(), config);
        player.play(track(&[0.0, 600_000.0, 600_001.0])).unwrap();

        let report = player.wait().await.unwrap();
        assert_eq!(report.final_state, PlayerState::Cancelled);
        assert_eq!(report.cancel_reason, Some(CancelReason::UnschedulableWaypoint(1)));
        assert_eq!(report.commands_sent, 1);
        assert!(matches!(report.stop, StopOutcome::Sent(_)));
        assert_eq!(player.state(), PlayerState::Cancelled);

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].1.is_stop());

        // The player is reusable afterwards
        player.play(track(&[0.0])).unwrap();
        assert_eq!(player.wait().await.unwrap().final_state, PlayerState::Completed);
    }

    #[tokio::test]
    async fn test_play_rejections() {
        let sink = FakeSink::new();
        let mut player = Player::new(sink.clone(), PlaybackConfig::default());

        let empty = Arc::new(Track::from_waypoints(Utc::now(), Vec::new()).unwrap());
        assert!(matches!(player.play(empty), Err(LinkError::InvalidTrack(_))));
        assert!(matches!(player.wait().await, Err(LinkError::Playback(_))));

        player.play(track(&[0.0, 30.0])).unwrap();
        assert!(matches!(player.play(track(&[0.0])), Err(LinkError::Playback(_))));
        player.cancel().unwrap();
        player.wait().await.unwrap();

        let mut fast = Player::new(sink, PlaybackConfig { time_scale: 6.0, ..PlaybackConfig::default() });
        assert!(matches!(fast.play(track(&[0.0])), Err(LinkError::Config(_))));
    }

    #[tokio::test]
    async fn test_cancel_over_live_session_ends_with_stop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = Config::default();
        config.controller.host = "127.0.0.1".to_string();
        config.controller.port = listener.local_addr().unwrap().port();
        config.connection.idle_timeout = 30.0;

        let controller = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut frames = vec![0u8; 2 * MOVE_FRAME_LEN + STOP_FRAME_LEN];
            socket.read_exact(&mut frames).await.unwrap();
            let mut commands = Vec::new();
            let mut rest = frames.as_slice();
            while let Decoded::Frame { message, consumed } = decode_command(rest, 4096) {
                commands.push(message);
                rest = &rest[consumed..];
            }
            commands
        });

        let session = Session::connect(&config).await.unwrap();
        let channel = Arc::new(CommandChannel::new(session.handle()));
        let mut player = Player::new(channel, config.playback.clone());
        player.play(track(&[0.0, 0.2, 5.0])).unwrap();

        sleep(Duration::from_millis(400)).await;
        player.cancel().unwrap();
        let report = player.wait().await.unwrap();
        assert_eq!(report.commands_sent, 2);

        let commands: Vec<CommandMessage> =
            tokio::time::timeout(Duration::from_secs(5), controller).await.unwrap().unwrap();
        assert_eq!(commands.len(), 3);
        assert!(commands[2].command.is_stop());
        assert!(commands[0].id < commands[1].id && commands[1].id < commands[2].id);
        assert_eq!(session.handle().pending_commands(), 0);
        session.close().await.unwrap();
    }
}
