//! Track recording from live telemetry
//!
//! The recorder runs as its own task holding a telemetry subscription.
//! Offsets come from the local monotonic clock, starting at 0.0 with the
//! first recorded sample, so a track stays valid when replayed against a
//! different controller session.

use crate::codec::RobotState;
use crate::config::{RecordingConfig, RecordingMode};
use crate::telemetry::{Subscription, TelemetryHub};
use crate::track::{Track, Waypoint, MAX_WAYPOINT_OFFSET};
use crate::{LinkError, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
}

/// Sampling filter and waypoint accumulator
struct WaypointLog {
    policy: RecordingConfig,
    origin: Option<Instant>,
    last_recorded: Option<Instant>,
    waypoints: Vec<Waypoint>,
    skipped: u64,
}

impl WaypointLog {
    fn new(policy: RecordingConfig) -> Self {
        Self {
            policy,
            origin: None,
            last_recorded: None,
            waypoints: Vec::new(),
            skipped: 0,
        }
    }

    /// Apply the sampling policy, then append
    fn offer(&mut self, now: Instant, state: &RobotState) -> bool {
        if let (Some(last), Some(last_at)) = (self.waypoints.last(), self.last_recorded) {
            let elapsed = now.saturating_duration_since(last_at).as_secs_f64();
            let epsilon = self.policy.pose_epsilon;
            let unmoved = last
                .joints
                .iter()
                .zip(&state.joint_positions)
                .chain(last.pose.iter().zip(&state.tool_pose))
                .all(|(a, b)| (a - b).abs() < epsilon);
            if elapsed < self.policy.min_interval && unmoved {
                self.skipped += 1;
                return false;
            }
        }
        self.append(now, state)
    }

    /// Append without the sampling filter; offsets must still increase
    fn append(&mut self, now: Instant, state: &RobotState) -> bool {
        if state.joint_positions.iter().chain(&state.tool_pose).any(|v| !v.is_finite()) {
            warn!("Skipping snapshot {} with a non-finite joint or pose value", state.timestamp);
            self.skipped += 1;
            return false;
        }
        let origin = *self.origin.get_or_insert(now);
        let offset = now.saturating_duration_since(origin).as_secs_f64();
        if offset > MAX_WAYPOINT_OFFSET {
            self.skipped += 1;
            return false;
        }
        if let Some(last) = self.waypoints.last() {
            if offset <= last.offset {
                self.skipped += 1;
                return false;
            }
        }
        self.waypoints.push(Waypoint::from_state(offset, state));
        self.last_recorded = Some(now);
        true
    }
}

struct RecordingOutcome {
    waypoints: Vec<Waypoint>,
    skipped: u64,
    dropped: u64,
}

async fn record(
    mut subscription: Subscription,
    policy: RecordingConfig,
    mut stop: oneshot::Receiver<()>,
    mut captures: mpsc::UnboundedReceiver<()>,
) -> RecordingOutcome {
    let mode = policy.mode;
    let mut log = WaypointLog::new(policy);
    let mut latest: Option<RobotState> = None;

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            Some(()) = captures.recv() => match &latest {
                Some(state) => {
                    if log.append(Instant::now(), state) {
                        info!("Captured waypoint {}", log.waypoints.len());
                    }
                }
                None => warn!("Capture requested before any telemetry arrived"),
            },
            received = subscription.recv() => match received {
                Ok(state) => match mode {
                    RecordingMode::Continuous => {
                        log.offer(Instant::now(), &state);
                    }
                    RecordingMode::OnDemand => latest = Some(state),
                },
                Err(reason) => {
                    warn!("Telemetry ended during recording: {}", reason);
                    break;
                }
            },
        }
    }

    RecordingOutcome {
        dropped: subscription.dropped(),
        skipped: log.skipped,
        waypoints: log.waypoints,
    }
}

struct ActiveRecording {
    stop: oneshot::Sender<()>,
    captures: mpsc::UnboundedSender<()>,
    task: JoinHandle<RecordingOutcome>,
    recorded_at: DateTime<Utc>,
}

/// Captures telemetry into a [`Track`]
pub struct Recorder {
    policy: RecordingConfig,
    active: Option<ActiveRecording>,
}

impl Recorder {
    pub fn new(policy: RecordingConfig) -> Self {
        Self { policy, active: None }
    }

    pub fn state(&self) -> RecorderState {
        if self.active.is_some() {
            RecorderState::Recording
        } else {
            RecorderState::Idle
        }
    }

    pub fn mode(&self) -> RecordingMode {
        self.policy.mode
    }

    /// Subscribe to `hub` and begin a new track
    pub fn start(&mut self, hub: &TelemetryHub) -> Result<()> {
        if self.active.is_some() {
            return Err(LinkError::Recording("already recording".to_string()));
        }
        let subscription = hub.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(record(subscription, self.policy.clone(), stop_rx, capture_rx));

        info!("Recording started ({:?} mode)", self.policy.mode);
        self.active = Some(ActiveRecording {
            stop: stop_tx,
            captures: capture_tx,
            task,
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    /// Record the most recent snapshot as a waypoint (on-demand mode)
    pub fn capture(&self) -> Result<()> {
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| LinkError::Recording("not recording".to_string()))?;
        if self.policy.mode != RecordingMode::OnDemand {
            return Err(LinkError::Recording("capture requires on-demand mode".to_string()));
        }
        active
            .captures
            .send(())
            .map_err(|_| LinkError::Recording("recording task has ended".to_string()))
    }

    /// Stop recording, release the subscription and seal the track
    pub async fn stop(&mut self) -> Result<Track> {
        let active = self
            .active
            .take()
            .ok_or_else(|| LinkError::Recording("not recording".to_string()))?;

        // The task may already have ended with the telemetry stream
        let _ = active.stop.send(());
        let outcome = active.task.await?;

        if outcome.dropped > 0 {
            warn!("Recorder fell behind and lost {} snapshots", outcome.dropped);
        }
        debug!("Sampling skipped {} snapshots", outcome.skipped);
        info!("Recording stopped with {} waypoints", outcome.waypoints.len());
        Track::from_waypoints(active.recorded_at, outcome.waypoints)
    }
}
