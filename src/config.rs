//! Configuration loading for the controller link

use crate::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default real-time client port on CB2 controllers
pub const CB2_REALTIME_PORT: u16 = 30003;

/// Longest accepted connection timeout or retry delay, in seconds
pub const MAX_DURATION_SECS: f64 = 86_400.0;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub controller: ControllerConfig,
    pub connection: ConnectionConfig,
    pub protocol: ProtocolConfig,
    pub telemetry: TelemetryConfig,
    pub safety: SafetyEnvelope,
    pub recording: RecordingConfig,
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub host: String,
    pub port: u16,
}

/// Socket timing and reconnect budget, all durations in seconds
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout: f64,
    pub idle_timeout: f64,
    pub retry_attempts: u32,
    pub retry_delay: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub max_message_size: usize,
    /// Consecutive malformed frames tolerated before the link is dropped
    pub malformed_threshold: u32,
    pub outbound_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub queue_capacity: usize,
}

/// Limits every outgoing command is checked against
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SafetyEnvelope {
    pub joint_min: [f64; 6],
    pub joint_max: [f64; 6],
    /// Tool pose bounds: x, y, z in metres, then the rotation vector
    pub pose_min: [f64; 6],
    pub pose_max: [f64; 6],
    pub max_joint_speed: f64,
    pub max_joint_acceleration: f64,
    pub max_linear_speed: f64,
    pub max_linear_acceleration: f64,
    pub max_deceleration: f64,
    pub digital_outputs: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMode {
    /// Every snapshot that passes the sampling filter becomes a waypoint
    Continuous,
    /// Only snapshots explicitly captured become waypoints
    OnDemand,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub mode: RecordingMode,
    /// Seconds; 0 records every snapshot
    pub min_interval: f64,
    pub pose_epsilon: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    /// Replay recorded joint angles with MoveJoint
    Joint,
    /// Replay recorded tool poses with MoveLinear
    Linear,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub mode: PlaybackMode,
    pub speed: f64,
    pub acceleration: f64,
    /// Playback speed factor applied to waypoint offsets
    pub time_scale: f64,
    pub stop_deceleration: f64,
}

/// Upper bound on the playback speed factor
pub const MAX_TIME_SCALE: f64 = 5.0;

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: CB2_REALTIME_PORT,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 5.0,
            idle_timeout: 2.0,
            retry_attempts: 3,
            retry_delay: 1.0,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_message_size: 4096,
            malformed_threshold: 8,
            outbound_capacity: 256,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

impl Default for SafetyEnvelope {
    fn default() -> Self {
        let turn = 2.0 * std::f64::consts::PI;
        Self {
            joint_min: [-turn; 6],
            joint_max: [turn; 6],
            pose_min: [-1.5, -1.5, -1.5, -turn, -turn, -turn],
            pose_max: [1.5, 1.5, 1.5, turn, turn, turn],
            max_joint_speed: 3.14,
            max_joint_acceleration: 40.0,
            max_linear_speed: 1.0,
            max_linear_acceleration: 15.0,
            max_deceleration: 40.0,
            digital_outputs: 10,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            mode: RecordingMode::Continuous,
            min_interval: 0.0,
            pose_epsilon: 0.0,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            mode: PlaybackMode::Joint,
            speed: 0.3,
            acceleration: 1.3,
            time_scale: 1.0,
            stop_deceleration: 2.0,
        }
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.min(MAX_DURATION_SECS)).unwrap_or_default()
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        seconds(self.connect_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        seconds(self.idle_timeout)
    }

    pub fn retry_delay(&self) -> Duration {
        seconds(self.retry_delay)
    }
}

impl Config {
    /// Load a YAML configuration file; missing sections take their defaults
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| LinkError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the link or playback misbehave
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(LinkError::Config(format!("{} must be positive, got {}", name, value)))
            }
        };

        positive("connection.connect_timeout", self.connection.connect_timeout)?;
        positive("connection.idle_timeout", self.connection.idle_timeout)?;
        if !(self.connection.retry_delay.is_finite() && self.connection.retry_delay >= 0.0) {
            return Err(LinkError::Config("connection.retry_delay must be >= 0".to_string()));
        }
        for (name, value) in [
            ("connection.connect_timeout", self.connection.connect_timeout),
            ("connection.idle_timeout", self.connection.idle_timeout),
            ("connection.retry_delay", self.connection.retry_delay),
        ] {
            if value > MAX_DURATION_SECS {
                return Err(LinkError::Config(format!(
                    "{} {} exceeds the maximum of {} seconds",
                    name, value, MAX_DURATION_SECS
                )));
            }
        }

        if self.protocol.max_message_size < crate::codec::STATE_FRAME_LEN {
            return Err(LinkError::Config(format!(
                "protocol.max_message_size must be at least {}",
                crate::codec::STATE_FRAME_LEN
            )));
        }
        if self.protocol.outbound_capacity == 0 {
            return Err(LinkError::Config("protocol.outbound_capacity must be > 0".to_string()));
        }
        if self.telemetry.queue_capacity == 0 {
            return Err(LinkError::Config("telemetry.queue_capacity must be > 0".to_string()));
        }

        for (i, (min, max)) in self.safety.joint_min.iter().zip(&self.safety.joint_max).enumerate() {
            if !(min.is_finite() && max.is_finite() && min < max) {
                return Err(LinkError::Config(format!("safety joint {} range is empty or not finite", i)));
            }
        }
        for (i, (min, max)) in self.safety.pose_min.iter().zip(&self.safety.pose_max).enumerate() {
            if !(min.is_finite() && max.is_finite() && min < max) {
                return Err(LinkError::Config(format!("safety pose axis {} range is empty or not finite", i)));
            }
        }
        positive("safety.max_joint_speed", self.safety.max_joint_speed)?;
        positive("safety.max_joint_acceleration", self.safety.max_joint_acceleration)?;
        positive("safety.max_linear_speed", self.safety.max_linear_speed)?;
        positive("safety.max_linear_acceleration", self.safety.max_linear_acceleration)?;
        positive("safety.max_deceleration", self.safety.max_deceleration)?;

        if !(self.recording.min_interval.is_finite() && self.recording.min_interval >= 0.0) {
            return Err(LinkError::Config("recording.min_interval must be >= 0".to_string()));
        }
        if !(self.recording.pose_epsilon.is_finite() && self.recording.pose_epsilon >= 0.0) {
            return Err(LinkError::Config("recording.pose_epsilon must be >= 0".to_string()));
        }

        positive("playback.speed", self.playback.speed)?;
        positive("playback.acceleration", self.playback.acceleration)?;
        positive("playback.stop_deceleration", self.playback.stop_deceleration)?;
        positive("playback.time_scale", self.playback.time_scale)?;
        if self.playback.time_scale > MAX_TIME_SCALE {
            return Err(LinkError::Config(format!(
                "playback.time_scale {} exceeds the maximum of {}",
                self.playback.time_scale, MAX_TIME_SCALE
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.controller.port, CB2_REALTIME_PORT);
        assert_eq!(config.recording.min_interval, 0.0);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
controller:
  host: 10.0.0.5
protocol:
  malformed_threshold: 3
playback:
  mode: linear
  time_scale: 0.5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.controller.host, "10.0.0.5");
        assert_eq!(config.controller.port, CB2_REALTIME_PORT);
        assert_eq!(config.protocol.malformed_threshold, 3);
        assert_eq!(config.protocol.max_message_size, 4096);
        assert_eq!(config.playback.mode, PlaybackMode::Linear);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.playback.time_scale = 8.0;
        assert!(matches!(config.validate(), Err(LinkError::Config(_))));

        let mut config = Config::default();
        config.safety.joint_min[2] = 1.0;
        config.safety.joint_max[2] = -1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.protocol.max_message_size = 32;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.safety.pose_max[0] = config.safety.pose_min[0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_durations() {
        for field in ["connect_timeout", "idle_timeout", "retry_delay"] {
            let yaml = format!("connection:\n  {}: 1e30\n", field);
            let config: Config = serde_yaml::from_str(&yaml).unwrap();
            assert!(matches!(config.validate(), Err(LinkError::Config(_))), "{}", field);
            // Getters stay usable even on an unvalidated config
            assert!(config.connection.connect_timeout() <= Duration::from_secs(86_400));
            assert!(config.connection.idle_timeout() <= Duration::from_secs(86_400));
            assert!(config.connection.retry_delay() <= Duration::from_secs(86_400));
        }

        let mut config = Config::default();
        config.connection.idle_timeout = MAX_DURATION_SECS;
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.idle_timeout(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/cb2link.yaml");
        let config = Config::load_from_path(path).unwrap();
        let defaults = Config::default();
        assert_eq!(config.controller.port, defaults.controller.port);
        assert_eq!(config.safety.joint_max, defaults.safety.joint_max);
        assert_eq!(config.safety.pose_min, defaults.safety.pose_min);
        assert_eq!(config.safety.pose_max, defaults.safety.pose_max);
        assert_eq!(config.recording.mode, RecordingMode::Continuous);
        assert_eq!(config.playback.mode, PlaybackMode::Joint);
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link.yaml");
        fs::write(&path, "connection:\n  idle_timeout: 0.5\n  retry_attempts: 1\n").unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.connection.idle_timeout(), Duration::from_millis(500));
        assert_eq!(config.connection.retry_attempts, 1);

        let missing = Config::load_from_path(dir.path().join("nope.yaml"));
        assert!(matches!(missing, Err(LinkError::Config(_))));
    }
}
