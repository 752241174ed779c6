//! Recorded tracks and their on-disk format
//!
//! A track file is JSON lines: a header line followed by one waypoint per line.
//!
//! ```text
//! {"format":"cb2link-track","version":1,"recorded_at":"2026-10-16T09:30:00Z","waypoints":2}
//! {"offset":0.0,"joints":[...],"pose":[...]}
//! {"offset":0.008,"joints":[...],"pose":[...]}
//! ```

use crate::codec::RobotState;
use crate::{LinkError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

pub const TRACK_FORMAT: &str = "cb2link-track";
pub const TRACK_VERSION: u32 = 1;

/// Largest waypoint offset a track may carry, in seconds (one week)
pub const MAX_WAYPOINT_OFFSET: f64 = 604_800.0;

// Header counts are untrusted; preallocate at most this many waypoints
const PREALLOCATE_LIMIT: usize = 4096;

/// One recorded pose and when it was reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    /// Seconds since the first waypoint of the track
    pub offset: f64,
    pub joints: [f64; 6],
    pub pose: [f64; 6],
}

impl Waypoint {
    pub fn from_state(offset: f64, state: &RobotState) -> Self {
        Self {
            offset,
            joints: state.joint_positions,
            pose: state.tool_pose,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TrackHeader {
    format: String,
    version: u32,
    recorded_at: DateTime<Utc>,
    waypoints: usize,
}

/// A sealed sequence of waypoints with strictly increasing offsets
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    recorded_at: DateTime<Utc>,
    waypoints: Vec<Waypoint>,
}

impl Track {
    /// Build a track, checking that offsets lie in `[0, MAX_WAYPOINT_OFFSET]` and strictly increase
    pub fn from_waypoints(recorded_at: DateTime<Utc>, waypoints: Vec<Waypoint>) -> Result<Self> {
        let mut previous: Option<f64> = None;
        for (i, waypoint) in waypoints.iter().enumerate() {
            if !(0.0..=MAX_WAYPOINT_OFFSET).contains(&waypoint.offset) {
                return Err(LinkError::InvalidTrack(format!(
                    "waypoint {} has invalid offset {}",
                    i, waypoint.offset
                )));
            }
            if let Some(prev) = previous {
                if waypoint.offset <= prev {
                    return Err(LinkError::InvalidTrack(format!(
                        "waypoint {} offset {} does not follow {}",
                        i, waypoint.offset, prev
                    )));
                }
            }
            if waypoint.joints.iter().chain(&waypoint.pose).any(|v| !v.is_finite()) {
                return Err(LinkError::InvalidTrack(format!("waypoint {} has a non-finite pose", i)));
            }
            previous = Some(waypoint.offset);
        }
        Ok(Self { recorded_at, waypoints })
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    /// A track needs at least one waypoint to be played
    pub fn is_playable(&self) -> bool {
        !self.waypoints.is_empty()
    }

    /// Offset of the last waypoint
    pub fn duration(&self) -> Duration {
        self.waypoints
            .last()
            .and_then(|w| Duration::try_from_secs_f64(w.offset).ok())
            .unwrap_or_default()
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let header = TrackHeader {
            format: TRACK_FORMAT.to_string(),
            version: TRACK_VERSION,
            recorded_at: self.recorded_at,
            waypoints: self.waypoints.len(),
        };
        serde_json::to_writer(&mut *writer, &header)?;
        writer.write_all(b"\n")?;
        for waypoint in &self.waypoints {
            serde_json::to_writer(&mut *writer, waypoint)?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    pub fn read_from<R: BufRead>(reader: R) -> Result<Self> {
        let mut lines = reader.lines();
        let header_line = lines
            .next()
            .ok_or_else(|| LinkError::InvalidTrack("empty track file".to_string()))??;
        let header: TrackHeader = serde_json::from_str(&header_line)
            .map_err(|e| LinkError::InvalidTrack(format!("bad header: {}", e)))?;

        if header.format != TRACK_FORMAT {
            return Err(LinkError::InvalidTrack(format!("unknown format '{}'", header.format)));
        }
        if header.version != TRACK_VERSION {
            return Err(LinkError::InvalidTrack(format!(
                "unsupported track version {}",
                header.version
            )));
        }

        let mut waypoints = Vec::with_capacity(header.waypoints.min(PREALLOCATE_LIMIT));
        for (i, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let waypoint: Waypoint = serde_json::from_str(&line)
                .map_err(|e| LinkError::InvalidTrack(format!("line {}: {}", i + 2, e)))?;
            waypoints.push(waypoint);
        }

        if waypoints.len() != header.waypoints {
            return Err(LinkError::InvalidTrack(format!(
                "header announces {} waypoints, found {}",
                header.waypoints,
                waypoints.len()
            )));
        }
        Self::from_waypoints(header.recorded_at, waypoints)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| LinkError::InvalidTrack(format!("cannot open {}: {}", path.display(), e)))?;
        Self::read_from(BufReader::new(file))
    }
}
