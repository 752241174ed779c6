//! Binary codec for the controller link
//!
//! Every frame on the wire starts with the same six byte header:
//!
//! ```text
//! u32  length   total frame size, including the length field itself
//! u8   version  PROTOCOL_VERSION
//! u8   kind     MessageKind
//! ```
//!
//! followed by a fixed body per kind. All integers and doubles are big-endian.
//! Frames longer than their kind's fixed body are accepted and the trailing
//! bytes skipped, so a newer controller may append fields to an existing kind.
//!
//! Decoding is a pure function of the buffer: it never blocks and never keeps
//! the buffer. `NeedMoreData` is not an error; `Malformed` is always reported
//! and it is up to the caller to resynchronise.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const PROTOCOL_VERSION: u8 = 1;

/// length + version + kind
pub const HEADER_LEN: usize = 6;

const F64_LEN: usize = 8;
const ID_LEN: usize = 8;

/// 6 joint angles, 6 joint velocities, 6 pose values, 2 mode bytes, timestamp
pub const STATE_FRAME_LEN: usize = HEADER_LEN + 18 * F64_LEN + 2 + F64_LEN;
pub const ACK_FRAME_LEN: usize = HEADER_LEN + ID_LEN + 1;
pub const MOVE_FRAME_LEN: usize = HEADER_LEN + ID_LEN + 8 * F64_LEN;
pub const STOP_FRAME_LEN: usize = HEADER_LEN + ID_LEN + F64_LEN;
pub const DIGITAL_OUTPUT_FRAME_LEN: usize = HEADER_LEN + ID_LEN + 2;

/// Message kinds carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    RobotState = 0x01,
    Acknowledgement = 0x02,
    MoveJoint = 0x10,
    MoveLinear = 0x11,
    Stop = 0x12,
    SetDigitalOutput = 0x13,
}

impl MessageKind {
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(MessageKind::RobotState),
            0x02 => Some(MessageKind::Acknowledgement),
            0x10 => Some(MessageKind::MoveJoint),
            0x11 => Some(MessageKind::MoveLinear),
            0x12 => Some(MessageKind::Stop),
            0x13 => Some(MessageKind::SetDigitalOutput),
            _ => None,
        }
    }

    /// Smallest frame able to hold this kind's fixed fields
    pub fn min_frame_len(self) -> usize {
        match self {
            MessageKind::RobotState => STATE_FRAME_LEN,
            MessageKind::Acknowledgement => ACK_FRAME_LEN,
            MessageKind::MoveJoint | MessageKind::MoveLinear => MOVE_FRAME_LEN,
            MessageKind::Stop => STOP_FRAME_LEN,
            MessageKind::SetDigitalOutput => DIGITAL_OUTPUT_FRAME_LEN,
        }
    }

    /// True for kinds sent by the controller
    pub fn from_controller(self) -> bool {
        matches!(self, MessageKind::RobotState | MessageKind::Acknowledgement)
    }
}

/// Robot operational mode as reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RobotMode {
    Disconnected,
    PowerOff,
    Idle,
    Running,
    Fault,
}

impl RobotMode {
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(RobotMode::Disconnected),
            1 => Some(RobotMode::PowerOff),
            2 => Some(RobotMode::Idle),
            3 => Some(RobotMode::Running),
            4 => Some(RobotMode::Fault),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            RobotMode::Disconnected => 0,
            RobotMode::PowerOff => 1,
            RobotMode::Idle => 2,
            RobotMode::Running => 3,
            RobotMode::Fault => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RobotMode::Disconnected => "DISCONNECTED",
            RobotMode::PowerOff => "POWER_OFF",
            RobotMode::Idle => "IDLE",
            RobotMode::Running => "RUNNING",
            RobotMode::Fault => "FAULT",
        }
    }
}

/// Safety system mode as reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyMode {
    Normal,
    ReducedSpeed,
    ProtectiveStop,
    EmergencyStop,
}

impl SafetyMode {
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(SafetyMode::Normal),
            1 => Some(SafetyMode::ReducedSpeed),
            2 => Some(SafetyMode::ProtectiveStop),
            3 => Some(SafetyMode::EmergencyStop),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            SafetyMode::Normal => 0,
            SafetyMode::ReducedSpeed => 1,
            SafetyMode::ProtectiveStop => 2,
            SafetyMode::EmergencyStop => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SafetyMode::Normal => "NORMAL",
            SafetyMode::ReducedSpeed => "REDUCED",
            SafetyMode::ProtectiveStop => "PROTECTIVE_STOP",
            SafetyMode::EmergencyStop => "EMERGENCY_STOP",
        }
    }

    /// Whether the safety system is currently holding the arm
    pub fn is_stopped(self) -> bool {
        matches!(self, SafetyMode::ProtectiveStop | SafetyMode::EmergencyStop)
    }
}

/// Which coordinate set a goal is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateSpace {
    Joint,
    Cartesian,
}

/// One decoded status packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotState {
    /// Seconds since controller boot
    pub timestamp: f64,
    /// Joint angles in radians
    pub joint_positions: [f64; 6],
    /// Joint velocities in rad/s
    pub joint_velocities: [f64; 6],
    /// Tool pose [x, y, z, rx, ry, rz] in meters and an axis-angle rotation vector
    pub tool_pose: [f64; 6],
    pub robot_mode: RobotMode,
    pub safety_mode: SafetyMode,
}

impl RobotState {
    /// Whether every joint is moving slower than `tolerance` rad/s
    pub fn is_stopped(&self, tolerance: f64) -> bool {
        self.joint_velocities.iter().all(|v| v.abs() < tolerance)
    }

    /// Whether the arm is within `tolerance` of `goal` on every axis
    pub fn at_goal(&self, goal: &[f64; 6], space: CoordinateSpace, tolerance: f64) -> bool {
        let actual = match space {
            CoordinateSpace::Joint => &self.joint_positions,
            CoordinateSpace::Cartesian => &self.tool_pose,
        };
        actual.iter().zip(goal).all(|(a, g)| (a - g).abs() < tolerance)
    }
}

/// Identifier matching a sent command to its acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Commands understood by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    MoveJoint {
        target: [f64; 6],
        speed: f64,
        acceleration: f64,
    },
    MoveLinear {
        target: [f64; 6],
        speed: f64,
        acceleration: f64,
    },
    Stop {
        deceleration: f64,
    },
    SetDigitalOutput {
        index: u8,
        value: bool,
    },
}

impl Command {
    pub fn kind(&self) -> MessageKind {
        match self {
            Command::MoveJoint { .. } => MessageKind::MoveJoint,
            Command::MoveLinear { .. } => MessageKind::MoveLinear,
            Command::Stop { .. } => MessageKind::Stop,
            Command::SetDigitalOutput { .. } => MessageKind::SetDigitalOutput,
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Command::Stop { .. })
    }
}

/// A command tagged with the correlation id it was sent under
#[derive(Debug, Clone, PartialEq)]
pub struct CommandMessage {
    pub id: CorrelationId,
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    Accepted,
    Rejected,
    Completed,
}

impl AckStatus {
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(AckStatus::Accepted),
            1 => Some(AckStatus::Rejected),
            2 => Some(AckStatus::Completed),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            AckStatus::Accepted => 0,
            AckStatus::Rejected => 1,
            AckStatus::Completed => 2,
        }
    }
}

/// Controller response to a previously sent command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub id: CorrelationId,
    pub status: AckStatus,
}

/// Frames sent from controller to client
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerMessage {
    State(RobotState),
    Ack(Acknowledgement),
}

/// Why a frame could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Malformed {
    #[error("announced length {announced} is below the minimum of {min}")]
    TooShort { announced: usize, min: usize },
    #[error("announced length {announced} exceeds the maximum of {max}")]
    TooLong { announced: usize, max: usize },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown message kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("message kind {0:?} is not valid in this direction")]
    UnexpectedKind(MessageKind),
    #[error("undefined robot mode {0}")]
    InvalidRobotMode(u8),
    #[error("undefined safety mode {0}")]
    InvalidSafetyMode(u8),
    #[error("undefined acknowledgement status {0}")]
    InvalidAckStatus(u8),
    #[error("digital output value must be 0 or 1, got {0}")]
    InvalidDigitalValue(u8),
}

/// Outcome of one decode attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    /// A whole frame; `consumed` bytes belong to it
    Frame { message: T, consumed: usize },
    /// The buffer holds a prefix of a frame
    NeedMoreData,
    Malformed(Malformed),
}

/// Validate the header at the start of `buf`
///
/// Returns `Ok(None)` when more bytes are needed before the frame is complete.
fn frame_header(buf: &[u8], max_len: usize) -> Result<Option<(usize, MessageKind)>, Malformed> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let announced = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if announced < HEADER_LEN {
        return Err(Malformed::TooShort { announced, min: HEADER_LEN });
    }
    if announced > max_len {
        return Err(Malformed::TooLong { announced, max: max_len });
    }
    if buf.len() < announced {
        return Ok(None);
    }

    if buf[4] != PROTOCOL_VERSION {
        return Err(Malformed::UnsupportedVersion(buf[4]));
    }
    let kind = MessageKind::from_wire(buf[5]).ok_or(Malformed::UnknownKind(buf[5]))?;
    if announced < kind.min_frame_len() {
        return Err(Malformed::TooShort { announced, min: kind.min_frame_len() });
    }
    Ok(Some((announced, kind)))
}

fn get_vector6(body: &mut &[u8]) -> [f64; 6] {
    let mut values = [0.0; 6];
    for value in values.iter_mut() {
        *value = body.get_f64();
    }
    values
}

fn put_vector6(out: &mut BytesMut, values: &[f64; 6]) {
    for value in values {
        out.put_f64(*value);
    }
}

fn put_header(out: &mut BytesMut, len: usize, kind: MessageKind) {
    out.put_u32(len as u32);
    out.put_u8(PROTOCOL_VERSION);
    out.put_u8(kind as u8);
}

/// Decode one controller frame from the start of `buf`
pub fn decode_controller_message(buf: &[u8], max_len: usize) -> Decoded<ControllerMessage> {
    let (len, kind) = match frame_header(buf, max_len) {
        Ok(Some(header)) => header,
        Ok(None) => return Decoded::NeedMoreData,
        Err(reason) => return Decoded::Malformed(reason),
    };
    let mut body = &buf[HEADER_LEN..len];

    let message = match kind {
        MessageKind::RobotState => {
            let joint_positions = get_vector6(&mut body);
            let joint_velocities = get_vector6(&mut body);
            let tool_pose = get_vector6(&mut body);
            let mode_raw = body.get_u8();
            let safety_raw = body.get_u8();
            let timestamp = body.get_f64();

            let Some(robot_mode) = RobotMode::from_wire(mode_raw) else {
                return Decoded::Malformed(Malformed::InvalidRobotMode(mode_raw));
            };
            let Some(safety_mode) = SafetyMode::from_wire(safety_raw) else {
                return Decoded::Malformed(Malformed::InvalidSafetyMode(safety_raw));
            };

            ControllerMessage::State(RobotState {
                timestamp,
                joint_positions,
                joint_velocities,
                tool_pose,
                robot_mode,
                safety_mode,
            })
        }
        MessageKind::Acknowledgement => {
            let id = CorrelationId(body.get_u64());
            let status_raw = body.get_u8();
            let Some(status) = AckStatus::from_wire(status_raw) else {
                return Decoded::Malformed(Malformed::InvalidAckStatus(status_raw));
            };
            ControllerMessage::Ack(Acknowledgement { id, status })
        }
        other => return Decoded::Malformed(Malformed::UnexpectedKind(other)),
    };

    Decoded::Frame { message, consumed: len }
}

/// Decode one command frame from the start of `buf`
///
/// Used by controller-side tooling and simulators.
pub fn decode_command(buf: &[u8], max_len: usize) -> Decoded<CommandMessage> {
    let (len, kind) = match frame_header(buf, max_len) {
        Ok(Some(header)) => header,
        Ok(None) => return Decoded::NeedMoreData,
        Err(reason) => return Decoded::Malformed(reason),
    };
    if kind.from_controller() {
        return Decoded::Malformed(Malformed::UnexpectedKind(kind));
    }
    let mut body = &buf[HEADER_LEN..len];
    let id = CorrelationId(body.get_u64());

    let command = match kind {
        MessageKind::MoveJoint | MessageKind::MoveLinear => {
            let target = get_vector6(&mut body);
            let speed = body.get_f64();
            let acceleration = body.get_f64();
            if kind == MessageKind::MoveJoint {
                Command::MoveJoint { target, speed, acceleration }
            } else {
                Command::MoveLinear { target, speed, acceleration }
            }
        }
        MessageKind::Stop => Command::Stop { deceleration: body.get_f64() },
        MessageKind::SetDigitalOutput => {
            let index = body.get_u8();
            let value = match body.get_u8() {
                0 => false,
                1 => true,
                raw => return Decoded::Malformed(Malformed::InvalidDigitalValue(raw)),
            };
            Command::SetDigitalOutput { index, value }
        }
        MessageKind::RobotState | MessageKind::Acknowledgement => {
            return Decoded::Malformed(Malformed::UnexpectedKind(kind))
        }
    };

    Decoded::Frame {
        message: CommandMessage { id, command },
        consumed: len,
    }
}

/// Encode a command into its wire frame
pub fn encode_command(message: &CommandMessage) -> Bytes {
    let kind = message.command.kind();
    let len = kind.min_frame_len();
    let mut out = BytesMut::with_capacity(len);
    put_header(&mut out, len, kind);
    out.put_u64(message.id.0);

    match &message.command {
        Command::MoveJoint { target, speed, acceleration }
        | Command::MoveLinear { target, speed, acceleration } => {
            put_vector6(&mut out, target);
            out.put_f64(*speed);
            out.put_f64(*acceleration);
        }
        Command::Stop { deceleration } => out.put_f64(*deceleration),
        Command::SetDigitalOutput { index, value } => {
            out.put_u8(*index);
            out.put_u8(u8::from(*value));
        }
    }

    out.freeze()
}

/// Encode a controller frame; the counterpart of `decode_controller_message`
pub fn encode_controller_message(message: &ControllerMessage) -> Bytes {
    match message {
        ControllerMessage::State(state) => {
            let mut out = BytesMut::with_capacity(STATE_FRAME_LEN);
            put_header(&mut out, STATE_FRAME_LEN, MessageKind::RobotState);
            put_vector6(&mut out, &state.joint_positions);
            put_vector6(&mut out, &state.joint_velocities);
            put_vector6(&mut out, &state.tool_pose);
            out.put_u8(state.robot_mode.to_wire());
            out.put_u8(state.safety_mode.to_wire());
            out.put_f64(state.timestamp);
            out.freeze()
        }
        ControllerMessage::Ack(ack) => {
            let mut out = BytesMut::with_capacity(ACK_FRAME_LEN);
            put_header(&mut out, ACK_FRAME_LEN, MessageKind::Acknowledgement);
            out.put_u64(ack.id.0);
            out.put_u8(ack.status.to_wire());
            out.freeze()
        }
    }
}

/// Whether a controller frame could start at the beginning of `buf`
///
/// Bytes not yet received count as plausible; the caller waits for more data.
pub fn plausible_frame_start(buf: &[u8], max_len: usize) -> bool {
    if buf.len() < 4 {
        return true;
    }
    let announced = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if !(HEADER_LEN..=max_len).contains(&announced) {
        return false;
    }
    if let Some(&version) = buf.get(4) {
        if version != PROTOCOL_VERSION {
            return false;
        }
    }
    match buf.get(5) {
        Some(&raw) => match MessageKind::from_wire(raw) {
            Some(kind) => kind.from_controller() && announced >= kind.min_frame_len(),
            None => false,
        },
        None => true,
    }
}
