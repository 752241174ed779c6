//! Command channel
//!
//! Validates commands against the safety envelope and queues them on the
//! session. `send` returns as soon as the frame is queued; it never waits for
//! the controller to acknowledge. Nothing here retries: re-sending a motion
//! command after a disconnect can move the arm unexpectedly, so that decision
//! stays with the caller.

use crate::codec::{Acknowledgement, Command, CorrelationId};
use crate::config::SafetyEnvelope;
use crate::session::{SessionHandle, SessionState};
use crate::{LinkError, Result};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Anything commands can be sent through
///
/// The player drives playback through this trait so it can run against the
/// live channel or a stand-in.
pub trait CommandSink: Send + Sync {
    fn send(&self, command: Command) -> Result<CorrelationId>;

    /// Connection state of the link behind this sink
    fn link_state(&self) -> watch::Receiver<SessionState>;
}

/// Check a command against the envelope without sending it
pub fn validate_command(command: &Command, envelope: &SafetyEnvelope) -> Result<()> {
    let invalid = |message: String| Err(LinkError::InvalidCommand(message));

    let check_rate = |name: &str, value: f64, max: f64| -> Result<()> {
        if !value.is_finite() || value <= 0.0 {
            return invalid(format!("{} must be a positive finite number, got {}", name, value));
        }
        if value > max {
            return invalid(format!("{} {} exceeds the limit of {}", name, value, max));
        }
        Ok(())
    };

    match command {
        Command::MoveJoint { target, speed, acceleration } => {
            for (i, angle) in target.iter().enumerate() {
                if !angle.is_finite() {
                    return invalid(format!("joint {} target is not finite", i));
                }
                let (min, max) = (envelope.joint_min[i], envelope.joint_max[i]);
                if *angle < min || *angle > max {
                    return invalid(format!("joint {} target {} outside [{}, {}]", i, angle, min, max));
                }
            }
            check_rate("joint speed", *speed, envelope.max_joint_speed)?;
            check_rate("joint acceleration", *acceleration, envelope.max_joint_acceleration)?;
        }
        Command::MoveLinear { target, speed, acceleration } => {
            for (i, value) in target.iter().enumerate() {
                if !value.is_finite() {
                    return invalid(format!("pose component {} is not finite", i));
                }
                let (min, max) = (envelope.pose_min[i], envelope.pose_max[i]);
                if *value < min || *value > max {
                    return invalid(format!("pose component {} target {} outside [{}, {}]", i, value, min, max));
                }
            }
            check_rate("tool speed", *speed, envelope.max_linear_speed)?;
            check_rate("tool acceleration", *acceleration, envelope.max_linear_acceleration)?;
        }
        Command::Stop { deceleration } => {
            check_rate("deceleration", *deceleration, envelope.max_deceleration)?;
        }
        Command::SetDigitalOutput { index, .. } => {
            if *index >= envelope.digital_outputs {
                return invalid(format!(
                    "digital output {} does not exist ({} outputs)",
                    index, envelope.digital_outputs
                ));
            }
        }
    }
    Ok(())
}

/// Validated command path into a session
#[derive(Clone)]
pub struct CommandChannel {
    session: SessionHandle,
    envelope: SafetyEnvelope,
}

impl CommandChannel {
    /// Channel using the envelope from the session's configuration
    pub fn new(session: SessionHandle) -> Self {
        let envelope = session.config().safety.clone();
        Self { session, envelope }
    }

    pub fn with_envelope(session: SessionHandle, envelope: SafetyEnvelope) -> Self {
        Self { session, envelope }
    }

    pub fn envelope(&self) -> &SafetyEnvelope {
        &self.envelope
    }

    /// Validate and queue a command
    ///
    /// Fails with `InvalidCommand` or `NotConnected` without queuing anything.
    pub fn send(&self, command: Command) -> Result<CorrelationId> {
        if let Err(e) = validate_command(&command, &self.envelope) {
            warn!("Rejected {:?}: {}", command.kind(), e);
            return Err(e);
        }
        let kind = command.kind();
        let id = self.session.enqueue(command)?;
        debug!("Queued {:?} as {}", kind, id);
        Ok(id)
    }

    /// Controller acknowledgements for commands sent on this session
    pub fn acknowledgements(&self) -> broadcast::Receiver<Acknowledgement> {
        self.session.acknowledgements()
    }
}

impl CommandSink for CommandChannel {
    fn send(&self, command: Command) -> Result<CorrelationId> {
        CommandChannel::send(self, command)
    }

    fn link_state(&self) -> watch::Receiver<SessionState> {
        self.session.watch_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::session::Session;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn joint_move(target: [f64; 6]) -> Command {
        Command::MoveJoint { target, speed: 1.0, acceleration: 1.4 }
    }

    async fn connected_session() -> (Session, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = Config::default();
        config.controller.host = "127.0.0.1".to_string();
        config.controller.port = listener.local_addr().unwrap().port();
        config.connection.idle_timeout = 30.0;
        let session = Session::connect(&config).await.unwrap();
        (session, listener)
    }

    #[test]
    fn test_validation_accepts_envelope_values() {
        let envelope = SafetyEnvelope::default();
        assert!(validate_command(&joint_move([0.0, -1.57, 1.57, 0.0, 1.0, -3.0]), &envelope).is_ok());
        assert!(validate_command(
            &Command::MoveLinear { target: [0.4, -0.1, 0.3, 0.0, 3.14, 0.0], speed: 0.25, acceleration: 1.2 },
            &envelope
        )
        .is_ok());
        assert!(validate_command(&Command::Stop { deceleration: 2.0 }, &envelope).is_ok());
        assert!(validate_command(&Command::SetDigitalOutput { index: 9, value: false }, &envelope).is_ok());
    }

    #[test]
    fn test_validation_rejects_outside_envelope() {
        let mut envelope = SafetyEnvelope::default();
        envelope.joint_max[1] = 1.0;
        envelope.pose_min[2] = 0.05;

        let rejected = [
            joint_move([0.0, f64::NAN, 0.0, 0.0, 0.0, 0.0]),
            joint_move([0.0, 1.5, 0.0, 0.0, 0.0, 0.0]),
            joint_move([f64::INFINITY, 0.0, 0.0, 0.0, 0.0, 0.0]),
            Command::MoveJoint { target: [0.0; 6], speed: 10.0, acceleration: 1.0 },
            Command::MoveJoint { target: [0.0; 6], speed: 1.0, acceleration: 0.0 },
            Command::MoveLinear { target: [0.0, 0.0, f64::NAN, 0.0, 0.0, 0.0], speed: 0.1, acceleration: 0.1 },
            Command::MoveLinear { target: [0.0; 6], speed: -0.1, acceleration: 0.1 },
            Command::MoveLinear { target: [5.0, 0.0, 0.3, 0.0, 3.14, 0.0], speed: 0.1, acceleration: 0.1 },
            Command::MoveLinear { target: [0.4, -0.1, 0.0, 0.0, 3.14, 0.0], speed: 0.1, acceleration: 0.1 },
            Command::MoveLinear { target: [0.4, -0.1, 0.3, 0.0, 9.0, 0.0], speed: 0.1, acceleration: 0.1 },
            Command::Stop { deceleration: f64::NAN },
            Command::Stop { deceleration: 1000.0 },
            Command::SetDigitalOutput { index: 10, value: true },
        ];
        for command in rejected {
            assert!(
                matches!(validate_command(&command, &envelope), Err(LinkError::InvalidCommand(_))),
                "{:?} should be rejected",
                command
            );
        }
    }

    #[tokio::test]
    async fn test_nan_target_sends_nothing() {
        let (session, _listener) = connected_session().await;
        let channel = CommandChannel::new(session.handle());
        let before = session.handle().stats();

        let result = channel.send(joint_move([f64::NAN, 0.0, 0.0, 0.0, 0.0, 0.0]));
        assert!(matches!(result, Err(LinkError::InvalidCommand(_))));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.handle().pending_commands(), 0);
        assert_eq!(session.handle().stats().bytes_out, before.bytes_out);
        assert_eq!(session.handle().stats().frames_sent, 0);
    }

    #[tokio::test]
    async fn test_valid_command_is_written() {
        let (session, _listener) = connected_session().await;
        let channel = CommandChannel::new(session.handle());

        let first = channel.send(joint_move([0.0; 6])).unwrap();
        let second = channel.send(Command::Stop { deceleration: 1.0 }).unwrap();
        assert!(second > first);

        tokio::time::timeout(Duration::from_secs(5), async {
            while session.handle().stats().frames_sent < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(session.handle().stats().bytes_out > 0);
    }

    #[tokio::test]
    async fn test_closed_session_is_not_connected() {
        let (session, _listener) = connected_session().await;
        let channel = CommandChannel::new(session.handle());
        session.close().await.unwrap();

        assert!(matches!(channel.send(joint_move([0.0; 6])), Err(LinkError::NotConnected)));
        assert_eq!(*channel.link_state().borrow(), SessionState::Closed);
    }
}
