//! Controller session
//!
//! A `Session` owns the one TCP connection to the controller. A single I/O
//! task reads and frames incoming bytes, publishes decoded snapshots to
//! telemetry subscribers in arrival order, and drains the outbound queue one
//! whole frame at a time. Other components talk to it through a cloneable
//! `SessionHandle`, which never touches the socket.
//!
//! Lifecycle: Connecting -> Connected -> (Reconnecting -> Connected)* ->
//! Closing -> Closed. A link that exhausts its reconnect budget goes straight
//! to Closed and terminates every telemetry subscription.

use crate::codec::{
    self, Acknowledgement, Command, CommandMessage, ControllerMessage, CorrelationId, Decoded,
    Malformed, MessageKind, RobotState, HEADER_LEN,
};
use crate::config::Config;
use crate::telemetry::{CloseReason, Subscription, TelemetryHub};
use crate::{LinkError, Result};
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Something the frame reader found in the byte stream
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    Message(ControllerMessage),
    Malformed(Malformed),
}

/// Turns an arbitrarily chunked byte stream into controller frames
///
/// After a malformed frame the reader drops its first byte and scans forward
/// one byte at a time until the buffer starts with a plausible header. Bytes
/// skipped while scanning do not produce further events.
pub struct FrameReader {
    buffer: BytesMut,
    max_len: usize,
    resyncing: bool,
    discarded: u64,
}

impl FrameReader {
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_len.max(HEADER_LEN) * 2),
            max_len,
            resyncing: false,
            discarded: 0,
        }
    }

    /// Append received bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Buffer for socket reads to append into
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total bytes thrown away while resynchronising
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Next complete frame or malformed frame, if the buffer holds one
    pub fn next_event(&mut self) -> Option<FrameEvent> {
        if self.resyncing {
            loop {
                if self.buffer.len() < HEADER_LEN {
                    return None;
                }
                if codec::plausible_frame_start(&self.buffer, self.max_len) {
                    self.resyncing = false;
                    break;
                }
                self.buffer.advance(1);
                self.discarded += 1;
            }
        }

        match codec::decode_controller_message(&self.buffer, self.max_len) {
            Decoded::Frame { message, consumed } => {
                self.buffer.advance(consumed);
                Some(FrameEvent::Message(message))
            }
            Decoded::NeedMoreData => None,
            Decoded::Malformed(reason) => {
                self.buffer.advance(1);
                self.discarded += 1;
                self.resyncing = true;
                Some(FrameEvent::Malformed(reason))
            }
        }
    }
}

/// One encoded command waiting to be written
#[derive(Debug, Clone)]
pub(crate) struct OutboundFrame {
    pub id: CorrelationId,
    pub kind: MessageKind,
    pub bytes: Bytes,
}

impl OutboundFrame {
    fn is_motion(&self) -> bool {
        matches!(self.kind, MessageKind::MoveJoint | MessageKind::MoveLinear)
    }
}

struct QueueInner {
    frames: VecDeque<OutboundFrame>,
    accepting: bool,
}

/// Outbound frames in submission order, drained by the I/O task
pub(crate) struct OutboundQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(capacity),
                accepting: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, frame: OutboundFrame) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if !inner.accepting {
                return Err(LinkError::NotConnected);
            }
            if inner.frames.len() >= self.capacity {
                return Err(LinkError::QueueFull(inner.frames.len()));
            }
            inner.frames.push_back(frame);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Queue a frame ahead of everything else, discarding pending motion frames
    ///
    /// Returns the number of frames discarded.
    fn push_urgent(&self, frame: OutboundFrame) -> Result<usize> {
        let purged = {
            let mut inner = self.inner.lock();
            if !inner.accepting {
                return Err(LinkError::NotConnected);
            }
            let before = inner.frames.len();
            inner.frames.retain(|pending| !pending.is_motion());
            let purged = before - inner.frames.len();
            inner.frames.push_front(frame);
            purged
        };
        self.notify.notify_one();
        Ok(purged)
    }

    fn pop(&self) -> Option<OutboundFrame> {
        self.inner.lock().frames.pop_front()
    }

    /// Open or close the queue; closing discards everything pending
    fn set_accepting(&self, accepting: bool) -> usize {
        let mut inner = self.inner.lock();
        inner.accepting = accepting;
        if accepting {
            0
        } else {
            let discarded = inner.frames.len();
            inner.frames.clear();
            discarded
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }
}

#[derive(Default)]
struct SessionStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    states_received: AtomicU64,
    acks_received: AtomicU64,
    frames_sent: AtomicU64,
    malformed_frames: AtomicU64,
    bytes_discarded: AtomicU64,
    stale_states: AtomicU64,
    reconnects: AtomicU64,
}

/// Counters describing link health
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub states_received: u64,
    pub acks_received: u64,
    pub frames_sent: u64,
    pub malformed_frames: u64,
    pub bytes_discarded: u64,
    /// Snapshots dropped because their timestamp did not advance
    pub stale_states: u64,
    pub reconnects: u64,
}

impl SessionStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            states_received: self.states_received.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            bytes_discarded: self.bytes_discarded.load(Ordering::Relaxed),
            stale_states: self.stale_states.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    config: Config,
    state_tx: watch::Sender<SessionState>,
    latest_tx: watch::Sender<Option<RobotState>>,
    shutdown_tx: watch::Sender<bool>,
    telemetry: TelemetryHub,
    acks: broadcast::Sender<Acknowledgement>,
    outbound: OutboundQueue,
    stats: SessionStats,
    next_correlation: AtomicU64,
}

impl Shared {
    fn new(config: Config) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Connecting);
        let (latest_tx, _) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(false);
        let (acks, _) = broadcast::channel(64);
        Self {
            telemetry: TelemetryHub::new(config.telemetry.queue_capacity),
            outbound: OutboundQueue::new(config.protocol.outbound_capacity),
            config,
            state_tx,
            latest_tx,
            shutdown_tx,
            acks,
            stats: SessionStats::default(),
            next_correlation: AtomicU64::new(1),
        }
    }

    fn set_state(&self, state: SessionState) {
        let discarded = self.outbound.set_accepting(state == SessionState::Connected);
        if discarded > 0 {
            warn!("Discarded {} unsent command frames on leaving the connected state", discarded);
        }
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Session state {} -> {}", previous, state);
        }
    }

    fn dispatch(&self, message: ControllerMessage, last_timestamp: &mut Option<f64>) {
        match message {
            ControllerMessage::State(state) => {
                if let Some(previous) = *last_timestamp {
                    if state.timestamp <= previous {
                        self.stats.stale_states.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "Dropping snapshot with non-increasing timestamp {} (last {})",
                            state.timestamp, previous
                        );
                        return;
                    }
                }
                *last_timestamp = Some(state.timestamp);
                self.stats.states_received.fetch_add(1, Ordering::Relaxed);
                self.latest_tx.send_replace(Some(state.clone()));
                self.telemetry.publish(&state);
            }
            ControllerMessage::Ack(ack) => {
                self.stats.acks_received.fetch_add(1, Ordering::Relaxed);
                debug!("Controller acknowledged {} as {:?}", ack.id, ack.status);
                // Nobody listening is fine
                let _ = self.acks.send(ack);
            }
        }
    }
}

/// Open one TCP connection to the controller
async fn open_stream(config: &Config) -> Result<TcpStream> {
    let host = config.controller.host.as_str();
    let port = config.controller.port;
    let stream = timeout(config.connection.connect_timeout(), TcpStream::connect((host, port)))
        .await
        .map_err(|_| LinkError::Connection(format!("Timed out connecting to {}:{}", host, port)))?
        .map_err(|e| LinkError::Connection(format!("Failed to connect to {}:{}: {}", host, port, e)))?;
    stream
        .set_nodelay(true)
        .map_err(|e| LinkError::Connection(format!("Failed to configure socket: {}", e)))?;
    Ok(stream)
}

/// Resolves once shutdown is requested or the session owner is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

enum PumpExit {
    Shutdown,
    Lost(String),
}

enum ReconnectOutcome {
    Connected(TcpStream),
    Shutdown,
    Exhausted(String),
}

/// Serve one connection until it drops or shutdown is requested
async fn pump(shared: &Shared, stream: &mut TcpStream, shutdown: &mut watch::Receiver<bool>) -> PumpExit {
    let (mut reader, mut writer) = stream.split();
    let mut frames = FrameReader::new(shared.config.protocol.max_message_size);
    let threshold = shared.config.protocol.malformed_threshold;
    let idle = shared.config.connection.idle_timeout();
    let mut idle_deadline = Instant::now() + idle;
    let mut consecutive_malformed = 0u32;
    // The controller clock may restart between connections
    let mut last_timestamp: Option<f64> = None;

    loop {
        tokio::select! {
            _ = shutdown_requested(shutdown) => {
                let _ = writer.shutdown().await;
                return PumpExit::Shutdown;
            }
            _ = shared.outbound.notify.notified() => {
                while let Some(frame) = shared.outbound.pop() {
                    // A controller that stops reading must not wedge shutdown
                    tokio::select! {
                        _ = shutdown_requested(shutdown) => return PumpExit::Shutdown,
                        written = timeout(idle, writer.write_all(&frame.bytes)) => match written {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => return PumpExit::Lost(format!("write failed: {}", e)),
                            Err(_) => return PumpExit::Lost(format!("write stalled for {:?}", idle)),
                        },
                    }
                    shared.stats.bytes_out.fetch_add(frame.bytes.len() as u64, Ordering::Relaxed);
                    shared.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                    debug!("Sent {:?} {}", frame.kind, frame.id);
                }
            }
            read = reader.read_buf(frames.buffer_mut()) => {
                let n = match read {
                    Ok(0) => return PumpExit::Lost("connection closed by controller".to_string()),
                    Ok(n) => n,
                    Err(e) => return PumpExit::Lost(format!("read failed: {}", e)),
                };
                shared.stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);

                let discarded_before = frames.discarded();
                while let Some(event) = frames.next_event() {
                    match event {
                        FrameEvent::Message(message) => {
                            consecutive_malformed = 0;
                            idle_deadline = Instant::now() + idle;
                            shared.dispatch(message, &mut last_timestamp);
                        }
                        FrameEvent::Malformed(reason) => {
                            consecutive_malformed += 1;
                            shared.stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                            warn!("Decode error ({} consecutive): {}", consecutive_malformed, reason);
                            if consecutive_malformed > threshold {
                                return PumpExit::Lost(format!(
                                    "{} consecutive malformed frames exceeded the threshold of {}",
                                    consecutive_malformed, threshold
                                ));
                            }
                        }
                    }
                }
                shared
                    .stats
                    .bytes_discarded
                    .fetch_add(frames.discarded() - discarded_before, Ordering::Relaxed);
            }
            _ = sleep_until(idle_deadline) => {
                return PumpExit::Lost(format!("no complete message for {:?}", idle));
            }
        }
    }
}

async fn reconnect(shared: &Shared, shutdown: &mut watch::Receiver<bool>) -> ReconnectOutcome {
    let attempts = shared.config.connection.retry_attempts;
    let mut last_error = "no reconnect attempts configured".to_string();

    for attempt in 1..=attempts {
        tokio::select! {
            _ = shutdown_requested(shutdown) => return ReconnectOutcome::Shutdown,
            _ = sleep(shared.config.connection.retry_delay()) => {}
        }
        info!("Reconnect attempt {}/{}", attempt, attempts);
        tokio::select! {
            _ = shutdown_requested(shutdown) => return ReconnectOutcome::Shutdown,
            result = open_stream(&shared.config) => match result {
                Ok(stream) => return ReconnectOutcome::Connected(stream),
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    last_error = e.to_string();
                }
            },
        }
    }

    ReconnectOutcome::Exhausted(last_error)
}

/// I/O task: owns the socket for the lifetime of the session
async fn drive(shared: Arc<Shared>, mut stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
    loop {
        let reason = match pump(&shared, &mut stream, &mut shutdown).await {
            PumpExit::Shutdown => break,
            PumpExit::Lost(reason) => reason,
        };

        warn!("Controller link lost: {}", reason);
        shared.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        shared.set_state(SessionState::Reconnecting);
        drop(stream);

        match reconnect(&shared, &mut shutdown).await {
            ReconnectOutcome::Connected(new_stream) => {
                stream = new_stream;
                shared.set_state(SessionState::Connected);
                info!("Reconnected to controller");
            }
            ReconnectOutcome::Shutdown => {
                shared.set_state(SessionState::Closing);
                shared.telemetry.close(CloseReason::Shutdown);
                shared.set_state(SessionState::Closed);
                return;
            }
            ReconnectOutcome::Exhausted(last_error) => {
                error!("Giving up on controller link: {} (last error: {})", reason, last_error);
                shared
                    .telemetry
                    .close(CloseReason::Terminated(format!("{}; reconnect failed: {}", reason, last_error)));
                shared.set_state(SessionState::Closed);
                return;
            }
        }
    }

    shared.set_state(SessionState::Closing);
    drop(stream);
    shared.telemetry.close(CloseReason::Shutdown);
    shared.set_state(SessionState::Closed);
    info!("Session closed");
}

/// Owner of the controller connection
pub struct Session {
    handle: SessionHandle,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Session {
    /// Connect to the controller and start the I/O task
    ///
    /// The initial connection is attempted `retry_attempts + 1` times.
    pub async fn connect(config: &Config) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::new(config.clone()));
        info!(
            "Connecting to controller at {}:{}",
            config.controller.host, config.controller.port
        );

        let mut attempt = 0;
        let stream = loop {
            attempt += 1;
            match open_stream(config).await {
                Ok(stream) => break stream,
                Err(e) if attempt <= config.connection.retry_attempts => {
                    warn!("Connection attempt {} failed: {}", attempt, e);
                    sleep(config.connection.retry_delay()).await;
                }
                Err(e) => {
                    error!("Could not connect after {} attempts: {}", attempt, e);
                    shared.set_state(SessionState::Closed);
                    return Err(e);
                }
            }
        };

        shared.set_state(SessionState::Connected);
        info!("Connected to controller");

        let shutdown = shared.shutdown_tx.subscribe();
        let task = tokio::spawn(drive(Arc::clone(&shared), stream, shutdown));

        Ok(Self {
            handle: SessionHandle { shared },
            task: Some(task),
        })
    }

    /// Non-owning handle for telemetry and command components
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    /// Release the socket and wait for the I/O task to finish
    pub async fn close(mut self) -> Result<()> {
        info!("Closing session");
        self.handle.shared.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The I/O task sees the flag and releases the socket
        self.handle.shared.shutdown_tx.send_replace(true);
    }
}

/// Cheap, cloneable view of a session
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    /// Follow state changes
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn telemetry(&self) -> &TelemetryHub {
        &self.shared.telemetry
    }

    pub fn subscribe(&self) -> Subscription {
        self.shared.telemetry.subscribe()
    }

    /// Most recent snapshot, if any has arrived
    pub fn latest_state(&self) -> Option<RobotState> {
        self.shared.latest_tx.borrow().clone()
    }

    pub fn acknowledgements(&self) -> broadcast::Receiver<Acknowledgement> {
        self.shared.acks.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Frames queued but not yet written
    pub fn pending_commands(&self) -> usize {
        self.shared.outbound.len()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Encode and queue a command; Stop jumps the queue
    pub(crate) fn enqueue(&self, command: Command) -> Result<CorrelationId> {
        if self.state() != SessionState::Connected {
            return Err(LinkError::NotConnected);
        }
        let id = CorrelationId(self.shared.next_correlation.fetch_add(1, Ordering::Relaxed));
        let kind = command.kind();
        let urgent = command.is_stop();
        let bytes = codec::encode_command(&CommandMessage { id, command });
        let frame = OutboundFrame { id, kind, bytes };

        if urgent {
            let purged = self.shared.outbound.push_urgent(frame)?;
            if purged > 0 {
                warn!("Stop {} discarded {} queued motion commands", id, purged);
            }
        } else {
            self.shared.outbound.push(frame)?;
        }
        Ok(id)
    }
}
