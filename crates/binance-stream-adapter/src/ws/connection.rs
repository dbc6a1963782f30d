/*
[INPUT]:  Dial target, connector and connection timing configuration
[OUTPUT]: One supervised socket emitting lifecycle events and raw frames
[POS]:    WebSocket layer - connection lifecycle state machine
[UPDATE]: When changing reconnect, keepalive or membership behavior
*/

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::http::{BinanceError, Result};
use crate::ws::backoff::{BackoffConfig, BackoffState};
use crate::ws::sink::ErrorSink;
use crate::ws::transport::{Connector, Frame, Transport};

const MEMBERSHIP_LOG_LIMIT: usize = 10;
const OVERFLOW_LOG_LIMIT: usize = 5;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

static MEMBERSHIP_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);
static OVERFLOW_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Disconnected, Closing)
                | (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Connecting, Closing)
                | (Connecting, Closed)
                | (Connected, Reconnecting)
                | (Connected, Closing)
                | (Reconnecting, Connected)
                | (Reconnecting, Closing)
                | (Reconnecting, Closed)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Timing and limits for one connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub backoff: BackoffConfig,
    /// No inbound traffic for this long means the socket is dead
    pub idle_timeout: Duration,
    /// Client pings keep quiet streams inside the idle window
    pub ping_interval: Option<Duration>,
    pub send_timeout: Duration,
    pub connect_timeout: Duration,
    /// How long a frame may wait for room in the dispatch queue
    pub dispatch_timeout: Duration,
    /// Consecutive failed dials before giving up; `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            idle_timeout: Duration::from_secs(60),
            ping_interval: Some(Duration::from_secs(20)),
            send_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            dispatch_timeout: Duration::from_secs(5),
            max_reconnect_attempts: None,
        }
    }
}

/// URL and stream membership for one dial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialPlan {
    pub url: Url,
    /// Wire names in registration order
    pub streams: Vec<String>,
}

/// Supplies the membership snapshot right before every dial
pub trait DialTarget: Send + Sync {
    /// `None` when nothing is left to carry, the connection then closes
    fn plan(&self) -> Result<Option<DialPlan>>;
}

/// Emitted in order, one queue per connection
#[derive(Debug)]
pub enum ConnectionEvent {
    Connected { reconnect: bool, streams: Vec<String> },
    /// A stream was added to a live connection
    Joined { stream: String },
    Disconnected { reason: String },
    Frame(String),
    Fatal(BinanceError),
    Closed,
}

enum Command {
    Join(String),
    Leave(String),
    Send {
        frame: Frame,
        ack: oneshot::Sender<Result<()>>,
    },
}

/// Control side of a running connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    send_timeout: Duration,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Join(stream) => f.debug_tuple("Join").field(stream).finish(),
            Command::Leave(stream) => f.debug_tuple("Leave").field(stream).finish(),
            Command::Send { frame, .. } => f.debug_struct("Send").field("frame", frame).finish(),
        }
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Write a frame; fails fast unless connected
    pub async fn send(&self, frame: Frame) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(BinanceError::NotConnected);
        }
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Send { frame, ack })
            .map_err(|_| BinanceError::NotConnected)?;

        match tokio::time::timeout(self.send_timeout, done).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BinanceError::NotConnected),
            Err(_) => Err(BinanceError::Timeout {
                operation: "send",
                duration_ms: self.send_timeout.as_millis() as u64,
            }),
        }
    }

    /// Stop reconnecting and close the socket. Idempotent, never blocks.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub async fn wait_closed(&self) {
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await
            .map(|_| ());
    }

    pub(crate) fn join(&self, stream: &str) {
        let _ = self.commands.send(Command::Join(stream.to_string()));
    }

    pub(crate) fn leave(&self, stream: &str) {
        let _ = self.commands.send(Command::Leave(stream.to_string()));
    }
}

/// Spawn the connection task; dialing starts right away
pub fn spawn_connection(
    id: String,
    target: Arc<dyn DialTarget>,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    events: mpsc::Sender<ConnectionEvent>,
    errors: ErrorSink,
) -> ConnectionHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let cancel = CancellationToken::new();

    let handle = ConnectionHandle {
        id: id.clone(),
        commands: command_tx,
        state: state_rx,
        cancel: cancel.clone(),
        send_timeout: config.send_timeout,
    };

    let actor = ConnectionActor {
        id,
        target,
        connector,
        backoff: BackoffState::new(config.backoff),
        config,
        events,
        errors,
        commands: command_rx,
        state: state_tx,
        cancel,
        on_wire: Vec::new(),
        next_request_id: 0,
    };
    tokio::spawn(actor.run());

    handle
}

enum DialOutcome {
    Connected(Box<dyn Transport>),
    Failed(BinanceError),
    Cancelled,
}

enum SessionEnd {
    Dropped(String),
    Cancelled,
    /// Nobody is listening any more
    Shutdown,
}

enum FrameOutcome {
    Continue,
    Dropped(String),
    Shutdown,
}

struct ConnectionActor {
    id: String,
    target: Arc<dyn DialTarget>,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    events: mpsc::Sender<ConnectionEvent>,
    errors: ErrorSink,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    backoff: BackoffState,
    /// Streams the server currently sends us
    on_wire: Vec<String>,
    next_request_id: u64,
}

impl ConnectionActor {
    async fn run(mut self) {
        self.transition(ConnectionState::Connecting);
        let mut established = false;
        let mut failures: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let plan = match self.target.plan() {
                Ok(Some(plan)) => plan,
                Ok(None) => {
                    debug!(connection_id = %self.id, "ws has no streams left to dial");
                    break;
                }
                Err(err) => {
                    error!(connection_id = %self.id, error = %err, "ws dial target invalid");
                    self.fail(err).await;
                    return;
                }
            };

            match self.dial(&plan.url).await {
                DialOutcome::Cancelled => break,
                DialOutcome::Connected(mut transport) => {
                    failures = 0;
                    self.backoff.reset();
                    self.on_wire = plan.streams.clone();
                    self.transition(ConnectionState::Connected);
                    info!(
                        connection_id = %self.id,
                        url = %plan.url,
                        streams = plan.streams.len(),
                        reconnect = established,
                        "ws connected"
                    );

                    let connected = ConnectionEvent::Connected {
                        reconnect: established,
                        streams: plan.streams,
                    };
                    if !self.emit(connected).await {
                        let _ = tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await;
                        break;
                    }
                    established = true;

                    match self.session(transport).await {
                        SessionEnd::Cancelled | SessionEnd::Shutdown => break,
                        SessionEnd::Dropped(reason) => {
                            self.transition(ConnectionState::Reconnecting);
                            warn!(connection_id = %self.id, reason = %reason, "ws connection lost");
                            let dropped = ConnectionEvent::Disconnected { reason };
                            if !self.emit(dropped).await {
                                break;
                            }
                        }
                    }
                }
                DialOutcome::Failed(err) => {
                    failures = failures.saturating_add(1);
                    self.transition(ConnectionState::Reconnecting);
                    warn!(
                        connection_id = %self.id,
                        attempt = failures,
                        error = %err,
                        "ws dial failed"
                    );
                    if let Some(max) = self.config.max_reconnect_attempts
                        && failures >= max
                    {
                        error!(
                            connection_id = %self.id,
                            attempts = failures,
                            "ws reconnect attempts exhausted"
                        );
                        self.fail(BinanceError::ReconnectExhausted {
                            attempts: failures,
                            last_error: err.to_string(),
                        })
                        .await;
                        return;
                    }
                }
            }

            let delay = self.backoff.next_delay();
            info!(
                connection_id = %self.id,
                attempt = self.backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "ws reconnect scheduled"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.transition(ConnectionState::Closing);
        self.transition(ConnectionState::Closed);
        info!(connection_id = %self.id, "ws connection closed");
        self.emit(ConnectionEvent::Closed).await;
    }

    /// Queue a lifecycle event, giving up once the connection is closing
    ///
    /// Returns false when the event was not delivered.
    async fn emit(&self, event: ConnectionEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    /// Terminal failure: Closed plus a fatal event upward
    async fn fail(&mut self, err: BinanceError) {
        self.transition(ConnectionState::Closed);
        if self.emit(ConnectionEvent::Fatal(err)).await {
            self.emit(ConnectionEvent::Closed).await;
        }
    }

    async fn dial(&self, url: &Url) -> DialOutcome {
        debug!(connection_id = %self.id, url = %url, "ws dialing");
        let connect = tokio::time::timeout(self.config.connect_timeout, self.connector.connect(url));
        tokio::select! {
            _ = self.cancel.cancelled() => DialOutcome::Cancelled,
            outcome = connect => match outcome {
                Ok(Ok(transport)) => DialOutcome::Connected(transport),
                Ok(Err(err)) => DialOutcome::Failed(err),
                Err(_) => DialOutcome::Failed(BinanceError::Timeout {
                    operation: "connect",
                    duration_ms: self.config.connect_timeout.as_millis() as u64,
                }),
            },
        }
    }

    async fn session(&mut self, mut transport: Box<dyn Transport>) -> SessionEnd {
        let idle_timeout = self.config.idle_timeout;
        let mut last_traffic = Instant::now();
        let mut ping = self.config.ping_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let idle_deadline = last_traffic + idle_timeout;
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.transition(ConnectionState::Closing);
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await;
                    return SessionEnd::Cancelled;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.transition(ConnectionState::Closing);
                        let _ = tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await;
                        return SessionEnd::Shutdown;
                    };
                    if let Err(reason) = self.handle_command(command, transport.as_mut()).await {
                        return SessionEnd::Dropped(reason);
                    }
                }
                frame = transport.next_frame() => {
                    match frame {
                        Some(Ok(frame)) => {
                            last_traffic = Instant::now();
                            match self.handle_frame(frame, transport.as_mut()).await {
                                FrameOutcome::Continue => {}
                                FrameOutcome::Dropped(reason) => return SessionEnd::Dropped(reason),
                                FrameOutcome::Shutdown => {
                                    self.transition(ConnectionState::Closing);
                                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await;
                                    return SessionEnd::Shutdown;
                                }
                            }
                        }
                        Some(Err(err)) => return SessionEnd::Dropped(err.to_string()),
                        None => return SessionEnd::Dropped("stream ended by peer".to_string()),
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await;
                    return SessionEnd::Dropped(format!(
                        "no traffic for {}ms",
                        idle_timeout.as_millis()
                    ));
                }
                _ = next_tick(&mut ping) => {
                    if let Err(err) = self.write(transport.as_mut(), Frame::Ping(Vec::new())).await {
                        return SessionEnd::Dropped(format!("ping failed: {err}"));
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame, transport: &mut dyn Transport) -> FrameOutcome {
        match frame {
            Frame::Ping(payload) => match self.write(transport, Frame::Pong(payload)).await {
                Ok(()) => FrameOutcome::Continue,
                Err(err) => FrameOutcome::Dropped(format!("pong failed: {err}")),
            },
            Frame::Pong(_) => FrameOutcome::Continue,
            Frame::Text(text) => self.forward(text).await,
            Frame::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => self.forward(text).await,
                Err(err) => {
                    self.errors.report(BinanceError::Decode {
                        stream: None,
                        message: format!("binary frame is not UTF-8: {err}"),
                    });
                    FrameOutcome::Continue
                }
            },
            Frame::Close(reason) => FrameOutcome::Dropped(match reason {
                Some(reason) if !reason.is_empty() => format!("server closed connection: {reason}"),
                _ => "server closed connection".to_string(),
            }),
        }
    }

    /// Hand a frame to the dispatcher, dropping it when the queue stays full
    async fn forward(&mut self, text: String) -> FrameOutcome {
        let event = ConnectionEvent::Frame(text);
        match self
            .events
            .send_timeout(event, self.config.dispatch_timeout)
            .await
        {
            Ok(()) => FrameOutcome::Continue,
            Err(SendTimeoutError::Timeout(_)) => {
                log_overflow(&self.id);
                self.errors.report(BinanceError::DispatchOverflow {
                    connection_id: self.id.clone(),
                });
                FrameOutcome::Continue
            }
            Err(SendTimeoutError::Closed(_)) => FrameOutcome::Shutdown,
        }
    }

    async fn handle_command(
        &mut self,
        command: Command,
        transport: &mut dyn Transport,
    ) -> std::result::Result<(), String> {
        match command {
            Command::Join(stream) => {
                if self.on_wire.contains(&stream) {
                    return Ok(());
                }
                self.request_membership("SUBSCRIBE", &stream, transport)
                    .await
                    .map_err(|err| err.to_string())?;
                self.on_wire.push(stream.clone());
                let joined = ConnectionEvent::Joined { stream };
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Ok(()),
                    sent = self.events.send_timeout(joined, self.config.dispatch_timeout) => match sent {
                        Ok(()) => Ok(()),
                        Err(SendTimeoutError::Timeout(_)) => {
                            log_overflow(&self.id);
                            self.errors.report(BinanceError::DispatchOverflow {
                                connection_id: self.id.clone(),
                            });
                            Ok(())
                        }
                        Err(SendTimeoutError::Closed(_)) => Err("dispatcher stopped".to_string()),
                    },
                }
            }
            Command::Leave(stream) => {
                let Some(position) = self.on_wire.iter().position(|name| *name == stream) else {
                    return Ok(());
                };
                self.on_wire.remove(position);
                self.request_membership("UNSUBSCRIBE", &stream, transport)
                    .await
                    .map_err(|err| err.to_string())
            }
            Command::Send { frame, ack } => {
                if ack.is_closed() {
                    return Ok(());
                }
                let result = self.write(transport, frame).await;
                let failure = result.as_ref().err().map(ToString::to_string);
                let _ = ack.send(result);
                match failure {
                    Some(reason) => Err(reason),
                    None => Ok(()),
                }
            }
        }
    }

    async fn request_membership(
        &mut self,
        method: &'static str,
        stream: &str,
        transport: &mut dyn Transport,
    ) -> Result<()> {
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let payload = serde_json::json!({
            "method": method,
            "params": [stream],
            "id": request_id,
        });
        self.write(transport, Frame::Text(payload.to_string())).await?;
        log_membership_sent(&self.id, method, stream, request_id);
        Ok(())
    }

    async fn write(&self, transport: &mut dyn Transport, frame: Frame) -> Result<()> {
        match tokio::time::timeout(self.config.send_timeout, transport.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(BinanceError::Timeout {
                operation: "send",
                duration_ms: self.config.send_timeout.as_millis() as u64,
            }),
        }
    }

    fn transition(&self, next: ConnectionState) {
        let current = *self.state.borrow();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            debug!(
                connection_id = %self.id,
                from = %current,
                to = %next,
                "ws state transition rejected"
            );
            return;
        }
        self.state.send_replace(next);
        debug!(connection_id = %self.id, from = %current, to = %next, "ws state transition");
    }
}

async fn next_tick(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn log_membership_sent(connection_id: &str, method: &str, stream: &str, request_id: u64) {
    let count = MEMBERSHIP_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count >= MEMBERSHIP_LOG_LIMIT {
        return;
    }
    info!(
        sample_index = count + 1,
        sample_limit = MEMBERSHIP_LOG_LIMIT,
        connection_id,
        method,
        stream,
        request_id,
        "ws membership request sent"
    );
}

fn log_overflow(connection_id: &str) {
    let count = OVERFLOW_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count >= OVERFLOW_LOG_LIMIT {
        return;
    }
    warn!(
        sample_index = count + 1,
        sample_limit = OVERFLOW_LOG_LIMIT,
        connection_id,
        "ws dispatch queue full, frame dropped"
    );
}
