//! # Client Transport
//!
//! Client-side WebSocket connection with automatic reconnection. The
//! transport owns the socket on a background task; callers interact through
//! a `TransportHandle` (outbound frames, manual disconnect) and an event
//! channel (inbound frames, connection lifecycle).
//!
//! Reconnection backs off exponentially from the configured interval up to
//! a cap, for a bounded number of attempts; exhausting them emits a single
//! `ReconnectFailed` event and stops. A manual `disconnect()` suppresses
//! reconnection entirely.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Exponential backoff parameters: `initial * 2^attempt`, capped at `max`,
/// for at most `max_attempts` attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: 6,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given attempt (0-based), or `None` once the attempt
    /// budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }
}

/// Stateful walk over a backoff policy; reset on every successful connect.
#[derive(Debug)]
pub struct ReconnectSchedule {
    policy: BackoffPolicy,
    attempt: u32,
}

impl ReconnectSchedule {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.policy.delay_for(self.attempt)?;
        self.attempt += 1;
        Some(delay)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Connection lifecycle and inbound traffic.
#[derive(Debug)]
pub enum TransportEvent {
    Connected,
    /// Inbound JSON control frame, verbatim
    Frame(String),
    /// Inbound binary frame (synthesized audio)
    Binary(Vec<u8>),
    /// Connection lost, reconnection will be attempted
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    /// Attempt budget exhausted; emitted exactly once, the transport stops
    ReconnectFailed,
    /// Manual disconnect completed; the transport stops
    Closed,
}

#[derive(Debug)]
pub(crate) enum Command {
    Text(String),
    Binary(Vec<u8>),
    Disconnect,
}

/// Caller-facing handle; cloneable, cheap.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    commands: mpsc::Sender<Command>,
}

impl TransportHandle {
    pub(crate) fn new(commands: mpsc::Sender<Command>) -> Self {
        Self { commands }
    }

    pub async fn send_text(&self, frame: String) -> Result<(), TransportClosed> {
        self.commands
            .send(Command::Text(frame))
            .await
            .map_err(|_| TransportClosed)
    }

    pub async fn send_binary(&self, data: Vec<u8>) -> Result<(), TransportClosed> {
        self.commands
            .send(Command::Binary(data))
            .await
            .map_err(|_| TransportClosed)
    }

    /// Close the connection and suppress reconnection.
    pub async fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect).await;
    }
}

/// The transport task has stopped; no more frames can be sent.
#[derive(Debug)]
pub struct TransportClosed;

/// Connect and spawn the transport task.
pub fn connect(url: String, backoff: BackoffPolicy) -> (TransportHandle, mpsc::Receiver<TransportEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(64);
    tokio::spawn(run_transport(url, backoff, cmd_rx, event_tx));
    (TransportHandle::new(cmd_tx), event_rx)
}

enum ConnectionEnd {
    /// Socket dropped or errored; eligible for reconnection
    Dropped,
    /// Caller asked for the disconnect; do not reconnect
    Manual,
}

async fn run_transport(
    url: String,
    backoff: BackoffPolicy,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut schedule = ReconnectSchedule::new(backoff);

    loop {
        match connect_async(&url).await {
            Ok((stream, _)) => {
                info!(url = %url, "Transport connected");
                schedule.reset();
                let _ = events.send(TransportEvent::Connected).await;

                match serve_connection(stream, &mut commands, &events).await {
                    ConnectionEnd::Manual => {
                        let _ = events.send(TransportEvent::Closed).await;
                        return;
                    }
                    ConnectionEnd::Dropped => {
                        warn!(url = %url, "Transport connection lost");
                        let _ = events.send(TransportEvent::Disconnected).await;
                    }
                }
            }
            Err(err) => {
                warn!(url = %url, error = %err, "Transport connect failed");
            }
        }

        let delay = match schedule.next_delay() {
            Some(delay) => delay,
            None => {
                let _ = events.send(TransportEvent::ReconnectFailed).await;
                return;
            }
        };

        let _ = events
            .send(TransportEvent::Reconnecting {
                attempt: schedule.attempt(),
                delay,
            })
            .await;

        // A disconnect arriving during the wait cancels reconnection.
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            cmd = commands.recv() => {
                if matches!(cmd, Some(Command::Disconnect) | None) {
                    let _ = events.send(TransportEvent::Closed).await;
                    return;
                }
            }
        }
    }
}

async fn serve_connection(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    commands: &mut mpsc::Receiver<Command>,
    events: &mpsc::Sender<TransportEvent>,
) -> ConnectionEnd {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Text(frame)) => {
                    if write.send(Message::Text(frame)).await.is_err() {
                        return ConnectionEnd::Dropped;
                    }
                }
                Some(Command::Binary(data)) => {
                    if write.send(Message::Binary(data)).await.is_err() {
                        return ConnectionEnd::Dropped;
                    }
                }
                Some(Command::Disconnect) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    return ConnectionEnd::Manual;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    // Heartbeat is answered here so the app layer never has
                    // to care about keepalive.
                    if let Some(pong) = heartbeat_reply(&text) {
                        if write.send(Message::Text(pong)).await.is_err() {
                            return ConnectionEnd::Dropped;
                        }
                    } else {
                        let _ = events.send(TransportEvent::Frame(text)).await;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = events.send(TransportEvent::Binary(data)).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    if write.send(Message::Pong(payload)).await.is_err() {
                        return ConnectionEnd::Dropped;
                    }
                }
                Some(Ok(Message::Close(reason))) => {
                    debug!("Server closed connection: {:?}", reason);
                    return ConnectionEnd::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "Transport read error");
                    return ConnectionEnd::Dropped;
                }
                None => return ConnectionEnd::Dropped,
            }
        }
    }
}

/// A server `ping` control frame gets an immediate `pong` echoing its
/// timestamp; anything else is not heartbeat traffic.
fn heartbeat_reply(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("type")?.as_str()? != "ping" {
        return None;
    }
    let timestamp = value.get("timestamp")?.as_u64()?;
    Some(json!({"type": "pong", "timestamp": timestamp}).to_string())
}
