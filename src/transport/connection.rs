//! Socket lifecycle and the session actor.
//!
//! One tokio task owns the socket, the correlation table, and the handler
//! map. It reacts to four sources in a single `select!` loop:
//!
//! - commands from [`Transport`](super::Transport) handles
//! - text frames from the peer
//! - call timeouts from the correlation table
//! - finished handler futures
//!
//! # Reconnection
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ─► (socket lost) ─► Reconnecting ─► Connecting ...
//!                     │                                             ▲
//!                     └──────────────── (connect failed) ───────────┘
//! ```
//!
//! A dialing transport retries forever; the wait between attempts comes from
//! an injectable [`ReconnectPolicy`]. Losing the socket fails every
//! outstanding call at once with [`CallError::ConnectionLost`]. While not
//! connected, calls fail immediately with [`CallError::NotConnected`];
//! nothing is buffered.

use std::time::Duration;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};

use super::envelope::{self, Envelope};
use super::pending::{CallReply, PendingCalls};
use super::router::{ReplyFuture, Route, Router};
use super::{CallError, Command, ConnectionState, TransportConfig};
use crate::constants::{
    MAX_RECONNECT_BACKOFF, RECONNECT_DELAY, STARTUP_PLUGIN_ID_KEY, STARTUP_TYPE,
};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

// =============================================================================
// Reconnect policies
// =============================================================================

/// Decides how long to wait before the next connection attempt.
pub trait ReconnectPolicy: Send + Sync + std::fmt::Debug {
    /// Delay before attempt number `attempt` (1 for the first retry).
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Same delay before every attempt, forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay(pub Duration);

impl Default for FixedDelay {
    fn default() -> Self {
        Self(RECONNECT_DELAY)
    }
}

impl ReconnectPolicy for FixedDelay {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Doubling delay with random jitter, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound before jitter.
    pub max: Duration,
    /// Upper bound of the random extra delay added to each wait.
    pub jitter: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: MAX_RECONNECT_BACKOFF,
            jitter: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let base = self.initial.saturating_mul(factor).min(self.max);

        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::random::<u64>() % jitter_ms)
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Outbound request prepared from a command.
enum Outbound {
    Call {
        envelope: Envelope,
        timeout: Option<Duration>,
        reply: CallReply,
    },
    Notify {
        envelope: Envelope,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
}

impl Outbound {
    /// Fail without sending.
    fn reject(self, error: CallError) {
        match self {
            Self::Call { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::Notify { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// What to do after handling a command.
enum Step {
    /// Nothing to send.
    Idle,
    /// A request is ready to go out.
    Send(Outbound),
    /// Shutdown was requested.
    Shutdown,
}

/// Why a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionExit {
    /// The socket closed or failed.
    Disconnected,
    /// Shutdown was requested or every handle was dropped.
    Shutdown,
}

/// Transport state owned by the session actor.
pub(crate) struct Engine {
    pending: PendingCalls,
    router: Router,
    in_flight: FuturesUnordered<ReplyFuture>,
    sender_id: Option<String>,
    state: watch::Sender<ConnectionState>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("pending", &self.pending)
            .field("router", &self.router)
            .field("in_flight", &self.in_flight.len())
            .field("sender_id", &self.sender_id)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub(crate) fn new(sender_id: Option<String>, state: watch::Sender<ConnectionState>) -> Self {
        Self {
            pending: PendingCalls::new(),
            router: Router::new(),
            in_flight: FuturesUnordered::new(),
            sender_id,
            state,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Apply a command that does not need the socket.
    fn take_command(&mut self, command: Command) -> Step {
        match command {
            Command::Call {
                command_type,
                payload,
                timeout,
                reply,
            } => Step::Send(Outbound::Call {
                envelope: Envelope::request(command_type, payload),
                timeout,
                reply,
            }),
            Command::Notify {
                command_type,
                payload,
                reply,
            } => Step::Send(Outbound::Notify {
                envelope: Envelope::request(command_type, payload),
                reply,
            }),
            Command::On {
                command_type,
                handler,
            } => {
                if self.router.register(command_type.clone(), handler) {
                    log::debug!("[Router] Replaced handler for '{}'", command_type);
                }
                Step::Idle
            }
            Command::Off { command_type } => {
                self.router.off(&command_type);
                Step::Idle
            }
            Command::PendingCount { reply } => {
                let _ = reply.send(self.pending.len());
                Step::Idle
            }
            Command::Shutdown => Step::Shutdown,
        }
    }

    /// Handle a command while no socket is open.
    ///
    /// Returns `true` if shutdown was requested.
    fn handle_offline(&mut self, command: Command) -> bool {
        match self.take_command(command) {
            Step::Idle => false,
            Step::Send(outbound) => {
                outbound.reject(CallError::NotConnected);
                false
            }
            Step::Shutdown => true,
        }
    }

    /// Handle a command while connected.
    async fn handle_online<S>(&mut self, command: Command, writer: &mut WsWriter<S>) -> Option<SessionExit>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.take_command(command) {
            Step::Idle => None,
            Step::Shutdown => Some(SessionExit::Shutdown),
            Step::Send(Outbound::Call {
                envelope,
                timeout,
                reply,
            }) => {
                let frame = match self.encode(&envelope) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return None;
                    }
                };
                if !self.pending.register(
                    &envelope.id,
                    &envelope.command_type,
                    envelope.payload,
                    timeout,
                    reply,
                ) {
                    return None;
                }
                log::debug!("[Transport] -> call '{}' id={}", envelope.command_type, envelope.id);
                // On failure the pending entry is failed with the rest of the
                // table once the session unwinds.
                write(writer, &frame).await
            }
            Step::Send(Outbound::Notify { envelope, reply }) => {
                let frame = match self.encode(&envelope) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return None;
                    }
                };
                let exit = write(writer, &frame).await;
                let _ = reply.send(match exit {
                    None => Ok(()),
                    Some(_) => Err(CallError::NotConnected),
                });
                exit
            }
        }
    }

    /// Stamp the sender id and serialize.
    fn encode(&self, envelope: &Envelope) -> Result<String, CallError> {
        let envelope = envelope.clone().with_sender(self.sender_id.as_deref());
        envelope::encode(&envelope).map_err(|e| CallError::Encode(e.to_string()))
    }

    /// Decode and route one inbound text frame.
    fn handle_frame(&mut self, text: &str) {
        let envelope = match envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("[Router] Dropping frame: {}", e);
                return;
            }
        };

        let command_type = envelope.command_type.clone();
        match self.router.route(envelope, &mut self.pending) {
            Route::Completed => {}
            Route::Stale(id) => {
                log::debug!("[Router] Dropping reply for unknown call id={}", id);
            }
            Route::Unhandled(command_type) => {
                log::trace!("[Router] No handler for '{}'", command_type);
            }
            Route::Dispatch(reply) => {
                log::debug!("[Router] <- command '{}'", command_type);
                self.in_flight.push(reply);
            }
        }
    }

    /// Frame for the startup handshake announcing this plugin instance.
    fn startup_frame(&self, plugin_id: &str) -> Result<String, CallError> {
        let envelope = Envelope::request(STARTUP_TYPE, json!({ STARTUP_PLUGIN_ID_KEY: plugin_id }));
        self.encode(&envelope)
    }

    /// Run one connected session until the socket drops or shutdown.
    async fn run_session<S>(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        writer: &mut WsWriter<S>,
        reader: &mut WsReader<S>,
    ) -> SessionExit
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => {
                    let Some(command) = command else {
                        return SessionExit::Shutdown;
                    };
                    if let Some(exit) = self.handle_online(command, writer).await {
                        return exit;
                    }
                }

                msg = reader.recv() => match msg {
                    Some(Ok(WsMessage::Text(text))) => self.handle_frame(&text),
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = writer.send_pong(data).await {
                            log::warn!("[Connection] Failed to answer ping: {e:#}");
                            return SessionExit::Disconnected;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Binary(data))) => {
                        log::warn!("[Connection] Ignoring {} byte binary frame", data.len());
                    }
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        log::info!("[Connection] Closed by peer (code={}, reason={:?})", code, reason);
                        return SessionExit::Disconnected;
                    }
                    Some(Err(e)) => {
                        log::warn!("[Connection] {e:#}");
                        return SessionExit::Disconnected;
                    }
                    None => {
                        log::info!("[Connection] Stream ended");
                        return SessionExit::Disconnected;
                    }
                },

                id = self.pending.next_timeout() => {
                    log::warn!("[Transport] Call id={} timed out", id);
                }

                Some(reply) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    let frame = match self.encode(&reply) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::error!("[Router] Failed to encode reply id={}: {}", reply.id, e);
                            continue;
                        }
                    };
                    log::debug!("[Router] -> reply id={} status={:?}", reply.id, reply.status);
                    if let Some(exit) = write(writer, &frame).await {
                        return exit;
                    }
                }
            }
        }
    }

    /// Serve commands without a socket until `delay` elapses.
    ///
    /// `None` waits until shutdown. Returns `true` if shutdown was requested.
    async fn idle(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>, delay: Option<Duration>) -> bool {
        let sleep = async {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_offline(command) {
                            return true;
                        }
                    }
                    None => return true,
                },

                () = &mut sleep => return false,
            }
        }
    }

    /// Fail every outstanding call after the socket went away.
    ///
    /// Handlers still running for that socket are dropped; their replies
    /// must not reach a later connection.
    fn connection_lost(&mut self) {
        if !self.in_flight.is_empty() {
            log::debug!(
                "[Router] Cancelling {} handler(s) from the closed connection",
                self.in_flight.len()
            );
            self.in_flight.clear();
        }

        let failed = self.pending.fail_all(|command_type| CallError::ConnectionLost {
            command_type: command_type.to_string(),
        });
        if failed > 0 {
            log::warn!("[Transport] Failed {} pending call(s) on connection loss", failed);
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Final teardown.
    fn shutdown(&mut self) {
        self.pending.fail_all(|_| CallError::Shutdown);
        self.set_state(ConnectionState::Disconnected);
        log::info!("[Transport] Shut down");
    }
}

async fn write<S>(writer: &mut WsWriter<S>, frame: &str) -> Option<SessionExit>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match writer.send_text(frame).await {
        Ok(()) => None,
        Err(e) => {
            log::warn!("[Connection] Write failed: {e:#}");
            Some(SessionExit::Disconnected)
        }
    }
}

// =============================================================================
// Actor entry points
// =============================================================================

/// Dial the host, keep reconnecting, and serve commands until shutdown.
pub(crate) async fn run_client(
    mut engine: Engine,
    mut commands: mpsc::UnboundedReceiver<Command>,
    config: TransportConfig,
) {
    let mut attempt: u32 = 0;

    'outer: loop {
        engine.set_state(ConnectionState::Connecting);
        log::info!("[Connection] Connecting to {}", config.url);

        let connect = ws::connect_with_timeout(&config.url, config.connect_timeout);
        tokio::pin!(connect);

        let connected = loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => {
                        if engine.handle_offline(command) {
                            break 'outer;
                        }
                    }
                    None => break 'outer,
                },

                result = &mut connect => break result,
            }
        };

        match connected {
            Ok((mut writer, mut reader)) => {
                log::info!("[Connection] Connected to {}", config.url);
                attempt = 0;
                engine.set_state(ConnectionState::Connected);

                let startup = match engine.startup_frame(&config.plugin_id) {
                    Ok(frame) => write(&mut writer, &frame).await,
                    Err(e) => {
                        log::error!("[Connection] Failed to encode startup envelope: {}", e);
                        None
                    }
                };
                let exit = match startup {
                    Some(exit) => exit,
                    None => engine.run_session(&mut commands, &mut writer, &mut reader).await,
                };

                if exit == SessionExit::Shutdown {
                    let _ = writer.close().await;
                    break;
                }
                engine.connection_lost();
            }
            Err(e) => {
                log::warn!("[Connection] {e:#}");
            }
        }

        attempt = attempt.saturating_add(1);
        let delay = config.reconnect.next_delay(attempt);
        engine.set_state(ConnectionState::Reconnecting {
            attempt,
            next_retry_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });
        log::info!(
            "[Connection] Reconnecting in {:.1}s (attempt {})",
            delay.as_secs_f32(),
            attempt
        );

        if engine.idle(&mut commands, Some(delay)).await {
            break;
        }
    }

    engine.shutdown();
}

/// Serve one accepted connection, then keep answering commands offline.
pub(crate) async fn run_peer<S>(
    mut engine: Engine,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut writer: WsWriter<S>,
    mut reader: WsReader<S>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    engine.set_state(ConnectionState::Connected);
    let exit = engine.run_session(&mut commands, &mut writer, &mut reader).await;

    if exit == SessionExit::Shutdown {
        let _ = writer.close().await;
    } else {
        engine.connection_lost();
        drop(writer);
        drop(reader);
        engine.idle(&mut commands, None).await;
    }

    engine.shutdown();
}
