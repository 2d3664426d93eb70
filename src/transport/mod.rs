//! Command transport between a plugin process and its host application.
//!
//! Either side can issue a call and await a typed result, or register a
//! handler that answers calls coming from the other side. Calls and replies
//! are correlated purely by envelope id.
//!
//! # Architecture
//!
//! ```text
//! Transport (facade, cloneable)
//!     │  mpsc<Command>
//!     ▼
//! session actor (one tokio task, owns all transport state)
//!     ├── PendingCalls   correlation table + DelayQueue timers
//!     ├── Router         command type → Handler, in-flight handler futures
//!     └── WsWriter/Reader socket, reconnect loop, ConnectionState
//! ```
//!
//! The actor is the only place where the pending table, the handler map, and
//! the socket are touched, so none of them needs a lock. A slow handler is
//! polled alongside the socket instead of blocking it, which means replies may
//! leave in a different order than their requests arrived.
//!
//! # Usage
//!
//! ```ignore
//! let transport = Transport::start(TransportConfig::new("ws://127.0.0.1:28196", "plugin-1"));
//! transport.on("ping", |_payload| async { Ok(json!({ "pong": true })) });
//!
//! let settings = transport.call("getSettings", json!({})).await?;
//! let path = transport.call_with_timeout("openFileDialog", json!({}), None).await?;
//! ```

pub mod connection;
pub mod envelope;
pub mod pending;
pub mod router;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};

use crate::constants::{CONNECT_TIMEOUT, DEFAULT_CALL_TIMEOUT};
use connection::Engine;
use pending::CallReply;

pub use connection::{ExponentialBackoff, FixedDelay, ReconnectPolicy};
pub use envelope::{DecodeError, Envelope, Status};
pub use router::{Handler, HandlerResult};

/// Connection lifecycle as observed from outside the session actor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to connect.
    #[default]
    Disconnected,
    /// Socket handshake in progress.
    Connecting,
    /// Connected and ready for calls.
    Connected,
    /// Waiting before the next connection attempt.
    Reconnecting {
        /// Consecutive failed or lost connections so far.
        attempt: u32,
        /// Milliseconds until the next attempt.
        next_retry_ms: u64,
    },
}

/// Why a call (or notification) did not produce a result.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// The socket is not open; nothing was sent.
    NotConnected,
    /// No reply arrived before the call's timeout.
    Timeout {
        /// Command type of the original call.
        command_type: String,
        /// Payload of the original call.
        payload: Value,
    },
    /// The peer answered with an error reply.
    Remote {
        /// Command type of the original call.
        command_type: String,
        /// Error text supplied by the peer.
        message: String,
    },
    /// The connection dropped while the call was outstanding.
    ConnectionLost {
        /// Command type of the original call.
        command_type: String,
    },
    /// Another outstanding call already uses this correlation id.
    DuplicateId(String),
    /// The envelope could not be serialized.
    Encode(String),
    /// The transport has shut down.
    Shutdown,
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Not connected to host"),
            Self::Timeout {
                command_type,
                payload,
            } => write!(f, "Call `{command_type}` timed out (payload: {payload})"),
            Self::Remote {
                command_type,
                message,
            } => write!(f, "Call `{command_type}` failed: {message}"),
            Self::ConnectionLost { command_type } => {
                write!(f, "Connection lost before `{command_type}` was answered")
            }
            Self::DuplicateId(id) => write!(f, "Correlation id already in flight: {id}"),
            Self::Encode(msg) => write!(f, "Failed to encode envelope: {msg}"),
            Self::Shutdown => write!(f, "Transport shut down"),
        }
    }
}

impl std::error::Error for CallError {}

/// Requests from the facade to the session actor.
pub(crate) enum Command {
    /// Send a request and track its reply.
    Call {
        command_type: String,
        payload: Value,
        timeout: Option<Duration>,
        reply: CallReply,
    },
    /// Send a request without tracking a reply.
    Notify {
        command_type: String,
        payload: Value,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    /// Register (or replace) the handler for a command type.
    On {
        command_type: String,
        handler: Arc<dyn Handler>,
    },
    /// Remove the handler for a command type.
    Off { command_type: String },
    /// Report the number of outstanding calls.
    PendingCount { reply: oneshot::Sender<usize> },
    /// Stop the actor and fail every outstanding call.
    Shutdown,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call {
                command_type,
                timeout,
                ..
            } => f
                .debug_struct("Call")
                .field("command_type", command_type)
                .field("timeout", timeout)
                .finish_non_exhaustive(),
            Self::Notify { command_type, .. } => f
                .debug_struct("Notify")
                .field("command_type", command_type)
                .finish_non_exhaustive(),
            Self::On { command_type, .. } => f
                .debug_struct("On")
                .field("command_type", command_type)
                .finish_non_exhaustive(),
            Self::Off { command_type } => f
                .debug_struct("Off")
                .field("command_type", command_type)
                .finish(),
            Self::PendingCount { .. } => write!(f, "PendingCount"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Settings for a dialing (plugin-side) transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket URL of the host, e.g. `ws://127.0.0.1:28196`.
    pub url: String,
    /// Plugin instance identifier announced in the startup handshake.
    pub plugin_id: String,
    /// Identifier stamped on every outbound envelope, if any.
    pub sender_id: Option<String>,
    /// Timeout used by [`Transport::call`]. `None` never times out.
    pub default_timeout: Option<Duration>,
    /// Delay policy between connection attempts.
    pub reconnect: Arc<dyn ReconnectPolicy>,
    /// Limit on each connect + upgrade attempt.
    pub connect_timeout: Duration,
}

impl TransportConfig {
    /// Config with the reference defaults: 5 s calls, fixed 5 s reconnect delay.
    pub fn new(url: impl Into<String>, plugin_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            plugin_id: plugin_id.into(),
            sender_id: None,
            default_timeout: Some(DEFAULT_CALL_TIMEOUT),
            reconnect: Arc::new(FixedDelay::default()),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Use a different reconnect policy.
    pub fn with_reconnect(mut self, policy: impl ReconnectPolicy + 'static) -> Self {
        self.reconnect = Arc::new(policy);
        self
    }

    /// Change how long a single connection attempt may take.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Stamp `senderID` on outbound envelopes.
    pub fn with_sender_id(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    /// Change the timeout used by [`Transport::call`].
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Settings for a transport running over an accepted connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Identifier stamped on every outbound envelope, if any.
    pub sender_id: Option<String>,
    /// Timeout used by [`Transport::call`]. `None` never times out.
    pub default_timeout: Option<Duration>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            sender_id: None,
            default_timeout: Some(DEFAULT_CALL_TIMEOUT),
        }
    }
}

/// Public handle to a running transport.
///
/// Cheap to clone; every clone talks to the same session actor. The actor
/// stops on [`Transport::shutdown`] or once the last handle is dropped. A
/// handler that captures a clone keeps the actor alive until `shutdown`.
#[derive(Debug, Clone)]
pub struct Transport {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    default_timeout: Option<Duration>,
}

impl Transport {
    /// Start dialing the host and keep the connection alive.
    ///
    /// Returns immediately; the first connection attempt runs in the
    /// background. Every successful (re)connect sends a `startup` envelope
    /// carrying the plugin id. Must be called inside a tokio runtime.
    pub fn start(config: TransportConfig) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let default_timeout = config.default_timeout;

        let engine = Engine::new(config.sender_id.clone(), state_tx);
        tokio::spawn(connection::run_client(engine, commands_rx, config));

        Self {
            commands,
            state,
            default_timeout,
        }
    }

    /// Serve an accepted connection (the host side of the protocol).
    ///
    /// Performs the WebSocket handshake, then runs the same call/handler
    /// engine without reconnecting or sending a startup envelope. When the
    /// peer goes away the transport reports `Disconnected` and calls fail
    /// with [`CallError::NotConnected`].
    ///
    /// # Errors
    ///
    /// Returns an error if the WebSocket handshake fails.
    pub async fn accept<S>(stream: S, config: PeerConfig) -> anyhow::Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, reader) = crate::ws::accept(stream).await?;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Connected);

        let engine = Engine::new(config.sender_id, state_tx);
        tokio::spawn(connection::run_peer(engine, commands_rx, writer, reader));

        Ok(Self {
            commands,
            state,
            default_timeout: config.default_timeout,
        })
    }

    /// Call `command_type` on the peer with the default timeout.
    pub async fn call(&self, command_type: &str, payload: Value) -> Result<Value, CallError> {
        self.call_with_timeout(command_type, payload, self.default_timeout)
            .await
    }

    /// Call `command_type` on the peer and await its reply.
    ///
    /// `None` (or a zero duration) waits for the reply indefinitely; use it
    /// for host operations of unbounded duration such as file dialogs.
    pub async fn call_with_timeout(
        &self,
        command_type: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Call {
                command_type: command_type.to_string(),
                payload,
                timeout,
                reply,
            })
            .map_err(|_| CallError::Shutdown)?;

        reply_rx.await.map_err(|_| CallError::Shutdown)?
    }

    /// Send `command_type` without waiting for a reply.
    ///
    /// Resolves once the envelope has been written to the socket.
    pub async fn notify(&self, command_type: &str, payload: Value) -> Result<(), CallError> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Notify {
                command_type: command_type.to_string(),
                payload,
                reply,
            })
            .map_err(|_| CallError::Shutdown)?;

        reply_rx.await.map_err(|_| CallError::Shutdown)?
    }

    /// Register the handler for `command_type`, replacing any previous one.
    pub fn on<H: Handler>(&self, command_type: &str, handler: H) {
        let _ = self.commands.send(Command::On {
            command_type: command_type.to_string(),
            handler: Arc::new(handler),
        });
    }

    /// Remove the handler for `command_type`.
    pub fn off(&self, command_type: &str) {
        let _ = self.commands.send(Command::Off {
            command_type: command_type.to_string(),
        });
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Whether calls can currently be sent.
    pub fn is_connected(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Connected)
    }

    /// Wait until the connection state satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Shutdown`] if the actor stops first.
    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> Result<ConnectionState, CallError> {
        let mut state = self.state.clone();
        let matched = state
            .wait_for(predicate)
            .await
            .map_err(|_| CallError::Shutdown)?;
        Ok((*matched).clone())
    }

    /// Number of calls awaiting a reply.
    pub async fn pending_calls(&self) -> usize {
        let (reply, reply_rx) = oneshot::channel();
        if self.commands.send(Command::PendingCount { reply }).is_err() {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    /// Close the connection and fail every outstanding call.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}
