//! hostlink - request/response command transport between a plugin process
//! and its host application.
//!
//! The plugin dials the host over a persistent localhost WebSocket. Either
//! side can call a named command and await its result, or register a handler
//! that answers commands from the other side.
//!
//! # Modules
//!
//! - [`transport`] - envelope codec, correlation table, dispatch router,
//!   connection manager, and the [`Transport`] facade
//! - [`ws`] - WebSocket reader/writer halves
//! - [`config`] - command-line arguments and configuration loading
//! - [`constants`] - protocol names and timing defaults

pub mod config;
pub mod constants;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use config::{Args, Config};
pub use transport::{
    CallError, ConnectionState, Envelope, ExponentialBackoff, FixedDelay, Handler, HandlerResult,
    PeerConfig, ReconnectPolicy, Status, Transport, TransportConfig,
};
