//! Application-wide constants for hostlink.
//!
//! Centralizes protocol names and timing defaults so the transport,
//! configuration layer, and binary agree on them.
//!
//! # Categories
//!
//! - **Protocol**: reserved command types and payload keys
//! - **Timeouts**: call and reconnect timing
//! - **Network**: default host address

use std::time::Duration;

// ============================================================================
// Protocol
// ============================================================================

/// Command type reserved for replies to a call.
pub const RESPONSE_TYPE: &str = "response";

/// Command type of the handshake sent every time the socket opens.
pub const STARTUP_TYPE: &str = "startup";

/// Payload key carrying the plugin instance identifier in the handshake.
pub const STARTUP_PLUGIN_ID_KEY: &str = "pluginID";

/// Error text used when a remote error reply carries no message.
pub const UNKNOWN_REMOTE_ERROR: &str = "unknown error";

// ============================================================================
// Timeouts
// ============================================================================

/// Default timeout applied by `Transport::call`.
///
/// Calls that wrap unbounded host operations (file dialogs and the like)
/// should pass `None` to `call_with_timeout` instead.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed delay between reconnect attempts.
///
/// The host is a long-lived local peer that may restart, so the transport
/// retries forever at this cadence.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Floor applied to configured reconnect delays so a down host is not
/// hammered in a tight loop.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Time allowed for the TCP connect plus WebSocket upgrade.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for the opt-in exponential backoff policy.
pub const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(60);

// ============================================================================
// Network
// ============================================================================

/// Host address the plugin dials; the host application is always local.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Config file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "hostlink.json";

/// Log file written to the working directory by the binary.
pub const LOG_FILE_NAME: &str = "hostlink.log";
