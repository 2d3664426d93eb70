//! Inbound envelope routing and handler registrations.
//!
//! An inbound envelope either completes one of our outstanding calls or is a
//! command for a locally registered [`Handler`]. Handler futures are returned
//! to the session actor, which polls them next to the socket and writes the
//! `response` envelope once each one finishes.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

use super::envelope::Envelope;
use super::pending::PendingCalls;

/// Result produced by a handler; becomes the reply payload or error.
pub type HandlerResult = anyhow::Result<Value>;

/// Local function answering one command type.
///
/// Implemented for any `Fn(Value) -> impl Future<Output = HandlerResult>`;
/// synchronous handlers return `std::future::ready(..)` or an `async` block
/// without awaits.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one command's payload.
    async fn handle(&self, payload: Value) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, payload: Value) -> HandlerResult {
        (self)(payload).await
    }
}

/// A running handler that resolves to the reply envelope.
pub type ReplyFuture = BoxFuture<'static, Envelope>;

/// What the router decided for an inbound envelope.
pub enum Route {
    /// The envelope answered an outstanding call.
    Completed,
    /// A reply for a call that is no longer outstanding.
    Stale(String),
    /// No handler is registered for this command type; nothing is sent.
    Unhandled(String),
    /// A handler is running; its future yields the reply.
    Dispatch(ReplyFuture),
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "Completed"),
            Self::Stale(id) => f.debug_tuple("Stale").field(id).finish(),
            Self::Unhandled(command_type) => f.debug_tuple("Unhandled").field(command_type).finish(),
            Self::Dispatch(_) => write!(f, "Dispatch(..)"),
        }
    }
}

/// Handler registrations keyed by command type.
///
/// One handler per type; registering again replaces the previous handler
/// (last write wins). There is no fan-out to multiple subscribers.
#[derive(Default)]
pub struct Router {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("Router").field("handlers", &types).finish()
    }
}

impl Router {
    /// Create a router with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `command_type`.
    ///
    /// Returns `true` if a previous handler was replaced.
    pub fn on<H: Handler>(&mut self, command_type: impl Into<String>, handler: H) -> bool {
        self.register(command_type.into(), Arc::new(handler))
    }

    /// Register an already shared handler.
    pub(crate) fn register(&mut self, command_type: String, handler: Arc<dyn Handler>) -> bool {
        self.handlers.insert(command_type, handler).is_some()
    }

    /// Remove the handler for `command_type`. Returns `true` if one existed.
    pub fn off(&mut self, command_type: &str) -> bool {
        self.handlers.remove(command_type).is_some()
    }

    /// Whether a handler is registered for `command_type`.
    pub fn handles(&self, command_type: &str) -> bool {
        self.handlers.contains_key(command_type)
    }

    /// Route one inbound envelope.
    ///
    /// Correlation wins over type: an envelope whose id matches an
    /// outstanding call completes it, whatever its type. Unmatched
    /// `response` envelopes are stale; other unmatched envelopes go to the
    /// handler for their type, if any.
    pub fn route(&self, envelope: Envelope, pending: &mut PendingCalls) -> Route {
        if pending.contains(&envelope.id) {
            let id = envelope.id.clone();
            pending.complete(&id, envelope.into_outcome());
            return Route::Completed;
        }

        if envelope.is_response() {
            return Route::Stale(envelope.id);
        }

        match self.handlers.get(&envelope.command_type) {
            Some(handler) => Route::Dispatch(invoke(Arc::clone(handler), envelope)),
            None => Route::Unhandled(envelope.command_type),
        }
    }
}

/// Run `handler` for `envelope`, converting failures and panics into an
/// error reply.
fn invoke(handler: Arc<dyn Handler>, envelope: Envelope) -> ReplyFuture {
    let Envelope {
        id,
        command_type,
        payload,
        ..
    } = envelope;

    Box::pin(async move {
        match AssertUnwindSafe(handler.handle(payload)).catch_unwind().await {
            Ok(Ok(result)) => Envelope::success(id, result),
            Ok(Err(e)) => {
                let mut message = format!("{e:#}");
                if message.is_empty() {
                    message = format!("handler for `{command_type}` failed");
                }
                log::warn!("[Router] Handler for '{}' failed: {}", command_type, message);
                Envelope::failure(id, message)
            }
            Err(_) => {
                log::error!("[Router] Handler for '{}' panicked", command_type);
                Envelope::failure(id, format!("handler for `{command_type}` panicked"))
            }
        }
    })
}
