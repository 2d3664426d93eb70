//! Correlation table for outstanding calls.
//!
//! Maps a correlation id to the caller waiting on it. Each entry owns at most
//! one timer in a shared [`DelayQueue`]; the timer is removed exactly once,
//! either when the reply arrives or when it fires, so an expired timer can
//! never evict a different call.

use std::collections::HashMap;
use std::future::poll_fn;
use std::task::Poll;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::time::{delay_queue, DelayQueue};

use super::CallError;

/// Where the outcome of a call is delivered.
pub(crate) type CallReply = oneshot::Sender<Result<Value, CallError>>;

/// One outstanding call.
struct PendingCall {
    /// Command type of the request, kept for diagnostics.
    command_type: String,
    /// Payload of the request, kept for timeout diagnostics.
    payload: Value,
    /// Caller waiting for the outcome.
    reply: CallReply,
    /// Timer key; `None` for calls that never time out.
    timer: Option<delay_queue::Key>,
}

/// Outstanding calls keyed by correlation id.
pub struct PendingCalls {
    entries: HashMap<String, PendingCall>,
    timers: DelayQueue<String>,
}

impl std::fmt::Debug for PendingCalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCalls")
            .field("entries", &self.entries.len())
            .field("timers", &self.timers.len())
            .finish()
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCalls {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            timers: DelayQueue::new(),
        }
    }

    /// Track a new call.
    ///
    /// A zero or absent `timeout` means the call waits for its reply
    /// indefinitely. If `id` is already in flight the new call is rejected
    /// with [`CallError::DuplicateId`] and `false` is returned.
    pub(crate) fn register(
        &mut self,
        id: &str,
        command_type: &str,
        payload: Value,
        timeout: Option<Duration>,
        reply: CallReply,
    ) -> bool {
        if self.entries.contains_key(id) {
            let _ = reply.send(Err(CallError::DuplicateId(id.to_string())));
            return false;
        }

        let timer = timeout
            .filter(|t| !t.is_zero())
            .map(|t| self.timers.insert(id.to_string(), t));

        self.entries.insert(
            id.to_string(),
            PendingCall {
                command_type: command_type.to_string(),
                payload,
                reply,
                timer,
            },
        );
        true
    }

    /// Resolve the call for `id` with a reply outcome.
    ///
    /// `Err` carries the peer's error message. Returns `false` when no call
    /// with that id is outstanding (late, duplicate, or spurious reply).
    pub fn complete(&mut self, id: &str, outcome: Result<Value, String>) -> bool {
        let Some(call) = self.take(id) else {
            return false;
        };

        let result = outcome.map_err(|message| CallError::Remote {
            command_type: call.command_type,
            message,
        });
        let _ = call.reply.send(result);
        true
    }

    /// Whether a call with `id` is outstanding.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no calls are outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait for the next call timeout, evict that call, and fail it.
    ///
    /// Returns the evicted id. Pends forever while no timer is armed.
    /// Cancel safe: an expired timer is either fully handled or not taken.
    pub async fn next_timeout(&mut self) -> String {
        let id = poll_fn(|cx| match self.timers.poll_expired(cx) {
            Poll::Ready(Some(expired)) => Poll::Ready(expired.into_inner()),
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        })
        .await;

        if let Some(call) = self.entries.remove(&id) {
            let _ = call.reply.send(Err(CallError::Timeout {
                command_type: call.command_type,
                payload: call.payload,
            }));
        }
        id
    }

    /// Fail every outstanding call, e.g. on connection loss or shutdown.
    ///
    /// `error` builds the failure from the call's command type.
    pub fn fail_all(&mut self, error: impl Fn(&str) -> CallError) -> usize {
        self.timers.clear();
        let count = self.entries.len();
        for (_, call) in self.entries.drain() {
            let _ = call.reply.send(Err(error(&call.command_type)));
        }
        count
    }

    /// Remove an entry and cancel its timer.
    fn take(&mut self, id: &str) -> Option<PendingCall> {
        let call = self.entries.remove(id)?;
        if let Some(ref key) = call.timer {
            let _ = self.timers.remove(key);
        }
        Some(call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(
        table: &mut PendingCalls,
        id: &str,
        command_type: &str,
        timeout: Option<Duration>,
    ) -> oneshot::Receiver<Result<Value, CallError>> {
        let (tx, rx) = oneshot::channel();
        assert!(table.register(id, command_type, json!({ "n": 1 }), timeout, tx));
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_resolves_with_payload_and_removes_entry() {
        let mut table = PendingCalls::new();
        let rx = call(&mut table, "a", "getSettings", Some(Duration::from_secs(5)));

        assert!(table.complete("a", Ok(json!({ "volume": 3 }))));
        assert_eq!(rx.await.unwrap(), Ok(json!({ "volume": 3 })));
        assert!(!table.contains("a"));
        assert!(table.is_empty());

        // The cancelled timer must never fire.
        let fired = tokio::time::timeout(Duration::from_secs(10), table.next_timeout()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn test_complete_with_remote_error() {
        let mut table = PendingCalls::new();
        let rx = call(&mut table, "a", "deleteFile", None);

        assert!(table.complete("a", Err("permission denied".to_string())));
        assert_eq!(
            rx.await.unwrap(),
            Err(CallError::Remote {
                command_type: "deleteFile".to_string(),
                message: "permission denied".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_complete_unknown_id_returns_false() {
        let mut table = PendingCalls::new();
        assert!(!table.complete("nope", Ok(Value::Null)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_evicts_and_reports_type_and_payload() {
        let mut table = PendingCalls::new();
        let rx = call(&mut table, "slow-1", "slow", Some(Duration::from_millis(100)));

        let started = tokio::time::Instant::now();
        let id = table.next_timeout().await;
        assert_eq!(id, "slow-1");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(150), "fired late: {elapsed:?}");
        assert!(table.is_empty());

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            CallError::Timeout {
                command_type: "slow".to_string(),
                payload: json!({ "n": 1 }),
            }
        );
        assert!(err.to_string().contains("slow"));

        // A late reply is dropped without effect.
        assert!(!table.complete("slow-1", Ok(Value::Null)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_and_absent_timeouts_never_fire() {
        let mut table = PendingCalls::new();
        let _a = call(&mut table, "a", "openFileDialog", None);
        let _b = call(&mut table, "b", "openFileDialog", Some(Duration::ZERO));

        let fired = tokio::time::timeout(Duration::from_secs(3600), table.next_timeout()).await;
        assert!(fired.is_err());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_fire_in_deadline_order() {
        let mut table = PendingCalls::new();
        let _late = call(&mut table, "late", "x", Some(Duration::from_millis(300)));
        let _early = call(&mut table, "early", "x", Some(Duration::from_millis(100)));

        assert_eq!(table.next_timeout().await, "early");
        assert!(table.contains("late"));
        assert_eq!(table.next_timeout().await, "late");
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let mut table = PendingCalls::new();
        let first = call(&mut table, "same", "x", None);

        let (tx, rx) = oneshot::channel();
        assert!(!table.register("same", "y", Value::Null, None, tx));
        assert_eq!(
            rx.await.unwrap(),
            Err(CallError::DuplicateId("same".to_string()))
        );

        // The original call is untouched.
        assert!(table.complete("same", Ok(json!(1))));
        assert_eq!(first.await.unwrap(), Ok(json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_all_drains_entries_and_timers() {
        let mut table = PendingCalls::new();
        let a = call(&mut table, "a", "first", Some(Duration::from_millis(50)));
        let b = call(&mut table, "b", "second", None);

        let failed = table.fail_all(|command_type| CallError::ConnectionLost {
            command_type: command_type.to_string(),
        });
        assert_eq!(failed, 2);
        assert!(table.is_empty());

        assert_eq!(
            a.await.unwrap(),
            Err(CallError::ConnectionLost {
                command_type: "first".to_string()
            })
        );
        assert_eq!(
            b.await.unwrap(),
            Err(CallError::ConnectionLost {
                command_type: "second".to_string()
            })
        );

        let fired = tokio::time::timeout(Duration::from_secs(1), table.next_timeout()).await;
        assert!(fired.is_err());
    }
}
