//! Request/response correlation. Every remote call embeds a freshly minted
//! token; the completion message eventually published under that topic
//! resolves exactly one pending operation.

use std::collections::HashMap;
use std::sync::Arc;

use eval_bus::EvalBus;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// Completion of one remote call: the remote `res` value or the remote `err`.
pub type CallOutcome = Result<Value, Value>;

/// Registry of in-flight remote calls keyed by correlation token.
///
/// No timeout is enforced here: a completion that never arrives leaves its
/// receiver pending. Callers needing bounded latency wrap the await in
/// `tokio::time::timeout`.
pub struct PendingOps {
    bus: Arc<dyn EvalBus>,
    ops: Mutex<HashMap<String, oneshot::Sender<CallOutcome>>>,
}

impl PendingOps {
    pub fn new(bus: Arc<dyn EvalBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            ops: Mutex::new(HashMap::new()),
        })
    }

    /// Mint a token, register its responder, and listen for the completion
    /// envelope on the token's topic.
    pub fn issue(self: &Arc<Self>) -> (String, oneshot::Receiver<CallOutcome>) {
        let token = Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        self.ops.lock().insert(token.clone(), tx);
        // Subscribe before the caller submits the fragment so the completion
        // cannot slip past the listener.
        let mut sub = self.bus.subscribe(&token);
        let registry = Arc::clone(self);
        let waited = token.clone();
        tokio::spawn(async move {
            loop {
                match sub.recv().await {
                    Ok(msg) => {
                        registry.resolve(&waited, parse_reply(msg.payload));
                        break;
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => {
                        // Bus shut down: drop the responder so the caller
                        // observes cancellation instead of pending forever.
                        registry.abandon(&waited);
                        break;
                    }
                }
            }
        });
        (token, rx)
    }

    /// Resolve a token at most once; completions for unknown or already
    /// resolved tokens are ignored.
    pub fn resolve(&self, token: &str, outcome: CallOutcome) {
        let Some(tx) = self.ops.lock().remove(token) else {
            debug!(token, "completion for unknown token ignored");
            return;
        };
        let _ = tx.send(outcome);
    }

    fn abandon(&self, token: &str) {
        self.ops.lock().remove(token);
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.ops.lock().len()
    }
}

fn parse_reply(payload: Value) -> CallOutcome {
    match payload {
        Value::Object(mut map) => match map.remove("err") {
            Some(err) if !err.is_null() => Err(err),
            _ => Ok(map.remove("res").unwrap_or(Value::Null)),
        },
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eval_bus::LocalEvalBus;
    use serde_json::json;

    #[tokio::test]
    async fn completion_resolves_the_pending_call() {
        let bus = Arc::new(LocalEvalBus::new());
        let pending = PendingOps::new(bus.clone());
        let (token, rx) = pending.issue();
        bus.publish(&token, json!({ "res": { "type": "offer", "sdp": "v=0" } }))
            .expect("publish ok");
        let outcome = rx.await.expect("responder kept");
        assert_eq!(outcome, Ok(json!({ "type": "offer", "sdp": "v=0" })));
        assert_eq!(pending.in_flight(), 0);
    }

    #[tokio::test]
    async fn remote_error_rejects_the_pending_call() {
        let bus = Arc::new(LocalEvalBus::new());
        let pending = PendingOps::new(bus.clone());
        let (token, rx) = pending.issue();
        bus.publish(&token, json!({ "err": "InvalidStateError" }))
            .expect("publish ok");
        assert_eq!(rx.await.expect("responder kept"), Err(json!("InvalidStateError")));
    }

    #[tokio::test]
    async fn token_resolves_at_most_once() {
        let bus = Arc::new(LocalEvalBus::new());
        let pending = PendingOps::new(bus.clone());
        let (token, rx) = pending.issue();
        pending.resolve(&token, Ok(json!(1)));
        pending.resolve(&token, Ok(json!(2)));
        assert_eq!(rx.await.expect("responder kept"), Ok(json!(1)));
    }

    #[tokio::test]
    async fn unknown_token_is_ignored() {
        let bus = Arc::new(LocalEvalBus::new());
        let pending = PendingOps::new(bus.clone());
        pending.resolve("no-such-token", Ok(json!(null)));
        assert_eq!(pending.in_flight(), 0);
    }

    #[tokio::test]
    async fn tokens_are_unique() {
        let bus = Arc::new(LocalEvalBus::new());
        let pending = PendingOps::new(bus.clone());
        let (a, _rx_a) = pending.issue();
        let (b, _rx_b) = pending.issue();
        assert_ne!(a, b);
        assert_eq!(pending.in_flight(), 2);
    }

    #[tokio::test]
    async fn bus_shutdown_cancels_instead_of_hanging() {
        let bus = Arc::new(LocalEvalBus::new());
        let pending = PendingOps::new(bus.clone());
        let (_token, rx) = pending.issue();
        tokio::task::yield_now().await;
        bus.close();
        assert!(rx.await.is_err());
    }
}
