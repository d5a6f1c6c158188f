//! Boundary to the sandboxed execution host: code fragments go out through
//! [`EvalBus::eval`], asynchronous notifications come back as topic-tagged
//! JSON envelopes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// One inbound notification from the remote host.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Value,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    #[error("eval channel closed")]
    Closed,
    #[error("remote fragment failed: {0}")]
    Eval(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Async channel into the remote execution environment.
///
/// The `eval` acknowledgment reports only whether the fragment itself was
/// accepted and executed; anything the fragment schedules reports back later
/// through the message stream under whatever topic the fragment chose.
#[async_trait]
pub trait EvalBus: Send + Sync {
    async fn eval(&self, code: &str) -> BusResult<()>;
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    fn is_closing(&self) -> bool;
    fn close(&self);
}

/// In-memory bus for tests and embedders that fake the remote host.
///
/// Evaluated fragments are recorded and handed to [`LocalEvalBus::next_eval`]
/// in submission order; the harness plays the remote side by publishing
/// envelopes back onto topics.
pub struct LocalEvalBus {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
    eval_log: parking_lot::Mutex<Vec<String>>,
    eval_tx: mpsc::UnboundedSender<String>,
    eval_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    eval_error: parking_lot::Mutex<Option<String>>,
    closing: AtomicBool,
}

impl Default for LocalEvalBus {
    fn default() -> Self {
        let (eval_tx, eval_rx) = mpsc::unbounded_channel();
        Self {
            topics: parking_lot::RwLock::new(HashMap::new()),
            eval_log: parking_lot::Mutex::new(Vec::new()),
            eval_tx,
            eval_rx: tokio::sync::Mutex::new(eval_rx),
            eval_error: parking_lot::Mutex::new(None),
            closing: AtomicBool::new(false),
        }
    }
}

impl LocalEvalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    /// Inject an inbound envelope, as the remote host would.
    pub fn publish(&self, topic: &str, payload: Value) -> BusResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let sender = self.sender_for(topic);
        sender
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .map(|_| ())
            .map_err(|_| BusError::Closed)
    }

    /// Next evaluated fragment, in submission order.
    pub async fn next_eval(&self) -> Option<String> {
        self.eval_rx.lock().await.recv().await
    }

    /// Every fragment evaluated so far.
    pub fn evals(&self) -> Vec<String> {
        self.eval_log.lock().clone()
    }

    /// Make subsequent `eval` calls fail with the given message.
    pub fn set_eval_error(&self, message: Option<&str>) {
        *self.eval_error.lock() = message.map(str::to_string);
    }
}

#[async_trait]
impl EvalBus for LocalEvalBus {
    async fn eval(&self, code: &str) -> BusResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.eval_log.lock().push(code.to_string());
        let _ = self.eval_tx.send(code.to_string());
        if let Some(message) = self.eval_error.lock().clone() {
            return Err(BusError::Eval(message));
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        // Dropping the senders wakes every subscriber with a closed error.
        self.topics.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalEvalBus::new();
        let mut sub = bus.subscribe("pc:0");
        bus.publish("pc:0", json!({ "type": "negotiationneeded" }))
            .expect("publish ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "pc:0");
        assert_eq!(msg.payload, json!({ "type": "negotiationneeded" }));
    }

    #[tokio::test]
    async fn eval_is_recorded_in_order() {
        let bus = LocalEvalBus::new();
        bus.eval("first()").await.expect("eval ok");
        bus.eval("second()").await.expect("eval ok");
        assert_eq!(bus.next_eval().await.as_deref(), Some("first()"));
        assert_eq!(bus.next_eval().await.as_deref(), Some("second()"));
        assert_eq!(bus.evals(), vec!["first()", "second()"]);
    }

    #[tokio::test]
    async fn eval_error_is_surfaced_in_ack() {
        let bus = LocalEvalBus::new();
        bus.set_eval_error(Some("ReferenceError: pc is not defined"));
        let err = bus.eval("pc.close()").await.expect_err("eval fails");
        assert_eq!(
            err,
            BusError::Eval("ReferenceError: pc is not defined".into())
        );
    }

    #[tokio::test]
    async fn close_rejects_eval_and_wakes_subscribers() {
        let bus = LocalEvalBus::new();
        let mut sub = bus.subscribe("pc:0");
        bus.close();
        assert!(bus.is_closing());
        assert_eq!(bus.eval("noop()").await, Err(BusError::Closed));
        assert!(sub.recv().await.is_err());
    }
}
