//! Local mirror of a remote data channel.
//!
//! The remote side queues inbound messages from the moment the remote object
//! exists; forwarding onto the channel's delivery topic is only switched on
//! once the local pump has subscribed, so nothing can be published into the
//! void. Locally, messages that arrive before a listener is attached are
//! buffered and replayed in arrival order.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use eval_bus::EvalBus;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::event::ChannelInfo;
use crate::{RtcError, spawn_eval};

pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

const FORWARD_FRAGMENT: &str = r#"(function () {
  var dc = conns["__CONN__"].dataChannels[__DC__]
  if (!dc) return
  var topic = "__TOPIC__"
  if (dc.msgQueue) {
    dc.msgQueue.forEach(function (m) { send(topic, { data: m.data }) })
    dc.msgQueue = null
  }
  dc.onmessage = function (m) { send(topic, { data: m.data }) }
})()"#;

const SEND_FRAGMENT: &str = r#"(function () {
  var dc = conns["__CONN__"].dataChannels[__DC__]
  if (dc) dc.send(__MSG__)
})()"#;

const CLOSE_FRAGMENT: &str = r#"(function () {
  var dc = conns["__CONN__"].dataChannels[__DC__]
  if (dc && dc.readyState !== 'closed') dc.close()
})()"#;

pub(crate) fn message_topic(connection_id: &str, channel_id: u16) -> String {
    format!("dc:{connection_id}:{channel_id}")
}

struct Delivery {
    queue: VecDeque<Value>,
    listener: Option<MessageHandler>,
}

pub struct DataChannel {
    connection_id: String,
    id: u16,
    label: String,
    properties: HashMap<String, Value>,
    bus: Arc<dyn EvalBus>,
    errors: broadcast::Sender<RtcError>,
    delivery: Arc<Mutex<Delivery>>,
    wake: Arc<Notify>,
    pump: JoinHandle<()>,
}

impl DataChannel {
    /// Build the local mirror from the remote channel's mirrored properties,
    /// subscribe its delivery topic, then tell the remote side to flush its
    /// queue and forward directly.
    pub(crate) fn attach(
        bus: Arc<dyn EvalBus>,
        errors: broadcast::Sender<RtcError>,
        connection_id: &str,
        info: ChannelInfo,
    ) -> Arc<Self> {
        let topic = message_topic(connection_id, info.id);
        let delivery = Arc::new(Mutex::new(Delivery {
            queue: VecDeque::new(),
            listener: None,
        }));
        let wake = Arc::new(Notify::new());
        let pump = spawn_pump(
            bus.subscribe(&topic),
            delivery.clone(),
            wake.clone(),
            topic.clone(),
        );
        spawn_eval(
            bus.clone(),
            errors.clone(),
            FORWARD_FRAGMENT
                .replace("__CONN__", connection_id)
                .replace("__DC__", &info.id.to_string())
                .replace("__TOPIC__", &topic),
        );
        Arc::new(Self {
            connection_id: connection_id.to_string(),
            id: info.id,
            label: info.label,
            properties: info.properties,
            bus,
            errors,
            delivery,
            wake,
            pump,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Remote property mirrored at channel construction.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Attach the message listener. Messages buffered before attachment are
    /// replayed first, in arrival order; later messages follow on the same
    /// pump task. The handler is called with no channel lock held, so it may
    /// itself re-register a listener.
    pub fn on_message(&self, handler: impl Fn(Value) + Send + Sync + 'static) {
        self.delivery.lock().listener = Some(Arc::new(handler));
        self.wake.notify_one();
    }

    /// Fire-and-forget send; injection failures surface on the owning
    /// connection's error stream.
    pub fn send(&self, message: Value) {
        let encoded = match serde_json::to_string(&message) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(channel = self.id, error = %err, "message encoding failed");
                return;
            }
        };
        spawn_eval(
            self.bus.clone(),
            self.errors.clone(),
            SEND_FRAGMENT
                .replace("__CONN__", &self.connection_id)
                .replace("__DC__", &self.id.to_string())
                .replace("__MSG__", &encoded),
        );
    }

    pub fn close(&self) {
        spawn_eval(
            self.bus.clone(),
            self.errors.clone(),
            CLOSE_FRAGMENT
                .replace("__CONN__", &self.connection_id)
                .replace("__DC__", &self.id.to_string()),
        );
    }
}

impl Drop for DataChannel {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("connection_id", &self.connection_id)
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

/// Pop one deliverable message, cloning the listener so the lock is released
/// before the handler runs.
fn next_delivery(delivery: &Mutex<Delivery>) -> Option<(MessageHandler, Value)> {
    let mut delivery = delivery.lock();
    let handler = delivery.listener.clone()?;
    let data = delivery.queue.pop_front()?;
    Some((handler, data))
}

fn spawn_pump(
    mut sub: broadcast::Receiver<eval_bus::BusMessage>,
    delivery: Arc<Mutex<Delivery>>,
    wake: Arc<Notify>,
    topic: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            // The queue is the single ordering structure; every message goes
            // through it and only this task pops, so replay cannot interleave
            // with direct delivery.
            while let Some((handler, data)) = next_delivery(&delivery) {
                handler(data);
            }
            tokio::select! {
                _ = wake.notified() => {}
                msg = sub.recv() => match msg {
                    Ok(msg) => {
                        let data = match msg.payload {
                            Value::Object(mut map) => map.remove("data").unwrap_or(Value::Null),
                            other => other,
                        };
                        delivery.lock().queue.push_back(data);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "data channel pump lagged");
                    }
                    Err(RecvError::Closed) => {
                        while let Some((handler, data)) = next_delivery(&delivery) {
                            handler(data);
                        }
                        break;
                    }
                },
            }
        }
    })
}
