//! The peer connection proxy. Every operation builds a code fragment around
//! a freshly minted correlation token and submits it through the bus; the
//! mirrored state only changes when the remote side reports back through the
//! `pc:<id>` event stream, with the documented exceptions of offer/answer
//! memoization and the optimistic local-description write.

use std::collections::HashMap;
use std::sync::Arc;

use eval_bus::EvalBus;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{DataChannelConfig, IceCandidate, SessionDescription};
use crate::data_channel::DataChannel;
use crate::event::{
    ChannelInfo, EventKind, IceConnectionState, IceGatheringState, PeerEvent, RemoteEvent,
    SignalingState,
};
use crate::pending::PendingOps;
use crate::{RtcError, spawn_eval};

pub type EventHandler = Arc<dyn Fn(PeerEvent) + Send + Sync>;

const BOOTSTRAP_FRAGMENT: &str = r#"(function () {
  var id = "__ID__"
  var topic = 'pc:' + id
  var pc = conns[id] = new RTCPeerConnection(__CONFIG__)
  pc.dataChannels = {}
  pc.onaddstream = function () { send(topic, { type: 'addstream' }) }
  pc.ondatachannel = function (e) {
    pc.dataChannels[e.channel.id] = e.channel
    var channel = {}
    for (var key in e.channel) {
      if (typeof e.channel[key] === 'function' || e.channel[key] == null) continue
      channel[key] = e.channel[key]
    }
    e.channel.msgQueue = []
    e.channel.onmessage = function (m) { e.channel.msgQueue.push(m) }
    send(topic, { type: 'datachannel', channel: channel })
  }
  pc.onicecandidate = function (e) {
    var event = {}
    if (e.candidate) {
      event.candidate = {
        candidate: e.candidate.candidate,
        sdpMid: e.candidate.sdpMid,
        sdpMLineIndex: e.candidate.sdpMLineIndex
      }
    }
    var offer
    function report () {
      send(topic, {
        type: 'icecandidate',
        event: event,
        iceGatheringState: pc.iceGatheringState,
        offer: offer || null
      })
    }
    pc.createOffer(
      function (o) { offer = o.toJSON ? o.toJSON() : o; report() },
      function () { offer = null; report() })
  }
  pc.oniceconnectionstatechange = function () {
    send(topic, { type: 'iceconnectionstatechange', iceConnectionState: pc.iceConnectionState })
  }
  pc.onidentityresult = function (e) {
    send(topic, { type: 'identityresult', event: { assertion: e.assertion } })
  }
  pc.onidpassertionerror = function (e) {
    send(topic, { type: 'idpassertionerror', event: { idp: e.idp, loginUrl: e.loginUrl, protocol: e.protocol } })
  }
  pc.onidpvalidationerror = function (e) {
    send(topic, { type: 'idpvalidationerror', event: { idp: e.idp, loginUrl: e.loginUrl, protocol: e.protocol } })
  }
  pc.onnegotiationneeded = function () { send(topic, { type: 'negotiationneeded' }) }
  pc.onremovestream = function (e) { send(topic, { type: 'removestream', event: { id: e.stream.id } }) }
  pc.onsignalingstatechange = function () {
    send(topic, { type: 'signalingstatechange', signalingState: pc.signalingState })
  }
})()"#;

const CALL_FRAGMENT: &str = r#"(function () {
  var id = "__ID__"
  var token = "__TOKEN__"
  var pc = conns[id]
  var onSuccess = function (res) { send(token, { res: res && res.toJSON ? res.toJSON() : res }) }
  var onFailure = function (err) { send(token, { err: String(err) }) }
  __BODY__
})()"#;

const CLOSE_FRAGMENT: &str = r#"(function () {
  var pc = conns["__ID__"]
  if (pc && pc.signalingState !== 'closed') pc.close()
})()"#;

const CREATE_CHANNEL_BODY: &str = r#"var dc = pc.createDataChannel(__LABEL__, __OPTS__)
  pc.dataChannels[dc.id] = dc
  dc.msgQueue = []
  dc.onmessage = function (m) { dc.msgQueue.push(m) }
  var channel = {}
  for (var key in dc) {
    if (typeof dc[key] === 'function' || dc[key] == null) continue
    channel[key] = dc[key]
  }
  onSuccess(channel)"#;

const STATS_BODY: &str = r#"pc.getStats(function (res) {
    res = res.result()
    var output = res.map(function (item) {
      var row = { id: item.id, timestamp: item.timestamp, type: item.type, stats: {} }
      item.names().forEach(function (name) { row.stats[name] = item.stat(name) })
      return row
    })
    onSuccess(output)
  })"#;

struct ConnectionState {
    signaling_state: SignalingState,
    ice_connection_state: IceConnectionState,
    ice_gathering_state: IceGatheringState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    cached_offer: Option<Value>,
    cached_answer: Option<Value>,
    data_channels: HashMap<u16, Arc<DataChannel>>,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            signaling_state: SignalingState::Stable,
            ice_connection_state: IceConnectionState::New,
            ice_gathering_state: IceGatheringState::New,
            local_description: None,
            remote_description: None,
            cached_offer: None,
            cached_answer: None,
            data_channels: HashMap::new(),
        }
    }
}

struct Shared {
    id: String,
    bus: Arc<dyn EvalBus>,
    state: Mutex<ConnectionState>,
    handlers: RwLock<HashMap<EventKind, EventHandler>>,
    errors: broadcast::Sender<RtcError>,
}

pub struct PeerConnection {
    shared: Arc<Shared>,
    pending: Arc<PendingOps>,
    router: JoinHandle<()>,
}

impl PeerConnection {
    pub(crate) fn new(bus: Arc<dyn EvalBus>, id: String, config_json: String) -> Self {
        let (errors, _) = broadcast::channel(16);
        let shared = Arc::new(Shared {
            id: id.clone(),
            bus: bus.clone(),
            state: Mutex::new(ConnectionState::new()),
            handlers: RwLock::new(HashMap::new()),
            errors,
        });
        let pending = PendingOps::new(bus.clone());
        // Router subscription must exist before the bootstrap fragment runs,
        // otherwise the first remote events would be lost.
        let router = spawn_router(shared.clone());
        spawn_eval(
            bus,
            shared.errors.clone(),
            BOOTSTRAP_FRAGMENT
                .replace("__ID__", &id)
                .replace("__CONFIG__", &config_json),
        );
        debug!(connection = %id, "peer connection created");
        Self {
            shared,
            pending,
            router,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.shared.state.lock().signaling_state
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.shared.state.lock().ice_connection_state
    }

    pub fn ice_gathering_state(&self) -> IceGatheringState {
        self.shared.state.lock().ice_gathering_state
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.shared.state.lock().local_description.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.shared.state.lock().remote_description.clone()
    }

    pub fn data_channel(&self, id: u16) -> Option<Arc<DataChannel>> {
        self.shared.state.lock().data_channels.get(&id).cloned()
    }

    /// Register the handler notified for the given event kind. The state
    /// mutation tied to a kind applies whether or not a handler exists.
    pub fn on_event(&self, kind: EventKind, handler: impl Fn(PeerEvent) + Send + Sync + 'static) {
        self.shared.handlers.write().insert(kind, Arc::new(handler));
    }

    /// Injection failures of fragments issued for this connection; these are
    /// independent of any pending operation.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<RtcError> {
        self.shared.errors.subscribe()
    }

    /// Memoized: once an offer has been produced it is returned without
    /// another remote round trip.
    pub async fn create_offer(
        &self,
        options: Option<Value>,
    ) -> Result<SessionDescription, RtcError> {
        if let Some(cached) = self.shared.state.lock().cached_offer.clone() {
            return decode_description(cached);
        }
        let args = format!("onSuccess, onFailure, {}", encode(&options)?);
        let offer = self.call_remote("createOffer", &args).await?;
        self.shared.state.lock().cached_offer = Some(offer.clone());
        decode_description(offer)
    }

    /// Memoized like [`PeerConnection::create_offer`].
    pub async fn create_answer(
        &self,
        options: Option<Value>,
    ) -> Result<SessionDescription, RtcError> {
        if let Some(cached) = self.shared.state.lock().cached_answer.clone() {
            return decode_description(cached);
        }
        let args = format!("onSuccess, onFailure, {}", encode(&options)?);
        let answer = self.call_remote("createAnswer", &args).await?;
        self.shared.state.lock().cached_answer = Some(answer.clone());
        decode_description(answer)
    }

    /// The local mirror records the description before the remote call is
    /// issued and keeps it even if the remote application later fails; only
    /// the returned result reflects the remote outcome.
    pub async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        self.shared.state.lock().local_description = Some(description.clone());
        let encoded = encode(&description)?;
        self.call_remote(
            "setLocalDescription",
            &format!("new RTCSessionDescription({encoded}), onSuccess, onFailure"),
        )
        .await?;
        Ok(())
    }

    /// Unlike the local side, the remote description is only recorded once
    /// the remote application succeeds.
    pub async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        let encoded = encode(&description)?;
        self.call_remote(
            "setRemoteDescription",
            &format!("new RTCSessionDescription({encoded}), onSuccess, onFailure"),
        )
        .await?;
        self.shared.state.lock().remote_description = Some(description);
        Ok(())
    }

    /// No local state changes: gathering progress only arrives through the
    /// `icecandidate` event path.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        let encoded = encode(&candidate)?;
        self.call_remote(
            "addIceCandidate",
            &format!("new RTCIceCandidate({encoded}), onSuccess, onFailure"),
        )
        .await?;
        Ok(())
    }

    /// Create an outbound data channel. The returned proxy is initialized
    /// from the remote acknowledgment and already registered with this
    /// connection.
    pub async fn create_data_channel(
        &self,
        label: &str,
        config: DataChannelConfig,
    ) -> Result<Arc<DataChannel>, RtcError> {
        let body = CREATE_CHANNEL_BODY
            .replace("__LABEL__", &encode(&label)?)
            .replace("__OPTS__", &encode(&config)?);
        let reply = self.eval_correlated(&body).await?;
        let info: ChannelInfo =
            serde_json::from_value(reply).map_err(|err| RtcError::Codec(err.to_string()))?;
        let channel = DataChannel::attach(
            self.shared.bus.clone(),
            self.shared.errors.clone(),
            &self.shared.id,
            info,
        );
        self.shared
            .state
            .lock()
            .data_channels
            .insert(channel.id(), channel.clone());
        Ok(channel)
    }

    pub async fn get_stats(&self) -> Result<Vec<crate::stats::StatsReport>, RtcError> {
        let reply = self.eval_correlated(STATS_BODY).await?;
        serde_json::from_value(reply).map_err(|err| RtcError::Codec(err.to_string()))
    }

    /// Ask the remote connection to close. Skipped entirely when the
    /// mirrored signaling state is already closed. Does not wait for a
    /// completion and does not cancel in-flight operations.
    pub fn close(&self) {
        if self.shared.state.lock().signaling_state == SignalingState::Closed {
            debug!(connection = %self.shared.id, "close skipped, already closed");
            return;
        }
        spawn_eval(
            self.shared.bus.clone(),
            self.shared.errors.clone(),
            CLOSE_FRAGMENT.replace("__ID__", &self.shared.id),
        );
    }

    async fn call_remote(&self, method: &str, args: &str) -> Result<Value, RtcError> {
        self.eval_correlated(&format!("pc.{method}({args})")).await
    }

    async fn eval_correlated(&self, body: &str) -> Result<Value, RtcError> {
        let (token, rx) = self.pending.issue();
        debug!(connection = %self.shared.id, token = %token, "remote call issued");
        spawn_eval(
            self.shared.bus.clone(),
            self.shared.errors.clone(),
            CALL_FRAGMENT
                .replace("__ID__", &self.shared.id)
                .replace("__TOKEN__", &token)
                .replace("__BODY__", body),
        );
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(RtcError::Remote(err)),
            Err(_) => Err(RtcError::Canceled),
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.router.abort();
    }
}

fn spawn_router(shared: Arc<Shared>) -> JoinHandle<()> {
    let mut sub = shared.bus.subscribe(&format!("pc:{}", shared.id));
    tokio::spawn(async move {
        loop {
            match sub.recv().await {
                Ok(msg) => route(&shared, msg.payload),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(connection = %shared.id, skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Apply the state mutation for one inbound event, then notify the
/// registered handler, in that fixed order.
fn route(shared: &Arc<Shared>, payload: Value) {
    let event: RemoteEvent = match serde_json::from_value(payload) {
        Ok(event) => event,
        Err(err) => {
            warn!(connection = %shared.id, error = %err, "undecodable event dropped");
            return;
        }
    };
    debug!(connection = %shared.id, kind = %event.kind(), "event routed");
    let routed = match event {
        RemoteEvent::AddStream => PeerEvent::AddStream,
        RemoteEvent::DataChannel { channel } => {
            let channel = DataChannel::attach(
                shared.bus.clone(),
                shared.errors.clone(),
                &shared.id,
                channel,
            );
            shared
                .state
                .lock()
                .data_channels
                .insert(channel.id(), channel.clone());
            PeerEvent::DataChannel(channel)
        }
        RemoteEvent::IceCandidate {
            event,
            ice_gathering_state,
            offer,
        } => {
            let mut state = shared.state.lock();
            state.ice_gathering_state = ice_gathering_state;
            if let Some(offer) = offer {
                merge_into(state.cached_offer.get_or_insert_with(|| json!({})), offer);
            }
            drop(state);
            PeerEvent::IceCandidate(event.candidate)
        }
        RemoteEvent::IceConnectionStateChange {
            ice_connection_state,
        } => {
            shared.state.lock().ice_connection_state = ice_connection_state;
            PeerEvent::IceConnectionStateChange(ice_connection_state)
        }
        RemoteEvent::IdentityResult { event } => PeerEvent::IdentityResult(event),
        RemoteEvent::IdpAssertionError { event } => PeerEvent::IdpAssertionError(event),
        RemoteEvent::IdpValidationError { event } => PeerEvent::IdpValidationError(event),
        RemoteEvent::NegotiationNeeded => PeerEvent::NegotiationNeeded,
        RemoteEvent::RemoveStream { event } => PeerEvent::RemoveStream(event),
        RemoteEvent::SignalingStateChange { signaling_state } => {
            shared.state.lock().signaling_state = signaling_state;
            PeerEvent::SignalingStateChange(signaling_state)
        }
    };
    // Clone the handler out so the lock is released before it runs; a handler
    // is free to call `on_event` itself.
    let handler = shared.handlers.read().get(&routed.kind()).cloned();
    if let Some(handler) = handler {
        handler(routed);
    }
}

/// Shallow key merge, matching `Object.assign` on the remote side.
fn merge_into(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(target), Value::Object(incoming)) => {
            for (key, value) in incoming {
                target.insert(key, value);
            }
        }
        (target, incoming) => *target = incoming,
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, RtcError> {
    serde_json::to_string(value).map_err(|err| RtcError::Codec(err.to_string()))
}

fn decode_description(value: Value) -> Result<SessionDescription, RtcError> {
    serde_json::from_value(value).map_err(|err| RtcError::Codec(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_follows_object_assign() {
        let mut target = json!({ "type": "offer", "sdp": "v=0" });
        merge_into(&mut target, json!({ "sdp": "v=1" }));
        assert_eq!(target, json!({ "type": "offer", "sdp": "v=1" }));
    }

    #[test]
    fn merge_replaces_non_objects() {
        let mut target = json!({});
        merge_into(&mut target, json!("opaque"));
        assert_eq!(target, json!("opaque"));
    }
}
