//! Local proxy for WebRTC peer connections whose protocol implementation
//! runs inside a remote, sandboxed execution host.
//!
//! Every operation injects a code fragment through an [`EvalBus`] and is
//! resolved later by a correlation-tagged completion message; unsolicited
//! remote events stream back per connection and drive the mirrored state.
//!
//! ```no_run
//! use std::sync::Arc;
//! use eval_bus::LocalEvalBus;
//! use rtc_remote::{PeerConfig, Rtc};
//!
//! # async fn demo() -> Result<(), rtc_remote::RtcError> {
//! let bus = Arc::new(LocalEvalBus::new());
//! let rtc = Rtc::new(bus);
//! let pc = rtc.peer_connection(PeerConfig::default())?;
//! let offer = pc.create_offer(None).await?;
//! # let _ = offer;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use eval_bus::{BusError, EvalBus};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

pub mod config;
pub mod data_channel;
pub mod event;
pub mod pending;
pub mod peer_connection;
pub mod stats;

pub use config::{
    DataChannelConfig, IceCandidate, IceServer, PeerConfig, SdpType, SessionDescription,
};
pub use data_channel::DataChannel;
pub use event::{EventKind, IceConnectionState, IceGatheringState, PeerEvent, SignalingState};
pub use peer_connection::PeerConnection;
pub use stats::StatsReport;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RtcError {
    /// The owning eval channel has begun or completed shutdown.
    #[error("cannot create peer connection, the eval channel is closed")]
    ChannelClosed,
    /// A submitted fragment itself failed in the remote environment. Not
    /// tied to any pending operation.
    #[error("remote fragment rejected: {0}")]
    Injection(String),
    /// The remote operation completed with an error.
    #[error("remote operation failed: {0}")]
    Remote(Value),
    /// A remote payload did not match the expected shape.
    #[error("unexpected remote payload: {0}")]
    Codec(String),
    /// The eval channel shut down while the operation was pending.
    #[error("operation canceled, the eval channel shut down")]
    Canceled,
}

/// Entry handle: owns the bus, hands out peer connections with strictly
/// increasing identifiers, and carries injection failures that cannot be
/// attributed to a single connection.
pub struct Rtc {
    bus: Arc<dyn EvalBus>,
    next_connection: AtomicU64,
    errors: broadcast::Sender<RtcError>,
}

impl Rtc {
    pub fn new(bus: Arc<dyn EvalBus>) -> Self {
        let (errors, _) = broadcast::channel(16);
        spawn_eval(bus.clone(), errors.clone(), "window.conns = {}".to_string());
        Self {
            bus,
            next_connection: AtomicU64::new(0),
            errors,
        }
    }

    /// Construct a peer connection proxy. Fails synchronously, before any
    /// remote interaction, once the bus is shutting down; this is the only
    /// synchronous failure on the proxy surface.
    pub fn peer_connection(&self, config: PeerConfig) -> Result<PeerConnection, RtcError> {
        if self.bus.is_closing() {
            return Err(RtcError::ChannelClosed);
        }
        let id = to_base36(self.next_connection.fetch_add(1, Ordering::SeqCst));
        let config_json =
            serde_json::to_string(&config).map_err(|err| RtcError::Codec(err.to_string()))?;
        Ok(PeerConnection::new(self.bus.clone(), id, config_json))
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<RtcError> {
        self.errors.subscribe()
    }

    /// Shut the remote host down. In-flight operations are not cancelled by
    /// the remote side; their local responders resolve with
    /// [`RtcError::Canceled`] once the bus drops its subscriptions.
    pub fn close(&self) {
        self.bus.close();
    }
}

/// Submit a fragment without waiting for anything beyond the injection
/// acknowledgment; a failed ack is broadcast on the given error stream.
pub(crate) fn spawn_eval(
    bus: Arc<dyn EvalBus>,
    errors: broadcast::Sender<RtcError>,
    code: String,
) {
    tokio::spawn(async move {
        if let Err(err) = bus.eval(&code).await {
            warn!(error = %err, "remote eval failed");
            let mapped = match err {
                BusError::Closed => RtcError::ChannelClosed,
                BusError::Eval(message) => RtcError::Injection(message),
            };
            let _ = errors.send(mapped);
        }
    });
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(DIGITS[(value % 36) as usize] as char);
        value /= 36;
    }
    digits.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base36_encoding() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(10), "a");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(36 * 36 + 1), "101");
    }
}
