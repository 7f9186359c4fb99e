//! Delivery transports for the Beacon agent.
//!
//! Two interchangeable variants implement the `Transport` contract: a
//! persistent MQTT pub/sub link with QoS-acknowledged publishes, and a
//! batched HTTP push. Inbound command frames surface on a broadcast event
//! channel; acknowledgement reconciliation goes straight into the outbox
//! store from the network task.

mod http;
mod mqtt;
mod wire;

pub use http::{HttpConfig, HttpTransport, HTTP_QUEUE_MAX};
pub use mqtt::{MqttConfig, MqttTransport, TlsFiles};
pub use wire::{
    command_topic, encode_sample_frame, notification_body, response_topic, rfc3339_micros,
    sample_topic, single_notification_body, status_topic, NotificationEntry,
};

use async_trait::async_trait;
use beacon_store::Sample;
use thiserror::Error;
use tokio::sync::broadcast;

/// Transport error type.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The link is down; the next cycle retries
    #[error("Not connected")]
    NotConnected,

    /// Publish failed
    #[error("Publish failed: {0}")]
    Publish(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint rejected the delivery
    #[error("Delivery rejected: {0}")]
    Rejected(String),

    /// Store error during reconciliation
    #[error("Store error: {0}")]
    Store(#[from] beacon_store::StoreError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (TLS material, spooling)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using TransportError.
pub type TransportResult<T> = Result<T, TransportError>;

/// Which delivery model a transport implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Per-sample acknowledged publishes over the pub/sub link.
    PubSub,
    /// Batched HTTP posts correlated by explicit identifiers.
    HttpBatch,
}

/// Events emitted by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The link came up.
    Connected,
    /// The link went down.
    Disconnected(Option<String>),
    /// A raw command frame arrived from the cloud.
    Command(Vec<u8>),
}

/// Common contract over the two delivery variants.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn connected(&self) -> bool;

    /// Deliver one sample. The pub/sub variant claims the row against its
    /// message id before the call returns.
    async fn send_sample(&self, sample: &Sample) -> TransportResult<()>;

    /// Deliver a batch of already-claimed samples in one exchange.
    async fn send_batch(&self, samples: &[Sample]) -> TransportResult<()>;

    /// Publish a command response correlated by the originating request id.
    async fn send_response(&self, request_id: u64, payload: &[u8]) -> TransportResult<()>;

    /// Subscribe to transport events (inbound commands, connectivity).
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
