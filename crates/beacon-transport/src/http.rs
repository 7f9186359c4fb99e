//! Batched HTTP push transport.
//!
//! Producer submissions buffer in a bounded in-memory queue in front of
//! the durable store; crossing half the queue capacity flushes the whole
//! queue as one notification POST. Overflow spills straight to the store
//! instead of blocking, decoupling producers from transport availability.
//! Successful posts are followed by a `pending_commands` poll.

use crate::wire::{notification_body, NotificationEntry};
use crate::{Transport, TransportError, TransportEvent, TransportKind, TransportResult};
use async_trait::async_trait;
use beacon_identity::IdentityManager;
use beacon_store::{Column, ColumnValue, Sample, Store, MIN_VALID_TIMESTAMP_MS};
use chrono::Utc;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Bounded fast-path queue capacity.
pub const HTTP_QUEUE_MAX: usize = 100;

/// Queue length beyond which the whole queue flushes as one batch.
const FLUSH_THRESHOLD: usize = HTTP_QUEUE_MAX / 2;

/// HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub device_id: String,
    /// Base URL of the delivery API, e.g. `https://hive.example.net`.
    pub api_base: String,
    pub timeout_secs: u64,
}

impl HttpConfig {
    pub fn new(device_id: &str, api_base: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            timeout_secs: 30,
        }
    }
}

/// A queued notification entry; `claim` carries the message id when the
/// entry is backed by a claimed durable row.
#[derive(Debug, Clone)]
struct QueuedEntry {
    claim: Option<i64>,
    entry: NotificationEntry,
}

#[derive(Debug, Deserialize)]
struct PendingCommands {
    #[serde(default)]
    pending_commands: Vec<PendingCommand>,
}

#[derive(Debug, Deserialize)]
struct PendingCommand {
    command: String,
    #[serde(default)]
    parameters: Option<serde_json::Value>,
}

/// Batched HTTP push transport.
pub struct HttpTransport {
    config: HttpConfig,
    client: reqwest::Client,
    store: Arc<Store>,
    identity: Arc<IdentityManager>,
    queue: Mutex<Vec<QueuedEntry>>,
    reachable: AtomicBool,
    event_tx: broadcast::Sender<TransportEvent>,
}

impl HttpTransport {
    pub fn new(config: HttpConfig, store: Arc<Store>, identity: Arc<IdentityManager>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");
        let (event_tx, _) = broadcast::channel(16);

        Self {
            config,
            client,
            store,
            identity,
            queue: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            event_tx,
        }
    }

    /// Producer fast path: buffer a sample for the next batch.
    ///
    /// A full queue routes the sample to the durable store instead of
    /// blocking; crossing half capacity triggers a flush of the whole
    /// queue. Flush failures keep the queue for the next trigger.
    pub async fn submit(&self, stream: &str, timestamp_ms: i64, value: f64) -> TransportResult<()> {
        let timestamp_ms = if timestamp_ms < MIN_VALID_TIMESTAMP_MS {
            Utc::now().timestamp_millis()
        } else {
            timestamp_ms
        };

        let mut queue = self.queue.lock().await;

        if queue.len() >= HTTP_QUEUE_MAX {
            debug!(stream, "Queue full, spilling to store");
            self.store.insert_sample(stream, timestamp_ms, value)?;
            return Ok(());
        }

        queue.push(QueuedEntry {
            claim: None,
            entry: NotificationEntry::new(stream, timestamp_ms, value),
        });

        if queue.len() > FLUSH_THRESHOLD {
            if let Err(e) = self.flush_locked(&mut queue).await {
                warn!(error = %e, queued = queue.len(), "Flush failed, queue retained");
            }
        }

        Ok(())
    }

    /// Number of entries waiting in the fast-path queue.
    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// POST the queue as one batch; on success confirm durable-backed
    /// entries and refill from the store so draining continues.
    async fn flush_locked(
        &self,
        queue: &mut MutexGuard<'_, Vec<QueuedEntry>>,
    ) -> TransportResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let entries: Vec<NotificationEntry> = queue.iter().map(|q| q.entry.clone()).collect();
        self.post_notification(&notification_body(&entries)).await?;

        info!(delivered = entries.len(), "Batch delivered");

        // Confirm durable-backed entries; direct submissions have nothing
        // to reconcile.
        let mut claims: Vec<i64> = queue.iter().filter_map(|q| q.claim).collect();
        claims.sort_unstable();
        claims.dedup();
        for message_id in claims {
            self.store.confirm_sent(message_id, false)?;
        }
        queue.clear();

        // Refill with the next claimed batch of unsent durable samples.
        let message_id = self.store.next_message_id();
        let refill = self.store.claim_unsent(FLUSH_THRESHOLD, message_id)?;
        if !refill.is_empty() {
            debug!(count = refill.len(), message_id, "Refilled queue from store");
        }
        queue.extend(refill.iter().map(|sample| QueuedEntry {
            claim: Some(message_id),
            entry: NotificationEntry::from(sample),
        }));

        Ok(())
    }

    async fn post_notification(&self, body: &serde_json::Value) -> TransportResult<()> {
        let url = format!(
            "{}/device/{}/notification",
            self.config.api_base, self.config.device_id
        );

        let mut request = self.client.post(&url).json(body);
        if let Some(token) = self.identity.bearer_token() {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                self.reachable.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.reachable.store(false, Ordering::SeqCst);
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected(format!("HTTP {status}: {body}")));
        }

        self.reachable.store(true, Ordering::SeqCst);

        // The response body may carry commands queued while we were away.
        match response.text().await {
            Ok(text) if !text.is_empty() => self.handle_pending_commands(&text),
            _ => {}
        }

        Ok(())
    }

    /// Execute commands the endpoint piggybacks on a successful post.
    fn handle_pending_commands(&self, body: &str) {
        let parsed: PendingCommands = match serde_json::from_str(body) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "Response body is not a command payload");
                return;
            }
        };

        for command in parsed.pending_commands {
            match command.command.as_str() {
                "db_write" => self.command_db_write(command.parameters.as_ref()),
                "db_read" => self.command_db_read(command.parameters.as_ref()),
                other => error!(command = other, "Unknown pending command"),
            }
        }
    }

    fn command_db_write(&self, parameters: Option<&serde_json::Value>) {
        let Some(parameters) = parameters else {
            error!("db_write without parameters");
            return;
        };
        let Some(table) = parameters.get("table").and_then(|t| t.as_str()) else {
            error!("db_write missing table");
            return;
        };
        let Some(columns) = parameters.get("columns").and_then(|c| c.as_object()) else {
            error!("db_write missing columns");
            return;
        };

        let mut row = Vec::with_capacity(columns.len());
        for (name, value) in columns {
            let column_value = match value {
                serde_json::Value::Null => ColumnValue::Null,
                serde_json::Value::String(s) => ColumnValue::Text(s.clone()),
                serde_json::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        ColumnValue::Int64(i)
                    } else if let Some(f) = n.as_f64() {
                        ColumnValue::Double(f)
                    } else {
                        error!(column = %name, "Unrepresentable number in db_write");
                        return;
                    }
                }
                other => {
                    error!(column = %name, value = %other, "Unhandled value type in db_write");
                    return;
                }
            };
            row.push(Column::new(name, column_value));
        }

        match self.store.write_row(table, &row) {
            Ok(id) => debug!(table, id, "db_write applied"),
            Err(e) => error!(table, error = %e, "db_write failed"),
        }
    }

    fn command_db_read(&self, parameters: Option<&serde_json::Value>) {
        let Some(table) = parameters
            .and_then(|p| p.get("table"))
            .and_then(|t| t.as_str())
        else {
            error!("db_read missing table");
            return;
        };

        match self.store.row_ids(table) {
            Ok(ids) => debug!(table, rows = ids.len(), "db_read"),
            Err(e) => error!(table, error = %e, "db_read failed"),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::HttpBatch
    }

    fn connected(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn send_sample(&self, sample: &Sample) -> TransportResult<()> {
        let mut queue = self.queue.lock().await;

        if queue.len() >= HTTP_QUEUE_MAX {
            // Already durable; leave the row for a later cycle.
            return Err(TransportError::Rejected("queue full".to_string()));
        }

        queue.push(QueuedEntry {
            claim: sample.message_id,
            entry: NotificationEntry::from(sample),
        });

        if queue.len() > FLUSH_THRESHOLD {
            if let Err(e) = self.flush_locked(&mut queue).await {
                warn!(error = %e, queued = queue.len(), "Flush failed, queue retained");
            }
        }

        Ok(())
    }

    async fn send_batch(&self, samples: &[Sample]) -> TransportResult<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let entries: Vec<NotificationEntry> =
            samples.iter().map(NotificationEntry::from).collect();
        self.post_notification(&notification_body(&entries)).await
    }

    async fn send_response(&self, request_id: u64, _payload: &[u8]) -> TransportResult<()> {
        // No response channel over HTTP; commands arrive via polling and
        // are fire-and-forget.
        debug!(request_id, "Dropping command response (HTTP transport)");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }
}
