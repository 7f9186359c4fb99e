//! The periodic delivery dispatcher.
//!
//! One cycle per tick: certificate gate, stale-claim reclaim, then the
//! transport-specific drain. Every failure is logged and retried on the
//! next tick; nothing here terminates the loop.

use crate::{CommandHandler, DispatchResult};
use async_trait::async_trait;
use beacon_identity::{IdentityError, IdentityManager};
use beacon_store::Store;
use beacon_transport::{Transport, TransportEvent, TransportKind};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The certificate-expiry gate the dispatcher consults before sending.
#[async_trait]
pub trait IdentityGate: Send + Sync {
    fn is_valid(&self, now: DateTime<Utc>) -> bool;
    async fn renew(&self) -> Result<(), IdentityError>;
}

#[async_trait]
impl IdentityGate for IdentityManager {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        IdentityManager::is_valid(self, now)
    }

    async fn renew(&self) -> Result<(), IdentityError> {
        IdentityManager::renew(self).await
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Tick interval.
    pub interval: Duration,
    /// Samples claimed per HTTP batch cycle.
    pub batch_size: usize,
    /// Samples published per pub/sub cycle; kept small to bound the
    /// in-flight correlation bookkeeping.
    pub pubsub_batch: usize,
    /// How long an in-flight claim may stay unresolved before it is
    /// released for re-dispatch.
    pub claim_window: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 50,
            pubsub_batch: 1,
            claim_window: Duration::from_secs(60),
        }
    }
}

/// Periodic store→transport draining loop.
pub struct Dispatcher {
    store: Arc<Store>,
    identity: Arc<dyn IdentityGate>,
    transport: Arc<dyn Transport>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        identity: Arc<dyn IdentityGate>,
        transport: Arc<dyn Transport>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            identity,
            transport,
            config,
        }
    }

    /// Run cycles until cancellation.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = self.config.interval.as_millis() as u64, "Dispatcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.cycle().await {
                        warn!(error = %e, "Dispatch cycle failed, retrying next tick");
                    }
                }
            }
        }

        info!("Dispatcher stopped");
    }

    /// One dispatch cycle.
    pub async fn cycle(&self) -> DispatchResult<()> {
        // The identity gate comes first: no send attempt may use an
        // expired credential without a renewal try.
        if !self.identity.is_valid(Utc::now()) {
            info!("Credential expired or missing, renewing");
            if let Err(e) = self.identity.renew().await {
                // Non-fatal: keep operating with the old credential and
                // retry on the next cycle.
                warn!(error = %e, "Renewal failed, keeping previous credential");
            }
        }

        self.store.reclaim_stale(self.config.claim_window)?;

        match self.transport.kind() {
            TransportKind::HttpBatch => self.cycle_batch().await,
            TransportKind::PubSub => self.cycle_pubsub().await,
        }
    }

    /// Claim one batch, post it, reconcile.
    async fn cycle_batch(&self) -> DispatchResult<()> {
        let message_id = self.store.next_message_id();
        let batch = self.store.claim_unsent(self.config.batch_size, message_id)?;
        if batch.is_empty() {
            return Ok(());
        }

        match self.transport.send_batch(&batch).await {
            Ok(()) => {
                let confirmed = self.store.confirm_sent(message_id, false)?;
                debug!(message_id, confirmed, "Batch delivered");
                Ok(())
            }
            Err(e) => {
                self.store.release_claim(message_id)?;
                Err(e.into())
            }
        }
    }

    /// Publish eligible samples one at a time; the transport claims each
    /// row against its own message id before the publish returns.
    async fn cycle_pubsub(&self) -> DispatchResult<()> {
        if !self.transport.connected() {
            debug!("Link down, skipping cycle");
            return Ok(());
        }

        let samples = self.store.read_unsent(self.config.pubsub_batch)?;
        for sample in &samples {
            self.transport.send_sample(sample).await?;
        }
        Ok(())
    }
}

/// Feed inbound command frames to the handler and publish responses.
///
/// Runs next to the dispatcher until cancellation or until the transport's
/// event channel closes.
pub async fn run_command_loop(
    handler: Arc<CommandHandler>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
) {
    let mut events = transport.subscribe();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(TransportEvent::Command(raw)) => {
                    match handler.handle(&raw) {
                        Ok(Some(response)) => {
                            if let Err(e) = transport
                                .send_response(response.request_id, &response.body)
                                .await
                            {
                                warn!(
                                    request_id = response.request_id,
                                    error = %e,
                                    "Could not publish command response"
                                );
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "Dropped command frame"),
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Command events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    debug!("Command loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_store::Sample;
    use beacon_transport::{TransportError, TransportResult};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeIdentity {
        valid: AtomicBool,
        renewals: AtomicUsize,
        renewal_succeeds: bool,
    }

    impl FakeIdentity {
        fn valid() -> Arc<Self> {
            Arc::new(Self {
                valid: AtomicBool::new(true),
                renewals: AtomicUsize::new(0),
                renewal_succeeds: true,
            })
        }

        fn expired() -> Arc<Self> {
            Arc::new(Self {
                valid: AtomicBool::new(false),
                renewals: AtomicUsize::new(0),
                renewal_succeeds: true,
            })
        }

        fn expired_and_failing() -> Arc<Self> {
            Arc::new(Self {
                valid: AtomicBool::new(false),
                renewals: AtomicUsize::new(0),
                renewal_succeeds: false,
            })
        }
    }

    #[async_trait]
    impl IdentityGate for FakeIdentity {
        fn is_valid(&self, _now: DateTime<Utc>) -> bool {
            self.valid.load(Ordering::SeqCst)
        }

        async fn renew(&self) -> Result<(), IdentityError> {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            if self.renewal_succeeds {
                self.valid.store(true, Ordering::SeqCst);
                Ok(())
            } else {
                Err(IdentityError::Provisioning("HTTP 503".to_string()))
            }
        }
    }

    /// A transport that records what it is asked to deliver.
    struct FakeTransport {
        kind: TransportKind,
        fail: AtomicBool,
        store: Arc<Store>,
        batches: Mutex<Vec<Vec<Sample>>>,
        published: Mutex<Vec<Sample>>,
        next_mid: AtomicUsize,
    }

    impl FakeTransport {
        fn http(store: Arc<Store>) -> Arc<Self> {
            Arc::new(Self {
                kind: TransportKind::HttpBatch,
                fail: AtomicBool::new(false),
                store,
                batches: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                next_mid: AtomicUsize::new(42),
            })
        }

        fn pubsub(store: Arc<Store>) -> Arc<Self> {
            Arc::new(Self {
                kind: TransportKind::PubSub,
                fail: AtomicBool::new(false),
                store,
                batches: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                next_mid: AtomicUsize::new(42),
            })
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn connected(&self) -> bool {
            true
        }

        async fn send_sample(&self, sample: &Sample) -> TransportResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            // Mirror the pub/sub contract: claim before the publish returns.
            let mid = self.next_mid.fetch_add(1, Ordering::SeqCst) as i64;
            self.store.mark_in_flight(sample.id, mid)?;
            self.published.lock().unwrap().push(sample.clone());
            Ok(())
        }

        async fn send_batch(&self, samples: &[Sample]) -> TransportResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Rejected("HTTP 500".to_string()));
            }
            self.batches.lock().unwrap().push(samples.to_vec());
            Ok(())
        }

        async fn send_response(&self, _request_id: u64, _payload: &[u8]) -> TransportResult<()> {
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
            let (tx, rx) = broadcast::channel(1);
            std::mem::forget(tx);
            rx
        }
    }

    fn dispatcher(
        store: Arc<Store>,
        identity: Arc<dyn IdentityGate>,
        transport: Arc<FakeTransport>,
    ) -> Dispatcher {
        Dispatcher::new(store, identity, transport, DispatchConfig::default())
    }

    #[tokio::test]
    async fn test_http_cycle_delivers_batch_in_insertion_order() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.insert_sample("t.a", 1_700_000_000_000, 1.0).unwrap();
        store.insert_sample("t.a", 1_700_000_000_100, 2.0).unwrap();
        store.insert_sample("t.a", 1_700_000_000_200, 3.0).unwrap();

        let transport = FakeTransport::http(store.clone());
        let dispatcher = dispatcher(store.clone(), FakeIdentity::valid(), transport.clone());

        dispatcher.cycle().await.unwrap();

        // Exactly one batch of exactly 3 entries, in insertion order
        let batches = transport.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(
            batches[0].iter().map(|s| s.value).collect::<Vec<_>>(),
            vec![1.0, 2.0, 3.0]
        );

        // All marked sent, none eligible, nothing left in flight
        assert!(store.read_unsent(10).unwrap().is_empty());
        assert_eq!(store.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_http_cycle_failure_releases_claims() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        for i in 0..3 {
            store
                .insert_sample("t.a", 1_700_000_000_000 + i, i as f64)
                .unwrap();
        }

        let transport = FakeTransport::http(store.clone());
        transport.fail.store(true, Ordering::SeqCst);
        let dispatcher = dispatcher(store.clone(), FakeIdentity::valid(), transport.clone());

        assert!(dispatcher.cycle().await.is_err());

        // Claims released; the next tick can retry all three
        assert_eq!(store.read_unsent(10).unwrap().len(), 3);
        assert_eq!(store.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_pubsub_claim_prevents_reselection_until_ack() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.insert_sample("t.a", 1_700_000_000_000, 1.0).unwrap();

        let transport = FakeTransport::pubsub(store.clone());
        let dispatcher = dispatcher(store.clone(), FakeIdentity::valid(), transport.clone());

        // First tick publishes and claims under message id 42
        dispatcher.cycle().await.unwrap();
        assert_eq!(transport.published.lock().unwrap().len(), 1);

        // Second tick must not re-select the claimed row
        dispatcher.cycle().await.unwrap();
        assert_eq!(transport.published.lock().unwrap().len(), 1);

        // The ack arrives; the row is gone for good
        store.confirm_sent(42, true).unwrap();
        dispatcher.cycle().await.unwrap();
        assert_eq!(transport.published.lock().unwrap().len(), 1);
        assert!(store.read_unsent(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_identity_renews_before_send() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.insert_sample("t.a", 1_700_000_000_000, 1.0).unwrap();

        let identity = FakeIdentity::expired();
        let transport = FakeTransport::http(store.clone());
        let dispatcher = dispatcher(store.clone(), identity.clone(), transport.clone());

        dispatcher.cycle().await.unwrap();

        assert_eq!(identity.renewals.load(Ordering::SeqCst), 1);
        // Delivery still happened, after the gate
        assert_eq!(transport.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_valid_identity_skips_renewal() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let identity = FakeIdentity::valid();
        let transport = FakeTransport::http(store.clone());
        let dispatcher = dispatcher(store, identity.clone(), transport);

        dispatcher.cycle().await.unwrap();
        assert_eq!(identity.renewals.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_renewal_failure_is_not_fatal() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.insert_sample("t.a", 1_700_000_000_000, 1.0).unwrap();

        let identity = FakeIdentity::expired_and_failing();
        let transport = FakeTransport::http(store.clone());
        let dispatcher = dispatcher(store.clone(), identity.clone(), transport.clone());

        // The cycle proceeds on the old credential
        dispatcher.cycle().await.unwrap();
        assert_eq!(identity.renewals.load(Ordering::SeqCst), 1);
        assert_eq!(transport.batches.lock().unwrap().len(), 1);

        // And every subsequent cycle retries the renewal
        dispatcher.cycle().await.unwrap();
        assert_eq!(identity.renewals.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_store_cycles_are_quiet() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let transport = FakeTransport::http(store.clone());
        let dispatcher = dispatcher(store, FakeIdentity::valid(), transport.clone());

        dispatcher.cycle().await.unwrap();
        assert!(transport.batches.lock().unwrap().is_empty());
    }
}
