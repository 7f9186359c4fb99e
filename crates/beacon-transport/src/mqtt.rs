//! MQTT pub/sub transport.
//!
//! A background task owns the connection and drives the rumqttc event
//! loop: it reconciles publish acknowledgements into the store, forwards
//! inbound command frames, and maintains the retained presence status.
//!
//! Correlation: the client library assigns its packet id only once the
//! publish reaches the event loop, so `send_sample` claims the row under a
//! store-issued message id before publishing and the event task maps
//! packet id -> message id in publish order. Samples are the only QoS 1
//! publishes; presence and command responses go out at QoS 0 so they never
//! enter that mapping.

use crate::wire::{
    command_topic, encode_sample_frame, response_topic, sample_topic, single_notification_body,
    status_topic,
};
use crate::{Transport, TransportError, TransportEvent, TransportKind, TransportResult};
use async_trait::async_trait;
use beacon_store::{Sample, Store};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay before polling the event loop again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// TLS material for the broker link.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub ca: PathBuf,
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// MQTT transport configuration.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub device_id: String,
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    /// TLS with client certificate; plain TCP when absent.
    pub tls: Option<TlsFiles>,
}

impl MqttConfig {
    pub fn new(device_id: &str, host: &str, port: u16) -> Self {
        Self {
            device_id: device_id.to_string(),
            host: host.to_string(),
            port,
            keep_alive_secs: 60,
            tls: None,
        }
    }
}

/// MQTT pub/sub transport with acknowledged sample publishes.
pub struct MqttTransport {
    device_id: String,
    client: AsyncClient,
    store: Arc<Store>,
    connected: AtomicBool,
    event_tx: broadcast::Sender<TransportEvent>,
    /// Message ids of publishes the event loop has not yet assigned a
    /// packet id to, in publish order.
    awaiting_pkid: Mutex<VecDeque<i64>>,
    /// Packet id -> message id for unacknowledged publishes.
    inflight: Mutex<HashMap<u16, i64>>,
}

impl MqttTransport {
    /// Connect to the broker and spawn the network task.
    pub fn start(
        config: MqttConfig,
        store: Arc<Store>,
        cancel: CancellationToken,
    ) -> TransportResult<Arc<Self>> {
        let mut options = MqttOptions::new(&config.device_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            status_topic(&config.device_id),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));

        if let Some(tls) = &config.tls {
            let ca = std::fs::read(&tls.ca)?;
            let certificate = std::fs::read(&tls.certificate)?;
            let key = std::fs::read(&tls.key)?;
            options.set_transport(rumqttc::Transport::Tls(rumqttc::TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: Some((certificate, key)),
            }));
        }

        info!(
            host = %config.host,
            port = config.port,
            tls = config.tls.is_some(),
            "Connecting to broker"
        );

        let (client, eventloop) = AsyncClient::new(options, 100);
        let (event_tx, _) = broadcast::channel(64);

        let transport = Arc::new(Self {
            device_id: config.device_id,
            client,
            store,
            connected: AtomicBool::new(false),
            event_tx,
            awaiting_pkid: Mutex::new(VecDeque::new()),
            inflight: Mutex::new(HashMap::new()),
        });

        tokio::spawn(run_event_loop(transport.clone(), eventloop, cancel));

        Ok(transport)
    }

    /// Publish a single string-valued notification.
    pub async fn send_notification(
        &self,
        stream: &str,
        timestamp_ms: i64,
        value: &str,
    ) -> TransportResult<()> {
        if !self.connected() {
            return Err(TransportError::NotConnected);
        }

        let topic = format!("/device/{}/notification", self.device_id);
        let body = single_notification_body(stream, timestamp_ms, value).to_string();
        self.client
            .publish(topic, QoS::AtMostOnce, false, body)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    fn drop_awaiting(&self, message_id: i64) {
        let mut awaiting = self.awaiting_pkid.lock().unwrap_or_else(|e| e.into_inner());
        awaiting.retain(|mid| *mid != message_id);
    }

    fn clear_correlation(&self) {
        self.awaiting_pkid
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PubSub
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_sample(&self, sample: &Sample) -> TransportResult<()> {
        if !self.connected() {
            return Err(TransportError::NotConnected);
        }

        // Claim the row before the publish goes out; the ack path resolves
        // the claim, the reclaim window recovers it if the ack never comes.
        let message_id = self.store.next_message_id();
        self.store.mark_in_flight(sample.id, message_id)?;
        {
            let mut awaiting = self.awaiting_pkid.lock().unwrap_or_else(|e| e.into_inner());
            awaiting.push_back(message_id);
        }

        let frame = encode_sample_frame(sample.timestamp, sample.value, &sample.stream);
        match self
            .client
            .publish(
                sample_topic(&self.device_id),
                QoS::AtLeastOnce,
                false,
                frame,
            )
            .await
        {
            Ok(()) => {
                debug!(
                    id = sample.id,
                    message_id,
                    stream = %sample.stream,
                    "Published sample"
                );
                Ok(())
            }
            Err(e) => {
                self.drop_awaiting(message_id);
                self.store.release_claim(message_id)?;
                Err(TransportError::Publish(e.to_string()))
            }
        }
    }

    async fn send_batch(&self, samples: &[Sample]) -> TransportResult<()> {
        for sample in samples {
            self.send_sample(sample).await?;
        }
        Ok(())
    }

    async fn send_response(&self, request_id: u64, payload: &[u8]) -> TransportResult<()> {
        if !self.connected() {
            return Err(TransportError::NotConnected);
        }

        self.client
            .publish(
                response_topic(&self.device_id, request_id),
                QoS::AtMostOnce,
                false,
                payload.to_vec(),
            )
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }
}

async fn run_event_loop(
    transport: Arc<MqttTransport>,
    mut eventloop: EventLoop,
    cancel: CancellationToken,
) {
    let commands = command_topic(&transport.device_id);
    let status = status_topic(&transport.device_id);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Shutdown requested, disconnecting");
                let _ = transport.client.disconnect().await;
                break;
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to broker");
                        transport.connected.store(true, Ordering::SeqCst);

                        if let Err(e) = transport
                            .client
                            .subscribe(&commands, QoS::ExactlyOnce)
                            .await
                        {
                            error!(error = %e, "Could not subscribe to command topic");
                        }
                        // Retained presence; QoS 0 keeps it out of the
                        // sample packet-id correlation.
                        if let Err(e) = transport
                            .client
                            .publish(&status, QoS::AtMostOnce, true, "online")
                            .await
                        {
                            warn!(error = %e, "Could not publish online status");
                        }

                        let _ = transport.event_tx.send(TransportEvent::Connected);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.topic == commands {
                            debug!(bytes = publish.payload.len(), "Command frame received");
                            let _ = transport
                                .event_tx
                                .send(TransportEvent::Command(publish.payload.to_vec()));
                        } else {
                            debug!(topic = %publish.topic, "Ignoring message on unknown topic");
                        }
                    }
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        let message_id = {
                            let mut inflight =
                                transport.inflight.lock().unwrap_or_else(|e| e.into_inner());
                            inflight.remove(&ack.pkid)
                        };
                        match message_id {
                            Some(mid) => match transport.store.confirm_sent(mid, true) {
                                Ok(confirmed) => {
                                    debug!(pkid = ack.pkid, message_id = mid, confirmed, "Publish acknowledged")
                                }
                                Err(e) => {
                                    error!(message_id = mid, error = %e, "Could not confirm delivery")
                                }
                            },
                            None => debug!(pkid = ack.pkid, "Ack for unknown packet id"),
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        // QoS 0 publishes carry packet id 0 and are not
                        // correlated.
                        if pkid != 0 {
                            let mut awaiting = transport
                                .awaiting_pkid
                                .lock()
                                .unwrap_or_else(|e| e.into_inner());
                            if let Some(mid) = awaiting.pop_front() {
                                transport
                                    .inflight
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner())
                                    .insert(pkid, mid);
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("Broker requested disconnect");
                        transport.connected.store(false, Ordering::SeqCst);
                        transport.clear_correlation();
                        let _ = transport
                            .event_tx
                            .send(TransportEvent::Disconnected(None));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if transport.connected.swap(false, Ordering::SeqCst) {
                            warn!(error = %e, "Connection lost");
                            let _ = transport
                                .event_tx
                                .send(TransportEvent::Disconnected(Some(e.to_string())));
                        }
                        transport.clear_correlation();

                        // The event loop reconnects on the next poll; pace it.
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                    }
                }
            }
        }
    }

    debug!("Network task stopped");
}
