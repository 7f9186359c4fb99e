//! Reference waveform producer.
//!
//! Emits a monotonically increasing counter and a damped interference
//! wave once per step, resuming from the persisted `next_run` cursor so a
//! restarted device continues the series instead of starting over.

use beacon_store::Store;
use beacon_transport::HttpTransport;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Milliseconds between emitted samples.
const STEP_MS: i64 = 1_000;

/// Cursor key in the numeric config table.
const NEXT_RUN_KEY: &str = "next_run";

pub async fn run(
    store: Arc<Store>,
    http: Option<Arc<HttpTransport>>,
    cancel: CancellationToken,
) {
    let mut next_run = store.get_int64(NEXT_RUN_KEY).ok().flatten().unwrap_or(0);
    if next_run == 0 {
        info!("New reference device, starting the series now");
        let now = Utc::now().timestamp_millis();
        next_run = now - now % STEP_MS;
    } else {
        info!(next_run, "Resuming reference series");
    }

    let mut counter: i64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }

        let now = Utc::now().timestamp_millis();
        while now >= next_run {
            let x = next_run as f64 / 1_000.0;
            let reference = (x / 200.0).cos() * (x / 300.0).sin();

            emit(&store, http.as_deref(), "test.inc", next_run, counter as f64).await;
            emit(&store, http.as_deref(), "test.ref_value", next_run, reference).await;

            next_run += STEP_MS;
            counter += 1;
            if let Err(e) = store.set_int64(NEXT_RUN_KEY, next_run) {
                warn!(error = %e, "Could not persist series cursor");
            }
        }
    }

    info!(emitted = counter, "Simulator stopped");
}

/// HTTP gets the fast-path queue; everything else goes durable-first and
/// drains through the dispatcher.
async fn emit(
    store: &Store,
    http: Option<&HttpTransport>,
    stream: &str,
    timestamp: i64,
    value: f64,
) {
    let result = match http {
        Some(http) => http
            .submit(stream, timestamp, value)
            .await
            .map_err(|e| e.to_string()),
        None => store
            .insert_sample(stream, timestamp, value)
            .map(|_| ())
            .map_err(|e| e.to_string()),
    };

    if let Err(e) = result {
        warn!(stream, error = %e, "Could not emit sample");
    }
}
