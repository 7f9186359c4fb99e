//! Wire formats and topic layout shared by the transports.

use beacon_store::Sample;
use chrono::{TimeZone, Utc};
use serde::Serialize;

/// Topic a device publishes samples to.
pub fn sample_topic(device_id: &str) -> String {
    format!("/device/{device_id}/sample")
}

/// Topic a device receives command frames on.
pub fn command_topic(device_id: &str) -> String {
    format!("/device/{device_id}/command")
}

/// Topic carrying the device's retained presence status.
pub fn status_topic(device_id: &str) -> String {
    format!("/device/{device_id}/status")
}

/// Topic a command response publishes to; the originating request id is
/// embedded for correlation.
pub fn response_topic(device_id: &str, request_id: u64) -> String {
    format!("/device/{device_id}/response/{request_id}")
}

/// Encode a sample as the binary publish frame:
/// 8-byte little-endian millisecond timestamp, 8-byte little-endian
/// IEEE-754 value, then the stream name bytes, unterminated.
pub fn encode_sample_frame(timestamp: i64, value: f64, stream: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(16 + stream.len());
    frame.extend_from_slice(&timestamp.to_le_bytes());
    frame.extend_from_slice(&value.to_le_bytes());
    frame.extend_from_slice(stream.as_bytes());
    frame
}

/// Format a millisecond epoch timestamp as RFC3339 with microsecond
/// precision, the layout the notification endpoint expects.
pub fn rfc3339_micros(timestamp_ms: i64) -> String {
    match Utc.timestamp_millis_opt(timestamp_ms).single() {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
        None => Utc
            .timestamp_millis_opt(0)
            .unwrap()
            .format("%Y-%m-%dT%H:%M:%S%.6fZ")
            .to_string(),
    }
}

/// One entry in a notification batch.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEntry {
    pub code: String,
    pub timestamp: String,
    pub value: f64,
}

impl NotificationEntry {
    pub fn new(stream: &str, timestamp_ms: i64, value: f64) -> Self {
        Self {
            code: stream.to_string(),
            timestamp: rfc3339_micros(timestamp_ms),
            value,
        }
    }
}

impl From<&Sample> for NotificationEntry {
    fn from(sample: &Sample) -> Self {
        Self::new(&sample.stream, sample.timestamp, sample.value)
    }
}

#[derive(Debug, Serialize)]
struct NotificationBatch<'a> {
    notification: &'static str,
    parameters: &'a [NotificationEntry],
}

/// Build the JSON body for a batched streams notification.
pub fn notification_body(entries: &[NotificationEntry]) -> serde_json::Value {
    serde_json::to_value(NotificationBatch {
        notification: "streams",
        parameters: entries,
    })
    .expect("notification batch serializes")
}

/// Build the JSON body for a single string-valued notification.
pub fn single_notification_body(stream: &str, timestamp_ms: i64, value: &str) -> serde_json::Value {
    serde_json::json!({
        "notification": "stream",
        "parameters": {
            "timestamp": rfc3339_micros(timestamp_ms),
            "code": stream,
            "value": value,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_frame_layout() {
        let frame = encode_sample_frame(1_700_000_000_000, 21.5, "temperature.zone1");

        assert_eq!(frame.len(), 16 + "temperature.zone1".len());
        assert_eq!(&frame[0..8], &1_700_000_000_000i64.to_le_bytes());
        assert_eq!(&frame[8..16], &21.5f64.to_le_bytes());
        assert_eq!(&frame[16..], b"temperature.zone1");
    }

    #[test]
    fn test_rfc3339_micros_format() {
        assert_eq!(
            rfc3339_micros(1_700_000_000_000),
            "2023-11-14T22:13:20.000000Z"
        );
        assert_eq!(
            rfc3339_micros(1_700_000_000_123),
            "2023-11-14T22:13:20.123000Z"
        );
    }

    #[test]
    fn test_notification_body_shape() {
        let entries = vec![
            NotificationEntry::new("t.a", 1_700_000_000_000, 1.0),
            NotificationEntry::new("t.b", 1_700_000_000_100, 2.0),
        ];
        let body = notification_body(&entries);

        assert_eq!(body["notification"], "streams");
        let params = body["parameters"].as_array().unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0]["code"], "t.a");
        assert_eq!(params[0]["value"], 1.0);
        assert_eq!(params[1]["timestamp"], "2023-11-14T22:13:20.100000Z");
    }

    #[test]
    fn test_single_notification_body_shape() {
        let body = single_notification_body("state.mode", 1_700_000_000_000, "automatic");
        assert_eq!(body["notification"], "stream");
        assert_eq!(body["parameters"]["code"], "state.mode");
        assert_eq!(body["parameters"]["value"], "automatic");
    }

    #[test]
    fn test_topics_embed_device_and_request() {
        assert_eq!(sample_topic("unit-1"), "/device/unit-1/sample");
        assert_eq!(command_topic("unit-1"), "/device/unit-1/command");
        assert_eq!(status_topic("unit-1"), "/device/unit-1/status");
        assert_eq!(response_topic("unit-1", 42), "/device/unit-1/response/42");
    }
}
