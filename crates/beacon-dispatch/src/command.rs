//! Binary command protocol.
//!
//! Inbound frame layout, big-endian:
//! `[8-byte request id][2-byte command id][2-byte payload length][payload]`
//!
//! A response, when one is produced, is one byte of type tag followed by
//! the value's native byte layout, published back correlated by the
//! request id. Malformed frames are dropped with a logged error and never
//! answered.

use crate::{DispatchError, DispatchResult};
use beacon_store::Store;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Read a typed configuration value.
pub const CMD_CONFIG_READ: u16 = 1;
/// Write a typed configuration value.
pub const CMD_CONFIG_WRITE: u16 = 2;
/// Trigger a device reboot.
pub const CMD_REBOOT: u16 = 3;

/// String value, stored in the string config table.
pub const TAG_STRING: u8 = 0;
/// 32-bit integer value.
pub const TAG_INT: u8 = 1;
/// 64-bit float value.
pub const TAG_DOUBLE: u8 = 2;
/// 64-bit integer value.
pub const TAG_INT64: u8 = 3;

/// Frame header: request id + command id + payload length.
const HEADER_LEN: usize = 12;

/// Protocol error type. Every variant drops the frame.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame shorter than the fixed header
    #[error("Frame truncated: {0} bytes")]
    Truncated(usize),

    /// Declared payload length exceeds the frame
    #[error("Declared payload length {declared} exceeds frame ({available} available)")]
    PayloadLength { declared: usize, available: usize },

    /// Unknown command id
    #[error("Unknown command id: {0}")]
    UnknownCommand(u16),

    /// Unknown value type tag
    #[error("Unknown type tag: {0}")]
    UnknownTag(u8),

    /// Declared value length does not match the type's width
    #[error("Value length {got} does not match type width {want}")]
    ValueWidth { want: usize, got: usize },

    /// Structurally invalid payload
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// Key or value bytes are not UTF-8
    #[error("Invalid UTF-8 in {0}")]
    Utf8(&'static str),
}

/// A decoded command frame borrowing its payload.
#[derive(Debug, PartialEq, Eq)]
pub struct CommandFrame<'a> {
    pub request_id: u64,
    pub command: u16,
    pub payload: &'a [u8],
}

/// A typed response frame to publish back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub request_id: u64,
    /// One byte of type tag followed by the value bytes.
    pub body: Vec<u8>,
}

/// Parse the fixed header and bounds-check the declared payload length.
pub fn parse_frame(buf: &[u8]) -> Result<CommandFrame<'_>, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated(buf.len()));
    }

    let request_id = be_u64(&buf[0..8]);
    let command = be_u16(&buf[8..10]);
    let declared = be_u16(&buf[10..12]) as usize;

    let available = buf.len() - HEADER_LEN;
    if declared > available {
        return Err(ProtocolError::PayloadLength {
            declared,
            available,
        });
    }

    Ok(CommandFrame {
        request_id,
        command,
        payload: &buf[HEADER_LEN..HEADER_LEN + declared],
    })
}

/// Collaborator for externally visible device actions.
pub trait SystemControl: Send + Sync {
    /// Trigger a device reboot.
    fn reboot(&self);
}

/// Decodes command frames and executes them against the store.
pub struct CommandHandler {
    store: Arc<Store>,
    system: Arc<dyn SystemControl>,
}

impl CommandHandler {
    pub fn new(store: Arc<Store>, system: Arc<dyn SystemControl>) -> Self {
        Self { store, system }
    }

    /// Handle one raw frame. `Ok(Some(..))` carries a response to publish;
    /// `Ok(None)` means the command completed silently.
    pub fn handle(&self, raw: &[u8]) -> DispatchResult<Option<CommandResponse>> {
        let frame = parse_frame(raw)?;

        match frame.command {
            CMD_CONFIG_READ => self.config_read(&frame),
            CMD_CONFIG_WRITE => self.config_write(&frame).map(|()| None),
            CMD_REBOOT => {
                info!(request_id = frame.request_id, "Reboot requested");
                self.system.reboot();
                Ok(None)
            }
            other => Err(ProtocolError::UnknownCommand(other).into()),
        }
    }

    /// `CONFIG_READ` payload: `[tag][key bytes]`.
    fn config_read(&self, frame: &CommandFrame<'_>) -> DispatchResult<Option<CommandResponse>> {
        let (tag, key) = split_tag_key(frame.payload)?;

        let body = match tag {
            TAG_STRING => match self.store.get_string(key)? {
                Some(value) => {
                    let mut body = Vec::with_capacity(1 + value.len());
                    body.push(TAG_STRING);
                    body.extend_from_slice(value.as_bytes());
                    body
                }
                None => {
                    warn!(key, "Config read for absent string key, no response");
                    return Ok(None);
                }
            },
            TAG_INT => {
                // Absent integers read as zero on this protocol.
                let value = self.store.get_int64(key)?.unwrap_or(0) as i32;
                let mut body = Vec::with_capacity(5);
                body.push(TAG_INT);
                body.extend_from_slice(&value.to_le_bytes());
                body
            }
            TAG_DOUBLE => {
                // Absent doubles read as NaN.
                let value = self.store.get_double(key)?.unwrap_or(f64::NAN);
                let mut body = Vec::with_capacity(9);
                body.push(TAG_DOUBLE);
                body.extend_from_slice(&value.to_le_bytes());
                body
            }
            TAG_INT64 => {
                let value = self.store.get_int64(key)?.unwrap_or(0);
                let mut body = Vec::with_capacity(9);
                body.push(TAG_INT64);
                body.extend_from_slice(&value.to_le_bytes());
                body
            }
            other => return Err(ProtocolError::UnknownTag(other).into()),
        };

        Ok(Some(CommandResponse {
            request_id: frame.request_id,
            body,
        }))
    }

    /// `CONFIG_WRITE` payload:
    /// `[tag][2-byte key len][2-byte value len][key][value]`.
    ///
    /// Fixed-width tags whose declared value length does not match the
    /// type's width are rejected before anything touches the store.
    fn config_write(&self, frame: &CommandFrame<'_>) -> DispatchResult<()> {
        let payload = frame.payload;
        if payload.len() < 5 {
            return Err(ProtocolError::Malformed(format!(
                "config write payload too short: {} bytes",
                payload.len()
            ))
            .into());
        }

        let tag = payload[0];
        let key_len = be_u16(&payload[1..3]) as usize;
        let value_len = be_u16(&payload[3..5]) as usize;

        if 5 + key_len + value_len != payload.len() {
            return Err(ProtocolError::Malformed(format!(
                "declared lengths {key_len}+{value_len} do not fill payload of {} bytes",
                payload.len() - 5
            ))
            .into());
        }

        let key = std::str::from_utf8(&payload[5..5 + key_len])
            .map_err(|_| ProtocolError::Utf8("key"))?;
        let value = &payload[5 + key_len..];

        match tag {
            TAG_STRING => {
                let value =
                    std::str::from_utf8(value).map_err(|_| ProtocolError::Utf8("value"))?;
                self.store.set_string(key, value)?;
            }
            TAG_INT => {
                let value = i32::from_le_bytes(fixed_width::<4>(value)?);
                self.store.set_int64(key, value as i64)?;
            }
            TAG_DOUBLE => {
                let value = f64::from_le_bytes(fixed_width::<8>(value)?);
                self.store.set_double(key, value)?;
            }
            TAG_INT64 => {
                let value = i64::from_le_bytes(fixed_width::<8>(value)?);
                self.store.set_int64(key, value)?;
            }
            other => return Err(ProtocolError::UnknownTag(other).into()),
        }

        info!(request_id = frame.request_id, key, tag, "Config written");
        Ok(())
    }
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

fn split_tag_key(payload: &[u8]) -> Result<(u8, &str), ProtocolError> {
    if payload.len() < 2 {
        return Err(ProtocolError::Malformed(format!(
            "config read payload too short: {} bytes",
            payload.len()
        )));
    }
    let key = std::str::from_utf8(&payload[1..]).map_err(|_| ProtocolError::Utf8("key"))?;
    Ok((payload[0], key))
}

fn fixed_width<const N: usize>(value: &[u8]) -> Result<[u8; N], ProtocolError> {
    value
        .try_into()
        .map_err(|_| ProtocolError::ValueWidth {
            want: N,
            got: value.len(),
        })
}
