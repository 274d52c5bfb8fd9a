//! Wire envelope for sync exchanges
//!
//! Messages are JSON so they survive both byte- and text-oriented channels;
//! binary change payloads travel base64-encoded in the `changes` field.
//!
//! ## Wire format
//!
//! ```json
//! {
//!   "type": "sync-request",
//!   "deviceId": "01jx...",
//!   "timestamp": "2026-08-30T12:00:00Z",
//!   "changes": "hW9Kg..."
//! }
//! ```
//!
//! An absent `changes` field means an empty delta.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Direction of a sync message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Opens an exchange, carrying the sender's outgoing delta
    #[serde(rename = "sync-request")]
    Request,
    /// Answers a request, carrying the replying side's delta
    #[serde(rename = "sync-response")]
    Response,
}

impl MessageKind {
    /// Whether this is a request
    pub fn is_request(&self) -> bool {
        matches!(self, MessageKind::Request)
    }

    /// Whether this is a response
    pub fn is_response(&self) -> bool {
        matches!(self, MessageKind::Response)
    }
}

/// One sync exchange message, constructed fresh per exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    /// Request or response
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Stable id of the sending device
    pub device_id: String,
    /// When the message was constructed
    pub timestamp: DateTime<Utc>,
    /// Base64-encoded change payload; absent means empty delta
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<String>,
}

impl SyncMessage {
    /// Build a sync request from the local device
    pub fn request(device_id: &str, changes: Option<&[u8]>) -> Self {
        Self {
            kind: MessageKind::Request,
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            changes: changes.map(|c| BASE64.encode(c)),
        }
    }

    /// Build a sync response from the local device
    pub fn response(device_id: &str, changes: Option<&[u8]>) -> Self {
        Self {
            kind: MessageKind::Response,
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            changes: changes.map(|c| BASE64.encode(c)),
        }
    }

    /// Encode the message as JSON bytes
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Serialization` if encoding fails.
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Decode a message from JSON bytes
    ///
    /// # Errors
    ///
    /// Returns `SyncError::InvalidMessage` when `type`, `deviceId`, or
    /// `timestamp` is missing or malformed.
    pub fn decode(data: &[u8]) -> SyncResult<Self> {
        serde_json::from_slice(data).map_err(|e| SyncError::InvalidMessage(e.to_string()))
    }

    /// Decode the binary change payload, if present
    ///
    /// # Errors
    ///
    /// Returns `SyncError::MalformedChangePayload` when the `changes` field
    /// is not valid base64.
    pub fn changes_bytes(&self) -> SyncResult<Option<Vec<u8>>> {
        match &self.changes {
            None => Ok(None),
            Some(encoded) => BASE64
                .decode(encoded)
                .map(Some)
                .map_err(|e| SyncError::MalformedChangePayload(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_with_changes() {
        let msg = SyncMessage::request("device-1", Some(&[0x85, 0x6f, 0x4a, 0x83]));
        let encoded = msg.encode().unwrap();
        let decoded = SyncMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(
            decoded.changes_bytes().unwrap().as_deref(),
            Some(&[0x85, 0x6f, 0x4a, 0x83][..])
        );
    }

    #[test]
    fn test_roundtrip_without_changes() {
        let msg = SyncMessage::response("device-2", None);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.changes_bytes().unwrap().is_none());
    }

    #[test]
    fn test_absent_changes_not_serialized() {
        let msg = SyncMessage::request("device-1", None);
        let json = String::from_utf8(msg.encode().unwrap()).unwrap();
        assert!(!json.contains("changes"));
    }

    #[test]
    fn test_wire_field_names() {
        let msg = SyncMessage::request("device-1", Some(b"abc"));
        let json = String::from_utf8(msg.encode().unwrap()).unwrap();
        assert!(json.contains("\"type\":\"sync-request\""));
        assert!(json.contains("\"deviceId\":\"device-1\""));
        assert!(json.contains("\"timestamp\""));
    }

    #[test]
    fn test_decode_missing_type_fails() {
        let json = br#"{"deviceId":"d","timestamp":"2026-08-30T12:00:00Z"}"#;
        assert!(matches!(
            SyncMessage::decode(json),
            Err(SyncError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_decode_missing_device_id_fails() {
        let json = br#"{"type":"sync-request","timestamp":"2026-08-30T12:00:00Z"}"#;
        assert!(matches!(
            SyncMessage::decode(json),
            Err(SyncError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_decode_malformed_timestamp_fails() {
        let json = br#"{"type":"sync-request","deviceId":"d","timestamp":"yesterday"}"#;
        assert!(matches!(
            SyncMessage::decode(json),
            Err(SyncError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_decode_unknown_kind_fails() {
        let json = br#"{"type":"sync-gossip","deviceId":"d","timestamp":"2026-08-30T12:00:00Z"}"#;
        assert!(matches!(
            SyncMessage::decode(json),
            Err(SyncError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_corrupt_changes_field() {
        let json =
            br#"{"type":"sync-response","deviceId":"d","timestamp":"2026-08-30T12:00:00Z","changes":"%%%not-base64%%%"}"#;
        let msg = SyncMessage::decode(json).unwrap();
        assert!(matches!(
            msg.changes_bytes(),
            Err(SyncError::MalformedChangePayload(_))
        ));
    }

    #[test]
    fn test_kind_predicates() {
        assert!(SyncMessage::request("d", None).kind.is_request());
        assert!(SyncMessage::response("d", None).kind.is_response());
    }
}
