use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

const ORIGIN_TAG_LEN: usize = 25; // kind (1) + instance_id (16) + timestamp_millis (8)

/// Which part of an instance produced a replicated-document transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    /// A local user mutation (window move, presence update, ...).
    Session,
    /// The init-time merge writing reconciled state back into the document.
    Reconciler,
    /// A peer's update received over the transport and applied locally.
    Remote,
}

impl OriginKind {
    fn to_byte(self) -> u8 {
        match self {
            Self::Session => 0,
            Self::Reconciler => 1,
            Self::Remote => 2,
        }
    }

    fn from_byte(value: u8) -> Result<Self, OriginTagCodecError> {
        match value {
            0 => Ok(Self::Session),
            1 => Ok(Self::Reconciler),
            2 => Ok(Self::Remote),
            _ => Err(OriginTagCodecError::InvalidKind(value)),
        }
    }
}

impl fmt::Display for OriginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => f.write_str("session"),
            Self::Reconciler => f.write_str("reconciler"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// Origin metadata attached to every transaction a sync instance writes.
///
/// `instance_id` is the local-origin identifier: change notifications carrying
/// the same id were produced by this instance and are echoes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OriginTag {
    pub kind: OriginKind,
    pub instance_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl OriginTag {
    pub fn new(kind: OriginKind, instance_id: Uuid) -> Self {
        Self { kind, instance_id, timestamp: Utc::now() }
    }

    /// Compact encoding for yrs transaction origin bytes.
    ///
    /// Layout:
    /// - byte 0: kind (0 = session, 1 = reconciler, 2 = remote)
    /// - bytes 1..17: instance UUID
    /// - final 8 bytes: timestamp (UTC millis since epoch, little-endian i64)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(ORIGIN_TAG_LEN);
        encoded.push(self.kind.to_byte());
        encoded.extend_from_slice(self.instance_id.as_bytes());
        encoded.extend_from_slice(&self.timestamp.timestamp_millis().to_le_bytes());
        encoded
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OriginTagCodecError> {
        if bytes.len() != ORIGIN_TAG_LEN {
            return Err(OriginTagCodecError::LengthMismatch {
                expected: ORIGIN_TAG_LEN,
                actual: bytes.len(),
            });
        }

        let kind = OriginKind::from_byte(bytes[0])?;
        let mut id_bytes = [0u8; 16];
        id_bytes.copy_from_slice(&bytes[1..17]);
        let instance_id = Uuid::from_bytes(id_bytes);

        let mut millis_bytes = [0u8; 8];
        millis_bytes.copy_from_slice(&bytes[17..25]);
        let timestamp_millis = i64::from_le_bytes(millis_bytes);
        let timestamp = Utc
            .timestamp_millis_opt(timestamp_millis)
            .single()
            .ok_or(OriginTagCodecError::InvalidTimestampMillis(timestamp_millis))?;

        Ok(Self { kind, instance_id, timestamp })
    }

    /// True when this tag marks a write made by `instance_id` itself
    /// (session or reconciler), as opposed to a remote update it applied.
    pub fn is_local_to(&self, instance_id: Uuid) -> bool {
        self.instance_id == instance_id && self.kind != OriginKind::Remote
    }
}

impl fmt::Display for OriginTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.kind, self.instance_id, self.timestamp.to_rfc3339())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OriginTagCodecError {
    #[error("origin payload length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("invalid origin kind marker: {0}")]
    InvalidKind(u8),
    #[error("invalid timestamp millis: {0}")]
    InvalidTimestampMillis(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 7, 14, 8, 0).single().expect("test timestamp should be valid")
    }

    fn sample_tag(kind: OriginKind) -> OriginTag {
        OriginTag {
            kind,
            instance_id: Uuid::parse_str("6f1c2f7e-8d1b-4b7e-9a53-0f5c1d2e3a4b").unwrap(),
            timestamp: sample_timestamp(),
        }
    }

    #[test]
    fn origin_tag_round_trips_in_serde_and_binary_forms() {
        let tag = sample_tag(OriginKind::Reconciler);

        let json = serde_json::to_string(&tag).expect("serialize origin tag");
        let decoded_json: OriginTag = serde_json::from_str(&json).expect("deserialize origin tag");
        assert_eq!(decoded_json, tag);

        let bytes = tag.to_bytes();
        assert_eq!(bytes.len(), ORIGIN_TAG_LEN);
        let decoded_bytes = OriginTag::from_bytes(&bytes).expect("decode origin tag");
        assert_eq!(decoded_bytes, tag);
    }

    #[test]
    fn rejects_foreign_origin_payloads() {
        assert_eq!(
            OriginTag::from_bytes(b"file-watcher"),
            Err(OriginTagCodecError::LengthMismatch { expected: ORIGIN_TAG_LEN, actual: 12 })
        );

        let mut bytes = sample_tag(OriginKind::Session).to_bytes();
        bytes[0] = 9;
        assert_eq!(OriginTag::from_bytes(&bytes), Err(OriginTagCodecError::InvalidKind(9)));
    }

    #[test]
    fn remote_tags_are_never_local() {
        let session = sample_tag(OriginKind::Session);
        let remote = sample_tag(OriginKind::Remote);
        assert!(session.is_local_to(session.instance_id));
        assert!(!remote.is_local_to(remote.instance_id));
        assert!(!session.is_local_to(Uuid::new_v4()));
    }

    #[test]
    fn display_includes_kind_instance_and_timestamp() {
        let tag = sample_tag(OriginKind::Session);
        assert_eq!(
            tag.to_string(),
            format!("session:{}@{}", tag.instance_id, tag.timestamp.to_rfc3339())
        );
    }
}
