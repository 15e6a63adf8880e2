//! The persisted lease record

use crate::error::{Result, SessionError};
use crate::peer::PeerId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Current claim to session authority.
///
/// Stored as `{"peerId": "<uuid>", "timestamp": <epoch millis>}` under the
/// coordination key. There is exactly one record per key and the last write
/// wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub peer_id: PeerId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn new(peer_id: PeerId, timestamp: DateTime<Utc>) -> Self {
        // Millisecond precision is all the wire format keeps.
        let millis = timestamp.timestamp_millis();
        let timestamp = DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(timestamp);
        Self { peer_id, timestamp }
    }

    /// Serialize for the shared store
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a persisted value. Anything unparsable is `MalformedRecord`.
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| SessionError::malformed_record(format!("{}: {:?}", e, raw)))
    }

    /// Time since the record was written. Negative under clock skew.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.timestamp)
    }

    /// A record older than `stale_timeout` is no longer honored
    pub fn is_stale(&self, now: DateTime<Utc>, stale_timeout: std::time::Duration) -> bool {
        self.age(now) > to_chrono(stale_timeout)
    }

    /// First instant at which the record counts as stale
    pub fn stale_at(&self, stale_timeout: std::time::Duration) -> DateTime<Utc> {
        self.timestamp + to_chrono(stale_timeout) + Duration::milliseconds(1)
    }

    pub fn is_held_by(&self, peer_id: &PeerId) -> bool {
        &self.peer_id == peer_id
    }
}

pub(crate) fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(millis).unwrap()
    }

    #[test]
    fn test_wire_format() {
        let peer = PeerId::new();
        let record = LeaseRecord::new(peer, at(1_700_000_000_123));
        let encoded = record.encode().unwrap();

        let json: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(json["peerId"], serde_json::json!(peer.to_string()));
        assert_eq!(json["timestamp"], serde_json::json!(1_700_000_000_123i64));

        assert_eq!(LeaseRecord::decode(&encoded).unwrap(), record);
    }

    #[test]
    fn test_malformed_values() {
        for raw in ["", "null", "{}", "{\"peerId\":\"x\",\"timestamp\":1}", "[1,2]"] {
            let err = LeaseRecord::decode(raw).unwrap_err();
            assert!(matches!(err, SessionError::MalformedRecord(_)), "{}", raw);
        }
    }

    #[test]
    fn test_staleness_boundary() {
        let record = LeaseRecord::new(PeerId::new(), at(0));
        let stale = std::time::Duration::from_millis(5000);

        assert!(!record.is_stale(at(50), stale));
        assert!(!record.is_stale(at(5000), stale));
        assert!(record.is_stale(at(5001), stale));
        assert_eq!(record.stale_at(stale), at(5001));
    }

    #[test]
    fn test_future_record_is_not_stale() {
        let record = LeaseRecord::new(PeerId::new(), at(10_000));
        assert!(!record.is_stale(at(0), std::time::Duration::from_millis(1)));
        assert!(record.age(at(0)) < Duration::zero());
    }

    proptest! {
        #[test]
        fn test_stale_exactly_after_timeout(
            written in 0i64..1_000_000_000,
            elapsed in 0i64..100_000,
            timeout in 1u64..50_000,
        ) {
            let record = LeaseRecord::new(PeerId::new(), at(written));
            let stale = record.is_stale(at(written + elapsed), std::time::Duration::from_millis(timeout));
            prop_assert_eq!(stale, elapsed > timeout as i64);
        }
    }
}
