//! The save/restore wire format shared by [`crate::engine::Engine`] and the
//! room server's authoritative state transfer: `{version, chronicle,
//! history_tail, seq}`.
//!
//! `chronicle` is the opaque bytes `Chronicle::save` produces (already
//! version-tagged on its own terms); `history_tail` is only the most recent
//! entries, bounded by [`DEFAULT_HISTORY_TAIL_LEN`], so a snapshot stays
//! cheap to ship to a freshly joining peer instead of carrying the entire
//! dispatch history since genesis.

use serde::{Deserialize, Serialize};

use crate::chronicle::Chronicle;
use crate::engine::HistoryEntry;
use crate::error::{ChronicleError, Result};
use crate::ids::PeerId;

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;
pub const DEFAULT_HISTORY_TAIL_LEN: usize = 256;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub chronicle: Vec<u8>,
    pub history_tail: Vec<HistoryEntry>,
    pub seq: u64,
}

impl Snapshot {
    pub fn capture(chronicle: &Chronicle, history: &[HistoryEntry], seq: u64) -> Result<Self> {
        let tail_start = history.len().saturating_sub(DEFAULT_HISTORY_TAIL_LEN);
        Ok(Self {
            version: SNAPSHOT_FORMAT_VERSION,
            chronicle: chronicle.save()?,
            history_tail: history[tail_start..].to_vec(),
            seq,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| ChronicleError::CorruptChange(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let snapshot: Self = rmp_serde::from_slice(bytes).map_err(|e| ChronicleError::CorruptChange(e.to_string()))?;
        if snapshot.version != SNAPSHOT_FORMAT_VERSION {
            return Err(ChronicleError::VersionDrift {
                expected: SNAPSHOT_FORMAT_VERSION,
                found: snapshot.version,
            });
        }
        Ok(snapshot)
    }

    pub fn into_chronicle(&self, replica_id: PeerId) -> Result<Chronicle> {
        Chronicle::load(replica_id, &self.chronicle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use serde_json::Value as Json;

    #[test]
    fn round_trip_preserves_state_history_and_seq() {
        let mut engine = Engine::new(Chronicle::new(PeerId::generate()));
        engine.registry_mut().register("noop", |_chronicle, payload| Ok(payload.clone()));
        engine.dispatch("noop", Json::from(1)).unwrap();
        engine.dispatch("noop", Json::from(2)).unwrap();

        let bytes = engine.snapshot().unwrap();
        let snapshot = Snapshot::decode(&bytes).unwrap();
        assert_eq!(snapshot.seq, 2);
        assert_eq!(snapshot.history_tail.len(), 2);

        let restored = snapshot.into_chronicle(engine.chronicle().replica_id()).unwrap();
        assert_eq!(restored.save().unwrap(), engine.chronicle().save().unwrap());
    }

    #[test]
    fn history_tail_is_bounded() {
        let mut engine = Engine::new(Chronicle::new(PeerId::generate()));
        engine.registry_mut().register("noop", |_chronicle, payload| Ok(payload.clone()));
        for i in 0..(DEFAULT_HISTORY_TAIL_LEN + 10) {
            engine.dispatch("noop", Json::from(i as i64)).unwrap();
        }
        let bytes = engine.snapshot().unwrap();
        let snapshot = Snapshot::decode(&bytes).unwrap();
        assert_eq!(snapshot.history_tail.len(), DEFAULT_HISTORY_TAIL_LEN);
        assert_eq!(snapshot.seq, (DEFAULT_HISTORY_TAIL_LEN + 10) as u64);
    }

    #[test]
    fn decoding_wrong_version_fails_with_version_drift() {
        let snapshot = Snapshot {
            version: 99,
            chronicle: Vec::new(),
            history_tail: Vec::new(),
            seq: 0,
        };
        let bytes = rmp_serde::to_vec_named(&snapshot).unwrap();
        let result = Snapshot::decode(&bytes);
        assert!(matches!(result, Err(ChronicleError::VersionDrift { .. })));
    }
}
