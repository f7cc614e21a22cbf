//! Append-only, hash-chained audit log of [`LoopResult`]s.
//!
//! Each cycle becomes one postcard-encoded [`AuditRecord`] under the
//! `audit` namespace of a [`StoragePort`].  A record carries the SHA-256 of
//! the previous record's bytes, so editing, removing or reordering any
//! record breaks [`AuditLog::verify_chain`].  Sequence numbers must also
//! increase by exactly one, which exposes a truncated tail that was
//! patched over.
//!
//! Keys are `<timestamp ms, 15 digits>-<sequence, 10 digits>`: sorting keys
//! sorts records by cycle time, and two cycles in the same millisecond
//! still get distinct keys.

use chrono::{DateTime, Utc};
use hmac_sha256::Hash;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::app::events::LoopResult;
use crate::app::ports::StoragePort;
use crate::error::AuditError;

pub const AUDIT_NAMESPACE: &str = "audit";

/// `prev_hash` of the first record.
pub const GENESIS: [u8; 32] = [0; 32];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub prev_hash: [u8; 32],
    pub result: LoopResult,
}

pub fn encode_record(record: &AuditRecord) -> Result<Vec<u8>, AuditError> {
    postcard::to_allocvec(record).map_err(|_| AuditError::Codec)
}

pub fn decode_record(bytes: &[u8]) -> Result<AuditRecord, AuditError> {
    postcard::from_bytes(bytes).map_err(|_| AuditError::Codec)
}

fn millis(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp_millis()).unwrap_or(0)
}

pub fn record_key(timestamp: DateTime<Utc>, sequence: u64) -> String {
    format!("{:015}-{:010}", millis(timestamp), sequence)
}

/// Last record of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Head {
    hash: [u8; 32],
    sequence: u64,
}

pub struct AuditLog {
    storage: Box<dyn StoragePort + Send>,
    head: Option<Head>,
}

impl AuditLog {
    /// Open the log and find its head.  The chain is not verified here;
    /// call [`verify_chain`](Self::verify_chain) for that.
    pub fn open(storage: Box<dyn StoragePort + Send>) -> Result<Self, AuditError> {
        let mut log = Self { storage, head: None };
        let keys = log.storage.keys(AUDIT_NAMESPACE)?;
        if let Some(last) = keys.last() {
            let bytes = log.storage.read(AUDIT_NAMESPACE, last)?;
            let record = decode_record(&bytes)?;
            log.head = Some(Head { hash: Hash::hash(&bytes), sequence: record.result.sequence });
            info!("audit: resuming after cycle {} ({} records)", record.result.sequence, keys.len());
        }
        Ok(log)
    }

    /// Sequence number the next record must carry.
    pub fn next_sequence(&self) -> u64 {
        self.head.map_or(0, |h| h.sequence + 1)
    }

    /// Append `result`, linking it to the current head.
    pub fn append(&mut self, result: &LoopResult) -> Result<String, AuditError> {
        let prev_hash = self.head.map_or(GENESIS, |h| h.hash);
        let record = AuditRecord { prev_hash, result: result.clone() };
        let bytes = encode_record(&record)?;
        let key = record_key(result.timestamp, result.sequence);
        self.storage.append(AUDIT_NAMESPACE, &key, &bytes).inspect_err(|e| {
            error!("audit: append of cycle {} failed: {e}", result.sequence);
        })?;
        self.head = Some(Head { hash: Hash::hash(&bytes), sequence: result.sequence });
        debug!("audit: stored {key} ({} bytes)", bytes.len());
        Ok(key)
    }

    pub fn len(&self) -> Result<usize, AuditError> {
        Ok(self.storage.keys(AUDIT_NAMESPACE)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, AuditError> {
        Ok(self.len()? == 0)
    }

    /// Every stored result, oldest first.
    pub fn records(&self) -> Result<Vec<LoopResult>, AuditError> {
        self.storage
            .keys(AUDIT_NAMESPACE)?
            .iter()
            .map(|key| Ok(decode_record(&self.storage.read(AUDIT_NAMESPACE, key)?)?.result))
            .collect()
    }

    /// Results of the cycles that ran at `timestamp` (millisecond
    /// resolution), in sequence order.
    pub fn get(&self, timestamp: DateTime<Utc>) -> Result<Vec<LoopResult>, AuditError> {
        let prefix = format!("{:015}-", millis(timestamp));
        self.storage
            .keys(AUDIT_NAMESPACE)?
            .iter()
            .filter(|k| k.starts_with(&prefix))
            .map(|key| Ok(decode_record(&self.storage.read(AUDIT_NAMESPACE, key)?)?.result))
            .collect()
    }

    /// Walk the whole chain.  Returns the number of records on success.
    pub fn verify_chain(&self) -> Result<u64, AuditError> {
        let mut prev = GENESIS;
        let mut expected_seq: Option<u64> = None;
        let mut count = 0u64;
        for key in self.storage.keys(AUDIT_NAMESPACE)? {
            let bytes = self.storage.read(AUDIT_NAMESPACE, &key)?;
            let record = decode_record(&bytes)?;
            let sequence = record.result.sequence;
            let key_ok = key == record_key(record.result.timestamp, sequence);
            let seq_ok = expected_seq.is_none_or(|e| e == sequence);
            if record.prev_hash != prev || !key_ok || !seq_ok {
                error!("audit: chain broken at cycle {sequence} ({key})");
                return Err(AuditError::ChainBroken { sequence });
            }
            prev = Hash::hash(&bytes);
            expected_seq = Some(sequence + 1);
            count += 1;
        }
        info!("audit: chain verified, {count} records");
        Ok(count)
    }
}
