//! The sync state record.
//!
//! Sync bookkeeping is an explicit versioned record rather than
//! ambient mutable state: read at the start of a cycle, transformed by
//! applying a plan, and persisted atomically at commit. No partial
//! write is ever visible to the next cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tally_protocol::{CompanyRecord, EntityKind, LedgerRecord, VoucherRecord};
use tracing::warn;

/// A record the connector has observed, with its staleness marker.
///
/// Stale means "present in an earlier fetch, absent now". Stale records
/// are never deleted; deletion requires explicit confirmation, so a
/// transient Tally outage returning an empty list cannot destroy data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Known<T> {
    /// The record as last observed.
    pub record: T,
    /// True when the last fetch no longer contained this GUID.
    pub stale: bool,
}

impl<T> Known<T> {
    /// Wraps a freshly observed record.
    pub fn fresh(record: T) -> Self {
        Self {
            record,
            stale: false,
        }
    }
}

/// Process-wide record of the last successful sync.
///
/// `version` increases by one per committed cycle; `last_synced` holds
/// the fetch timestamp of the last committed cycle per entity type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncStateRecord {
    /// Monotonic commit counter.
    pub version: u64,
    /// Last successful sync timestamp per entity type.
    pub last_synced: BTreeMap<EntityKind, DateTime<Utc>>,
    /// Companies observed so far, by GUID.
    pub companies: BTreeMap<String, Known<CompanyRecord>>,
    /// Ledgers observed so far, by GUID.
    pub ledgers: BTreeMap<String, Known<LedgerRecord>>,
    /// Vouchers observed so far, by GUID.
    pub vouchers: BTreeMap<String, Known<VoucherRecord>>,
}

impl SyncStateRecord {
    /// Total number of known records across entity types.
    pub fn len(&self) -> usize {
        self.companies.len() + self.ledgers.len() + self.vouchers.len()
    }

    /// True when nothing has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes the record for persistence.
    pub fn to_json(&self) -> String {
        // The record only contains maps and plain values; serialization
        // cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Deserializes a persisted record.
    ///
    /// Malformed state is treated as "no previous state": everything in
    /// the next fetch will look new, which is safe because the plan only
    /// upserts.
    pub fn from_json(raw: &str) -> Self {
        match serde_json::from_str(raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "malformed sync state, treating as empty");
                SyncStateRecord::default()
            }
        }
    }
}
