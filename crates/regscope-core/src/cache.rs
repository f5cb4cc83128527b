//! Timestamped cache of observed register values
//!
//! Entries only come from completed device transfers. An address without an
//! entry has never been observed, which is different from a cached zero.
//!
//! Every stored entry receives a strictly increasing sequence number and a
//! timestamp that never goes backwards, so the most recent observation of an
//! address is always the one held here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One observed register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterValue {
    /// Register address
    #[serde(with = "crate::register::hex_address")]
    pub address: u16,
    /// Raw byte read from or written to the device
    pub raw: u8,
    /// When the transfer completed
    pub observed_at: DateTime<Utc>,
    /// Position of this observation in the cache's history
    pub sequence: u64,
}

/// Cache of the last observed raw value of each register
#[derive(Debug, Clone, Default)]
pub struct ValueCache {
    entries: BTreeMap<u16, RegisterValue>,
    sequence: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

impl ValueCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed observation of `raw` at `address`
    pub fn record(&mut self, address: u16, raw: u8) -> RegisterValue {
        self.record_at(address, raw, Utc::now())
    }

    /// Record an observation with an explicit completion time.
    ///
    /// A timestamp earlier than the previous observation is clamped to it.
    pub fn record_at(&mut self, address: u16, raw: u8, at: DateTime<Utc>) -> RegisterValue {
        let observed_at = match self.last_timestamp {
            Some(last) if at < last => last,
            _ => at,
        };
        self.last_timestamp = Some(observed_at);
        self.sequence += 1;

        let value = RegisterValue {
            address,
            raw,
            observed_at,
            sequence: self.sequence,
        };
        self.entries.insert(address, value);
        value
    }

    /// Last observation of `address`, if any
    pub fn get(&self, address: u16) -> Option<&RegisterValue> {
        self.entries.get(&address)
    }

    /// Last raw byte of `address`, if any
    pub fn raw(&self, address: u16) -> Option<u8> {
        self.entries.get(&address).map(|v| v.raw)
    }

    /// All observations ordered by address
    pub fn values(&self) -> impl Iterator<Item = &RegisterValue> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every observation
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
