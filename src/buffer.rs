//! Per-source bounded sample buffers.
//!
//! Each monitored subject owns one [`SignalBuffers`] set with a ring buffer
//! per data source. Buffers are append-only with FIFO eviction, so a tick can
//! take a consistent snapshot by copying the current windows at tick start.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Timestamp in milliseconds
pub type Timestamp = u64;

/// A single observation. Immutable once appended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalSample {
    pub value: f64,
    pub timestamp: Timestamp,
}

/// Result of offering a sample to a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Accepted after evicting the oldest sample
    Evicted,
    /// Dropped: timestamp older than the newest buffered sample
    OutOfOrder,
    UnknownSource,
    UnknownSubject,
}

impl PushOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PushOutcome::Accepted | PushOutcome::Evicted)
    }
}

/// Bounded, time-ordered ring buffer for one source.
#[derive(Debug, Clone)]
pub struct SignalBuffer {
    source_id: String,
    capacity: usize,
    samples: VecDeque<SignalSample>,
    /// Samples dropped since the last snapshot (non-finite or out of order)
    missing: u32,
}

impl SignalBuffer {
    pub fn new(source_id: &str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            source_id: source_id.to_string(),
            capacity,
            samples: VecDeque::with_capacity(capacity),
            missing: 0,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.samples.back().map(|s| s.timestamp)
    }

    /// Append a sample, evicting the oldest when full.
    ///
    /// Ties on timestamp are permitted; earlier timestamps are dropped and
    /// counted as missing.
    pub fn push(&mut self, value: f64, timestamp: Timestamp) -> PushOutcome {
        if let Some(last) = self.last_timestamp() {
            if timestamp < last {
                self.missing = self.missing.saturating_add(1);
                return PushOutcome::OutOfOrder;
            }
        }

        let mut outcome = PushOutcome::Accepted;
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
            outcome = PushOutcome::Evicted;
        }
        self.samples.push_back(SignalSample { value, timestamp });
        outcome
    }

    /// Count a sample that never made it into the buffer.
    pub fn mark_missing(&mut self) {
        self.missing = self.missing.saturating_add(1);
    }

    pub fn missing(&self) -> u32 {
        self.missing
    }

    /// Most recent `size` samples, oldest first. Returns fewer when short.
    pub fn window(&self, size: usize) -> Vec<SignalSample> {
        let skip = self.samples.len().saturating_sub(size);
        self.samples.iter().skip(skip).copied().collect()
    }

    /// Copy the current window and reset the missing counter.
    pub fn take_window(&mut self, size: usize) -> SignalWindow {
        let window = SignalWindow {
            source_id: self.source_id.clone(),
            samples: self.window(size),
            missing: self.missing,
        };
        self.missing = 0;
        window
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.missing = 0;
    }
}

/// Snapshot of one source's recent samples, handed to a feature extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalWindow {
    pub source_id: String,
    pub samples: Vec<SignalSample>,
    /// Samples dropped since the previous snapshot
    pub missing: u32,
}

impl SignalWindow {
    pub fn new(source_id: &str, samples: Vec<SignalSample>) -> Self {
        Self {
            source_id: source_id.to_string(),
            samples,
            missing: 0,
        }
    }

    /// Convenience constructor with synthetic 1ms-spaced timestamps.
    pub fn from_values(source_id: &str, values: &[f64]) -> Self {
        let samples = values
            .iter()
            .enumerate()
            .map(|(i, &value)| SignalSample {
                value,
                timestamp: i as Timestamp,
            })
            .collect();
        Self::new(source_id, samples)
    }

    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// All buffers belonging to one subject, keyed by source id.
#[derive(Debug, Clone)]
pub struct SignalBuffers {
    capacity: usize,
    buffers: BTreeMap<String, SignalBuffer>,
}

impl SignalBuffers {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffers: BTreeMap::new(),
        }
    }

    /// Register a source. No-op when it already exists.
    pub fn add_source(&mut self, source_id: &str) {
        let capacity = self.capacity;
        self.buffers
            .entry(source_id.to_string())
            .or_insert_with(|| SignalBuffer::new(source_id, capacity));
    }

    pub fn has_source(&self, source_id: &str) -> bool {
        self.buffers.contains_key(source_id)
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.buffers.keys().map(|k| k.as_str())
    }

    pub fn get(&self, source_id: &str) -> Option<&SignalBuffer> {
        self.buffers.get(source_id)
    }

    pub fn push(&mut self, source_id: &str, value: f64, timestamp: Timestamp) -> PushOutcome {
        match self.buffers.get_mut(source_id) {
            Some(buffer) => buffer.push(value, timestamp),
            None => PushOutcome::UnknownSource,
        }
    }

    pub fn mark_missing(&mut self, source_id: &str) {
        if let Some(buffer) = self.buffers.get_mut(source_id) {
            buffer.mark_missing();
        }
    }

    /// Recent samples for a source; empty for unknown sources.
    pub fn window(&self, source_id: &str, size: usize) -> Vec<SignalSample> {
        self.buffers
            .get(source_id)
            .map(|b| b.window(size))
            .unwrap_or_default()
    }

    /// Snapshot every source's window, resetting missing counters.
    pub fn snapshot(&mut self, size: usize) -> Vec<SignalWindow> {
        self.buffers
            .values_mut()
            .map(|b| b.take_window(size))
            .collect()
    }

    /// Change capacity for future and existing buffers, trimming oldest samples.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        for buffer in self.buffers.values_mut() {
            buffer.capacity = self.capacity;
            while buffer.samples.len() > buffer.capacity {
                buffer.samples.pop_front();
            }
        }
    }
}
