//! Rolling batch counters and the bounded error ring (spec §4.1).

use std::time::{
    Duration,
    SystemTime,
};

use serde::{
    Deserialize,
    Serialize,
};

/// Maximum number of errors retained per index, chronologically.
pub const MAX_RECORDED_ERRORS: usize = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexStats {
    pub batch_count: u64,
    pub map_count: u64,
    pub tombstone_count: u64,
    pub write_error_count: u64,
    pub analyzer_error_count: u64,
    pub last_indexing_time_millis: Option<u64>,
}

/// Counters accumulated while running a single batch, merged into
/// [`IndexStats`] by [`crate::storage::IndexStorage::update_stats`].
#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub map_count: u64,
    pub tombstone_count: u64,
    pub write_errors: u64,
    pub analyzer_errors: u64,
}

impl IndexStats {
    /// Bumps the error counter alone, for a write error observed outside
    /// a committed batch (the batch that triggered it was discarded).
    pub fn record_write_error(&mut self) {
        self.write_error_count += 1;
    }

    pub fn merge_batch(&mut self, batch_start: SystemTime, duration: Duration, batch: &BatchStats) {
        self.batch_count += 1;
        self.map_count += batch.map_count;
        self.tombstone_count += batch.tombstone_count;
        self.write_error_count += batch.write_errors;
        self.analyzer_error_count += batch.analyzer_errors;
        let finished = batch_start + duration;
        let finished_millis = finished
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.last_indexing_time_millis = Some(finished_millis);
    }
}

/// One entry in the bounded error ring (spec §3, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordedError {
    pub timestamp_millis: u64,
    pub action: String,
    pub message: String,
}

/// A fixed-capacity, chronologically-ordered ring of the most recent
/// errors. Oldest entries are evicted first.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorRing {
    entries: std::collections::VecDeque<RecordedError>,
}

impl ErrorRing {
    pub fn push(&mut self, error: RecordedError) {
        self.entries.push_back(error);
        while self.entries.len() > MAX_RECORDED_ERRORS {
            self.entries.pop_front();
        }
    }

    /// Up to the last [`MAX_RECORDED_ERRORS`] errors, oldest first.
    pub fn entries(&self) -> Vec<RecordedError> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_ring_evicts_oldest_past_capacity() {
        let mut ring = ErrorRing::default();
        for i in 0..(MAX_RECORDED_ERRORS + 10) {
            ring.push(RecordedError {
                timestamp_millis: i as u64,
                action: "map".to_string(),
                message: format!("error {i}"),
            });
        }
        let entries = ring.entries();
        assert_eq!(entries.len(), MAX_RECORDED_ERRORS);
        assert_eq!(entries.first().unwrap().timestamp_millis, 10);
        assert_eq!(entries.last().unwrap().timestamp_millis, (MAX_RECORDED_ERRORS + 9) as u64);
    }
}
