//! Counters owned by one worker instance.
//!
//! Nothing here is process-global: each worker gets its own [`WorkerMetrics`],
//! [`LcbExceptionTally`] and [`LatencyHistogram`], shared through `Arc` with the
//! ingress side for stats requests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::collab::LatencyRecorder;

#[derive(Default)]
pub struct WorkerMetrics {
    pub on_update_success: AtomicU64,
    pub on_update_failure: AtomicU64,
    pub on_delete_success: AtomicU64,
    pub on_delete_failure: AtomicU64,
    pub timer_success: AtomicU64,
    pub timer_failure: AtomicU64,
    pub timer_create_failure: AtomicU64,
    pub timeout_count: AtomicU64,
    pub value_conversion_failure: AtomicU64,
    pub suppressed_duplicates: AtomicU64,
    pub filtered_timers: AtomicU64,
    pub checkpoint_failure_count: AtomicU64,
    pub bucket_op_exception_count: AtomicU64,
    pub messages_processed: AtomicU64,
    pub dcp_mutation_msg_counter: AtomicU64,
    pub dcp_delete_msg_counter: AtomicU64,
    pub timer_msg_counter: AtomicU64,
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl WorkerMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failure_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "on_update_failure": read(&self.on_update_failure),
            "on_delete_failure": read(&self.on_delete_failure),
            "timer_failure": read(&self.timer_failure),
            "timer_create_failure": read(&self.timer_create_failure),
            "timeout_count": read(&self.timeout_count),
            "value_conversion_failure": read(&self.value_conversion_failure),
            "checkpoint_failure_count": read(&self.checkpoint_failure_count),
            "bucket_op_exception_count": read(&self.bucket_op_exception_count),
        })
    }

    pub fn execution_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "on_update_success": read(&self.on_update_success),
            "on_delete_success": read(&self.on_delete_success),
            "timer_success": read(&self.timer_success),
            "suppressed_duplicates": read(&self.suppressed_duplicates),
            "filtered_timers": read(&self.filtered_timers),
            "messages_processed": read(&self.messages_processed),
            "dcp_mutation_msg_counter": read(&self.dcp_mutation_msg_counter),
            "dcp_delete_msg_counter": read(&self.dcp_delete_msg_counter),
            "timer_msg_counter": read(&self.timer_msg_counter),
        })
    }
}

/// Provider error code -> occurrences. Fed by every data-access handle.
#[derive(Default)]
pub struct LcbExceptionTally {
    counts: Mutex<BTreeMap<i32, u64>>,
}

impl LcbExceptionTally {
    pub fn add(&self, code: i32) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        *counts.entry(code).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> BTreeMap<i32, u64> {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .snapshot()
            .into_iter()
            .map(|(code, count)| (code.to_string(), count.into()))
            .collect();
        serde_json::Value::Object(map)
    }
}

const HIST_FROM_US: u64 = 100;
const HIST_TILL_US: u64 = 10_000_000;
const HIST_WIDTH_US: u64 = 1_000;

/// Invocation latency, 1ms buckets from 100us to 10s. The last bucket is open-ended.
pub struct LatencyHistogram {
    buckets: Box<[AtomicU64]>,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        let count = ((HIST_TILL_US - HIST_FROM_US) / HIST_WIDTH_US + 1) as usize;
        let buckets = (0..count)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { buckets }
    }
}

impl LatencyHistogram {
    fn bucket_index(&self, micros: u64) -> usize {
        let offset = micros.saturating_sub(HIST_FROM_US) / HIST_WIDTH_US;
        (offset as usize).min(self.buckets.len() - 1)
    }

    /// Non-empty buckets keyed by their lower bound in microseconds.
    pub fn snapshot(&self) -> BTreeMap<u64, u64> {
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(index, bucket)| {
                let count = bucket.load(Ordering::Relaxed);
                (count > 0).then(|| {
                    let lower = if index == 0 {
                        0
                    } else {
                        HIST_FROM_US + index as u64 * HIST_WIDTH_US
                    };
                    (lower, count)
                })
            })
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .snapshot()
            .into_iter()
            .map(|(lower, count)| (lower.to_string(), count.into()))
            .collect();
        serde_json::Value::Object(map)
    }
}

impl LatencyRecorder for LatencyHistogram {
    fn record(&self, duration_nanos: u64) {
        let index = self.bucket_index(duration_nanos / 1_000);
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_counts_per_code() {
        let tally = LcbExceptionTally::default();
        tally.add(13);
        tally.add(13);
        tally.add(23);
        let snapshot = tally.snapshot();
        assert_eq!(snapshot.get(&13), Some(&2));
        assert_eq!(snapshot.get(&23), Some(&1));
        assert_eq!(tally.to_json()["13"], 2);
    }

    #[test]
    fn tally_survives_a_poisoned_lock() {
        let tally = std::sync::Arc::new(LcbExceptionTally::default());
        tally.add(13);
        let poisoner = std::sync::Arc::clone(&tally);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.counts.lock().expect("lock");
            panic!("poison the tally");
        })
        .join();
        assert!(tally.counts.is_poisoned());

        tally.add(13);
        assert_eq!(tally.snapshot().get(&13), Some(&2));
    }

    #[test]
    fn histogram_buckets_by_millisecond() {
        let histogram = LatencyHistogram::default();
        histogram.record(50_000); // 50us
        histogram.record(2_500_000); // 2.5ms
        histogram.record(60_000_000_000); // 60s, clamps
        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.get(&0), Some(&1));
        assert_eq!(snapshot.get(&2_100), Some(&1));
        assert_eq!(snapshot.values().sum::<u64>(), 3);
    }

    #[test]
    fn stats_expose_counters() {
        let metrics = WorkerMetrics::default();
        WorkerMetrics::incr(&metrics.timeout_count);
        WorkerMetrics::incr(&metrics.on_update_success);
        assert_eq!(metrics.failure_stats()["timeout_count"], 1);
        assert_eq!(metrics.execution_stats()["on_update_success"], 1);
    }
}
