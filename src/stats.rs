use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared pipeline counters.
///
/// Every update is mirrored to the global `metrics` recorder (if one is
/// installed) under a `perfflux_` prefix.
#[derive(Debug, Default)]
pub struct PipelineStats {
    lines_parsed: AtomicU64,
    parse_errors: AtomicU64,
    files_processed: AtomicU64,
    file_errors: AtomicU64,
    points_enqueued: AtomicU64,
    points_delivered: AtomicU64,
    batches_delivered: AtomicU64,
    batches_dumped: AtomicU64,
    points_dumped: AtomicU64,
    batches_dropped: AtomicU64,
    points_dropped: AtomicU64,
    points_replayed: AtomicU64,
    dump_failures: AtomicU64,

    queue_depth: AtomicU64,
    pool_size: AtomicU64,
    dump_bytes: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub lines_parsed: u64,
    pub parse_errors: u64,
    pub files_processed: u64,
    pub file_errors: u64,
    pub points_enqueued: u64,
    pub points_delivered: u64,
    pub batches_delivered: u64,
    pub batches_dumped: u64,
    pub points_dumped: u64,
    pub batches_dropped: u64,
    pub points_dropped: u64,
    pub points_replayed: u64,
    pub dump_failures: u64,
    pub queue_depth: u64,
    pub pool_size: u64,
    pub dump_bytes: u64,
}

fn add(counter: &AtomicU64, name: &'static str, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
    metrics::counter!(name).increment(n);
}

#[allow(clippy::cast_precision_loss)]
fn set(gauge: &AtomicU64, name: &'static str, value: u64) {
    gauge.store(value, Ordering::Relaxed);
    metrics::gauge!(name).set(value as f64);
}

fn as_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

impl PipelineStats {
    pub fn record_file(&self, lines: usize, errors: usize) {
        add(&self.files_processed, "perfflux_files_processed", 1);
        add(&self.lines_parsed, "perfflux_lines_parsed", as_u64(lines));
        add(&self.parse_errors, "perfflux_parse_errors", as_u64(errors));
    }

    pub fn record_file_error(&self) {
        add(&self.file_errors, "perfflux_file_errors", 1);
    }

    pub fn record_enqueued(&self, points: usize) {
        add(&self.points_enqueued, "perfflux_points_enqueued", as_u64(points));
    }

    pub fn record_delivered(&self, points: usize) {
        add(&self.batches_delivered, "perfflux_batches_delivered", 1);
        add(&self.points_delivered, "perfflux_points_delivered", as_u64(points));
    }

    pub fn record_dumped(&self, points: usize) {
        add(&self.batches_dumped, "perfflux_batches_dumped", 1);
        add(&self.points_dumped, "perfflux_points_dumped", as_u64(points));
    }

    pub fn record_dropped(&self, points: usize) {
        add(&self.batches_dropped, "perfflux_batches_dropped", 1);
        add(&self.points_dropped, "perfflux_points_dropped", as_u64(points));
    }

    pub fn record_replayed(&self, points: usize) {
        add(&self.points_replayed, "perfflux_points_replayed", as_u64(points));
    }

    pub fn record_dump_failure(&self, points: usize) {
        add(&self.dump_failures, "perfflux_dump_failures", 1);
        add(&self.points_dropped, "perfflux_points_dropped", as_u64(points));
    }

    /// Replay found corrupt records.
    pub fn record_corrupt(&self, records: usize) {
        add(&self.parse_errors, "perfflux_parse_errors", as_u64(records));
    }

    pub fn set_queue_depth(&self, depth: usize) {
        set(&self.queue_depth, "perfflux_queue_depth", as_u64(depth));
    }

    pub fn set_pool_size(&self, workers: usize) {
        set(&self.pool_size, "perfflux_pool_size", as_u64(workers));
    }

    pub fn set_dump_bytes(&self, bytes: u64) {
        set(&self.dump_bytes, "perfflux_dump_bytes", bytes);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let load = |value: &AtomicU64| value.load(Ordering::Relaxed);

        StatusSnapshot {
            lines_parsed: load(&self.lines_parsed),
            parse_errors: load(&self.parse_errors),
            files_processed: load(&self.files_processed),
            file_errors: load(&self.file_errors),
            points_enqueued: load(&self.points_enqueued),
            points_delivered: load(&self.points_delivered),
            batches_delivered: load(&self.batches_delivered),
            batches_dumped: load(&self.batches_dumped),
            points_dumped: load(&self.points_dumped),
            batches_dropped: load(&self.batches_dropped),
            points_dropped: load(&self.points_dropped),
            points_replayed: load(&self.points_replayed),
            dump_failures: load(&self.dump_failures),
            queue_depth: load(&self.queue_depth),
            pool_size: load(&self.pool_size),
            dump_bytes: load(&self.dump_bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use expect_test::expect;

    use super::*;

    #[test]
    fn snapshot_serializes() {
        let stats = PipelineStats::default();
        stats.record_file(10, 2);
        stats.record_enqueued(8);
        stats.record_delivered(5);
        stats.record_dumped(3);
        stats.record_replayed(3);
        stats.record_delivered(3);
        stats.set_pool_size(2);

        expect![[r#"{"lines_parsed":10,"parse_errors":2,"files_processed":1,"file_errors":0,"points_enqueued":8,"points_delivered":8,"batches_delivered":2,"batches_dumped":1,"points_dumped":3,"batches_dropped":0,"points_dropped":0,"points_replayed":3,"dump_failures":0,"queue_depth":0,"pool_size":2,"dump_bytes":0}"#]]
            .assert_eq(&serde_json::to_string(&stats.snapshot()).unwrap());
    }
}
