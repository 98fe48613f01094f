use std::fmt;
use std::time::Instant;

use parking_lot::Mutex;

/// Fixed-bucket histogram for read-barrier slow-path times. Values beyond
/// the last bucket land in it.
pub struct Histogram {
    name: &'static str,
    bucket_width: u64,
    buckets: Vec<u64>,
    sample_count: u64,
    total: u64,
    min: u64,
    max: u64,
}

impl Histogram {
    pub fn new(name: &'static str, bucket_width: u64, num_buckets: usize) -> Self {
        Self {
            name,
            bucket_width,
            buckets: vec![0; num_buckets],
            sample_count: 0,
            total: 0,
            min: u64::MAX,
            max: 0,
        }
    }

    pub fn add_value(&mut self, value: u64) {
        let index = ((value / self.bucket_width) as usize).min(self.buckets.len() - 1);
        self.buckets[index] += 1;
        self.sample_count += 1;
        self.total += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn adjust_and_add_value(&mut self, value: u64) {
        if value > 0 {
            self.add_value(value);
        }
    }

    pub fn sample_size(&self) -> u64 {
        self.sample_count
    }

    pub fn mean(&self) -> u64 {
        if self.sample_count == 0 {
            0
        } else {
            self.total / self.sample_count
        }
    }

    pub fn percentile(&self, per: f64) -> u64 {
        let target = (self.sample_count as f64 * per).ceil() as u64;
        let mut seen = 0;
        for (i, &count) in self.buckets.iter().enumerate() {
            seen += count;
            if seen >= target {
                return (i as u64 + 1) * self.bucket_width;
            }
        }
        self.max
    }
}

impl fmt::Display for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: samples={} mean={}ns min={}ns max={}ns p50<={}ns p99<={}ns",
            self.name,
            self.sample_count,
            self.mean(),
            if self.sample_count == 0 { 0 } else { self.min },
            self.max,
            self.percentile(0.50),
            self.percentile(0.99),
        )?;
        for (i, &count) in self.buckets.iter().enumerate() {
            if count != 0 {
                writeln!(
                    f,
                    "  [{:>6}ns..{:>6}ns): {}",
                    i as u64 * self.bucket_width,
                    (i as u64 + 1) * self.bucket_width,
                    count
                )?;
            }
        }
        Ok(())
    }
}

/// Per-cycle phase timings, recorded by scoped guards.
pub struct TimingLogger {
    timings: Mutex<Vec<(&'static str, u64)>>,
}

impl TimingLogger {
    pub fn new() -> Self {
        Self {
            timings: Mutex::new(Vec::new()),
        }
    }

    pub fn reset(&self) {
        self.timings.lock().clear();
    }

    pub fn scoped(&self, name: &'static str) -> ScopedTiming<'_> {
        ScopedTiming {
            logger: self,
            name,
            start: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        self.timings.lock().clone()
    }

    pub fn log(&self) {
        for (name, ns) in self.timings.lock().iter() {
            log::debug!("{}: {:.3}ms", name, *ns as f64 / 1_000_000.0);
        }
    }
}

impl Default for TimingLogger {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ScopedTiming<'a> {
    logger: &'a TimingLogger,
    name: &'static str,
    start: Instant,
}

impl Drop for ScopedTiming<'_> {
    fn drop(&mut self) {
        let ns = self.start.elapsed().as_nanos() as u64;
        self.logger.timings.lock().push((self.name, ns));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_and_percentiles() {
        let mut h = Histogram::new("test", 500, 32);
        for v in [100u64, 400, 600, 1200, 40_000] {
            h.add_value(v);
        }
        assert_eq!(h.sample_size(), 5);
        assert_eq!(h.mean(), (100 + 400 + 600 + 1200 + 40_000) / 5);
        // The overflow value lands in the last bucket.
        assert_eq!(h.percentile(1.0), 32 * 500);
        let rendered = h.to_string();
        assert!(rendered.contains("samples=5"));
    }

    #[test]
    fn timing_logger_records_scopes() {
        let logger = TimingLogger::new();
        {
            let _t = logger.scoped("phase one");
        }
        {
            let _t = logger.scoped("phase two");
        }
        let snapshot = logger.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, "phase one");
        assert_eq!(snapshot[1].0, "phase two");
        logger.reset();
        assert!(logger.snapshot().is_empty());
    }
}
