use hdrhistogram::Histogram;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Latency distribution of one operation, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub mean: f64,
    pub count: u64,
}

/// Per-operation latency histograms
pub struct LatencyTracker {
    histograms: Mutex<HashMap<&'static str, Histogram<u64>>>,
    total_micros: AtomicU64,
    samples: AtomicU64,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            histograms: Mutex::new(HashMap::new()),
            total_micros: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    pub fn record(&self, operation: &'static str, duration: Duration) {
        let micros = duration.as_micros() as u64;
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);

        let mut histograms = self.histograms.lock().unwrap_or_else(|e| e.into_inner());
        let histogram = match histograms.entry(operation) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => match Histogram::<u64>::new(3) {
                Ok(histogram) => entry.insert(histogram),
                Err(e) => {
                    tracing::warn!("Cannot create latency histogram: {}", e);
                    return;
                }
            },
        };
        let _ = histogram.record(micros);
    }

    pub fn percentiles(&self, operation: &str) -> LatencyPercentiles {
        let histograms = self.histograms.lock().unwrap_or_else(|e| e.into_inner());
        histograms
            .get(operation)
            .map(summarize)
            .unwrap_or_default()
    }

    /// Mean over every recorded sample, all operations combined.
    pub fn mean_micros(&self) -> f64 {
        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        self.total_micros.load(Ordering::Relaxed) as f64 / samples as f64
    }

    pub fn report(&self) -> HashMap<&'static str, LatencyPercentiles> {
        let histograms = self.histograms.lock().unwrap_or_else(|e| e.into_inner());
        histograms
            .iter()
            .map(|(op, histogram)| (*op, summarize(histogram)))
            .collect()
    }

    pub fn reset(&self) {
        self.histograms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.total_micros.store(0, Ordering::Relaxed);
        self.samples.store(0, Ordering::Relaxed);
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn summarize(histogram: &Histogram<u64>) -> LatencyPercentiles {
    LatencyPercentiles {
        p50: histogram.value_at_quantile(0.50) as f64,
        p95: histogram.value_at_quantile(0.95) as f64,
        p99: histogram.value_at_quantile(0.99) as f64,
        mean: histogram.mean(),
        count: histogram.len(),
    }
}
