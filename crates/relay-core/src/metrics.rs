//! Bounded ring of per-request samples and on-demand aggregate
//! reporting. Writes only from the worker; reads from any thread, so
//! the backing buffer sits behind a mutex to avoid torn reads.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct RequestMetrics {
    pub ttft_ms: f64,
    pub queue_ms: f64,
    pub tokens: usize,
    pub batch_size: usize,
    pub device: String,
    pub backend: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DeviceReport {
    pub count: usize,
    pub avg_ttft_ms: f64,
    pub avg_queue_ms: f64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MetricsReport {
    pub count: usize,
    pub avg_ttft_ms: f64,
    pub avg_queue_ms: f64,
    pub by_device: HashMap<String, DeviceReport>,
}

pub struct MetricsCollector {
    max_items: usize,
    items: Mutex<Vec<RequestMetrics>>,
}

impl MetricsCollector {
    pub fn new(max_items: usize) -> Self {
        Self {
            max_items: max_items.max(1),
            items: Mutex::new(Vec::new()),
        }
    }

    /// Appends; if over capacity, discards the oldest prefix so only
    /// the most recent `max_items` survive.
    pub fn record(&self, sample: RequestMetrics) {
        let mut items = self.items.lock().unwrap();
        items.push(sample);
        if items.len() > self.max_items {
            let overflow = items.len() - self.max_items;
            items.drain(0..overflow);
        }
    }

    pub fn snapshot(&self) -> Vec<RequestMetrics> {
        self.items.lock().unwrap().clone()
    }

    pub fn report(&self) -> MetricsReport {
        let items = self.items.lock().unwrap();
        if items.is_empty() {
            return MetricsReport {
                count: 0,
                avg_ttft_ms: 0.0,
                avg_queue_ms: 0.0,
                by_device: HashMap::new(),
            };
        }

        let count = items.len();
        let total_ttft: f64 = items.iter().map(|m| m.ttft_ms).sum();
        let total_queue: f64 = items.iter().map(|m| m.queue_ms).sum();

        let mut by_device: HashMap<String, DeviceReport> = HashMap::new();
        for item in items.iter() {
            let bucket = by_device.entry(item.device.clone()).or_insert(DeviceReport {
                count: 0,
                avg_ttft_ms: 0.0,
                avg_queue_ms: 0.0,
            });
            bucket.count += 1;
            bucket.avg_ttft_ms += item.ttft_ms;
            bucket.avg_queue_ms += item.queue_ms;
        }
        for bucket in by_device.values_mut() {
            let n = bucket.count.max(1) as f64;
            bucket.avg_ttft_ms /= n;
            bucket.avg_queue_ms /= n;
        }

        MetricsReport {
            count,
            avg_ttft_ms: total_ttft / count as f64,
            avg_queue_ms: total_queue / count as f64,
            by_device,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(device: &str, ttft: f64, queue: f64) -> RequestMetrics {
        RequestMetrics {
            ttft_ms: ttft,
            queue_ms: queue,
            tokens: 1,
            batch_size: 1,
            device: device.to_string(),
            backend: "cpu".to_string(),
        }
    }

    #[test]
    fn empty_collector_reports_zero() {
        let collector = MetricsCollector::new(10);
        let report = collector.report();
        assert_eq!(report.count, 0);
        assert_eq!(report.avg_ttft_ms, 0.0);
        assert_eq!(report.avg_queue_ms, 0.0);
        assert!(report.by_device.is_empty());
    }

    #[test]
    fn eviction_keeps_only_the_trailing_max_items_in_arrival_order() {
        let collector = MetricsCollector::new(3);
        for i in 1..=5 {
            collector.record(sample("cpu:0", i as f64, 0.0));
        }
        let snapshot = collector.snapshot();
        let ttfts: Vec<f64> = snapshot.iter().map(|m| m.ttft_ms).collect();
        assert_eq!(ttfts, vec![3.0, 4.0, 5.0]);

        let report = collector.report();
        assert_eq!(report.count, 3);
        assert_eq!(report.avg_ttft_ms, (3.0 + 4.0 + 5.0) / 3.0);
    }

    #[test]
    fn report_by_device_reflects_only_retained_samples() {
        let collector = MetricsCollector::new(3);
        for i in 1..=5 {
            collector.record(sample("cpu:0", i as f64, i as f64));
        }
        let report = collector.report();
        let bucket = report.by_device.get("cpu:0").unwrap();
        assert_eq!(bucket.count, 3);
        assert_eq!(bucket.avg_ttft_ms, (3.0 + 4.0 + 5.0) / 3.0);
    }
}
