//! Observability utilities: Prometheus gauges for the request engine's
//! telemetry (queue depth, last batch size, KV cache counters) and
//! optional GPU gauges polled from NVML.
//!
//! The core's own `MetricsCollector` (relay-core) is the source of
//! per-request samples; this crate mirrors a subset of that state into
//! Prometheus gauges for the transport layer's `/metrics` endpoint.

use once_cell::sync::Lazy;
use prometheus::{Gauge, IntGauge};

static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("relay_queue_depth", "Pending requests in the batching queue").unwrap()
});
static LAST_BATCH_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("relay_last_batch_size", "Size of the most recently processed batch").unwrap()
});
static KV_CACHED_TOKENS: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("relay_kv_cached_tokens", "Prefix tokens currently resident in the KV cache").unwrap()
});
static KV_HANDOFFS: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("relay_kv_handoffs_total", "KV-cache handoffs along the shard chain").unwrap()
});
static KV_OFFLOADS: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("relay_kv_offloads_total", "KV-cache offloads along the shard chain").unwrap()
});

static GPU_UTIL: Lazy<Gauge> = Lazy::new(|| {
    prometheus::register_gauge!("relay_gpu_utilization", "GPU utilization percent").unwrap()
});
static GPU_MEM_USED: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("relay_gpu_memory_bytes", "GPU memory used (bytes)").unwrap()
});
static GPU_TEMP: Lazy<Gauge> = Lazy::new(|| {
    prometheus::register_gauge!("relay_gpu_temperature_celsius", "GPU temperature in C").unwrap()
});

/// Registers all gauges. Must run once before the first scrape; safe
/// to call more than once (the statics are only ever initialised on
/// first touch).
pub fn init() {
    let _ = &*QUEUE_DEPTH;
    let _ = &*LAST_BATCH_SIZE;
    let _ = &*KV_CACHED_TOKENS;
    let _ = &*KV_HANDOFFS;
    let _ = &*KV_OFFLOADS;
    let _ = &*GPU_UTIL;
    let _ = &*GPU_MEM_USED;
    let _ = &*GPU_TEMP;
}

/// Mirrors a snapshot of the engine's queue depth and KV counters into
/// the Prometheus gauges. Called by the transport layer on every
/// `/metrics` scrape rather than on a timer, since the engine already
/// computes these on demand.
pub fn observe_engine(queue_depth: usize, last_batch_size: usize, kv: &relay_core::KVCacheStats) {
    QUEUE_DEPTH.set(queue_depth as i64);
    LAST_BATCH_SIZE.set(last_batch_size as i64);
    KV_CACHED_TOKENS.set(kv.cached_tokens as i64);
    KV_HANDOFFS.set(kv.handoffs as i64);
    KV_OFFLOADS.set(kv.offloads as i64);
}

/// Spawns a background poller for NVML-based GPU gauges. A no-op
/// unless built with the `nvidia` feature; absent GPUs or NVML
/// failures simply leave the gauges at zero.
pub fn spawn_gpu_polling() {
    #[cfg(feature = "nvidia")]
    tokio::spawn(async move {
        let nvml = match nvml_wrapper::Nvml::init() {
            Ok(n) => n,
            Err(_) => return,
        };
        let device = match nvml.device_by_index(0) {
            Ok(d) => d,
            Err(_) => return,
        };
        loop {
            if let Ok(util) = device.utilization_rates() {
                GPU_UTIL.set(util.gpu as f64);
            }
            if let Ok(mem) = device.memory_info() {
                GPU_MEM_USED.set(mem.used as i64);
            }
            if let Ok(temp) =
                device.temperature(nvml_wrapper::enum_wrappers::device::TemperatureSensor::Gpu)
            {
                GPU_TEMP.set(temp as f64);
            }
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }
    });
}
