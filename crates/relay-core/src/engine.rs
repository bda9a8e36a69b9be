//! The Request Engine: batching queue, worker loop, and per-item
//! orchestration of the device registry, shard planner, KV cache and
//! backend dispatcher.

use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_backend::BackendDispatcher;
use relay_common::{RelayError, Result};
use tokio::sync::{mpsc, oneshot};

use crate::device::DeviceRegistry;
use crate::kv::KvCacheManager;
use crate::metrics::{MetricsCollector, MetricsReport, RequestMetrics};
use crate::runner::EchoRunner;
use crate::scheduler::Scheduler;
use crate::shard::{ShardPlan, ShardPlanner};

/// Outcome returned to the caller of `handle_chat`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatOutcome {
    pub reply: String,
    pub meta: RequestMeta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestMeta {
    pub device: String,
    pub backend: String,
    pub queue_ms: f64,
    pub ttft_ms: f64,
    pub batch_size: usize,
}

struct RequestItem {
    prompt: String,
    enqueue_time: Instant,
    respond: oneshot::Sender<ChatOutcome>,
}

#[derive(Debug, serde::Serialize)]
pub struct EngineReport {
    pub stats: MetricsReport,
    pub queue_depth: usize,
    pub kv: crate::kv::KVCacheStats,
    pub shard_plan: ShardPlanReport,
}

#[derive(Debug, serde::Serialize)]
pub struct ShardPlanReport {
    pub placements: Vec<String>,
    pub layer_ranges: Vec<(usize, usize)>,
}

/// The central orchestrator. Owns the queue, worker task, KV cache,
/// metrics collector and shard planner exclusively; shares a read-only
/// registry and the dispatcher.
pub struct RequestEngine {
    tx: mpsc::UnboundedSender<RequestItem>,
    registry: Arc<DeviceRegistry>,
    dispatcher: Arc<BackendDispatcher>,
    metrics: Arc<MetricsCollector>,
    kv: Arc<KvCacheManager>,
    shard_planner: Arc<ShardPlanner>,
    total_layers: i64,
    queue_depth: Arc<std::sync::atomic::AtomicUsize>,
}

impl RequestEngine {
    /// Constructs the engine, validates the shard plan up front (a
    /// configuration error here is fatal), and spawns the single
    /// long-lived worker.
    pub fn new(
        registry: DeviceRegistry,
        dispatcher: BackendDispatcher,
        batch_size: usize,
        batch_wait_ms: u64,
        metrics_max_items: usize,
        total_layers: i64,
    ) -> Result<Self> {
        let planner = ShardPlanner::new();
        // Fail fast at construction per the shard planner's open question.
        planner.plan(&registry.list(), total_layers)?;

        let registry = Arc::new(registry);
        let dispatcher = Arc::new(dispatcher);
        let metrics = Arc::new(MetricsCollector::new(metrics_max_items));
        let kv = Arc::new(KvCacheManager::new());
        let shard_planner = Arc::new(planner);
        let queue_depth = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let (tx, rx) = mpsc::unbounded_channel::<RequestItem>();
        let batch_size = batch_size.max(1);
        let batch_wait = Duration::from_millis(batch_wait_ms);

        tokio::spawn(Self::worker_loop(
            rx,
            registry.clone(),
            dispatcher.clone(),
            metrics.clone(),
            kv.clone(),
            shard_planner.clone(),
            total_layers,
            batch_size,
            batch_wait,
            queue_depth.clone(),
        ));

        Ok(Self {
            tx,
            registry,
            dispatcher,
            metrics,
            kv,
            shard_planner,
            total_layers,
            queue_depth,
        })
    }

    /// Allocates a result sink, stamps the enqueue time, pushes the
    /// item and blocks on the sink's resolution.
    pub async fn handle_chat(&self, prompt: String) -> ChatOutcome {
        let (respond, rx) = oneshot::channel();
        let item = RequestItem {
            prompt,
            enqueue_time: Instant::now(),
            respond,
        };
        self.queue_depth
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        // An error here means the worker task is gone; resolve with an
        // internal error rather than panicking the caller.
        if self.tx.send(item).is_err() {
            return ChatOutcome {
                reply: RelayError::Internal("engine worker is not running".to_string()).to_string(),
                meta: RequestMeta {
                    device: "none".to_string(),
                    backend: "none".to_string(),
                    queue_ms: 0.0,
                    ttft_ms: 0.0,
                    batch_size: 0,
                },
            };
        }
        rx.await.unwrap_or_else(|_| ChatOutcome {
            reply: "internal error: worker dropped the request".to_string(),
            meta: RequestMeta {
                device: "none".to_string(),
                backend: "none".to_string(),
                queue_ms: 0.0,
                ttft_ms: 0.0,
                batch_size: 0,
            },
        })
    }

    pub fn metrics_report(&self) -> EngineReport {
        let plan = self
            .shard_planner
            .plan(&self.registry.list(), self.total_layers)
            .unwrap_or_default();
        EngineReport {
            stats: self.metrics.report(),
            queue_depth: self.queue_depth.load(std::sync::atomic::Ordering::Relaxed),
            kv: self.kv.stats(),
            shard_plan: ShardPlanReport {
                placements: plan.placements,
                layer_ranges: plan.layer_ranges,
            },
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Batch size of the most recently processed request, or 0 before
    /// any request has been handled. Ambient observability only; not
    /// part of the engine's data model.
    pub fn last_batch_size(&self) -> usize {
        self.metrics.snapshot().last().map(|m| m.batch_size).unwrap_or(0)
    }

    /// Shared handle to the dispatcher, for transport surfaces (e.g. a
    /// streaming HTTP endpoint) that bypass the batching queue.
    pub fn dispatcher(&self) -> Arc<BackendDispatcher> {
        self.dispatcher.clone()
    }

    #[allow(clippy::too_many_arguments)]
    async fn worker_loop(
        mut rx: mpsc::UnboundedReceiver<RequestItem>,
        registry: Arc<DeviceRegistry>,
        dispatcher: Arc<BackendDispatcher>,
        metrics: Arc<MetricsCollector>,
        kv: Arc<KvCacheManager>,
        shard_planner: Arc<ShardPlanner>,
        total_layers: i64,
        batch_size: usize,
        batch_wait: Duration,
        queue_depth: Arc<std::sync::atomic::AtomicUsize>,
    ) {
        loop {
            let Some(first) = rx.recv().await else {
                tracing::info!(target: "engine", "request channel closed, worker exiting");
                return;
            };
            queue_depth.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            let mut batch = vec![first];
            let deadline = Instant::now() + batch_wait;

            while batch.len() < batch_size {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, rx.recv()).await {
                    Ok(Some(item)) => {
                        queue_depth.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                        batch.push(item);
                    }
                    Ok(None) | Err(_) => break,
                }
            }

            tracing::debug!(target: "engine", batch_size = batch.len(), "processing batch");
            Self::process_batch(
                batch,
                &registry,
                &dispatcher,
                &metrics,
                &kv,
                &shard_planner,
                total_layers,
            )
            .await;
        }
    }

    async fn process_batch(
        batch: Vec<RequestItem>,
        registry: &DeviceRegistry,
        dispatcher: &BackendDispatcher,
        metrics: &MetricsCollector,
        kv: &KvCacheManager,
        shard_planner: &ShardPlanner,
        total_layers: i64,
    ) {
        let batch_size = batch.len();
        let runner = EchoRunner::new();
        let scheduler = Scheduler::new(registry);

        for item in batch {
            let start = Instant::now();
            let decision = scheduler.pick_device(&item.prompt);

            let (reply, device_label, backend_label) = match decision {
                None => (
                    "No devices available.".to_string(),
                    "none".to_string(),
                    "none".to_string(),
                ),
                Some(decision) => {
                    let request_id = uuid::Uuid::new_v4().simple().to_string();
                    let plan = shard_planner
                        .plan(&registry.list(), total_layers)
                        .unwrap_or_default();

                    seed_kv_prefix(kv, &request_id, &item.prompt, &plan);
                    handoff_kv_chain(kv, &request_id, &plan);

                    let (reply, backend_label) = match dispatcher.chat(&item.prompt).await {
                        Some(reply) if !reply.is_empty() => (reply, "llama.cpp".to_string()),
                        _ => {
                            tracing::warn!(target: "engine", "backend dispatch failed, falling back to echo");
                            (
                                runner.run(&decision.device, &item.prompt),
                                decision.device.backend.clone(),
                            )
                        }
                    };

                    let device_label = decision.device.label();
                    kv.drop_request(&request_id);
                    (reply, device_label, backend_label)
                }
            };

            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            let queue_ms = start
                .saturating_duration_since(item.enqueue_time)
                .as_secs_f64()
                * 1000.0;

            metrics.record(RequestMetrics {
                ttft_ms: elapsed_ms,
                queue_ms,
                tokens: word_count(&reply),
                batch_size,
                device: device_label.clone(),
                backend: backend_label.clone(),
            });

            let _ = item.respond.send(ChatOutcome {
                reply,
                meta: RequestMeta {
                    device: device_label,
                    backend: backend_label,
                    queue_ms,
                    ttft_ms: elapsed_ms,
                    batch_size,
                },
            });
        }
    }
}

fn seed_kv_prefix(kv: &KvCacheManager, request_id: &str, prompt: &str, plan: &ShardPlan) {
    if !plan.layer_ranges.is_empty() {
        let prefix_tokens = word_count(prompt).max(1) as u64;
        kv.seed_prefix(request_id, prefix_tokens);
    }
}

fn handoff_kv_chain(kv: &KvCacheManager, request_id: &str, plan: &ShardPlan) {
    for idx in 1..plan.placements.len() {
        kv.handoff(request_id, &plan.placements[idx - 1], &plan.placements[idx]);
    }
}

/// Whitespace-word count used only for accounting; never tokenisation.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    fn dispatcher_with_no_backends() -> BackendDispatcher {
        BackendDispatcher::new(vec![], "relay-gguf")
    }

    #[tokio::test]
    async fn no_devices_yields_user_visible_message() {
        let engine = RequestEngine::new(
            DeviceRegistry::new(),
            dispatcher_with_no_backends(),
            4,
            10,
            1000,
            32,
        )
        .unwrap();
        let outcome = engine.handle_chat("Hi".to_string()).await;
        assert_eq!(outcome.reply, "No devices available.");
        assert_eq!(outcome.meta.device, "none");
        assert_eq!(outcome.meta.backend, "none");
    }

    #[tokio::test]
    async fn single_device_no_backends_echoes() {
        let mut registry = DeviceRegistry::new();
        registry.add_all([Device::new("cpu0", "cpu", 0.0, 1.0, 10.0)]);
        let engine = RequestEngine::new(registry, dispatcher_with_no_backends(), 4, 10, 1000, 32).unwrap();
        let outcome = engine.handle_chat("Hi".to_string()).await;
        assert_eq!(outcome.reply, "Echo: Hi");
        assert_eq!(outcome.meta.device, "cpu:cpu0");
        assert_eq!(outcome.meta.backend, "cpu");
        assert_eq!(outcome.meta.batch_size, 1);
    }

    #[tokio::test]
    async fn construction_fails_when_devices_outnumber_layers() {
        let mut registry = DeviceRegistry::new();
        registry.add_all([
            Device::new("a", "cpu", 0.0, 1.0, 1.0),
            Device::new("b", "cpu", 0.0, 1.0, 1.0),
            Device::new("c", "cpu", 0.0, 1.0, 1.0),
        ]);
        let err = RequestEngine::new(registry, dispatcher_with_no_backends(), 4, 10, 1000, 2).unwrap_err();
        assert!(matches!(err, RelayError::ShardConfig(_)));
    }

    #[tokio::test]
    async fn concurrent_submissions_all_resolve_and_respect_batch_cap() {
        let mut registry = DeviceRegistry::new();
        registry.add_all([Device::new("cpu0", "cpu", 0.0, 1.0, 10.0)]);
        let engine = Arc::new(
            RequestEngine::new(registry, dispatcher_with_no_backends(), 4, 50, 1000, 32).unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.handle_chat(format!("prompt {i}")).await
            }));
        }
        let mut batch_sizes = Vec::new();
        for h in handles {
            let outcome = h.await.unwrap();
            assert_eq!(outcome.reply.len() > 0, true);
            batch_sizes.push(outcome.meta.batch_size);
        }
        assert!(batch_sizes.iter().all(|&b| b <= 4));
        assert!(batch_sizes.iter().any(|&b| b >= 1));
    }
}
