use relay_backend::BackendDispatcher;
use relay_core::{Device, DeviceRegistry, RequestEngine};
use std::sync::Arc;

fn registry_with_one_cpu() -> DeviceRegistry {
    let mut registry = DeviceRegistry::new();
    registry.add_all([Device::new("cpu0", "cpu", 0.0, 1.0, 10.0)]);
    registry
}

#[tokio::test]
async fn no_backends_one_request_echoes_with_usage_friendly_meta() {
    let engine = RequestEngine::new(
        registry_with_one_cpu(),
        BackendDispatcher::new(vec![], "relay-gguf"),
        4,
        10,
        1000,
        32,
    )
    .unwrap();

    let outcome = engine.handle_chat("Hi".to_string()).await;
    assert_eq!(outcome.reply, "Echo: Hi");
    assert_eq!(outcome.meta.backend, "cpu");
    assert_eq!(outcome.meta.batch_size, 1);
}

#[tokio::test]
async fn empty_registry_reports_no_devices_available() {
    let engine = RequestEngine::new(
        DeviceRegistry::new(),
        BackendDispatcher::new(vec![], "relay-gguf"),
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
async fn batch_coalescing_groups_near_simultaneous_requests() {
    let engine = Arc::new(
        RequestEngine::new(
            registry_with_one_cpu(),
            BackendDispatcher::new(vec![], "relay-gguf"),
            4,
            50,
            1000,
            32,
        )
        .unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..4 {
        let engine = engine.clone();
        handles.push(tokio::spawn(
            async move { engine.handle_chat(format!("msg{i}")).await },
        ));
    }

    let mut batch_sizes = Vec::new();
    for handle in handles {
        batch_sizes.push(handle.await.unwrap().meta.batch_size);
    }
    assert!(batch_sizes.iter().all(|&b| b == 4), "{batch_sizes:?}");
}

#[tokio::test]
async fn metrics_report_reflects_processed_requests() {
    let engine = RequestEngine::new(
        registry_with_one_cpu(),
        BackendDispatcher::new(vec![], "relay-gguf"),
        4,
        10,
        1000,
        32,
    )
    .unwrap();

    engine.handle_chat("one two three".to_string()).await;
    let report = engine.metrics_report();
    assert_eq!(report.stats.count, 1);
    assert_eq!(report.queue_depth, 0);
    assert_eq!(report.shard_plan.placements, vec!["cpu:cpu0".to_string()]);
    assert_eq!(report.shard_plan.layer_ranges, vec![(0, 31)]);
}
