use axum::Router;
use relay_common::config::Settings;

#[tokio::test]
async fn health_chat_and_metrics_routes_serve_over_http() {
    let settings = Settings {
        port: 0,
        backends: Vec::new(),
        pretty_default: false,
        ..Settings::default()
    };
    let app: Router = relay_api::app(settings).expect("engine constructs with probed devices");
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let srv = tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let base = format!("http://{}:{}", addr.ip(), addr.port());
    let client = reqwest::Client::new();

    let r = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert!(r.status().is_success());

    let r = client.get(format!("{base}/v1/models")).send().await.unwrap();
    assert!(r.status().is_success());
    let body: serde_json::Value = r.json().await.unwrap();
    assert!(body["data"][0]["id"].is_string());

    let r = client.get(format!("{base}/metrics")).send().await.unwrap();
    assert!(r.status().is_success());

    let chat_body = serde_json::json!({
        "messages": [{"role": "user", "content": "Hi"}],
    });
    let r = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&chat_body)
        .send()
        .await
        .unwrap();
    assert!(r.status().is_success());
    let body: serde_json::Value = r.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "Echo: Hi");
    assert_eq!(body["usage"]["prompt_tokens"], 1);
    assert_eq!(body["usage"]["completion_tokens"], 2);
    assert_eq!(body["usage"]["total_tokens"], 3);

    let r = client.get(format!("{base}/v1/metrics")).send().await.unwrap();
    assert!(r.status().is_success());
    let body: serde_json::Value = r.json().await.unwrap();
    assert_eq!(body["stats"]["count"], 1);

    let r = client.get(format!("{base}/debug/shard")).send().await.unwrap();
    assert!(r.status().is_success());

    srv.abort();
}

#[tokio::test]
async fn missing_prompt_is_rejected() {
    let settings = Settings {
        port: 0,
        backends: Vec::new(),
        pretty_default: false,
        ..Settings::default()
    };
    let app: Router = relay_api::app(settings).expect("engine constructs");
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let srv = tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let base = format!("http://{}:{}", addr.ip(), addr.port());
    let client = reqwest::Client::new();
    let r = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&serde_json::json!({"messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(r.status(), reqwest::StatusCode::BAD_REQUEST);

    srv.abort();
}
