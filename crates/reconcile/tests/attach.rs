use std::sync::Arc;
use std::time::Duration;

use kdash_cache::{CacheStore, MemoryCache};
use kdash_core::{CacheKey, ConnectionStatus, ResourceKind};
use kdash_reconcile::{CacheReconciler, ReconcilerConfig};
use kdash_stream::testing::ChannelConnector;
use kdash_stream::{EventStreamClient, StreamConfig};
use serde_json::json;

fn client(conn: &ChannelConnector) -> EventStreamClient {
    let cfg = StreamConfig::new("ws://test.local/ws/updates")
        .with_reconnect_interval(Duration::from_secs(3))
        .with_max_reconnect_attempts(5);
    EventStreamClient::start(cfg, Arc::new(conn.clone()))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

fn deployments() -> CacheKey {
    CacheKey::list(ResourceKind::Deployment, None)
}

#[tokio::test(start_paused = true)]
async fn pushed_events_land_in_the_cache() {
    let conn = ChannelConnector::new();
    let server = conn.accept_next();
    let client = client(&conn);
    let cache = MemoryCache::new();
    cache.set(deployments(), json!([]));
    let rec = CacheReconciler::attach(&client, Arc::new(cache.clone()), ReconcilerConfig::all("all-resources"));
    assert!(rec.is_attached());
    assert_eq!(rec.family(), "all-resources");
    settle().await;

    server.push_json(&json!({
        "type": "deployment_added", "resource_type": "Deployment", "namespace": "default",
        "name": "api", "data": {"replicas_desired": 3, "replicas_ready": 0, "status": "Progressing"},
    }));
    server.push("{broken");
    server.push_json(&json!({
        "type": "deployment_modified", "resource_type": "Deployment", "namespace": "default",
        "name": "api", "data": {"replicas_ready": 3, "status": "Healthy"},
    }));
    settle().await;

    assert_eq!(
        cache.get(&deployments()),
        Some(json!([{
            "namespace": "default", "name": "api",
            "replicas_desired": 3, "replicas_ready": 3, "status": "Healthy",
        }]))
    );
    assert_eq!(client.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn bad_event_does_not_reach_the_client_or_stop_later_events() {
    let conn = ChannelConnector::new();
    let server = conn.accept_next();
    let client = client(&conn);
    let cache = MemoryCache::new();
    cache.set(deployments(), json!([]));
    let _rec = CacheReconciler::attach(&client, Arc::new(cache.clone()), ReconcilerConfig::all("all-resources"));
    settle().await;

    server.push_json(&json!({
        "type": "deployment_modified", "resource_type": "Deployment", "namespace": "default",
        "name": "api", "data": [1, 2, 3],
    }));
    server.push_json(&json!({
        "type": "deployment_added", "resource_type": "Deployment", "namespace": "default",
        "name": "web", "data": {},
    }));
    settle().await;

    assert_eq!(cache.get(&deployments()), Some(json!([{"namespace": "default", "name": "web"}])));
    assert_eq!(client.status(), ConnectionStatus::Connected);
    assert_eq!(client.listener_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn families_split_work_between_reconcilers() {
    let conn = ChannelConnector::new();
    let server = conn.accept_next();
    let client = client(&conn);
    let cache = MemoryCache::new();
    let pods = CacheKey::list(ResourceKind::Pod, Some("default"));
    cache.set(deployments(), json!([]));
    cache.set(pods.clone(), json!([]));
    let store: Arc<dyn CacheStore> = Arc::new(cache.clone());
    let _deploys = CacheReconciler::attach(
        &client,
        Arc::clone(&store),
        ReconcilerConfig::for_kinds("deployment-updates", [ResourceKind::Deployment]),
    );
    let _pods = CacheReconciler::attach(&client, store, ReconcilerConfig::for_kinds("pod-updates", [ResourceKind::Pod]));
    assert_eq!(client.listener_count(), 2);
    settle().await;

    server.push_json(&json!({
        "type": "deployment_added", "resource_type": "Deployment", "namespace": "default", "name": "api", "data": {},
    }));
    server.push_json(&json!({
        "type": "pod_added", "resource_type": "Pod", "namespace": "default", "name": "api-1", "data": {"phase": "Pending"},
    }));
    settle().await;

    assert_eq!(cache.get(&deployments()).unwrap().as_array().unwrap().len(), 1);
    assert_eq!(cache.get(&pods), Some(json!([{"namespace": "default", "name": "api-1", "phase": "Pending"}])));
}

#[tokio::test(start_paused = true)]
async fn disposed_reconciler_stops_applying() {
    let conn = ChannelConnector::new();
    let server = conn.accept_next();
    let client = client(&conn);
    let cache = MemoryCache::new();
    cache.set(deployments(), json!([]));
    let mut rec = CacheReconciler::attach(&client, Arc::new(cache.clone()), ReconcilerConfig::all("all-resources"));
    settle().await;

    rec.dispose();
    rec.dispose();
    assert!(!rec.is_attached());
    assert_eq!(client.listener_count(), 0);

    server.push_json(&json!({
        "type": "deployment_added", "resource_type": "Deployment", "namespace": "default", "name": "api", "data": {},
    }));
    settle().await;
    assert_eq!(cache.get(&deployments()), Some(json!([])));

    let dropped = CacheReconciler::attach(&client, Arc::new(cache.clone()), ReconcilerConfig::all("again"));
    assert_eq!(client.listener_count(), 1);
    drop(dropped);
    assert_eq!(client.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn events_after_reconnect_keep_flowing() {
    let conn = ChannelConnector::new();
    let mut first = conn.accept_next();
    let second = conn.accept_next();
    let client = client(&conn);
    let cache = MemoryCache::new();
    cache.set(deployments(), json!([]));
    let _rec = CacheReconciler::attach(&client, Arc::new(cache.clone()), ReconcilerConfig::all("all-resources"));
    settle().await;

    first.close();
    settle().await;
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(client.status(), ConnectionStatus::Connected);

    second.push_json(&json!({
        "type": "deployment_added", "resource_type": "Deployment", "namespace": "default", "name": "api", "data": {},
    }));
    settle().await;
    assert_eq!(cache.get(&deployments()), Some(json!([{"namespace": "default", "name": "api"}])));
}
