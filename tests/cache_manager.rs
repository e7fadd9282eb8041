mod common;

use common::{FakeClusterClient, node, node_json, pod, pod_json, wait_until};
use navicache::k8s::api::WatchEventType;
use navicache::k8s::cache::WatchEvent;
use navicache::{CacheConfig, CacheManager, Error, SearchFilters};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn config() -> CacheConfig {
    CacheConfig::default().with_watch_backoff(Duration::from_millis(50))
}

fn manager(client: &Arc<FakeClusterClient>) -> CacheManager {
    CacheManager::new(client.clone(), config()).unwrap()
}

#[tokio::test]
async fn test_reads_go_through_cache() {
    let client = Arc::new(FakeClusterClient::with_namespaces(&["default"]));
    client.set_resources("default", "pods", vec![pod("web-1", "default", &[])]);
    let manager = manager(&client);

    let first = manager.get_resources_by_type("default", "pods").await.unwrap();
    let second = manager.get_resources_by_type("default", "po").await.unwrap();
    assert_eq!(first.len(), 1);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(client.list_calls(), 1);

    manager.get_namespaces().await.unwrap();
    manager.get_namespaces().await.unwrap();
    assert_eq!(client.namespace_calls.load(Ordering::SeqCst), 1);

    let stats = manager.get_cache_stats().await;
    assert_eq!(stats.size, 2);
    assert_eq!(stats.hits, 2);
}

#[tokio::test]
async fn test_watch_event_invalidates_cached_list() {
    let client = Arc::new(FakeClusterClient::with_namespaces(&["default"]));
    client.set_resources("default", "pods", vec![pod("web-1", "default", &[])]);
    let manager = manager(&client);

    manager.get_resources_by_type("default", "pods").await.unwrap();
    assert_eq!(client.list_calls(), 1);

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    manager
        .watch_resources(
            "default",
            "pods",
            Arc::new(move |_: WatchEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

    assert!(
        client
            .send_event("default", "pods", WatchEventType::Modified, pod_json("web-1", "default"))
            .await
    );
    assert!(wait_until(|| seen.load(Ordering::SeqCst) == 1).await);

    assert!(wait_for_size(&manager, 0).await, "watch event did not invalidate the cached list");

    manager.get_resources_by_type("default", "pods").await.unwrap();
    assert_eq!(client.list_calls(), 2);
    manager.close().await;
}

#[tokio::test]
async fn test_refresh_all_keeps_only_namespaces() {
    let client = Arc::new(FakeClusterClient::with_namespaces(&["default", "kube-system"]));
    let manager = manager(&client);

    manager.get_resources_by_type("default", "pods").await.unwrap();
    manager.get_resources_by_type("default", "services").await.unwrap();
    manager.get_resources_by_type("kube-system", "pods").await.unwrap();

    manager.refresh_all().await.unwrap();

    assert_eq!(manager.get_cache_stats().await.size, 1);
    assert_eq!(client.namespace_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_refresh_namespace_stops_at_first_error() {
    let client = Arc::new(FakeClusterClient::with_namespaces(&["default"]));
    let manager = manager(&client);

    manager.get_resources_by_type("default", "pods").await.unwrap();
    client.fail_lists_of("deployments");

    let err = manager.refresh_namespace("default").await.unwrap_err();
    assert!(matches!(err, Error::Custom(ref msg) if msg.contains("deployments")));

    // pods and services were re-fetched before deployments failed
    assert_eq!(client.list_calls(), 4);
    assert_eq!(manager.get_cache_stats().await.size, 2);

    client.heal();
    manager.refresh_namespace("default").await.unwrap();
    assert_eq!(manager.get_cache_stats().await.size, 8);
}

#[tokio::test]
async fn test_search_by_query_and_labels() {
    let client = Arc::new(FakeClusterClient::with_namespaces(&["default", "shop"]));
    client.set_resources(
        "default",
        "pods",
        vec![
            pod("nginx-proxy", "default", &[("app", "web")]),
            pod("redis-0", "default", &[("app", "cache")]),
        ],
    );
    client.set_resources("shop", "pods", vec![pod("nginx-proxy", "shop", &[("app", "db")])]);
    let manager = manager(&client);

    let filters = SearchFilters::default()
        .with_resource_type("pods")
        .with_label("app", "web");
    let found = manager.search_resources("nginx", &filters).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].namespace(), "default");

    let everything = SearchFilters::default().with_resource_type("pods");
    assert_eq!(manager.search_resources("", &everything).await.unwrap().len(), 3);

    let scoped = SearchFilters::default().with_namespace("shop");
    let found = manager.search_resources("NGINX", &scoped).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].metadata.labels.get("app").map(String::as_str), Some("db"));

    // unknown types are skipped rather than failing the search
    let odd = SearchFilters::default()
        .with_namespace("default")
        .with_resource_type("widgets")
        .with_resource_type("pods");
    assert_eq!(manager.search_resources("redis", &odd).await.unwrap().len(), 1);
}

async fn wait_for_size(manager: &CacheManager, size: usize) -> bool {
    for _ in 0..100 {
        if manager.get_cache_stats().await.size == size {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_cluster_scoped_types_ignore_the_namespace() {
    let client = Arc::new(FakeClusterClient::with_namespaces(&["default", "shop"]));
    client.set_resources("", "nodes", vec![node("n1")]);
    let manager = manager(&client);

    let scoped = manager.get_resources_by_type("default", "nodes").await.unwrap();
    let everywhere = manager.get_resources_by_type("", "no").await.unwrap();
    assert_eq!(scoped.len(), 1);
    assert!(Arc::ptr_eq(&scoped, &everywhere));
    assert_eq!(client.list_calls(), 1);

    let by_name = SearchFilters::default().with_resource_type("nodes");
    assert_eq!(manager.search_resources("n1", &by_name).await.unwrap().len(), 1);
    let in_shop = SearchFilters::default().with_namespace("shop").with_resource_type("node");
    assert_eq!(manager.search_resources("n1", &in_shop).await.unwrap().len(), 1);
    assert_eq!(client.list_calls(), 1);

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    manager
        .watch_resources(
            "default",
            "nodes",
            Arc::new(move |_: WatchEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
    manager
        .watch_resources("shop", "nodes", Arc::new(|_: WatchEvent| {}))
        .await
        .unwrap();
    assert_eq!(client.watch_opens(), 1);
    assert_eq!(manager.watch_stats().unwrap().registered_keys, 1);

    // namespaces list plus the node list
    assert_eq!(manager.get_cache_stats().await.size, 2);
    assert!(
        client
            .send_event("", "nodes", WatchEventType::Modified, node_json("n1"))
            .await
    );
    assert!(wait_until(|| seen.load(Ordering::SeqCst) == 1).await);
    assert!(wait_for_size(&manager, 1).await, "node event left the cached list in place");

    manager.get_resources_by_type("default", "nodes").await.unwrap();
    assert_eq!(client.list_calls(), 2);
    manager.close().await;
}

#[tokio::test]
async fn test_cleanup_loop_sweeps_expired_entries() {
    let client = Arc::new(FakeClusterClient::with_namespaces(&["default"]));
    let manager = CacheManager::new(
        client.clone(),
        config()
            .with_cache_ttl(Duration::from_millis(30))
            .with_refresh_interval(Duration::from_millis(50)),
    )
    .unwrap();

    manager.get_namespaces().await.unwrap();
    manager.get_resources_by_type("default", "pods").await.unwrap();
    assert_eq!(manager.get_cache_stats().await.size, 2);

    assert!(wait_for_size(&manager, 0).await, "expired entries were never swept");
    let stats = manager.get_cache_stats().await;
    assert_eq!(stats.hits + stats.misses, 2);
    manager.close().await;
}

#[tokio::test]
async fn test_unbounded_ttl_is_rejected_not_panicking() {
    let client = Arc::new(FakeClusterClient::new());
    let result = CacheManager::new(
        client,
        config().with_cache_ttl(Duration::from_secs(u64::MAX)),
    );
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[tokio::test]
async fn test_client_errors_propagate_and_are_not_cached() {
    let client = Arc::new(FakeClusterClient::with_namespaces(&["default"]));
    client.fail_lists_of("*");
    let manager = manager(&client);

    assert!(matches!(
        manager.get_resources_by_type("default", "pods").await,
        Err(Error::Custom(_))
    ));
    assert!(manager.get_namespaces().await.is_err());
    assert_eq!(manager.get_cache_stats().await.size, 0);

    client.heal();
    manager.get_resources_by_type("default", "pods").await.unwrap();
    assert_eq!(client.list_calls(), 2);
}

#[tokio::test]
async fn test_unknown_type_is_rejected() {
    let client = Arc::new(FakeClusterClient::new());
    let manager = manager(&client);
    assert!(matches!(
        manager.get_resources_by_type("default", "widgets").await,
        Err(Error::UnknownResourceType(_))
    ));
    assert_eq!(client.list_calls(), 0);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let client = Arc::new(FakeClusterClient::new());
    let result = CacheManager::new(client, CacheConfig::default().with_max_cache_size(0));
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[tokio::test]
async fn test_watch_disabled() {
    let client = Arc::new(FakeClusterClient::new());
    let manager =
        CacheManager::new(client.clone(), config().with_watch_enabled(false)).unwrap();

    assert!(matches!(
        manager.watch_resources("default", "pods", Arc::new(|_: WatchEvent| {})).await,
        Err(Error::WatchDisabled)
    ));
    assert!(manager.watch_stats().is_none());
    assert!(manager.health_check().is_ok());
    assert_eq!(client.watch_opens(), 0);
}

#[tokio::test]
async fn test_close_is_idempotent_and_final() {
    let client = Arc::new(FakeClusterClient::with_namespaces(&["default"]));
    let manager = manager(&client);
    manager.get_namespaces().await.unwrap();
    manager
        .watch_resources("default", "pods", Arc::new(|_: WatchEvent| {}))
        .await
        .unwrap();

    manager.close().await;
    manager.close().await;

    assert!(manager.is_closed());
    assert_eq!(manager.get_cache_stats().await.size, 0);
    assert!(matches!(manager.get_namespaces().await, Err(Error::Closed)));
    assert!(matches!(manager.health_check(), Err(Error::Closed)));
    assert!(matches!(
        manager.watch_resources("default", "pods", Arc::new(|_: WatchEvent| {})).await,
        Err(Error::Closed)
    ));
}
