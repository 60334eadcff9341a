use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use tenant_guard::{
    ActionName, AuditConfig, AuditTrail, EnforcerBuilder, GuardBuilder, GuardConfig,
    InvalidationConsumer, LoadMode, LoadStrategy, MemoryAuditSink, MemoryBus, MemorySharedCache,
    MemoryStore, PlatformOverride, ResourceName, RoleId, TenantId, TieredCache, UserId,
    decision_key,
};

fn tenant(value: &str) -> TenantId {
    TenantId::try_from(value).unwrap()
}

fn user(value: &str) -> UserId {
    UserId::try_from(value).unwrap()
}

fn role(value: &str) -> RoleId {
    RoleId::try_from(value).unwrap()
}

fn resource(value: &str) -> ResourceName {
    ResourceName::try_from(value).unwrap()
}

fn action(value: &str) -> ActionName {
    ActionName::try_from(value).unwrap()
}

fn tiered(shared: MemorySharedCache) -> Arc<TieredCache> {
    Arc::new(TieredCache::new(
        1_024,
        Duration::from_secs(60),
        Duration::from_secs(300),
        shared,
    ))
}

async fn enforcer_over(store: &Arc<MemoryStore>) -> Arc<tenant_guard::Enforcer> {
    Arc::new(
        EnforcerBuilder::new(Arc::clone(store) as _)
            .build()
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn check_transitions_after_policy_and_assignment() {
    let store = Arc::new(MemoryStore::new());
    let guard = GuardBuilder::new(
        enforcer_over(&store).await,
        Arc::clone(&store) as _,
        Arc::clone(&store) as _,
    )
    .cache(tiered(MemorySharedCache::new()))
    .build();

    let admin = user("admin");
    let denied = guard
        .check_permission(&user("7"), &tenant("acme"), &resource("document"), &action("edit"))
        .await
        .unwrap();
    assert!(!denied);

    guard
        .add_policy(&admin, &role("editor"), &tenant("acme"), &resource("document"), &action("edit"))
        .await
        .unwrap();
    guard
        .assign_role(&admin, &user("7"), &role("editor"), &tenant("acme"))
        .await
        .unwrap();

    // The deny cached before the mutations must not survive them.
    let allowed = guard
        .check_permission(&user("7"), &tenant("acme"), &resource("document"), &action("edit"))
        .await
        .unwrap();
    assert!(allowed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn revocation_invalidates_another_nodes_cache() {
    let store = Arc::new(MemoryStore::new());
    let shared = MemorySharedCache::new();

    // Node A mutates and publishes; node B only consumes invalidations.
    let (bus, rx) = MemoryBus::channel(16);
    let guard_a = GuardBuilder::new(
        enforcer_over(&store).await,
        Arc::clone(&store) as _,
        Arc::clone(&store) as _,
    )
    .cache(tiered(shared.clone()))
    .publisher(Arc::new(bus.clone()))
    .build();

    let cache_b = tiered(shared.clone());
    let consumer = Arc::new(InvalidationConsumer::new(Arc::clone(&cache_b)));
    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(Arc::clone(&consumer).run(rx, bus.sender(), shutdown.clone()));

    let admin = user("admin");
    guard_a
        .add_policy(&admin, &role("editor"), &tenant("acme"), &resource("document"), &action("edit"))
        .await
        .unwrap();
    guard_a
        .assign_role(&admin, &user("7"), &role("editor"), &tenant("acme"))
        .await
        .unwrap();
    // Let the mutation events from the setup drain before node B caches.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Node B caches an allow for the subject.
    let key = decision_key(
        &tenant("acme"),
        &user("7").subject(),
        &resource("document"),
        &action("edit"),
    );
    cache_b.set(&key, true).await;
    assert_eq!(cache_b.get(&key).await, Some(true));

    guard_a
        .revoke_role(&admin, &user("7"), &role("editor"), &tenant("acme"))
        .await
        .unwrap();

    // Give the fire-and-forget publish and the consumer time to settle.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cache_b.get(&key).await, None);

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn platform_override_expires_into_normal_evaluation() {
    let store = Arc::new(MemoryStore::new());
    let guard = GuardBuilder::new(
        enforcer_over(&store).await,
        Arc::clone(&store) as _,
        Arc::clone(&store) as _,
    )
    .build();

    let admin = user("admin");
    guard
        .grant_platform_override(
            &admin,
            PlatformOverride {
                user: user("7"),
                permission: "platform:admin".to_string(),
                granted_by: admin.as_str().to_string(),
                granted_at: Utc::now(),
                expires_at: Some(Utc::now() + chrono::Duration::milliseconds(50)),
            },
        )
        .await
        .unwrap();

    let allowed = guard
        .check_permission(&user("7"), &tenant("acme"), &resource("document"), &action("edit"))
        .await
        .unwrap();
    assert!(allowed, "active override must bypass the empty policy set");

    tokio::time::sleep(Duration::from_millis(80)).await;
    let allowed = guard
        .check_permission(&user("7"), &tenant("acme"), &resource("document"), &action("edit"))
        .await
        .unwrap();
    assert!(!allowed, "expired override must fall through to deny");
}

#[tokio::test]
async fn tenant_invalidation_leaves_other_tenants_on_the_shared_tier() {
    let store = Arc::new(MemoryStore::new());
    let cache = tiered(MemorySharedCache::new());
    let guard = GuardBuilder::new(
        enforcer_over(&store).await,
        Arc::clone(&store) as _,
        Arc::clone(&store) as _,
    )
    .cache(Arc::clone(&cache))
    .build();

    let other_key = decision_key(
        &tenant("other"),
        &user("9").subject(),
        &resource("document"),
        &action("edit"),
    );
    cache.set(&other_key, true).await;

    guard
        .add_policy(
            &user("admin"),
            &role("editor"),
            &tenant("acme"),
            &resource("document"),
            &action("edit"),
        )
        .await
        .unwrap();

    // The mutation clears every L1 entry, but the other tenant's decision
    // is still served from the shared tier.
    assert_eq!(cache.get(&other_key).await, Some(true));
}

#[tokio::test]
async fn adaptive_strategy_loads_fully_below_the_threshold() {
    let config: GuardConfig = serde_json::from_str(
        r#"{
            "cache": {"memory_ttl_secs": 30, "shared_ttl_secs": 120, "max_size": 256},
            "load": {"strategy": "adaptive", "default_tenant": "acme"}
        }"#,
    )
    .unwrap();
    assert_eq!(config.load.strategy, LoadStrategy::Adaptive);

    let store = Arc::new(MemoryStore::new());
    let enforcer = EnforcerBuilder::new(Arc::clone(&store) as _)
        .load(config.load.clone())
        .build()
        .await
        .unwrap();
    assert_eq!(enforcer.load_mode().await, LoadMode::Unfiltered);

    let guard = GuardBuilder::new(
        Arc::new(enforcer),
        Arc::clone(&store) as _,
        Arc::clone(&store) as _,
    )
    .cache_from_config(&config.cache, MemorySharedCache::new())
    .build();

    let admin = user("admin");
    guard
        .add_policy(&admin, &role("editor"), &tenant("other"), &resource("document"), &action("edit"))
        .await
        .unwrap();
    guard
        .assign_role(&admin, &user("7"), &role("editor"), &tenant("other"))
        .await
        .unwrap();

    // Full residency means a tenant outside the default one still resolves.
    let allowed = guard
        .check_permission(&user("7"), &tenant("other"), &resource("document"), &action("edit"))
        .await
        .unwrap();
    assert!(allowed);
}

#[tokio::test]
async fn batch_results_match_individual_checks() {
    let store = Arc::new(MemoryStore::new());
    let guard = GuardBuilder::new(
        enforcer_over(&store).await,
        Arc::clone(&store) as _,
        Arc::clone(&store) as _,
    )
    .cache(tiered(MemorySharedCache::new()))
    .build();

    let admin = user("admin");
    guard
        .add_policy(&admin, &role("editor"), &tenant("acme"), &resource("document"), &action("edit"))
        .await
        .unwrap();
    guard
        .assign_role(&admin, &user("7"), &role("editor"), &tenant("acme"))
        .await
        .unwrap();

    let pairs = [
        (resource("document"), action("edit")),
        (resource("document"), action("delete")),
        (resource("report"), action("read")),
    ];
    let batch = guard.check_batch(&user("7"), &tenant("acme"), &pairs).await.unwrap();

    for (res, act) in &pairs {
        let single = guard
            .check_permission(&user("7"), &tenant("acme"), res, act)
            .await
            .unwrap();
        assert_eq!(batch.get(&format!("{res}:{act}")), Some(&single));
    }
}

#[tokio::test]
async fn audit_trail_captures_the_full_session() {
    let store = Arc::new(MemoryStore::new());
    let sink = MemoryAuditSink::new();
    let trail = Arc::new(AuditTrail::start(
        Arc::new(sink.clone()),
        AuditConfig::default(),
    ));
    let guard = GuardBuilder::new(
        enforcer_over(&store).await,
        Arc::clone(&store) as _,
        Arc::clone(&store) as _,
    )
    .audit(trail)
    .build();

    let admin = user("admin");
    guard
        .add_policy(&admin, &role("editor"), &tenant("acme"), &resource("document"), &action("edit"))
        .await
        .unwrap();
    guard
        .assign_role(&admin, &user("7"), &role("editor"), &tenant("acme"))
        .await
        .unwrap();
    guard
        .check_permission(&user("7"), &tenant("acme"), &resource("document"), &action("edit"))
        .await
        .unwrap();
    guard.shutdown().await;

    let records = sink.records();
    let actions: Vec<&str> = records.iter().map(|record| record.action.as_str()).collect();
    assert_eq!(actions, vec!["policy_added", "role_assigned", "permission_check"]);
    assert_eq!(records[2].decision, Some(true));
    assert!(records[2].latency_ms.is_some());
}
