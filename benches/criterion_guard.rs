#![cfg(feature = "criterion-bench")]

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use futures::executor::block_on;
use std::sync::Arc;
use std::time::Duration;

use tenant_guard::{
    ActionName, Enforcer, EnforcerBuilder, GuardBuilder, MemorySharedCache, MemoryStore,
    PolicyRule, ResourceName, RoleId, SubjectId, TenantId, TieredCache, UserId,
};

fn tenant() -> TenantId {
    TenantId::try_from("tenant_bench").unwrap()
}

fn subject() -> SubjectId {
    SubjectId::try_from("user:bench").unwrap()
}

fn setup_flat_store() -> (MemoryStore, ResourceName, ActionName) {
    let store = MemoryStore::new();
    let role = RoleId::try_from("role_reader").unwrap();
    let resource = ResourceName::try_from("invoice").unwrap();
    let action = ActionName::try_from("read").unwrap();

    store.seed_rule(PolicyRule::policy(&role, &tenant(), &resource, &action));
    store.seed_rule(PolicyRule::grouping(&subject(), &role, &tenant()));

    (store, resource, action)
}

fn setup_hierarchy_store(depth: usize) -> (MemoryStore, ResourceName, ActionName) {
    let store = MemoryStore::new();
    let resource = ResourceName::try_from("invoice").unwrap();
    let action = ActionName::try_from("read").unwrap();

    let first = RoleId::try_from("role_chain_0").unwrap();
    store.seed_rule(PolicyRule::grouping(&subject(), &first, &tenant()));
    for i in 0..depth {
        let current = SubjectId::try_from(format!("role_chain_{i}").as_str()).unwrap();
        let next = RoleId::try_from(format!("role_chain_{}", i + 1).as_str()).unwrap();
        store.seed_rule(PolicyRule::grouping(&current, &next, &tenant()));
    }
    let tail = RoleId::try_from(format!("role_chain_{depth}").as_str()).unwrap();
    store.seed_rule(PolicyRule::policy(&tail, &tenant(), &resource, &action));

    (store, resource, action)
}

fn setup_role_fanout_store(role_count: usize) -> (MemoryStore, ResourceName, ActionName) {
    let store = MemoryStore::new();
    let action = ActionName::try_from("read").unwrap();

    for i in 0..role_count {
        let role = RoleId::try_from(format!("role_{i}").as_str()).unwrap();
        let resource = ResourceName::try_from(format!("invoice_{i}").as_str()).unwrap();
        store.seed_rule(PolicyRule::policy(&role, &tenant(), &resource, &action));
        store.seed_rule(PolicyRule::grouping(&subject(), &role, &tenant()));
    }

    let required = ResourceName::try_from(format!("invoice_{}", role_count - 1).as_str()).unwrap();
    (store, required, action)
}

fn build_enforcer(store: MemoryStore, max_depth: usize) -> Arc<Enforcer> {
    Arc::new(
        block_on(
            EnforcerBuilder::new(Arc::new(store) as _)
                .max_inherit_depth(max_depth)
                .build(),
        )
        .unwrap(),
    )
}

fn bench_flat(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_flat");
    group.sample_size(30);
    group.throughput(Throughput::Elements(1));

    let (store, resource, action) = setup_flat_store();
    let enforcer = build_enforcer(store, 16);
    group.bench_function("check_no_cache", |b| {
        b.iter(|| {
            let allowed =
                block_on(enforcer.check_permission(&subject(), &tenant(), &resource, &action))
                    .unwrap();
            black_box(allowed);
        });
    });

    let (store, resource, action) = setup_flat_store();
    let shared = Arc::new(store);
    let cache = Arc::new(TieredCache::new(
        8_192,
        Duration::from_secs(60),
        Duration::from_secs(300),
        MemorySharedCache::new(),
    ));
    let enforcer = Arc::new(
        block_on(EnforcerBuilder::new(Arc::clone(&shared) as _).build()).unwrap(),
    );
    let guard = GuardBuilder::new(
        enforcer,
        Arc::clone(&shared) as _,
        shared as _,
    )
    .cache(cache)
    .build();
    let user = UserId::try_from("bench").unwrap();
    assert!(block_on(guard.check_permission(&user, &tenant(), &resource, &action)).unwrap());
    group.bench_function("check_tiered_cache", |b| {
        b.iter(|| {
            let allowed =
                block_on(guard.check_permission(&user, &tenant(), &resource, &action)).unwrap();
            black_box(allowed);
        });
    });

    group.finish();
}

fn bench_hierarchy_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_hierarchy_depth");
    group.sample_size(30);
    group.throughput(Throughput::Elements(1));

    for depth in [1usize, 4, 8, 16] {
        let (store, resource, action) = setup_hierarchy_store(depth);
        let enforcer = build_enforcer(store, depth + 2);
        let id = BenchmarkId::from_parameter(depth);
        group.bench_with_input(id, &depth, |b, _| {
            b.iter(|| {
                let allowed =
                    block_on(enforcer.check_permission(&subject(), &tenant(), &resource, &action))
                        .unwrap();
                black_box(allowed);
            });
        });
    }

    group.finish();
}

fn bench_role_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_role_fanout");
    group.sample_size(30);
    group.throughput(Throughput::Elements(1));

    for role_count in [1usize, 8, 32, 128] {
        let (store, required, action) = setup_role_fanout_store(role_count);
        let enforcer = build_enforcer(store, 16);
        let id = BenchmarkId::from_parameter(role_count);
        group.bench_with_input(id, &role_count, |b, _| {
            b.iter(|| {
                let allowed =
                    block_on(enforcer.check_permission(&subject(), &tenant(), &required, &action))
                        .unwrap();
                black_box(allowed);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_flat, bench_hierarchy_depth, bench_role_fanout);
criterion_main!(benches);
