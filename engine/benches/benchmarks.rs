//! Performance benchmarks for arbor-engine

use arbor_engine::{
    apply_delta, apply_full, build_delta_payload, build_full_payload, build_snapshot, Component,
    ComponentManifest, ComponentRegistry, ComponentType, RuntimeStore, SnapshotFilter,
    StoreSync, WireMessage,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
struct Transform {
    cell: (i32, i32),
}

impl Component for Transform {}
impl ComponentType for Transform {
    const ALIAS: &'static str = "transform";
}

#[derive(Debug, Serialize, Deserialize)]
struct Label {
    text: String,
}

impl Component for Label {}
impl ComponentType for Label {
    const ALIAS: &'static str = "label";
}

fn create_registry() -> Arc<ComponentRegistry> {
    let manifest = ComponentManifest::from_names(["transform", "label"]);
    Arc::new(
        ComponentRegistry::from_manifest(&manifest)
            .and_then(|r| r.with::<Transform>())
            .and_then(|r| r.with::<Label>())
            .unwrap(),
    )
}

/// Roots with ten children each, every node carrying two components.
fn populate(store: &mut RuntimeStore, size: usize) {
    let mut root = None;
    for i in 0..size {
        let id = match root {
            Some(parent) if i % 10 != 0 => store.create_child(parent, -1),
            _ => {
                let id = store.create();
                root = Some(id);
                id
            }
        };

        let object = store.try_take_rw(id).unwrap();
        object
            .add_or_replace(Transform {
                cell: (i as i32, -(i as i32)),
            })
            .unwrap();
        object
            .add_or_replace(Label {
                text: format!("node {}", i),
            })
            .unwrap();
    }
}

/// Nudge every tenth node and move every seventh to the front of its parent.
fn churn(store: &mut RuntimeStore) {
    let ids: Vec<_> = store.ids().collect();
    for (n, id) in ids.iter().enumerate() {
        if n % 10 == 0 {
            if let Some(transform) = store.try_take_rw(*id).and_then(|o| o.take_rw::<Transform>()) {
                transform.cell.0 += 1;
            }
        }
        if n % 7 == 0 {
            if let Some(parent) = store.parent_of(*id) {
                store.move_child(parent, *id, 0);
            }
        }
    }
}

fn bench_store_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_operations");

    group.bench_function("create_child", |b| {
        let mut store = RuntimeStore::new("world", create_registry());
        let root = store.create();

        b.iter(|| store.create_child(black_box(root), black_box(-1)))
    });

    group.bench_function("flush_1000", |b| {
        let registry = create_registry();

        b.iter(|| {
            let mut store = RuntimeStore::new("world", Arc::clone(&registry));
            populate(&mut store, 1000);
            store.flush()
        })
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for size in [100, 500, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("build", size), size, |b, &size| {
            let mut store = RuntimeStore::new("world", create_registry());
            populate(&mut store, size);

            b.iter(|| build_snapshot(black_box(&store), &SnapshotFilter::full()))
        });

        group.bench_with_input(BenchmarkId::new("apply_full", size), size, |b, &size| {
            let registry = create_registry();
            let mut store = RuntimeStore::new("world", Arc::clone(&registry));
            populate(&mut store, size);
            let snapshot = build_snapshot(&store, &SnapshotFilter::full()).unwrap();
            let spawns = build_full_payload(&snapshot);

            b.iter(|| {
                let mut replica = RuntimeStore::new("world", Arc::clone(&registry));
                apply_full(&mut replica, 0, black_box(&spawns), 64)
            })
        });
    }

    group.finish();
}

fn bench_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta");

    for size in [100, 500, 1000].iter() {
        let registry = create_registry();
        let mut store = RuntimeStore::new("world", Arc::clone(&registry));
        populate(&mut store, *size);
        let baseline = build_snapshot(&store, &SnapshotFilter::delta()).unwrap();
        let full = build_full_payload(&build_snapshot(&store, &SnapshotFilter::full()).unwrap());

        churn(&mut store);
        let current = build_snapshot(&store, &SnapshotFilter::delta()).unwrap();
        let delta = build_delta_payload(&baseline, &current);

        group.bench_with_input(BenchmarkId::new("build", size), size, |b, _| {
            b.iter(|| build_delta_payload(black_box(&baseline), black_box(&current)))
        });

        group.bench_with_input(BenchmarkId::new("apply", size), size, |b, _| {
            b.iter(|| {
                let mut replica = RuntimeStore::new("world", Arc::clone(&registry));
                apply_full(&mut replica, 0, &full, 64);
                apply_delta(&mut replica, black_box(&delta))
            })
        });
    }

    group.finish();
}

fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");

    let mut store = RuntimeStore::new("world", create_registry());
    populate(&mut store, 100);
    let snapshot = build_snapshot(&store, &SnapshotFilter::full()).unwrap();
    let message = WireMessage::StoreSync(StoreSync::full("world", 1, build_full_payload(&snapshot)));
    let bytes = message.encode().unwrap();

    group.bench_function("store_sync_encode", |b| {
        b.iter(|| black_box(&message).encode())
    });

    group.bench_function("store_sync_decode", |b| {
        b.iter(|| WireMessage::decode(black_box(&bytes)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_store_operations,
    bench_snapshot,
    bench_delta,
    bench_serialization,
);
criterion_main!(benches);
