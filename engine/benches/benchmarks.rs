//! Performance benchmarks for saltpeter-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use saltpeter_engine::{
    field, Collection, Config, Database, DeltaState, Document, FindOptions, IndexKind, Value,
};
use std::sync::Arc;

fn database() -> Database {
    Database::open(Config::in_memory().with_event_workers(1)).unwrap()
}

fn populate(collection: &Collection, count: i64) {
    for i in 0..count {
        collection
            .insert(
                Document::new()
                    .with("name", format!("User {}", i))
                    .with("age", i % 90)
                    .with("bio", format!("writes rust and sails boat number {}", i % 50)),
            )
            .unwrap();
    }
}

fn users(db: &Database, count: i64) -> Arc<Collection> {
    let users = db.collection("users").unwrap();
    populate(&users, count);
    users
}

fn bench_collection_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("collection_operations");

    group.bench_function("insert", |b| {
        let db = database();
        let users = db.collection("users").unwrap();
        let mut n = 0i64;
        b.iter(|| {
            n += 1;
            users
                .insert(black_box(Document::new().with("name", "Test User").with("age", n)))
                .unwrap()
        })
    });

    group.bench_function("insert_indexed", |b| {
        let db = database();
        let users = db.collection("users").unwrap();
        users.create_index("age", IndexKind::NonUnique).unwrap();
        users.create_index("bio", IndexKind::FullText).unwrap();
        let mut n = 0i64;
        b.iter(|| {
            n += 1;
            users
                .insert(black_box(
                    Document::new().with("age", n % 90).with("bio", "quick brown fox"),
                ))
                .unwrap()
        })
    });

    group.bench_function("get_by_id", |b| {
        let db = database();
        let users = users(&db, 1000);
        let id = users
            .find(&field("age").eq(50), &FindOptions::new().limit(1))
            .unwrap()[0]
            .id()
            .unwrap()
            .unwrap();
        b.iter(|| users.get_by_id(black_box(&id)).unwrap())
    });

    group.bench_function("update", |b| {
        let db = database();
        let users = users(&db, 1000);
        let mut n = 0i64;
        b.iter(|| {
            n += 1;
            users
                .update(
                    black_box(&field("age").eq(7)),
                    &Document::new().with("visits", n),
                    Default::default(),
                )
                .unwrap()
        })
    });

    group.finish();
}

fn bench_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("queries");

    for count in [100i64, 1000, 10000] {
        let db = database();
        let users = users(&db, count);
        group.bench_with_input(BenchmarkId::new("scan_eq", count), &users, |b, users| {
            b.iter(|| {
                users
                    .find(black_box(&field("age").eq(42)), &FindOptions::default())
                    .unwrap()
            })
        });

        users.create_index("age", IndexKind::NonUnique).unwrap();
        group.bench_with_input(BenchmarkId::new("indexed_eq", count), &users, |b, users| {
            b.iter(|| {
                users
                    .find(black_box(&field("age").eq(42)), &FindOptions::default())
                    .unwrap()
            })
        });
        group.bench_with_input(BenchmarkId::new("indexed_range", count), &users, |b, users| {
            b.iter(|| {
                users
                    .find(
                        black_box(&field("age").gte(10).and(field("age").lt(20))),
                        &FindOptions::default(),
                    )
                    .unwrap()
            })
        });

        users.create_index("bio", IndexKind::FullText).unwrap();
        group.bench_with_input(BenchmarkId::new("full_text", count), &users, |b, users| {
            b.iter(|| {
                users
                    .find(black_box(&field("bio").text("boat")), &FindOptions::default())
                    .unwrap()
            })
        });
    }

    group.finish();
}

fn bench_index_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_build");
    group.sample_size(20);

    for count in [100i64, 1000, 10000] {
        let db = database();
        let users = users(&db, count);
        users.create_index("age", IndexKind::NonUnique).unwrap();
        group.bench_with_input(BenchmarkId::new("rebuild", count), &users, |b, users| {
            b.iter(|| users.rebuild_index(black_box("age"), false).unwrap())
        });
    }

    group.finish();
}

fn bench_replication(c: &mut Criterion) {
    let mut group = c.benchmark_group("replication");

    for count in [10i64, 100, 1000] {
        let db = database();
        let source = db.replicated("source").unwrap();
        populate(source.collection(), count);
        let delta = source.delta(0, i64::MAX, 0, usize::MAX).unwrap();

        group.bench_with_input(BenchmarkId::new("delta", count), &source, |b, source| {
            b.iter(|| source.delta(black_box(0), i64::MAX, 0, usize::MAX).unwrap())
        });

        group.bench_with_input(BenchmarkId::new("merge", count), &delta, |b, delta| {
            let target = database();
            let map = target.replicated("target").unwrap();
            b.iter(|| map.merge(black_box(delta)).unwrap())
        });

        let json = delta.to_json().unwrap();
        group.bench_with_input(BenchmarkId::new("delta_from_json", count), &json, |b, json| {
            b.iter(|| DeltaState::from_json(black_box(json)).unwrap())
        });
    }

    group.finish();
}

fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");

    let doc = Document::new()
        .with("name", "Test User")
        .with("age", 30)
        .with("address.city", "Lisbon")
        .with("tags", vec![Value::from("a"), Value::from("b")]);

    group.bench_function("document_to_json", |b| b.iter(|| black_box(&doc).to_json()));

    let json = doc.to_json();
    group.bench_function("document_from_json", |b| {
        b.iter(|| Document::from_json(black_box(json.clone())).unwrap())
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_collection_operations,
    bench_queries,
    bench_index_build,
    bench_replication,
    bench_serialization,
);
criterion_main!(benches);
