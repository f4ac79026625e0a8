use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use live_delta::{
    DeltaQuery, DiffOptions, Filter, KnownHashes, MemoryStore, ObserverConfig, Params,
    QueryExecutor, QueryRegistry, Row, RowsDiff, TableObserver, View, json, rows_diff,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

const QUERY: &str = "SELECT * FROM items WHERE id < $1";

fn make_rows(size: usize, changed_every: usize) -> Vec<Arc<Row>> {
    (0..size)
        .map(|i| {
            let version = if changed_every > 0 && i % changed_every == 0 { 1 } else { 0 };
            Arc::new(
                Row::new()
                    .with("id", i)
                    .with("name", format!("item{}", i))
                    .with("version", version),
            )
        })
        .collect()
}

fn make_store(size: usize) -> MemoryStore {
    let store = MemoryStore::with_observer(TableObserver::new());
    store.create_table("items", "id");
    store.define_view(QUERY, View::scan("items").filter(Filter::lt("id", "$1")));
    for i in 0..size {
        store
            .insert(
                "items",
                Row::new().with("id", i).with("name", format!("item{}", i)),
            )
            .unwrap();
    }
    store
}

/// Benchmark: Diff two result sets with a tenth of the rows changed
fn bench_rows_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("rows_diff");

    for size in [100, 1000, 10000] {
        let old = make_rows(size, 0);
        let new = make_rows(size, 10);
        let equal = |a: &Arc<Row>, b: &Arc<Row>| Arc::ptr_eq(a, b) || a == b;

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let options = DiffOptions {
                    key_field: "id",
                    equal: &equal,
                };
                let diff: Option<RowsDiff> = rows_diff(&old, &new, &options);
                black_box(diff)
            })
        });
    }

    group.finish();
}

/// Benchmark: Render a delta statement
fn bench_delta_build(c: &mut Criterion) {
    let params = Params::from(json!([100]));
    c.bench_function("delta_build", |b| {
        b.iter(|| black_box(DeltaQuery::build(QUERY, &params, "id").unwrap()))
    });
}

/// Benchmark: Delta statement where every row is already known
fn bench_delta_execute_known(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta_execute_known");

    for size in [100, 1000] {
        let store = make_store(size);
        let params = Params::from(json!([size]));
        let delta = DeltaQuery::build(QUERY, &params, "id").unwrap();
        let hashes = store
            .rows("items")
            .iter()
            .map(|row| row.content_hash())
            .collect();
        let bound = delta.bind(&params, &KnownHashes::from_hashes(hashes));

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.to_async(Runtime::new().unwrap())
                .iter(|| async { black_box(store.execute(delta.sql(), &bound).await.unwrap()) })
        });
    }

    group.finish();
}

/// Benchmark: Forced refresh pass through the registry
fn bench_refresh_pass(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let store = make_store(1000);
    let shared = Arc::new(store.clone());
    let registry = QueryRegistry::new(
        shared.clone(),
        shared,
        Arc::new(TableObserver::new()),
        ObserverConfig::new()
            .key_field("id")
            .debounce(Duration::from_secs(3600)),
    )
    .unwrap();
    let handle = rt.block_on(async {
        registry
            .register(QUERY, json!([1000]), |_| false, |_| Ok(()))
            .await
            .unwrap()
    });

    c.bench_function("refresh_pass_unchanged_1000", |b| {
        b.to_async(Runtime::new().unwrap())
            .iter(|| async { black_box(handle.refresh().await.unwrap()) })
    });
}

criterion_group!(
    benches,
    bench_rows_diff,
    bench_delta_build,
    bench_delta_execute_known,
    bench_refresh_pass
);
criterion_main!(benches);
