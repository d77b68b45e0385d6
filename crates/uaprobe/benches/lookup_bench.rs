use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use tempfile::TempDir;
use uaprobe::{CachedApi, CompiledTree, MemoryCacheProvider};

const SAMPLE: &str = include_str!("../tests/data/sample.json");

const INPUTS: &[(&str, &str)] = &[
    ("linux", "Mozilla/5.0 (Linux; Android 11; SM-G991B) AppleWebKit/537.36 Chrome/96.0.4664.45 Mobile Safari/537.36"),
    ("iphone", "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Version/17.0 Mobile/15E148 Safari/604.1"),
    ("robot", "Googlebot/2.1 (+http://www.google.com/bot.html)"),
    ("unknown", "curl/8.4.0"),
];

fn bench_tree_lookup(c: &mut Criterion) {
    let tree = CompiledTree::from_slice(SAMPLE.as_bytes()).unwrap();

    let mut group = c.benchmark_group("tree_lookup");
    group.throughput(Throughput::Elements(1));

    for (name, ua) in INPUTS {
        group.bench_with_input(BenchmarkId::new("typed", name), ua, |b, ua| {
            b.iter(|| black_box(tree.lookup(ua, None, true).unwrap()));
        });
    }

    let (_, ua) = INPUTS[1];
    group.bench_function(BenchmarkId::new("overlay", "iphone"), |b| {
        b.iter(|| black_box(tree.lookup(ua, Some("bisTablet:1|idisplayWidth:1200"), true).unwrap()));
    });
    group.bench_function(BenchmarkId::new("single", "iphone"), |b| {
        b.iter(|| black_box(tree.lookup_single(ua, "browserVersion", None).unwrap()));
    });

    group.finish();
}

fn bench_cached_api(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("sample.json");
    std::fs::write(&source, SAMPLE).unwrap();

    let mut group = c.benchmark_group("cached_api");
    group.throughput(Throughput::Elements(1));

    let (_, ua) = INPUTS[0];
    let direct = CachedApi::builder(&source).build();
    direct.lookup(ua, None).unwrap();
    group.bench_function("full_tree", |b| {
        b.iter(|| black_box(direct.lookup(ua, None).unwrap()));
    });

    // fresh facade each time, answered from the shared result cache
    let cache = Arc::new(MemoryCacheProvider::default());
    let warm = CachedApi::builder(&source).cache_provider(cache.clone()).build();
    warm.lookup(ua, None).unwrap();
    group.bench_function("result_cache_hit", |b| {
        b.iter(|| {
            let api = CachedApi::builder(&source).cache_provider(cache.clone()).build();
            black_box(api.lookup(ua, None).unwrap())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_tree_lookup, bench_cached_api);
criterion_main!(benches);
