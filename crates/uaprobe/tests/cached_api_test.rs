// CachedApi behaviour across trees, shards and result caches
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use uaprobe::{
    CacheProvider, CachedApi, FileCacheProvider, MemoryCacheProvider, UaprobeError, Value,
    DEFAULT_ITEM_EXPIRY,
};

const SAMPLE: &str = "tests/data/sample.json";
const LINUX_UA: &str = "Mozilla/5.0 (Linux; Android 11.0)";
const BOT_UA: &str = "Googlebot/2.1 (+http://www.google.com/bot.html)";

fn setup() -> (TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    let source = dir.path().join("sample.json");
    fs::copy(SAMPLE, &source).unwrap();
    (dir, source)
}

#[test]
fn test_full_tree_computes_directly() {
    let (_dir, source) = setup();
    let api = CachedApi::builder(&source).build();
    assert!(api.snapshot().is_none());

    let props = api.lookup(LINUX_UA, None).unwrap();
    assert_eq!(props.get("isMobile"), Some(&Value::Bool(true)));
    assert_eq!(props.get("osVersion"), Some(&Value::from("11.0")));

    api.lookup(LINUX_UA, None).unwrap();
    api.lookup(BOT_UA, None).unwrap();

    let stats = api.stats();
    assert_eq!(stats.lookups, 3);
    assert_eq!(stats.loads, 1);
    assert_eq!(stats.direct, 2);
    assert_eq!(stats.cache_misses, 1);
    assert!(api.snapshot().unwrap().shard().is_none());
}

#[test]
fn test_empty_input() {
    let (_dir, source) = setup();
    let api = CachedApi::builder(&source).build();
    assert!(api.lookup("   ", None).unwrap().is_empty());
    assert_eq!(api.stats().lookups, 0);
    assert!(api.snapshot().is_none());
}

#[test]
fn test_shared_cache_answers_fresh_instance() {
    let (dir, source) = setup();
    let cache: Arc<dyn CacheProvider> =
        Arc::new(FileCacheProvider::new(dir.path().join("results"), DEFAULT_ITEM_EXPIRY));

    let first = CachedApi::builder(&source)
        .cache_provider(Arc::clone(&cache))
        .build();
    let expected = first.lookup(LINUX_UA, Some("bisTablet:1")).unwrap();

    let second = CachedApi::builder(&source)
        .cache_provider(Arc::clone(&cache))
        .build();
    let cached = second.lookup(LINUX_UA, Some("bisTablet:1")).unwrap();
    assert_eq!(cached.attributes(), expected.attributes());
    assert_eq!(cached.get("isTablet"), Some(&Value::Bool(true)));

    let stats = second.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.loads, 0);
    assert!(second.snapshot().is_none());

    // a different overlay is a different entry
    second.lookup(LINUX_UA, None).unwrap();
    assert_eq!(second.stats().loads, 1);
}

#[test]
fn test_clear_result_cache() {
    let (_dir, source) = setup();
    let cache = Arc::new(MemoryCacheProvider::default());
    let api = CachedApi::builder(&source)
        .cache_provider(cache.clone())
        .sharding(true)
        .shard_dir(source.with_file_name("shards"))
        .build();

    api.lookup(LINUX_UA, None).unwrap();
    assert_eq!(cache.len(), 1);
    api.clear_result_cache().unwrap();
    assert!(cache.is_empty());
}

#[test]
fn test_no_cache() {
    let (_dir, source) = setup();
    let api = CachedApi::builder(&source).no_cache().build();
    api.lookup(LINUX_UA, None).unwrap();
    api.clear_result_cache().unwrap();
    let stats = api.stats();
    assert_eq!(stats.cache_hits + stats.cache_misses, 0);
}

#[test]
fn test_sharding_switches_to_full_tree() {
    let (_dir, source) = setup();
    let api = CachedApi::builder(&source)
        .sharding(true)
        .shard_dir(source.with_file_name("shards"))
        .build();
    assert!(api.is_sharding());

    api.lookup(LINUX_UA, None).unwrap();
    assert_eq!(api.snapshot().unwrap().shard(), Some("77.linux"));

    // same shard is served from memory
    api.lookup("Mozilla/5.0 (Linux; Android 9.0)", None).unwrap();
    assert_eq!(api.stats().loads, 1);

    let props = api.lookup(BOT_UA, None).unwrap();
    assert_eq!(props.get("isRobot"), Some(&Value::Bool(true)));
    assert!(!api.is_sharding());
    assert!(api.snapshot().unwrap().shard().is_none());
    assert_eq!(api.stats().loads, 2);

    // everything is now direct
    api.lookup(LINUX_UA, None).unwrap();
    assert_eq!(api.stats().loads, 2);
}

#[test]
fn test_shard_cache_management() {
    let (_dir, source) = setup();
    let shards = source.with_file_name("shards");
    let api = CachedApi::builder(&source)
        .sharding(true)
        .shard_dir(&shards)
        .build();

    api.populate_shard_cache(false).unwrap();
    assert!(shards.join("json.77.iphone").exists());

    // the full tree used for generation is kept
    assert!(!api.is_sharding());
    assert!(api.snapshot().unwrap().shard().is_none());
    assert_eq!(api.stats().loads, 1);
    api.lookup(LINUX_UA, None).unwrap();
    api.lookup(BOT_UA, None).unwrap();
    assert_eq!(api.stats().loads, 1);
    assert_eq!(api.stats().direct, 2);

    assert_eq!(api.clear_shard_cache().unwrap(), 4);
}

#[test]
fn test_single_attribute() {
    let (_dir, source) = setup();
    let api = CachedApi::builder(&source).build();

    assert_eq!(
        api.lookup_single(LINUX_UA, "osVersion", None).unwrap(),
        Value::from("11.0")
    );
    assert!(matches!(
        api.lookup_single(BOT_UA, "osVersion", None),
        Err(UaprobeError::InvalidAttribute { .. })
    ));
    assert!(matches!(
        api.lookup_single(BOT_UA, "colour", None),
        Err(UaprobeError::UnknownAttribute(_))
    ));
}

#[test]
fn test_metadata() {
    let (_dir, source) = setup();
    let api = CachedApi::builder(&source).build();
    assert_eq!(api.revision().unwrap(), 28419);
    assert_eq!(api.generated_at().unwrap(), 1714521600);
    assert_eq!(api.list_attributes().unwrap().len(), 13);
}

#[test]
fn test_missing_dataset() {
    let dir = tempdir().unwrap();
    let api = CachedApi::builder(dir.path().join("absent.json")).build();
    assert!(matches!(api.lookup(LINUX_UA, None), Err(UaprobeError::Dataset(_))));
}

#[test]
fn test_concurrent_lookups() {
    let (_dir, source) = setup();
    let api = Arc::new(
        CachedApi::builder(&source)
            .cache_ttl(Duration::from_secs(60))
            .build(),
    );

    let handles: Vec<_> = (0..8)
        .map(|thread_id| {
            let api = Arc::clone(&api);
            thread::spawn(move || {
                for i in 0..50 {
                    let ua = if (thread_id + i) % 2 == 0 { LINUX_UA } else { BOT_UA };
                    api.lookup(ua, None).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = api.stats();
    assert_eq!(stats.lookups, 400);
    assert_eq!(stats.loads, 1);
}
