//! End-to-end read scenarios against the in-memory backend

use chunkcache::cache::{CacheManager, EntryKind};
use chunkcache::config::{ByteSize, CacheConfig, EvictionPolicyKind, SidecarMode};
use chunkcache::SourceVersionCheckMode::{Disable, Inherit};
use chunkcache::{CacheError, MemoryBackend, Range};
use futures_util::future::join_all;
use serial_test::serial;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

fn config(temp: &TempDir, line: u64, size: u64) -> CacheConfig {
    let mut config = CacheConfig::with_location(temp.path());
    config.cache_line_size = ByteSize::b(line);
    config.size = ByteSize::b(size);
    config.sidecar = SidecarMode::Json;
    config
}

async fn open(config: CacheConfig, backend: Arc<MemoryBackend>) -> CacheManager {
    CacheManager::new(config, "default", backend).await.unwrap()
}

async fn setup(temp: &TempDir, line: u64, size: u64) -> (CacheManager, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let manager = open(config(temp, line, size), backend.clone()).await;
    (manager, backend)
}

fn content(len: u64, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i % 251) as u8).wrapping_add(seed))
        .collect()
}

fn expected(data: &[u8], offset: u64, size: u64) -> Vec<u8> {
    let len = data.len() as u64;
    let start = offset.min(len) as usize;
    let end = offset.saturating_add(size).min(len) as usize;
    data[start..end].to_vec()
}

/// Entry files under `dir`, excluding sidecars
fn entry_files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(reader) = std::fs::read_dir(&dir) else {
            continue;
        };
        for item in reader {
            let path = item.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else if !path.to_string_lossy().ends_with(".meta.json") {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

fn has_lock_files(dir: &Path) -> bool {
    entry_files(dir)
        .iter()
        .any(|p| p.to_string_lossy().ends_with(".lock"))
}

#[tokio::test]
async fn chunked_reads_match_backend_bytes() {
    let line = 10;
    for file_size in [0u64, 1, 9, 10, 11, 25, 30] {
        for mode in [Inherit, Disable] {
            let temp = TempDir::new().unwrap();
            let (manager, backend) = setup(&temp, line, 10 * MIB).await;
            let data = content(file_size, file_size as u8);
            backend.put("grid/object", data.clone());

            for offset in [0u64, 1, 9, 10, 11, 19, 20, 29, 30, 35] {
                for size in [1u64, 5, 9, 10, 11, 20, 40] {
                    let got = manager
                        .read("grid/object", Some(Range::new(offset, size)), mode)
                        .await
                        .unwrap();
                    assert_eq!(
                        got,
                        expected(&data, offset, size),
                        "file {file_size}, range {offset}+{size}, {mode:?}"
                    );
                }
            }

            let whole = manager.read("grid/object", None, mode).await.unwrap();
            assert_eq!(whole, data, "whole file {file_size}, {mode:?}");
        }
    }
}

#[tokio::test]
async fn repeated_read_hits_cache() {
    let temp = TempDir::new().unwrap();
    let (manager, backend) = setup(&temp, 10, MIB).await;
    let data = content(45, 3);
    backend.put("f", data.clone());

    let range = Some(Range::new(7, 20));
    let first = manager.read("f", range, Inherit).await.unwrap();
    let fetches = backend.get_calls();
    assert_eq!(fetches, 3);

    let second = manager.read("f", range, Inherit).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first, expected(&data, 7, 20));
    assert_eq!(backend.get_calls(), fetches);
}

#[tokio::test]
async fn source_change_invalidates_chunks() {
    let temp = TempDir::new().unwrap();
    let (manager, backend) = setup(&temp, 10, MIB).await;
    backend.put("f", content(30, 0));

    let range = Some(Range::new(12, 5));
    manager.read("f", range, Inherit).await.unwrap();

    let updated = content(30, 100);
    let new_etag = backend.put("f", updated.clone());

    let bytes = manager.read("f", range, Inherit).await.unwrap();
    assert_eq!(bytes, expected(&updated, 12, 5));

    let meta = manager
        .store()
        .entry_metadata("f", EntryKind::Chunk(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta.etag.as_deref(), Some(new_etag.as_str()));
}

#[tokio::test]
async fn size_change_invalidates_full_entry() {
    let temp = TempDir::new().unwrap();
    let (manager, backend) = setup(&temp, 10, MIB).await;
    backend.put("f", content(25, 0));
    manager.read("f", None, Inherit).await.unwrap();

    let grown = content(40, 9);
    backend.put("f", grown.clone());
    assert_eq!(manager.read("f", None, Inherit).await.unwrap(), grown);
}

#[tokio::test]
async fn full_file_read_never_creates_chunks() {
    let temp = TempDir::new().unwrap();
    let (manager, backend) = setup(&temp, 10, MIB).await;
    let data = content(35, 1);
    backend.put("dir/f", data.clone());

    manager.read("dir/f", None, Inherit).await.unwrap();
    assert_eq!(backend.get_calls(), 1);

    for (offset, size) in [(0, 5), (3, 20), (30, 10), (12, 1)] {
        let bytes = manager
            .read("dir/f", Some(Range::new(offset, size)), Inherit)
            .await
            .unwrap();
        assert_eq!(bytes, expected(&data, offset, size));
    }

    assert_eq!(backend.get_calls(), 1);
    let files = entry_files(manager.store().root());
    assert_eq!(files, vec![manager.store().root().join("dir/f")]);
}

#[tokio::test]
async fn range_reads_never_create_full_entry() {
    let temp = TempDir::new().unwrap();
    let (manager, backend) = setup(&temp, 10, MIB).await;
    backend.put("f", content(35, 1));

    for (offset, size) in [(0, 5), (3, 20), (30, 10), (1, 34)] {
        manager
            .read("f", Some(Range::new(offset, size)), Inherit)
            .await
            .unwrap();
    }

    let full = manager.store().entry_path("f", EntryKind::Full).unwrap();
    assert!(!full.exists());
    assert_eq!(entry_files(manager.store().root()).len(), 4);
}

#[tokio::test]
async fn small_file_chunk_serves_full_read() {
    let temp = TempDir::new().unwrap();
    let (manager, backend) = setup(&temp, 10, MIB).await;
    let data = content(6, 4);
    backend.put("small", data.clone());

    let part = manager
        .read("small", Some(Range::new(2, 3)), Inherit)
        .await
        .unwrap();
    assert_eq!(part, expected(&data, 2, 3));
    assert_eq!(backend.get_calls(), 1);

    let whole = manager.read("small", None, Inherit).await.unwrap();
    assert_eq!(whole, data);
    assert_eq!(backend.get_calls(), 1);

    let store = manager.store();
    assert!(store.entry_path("small", EntryKind::Chunk(0)).unwrap().exists());
    assert!(!store.entry_path("small", EntryKind::Full).unwrap().exists());
}

#[tokio::test]
async fn sub_range_of_small_file_caches_only_chunk_zero() {
    let temp = TempDir::new().unwrap();
    let (manager, backend) = setup(&temp, MIB, 50 * MIB).await;
    let data = content(512 * KIB, 6);
    backend.put("d/small.bin", data.clone());
    let store = manager.store();
    let chunk0 = store.entry_path("d/small.bin", EntryKind::Chunk(0)).unwrap();
    let full = store.entry_path("d/small.bin", EntryKind::Full).unwrap();

    let part = manager
        .read("d/small.bin", Some(Range::new(128 * KIB, 128 * KIB)), Inherit)
        .await
        .unwrap();
    assert_eq!(part, expected(&data, 128 * KIB, 128 * KIB));
    assert_eq!(std::fs::metadata(&chunk0).unwrap().len(), 512 * KIB);
    assert!(!full.exists());

    let whole = manager.read("d/small.bin", None, Inherit).await.unwrap();
    assert_eq!(whole, data);
    assert_eq!(backend.get_calls(), 1);
    assert!(chunk0.exists());
    assert!(!full.exists());
}

#[tokio::test]
async fn changed_small_file_is_refetched_for_full_read() {
    let temp = TempDir::new().unwrap();
    let (manager, backend) = setup(&temp, 10, MIB).await;
    backend.put("small", content(6, 0));
    manager
        .read("small", Some(Range::new(1, 2)), Inherit)
        .await
        .unwrap();

    let updated = content(6, 40);
    backend.put("small", updated.clone());
    assert_eq!(manager.read("small", None, Inherit).await.unwrap(), updated);
    assert_eq!(backend.get_calls(), 2);
}

#[tokio::test]
async fn small_file_full_read_serves_chunk_reads() {
    let temp = TempDir::new().unwrap();
    let (manager, backend) = setup(&temp, 10, MIB).await;
    let data = content(8, 2);
    backend.put("small", data.clone());

    manager.read("small", None, Inherit).await.unwrap();
    let part = manager
        .read("small", Some(Range::new(1, 4)), Disable)
        .await
        .unwrap();

    assert_eq!(part, expected(&data, 1, 4));
    assert_eq!(backend.get_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn parallel_readers_share_one_download() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(MemoryBackend::with_latency(Duration::from_millis(50)));
    let manager = Arc::new(open(config(&temp, 10, MIB), backend.clone()).await);
    let data = content(30, 7);
    backend.put("shared", data.clone());

    let readers = (0..8).map(|_| {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .read("shared", Some(Range::new(11, 4)), Inherit)
                .await
        })
    });

    for result in join_all(readers).await {
        assert_eq!(result.unwrap().unwrap(), expected(&data, 11, 4));
    }

    assert_eq!(backend.get_calls(), 1);
    assert!(!has_lock_files(temp.path()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn two_managers_share_one_download() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(MemoryBackend::with_latency(Duration::from_millis(50)));
    let first = Arc::new(open(config(&temp, 10, MIB), backend.clone()).await);
    let second = Arc::new(open(config(&temp, 10, MIB), backend.clone()).await);
    backend.put("shared", content(30, 7));

    let range = Some(Range::new(0, 25));
    let (a, b) = tokio::join!(
        first.read("shared", range, Inherit),
        second.read("shared", range, Inherit)
    );

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(backend.get_calls(), 3);
    assert!(!has_lock_files(temp.path()));
}

#[tokio::test]
#[serial]
async fn refresh_evicts_least_recently_read() {
    let temp = TempDir::new().unwrap();
    let (manager, backend) = setup(&temp, 10, 30).await;

    for name in ["a", "b", "c", "d"] {
        backend.put(name, content(10, 0));
        manager.read(name, None, Inherit).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Touch `a` so `b` becomes the oldest
    manager.read("a", None, Inherit).await.unwrap();

    let report = manager.refresh_cache().await.unwrap().unwrap();
    assert_eq!(report.scanned, 4);
    assert_eq!(report.evicted, 1);
    assert!(report.remaining_bytes <= 30);

    let root = manager.store().root();
    assert!(root.join("a").exists());
    assert!(!root.join("b").exists());
    assert!(!root.join("b.meta.json").exists());
    assert!(root.join("c").exists());
    assert!(root.join("d").exists());
}

#[tokio::test]
#[serial]
async fn evicted_chunk_is_refetched() {
    let temp = TempDir::new().unwrap();
    let (manager, backend) = setup(&temp, MIB, 2 * MIB).await;
    let data = content(4 * MIB, 5);
    backend.put("big", data.clone());

    for index in 0..3 {
        manager
            .read("big", Some(Range::new(index * MIB + 10, 100)), Inherit)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let report = manager.refresh_cache().await.unwrap().unwrap();
    assert_eq!(report.evicted, 1);
    assert!(report.remaining_bytes <= 2 * MIB);

    let chunk0 = manager.store().entry_path("big", EntryKind::Chunk(0)).unwrap();
    assert!(!chunk0.exists());

    let calls = backend.get_calls();
    let bytes = manager
        .read("big", Some(Range::new(10, 100)), Inherit)
        .await
        .unwrap();
    assert_eq!(bytes, expected(&data, 10, 100));
    assert_eq!(backend.get_calls(), calls + 1);
    assert!(chunk0.exists());
}

#[tokio::test]
async fn no_eviction_policy_keeps_everything() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let mut config = config(&temp, 10, 15);
    config.eviction_policy.policy = EvictionPolicyKind::NoEviction;
    let manager = open(config, backend.clone()).await;

    for name in ["a", "b", "c"] {
        backend.put(name, content(10, 0));
        manager.read(name, None, Inherit).await.unwrap();
    }

    let report = manager.refresh_cache().await.unwrap().unwrap();
    assert_eq!(report.evicted, 0);
    assert_eq!(report.remaining_bytes, 30);
}

#[tokio::test]
async fn megabyte_lines_materialize_only_touched_chunks() {
    let temp = TempDir::new().unwrap();
    let (manager, backend) = setup(&temp, MIB, 50 * MIB).await;
    let data = content(4 * MIB, 0);
    backend.put("data/file.bin", data.clone());
    let store = manager.store();
    let chunk = |i| store.entry_path("data/file.bin", EntryKind::Chunk(i)).unwrap();

    let bytes = manager
        .read("data/file.bin", Some(Range::new(512 * KIB, 16 * KIB)), Inherit)
        .await
        .unwrap();
    assert_eq!(bytes, expected(&data, 512 * KIB, 16 * KIB));
    assert_eq!(std::fs::metadata(chunk(0)).unwrap().len(), MIB);
    assert!(!chunk(1).exists());

    let bytes = manager
        .read("data/file.bin", Some(Range::new(512 * KIB, 1536 * KIB)), Inherit)
        .await
        .unwrap();
    assert_eq!(bytes, expected(&data, 512 * KIB, 1536 * KIB));
    assert_eq!(std::fs::metadata(chunk(1)).unwrap().len(), MIB);
    assert!(!chunk(2).exists());
    assert!(!chunk(3).exists());

    let full = store.entry_path("data/file.bin", EntryKind::Full).unwrap();
    assert!(!full.exists());
}

#[tokio::test]
async fn disabled_version_check_reads_whole_file_as_chunks() {
    let temp = TempDir::new().unwrap();
    let (manager, backend) = setup(&temp, MIB, 50 * MIB).await;
    let data = content(4 * MIB, 0);
    backend.put("data/file.bin", data.clone());

    let bytes = manager.read("data/file.bin", None, Disable).await.unwrap();
    assert_eq!(bytes, data);
    assert_eq!(backend.metadata_calls(), 0);

    let store = manager.store();
    for index in 0..4 {
        let chunk = store
            .entry_path("data/file.bin", EntryKind::Chunk(index))
            .unwrap();
        assert!(chunk.exists(), "chunk {index} missing");
    }
    let full = store.entry_path("data/file.bin", EntryKind::Full).unwrap();
    assert!(!full.exists());
}

#[tokio::test]
async fn backend_failure_leaves_nothing_behind() {
    let temp = TempDir::new().unwrap();
    let (manager, backend) = setup(&temp, 10, MIB).await;
    let data = content(20, 0);
    backend.put("f", data.clone());
    backend.fail_next_gets(1);

    let err = manager
        .read("f", Some(Range::new(0, 5)), Inherit)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(entry_files(temp.path()).is_empty());

    let bytes = manager
        .read("f", Some(Range::new(0, 5)), Inherit)
        .await
        .unwrap();
    assert_eq!(bytes, expected(&data, 0, 5));
}

#[tokio::test]
async fn missing_object_is_reported() {
    let temp = TempDir::new().unwrap();
    let (manager, _backend) = setup(&temp, 10, MIB).await;

    let err = manager.read("absent", None, Inherit).await.unwrap_err();
    assert!(matches!(err, CacheError::ObjectNotFound(_)));
}

#[tokio::test]
async fn escaping_paths_are_rejected() {
    let temp = TempDir::new().unwrap();
    let (manager, backend) = setup(&temp, 10, MIB).await;
    backend.put("../outside", content(5, 0));

    let err = manager.read("../outside", None, Inherit).await.unwrap_err();
    assert!(matches!(err, CacheError::InvalidPath { .. }));
    assert_eq!(backend.metadata_calls(), 0);
}

#[tokio::test]
async fn profiles_are_isolated_but_share_budget() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let alpha = CacheManager::new(config(&temp, 10, MIB), "alpha", backend.clone())
        .await
        .unwrap();
    let beta = CacheManager::new(config(&temp, 10, MIB), "beta", backend.clone())
        .await
        .unwrap();
    backend.put("f", content(10, 0));

    alpha.read("f", None, Inherit).await.unwrap();
    beta.read("f", None, Inherit).await.unwrap();
    assert_eq!(backend.get_calls(), 2);

    let usage = alpha.usage().await.unwrap();
    assert_eq!(usage.entries, 2);
    assert_eq!(usage.total_bytes, 20);

    alpha.clear().await.unwrap();
    assert!(!temp.path().join("alpha").exists());
    assert!(temp.path().join("beta/f").exists());
}

#[tokio::test]
async fn xattr_sidecars_track_chunk_versions() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let mut config = config(&temp, 10, MIB);
    config.sidecar = SidecarMode::Auto;
    let manager = open(config, backend.clone()).await;
    if manager.store().sidecar().name() != "xattr" {
        // Filesystem without user xattrs
        return;
    }

    let first = backend.put("f", content(25, 0));
    manager
        .read("f", Some(Range::new(2, 3)), Inherit)
        .await
        .unwrap();

    let chunk0 = manager.store().entry_path("f", EntryKind::Chunk(0)).unwrap();
    let attr = |name: &str| {
        xattr::get(&chunk0, name)
            .unwrap()
            .map(|raw| String::from_utf8(raw).unwrap())
    };
    assert_eq!(attr("user.etag"), Some(first.clone()));
    assert_eq!(attr("user.cache_line_size").as_deref(), Some("10"));
    assert_eq!(attr("user.size").as_deref(), Some("25"));
    assert!(!PathBuf::from(format!("{}.meta.json", chunk0.display())).exists());

    let updated = content(25, 90);
    let second = backend.put("f", updated.clone());
    assert_ne!(first, second);

    let bytes = manager
        .read("f", Some(Range::new(2, 3)), Inherit)
        .await
        .unwrap();
    assert_eq!(bytes, expected(&updated, 2, 3));
    assert_eq!(attr("user.etag"), Some(second));
    assert_eq!(backend.get_calls(), 2);
}
