//! End-to-end runs of the staged synchronizer
//!
//! The source is a local directory and the destination an in-memory store,
//! both wired through an [`Environment`] built from a config.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use chrono::{TimeZone, Utc};
use encsync_cache::Difflist;
use encsync_core::config::{Config, FolderConfig, StorageConfig, TargetConfig};
use encsync_core::crypto::content::encrypt_bytes;
use encsync_core::crypto::{encrypt_filename, Key};
use encsync_core::domain::{DiffType, FilenameEncoding, Node, NodeType, TargetFlags, TaskStatus};
use encsync_storage::MemoryStorage;
use encsync_sync::{Environment, Stage, SyncOptions, TargetReport};
use tempfile::TempDir;

// ============================================================================
// Test helpers
// ============================================================================

struct Fixture {
    _dir: TempDir,
    src_root: PathBuf,
    mem: MemoryStorage,
    master_key: Key,
    data_key: Key,
    env: Environment,
}

fn fixture(dst_encrypted: bool, case_sensitive: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let src_root = dir.path().join("src");
    std::fs::create_dir_all(&src_root).unwrap();
    let master_key = Key::generate(32).unwrap();
    let data_key = Key::generate(32).unwrap();

    let mut config = Config {
        data_dir: dir.path().join("data"),
        master_key: Some(master_key.to_base64()),
        data_key: Some(data_key.to_base64()),
        ..Config::default()
    };
    config.storages.insert(
        "local".to_string(),
        StorageConfig::Local {
            root: src_root.clone(),
        },
    );
    config
        .storages
        .insert("mem".to_string(), StorageConfig::Memory { case_sensitive });
    config.folders.insert(
        "src".to_string(),
        FolderConfig {
            storage: "local".to_string(),
            prefix: "/".to_string(),
            encrypted: Some(false),
            filename_encoding: None,
            avoid_rescan: false,
        },
    );
    config.folders.insert(
        "dst".to_string(),
        FolderConfig {
            storage: "mem".to_string(),
            prefix: "/d".to_string(),
            encrypted: Some(dst_encrypted),
            filename_encoding: None,
            avoid_rescan: false,
        },
    );
    config.targets.insert(
        "t".to_string(),
        TargetConfig {
            src: "src".to_string(),
            dst: "dst".to_string(),
            flags: TargetFlags::default(),
        },
    );

    let mem = MemoryStorage::with_case_sensitivity("mem", case_sensitive);
    let options = SyncOptions {
        upload_backoff: Duration::from_millis(10),
        ..SyncOptions::from_config(&config)
    };
    let env = Environment::new(config)
        .unwrap()
        .with_storage("mem", Arc::new(mem.clone()))
        .with_options(options);

    Fixture {
        _dir: dir,
        src_root,
        mem,
        master_key,
        data_key,
        env,
    }
}

fn write_file(root: &Path, rel: &str, data: &[u8], mtime: u64) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, data).unwrap();
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(UNIX_EPOCH + Duration::from_secs(mtime))
        .unwrap();
}

async fn run_with(fx: &Fixture, flags: TargetFlags) -> TargetReport {
    let mut spec = fx.env.target("t").unwrap();
    spec.flags = flags;
    let mut sync = fx.env.synchronizer(spec).await.unwrap();
    sync.run().await
}

async fn run(fx: &Fixture) -> TargetReport {
    run_with(fx, TargetFlags::default()).await
}

/// Destination nodes below the folder root, in path order.
async fn dst_nodes(fx: &Fixture) -> Vec<Node> {
    let filelist = fx.env.filelist("dst").await.unwrap();
    filelist
        .select_all_nodes()
        .collect_all()
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.path != "/d/")
        .collect()
}

async fn difflist(fx: &Fixture) -> Difflist {
    fx.env.difflist().await.unwrap()
}

async fn read_dst(fx: &Fixture, rel: &str) -> Vec<u8> {
    let folder = fx.env.folder_storage("dst").await.unwrap();
    folder
        .get_file(rel)
        .await
        .unwrap()
        .complete()
        .await
        .unwrap()
        .to_vec()
        .await
        .unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_fresh_sync_to_encrypted_folder() {
    let fx = fixture(true, true);
    write_file(&fx.src_root, "a.txt", b"hello", 1000);
    write_file(&fx.src_root, "b/c.txt", &[7u8; 17], 1001);

    let report = run(&fx).await;
    assert_eq!(report.status, TaskStatus::Finished);
    assert_eq!(report.summary.new, 3);
    assert_eq!(report.stage(Stage::Check).unwrap().status, TaskStatus::Finished);

    let nodes: Vec<(String, NodeType, u64, usize)> = dst_nodes(&fx)
        .await
        .into_iter()
        .map(|n| (n.path, n.node_type, n.padded_size, n.ivs.len()))
        .collect();
    assert_eq!(
        nodes,
        vec![
            ("/d/a.txt".to_string(), NodeType::File, 16, 16),
            ("/d/b/".to_string(), NodeType::Dir, 0, 16),
            ("/d/b/c.txt".to_string(), NodeType::File, 32, 32),
        ]
    );
    assert_eq!(difflist(&fx).await.count_target("src", "dst").await.unwrap(), 0);
    assert_eq!(read_dst(&fx, "a.txt").await, b"hello");
    assert_eq!(read_dst(&fx, "b/c.txt").await, vec![7u8; 17]);

    // Nothing is planned on an unchanged tree.
    let again = run(&fx).await;
    assert_eq!(again.status, TaskStatus::Finished);
    assert_eq!(again.summary.total(), 0);
}

#[tokio::test]
async fn test_size_change_updates_in_place() {
    let fx = fixture(true, true);
    write_file(&fx.src_root, "a.txt", b"hello", 1000);
    assert_eq!(run(&fx).await.status, TaskStatus::Finished);
    let before = dst_nodes(&fx).await;
    assert_eq!(before[0].padded_size, 16);
    let stored = fx.mem.paths();

    write_file(&fx.src_root, "a.txt", &[1u8; 17], 1002);
    let report = run(&fx).await;
    assert_eq!(report.status, TaskStatus::Finished);
    assert_eq!(report.summary.update, 1);
    assert_eq!(report.summary.new, 0);

    let after = dst_nodes(&fx).await;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].padded_size, 32);
    // The known IVs are reused, so the ciphertext name does not change.
    assert_eq!(after[0].ivs, before[0].ivs);
    assert_eq!(fx.mem.paths(), stored);
    assert_eq!(read_dst(&fx, "a.txt").await, vec![1u8; 17]);
}

#[tokio::test]
async fn test_removed_directory_is_one_difference() {
    let fx = fixture(false, true);
    let at = Utc.timestamp_opt(5, 0).unwrap();
    fx.mem.put_file("/d/x/y/z.txt", b"zzz".to_vec(), at).unwrap();

    let names = vec!["src".to_string(), "dst".to_string()];
    let scans = fx.env.scan_folders(&names).await.unwrap();
    assert!(scans.iter().all(|s| s.status == TaskStatus::Finished));
    let spec = fx.env.target("t").unwrap();
    let summary = fx.env.build_diff(&spec).await.unwrap();
    assert_eq!(summary.total(), 1);

    let rows = difflist(&fx)
        .await
        .select("src", "dst", &[], None)
        .collect_all()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].diff_type, DiffType::Rm);
    assert_eq!(rows[0].node_type, NodeType::Dir);
    assert_eq!(rows[0].path.trim_end_matches('/'), "x");

    let report = run(&fx).await;
    assert_eq!(report.status, TaskStatus::Finished);
    assert_eq!(fx.mem.paths(), vec!["/d/".to_string()]);
    assert!(dst_nodes(&fx).await.is_empty());
}

#[tokio::test]
async fn test_no_remove_keeps_extra_entries() {
    let fx = fixture(false, true);
    let at = Utc.timestamp_opt(5, 0).unwrap();
    fx.mem.put_file("/d/old.txt", b"old".to_vec(), at).unwrap();
    write_file(&fx.src_root, "new.txt", b"new", 1000);

    let flags = TargetFlags {
        no_remove: true,
        ..TargetFlags::default()
    };
    let report = run_with(&fx, flags).await;
    assert_eq!(report.status, TaskStatus::Finished);
    assert_eq!(report.stage(Stage::Rm).unwrap().status, TaskStatus::Skipped);
    assert_eq!(
        fx.mem.paths(),
        vec!["/d/".to_string(), "/d/new.txt".to_string(), "/d/old.txt".to_string()]
    );
}

#[tokio::test]
async fn test_duplicates_are_detected_and_removed() {
    let fx = fixture(true, true);
    let older = Utc.timestamp_opt(10, 0).unwrap();
    let newer = Utc.timestamp_opt(20, 0).unwrap();
    let (old_name, _) =
        encrypt_filename("dup.bin", &fx.master_key, &[1u8; 16], FilenameEncoding::Base64).unwrap();
    let (new_name, _) =
        encrypt_filename("dup.bin", &fx.master_key, &[2u8; 16], FilenameEncoding::Base64).unwrap();
    let content = encrypt_bytes(&fx.data_key, b"payload").unwrap();
    fx.mem
        .put_file(&format!("/d/{old_name}"), content.clone(), older)
        .unwrap();
    fx.mem
        .put_file(&format!("/d/{new_name}"), content, newer)
        .unwrap();

    let reports = fx.env.scan_folders(&["dst".to_string()]).await.unwrap();
    assert_eq!(reports[0].status, TaskStatus::Finished);
    assert_eq!(reports[0].duplicates, 1);

    let nodes = dst_nodes(&fx).await;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].path, "/d/dup.bin");
    assert_eq!(nodes[0].ivs, vec![2u8; 16]);
    let duplist = fx.env.duplist("mem").await.unwrap();
    let rows = duplist.select_all().collect_all().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].ivs, vec![1u8; 16]);

    let remover = fx.env.duplicate_remover("dst").await.unwrap();
    let counts = remover.run().await.unwrap();
    assert_eq!(counts.finished, 1);
    assert_eq!(
        fx.mem.paths(),
        vec!["/d/".to_string(), format!("/d/{new_name}")]
    );
    assert_eq!(duplist.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_case_collision_fails_integrity_check() {
    let fx = fixture(false, false);
    write_file(&fx.src_root, "Foo.txt", b"upper", 1000);
    write_file(&fx.src_root, "foo.txt", &[3u8; 17], 1000);

    let report = run(&fx).await;
    assert_eq!(report.stage(Stage::Files).unwrap().status, TaskStatus::Finished);
    assert_eq!(report.stage(Stage::Check).unwrap().status, TaskStatus::Failed);
    assert_eq!(report.status, TaskStatus::Failed);

    let files: Vec<String> = fx
        .mem
        .paths()
        .into_iter()
        .filter(|p| !p.ends_with('/'))
        .collect();
    assert_eq!(files.len(), 1);
    assert!(difflist(&fx).await.count_target("src", "dst").await.unwrap() > 0);
}

#[tokio::test]
async fn test_stopped_upload_resumes_from_scratch() {
    let fx = fixture(true, true);
    let data: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    write_file(&fx.src_root, "big.bin", &data, 1000);

    let mut spec = fx.env.target("t").unwrap();
    spec.flags.upload_limit = Some(4 * 1024 * 1024);
    let mut sync = fx.env.synchronizer(spec).await.unwrap();
    let registry = Arc::clone(fx.env.registry());
    let id = sync.id();
    let mut received = fx.mem.watch_received();
    let stopper = tokio::spawn(async move {
        // Stop as soon as the first chunk has reached the destination.
        received.wait_for(|n| *n > 0).await.unwrap();
        registry.stop(id);
    });

    let report = sync.run().await;
    stopper.await.unwrap();
    assert_eq!(report.status, TaskStatus::Suspended);
    assert_eq!(report.stage(Stage::Files).unwrap().status, TaskStatus::Suspended);
    assert!(report.stage(Stage::Check).is_none());
    assert!(dst_nodes(&fx).await.is_empty());
    assert_eq!(fx.mem.paths(), vec!["/d/".to_string()]);
    assert_eq!(difflist(&fx).await.count_target("src", "dst").await.unwrap(), 1);

    let resumed = run(&fx).await;
    assert_eq!(resumed.status, TaskStatus::Finished);
    assert_eq!(resumed.summary.new, 1);
    assert_eq!(read_dst(&fx, "big.bin").await, data);
}

#[tokio::test]
async fn test_kind_change_both_ways() {
    for encrypted in [false, true] {
        let fx = fixture(encrypted, true);
        write_file(&fx.src_root, "p", b"plain file", 1000);
        assert_eq!(run(&fx).await.status, TaskStatus::Finished);

        // file -> directory
        std::fs::remove_file(fx.src_root.join("p")).unwrap();
        write_file(&fx.src_root, "p/x", b"inside", 1001);
        let report = run(&fx).await;
        assert_eq!(report.status, TaskStatus::Finished, "encrypted: {encrypted}");
        assert_eq!((report.summary.new, report.summary.rm), (2, 1));
        let kinds: Vec<(String, NodeType)> = dst_nodes(&fx)
            .await
            .into_iter()
            .map(|n| (n.path, n.node_type))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("/d/p/".to_string(), NodeType::Dir),
                ("/d/p/x".to_string(), NodeType::File),
            ]
        );
        assert_eq!(read_dst(&fx, "p/x").await, b"inside");

        // directory -> file
        std::fs::remove_dir_all(fx.src_root.join("p")).unwrap();
        write_file(&fx.src_root, "p", b"file again", 1002);
        let report = run(&fx).await;
        assert_eq!(report.status, TaskStatus::Finished, "encrypted: {encrypted}");
        assert_eq!((report.summary.new, report.summary.rm), (1, 1));
        let nodes = dst_nodes(&fx).await;
        assert_eq!(nodes.len(), 1);
        assert_eq!((nodes[0].path.as_str(), nodes[0].node_type), ("/d/p", NodeType::File));
        assert_eq!(read_dst(&fx, "p").await, b"file again");

        assert_eq!(run(&fx).await.summary.total(), 0);
    }
}
