//! Integration tests for FolderStorage over the in-memory and local backends

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use encsync_cache::{CdbRegistry, DataDir, Filelist};
use encsync_core::crypto::content::{decrypt_bytes, encrypt_bytes, encrypted_size};
use encsync_core::crypto::Key;
use encsync_core::domain::{FilenameEncoding, Folder, Node};
use encsync_core::ports::{BoxedReader, Storage};
use encsync_storage::{FolderStorage, LocalStorage, MemoryStorage};

// ============================================================================
// Test helpers
// ============================================================================

fn master_key() -> Key {
    Key::new(vec![7u8; 32]).unwrap()
}

fn data_key() -> Key {
    Key::new(vec![9u8; 32]).unwrap()
}

fn reader(data: &[u8]) -> BoxedReader {
    Box::new(std::io::Cursor::new(data.to_vec()))
}

fn encrypted_folder(storage: &MemoryStorage) -> FolderStorage {
    let folder = Folder::new("vault", storage.name(), "/enc").encrypted(FilenameEncoding::Base64);
    FolderStorage::new(
        Arc::new(storage.clone()),
        folder,
        Some(master_key()),
        Some(data_key()),
    )
    .unwrap()
}

async fn filelist(dir: &TempDir, registry: &CdbRegistry) -> Filelist {
    let layout = DataDir::new(dir.path());
    Filelist::open(registry, &layout, "vault", "mem").await.unwrap()
}

// ============================================================================
// Plaintext folders
// ============================================================================

#[tokio::test]
async fn test_plain_folder_maps_paths_under_prefix() {
    let storage = MemoryStorage::new("mem");
    storage.put_dir("/data", Utc::now()).unwrap();
    let folder = FolderStorage::new(
        Arc::new(storage.clone()),
        Folder::new("plain", "mem", "/data"),
        None,
        None,
    )
    .unwrap();

    assert!(folder.mkdir("docs").await.unwrap().is_empty());
    let (controller, ivs) = folder.upload(reader(b"hello"), 5, "docs/a.txt").await.unwrap();
    assert!(ivs.is_empty());
    controller.work().await.unwrap();

    assert_eq!(storage.read_file("/data/docs/a.txt").unwrap(), b"hello");
    let names: Vec<String> = folder
        .listdir("docs")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.name)
        .collect();
    assert_eq!(names, vec!["a.txt"]);

    let buffer = folder.get_file("docs/a.txt").await.unwrap().complete().await.unwrap();
    assert_eq!(buffer.to_vec().await.unwrap(), b"hello");
}

#[tokio::test]
async fn test_encrypted_reader_of_plain_local_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("note.txt"), b"0123456789abcdefXYZ").unwrap();
    let folder = FolderStorage::new(
        Arc::new(LocalStorage::new("disk", dir.path())),
        Folder::new("src", "disk", "/"),
        Some(master_key()),
        Some(data_key()),
    )
    .unwrap();

    let mut pending = folder.get_encrypted_file("note.txt").await.unwrap();
    pending.controller().set_limit(None);
    let cipher = pending.complete().await.unwrap().to_vec().await.unwrap();

    assert_eq!(cipher.len() as u64, encrypted_size(19));
    assert_eq!(decrypt_bytes(&data_key(), &cipher).unwrap(), b"0123456789abcdefXYZ");
}

#[tokio::test]
async fn test_missing_file_is_not_found() {
    let storage = MemoryStorage::new("mem");
    let folder = FolderStorage::new(
        Arc::new(storage),
        Folder::new("plain", "mem", "/"),
        Some(master_key()),
        Some(data_key()),
    )
    .unwrap();

    let err = folder.get_encrypted_file("nope").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(folder.get_file("nope").await.unwrap_err().is_not_found());
}

// ============================================================================
// Encrypted folders
// ============================================================================

#[tokio::test]
async fn test_encrypted_folder_requires_keys() {
    let storage = MemoryStorage::new("mem");
    let folder = Folder::new("vault", "mem", "/enc").encrypted(FilenameEncoding::Base64);
    assert!(FolderStorage::new(Arc::new(storage), folder, None, None).is_err());
}

#[tokio::test]
async fn test_encrypted_names_keep_prefix_plaintext() {
    let storage = MemoryStorage::new("mem");
    storage.put_dir("/enc", Utc::now()).unwrap();
    let folder = encrypted_folder(&storage);

    let ivs = folder.mkdir("photos").await.unwrap();
    assert_eq!(ivs.len(), 16);

    let paths = storage.paths();
    assert_eq!(paths.len(), 2);
    assert_eq!(paths[0], "/enc/");
    assert!(paths[1].starts_with("/enc/"));
    assert!(!paths[1].contains("photos"));

    let (storage_path, _) = folder.encode_with_ivs("photos", &ivs).unwrap();
    assert_eq!(folder.decode_path(&storage_path).unwrap(), ("photos".to_string(), ivs));
}

#[tokio::test]
async fn test_filelist_ivs_make_names_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let registry = CdbRegistry::default();
    let filelist = filelist(&dir, &registry).await;

    let storage = MemoryStorage::new("mem");
    storage.put_dir("/enc", Utc::now()).unwrap();
    let folder = encrypted_folder(&storage).with_filelist(filelist.clone());

    let dir_ivs = folder.mkdir("a").await.unwrap();
    filelist
        .insert_node(&Node::dir("/enc/a", Utc.timestamp_opt(1, 0).unwrap(), dir_ivs.clone()))
        .await
        .unwrap();

    // A known node encodes to the same storage path every time.
    let (first, _) = folder.encode_path("a").await.unwrap();
    let (second, again) = folder.encode_path("a/").await.unwrap();
    assert_eq!(first.trim_end_matches('/'), second.trim_end_matches('/'));
    assert_eq!(again, dir_ivs);

    // A new child reuses the parent's IVs and gets one fresh IV.
    let (controller, file_ivs) = folder.upload(reader(b"x"), 1, "a/f.bin").await.unwrap();
    controller.work().await.unwrap();
    assert_eq!(file_ivs.len(), 32);
    assert_eq!(&file_ivs[..16], dir_ivs.as_slice());

    let listed = folder.listdir("a").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "f.bin");
}

#[tokio::test]
async fn test_encrypted_round_trip_through_readers() {
    let storage = MemoryStorage::new("mem");
    storage.put_dir("/enc", Utc::now()).unwrap();
    let folder = encrypted_folder(&storage);

    let plain = b"secret contents of some length".to_vec();
    let cipher = encrypt_bytes(&data_key(), &plain).unwrap();
    let (controller, _) = folder
        .upload(reader(&cipher), cipher.len() as u64, "s.txt")
        .await
        .unwrap();
    controller.work().await.unwrap();

    let decrypted = folder.get_file("s.txt").await;
    // Without a filelist the name is re-encrypted with a fresh IV.
    assert!(decrypted.unwrap_err().is_not_found());

    let entries = folder.list_storage_dir("/enc").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].meta.name, "s.txt");
    assert_eq!(entries[0].meta.size, cipher.len() as u64);

    let buffer = folder
        .get_file_with_ivs("s.txt", &entries[0].iv)
        .await
        .unwrap()
        .complete()
        .await
        .unwrap();
    assert_eq!(buffer.to_vec().await.unwrap(), plain);
}

#[tokio::test]
async fn test_undecryptable_names_are_skipped() {
    let storage = MemoryStorage::new("mem");
    storage.put_file("/enc/not-a-ciphertext", b"x".to_vec(), Utc::now()).unwrap();
    let folder = encrypted_folder(&storage);

    let entries = folder.list_storage_dir("/enc").await.unwrap();
    assert!(entries.is_empty());
}
