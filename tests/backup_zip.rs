#[path = "../src/backup.rs"]
mod backup;

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn write_bundle(path: &Path, manifest: &serde_json::Value, db: &[u8]) {
    let f = File::create(path).expect("create bundle");
    let mut zip = zip::ZipWriter::new(f);
    let opts = FileOptions::default();
    zip.start_file("manifest.json", opts).expect("manifest entry");
    zip.write_all(manifest.to_string().as_bytes())
        .expect("write manifest");
    zip.start_file("db/academy.sqlite3", opts).expect("db entry");
    zip.write_all(db).expect("write db");
    zip.finish().expect("finish zip");
}

#[test]
fn bundle_export_carries_checksum_and_restores_database() {
    let workspace = temp_dir("academy-backup-src");
    let restored_ws = temp_dir("academy-backup-dst");
    let out_dir = temp_dir("academy-backup-out");

    let bytes = b"academy-sqlite-payload";
    std::fs::write(workspace.join("academy.sqlite3"), bytes).expect("write source db");
    // Stale data in the target is replaced.
    std::fs::write(restored_ws.join("academy.sqlite3"), b"old").expect("write stale db");

    let bundle_path = out_dir.join("nested").join("academy-backup.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT);
    assert_eq!(export.entry_count, 2);
    assert_eq!(export.db_sha256.len(), 64);

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    assert_eq!(archive.len(), 2);
    let mut manifest_text = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest_text)
        .expect("read manifest");
    let manifest: serde_json::Value = serde_json::from_str(&manifest_text).expect("manifest json");
    assert_eq!(manifest["format"], backup::BUNDLE_FORMAT);
    assert_eq!(manifest["dbSha256"].as_str(), Some(export.db_sha256.as_str()));

    let import =
        backup::import_workspace_bundle(&bundle_path, &restored_ws).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT);
    let restored = std::fs::read(restored_ws.join("academy.sqlite3")).expect("read restored db");
    assert_eq!(restored, bytes);
    assert!(!restored_ws.join("academy.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(restored_ws);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn export_without_database_fails() {
    let workspace = temp_dir("academy-backup-empty");
    let result =
        backup::export_workspace_bundle(&workspace, &workspace.join("out.zip"));
    assert!(result.is_err());
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn tampered_or_foreign_bundles_are_rejected() {
    let dir = temp_dir("academy-backup-bad");
    let workspace = temp_dir("academy-backup-bad-dst");
    std::fs::write(workspace.join("academy.sqlite3"), b"keep me").expect("write existing db");

    let tampered = dir.join("tampered.zip");
    write_bundle(
        &tampered,
        &serde_json::json!({ "format": backup::BUNDLE_FORMAT, "dbSha256": "00" }),
        b"payload",
    );
    let err = backup::import_workspace_bundle(&tampered, &workspace)
        .expect_err("checksum mismatch");
    assert!(err.to_string().contains("checksum"), "{}", err);

    let foreign = dir.join("foreign.zip");
    write_bundle(
        &foreign,
        &serde_json::json!({ "format": "someone-else-v9" }),
        b"payload",
    );
    let err = backup::import_workspace_bundle(&foreign, &workspace).expect_err("foreign format");
    assert!(err.to_string().contains("unsupported"), "{}", err);

    let kept = std::fs::read(workspace.join("academy.sqlite3")).expect("read kept db");
    assert_eq!(kept, b"keep me");

    let _ = std::fs::remove_dir_all(dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn plain_sqlite_file_imports_as_legacy_copy() {
    let dir = temp_dir("academy-backup-legacy");
    let workspace = dir.join("fresh-workspace");

    let legacy_file = dir.join("academy-old.sqlite3");
    let bytes = b"SQLite format 3\0rest";
    std::fs::write(&legacy_file, bytes).expect("write legacy sqlite file");

    let import =
        backup::import_workspace_bundle(&legacy_file, &workspace).expect("import legacy sqlite");
    assert_eq!(import.bundle_format_detected, backup::LEGACY_SQLITE_FORMAT);
    let restored = std::fs::read(workspace.join("academy.sqlite3")).expect("read restored sqlite");
    assert_eq!(restored, bytes);

    let _ = std::fs::remove_dir_all(dir);
}
