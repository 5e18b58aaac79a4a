use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const WORKSPACE_DB: &str = "academy.sqlite3";
const IMPORT_STAGING: &str = "academy.sqlite3.importing";
const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/academy.sqlite3";
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
pub const BUNDLE_FORMAT: &str = "academy-workspace-v1";
pub const LEGACY_SQLITE_FORMAT: &str = "legacy-sqlite3";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    format: String,
    #[serde(default)]
    version: u32,
    #[serde(default)]
    app_version: String,
    #[serde(default)]
    exported_at: String,
    #[serde(default)]
    db_sha256: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub db_sha256: String,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Writes `manifest.json` and the database file into a deflated zip.
pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(WORKSPACE_DB);
    if !db_path.is_file() {
        bail!("workspace database not found: {}", db_path.display());
    }
    let db_bytes =
        std::fs::read(&db_path).with_context(|| format!("failed to read {}", db_path.display()))?;
    let manifest = Manifest {
        format: BUNDLE_FORMAT.to_string(),
        version: 1,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        db_sha256: Some(sha256_hex(&db_bytes)),
    };

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create output file {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest_json =
        serde_json::to_vec_pretty(&manifest).context("failed to serialize manifest")?;
    for (name, bytes) in [(MANIFEST_ENTRY, manifest_json.as_slice()), (DB_ENTRY, db_bytes.as_slice())] {
        zip.start_file(name, opts)
            .with_context(|| format!("failed to start entry {}", name))?;
        zip.write_all(bytes)
            .with_context(|| format!("failed to write entry {}", name))?;
    }
    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: manifest.format,
        entry_count: 2,
        db_sha256: manifest.db_sha256.unwrap_or_default(),
    })
}

fn starts_with_zip_magic(path: &Path) -> anyhow::Result<bool> {
    let mut f =
        File::open(path).with_context(|| format!("failed to open input file {}", path.display()))?;
    let mut sig = [0u8; 4];
    let n = f.read(&mut sig).context("failed to read file signature")?;
    Ok(n == sig.len() && sig == ZIP_MAGIC)
}

/// Reads and verifies the database entry of a bundle.
fn read_bundle_db(in_path: &Path) -> anyhow::Result<Vec<u8>> {
    let in_file =
        File::open(in_path).with_context(|| format!("failed to open bundle {}", in_path.display()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let manifest: Manifest = {
        let entry = archive
            .by_name(MANIFEST_ENTRY)
            .context("bundle missing manifest.json")?;
        serde_json::from_reader(entry).context("manifest.json is invalid")?
    };
    if manifest.format != BUNDLE_FORMAT {
        bail!("unsupported bundle format: {}", manifest.format);
    }

    let mut db_bytes = Vec::new();
    archive
        .by_name(DB_ENTRY)
        .with_context(|| format!("bundle missing {}", DB_ENTRY))?
        .read_to_end(&mut db_bytes)
        .context("failed to extract database entry")?;

    if let Some(expected) = manifest.db_sha256.as_deref() {
        let actual = sha256_hex(&db_bytes);
        if !actual.eq_ignore_ascii_case(expected) {
            bail!(
                "database checksum mismatch: manifest {} but entry hashes to {}",
                expected,
                actual
            );
        }
    }
    Ok(db_bytes)
}

/// Stages the bytes next to the live file, then swaps them in.
fn replace_database(workspace_path: &Path, db_bytes: &[u8]) -> anyhow::Result<()> {
    let staging = workspace_path.join(IMPORT_STAGING);
    let dst = workspace_path.join(WORKSPACE_DB);
    {
        let mut out = File::create(&staging)
            .with_context(|| format!("failed to create {}", staging.display()))?;
        out.write_all(db_bytes)
            .context("failed to write extracted database")?;
        out.sync_all().context("failed to flush extracted database")?;
    }
    if dst.exists() {
        std::fs::remove_file(&dst)
            .with_context(|| format!("failed to remove existing database {}", dst.display()))?;
    }
    std::fs::rename(&staging, &dst)
        .with_context(|| format!("failed to move extracted database to {}", dst.display()))?;
    Ok(())
}

/// Restores a bundle into the workspace. A file without the zip signature
/// is taken to be a plain SQLite copy.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path)
        .with_context(|| format!("failed to create workspace {}", workspace_path.display()))?;

    if !starts_with_zip_magic(in_path)? {
        let dst = workspace_path.join(WORKSPACE_DB);
        std::fs::copy(in_path, &dst).with_context(|| {
            format!(
                "failed to copy sqlite backup from {} to {}",
                in_path.display(),
                dst.display()
            )
        })?;
        return Ok(ImportSummary {
            bundle_format_detected: LEGACY_SQLITE_FORMAT.to_string(),
        });
    }

    let db_bytes = read_bundle_db(in_path)?;
    replace_database(workspace_path, &db_bytes)?;
    Ok(ImportSummary {
        bundle_format_detected: BUNDLE_FORMAT.to_string(),
    })
}
