//! Workspace backup bundles: a zip holding a manifest and the database file.

use crate::db::DB_FILE_NAME;
use anyhow::{anyhow, Context};
use serde::Serialize;
use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/tutor.sqlite3";
pub const BUNDLE_FORMAT: &str = "tutord-workspace-v1";
const RAW_SQLITE_FORMAT: &str = "raw-sqlite3";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub bundle_format_detected: String,
}

/// Write the workspace database into a bundle at `out_path`. The caller
/// must not hold an open write transaction.
pub fn export_workspace(workspace: &Path, out_path: &Path) -> anyhow::Result<ExportSummary> {
    let db_path = workspace.join(DB_FILE_NAME);
    if !db_path.is_file() {
        return Err(anyhow!("workspace database not found: {}", db_path.display()));
    }
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create bundle {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": crate::model::now(),
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())
        .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;
    zip.finish().context("failed to finalize bundle")?;

    let bytes = std::fs::metadata(out_path).map(|m| m.len()).unwrap_or(0);
    tracing::info!(path = %out_path.display(), bytes, "workspace exported");
    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        entry_count: 2,
        bytes,
    })
}

/// Replace the workspace database with the one in `in_path`. Accepts a
/// bundle or a bare SQLite file. The workspace must be reopened afterwards.
pub fn import_workspace(in_path: &Path, workspace: &Path) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.display()))?;
    let dst = workspace.join(DB_FILE_NAME);
    let staged = workspace.join(format!("{}.importing", DB_FILE_NAME));
    if staged.exists() {
        std::fs::remove_file(&staged)
            .with_context(|| format!("failed to clear {}", staged.display()))?;
    }

    let detected = match sniff(in_path)? {
        Signature::Zip => {
            extract_bundle(in_path, &staged)?;
            BUNDLE_FORMAT
        }
        Signature::Sqlite => {
            std::fs::copy(in_path, &staged)
                .with_context(|| format!("failed to copy {}", in_path.display()))?;
            RAW_SQLITE_FORMAT
        }
        Signature::Unknown => return Err(anyhow!("not a workspace bundle: {}", in_path.display())),
    };

    if dst.exists() {
        std::fs::remove_file(&dst)
            .with_context(|| format!("failed to remove existing database {}", dst.display()))?;
    }
    std::fs::rename(&staged, &dst)
        .with_context(|| format!("failed to move imported database to {}", dst.display()))?;

    tracing::info!(path = %in_path.display(), format = detected, "workspace imported");
    Ok(ImportSummary {
        bundle_format_detected: detected.to_string(),
    })
}

fn extract_bundle(in_path: &Path, staged: &Path) -> anyhow::Result<()> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.display()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest.get("format").and_then(|v| v.as_str()).unwrap_or("");
    if format != BUNDLE_FORMAT {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }

    let mut out = File::create(staged)
        .with_context(|| format!("failed to create {}", staged.display()))?;
    let mut entry = archive
        .by_name(DB_ENTRY)
        .with_context(|| format!("bundle missing {}", DB_ENTRY))?;
    std::io::copy(&mut entry, &mut out).context("failed to extract database entry")?;
    out.flush().context("failed to flush extracted database")?;
    Ok(())
}

enum Signature {
    Zip,
    Sqlite,
    Unknown,
}

fn sniff(path: &Path) -> anyhow::Result<Signature> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.display()))?;
    let mut head = [0u8; 16];
    let read = f.read(&mut head).context("failed to read file signature")?;
    if read >= 4 && head[..4] == [0x50, 0x4B, 0x03, 0x04] {
        return Ok(Signature::Zip);
    }
    if read == 16 && &head == b"SQLite format 3\0" {
        return Ok(Signature::Sqlite);
    }
    Ok(Signature::Unknown)
}
