//! Parquet snapshot of the canonical records produced by one sync.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use scout_core::{CanonicalRecord, SyncScope};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

pub const PLAYERS_FILE: &str = "players.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub league: String,
    pub sync_id: String,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Writes `<export_dir>/<league-slug>/<sync_id>/{players.parquet,manifest.json}`
/// and returns the manifest path.
pub async fn export_snapshot(
    export_dir: &Path,
    scope: &SyncScope,
    sync_id: &str,
    records: &[CanonicalRecord],
) -> Result<PathBuf> {
    let snapshot_dir = export_dir.join(scope.slug()).join(sync_id);
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let players_path = snapshot_dir.join(PLAYERS_FILE);
    write_players_parquet(&players_path, records)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        league: scope.league.clone(),
        sync_id: sync_id.to_string(),
        files: vec![manifest_entry("players", &snapshot_dir, &players_path, records.len())?],
    };
    let manifest_path = snapshot_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(path = %manifest_path.display(), rows = records.len(), "snapshot exported");
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_players_parquet(path: &Path, records: &[CanonicalRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("league", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("club", DataType::Utf8, true),
        ArrowField::new("market_value", DataType::Float64, true),
        ArrowField::new("rating", DataType::Float64, true),
        ArrowField::new("source_count", DataType::UInt32, false),
        ArrowField::new("sources", DataType::Utf8, false),
        ArrowField::new("attributes_json", DataType::Utf8, false),
        ArrowField::new("last_updated", DataType::Utf8, false),
    ]));

    let ids = StringArray::from(records.iter().map(|r| r.id.to_string()).collect::<Vec<_>>());
    let leagues = StringArray::from(records.iter().map(|r| r.league.as_str()).collect::<Vec<_>>());
    let names = StringArray::from(records.iter().map(|r| r.name.as_str()).collect::<Vec<_>>());
    let clubs = StringArray::from(records.iter().map(|r| r.club.as_deref()).collect::<Vec<_>>());
    let market_values = Float64Array::from(records.iter().map(|r| r.market_value).collect::<Vec<_>>());
    let ratings = Float64Array::from(records.iter().map(|r| r.rating).collect::<Vec<_>>());
    let source_counts = UInt32Array::from(
        records
            .iter()
            .map(|r| r.sources.len() as u32)
            .collect::<Vec<_>>(),
    );
    let sources = StringArray::from(
        records
            .iter()
            .map(|r| r.sources.iter().cloned().collect::<Vec<_>>().join(","))
            .collect::<Vec<_>>(),
    );
    let attributes = StringArray::from(
        records
            .iter()
            .map(|r| serde_json::to_string(&r.attributes))
            .collect::<Result<Vec<_>, _>>()
            .context("serializing record attributes")?,
    );
    let updated = StringArray::from(
        records
            .iter()
            .map(|r| r.last_updated.to_rfc3339())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(leagues),
            Arc::new(names),
            Arc::new(clubs),
            Arc::new(market_values),
            Arc::new(ratings),
            Arc::new(source_counts),
            Arc::new(sources),
            Arc::new(attributes),
            Arc::new(updated),
        ],
    )
    .context("building players record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, base: &Path, path: &Path, rows: usize) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}
