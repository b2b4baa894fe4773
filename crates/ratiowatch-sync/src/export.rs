//! Parquet export of the measurement history and session log.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field, Schema};
use chrono::{DateTime, SecondsFormat, Utc};
use parquet::arrow::ArrowWriter;
use ratiowatch_core::IngestionSession;
use ratiowatch_storage::{MeasurementQuery, MeasurementRow, SessionTracker, SnapshotStore, Store};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `measurements.parquet`, `sessions.parquet` and `manifest.json` into `out_dir`.
pub async fn export_history(store: &Store, out_dir: &Path) -> Result<ExportManifest> {
    let rows = SnapshotStore::new(store)
        .history(&MeasurementQuery::default())
        .await
        .context("loading measurement history")?;
    let sessions = SessionTracker::new(store)
        .all()
        .await
        .context("loading sessions")?;

    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let measurements_path = out_dir.join("measurements.parquet");
    let sessions_path = out_dir.join("sessions.parquet");
    write_measurements_parquet(&measurements_path, &rows)?;
    write_sessions_parquet(&sessions_path, &sessions)?;

    let manifest = ExportManifest {
        schema_version: 1,
        exported_at: Utc::now(),
        files: vec![
            manifest_entry("measurements", out_dir, &measurements_path, rows.len())?,
            manifest_entry("sessions", out_dir, &sessions_path, sessions.len())?,
        ],
    };
    let manifest_path = out_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    tokio::fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(
        out_dir = %out_dir.display(),
        measurements = rows.len(),
        sessions = sessions.len(),
        "history exported"
    );
    Ok(manifest)
}

fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
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

fn write_measurements_parquet(path: &Path, rows: &[MeasurementRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("source_code", DataType::Utf8, false),
        Field::new("unit", DataType::Utf8, false),
        Field::new("sub_unit", DataType::Utf8, false),
        Field::new("sub_unit_is_target", DataType::Boolean, false),
        Field::new("label", DataType::Utf8, false),
        Field::new("label_category", DataType::Utf8, false),
        Field::new("capacity", DataType::UInt32, false),
        Field::new("applicants", DataType::UInt32, false),
        Field::new("ratio", DataType::Float64, false),
        Field::new("observed_at", DataType::Utf8, false),
        Field::new("session_id", DataType::Utf8, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.id))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.source_code.as_str()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.unit_name.as_str()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.sub_unit_name.as_str()))),
            Arc::new(BooleanArray::from(rows.iter().map(|r| r.sub_unit_is_target).collect::<Vec<_>>())),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.label.as_str()))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.label_category.as_str()))),
            Arc::new(UInt32Array::from_iter_values(rows.iter().map(|r| r.capacity))),
            Arc::new(UInt32Array::from_iter_values(rows.iter().map(|r| r.applicants))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.ratio))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| timestamp(r.observed_at)))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.session_id.to_string()))),
        ],
    )
    .context("building measurements record batch")?;
    write_parquet(path, batch)
}

fn write_sessions_parquet(path: &Path, sessions: &[IngestionSession]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("source_code", DataType::Utf8, false),
        Field::new("started_at", DataType::Utf8, false),
        Field::new("finished_at", DataType::Utf8, true),
        Field::new("status", DataType::Utf8, false),
        Field::new("records_collected", DataType::UInt32, false),
        Field::new("error_message", DataType::Utf8, true),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from_iter_values(sessions.iter().map(|s| s.id.to_string()))),
            Arc::new(StringArray::from_iter_values(sessions.iter().map(|s| s.source_code.as_str()))),
            Arc::new(StringArray::from_iter_values(sessions.iter().map(|s| timestamp(s.started_at)))),
            Arc::new(StringArray::from(
                sessions
                    .iter()
                    .map(|s| s.finished_at.map(timestamp))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from_iter_values(sessions.iter().map(|s| s.status.as_str()))),
            Arc::new(UInt32Array::from_iter_values(sessions.iter().map(|s| s.records_collected))),
            Arc::new(StringArray::from(
                sessions
                    .iter()
                    .map(|s| s.error_message.as_deref())
                    .collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building sessions record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, out_dir: &Path, path: &Path, rows: usize) -> Result<ExportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(out_dir).unwrap_or(path).display().to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256: hex::encode(Sha256::digest(&bytes)),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use ratiowatch_core::{LayoutFamily, Observation, SourceProfile};

    fn parquet_rows(path: &Path) -> usize {
        let file = File::open(path).unwrap();
        ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap()
            .map(|batch| batch.unwrap().num_rows())
            .sum()
    }

    #[tokio::test]
    async fn export_writes_history_and_manifest() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .register_sources(&[SourceProfile {
                code: "KMU".into(),
                display_name: "계명대학교".into(),
                url: "https://kmu.test".into(),
                layout: LayoutFamily::Uway,
                enabled: true,
                target_unit: None,
                target_sub_units: Vec::new(),
                name_rules: Vec::new(),
            }])
            .await
            .unwrap();
        let sessions = SessionTracker::new(&store);
        let ok = sessions.begin("KMU").await.unwrap();
        let saved = SnapshotStore::new(&store)
            .save_batch(
                ok,
                &[Observation {
                    source_code: "KMU".into(),
                    unit_name: "공과대학".into(),
                    sub_unit_name: "컴퓨터공학과".into(),
                    label: "일반전형".into(),
                    is_target: true,
                    capacity: 45,
                    applicants: 312,
                }],
            )
            .await;
        sessions.complete(ok, saved.saved as u32).await.unwrap();
        let failed = sessions.begin("KMU").await.unwrap();
        sessions.fail(failed, "http status 503").await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let manifest = export_history(&store, dir.path()).await.unwrap();

        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].rows, 1);
        assert_eq!(manifest.files[1].rows, 2);
        assert_eq!(parquet_rows(&dir.path().join("measurements.parquet")), 1);
        assert_eq!(parquet_rows(&dir.path().join("sessions.parquet")), 2);

        let bytes = std::fs::read(dir.path().join("measurements.parquet")).unwrap();
        assert_eq!(manifest.files[0].sha256, hex::encode(Sha256::digest(&bytes)));

        let written: ExportManifest =
            serde_json::from_slice(&std::fs::read(dir.path().join("manifest.json")).unwrap()).unwrap();
        assert_eq!(written.files[1].path, "sessions.parquet");
    }
}
