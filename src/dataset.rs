//! Dataset snapshots and the shared store they are published through.
//!
//! An upload produces an immutable [`DatasetSnapshot`] (frame + schema +
//! fingerprint). The [`DatasetStore`] swaps the current snapshot wholesale;
//! requests clone the `Arc` once at routing time and keep using that copy even
//! if a reload happens while they run.

use crate::error::{NlqError, Result};
use crate::schema::{render_any_value, SchemaContext};
use crate::vocabulary::Vocabulary;
use polars::prelude::*;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

/// One uploaded dataset, ready to be queried.
#[derive(Debug, Clone)]
pub struct DatasetSnapshot {
    frame: DataFrame,
    schema: SchemaContext,
    fingerprint: String,
}

impl DatasetSnapshot {
    /// Build a snapshot from an in-memory frame, inferring its schema.
    pub fn from_frame(alias: &str, frame: DataFrame, vocabulary: &Vocabulary) -> Result<Self> {
        let alias = sanitize_alias(alias);
        let schema = SchemaContext::infer(&alias, &frame, vocabulary)?;
        let fingerprint = fingerprint(&frame)?;
        info!(
            "📦 Dataset '{}' loaded: {} rows, {} columns",
            alias,
            frame.height(),
            frame.width()
        );
        Ok(Self {
            frame,
            schema,
            fingerprint,
        })
    }

    /// Build a snapshot with a schema supplied by the ingestion collaborator.
    pub fn with_schema(frame: DataFrame, schema: SchemaContext) -> Result<Self> {
        for column in &schema.columns {
            if frame.column(&column.name).is_err() {
                return Err(NlqError::Dataset(format!(
                    "Schema column '{}' is missing from the dataset",
                    column.name
                )));
            }
        }
        let fingerprint = fingerprint(&frame)?;
        Ok(Self {
            frame,
            schema,
            fingerprint,
        })
    }

    pub fn from_csv(path: impl AsRef<Path>, alias: &str, vocabulary: &Vocabulary) -> Result<Self> {
        let path = path.as_ref();
        let frame = LazyCsvReader::new(path)
            .with_has_header(true)
            .with_try_parse_dates(true)
            .with_infer_schema_length(Some(1000))
            .finish()
            .map_err(|e| NlqError::Dataset(format!("Failed to read CSV {}: {}", path.display(), e)))?
            .collect()
            .map_err(|e| NlqError::Dataset(format!("Failed to collect {}: {}", path.display(), e)))?;
        Self::from_frame(alias, frame, vocabulary)
    }

    pub fn from_parquet(
        path: impl AsRef<Path>,
        alias: &str,
        vocabulary: &Vocabulary,
    ) -> Result<Self> {
        let path = path.as_ref();
        let frame = LazyFrame::scan_parquet(path, ScanArgsParquet::default())
            .map_err(|e| {
                NlqError::Dataset(format!("Failed to scan parquet {}: {}", path.display(), e))
            })?
            .collect()?;
        Self::from_frame(alias, frame, vocabulary)
    }

    /// Load by file extension (`.csv` or `.parquet`).
    pub fn from_path(path: impl AsRef<Path>, alias: &str, vocabulary: &Vocabulary) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("csv") => Self::from_csv(path, alias, vocabulary),
            Some("parquet") => Self::from_parquet(path, alias, vocabulary),
            other => Err(NlqError::Dataset(format!(
                "Unsupported dataset format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn schema(&self) -> &SchemaContext {
        &self.schema
    }

    pub fn alias(&self) -> &str {
        &self.schema.alias
    }

    /// Content hash used as the cache key's dataset component.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn row_count(&self) -> usize {
        self.frame.height()
    }
}

/// Lowercase identifier safe to use as an SQL table name.
pub fn sanitize_alias(alias: &str) -> String {
    let mut out: String = alias
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    while out.contains("__") {
        out = out.replace("__", "_");
    }
    let out = out.trim_matches('_').to_string();
    if out.is_empty() {
        "dataset".to_string()
    } else if out.starts_with(|c: char| c.is_ascii_digit()) {
        format!("t_{}", out)
    } else {
        out
    }
}

fn fingerprint(frame: &DataFrame) -> Result<String> {
    let mut hasher = DefaultHasher::new();
    frame.height().hash(&mut hasher);
    for series in frame.get_columns() {
        series.name().hash(&mut hasher);
        format!("{:?}", series.dtype()).hash(&mut hasher);
        for idx in 0..series.len() {
            render_any_value(&series.get(idx)?).hash(&mut hasher);
        }
    }
    Ok(format!("{:016x}", hasher.finish()))
}

/// Shared, externally-owned holder of the current dataset.
#[derive(Default)]
pub struct DatasetStore {
    current: RwLock<Option<Arc<DatasetSnapshot>>>,
}

impl DatasetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: DatasetSnapshot) -> Self {
        Self {
            current: RwLock::new(Some(Arc::new(snapshot))),
        }
    }

    /// Replace the current dataset. In-flight requests keep their own copy.
    pub fn replace(&self, snapshot: DatasetSnapshot) {
        let snapshot = Arc::new(snapshot);
        match self.current.write() {
            Ok(mut guard) => *guard = Some(snapshot),
            Err(poisoned) => *poisoned.into_inner() = Some(snapshot),
        }
    }

    /// Copy-on-read access to the current dataset.
    pub fn snapshot(&self) -> Option<Arc<DatasetSnapshot>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn clear(&self) {
        match self.current.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> DataFrame {
        df! [
            "region" => ["West", "East"],
            "actual_sales" => [10.0, 20.0]
        ]
        .unwrap()
    }

    #[test]
    fn test_sanitize_alias() {
        assert_eq!(sanitize_alias("Financial Data.csv"), "financial_data_csv");
        assert_eq!(sanitize_alias("  "), "dataset");
        assert_eq!(sanitize_alias("2024 sales"), "t_2024_sales");
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let vocab = Vocabulary::default();
        let a = DatasetSnapshot::from_frame("t", frame(), &vocab).unwrap();
        let b = DatasetSnapshot::from_frame("t", frame(), &vocab).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let changed = df! [
            "region" => ["West", "East"],
            "actual_sales" => [10.0, 21.0]
        ]
        .unwrap();
        let c = DatasetSnapshot::from_frame("t", changed, &vocab).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_store_snapshot_survives_replace() {
        let vocab = Vocabulary::default();
        let store = DatasetStore::with_snapshot(
            DatasetSnapshot::from_frame("first", frame(), &vocab).unwrap(),
        );
        let held = store.snapshot().unwrap();
        store.replace(DatasetSnapshot::from_frame("second", frame(), &vocab).unwrap());
        assert_eq!(held.alias(), "first");
        assert_eq!(store.snapshot().unwrap().alias(), "second");
    }

    #[test]
    fn test_with_schema_rejects_missing_column() {
        let schema = SchemaContext::new(
            "t",
            vec![crate::schema::ColumnDescriptor::new(
                "missing",
                crate::schema::ColumnType::Numeric,
            )],
        );
        assert!(DatasetSnapshot::with_schema(frame(), schema).is_err());
    }
}
