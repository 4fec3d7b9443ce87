//! Upsert payloads for the problem store.
//!
//! The persistence layer is not part of this crate; it consumes the
//! [`UpsertPayload`]s built here (the CLI prints them as NDJSON). Two
//! collections exist:
//!
//! * `problems`: original records, unique on `problem_id`
//! * `generated_problems`: rewritten records, unique on
//!   `(origin_problem_id, problem_id)`
//!
//! Whether a file holds generated records is decided by its name.

use crate::error::PipelineError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ORIGINAL_COLLECTION: &str = "problems";
pub const GENERATED_COLLECTION: &str = "generated_problems";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Original,
    Generated,
}

impl RecordKind {
    /// `problem_*.json` and any name containing `generated` hold generated records.
    pub fn for_file(file_name: &str) -> Self {
        if file_name.starts_with("problem_") || file_name.to_lowercase().contains("generated") {
            RecordKind::Generated
        } else {
            RecordKind::Original
        }
    }

    pub fn collection(&self) -> &'static str {
        match self {
            RecordKind::Original => ORIGINAL_COLLECTION,
            RecordKind::Generated => GENERATED_COLLECTION,
        }
    }
}

/// One upsert: match `filter` in `collection`, set `document`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpsertPayload {
    pub collection: &'static str,
    pub filter: Value,
    pub document: Map<String, Value>,
}

/// First present, non-empty value among `keys`.
fn first_present(doc: &Map<String, Value>, keys: &[&str]) -> Option<Value> {
    keys.iter()
        .filter_map(|k| doc.get(*k))
        .find(|v| match v {
            Value::Null | Value::Bool(false) => false,
            Value::String(s) => !s.is_empty(),
            _ => true,
        })
        .cloned()
}

/// Build the payload for one record found in `source_file`.
///
/// `problem_id` falls back to `id`, `uid`, then the file name without
/// `.json`. For generated records `origin_problem_id` falls back to
/// `origin`, `base_problem_id`, then the resolved `problem_id`.
pub fn build_payload(
    doc: &Map<String, Value>,
    source_file: &str,
    kind: RecordKind,
    now: DateTime<Utc>,
) -> UpsertPayload {
    let problem_id = first_present(doc, &["problem_id", "id", "uid"])
        .unwrap_or_else(|| Value::String(source_file.replace(".json", "")));

    let mut document = doc.clone();
    document.insert("problem_id".into(), problem_id.clone());
    document.insert("source_file".into(), Value::String(source_file.to_string()));
    document.insert(
        "created_at".into(),
        Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    document.insert("type".into(), json!(kind));

    let filter = match kind {
        RecordKind::Original => json!({ "problem_id": problem_id }),
        RecordKind::Generated => {
            let origin = first_present(doc, &["origin_problem_id", "origin", "base_problem_id"])
                .unwrap_or_else(|| problem_id.clone());
            document.insert("origin_problem_id".into(), origin.clone());
            json!({ "origin_problem_id": origin, "problem_id": problem_id })
        }
    };

    UpsertPayload {
        collection: kind.collection(),
        filter,
        document,
    }
}

/// Payloads for every record in one JSON file (single object or list).
pub fn payloads_for_file(
    path: &Path,
    now: DateTime<Utc>,
) -> Result<Vec<UpsertPayload>, PipelineError> {
    let read_err = |reason: String| PipelineError::ArtifactRead {
        path: path.to_path_buf(),
        reason,
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| read_err("not a file".into()))?;
    let text = std::fs::read_to_string(path).map_err(|e| read_err(e.to_string()))?;
    let value: Value = serde_json::from_str(&text).map_err(|e| read_err(e.to_string()))?;
    let docs = match value {
        Value::Array(items) => items,
        single => vec![single],
    };

    let kind = RecordKind::for_file(&file_name);
    docs.iter()
        .enumerate()
        .map(|(i, doc)| {
            doc.as_object()
                .map(|obj| build_payload(obj, &file_name, kind, now))
                .ok_or_else(|| read_err(format!("record {i} is not a JSON object")))
        })
        .collect()
}

/// Payloads for every `*.json` directly under `dir`, in file-name order.
pub fn collect_payloads(
    dir: &Path,
    now: DateTime<Utc>,
) -> Result<Vec<UpsertPayload>, PipelineError> {
    let entries = std::fs::read_dir(dir).map_err(|e| PipelineError::ArtifactRead {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|x| x == "json"))
        .collect();
    files.sort();

    let mut payloads = Vec::new();
    for file in &files {
        let batch = payloads_for_file(file, now)?;
        debug!("{}: {} record(s)", file.display(), batch.len());
        payloads.extend(batch);
    }
    Ok(payloads)
}
