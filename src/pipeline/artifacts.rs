//! Artifact layout under the output root.
//!
//! ```text
//! <root>/
//! ├── problem.json                  conversion output (single record)
//! ├── images/                       downloaded figures
//! ├── converted_with_schema.json    transformation output
//! ├── _error.txt                    last failure, when a run failed
//! ├── _last_raw.json                last raw model reply (debug only)
//! └── .pipeline.lock                held while a run is active
//! ```
//!
//! Artifacts produced elsewhere may also sit one or more directories down
//! (`<root>/<name>/problems.json`); discovery and verification accept both.

use crate::error::PipelineError;
use crate::output::ExtractedQuestion;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const PROBLEM_FILE: &str = "problem.json";
pub const PROBLEMS_FILE: &str = "problems.json";
pub const TRANSFORMED_FILE: &str = "converted_with_schema.json";
pub const ERROR_FILE: &str = "_error.txt";
pub const RAW_DUMP_FILE: &str = "_last_raw.json";

// ── Discovery ────────────────────────────────────────────────────────────────

/// Choose the transformation input under `root`.
///
/// `<root>/problem.json`, then `<root>/problems.json`, then the most
/// recently modified file of either name anywhere below `root`.
pub fn pick_input(root: &Path) -> Result<PathBuf, PipelineError> {
    for name in [PROBLEM_FILE, PROBLEMS_FILE] {
        let candidate = root.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    let newest = files_named(root, &[PROBLEM_FILE, PROBLEMS_FILE])
        .into_iter()
        .filter_map(|p| modified(&p).map(|t| (t, p)))
        .max_by_key(|(t, _)| *t)
        .map(|(_, p)| p);

    newest.ok_or_else(|| PipelineError::ArtifactRead {
        path: root.to_path_buf(),
        reason: format!(
            "no input found; looked for {r}/{PROBLEM_FILE}, {r}/{PROBLEMS_FILE} and {r}/**/{PROBLEM_FILE}|{PROBLEMS_FILE}",
            r = root.display()
        ),
    })
}

/// Where the transformation output for `input` goes.
///
/// Counted in path components below the root:
///
/// * one (`<root>/problem.json`) → `<root>/converted_with_schema.json`
/// * two or more (`<root>/bank/problems.json`) → next to the input
/// * outside the root → `<root>/<input stem>/converted_with_schema.json`
pub fn decide_out_path(root: &Path, input: &Path) -> PathBuf {
    if input.parent() == Some(root) {
        return root.join(TRANSFORMED_FILE);
    }
    if let Ok(rel) = input.strip_prefix(root) {
        if rel.components().count() >= 2 {
            if let Some(parent) = input.parent() {
                return parent.join(TRANSFORMED_FILE);
            }
        }
    }
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    root.join(stem).join(TRANSFORMED_FILE)
}

fn files_named(root: &Path, names: &[&str]) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| names.iter().any(|n| e.file_name() == *n))
        .map(|e| e.into_path())
        .collect()
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

// ── Verification ─────────────────────────────────────────────────────────────

/// Both required artifacts, as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutputs {
    pub conversion: PathBuf,
    pub transformation: PathBuf,
}

/// Slack for file systems that store mtimes with coarse granularity.
const MTIME_SLACK: Duration = Duration::from_secs(2);

/// Check that a conversion artifact (`<root>/problem.json` or
/// `<root>/**/problems.json`) and a transformation artifact
/// (`<root>/**/converted_with_schema.json`) both exist and were written at
/// or after `since`. Artifacts left by earlier runs do not count.
pub fn verify_outputs(root: &Path, since: SystemTime) -> Result<RunOutputs, PipelineError> {
    let cutoff = since.checked_sub(MTIME_SLACK).unwrap_or(since);
    let fresh = |p: &PathBuf| p.is_file() && modified(p).is_some_and(|t| t >= cutoff);

    let conversion = Some(root.join(PROBLEM_FILE))
        .filter(&fresh)
        .or_else(|| files_named(root, &[PROBLEMS_FILE]).into_iter().find(&fresh))
        .ok_or_else(|| PipelineError::IncompleteOutput {
            artifact: "conversion",
            expected: format!(
                "{r}/{PROBLEM_FILE} or {r}/**/{PROBLEMS_FILE}, written by this run",
                r = root.display()
            ),
        })?;

    let transformation = Some(root.join(TRANSFORMED_FILE))
        .filter(&fresh)
        .or_else(|| files_named(root, &[TRANSFORMED_FILE]).into_iter().find(&fresh))
        .ok_or_else(|| PipelineError::IncompleteOutput {
            artifact: "transformation",
            expected: format!(
                "{r}/{TRANSFORMED_FILE} or {r}/**/{TRANSFORMED_FILE}, written by this run",
                r = root.display()
            ),
        })?;

    debug!(
        "Verified outputs: {} and {}",
        conversion.display(),
        transformation.display()
    );
    Ok(RunOutputs {
        conversion,
        transformation,
    })
}

// ── Reading and writing ──────────────────────────────────────────────────────

/// Load a single-record or list artifact as a list of questions.
pub fn load_questions(path: &Path) -> Result<Vec<ExtractedQuestion>, PipelineError> {
    let read_err = |reason: String| PipelineError::ArtifactRead {
        path: path.to_path_buf(),
        reason,
    };
    let text = std::fs::read_to_string(path).map_err(|e| read_err(e.to_string()))?;
    let value: Value = serde_json::from_str(&text).map_err(|e| read_err(e.to_string()))?;
    let items = match value {
        Value::Array(items) => items,
        single => vec![single],
    };
    if items.is_empty() {
        return Err(read_err("artifact holds an empty list".into()));
    }
    items
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(|e| read_err(e.to_string())))
        .collect()
}

/// Write `value` as pretty UTF-8 JSON (non-ASCII kept as is), atomically.
///
/// The file is written to `<path>.tmp` and renamed into place, so readers
/// never observe a partial artifact.
pub async fn write_json<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), PipelineError> {
    let write_err = |e: std::io::Error| PipelineError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };
    let body = serde_json::to_string_pretty(value)
        .map_err(|e| PipelineError::Internal(format!("serialise {}: {e}", path.display())))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let tmp_path = tmp_path_for(path);
    tokio::fs::write(&tmp_path, body).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    debug!("Wrote {}", path.display());
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Record a failure in `<dir>/_error.txt`. Never fails the caller.
pub fn write_error_log(dir: &Path, error: &PipelineError) -> PathBuf {
    let path = dir.join(ERROR_FILE);
    let body = format!("{error}\n\n{error:?}\n");
    if let Err(e) = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, body)) {
        warn!("Could not write error log {}: {}", path.display(), e);
    }
    path
}
