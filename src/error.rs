//! Error types for the pdf2question library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`]: **Fatal**: the run cannot proceed (the conversion
//!   service rejected the upload, the job failed, the LLM response never
//!   matched the schema, another run holds the lock). Returned as
//!   `Err(PipelineError)` from every stage and from [`crate::run::run`].
//!
//! * [`ImageError`]: **Non-fatal**: one embedded figure could not be
//!   downloaded. The question record is still produced; the figure is
//!   simply left out of `images`.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pdf2question library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input document was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── Conversion stage ──────────────────────────────────────────────────
    /// The upload was rejected or the response carried no job identifier.
    #[error("Document submission failed: {reason}\nCheck MATHPIX_APP_ID / MATHPIX_APP_KEY and the service URL.")]
    Submission { reason: String },

    /// The conversion job reached the `error` state, or its status could
    /// not be read.
    #[error("Conversion job '{job_id}' failed: {detail}")]
    Conversion { job_id: String, detail: String },

    /// The job was still pending when the poll deadline passed.
    #[error("Conversion job '{job_id}' still pending after {secs}s\nIncrease --poll-timeout.")]
    PollTimeout { job_id: String, secs: u64 },

    /// Neither the markdown nor the raw representation could be fetched,
    /// or the fetched text was blank.
    #[error("Failed to fetch markdown for job '{job_id}': {reason}")]
    Fetch { job_id: String, reason: String },

    // ── Transformation stage ──────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Every attempt to get a parseable JSON response failed.
    #[error("Transformation of '{problem_id}' failed after {attempts} attempts: {last_error}")]
    Transformation {
        problem_id: String,
        attempts: u32,
        last_error: String,
    },

    /// The response parsed but a mandatory key is missing or mistyped.
    #[error("Transformed record is missing required key '{key}' (or it has the wrong type)")]
    SchemaValidation { key: String },

    // ── Orchestrator ──────────────────────────────────────────────────────
    /// A fresh lock artifact is held by another run.
    #[error("Another pipeline run appears to be in progress (lock '{lock_path}', age {age_secs}s)\nRemove the lock if that run has died.")]
    AlreadyRunning { lock_path: PathBuf, age_secs: u64 },

    /// Both stages reported success but an expected artifact is absent.
    #[error("Pipeline finished without producing its {artifact} artifact\nExpected one of: {expected}")]
    IncompleteOutput {
        artifact: &'static str,
        expected: String,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output artifact.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An input artifact was missing or did not contain the expected JSON.
    #[error("Failed to read artifact '{path}': {reason}")]
    ArtifactRead { path: PathBuf, reason: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single embedded image.
///
/// Logged and dropped by [`crate::pipeline::images::ImageStore`]; the
/// question record is produced without the figure.
#[derive(Debug, Clone, Error)]
pub enum ImageError {
    #[error("image '{url}': download failed: {detail}")]
    Download { url: String, detail: String },

    #[error("image '{url}': could not be saved to '{path}': {detail}")]
    Write {
        url: String,
        path: PathBuf,
        detail: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_validation_names_key() {
        let e = PipelineError::SchemaValidation {
            key: "answer".into(),
        };
        assert!(e.to_string().contains("'answer'"), "got: {e}");
    }

    #[test]
    fn poll_timeout_display() {
        let e = PipelineError::PollTimeout {
            job_id: "2024_abc".into(),
            secs: 900,
        };
        let msg = e.to_string();
        assert!(msg.contains("2024_abc"));
        assert!(msg.contains("900s"));
    }

    #[test]
    fn already_running_display() {
        let e = PipelineError::AlreadyRunning {
            lock_path: PathBuf::from("out/.pipeline.lock"),
            age_secs: 12,
        };
        let msg = e.to_string();
        assert!(msg.contains(".pipeline.lock"));
        assert!(msg.contains("12s"));
    }

    #[test]
    fn transformation_display() {
        let e = PipelineError::Transformation {
            problem_id: "6d99b141".into(),
            attempts: 3,
            last_error: "expected value at line 1".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("6d99b141"));
        assert!(msg.contains("3 attempts"));
    }

    #[test]
    fn image_error_display() {
        let e = ImageError::Download {
            url: "https://cdn.example.com/a.png".into(),
            detail: "HTTP 404".into(),
        };
        assert!(e.to_string().contains("HTTP 404"));
    }
}
