//! Progress-callback trait for pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the run moves through its stages and while the conversion job
//! is being polled.
//!
//! # Example
//!
//! ```rust
//! use pdf2question::{PipelineConfig, PipelineProgressCallback, JobStatus};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//! use std::time::Duration;
//!
//! struct PollCounter {
//!     polls: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for PollCounter {
//!     fn on_poll(&self, _job_id: &str, _status: JobStatus, _elapsed: Duration) {
//!         self.polls.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(PollCounter { polls: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::pipeline::conversion::JobStatus;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The stages of a pipeline run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Conversion,
    Transformation,
    Verification,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Conversion => "conversion",
            Stage::Transformation => "transformation",
            Stage::Verification => "verification",
        };
        f.write_str(name)
    }
}

/// Called by the pipeline as it runs.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Runs are sequential, so no two methods are ever
/// called concurrently for the same run.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once the run lock is held, before any stage starts.
    fn on_run_start(&self) {}

    /// Called just before a stage begins.
    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// Called after each status check of the conversion job.
    ///
    /// # Arguments
    /// * `job_id`: the service's handle for the job
    /// * `status`: status observed by this check
    /// * `elapsed`: time since the job was submitted
    fn on_poll(&self, job_id: &str, status: JobStatus, elapsed: Duration) {
        let _ = (job_id, status, elapsed);
    }

    /// Called when a stage finishes successfully.
    fn on_stage_complete(&self, stage: Stage, elapsed: Duration) {
        let _ = (stage, elapsed);
    }

    /// Called once, after the lock has been released.
    ///
    /// `error` is `None` when both artifacts were verified.
    fn on_run_complete(&self, error: Option<&str>) {
        let _ = error;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
