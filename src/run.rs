//! Pipeline orchestrator.
//!
//! ```text
//! idle ─▶ locked ─▶ converting ─▶ transforming ─▶ verifying ─▶ done
//!            │           │              │              │
//!            └───────────┴──────────────┴──────────────┴──▶ failed
//! ```
//!
//! Stages run strictly in order and the first failure aborts the rest; the
//! only retries are the ones inside the transformation stage. The run lock
//! is a [`RunLock`] guard, so it is released on every exit path before the
//! error reaches the caller. Verification re-checks the disk because a
//! stage reporting success is not proof that its artifact exists; only
//! artifacts written after the lock was taken count.

use crate::config::PipelineConfig;
use crate::convert::{convert_document, transform_artifact};
use crate::error::PipelineError;
use crate::pipeline::artifacts::{self, RunOutputs};
use crate::pipeline::lock::RunLock;
use crate::progress::Stage;
use std::future::Future;
use std::time::{Instant, SystemTime};
use tracing::{error, info};

/// One step the orchestrator can sequence.
pub trait PipelineStage: Send + Sync {
    fn stage(&self) -> Stage;

    /// Run the stage, leaving its artifact under `config.output_root`.
    fn execute(
        &self,
        config: &PipelineConfig,
    ) -> impl Future<Output = Result<(), PipelineError>> + Send;
}

/// Conversion of one document into `problem.json`.
pub struct ConversionStage {
    input: String,
    problem_id: Option<String>,
}

impl ConversionStage {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            problem_id: None,
        }
    }

    pub fn with_problem_id(mut self, id: impl Into<String>) -> Self {
        self.problem_id = Some(id.into());
        self
    }
}

impl PipelineStage for ConversionStage {
    fn stage(&self) -> Stage {
        Stage::Conversion
    }

    async fn execute(&self, config: &PipelineConfig) -> Result<(), PipelineError> {
        convert_document(&self.input, self.problem_id.as_deref(), config)
            .await
            .map(|_| ())
    }
}

/// Transformation of the discovered conversion artifact.
pub struct TransformationStage;

impl PipelineStage for TransformationStage {
    fn stage(&self) -> Stage {
        Stage::Transformation
    }

    async fn execute(&self, config: &PipelineConfig) -> Result<(), PipelineError> {
        transform_artifact(None, config).await.map(|_| ())
    }
}

/// Run the full pipeline for one document.
///
/// # Example
///
/// ```rust,no_run
/// use pdf2question::{run, PipelineConfig, ServiceCredentials};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = PipelineConfig::builder()
///         .output_root("out")
///         .credentials(ServiceCredentials::new("app-id", "app-key"))
///         .build()?;
///     let outputs = run("bank/q1.pdf", &config).await?;
///     println!("{}", outputs.transformation.display());
///     Ok(())
/// }
/// ```
pub async fn run(input: &str, config: &PipelineConfig) -> Result<RunOutputs, PipelineError> {
    run_stages(&ConversionStage::new(input), &TransformationStage, config).await
}

/// Sequence arbitrary conversion and transformation stages under the lock.
///
/// On failure `_error.txt` is written at the output root, except when the
/// lock itself could not be taken (that file belongs to the other run).
pub async fn run_stages<C, T>(
    conversion: &C,
    transformation: &T,
    config: &PipelineConfig,
) -> Result<RunOutputs, PipelineError>
where
    C: PipelineStage,
    T: PipelineStage,
{
    let root = config.output_root.as_path();
    let lock = RunLock::acquire(root, config.lock_stale_after())?;
    let start = Instant::now();
    let started_at = SystemTime::now();
    if let Some(ref cb) = config.progress_callback {
        cb.on_run_start();
    }

    let result = async {
        run_stage(conversion, config).await?;
        run_stage(transformation, config).await?;

        let verify_start = Instant::now();
        if let Some(ref cb) = config.progress_callback {
            cb.on_stage_start(Stage::Verification);
        }
        let outputs = artifacts::verify_outputs(root, started_at)?;
        if let Some(ref cb) = config.progress_callback {
            cb.on_stage_complete(Stage::Verification, verify_start.elapsed());
        }
        Ok::<_, PipelineError>(outputs)
    }
    .await;

    drop(lock);

    match &result {
        Ok(outputs) => info!(
            "Pipeline done in {:.1}s: {} & {}",
            start.elapsed().as_secs_f64(),
            outputs.conversion.display(),
            outputs.transformation.display()
        ),
        Err(e) => {
            let log = artifacts::write_error_log(root, e);
            error!("Pipeline failed: {} (details in {})", e, log.display());
        }
    }
    if let Some(ref cb) = config.progress_callback {
        let message = result.as_ref().err().map(|e| e.to_string());
        cb.on_run_complete(message.as_deref());
    }
    result
}

async fn run_stage<S: PipelineStage>(
    stage: &S,
    config: &PipelineConfig,
) -> Result<(), PipelineError> {
    let name = stage.stage();
    info!("=== {} ===", name);
    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_start(name);
    }
    let start = Instant::now();
    stage.execute(config).await?;
    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_complete(name, start.elapsed());
    }
    Ok(())
}

/// Synchronous wrapper around [`run`].
///
/// Creates a temporary tokio runtime internally.
pub fn run_sync(input: &str, config: &PipelineConfig) -> Result<RunOutputs, PipelineError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(run(input, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::artifacts::{ERROR_FILE, PROBLEM_FILE, TRANSFORMED_FILE};
    use crate::pipeline::lock::LOCK_FILE;
    use crate::progress::PipelineProgressCallback;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Writes (or not) a fixed artifact and reports a fixed outcome.
    struct FakeStage {
        stage: Stage,
        writes: Option<&'static str>,
        fails: bool,
        calls: AtomicU32,
        saw_lock: Mutex<Option<bool>>,
    }

    impl FakeStage {
        fn new(stage: Stage, writes: Option<&'static str>, fails: bool) -> Self {
            Self {
                stage,
                writes,
                fails,
                calls: AtomicU32::new(0),
                saw_lock: Mutex::new(None),
            }
        }
    }

    impl PipelineStage for FakeStage {
        fn stage(&self) -> Stage {
            self.stage
        }

        async fn execute(&self, config: &PipelineConfig) -> Result<(), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.saw_lock.lock().unwrap() = Some(config.output_root.join(LOCK_FILE).exists());
            if let Some(name) = self.writes {
                std::fs::write(config.output_root.join(name), "{}").unwrap();
            }
            if self.fails {
                return Err(PipelineError::Conversion {
                    job_id: "job".into(),
                    detail: "status error".into(),
                });
            }
            Ok(())
        }
    }

    fn config_in(root: PathBuf) -> PipelineConfig {
        PipelineConfig::builder().output_root(root).build().unwrap()
    }

    #[tokio::test]
    async fn happy_path_verifies_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path().to_path_buf());
        let conv = FakeStage::new(Stage::Conversion, Some(PROBLEM_FILE), false);
        let trans = FakeStage::new(Stage::Transformation, Some(TRANSFORMED_FILE), false);

        let out = run_stages(&conv, &trans, &config).await.unwrap();
        assert_eq!(out.conversion, dir.path().join(PROBLEM_FILE));
        assert_eq!(*conv.saw_lock.lock().unwrap(), Some(true));
        assert_eq!(*trans.saw_lock.lock().unwrap(), Some(true));
        assert!(!dir.path().join(LOCK_FILE).exists());
        assert!(!dir.path().join(ERROR_FILE).exists());
    }

    #[tokio::test]
    async fn silent_stage_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path().to_path_buf());
        let conv = FakeStage::new(Stage::Conversion, Some(PROBLEM_FILE), false);
        let trans = FakeStage::new(Stage::Transformation, None, false);

        let err = run_stages(&conv, &trans, &config).await.unwrap_err();
        assert!(matches!(err, PipelineError::IncompleteOutput { artifact: "transformation", .. }));
        assert!(!dir.path().join(LOCK_FILE).exists());
        assert!(dir.path().join(ERROR_FILE).exists());
    }

    #[tokio::test]
    async fn leftover_artifact_does_not_satisfy_verification() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path().to_path_buf());
        let leftover = dir.path().join(TRANSFORMED_FILE);
        std::fs::write(&leftover, "{}").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&leftover)
            .unwrap()
            .set_modified(std::time::SystemTime::now() - std::time::Duration::from_secs(3600))
            .unwrap();

        let conv = FakeStage::new(Stage::Conversion, Some(PROBLEM_FILE), false);
        let trans = FakeStage::new(Stage::Transformation, None, false);
        let err = run_stages(&conv, &trans, &config).await.unwrap_err();
        assert!(matches!(err, PipelineError::IncompleteOutput { artifact: "transformation", .. }));
    }

    #[tokio::test]
    async fn first_failure_skips_later_stages() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path().to_path_buf());
        let conv = FakeStage::new(Stage::Conversion, None, true);
        let trans = FakeStage::new(Stage::Transformation, Some(TRANSFORMED_FILE), false);

        let err = run_stages(&conv, &trans, &config).await.unwrap_err();
        assert!(matches!(err, PipelineError::Conversion { .. }));
        assert_eq!(trans.calls.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join(TRANSFORMED_FILE).exists());
        assert!(!dir.path().join(LOCK_FILE).exists());
        let log = std::fs::read_to_string(dir.path().join(ERROR_FILE)).unwrap();
        assert!(log.contains("status error"));
    }

    #[tokio::test]
    async fn held_lock_blocks_without_running_stages() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path().to_path_buf());
        let _held = RunLock::acquire(dir.path(), config.lock_stale_after()).unwrap();
        let conv = FakeStage::new(Stage::Conversion, Some(PROBLEM_FILE), false);
        let trans = FakeStage::new(Stage::Transformation, Some(TRANSFORMED_FILE), false);

        let err = run_stages(&conv, &trans, &config).await.unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyRunning { .. }));
        assert_eq!(conv.calls.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join(ERROR_FILE).exists());
        assert!(dir.path().join(LOCK_FILE).exists());
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl PipelineProgressCallback for Events {
        fn on_run_start(&self) {
            self.0.lock().unwrap().push("start".into());
        }
        fn on_stage_start(&self, stage: Stage) {
            self.0.lock().unwrap().push(format!("begin {stage}"));
        }
        fn on_stage_complete(&self, stage: Stage, _elapsed: std::time::Duration) {
            self.0.lock().unwrap().push(format!("end {stage}"));
        }
        fn on_run_complete(&self, error: Option<&str>) {
            self.0.lock().unwrap().push(format!("done ok={}", error.is_none()));
        }
    }

    #[tokio::test]
    async fn progress_events_follow_stage_order() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(Events::default());
        let config = PipelineConfig::builder()
            .output_root(dir.path())
            .progress_callback(events.clone())
            .build()
            .unwrap();
        let conv = FakeStage::new(Stage::Conversion, Some(PROBLEM_FILE), false);
        let trans = FakeStage::new(Stage::Transformation, Some(TRANSFORMED_FILE), false);
        run_stages(&conv, &trans, &config).await.unwrap();

        assert_eq!(
            *events.0.lock().unwrap(),
            vec![
                "start",
                "begin conversion",
                "end conversion",
                "begin transformation",
                "end transformation",
                "begin verification",
                "end verification",
                "done ok=true",
            ]
        );
    }
}
