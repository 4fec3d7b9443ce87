//! Client for the asynchronous document conversion service.
//!
//! A conversion is three calls: upload the PDF with a fixed option set and
//! receive a job id, poll the job until it leaves the pending state, then
//! download the markdown rendering. The service gives no completion
//! estimate, so [`ConversionClient::poll`] is a bounded loop with a fixed
//! interval and a hard deadline.
//!
//! ```text
//! submit ──▶ ConversionJob{pending} ──poll──▶ {completed | error} ──fetch──▶ markdown
//! ```

use crate::config::{PipelineConfig, ServiceCredentials};
use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Status of a conversion job as reported by the service.
///
/// The service reports several intermediate states (`received`, `loaded`,
/// `split`, ...); all of them map to [`JobStatus::Pending`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Completed,
    Error,
}

impl JobStatus {
    pub fn from_service(status: &str) -> Self {
        match status {
            "completed" => JobStatus::Completed,
            "error" => JobStatus::Error,
            _ => JobStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// One outstanding request to the conversion service.
///
/// Moves `pending → completed` or `pending → error` exactly once; a terminal
/// job is never polled again.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    job_id: String,
    status: JobStatus,
    submitted_at: Instant,
}

impl ConversionJob {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Pending,
            submitted_at: Instant::now(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub fn elapsed(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    /// Record a status observation. Observations after a terminal state are ignored.
    fn observe(&mut self, status: JobStatus) {
        if self.status.is_terminal() {
            warn!(
                "Job {}: ignoring status '{}' after terminal '{}'",
                self.job_id, status, self.status
            );
            return;
        }
        self.status = status;
    }
}

/// Option blob sent with every upload: markdown output with LaTeX math,
/// tables as markdown, and image extraction enabled.
pub fn conversion_options() -> Value {
    json!({
        "format": "markdown",
        "include_latex": true,
        "include_table_markdown": true,
        "math_inline_delimiters": ["$", "$"],
        "math_block_delimiters": ["$$", "$$"],
        "pdf_options": { "extract_images": true },
    })
}

/// HTTP client for the conversion service.
pub struct ConversionClient {
    http: reqwest::Client,
    base_url: String,
    credentials: ServiceCredentials,
    upload_timeout: Duration,
    status_timeout: Duration,
    fetch_timeout: Duration,
    progress: Option<ProgressCallback>,
}

impl ConversionClient {
    /// Build a client from the pipeline configuration.
    ///
    /// Fails with [`PipelineError::InvalidConfig`] when no credentials are set.
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let credentials = config.credentials.clone().ok_or_else(|| {
            PipelineError::InvalidConfig(
                "Conversion service credentials missing.\n\
                 Set MATHPIX_APP_ID and MATHPIX_APP_KEY (or pass --app-id / --app-key)."
                    .into(),
            )
        })?;
        if credentials.app_id.is_empty() || credentials.app_key.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "Conversion service app id / app key must not be empty".into(),
            ));
        }

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| PipelineError::Internal(format!("HTTP client: {e}")))?;

        debug!("Conversion service: {} ({:?})", config.conversion_base_url, credentials);

        Ok(Self {
            http,
            base_url: config.conversion_base_url.trim_end_matches('/').to_string(),
            credentials,
            upload_timeout: Duration::from_secs(config.upload_timeout_secs),
            status_timeout: Duration::from_secs(config.status_timeout_secs),
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
            progress: config.progress_callback.clone(),
        })
    }

    fn authorised(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("app_id", &self.credentials.app_id)
            .header("app_key", &self.credentials.app_key)
    }

    /// Upload `document` and return the pending job.
    pub async fn submit(&self, document: &Path) -> Result<ConversionJob, PipelineError> {
        let bytes = tokio::fs::read(document).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipelineError::FileNotFound {
                    path: document.to_path_buf(),
                }
            } else {
                PipelineError::Submission {
                    reason: format!("could not read '{}': {e}", document.display()),
                }
            }
        })?;
        let file_name = document
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "document.pdf".to_string());

        let part = Part::bytes(bytes)
            .file_name(file_name.clone())
            .mime_str("application/pdf")
            .map_err(|e| PipelineError::Internal(format!("multipart: {e}")))?;
        let form = Form::new()
            .part("file", part)
            .text("options_json", conversion_options().to_string());

        info!("Submitting '{}' to {}", file_name, self.base_url);

        let response = self
            .authorised(self.http.post(&self.base_url))
            .multipart(form)
            .timeout(self.upload_timeout)
            .send()
            .await
            .map_err(|e| PipelineError::Submission {
                reason: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| PipelineError::Submission {
            reason: format!("HTTP {status}: unreadable body: {e}"),
        })?;
        debug!("Upload response: HTTP {} {}", status, excerpt(&body, 300));

        if !status.is_success() {
            return Err(PipelineError::Submission {
                reason: format!("HTTP {status}: {}", excerpt(&body, 300)),
            });
        }

        let job_id = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("pdf_id").and_then(Value::as_str).map(str::to_string))
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| PipelineError::Submission {
                reason: format!("response carried no job id: {}", excerpt(&body, 300)),
            })?;

        info!("Submitted as job {}", job_id);
        Ok(ConversionJob::new(job_id))
    }

    /// Poll `job` every `interval` until it is terminal.
    ///
    /// Returns `Ok(())` once the job is `completed`. Fails with
    /// [`PipelineError::Conversion`] when it reaches `error` and with
    /// [`PipelineError::PollTimeout`] when `timeout` elapses first.
    pub async fn poll(
        &self,
        job: &mut ConversionJob,
        interval: Duration,
        timeout: Duration,
    ) -> Result<(), PipelineError> {
        let start = Instant::now();
        let mut attempt = 0u32;

        loop {
            let detail = match job.status() {
                JobStatus::Completed => return Ok(()),
                JobStatus::Error => {
                    return Err(PipelineError::Conversion {
                        job_id: job.job_id().to_string(),
                        detail: "job already in error state".into(),
                    })
                }
                JobStatus::Pending => {
                    attempt += 1;
                    let (status, body) = self.check_status(job.job_id()).await?;
                    job.observe(status);
                    debug!(
                        "Job {}: poll {} → {} ({:.1}s elapsed)",
                        job.job_id(),
                        attempt,
                        status,
                        job.elapsed().as_secs_f64()
                    );
                    if let Some(ref cb) = self.progress {
                        cb.on_poll(job.job_id(), status, job.elapsed());
                    }
                    body
                }
            };

            match job.status() {
                JobStatus::Completed => {
                    info!("Job {} completed after {} polls", job.job_id(), attempt);
                    return Ok(());
                }
                JobStatus::Error => {
                    return Err(PipelineError::Conversion {
                        job_id: job.job_id().to_string(),
                        detail: excerpt(&detail, 300),
                    });
                }
                JobStatus::Pending => {}
            }

            if start.elapsed() > timeout {
                return Err(PipelineError::PollTimeout {
                    job_id: job.job_id().to_string(),
                    secs: timeout.as_secs(),
                });
            }
            sleep(interval).await;
        }
    }

    /// One status request. Returns the mapped status and the raw body.
    async fn check_status(&self, job_id: &str) -> Result<(JobStatus, String), PipelineError> {
        let url = format!("{}/{}", self.base_url, job_id);
        let conversion_err = |detail: String| PipelineError::Conversion {
            job_id: job_id.to_string(),
            detail,
        };

        let response = self
            .authorised(self.http.get(&url))
            .timeout(self.status_timeout)
            .send()
            .await
            .map_err(|e| conversion_err(format!("status check failed: {e}")))?;

        let code = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| conversion_err(format!("status body unreadable: {e}")))?;
        if !code.is_success() {
            return Err(conversion_err(format!(
                "status check returned HTTP {code}: {}",
                excerpt(&body, 300)
            )));
        }

        let status = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("status").and_then(Value::as_str).map(JobStatus::from_service))
            .unwrap_or_else(|| {
                debug!("Job {}: status missing from {}", job_id, excerpt(&body, 120));
                JobStatus::Pending
            });

        Ok((status, body))
    }

    /// Download the markdown rendering of a completed job.
    ///
    /// Prefers `{job}.md`; falls back to the raw `{job}.mmd` rendering when
    /// the first is unavailable or blank.
    pub async fn fetch(&self, job: &ConversionJob) -> Result<String, PipelineError> {
        let job_id = job.job_id();
        let fetch_err = |reason: String| PipelineError::Fetch {
            job_id: job_id.to_string(),
            reason,
        };

        let md_url = format!("{}/{}.md", self.base_url, job_id);
        match self.get_text(&md_url).await {
            Ok((code, text)) if code.is_success() && !text.trim().is_empty() => {
                debug!("Fetched {} bytes of markdown", text.len());
                return Ok(text);
            }
            Ok((code, _)) => debug!("{} → HTTP {}, trying raw rendering", md_url, code),
            Err(e) => warn!("{} failed ({}), trying raw rendering", md_url, e),
        }

        let mmd_url = format!("{}/{}.mmd", self.base_url, job_id);
        let (code, text) = self
            .get_text(&mmd_url)
            .await
            .map_err(|e| fetch_err(format!("raw rendering request failed: {e}")))?;
        if !code.is_success() {
            return Err(fetch_err(format!("raw rendering returned HTTP {code}")));
        }
        if text.trim().is_empty() {
            return Err(fetch_err("both renderings are empty".into()));
        }
        debug!("Fetched {} bytes of raw markdown", text.len());
        Ok(text)
    }

    async fn get_text(&self, url: &str) -> Result<(reqwest::StatusCode, String), reqwest::Error> {
        let response = self
            .authorised(self.http.get(url))
            .timeout(self.fetch_timeout)
            .send()
            .await?;
        let code = response.status();
        let text = response.text().await?;
        Ok((code, text))
    }

    /// Submit, wait for, and fetch a document in one call.
    pub async fn convert(
        &self,
        document: &Path,
        interval: Duration,
        timeout: Duration,
    ) -> Result<String, PipelineError> {
        let mut job = self.submit(document).await?;
        self.poll(&mut job, interval, timeout).await?;
        self.fetch(&job).await
    }
}

/// First `max` characters of `s`, for log lines and error messages.
fn excerpt(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
