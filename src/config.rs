//! Configuration types for the question pipeline.
//!
//! Every component receives a `&PipelineConfig`; nothing reads the process
//! environment on its own. The CLI (or any other caller) gathers keys and
//! paths once, builds a config through [`PipelineConfigBuilder`], and hands
//! the same value to the conversion client, the transformer and the
//! orchestrator. Tests build a config that points at a mock server.

use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default endpoint of the document conversion service.
pub const DEFAULT_CONVERSION_URL: &str = "https://api.mathpix.com/v3/pdf";

/// Default model used by the transformation stage.
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// App id / key pair sent as headers on every conversion-service request.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceCredentials {
    pub app_id: String,
    pub app_key: String,
}

impl ServiceCredentials {
    pub fn new(app_id: impl Into<String>, app_key: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into().trim().to_string(),
            app_key: app_key.into().trim().to_string(),
        }
    }
}

impl fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("app_id", &mask(&self.app_id))
            .field("app_key", &mask(&self.app_key))
            .finish()
    }
}

/// Show only the first and last three characters of a secret.
pub fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.is_empty() {
        return "<EMPTY>".to_string();
    }
    if chars.len() <= 6 {
        return "***".to_string();
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{head}...{tail}")
}

/// Configuration for a pipeline run.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use pdf2question::{PipelineConfig, ServiceCredentials};
///
/// let config = PipelineConfig::builder()
///     .output_root("out")
///     .credentials(ServiceCredentials::new("my-app", "my-key"))
///     .poll_interval_ms(2000)
///     .model("gpt-4o-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Directory holding every artifact of a run. Default: `out`.
    pub output_root: PathBuf,

    /// Name of the image directory under `output_root`. Default: `images`.
    pub images_dir_name: String,

    /// Base URL of the conversion service's PDF endpoint.
    ///
    /// Jobs are submitted to this URL, polled at `{url}/{job_id}` and
    /// fetched from `{url}/{job_id}.md` / `{url}/{job_id}.mmd`.
    pub conversion_base_url: String,

    /// Conversion-service credentials. Required by the conversion stage only.
    pub credentials: Option<ServiceCredentials>,

    /// Delay between two job-status checks, in milliseconds. Default: 4000.
    pub poll_interval_ms: u64,

    /// Hard ceiling on the total wait for a conversion job. Default: 900.
    ///
    /// The service gives no completion estimate; a single-question PDF is
    /// usually done within a minute, so 15 minutes only trips on a stuck job.
    pub poll_timeout_secs: u64,

    /// Timeout of the multipart upload request. Default: 120.
    pub upload_timeout_secs: u64,

    /// Timeout of a single job-status request. Default: 30.
    pub status_timeout_secs: u64,

    /// Timeout of a markdown fetch request. Default: 120.
    pub fetch_timeout_secs: u64,

    /// Timeout of a single image download. Default: 60.
    pub image_timeout_secs: u64,

    /// Download timeout for URL document inputs. Default: 120.
    pub download_timeout_secs: u64,

    /// LLM model identifier. Default: `gpt-4o`.
    pub model: String,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    /// If None along with `provider`, the provider is auto-detected.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for the transformation call. Default: 0.2.
    pub temperature: f32,

    /// Maximum tokens the LLM may generate per question. Default: 4096.
    pub max_tokens: usize,

    /// Retries after the first transformation attempt. Default: 2.
    pub max_retries: u32,

    /// Fixed pause between transformation attempts, in ms. Default: 800.
    pub retry_backoff_ms: u64,

    /// Curriculum reference list embedded in the prompt.
    /// If None, uses [`crate::prompts::DEFAULT_CURRICULUM`].
    pub curriculum: Option<String>,

    /// Write the last raw LLM response to `_last_raw.json`. Default: false.
    pub debug_raw: bool,

    /// Age after which an existing run lock is considered abandoned. Default: 3600.
    pub lock_stale_secs: u64,

    /// Receives stage and poll events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("out"),
            images_dir_name: "images".to_string(),
            conversion_base_url: DEFAULT_CONVERSION_URL.to_string(),
            credentials: None,
            poll_interval_ms: 4000,
            poll_timeout_secs: 900,
            upload_timeout_secs: 120,
            status_timeout_secs: 30,
            fetch_timeout_secs: 120,
            image_timeout_secs: 60,
            download_timeout_secs: 120,
            model: DEFAULT_MODEL.to_string(),
            provider_name: None,
            provider: None,
            temperature: 0.2,
            max_tokens: 4096,
            max_retries: 2,
            retry_backoff_ms: 800,
            curriculum: None,
            debug_raw: false,
            lock_stale_secs: 3600,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("output_root", &self.output_root)
            .field("conversion_base_url", &self.conversion_base_url)
            .field("credentials", &self.credentials)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_retries", &self.max_retries)
            .field("debug_raw", &self.debug_raw)
            .field("lock_stale_secs", &self.lock_stale_secs)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Absolute-or-relative path of the image directory.
    pub fn images_dir(&self) -> PathBuf {
        self.output_root.join(&self.images_dir_name)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.output_root = root.into();
        self
    }

    pub fn images_dir_name(mut self, name: impl Into<String>) -> Self {
        self.config.images_dir_name = name.into();
        self
    }

    pub fn conversion_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.conversion_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn credentials(mut self, credentials: ServiceCredentials) -> Self {
        self.config.credentials = Some(credentials);
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn poll_timeout_secs(mut self, secs: u64) -> Self {
        self.config.poll_timeout_secs = secs;
        self
    }

    pub fn upload_timeout_secs(mut self, secs: u64) -> Self {
        self.config.upload_timeout_secs = secs;
        self
    }

    pub fn status_timeout_secs(mut self, secs: u64) -> Self {
        self.config.status_timeout_secs = secs;
        self
    }

    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs;
        self
    }

    pub fn image_timeout_secs(mut self, secs: u64) -> Self {
        self.config.image_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn curriculum(mut self, text: impl Into<String>) -> Self {
        self.config.curriculum = Some(text.into());
        self
    }

    pub fn debug_raw(mut self, v: bool) -> Self {
        self.config.debug_raw = v;
        self
    }

    pub fn lock_stale_secs(mut self, secs: u64) -> Self {
        self.config.lock_stale_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.poll_interval_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "Poll interval must be ≥ 1 ms".into(),
            ));
        }
        if c.poll_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "Poll timeout must be ≥ 1 s".into(),
            ));
        }
        if c.max_retries > 10 {
            return Err(PipelineError::InvalidConfig(format!(
                "Retry budget must be 0–10, got {}",
                c.max_retries
            )));
        }
        if c.images_dir_name.is_empty() || c.images_dir_name.contains(['/', '\\']) {
            return Err(PipelineError::InvalidConfig(format!(
                "Image directory name must be a single path component, got {:?}",
                c.images_dir_name
            )));
        }
        if c.model.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("Model must not be empty".into()));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_contract() {
        let c = PipelineConfig::default();
        assert_eq!(c.poll_interval(), Duration::from_secs(4));
        assert_eq!(c.poll_timeout(), Duration::from_secs(900));
        assert_eq!(c.max_retries, 2);
        assert_eq!(c.retry_backoff_ms, 800);
        assert_eq!(c.lock_stale_after(), Duration::from_secs(3600));
        assert!(!c.debug_raw);
        assert_eq!(c.images_dir(), PathBuf::from("out").join("images"));
    }

    #[test]
    fn builder_clamps_temperature_and_trims_url() {
        let c = PipelineConfig::builder()
            .temperature(5.0)
            .conversion_base_url("http://localhost:9000/v3/pdf/")
            .build()
            .unwrap();
        assert_eq!(c.temperature, 2.0);
        assert_eq!(c.conversion_base_url, "http://localhost:9000/v3/pdf");
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = PipelineConfig::builder().poll_interval_ms(0).build().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn nested_images_dir_is_rejected() {
        let err = PipelineConfig::builder()
            .images_dir_name("a/b")
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn credentials_are_masked_in_debug() {
        let creds = ServiceCredentials::new(" my_app_id ", "supersecretkey");
        assert_eq!(creds.app_id, "my_app_id");
        let dbg = format!("{creds:?}");
        assert!(dbg.contains("my_..._id"), "got: {dbg}");
        assert!(!dbg.contains("supersecretkey"));
    }

    #[test]
    fn mask_short_and_empty() {
        assert_eq!(mask(""), "<EMPTY>");
        assert_eq!(mask("abc"), "***");
        assert_eq!(mask("abcdefgh"), "abc...fgh");
    }
}
