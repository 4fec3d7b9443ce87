//! # pdf2question
//!
//! Turn question-bank PDFs into structured, curriculum-tagged question records.
//!
//! ## Why this crate?
//!
//! Question banks ship as PDFs: the stem, four choices, the answer, a
//! rationale and a difficulty rating, laid out for print. An OCR service
//! turns a page into markdown that is readable but not structured. This
//! crate drives that service, recovers the fields with a deterministic
//! parser, and hands each record to an LLM that rewrites it for a Korean
//! middle-school curriculum, validating the result against a fixed schema.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 0. Lock       one run per output root (.pipeline.lock)
//!  ├─ 1. Convert    upload, poll until completed, fetch markdown
//!  ├─ 2. Parse      ordered extraction steps → problem.json (+ images/)
//!  ├─ 3. Transform  LLM rewrite, retry, schema check → converted_with_schema.json
//!  └─ 4. Verify     both artifacts exist, or the run fails
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf2question::{run, PipelineConfig, ServiceCredentials};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // LLM provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / ...
//!     let config = PipelineConfig::builder()
//!         .credentials(ServiceCredentials::new(
//!             std::env::var("MATHPIX_APP_ID")?,
//!             std::env::var("MATHPIX_APP_KEY")?,
//!         ))
//!         .build()?;
//!     let outputs = run("sat_q1.pdf", &config).await?;
//!     println!("{}", outputs.transformation.display());
//!     Ok(())
//! }
//! ```
//!
//! Parsing alone needs no network:
//!
//! ```rust
//! use pdf2question::pipeline::parse::extract;
//!
//! let md = "What is x?\nA) 1\nB) 2\nC) 3\nD) 4\nAnswer: B";
//! let q = extract(md, "q1", "bank.pdf").question;
//! assert_eq!(q.question_text, "What is x?");
//! assert_eq!(q.answer.as_deref(), Some("B"));
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2question` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod records;
pub mod run;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder, ServiceCredentials};
pub use convert::{
    convert_document, resolve_provider, transform_artifact, transform_artifact_with,
    ConversionOutput, TransformOutput,
};
pub use error::{ImageError, PipelineError};
pub use output::{Difficulty, ExtractedQuestion, ImageEntry, SourceRef, TransformedQuestion};
pub use pipeline::artifacts::RunOutputs;
pub use pipeline::conversion::{ConversionClient, ConversionJob, JobStatus};
pub use pipeline::transform::{GenerativeBackend, LlmBackend, Transformer};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback, Stage};
pub use run::{run, run_stages, run_sync, ConversionStage, PipelineStage, TransformationStage};
