//! Stage entry points: conversion and transformation.
//!
//! Each function runs one stage end to end and leaves its artifact on disk,
//! which is what lets the CLI run stages separately and lets the
//! orchestrator in [`crate::run`] verify them afterwards.
//!
//! ## Conversion
//!
//! ```text
//! path/URL ─▶ resolve ─▶ submit ─▶ poll ─▶ fetch .md/.mmd ─▶ parse ─▶ problem.json
//!                                                               └─▶ images/
//! ```
//!
//! ## Transformation
//!
//! ```text
//! problem(s).json ─▶ LLM per item (retry + validate) ─▶ converted_with_schema.json
//!                                         └─ on failure ─▶ _error.txt
//! ```

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::output::{ExtractedQuestion, TransformedQuestion};
use crate::pipeline::artifacts::{self, PROBLEM_FILE, RAW_DUMP_FILE};
use crate::pipeline::conversion::ConversionClient;
use crate::pipeline::images::ImageStore;
use crate::pipeline::transform::{GenerativeBackend, LlmBackend, Transformer};
use crate::pipeline::{input, parse};
use edgequake_llm::{LLMProvider, ProviderFactory};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// What the conversion stage produced.
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    pub question: ExtractedQuestion,
    /// Location of the written `problem.json`.
    pub artifact: PathBuf,
    /// The markdown the record was parsed from.
    pub markdown: String,
}

/// What the transformation stage produced.
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub input: PathBuf,
    pub artifact: PathBuf,
    pub records: Vec<TransformedQuestion>,
}

// ── Conversion stage ─────────────────────────────────────────────────────────

/// Convert one PDF (path or URL) and write `<root>/problem.json`.
///
/// `problem_id` defaults to the document's file stem.
///
/// # Errors
/// Input errors ([`PipelineError::FileNotFound`], [`PipelineError::NotAPdf`],
/// …) and every conversion-service error. Figure download failures are
/// logged and skipped.
pub async fn convert_document(
    input_str: impl AsRef<str>,
    problem_id: Option<&str>,
    config: &PipelineConfig,
) -> Result<ConversionOutput, PipelineError> {
    let start = Instant::now();
    let input_str = input_str.as_ref();
    info!("Starting conversion: {}", input_str);

    // ── Step 1: Resolve input ────────────────────────────────────────────
    let resolved = input::resolve_input(
        input_str,
        Duration::from_secs(config.download_timeout_secs),
    )
    .await?;
    let origin = resolved.origin();
    let problem_id = match problem_id {
        Some(id) => id.to_string(),
        None => resolved
            .path()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| origin.clone()),
    };

    // ── Step 2: Remote conversion ────────────────────────────────────────
    let client = ConversionClient::new(config)?;
    let markdown = client
        .convert(resolved.path(), config.poll_interval(), config.poll_timeout())
        .await?;

    // ── Step 3: Parse and store figures ──────────────────────────────────
    let images = ImageStore::new(config)?;
    let question = parse::parse(&markdown, &problem_id, &origin, &images).await;
    debug!(
        "Parsed '{}': {} choices, {} images, answer {:?}",
        question.problem_id,
        question.choices.as_ref().map_or(0, |c| c.len()),
        question.images.len(),
        question.answer
    );

    // ── Step 4: Write artifact ───────────────────────────────────────────
    let artifact = config.output_root.join(PROBLEM_FILE);
    artifacts::write_json(&artifact, &question).await?;

    info!(
        "Conversion done in {:.1}s → {}",
        start.elapsed().as_secs_f64(),
        artifact.display()
    );
    Ok(ConversionOutput {
        question,
        artifact,
        markdown,
    })
}

// ── Transformation stage ─────────────────────────────────────────────────────

/// Transform the conversion artifact with the configured LLM provider.
///
/// With `input = None` the artifact is discovered under the output root
/// (see [`artifacts::pick_input`]).
pub async fn transform_artifact(
    input: Option<&Path>,
    config: &PipelineConfig,
) -> Result<TransformOutput, PipelineError> {
    let provider = resolve_provider(config).await?;
    let backend = LlmBackend::new(provider, config);
    transform_artifact_with(backend, input, config).await
}

/// [`transform_artifact`] with an explicit backend.
///
/// Every item must succeed before anything is written. On failure the
/// error is recorded in `_error.txt` next to the intended output and no
/// output artifact is produced.
pub async fn transform_artifact_with<B: GenerativeBackend>(
    backend: B,
    input: Option<&Path>,
    config: &PipelineConfig,
) -> Result<TransformOutput, PipelineError> {
    let root = config.output_root.as_path();
    let input = match input {
        Some(p) => p.to_path_buf(),
        None => artifacts::pick_input(root)?,
    };
    let out_path = artifacts::decide_out_path(root, &input);
    let out_dir = out_path.parent().unwrap_or(root).to_path_buf();
    info!("Transforming {} → {}", input.display(), out_path.display());

    let mut transformer = Transformer::new(backend, config);
    if config.debug_raw {
        transformer = transformer.with_debug_dump(out_dir.join(RAW_DUMP_FILE));
    }

    let result = async {
        std::fs::create_dir_all(&out_dir).map_err(|e| PipelineError::OutputWriteFailed {
            path: out_dir.clone(),
            source: e,
        })?;
        let items = artifacts::load_questions(&input)?;
        let mut records = Vec::with_capacity(items.len());
        for item in &items {
            records.push(transformer.transform(item).await?);
        }
        match records.as_slice() {
            [single] => artifacts::write_json(&out_path, single).await?,
            many => artifacts::write_json(&out_path, many).await?,
        }
        Ok::<_, PipelineError>(records)
    }
    .await;

    match result {
        Ok(records) => {
            info!("Wrote {} transformed record(s)", records.len());
            Ok(TransformOutput {
                input,
                artifact: out_path,
                records,
            })
        }
        Err(e) => {
            let log = artifacts::write_error_log(&out_dir, &e);
            info!("Transformation failed; details in {}", log.display());
            Err(e)
        }
    }
}

// ── Provider resolution ──────────────────────────────────────────────────────

fn create_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`), used as is.
/// 2. **Named provider** (`config.provider_name`) with `config.model`.
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 4. **OpenAI** when `OPENAI_API_KEY` is set, with `config.model`.
/// 5. **Full auto-detection** via [`ProviderFactory::from_env`].
pub async fn resolve_provider(
    config: &PipelineConfig,
) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        return create_provider(name, &config.model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_provider("openai", &config.model);
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY (or another provider key) or pass --provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
