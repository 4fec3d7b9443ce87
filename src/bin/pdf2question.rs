//! CLI binary for pdf2question.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, runs the requested stage and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pdf2question::config::{DEFAULT_CONVERSION_URL, DEFAULT_MODEL};
use pdf2question::pipeline::images::ImageStore;
use pdf2question::pipeline::parse;
use pdf2question::records;
use pdf2question::{
    convert_document, run_stages, transform_artifact, ConversionStage, JobStatus, PipelineConfig,
    PipelineConfigBuilder, PipelineProgressCallback, ProgressCallback, ServiceCredentials, Stage,
    TransformationStage,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner anchored at the bottom of the terminal; one log line per
/// finished stage.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let template = "{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}";
        let style = ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Starting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_run_start(&self) {
        self.bar.println(format!("{} {}", cyan("◆"), bold("Pipeline started")));
    }

    fn on_stage_start(&self, stage: Stage) {
        self.bar.set_prefix(stage.to_string());
        self.bar.set_message(match stage {
            Stage::Conversion => "uploading document…",
            Stage::Transformation => "waiting for the model…",
            Stage::Verification => "checking artifacts…",
        });
    }

    fn on_poll(&self, job_id: &str, status: JobStatus, elapsed: Duration) {
        self.bar.set_message(format!(
            "job {} {}  {}",
            dim(job_id),
            status,
            dim(&format!("{:.0}s", elapsed.as_secs_f64()))
        ));
    }

    fn on_stage_complete(&self, stage: Stage, elapsed: Duration) {
        self.bar.println(format!(
            "  {} {:<15} {}",
            green("✓"),
            stage.to_string(),
            dim(&format!("{:.1}s", elapsed.as_secs_f64()))
        ));
    }

    fn on_run_complete(&self, error: Option<&str>) {
        self.bar.finish_and_clear();
        match error {
            None => eprintln!("{} {}", green("✔"), bold("Both artifacts written")),
            Some(e) => eprintln!("{} {}", red("✘"), red(e.lines().next().unwrap_or(e))),
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Full pipeline: convert, transform, verify
  pdf2question run sat_q1.pdf

  # Stages one at a time
  pdf2question convert sat_q1.pdf --problem-id 6d99b141
  pdf2question transform

  # Parse markdown you already have (no network with --no-images)
  pdf2question parse page.md --no-images

  # Upsert payloads for the problem store, one JSON per line
  pdf2question records out > payloads.ndjson

ARTIFACTS (under --output-root, default ./out):
  problem.json                 parsed question
  images/                      downloaded figures
  converted_with_schema.json   transformed question(s)
  _error.txt                   last failure
  _last_raw.json               last raw model reply (--debug-raw)
  .pipeline.lock               present while a run is active

ENVIRONMENT VARIABLES (also read from ./.env):
  MATHPIX_APP_ID / MATHPIX_APP_KEY   Conversion service credentials
  OPENAI_API_KEY                     OpenAI API key (other provider keys work too)
  EDGEQUAKE_LLM_PROVIDER             Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL                    Override model ID
  AI_TRANSFORMER_DEBUG_RAW=1         Keep the last raw model reply
  RUST_LOG                           Log filter (overrides --verbose / --quiet)
"#;

/// Convert question-bank PDFs into structured, curriculum-tagged questions.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2question",
    version,
    about = "Convert question-bank PDFs into structured, curriculum-tagged questions",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDF2Q_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDF2Q_QUIET")]
    quiet: bool,

    /// Disable the progress spinner.
    #[arg(long, global = true, env = "PDF2Q_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert, transform and verify one document under the run lock.
    Run {
        /// Local PDF file path or HTTP/HTTPS URL.
        input: String,
        /// Record id; defaults to the PDF file stem.
        #[arg(long)]
        problem_id: Option<String>,
        #[command(flatten)]
        output: OutputArgs,
        #[command(flatten)]
        service: ServiceArgs,
        #[command(flatten)]
        llm: LlmArgs,
    },
    /// Conversion stage only: PDF → problem.json.
    Convert {
        /// Local PDF file path or HTTP/HTTPS URL.
        input: String,
        /// Record id; defaults to the PDF file stem.
        #[arg(long)]
        problem_id: Option<String>,
        #[command(flatten)]
        output: OutputArgs,
        #[command(flatten)]
        service: ServiceArgs,
    },
    /// Transformation stage only: problem(s).json → converted_with_schema.json.
    Transform {
        /// Input artifact; discovered under the output root when omitted.
        input: Option<PathBuf>,
        #[command(flatten)]
        output: OutputArgs,
        #[command(flatten)]
        llm: LlmArgs,
    },
    /// Parse a local markdown file and print the record as JSON.
    Parse {
        /// Markdown file.
        input: PathBuf,
        /// Record id; defaults to the file stem.
        #[arg(long)]
        problem_id: Option<String>,
        /// `source.origin` label; defaults to the file name.
        #[arg(long)]
        origin: Option<String>,
        /// Do not download figures.
        #[arg(long)]
        no_images: bool,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Print upsert payloads for every *.json in a directory, one per line.
    Records {
        /// Directory to scan (not recursive).
        #[arg(default_value = "out")]
        dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Directory holding every artifact of a run.
    #[arg(short = 'o', long, env = "PDF2Q_OUTPUT_ROOT", default_value = "out")]
    output_root: PathBuf,
}

#[derive(Args, Debug)]
struct ServiceArgs {
    /// Conversion service app id.
    #[arg(long, env = "MATHPIX_APP_ID", hide_env_values = true)]
    app_id: Option<String>,

    /// Conversion service app key.
    #[arg(long, env = "MATHPIX_APP_KEY", hide_env_values = true)]
    app_key: Option<String>,

    /// Conversion service endpoint.
    #[arg(long, env = "PDF2Q_CONVERSION_URL", default_value = DEFAULT_CONVERSION_URL)]
    conversion_url: String,

    /// Milliseconds between job status checks.
    #[arg(long, env = "PDF2Q_POLL_INTERVAL_MS", default_value_t = 4000)]
    poll_interval_ms: u64,

    /// Give up on a pending job after this many seconds.
    #[arg(long, env = "PDF2Q_POLL_TIMEOUT", default_value_t = 900)]
    poll_timeout: u64,

    /// HTTP download timeout in seconds (URL input).
    #[arg(long, env = "PDF2Q_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,
}

#[derive(Args, Debug)]
struct LlmArgs {
    /// LLM model ID.
    #[arg(long, env = "EDGEQUAKE_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(
        long,
        env = "EDGEQUAKE_LLM_PROVIDER",
        long_help = "LLM provider. Auto-detected from API key env vars if not set.\n\
          Supported: openai, anthropic, gemini, azure, ollama, or any OpenAI-compatible URL."
    )]
    provider: Option<String>,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "PDF2Q_TEMPERATURE", default_value_t = 0.2)]
    temperature: f32,

    /// Max LLM output tokens per question.
    #[arg(long, env = "PDF2Q_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// Retries per question on transport or JSON failure.
    #[arg(long, env = "PDF2Q_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Text file replacing the built-in curriculum list.
    #[arg(long, env = "PDF2Q_CURRICULUM")]
    curriculum: Option<PathBuf>,

    /// Keep the last raw model reply in _last_raw.json.
    #[arg(long, env = "AI_TRANSFORMER_DEBUG_RAW")]
    debug_raw: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is the normal case.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner replaces INFO logs; --verbose always wins.
    let show_progress = !cli.quiet && !cli.no_progress && is_pipeline_command(&cli.command);
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };

    match cli.command {
        Command::Run {
            input,
            problem_id,
            output,
            service,
            llm,
        } => {
            let builder = apply_llm(apply_service(base(&output, progress), &service), &llm).await?;
            let config = builder.build().context("Invalid configuration")?;
            let mut stage = ConversionStage::new(&input);
            if let Some(id) = problem_id {
                stage = stage.with_problem_id(id);
            }
            let outputs = run_stages(&stage, &TransformationStage, &config)
                .await
                .context("Pipeline failed")?;
            if !cli.quiet {
                eprintln!(
                    "   {}  {}",
                    dim(&outputs.conversion.display().to_string()),
                    bold(&outputs.transformation.display().to_string())
                );
            }
        }
        Command::Convert {
            input,
            problem_id,
            output,
            service,
        } => {
            let config = apply_service(base(&output, None), &service)
                .build()
                .context("Invalid configuration")?;
            let out = convert_document(&input, problem_id.as_deref(), &config)
                .await
                .context("Conversion failed")?;
            if !cli.quiet {
                eprintln!(
                    "{} {}  {} choices, {} images  →  {}",
                    green("✔"),
                    out.question.problem_id,
                    out.question.choices.as_ref().map_or(0, |c| c.len()),
                    out.question.images.len(),
                    bold(&out.artifact.display().to_string())
                );
            }
        }
        Command::Transform { input, output, llm } => {
            let config = apply_llm(base(&output, None), &llm)
                .await?
                .build()
                .context("Invalid configuration")?;
            let out = transform_artifact(input.as_deref(), &config)
                .await
                .context("Transformation failed")?;
            if !cli.quiet {
                eprintln!(
                    "{} {} record(s)  {}  →  {}",
                    green("✔"),
                    out.records.len(),
                    dim(&out.input.display().to_string()),
                    bold(&out.artifact.display().to_string())
                );
            }
        }
        Command::Parse {
            input,
            problem_id,
            origin,
            no_images,
            output,
        } => {
            let markdown = tokio::fs::read_to_string(&input)
                .await
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let stem = input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let problem_id = problem_id.unwrap_or(stem);
            let origin = origin.unwrap_or_else(|| {
                input
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });

            let question = if no_images {
                parse::extract(&markdown, &problem_id, &origin).question
            } else {
                let config = base(&output, None).build().context("Invalid configuration")?;
                let images = ImageStore::new(&config)?;
                parse::parse(&markdown, &problem_id, &origin, &images).await
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&question).context("Failed to serialise record")?
            );
        }
        Command::Records { dir } => {
            let payloads = records::collect_payloads(&dir, chrono::Utc::now())
                .with_context(|| format!("Failed to read records from {}", dir.display()))?;
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            for p in &payloads {
                let line = serde_json::to_string(p).context("Failed to serialise payload")?;
                writeln!(handle, "{line}").context("Failed to write to stdout")?;
            }
            if !cli.quiet {
                eprintln!("{} {} payload(s)", green("✔"), payloads.len());
            }
        }
    }

    Ok(())
}

fn is_pipeline_command(command: &Command) -> bool {
    matches!(command, Command::Run { .. })
}

fn base(output: &OutputArgs, progress: Option<ProgressCallback>) -> PipelineConfigBuilder {
    let builder = PipelineConfig::builder().output_root(&output.output_root);
    match progress {
        Some(cb) => builder.progress_callback(cb),
        None => builder,
    }
}

fn apply_service(builder: PipelineConfigBuilder, args: &ServiceArgs) -> PipelineConfigBuilder {
    let builder = builder
        .conversion_base_url(&args.conversion_url)
        .poll_interval_ms(args.poll_interval_ms)
        .poll_timeout_secs(args.poll_timeout)
        .download_timeout_secs(args.download_timeout);
    match (&args.app_id, &args.app_key) {
        (Some(id), Some(key)) => builder.credentials(ServiceCredentials::new(id, key)),
        _ => builder,
    }
}

async fn apply_llm(
    builder: PipelineConfigBuilder,
    args: &LlmArgs,
) -> Result<PipelineConfigBuilder> {
    let mut builder = builder
        .model(&args.model)
        .temperature(args.temperature)
        .max_tokens(args.max_tokens)
        .max_retries(args.max_retries)
        .debug_raw(args.debug_raw);
    if let Some(ref name) = args.provider {
        builder = builder.provider_name(name);
    }
    if let Some(ref path) = args.curriculum {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read curriculum from {:?}", path))?;
        builder = builder.curriculum(text);
    }
    Ok(builder)
}
