//! Live end-to-end tests.
//!
//! These talk to the real conversion service and a real LLM provider, so
//! they are gated behind `E2E_ENABLED` and also need `MATHPIX_APP_ID`,
//! `MATHPIX_APP_KEY`, a provider key (e.g. `OPENAI_API_KEY`) and a sample
//! document in `E2E_PDF`.
//!
//! Run with:
//!   E2E_ENABLED=1 E2E_PDF=bank/q1.pdf cargo test --test e2e -- --nocapture

use pdf2question::pipeline::artifacts::{PROBLEM_FILE, TRANSFORMED_FILE};
use pdf2question::{run, PipelineConfig, ServiceCredentials};
use std::path::PathBuf;

/// Skip unless E2E is enabled and every required variable is present.
macro_rules! e2e_skip_unless_ready {
    () => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        let vars = ["MATHPIX_APP_ID", "MATHPIX_APP_KEY", "E2E_PDF"];
        if let Some(missing) = vars.iter().find(|v| std::env::var(v).is_err()) {
            println!("SKIP: {missing} not set");
            return;
        }
        let pdf = PathBuf::from(std::env::var("E2E_PDF").unwrap());
        if !pdf.exists() {
            println!("SKIP: test file not found: {}", pdf.display());
            return;
        }
        pdf
    }};
}

#[tokio::test]
async fn e2e_full_run() {
    let pdf = e2e_skip_unless_ready!();
    let out = tempfile::tempdir().unwrap();
    let config = PipelineConfig::builder()
        .output_root(out.path())
        .credentials(ServiceCredentials::new(
            std::env::var("MATHPIX_APP_ID").unwrap(),
            std::env::var("MATHPIX_APP_KEY").unwrap(),
        ))
        .build()
        .unwrap();

    let outputs = run(pdf.to_str().unwrap(), &config).await.unwrap();
    assert_eq!(outputs.conversion, out.path().join(PROBLEM_FILE));
    assert_eq!(outputs.transformation, out.path().join(TRANSFORMED_FILE));

    let record: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&outputs.transformation).unwrap()).unwrap();
    println!("{}", serde_json::to_string_pretty(&record).unwrap());
    assert!(record["korean_problem"].as_str().is_some_and(|s| !s.is_empty()));
}
