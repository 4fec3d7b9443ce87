//! Transformation stage: rewrite an [`ExtractedQuestion`] through an LLM.
//!
//! All prompt text lives in [`crate::prompts`]; this module owns the retry
//! loop and the schema check only.
//!
//! ## Retry Strategy
//!
//! Transport errors and responses that are not a JSON object are retried
//! up to `max_retries` times with a fixed `retry_backoff_ms` pause. The
//! budget is small (2 by default) because every attempt is a full
//! generation. A response that *is* a JSON object but misses a required
//! key is not retried: [`validate`] fails it with
//! [`PipelineError::SchemaValidation`] straight away.
//!
//! ## Backend seam
//!
//! [`GenerativeBackend`] is the only thing the stage needs from a model:
//! system + user text in, raw text out. [`LlmBackend`] adapts any
//! `edgequake_llm` provider; tests plug in scripted backends.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::output::{
    ExtractedQuestion, TransformedQuestion, CHOICE_KEYS, CURRICULUM_KEYS, REQUIRED_KEYS,
};
use crate::prompts::build_messages;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use serde_json::{Map, Value};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Text generation as seen by the transformation stage.
pub trait GenerativeBackend: Send + Sync {
    /// Return the model's raw reply, or a transport error message.
    fn generate(
        &self,
        system: &str,
        user: &str,
    ) -> impl Future<Output = Result<String, String>> + Send;
}

/// [`GenerativeBackend`] over an `edgequake_llm` provider.
pub struct LlmBackend {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl LlmBackend {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
        }
    }
}

impl GenerativeBackend for LlmBackend {
    async fn generate(&self, system: &str, user: &str) -> Result<String, String> {
        let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        let start = Instant::now();
        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| e.to_string())?;
        debug!(
            "{} input tokens, {} output tokens, {:?}",
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        Ok(response.content)
    }
}

fn build_options(config: &PipelineConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

/// Drives one backend with the retry and validation contract.
pub struct Transformer<B> {
    backend: B,
    max_retries: u32,
    backoff: Duration,
    curriculum: Option<String>,
    debug_dump: Option<PathBuf>,
}

impl<B: GenerativeBackend> Transformer<B> {
    pub fn new(backend: B, config: &PipelineConfig) -> Self {
        Self {
            backend,
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
            curriculum: config.curriculum.clone(),
            debug_dump: None,
        }
    }

    /// Persist every raw reply to `path` (overwritten per call).
    pub fn with_debug_dump(mut self, path: impl Into<PathBuf>) -> Self {
        self.debug_dump = Some(path.into());
        self
    }

    /// Rewrite one question and check the result against the schema.
    pub async fn transform(
        &self,
        item: &ExtractedQuestion,
    ) -> Result<TransformedQuestion, PipelineError> {
        let (system, user) = build_messages(item, self.curriculum.as_deref());
        let mut record = self.call_json(&item.problem_id, &system, &user).await?;
        validate(&record)?;
        stringify_scalars(&mut record);
        let transformed = serde_json::from_value(Value::Object(record)).map_err(|e| {
            PipelineError::Internal(format!("validated record did not deserialise: {e}"))
        })?;
        info!("Transformed '{}'", item.problem_id);
        Ok(transformed)
    }

    /// Call the backend until it yields a JSON object or the budget runs out.
    pub async fn call_json(
        &self,
        problem_id: &str,
        system: &str,
        user: &str,
    ) -> Result<Map<String, Value>, PipelineError> {
        let mut last_err = String::from("no attempt made");

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                warn!(
                    "'{}': retry {}/{} after {}ms",
                    problem_id,
                    attempt,
                    self.max_retries,
                    self.backoff.as_millis()
                );
                sleep(self.backoff).await;
            }

            let raw = match self.backend.generate(system, user).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("'{}': attempt {} failed: {}", problem_id, attempt + 1, e);
                    last_err = e;
                    continue;
                }
            };
            self.dump_raw(&raw).await;

            match parse_json_object(&raw) {
                Ok(record) => return Ok(record),
                Err(e) => {
                    warn!(
                        "'{}': attempt {} returned unusable JSON: {}",
                        problem_id,
                        attempt + 1,
                        e
                    );
                    last_err = e;
                }
            }
        }

        Err(PipelineError::Transformation {
            problem_id: problem_id.to_string(),
            attempts: self.max_retries + 1,
            last_error: last_err,
        })
    }

    async fn dump_raw(&self, raw: &str) {
        if let Some(ref path) = self.debug_dump {
            if let Err(e) = tokio::fs::write(path, raw).await {
                warn!("Could not write raw response to {}: {}", path.display(), e);
            }
        }
    }
}

/// Parse a reply as a JSON object, tolerating a surrounding code fence.
pub fn parse_json_object(raw: &str) -> Result<Map<String, Value>, String> {
    let body = strip_code_fence(raw);
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {}", json_kind(&other))),
        Err(e) => Err(e.to_string()),
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let t = raw.trim();
    let Some(rest) = t.strip_prefix("```") else {
        return t;
    };
    // Drop the info string (`json`) on the opening line.
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// All-or-nothing schema check; names the first offending key.
///
/// Top-level keys are checked in schema order, then `choices.A`..`D`, then
/// the curriculum keys. `choices` and `curriculum` must be objects; every
/// other value must be a non-null scalar (`"answer": 12` is fine).
pub fn validate(record: &Map<String, Value>) -> Result<(), PipelineError> {
    let missing = |key: String| PipelineError::SchemaValidation { key };

    for key in REQUIRED_KEYS {
        let ok = match (key, record.get(key)) {
            ("choices" | "curriculum", Some(v)) => v.is_object(),
            (_, Some(v)) => is_scalar(v),
            (_, None) => false,
        };
        if !ok {
            return Err(missing(key.to_string()));
        }
    }

    for (parent, keys) in [("choices", &CHOICE_KEYS[..]), ("curriculum", &CURRICULUM_KEYS[..])] {
        let inner = &record[parent];
        for key in keys {
            if !inner.get(*key).is_some_and(is_scalar) {
                return Err(missing(format!("{parent}.{key}")));
            }
        }
    }
    Ok(())
}

fn is_scalar(v: &Value) -> bool {
    matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Render numeric and boolean schema values as strings, in place.
pub fn stringify_scalars(record: &mut Map<String, Value>) {
    fn stringify(v: &mut Value) {
        if matches!(v, Value::Number(_) | Value::Bool(_)) {
            *v = Value::String(v.to_string());
        }
    }

    for key in REQUIRED_KEYS {
        match (key, record.get_mut(key)) {
            ("choices" | "curriculum", Some(Value::Object(inner))) => {
                inner.values_mut().for_each(stringify)
            }
            (_, Some(v)) => stringify(v),
            (_, None) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::SourceRef;
    use serde_json::json;
    use std::sync::Mutex;

    /// Replays canned replies in order; counts calls.
    struct Scripted {
        replies: Mutex<Vec<Result<String, String>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, String>>) -> Self {
            let mut replies = replies;
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl GenerativeBackend for Scripted {
        async fn generate(&self, _system: &str, _user: &str) -> Result<String, String> {
            *self.calls.lock().unwrap() += 1;
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err("script exhausted".into()))
        }
    }

    fn valid_reply() -> Value {
        json!({
            "problem_id": "p1",
            "korean_problem": "버스 요금 문제",
            "english_problem": "Bus fare problem",
            "korean_solution": "풀이",
            "english_solution": "Solution",
            "choices": {"A": "1", "B": "2", "C": "3", "D": "4"},
            "answer": "B",
            "curriculum": {"대단원": "문자와 식", "소단원": "일차방정식", "학년": "중1"},
            "difficulty": "Medium"
        })
    }

    fn item() -> ExtractedQuestion {
        ExtractedQuestion {
            problem_id: "p1".into(),
            question_text: "What is x?".into(),
            choices: None,
            answer: Some("B".into()),
            rationale: None,
            difficulty: None,
            images: vec![],
            source: SourceRef::single_page("bank.pdf"),
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig::builder().retry_backoff_ms(1).build().unwrap()
    }

    #[test]
    fn options_follow_config() {
        let opts = build_options(&PipelineConfig::default());
        assert_eq!(opts.temperature, Some(0.2));
        assert_eq!(opts.max_tokens, Some(4096));
    }

    #[test]
    fn fenced_json_is_accepted() {
        let raw = "```json\n{\"a\": 1}\n```";
        assert_eq!(parse_json_object(raw).unwrap()["a"], json!(1));
        assert!(parse_json_object("[1, 2]").unwrap_err().contains("array"));
        assert!(parse_json_object("not json").is_err());
    }

    #[test]
    fn validate_accepts_complete_record() {
        let v = valid_reply();
        assert!(validate(v.as_object().unwrap()).is_ok());
    }

    #[test]
    fn validate_names_missing_answer() {
        let mut v = valid_reply();
        v.as_object_mut().unwrap().remove("answer");
        match validate(v.as_object().unwrap()) {
            Err(PipelineError::SchemaValidation { key }) => assert_eq!(key, "answer"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn validate_checks_nested_keys() {
        let mut v = valid_reply();
        v["choices"].as_object_mut().unwrap().remove("C");
        match validate(v.as_object().unwrap()) {
            Err(PipelineError::SchemaValidation { key }) => assert_eq!(key, "choices.C"),
            other => panic!("unexpected: {other:?}"),
        }

        let mut v = valid_reply();
        v["curriculum"].as_object_mut().unwrap().remove("학년");
        match validate(v.as_object().unwrap()) {
            Err(PipelineError::SchemaValidation { key }) => assert_eq!(key, "curriculum.학년"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_wrong_shape() {
        let mut v = valid_reply();
        v["choices"] = json!(["1", "2", "3", "4"]);
        assert!(matches!(
            validate(v.as_object().unwrap()),
            Err(PipelineError::SchemaValidation { key }) if key == "choices"
        ));
    }

    #[test]
    fn validate_treats_null_as_missing() {
        let mut v = valid_reply();
        v["difficulty"] = Value::Null;
        assert!(matches!(
            validate(v.as_object().unwrap()),
            Err(PipelineError::SchemaValidation { key }) if key == "difficulty"
        ));
    }

    #[tokio::test]
    async fn numeric_answer_is_accepted() {
        let mut v = valid_reply();
        v["answer"] = json!(12);
        v["choices"]["D"] = json!(2.5);
        let backend = Scripted::new(vec![Ok(v.to_string())]);
        let out = Transformer::new(backend, &config()).transform(&item()).await.unwrap();
        assert_eq!(out.answer, "12");
        assert_eq!(out.choices.d, "2.5");
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let backend = Scripted::new(vec![
            Err("HTTP 503".into()),
            Ok("I cannot comply".into()),
            Ok(valid_reply().to_string()),
        ]);
        let t = Transformer::new(backend, &config());
        let out = t.transform(&item()).await.unwrap();
        assert_eq!(out.answer, "B");
        assert_eq!(out.curriculum.grade, "중1");
        assert_eq!(t.backend.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_reports_last_error() {
        let backend = Scripted::new(vec![
            Err("HTTP 503".into()),
            Err("HTTP 503".into()),
            Err("connection reset".into()),
        ]);
        let t = Transformer::new(backend, &config());
        match t.transform(&item()).await {
            Err(PipelineError::Transformation {
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "connection reset");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(t.backend.calls(), 3);
    }

    #[tokio::test]
    async fn schema_failure_is_not_retried() {
        let mut reply = valid_reply();
        reply.as_object_mut().unwrap().remove("answer");
        let backend = Scripted::new(vec![Ok(reply.to_string()), Ok(valid_reply().to_string())]);
        let t = Transformer::new(backend, &config());
        let err = t.transform(&item()).await.unwrap_err();
        assert!(matches!(err, PipelineError::SchemaValidation { ref key } if key == "answer"));
        assert_eq!(t.backend.calls(), 1);
    }

    #[tokio::test]
    async fn raw_reply_is_dumped_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("_last_raw.json");
        let raw = valid_reply().to_string();
        let t = Transformer::new(Scripted::new(vec![Ok(raw.clone())]), &config())
            .with_debug_dump(&dump);
        t.transform(&item()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dump).unwrap(), raw);
    }
}
