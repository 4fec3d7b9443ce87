//! Prompts for the transformation stage.
//!
//! The system prompt is fixed; the user prompt is filled from one
//! [`ExtractedQuestion`]. Callers can swap the curriculum list via
//! [`crate::config::PipelineConfig::curriculum`]; the output schema text is
//! not configurable because [`crate::pipeline::transform::validate`]
//! enforces exactly that shape.

use crate::output::ExtractedQuestion;
use once_cell::sync::Lazy;
use regex::Regex;

/// System prompt for rewriting a question bank item.
pub const SYSTEM_PROMPT: &str = "You are a Korean middle-school mathematics teacher who adapts \
SAT/ACT questions to the level of Korean middle-school students and writes worked solutions \
for them. Always answer with a single JSON object and nothing else.";

/// Korean middle-school mathematics curriculum (grade → major unit → minor units).
///
/// The model must pick `curriculum.대단원`, `curriculum.소단원` and
/// `curriculum.학년` from this list only.
pub const DEFAULT_CURRICULUM: &str = r#"[Korean middle-school mathematics curriculum]
중1
- 수와 연산: 소인수분해, 정수와 유리수
- 문자와 식: 문자의 사용과 식의 계산, 일차방정식
- 좌표평면과 그래프: 좌표와 그래프, 정비례와 반비례
- 기하: 기본 도형, 작도와 합동, 평면도형의 성질, 입체도형의 성질
- 통계: 자료의 정리와 해석
중2
- 수와 연산: 유리수와 순환소수
- 문자와 식: 식의 계산, 일차부등식, 연립일차방정식
- 함수: 일차함수와 그래프, 일차함수와 일차방정식의 관계
- 기하: 삼각형의 성질, 사각형의 성질, 도형의 닮음, 피타고라스 정리
- 확률: 경우의 수, 확률
중3
- 수와 연산: 제곱근과 실수
- 문자와 식: 다항식의 곱셈과 인수분해, 이차방정식
- 함수: 이차함수와 그래프
- 기하: 삼각비, 원의 성질
- 통계: 대푯값과 산포도, 상관관계"#;

/// Shape the model must return; mirrors [`crate::output::TransformedQuestion`].
pub const OUTPUT_SCHEMA: &str = r#"[Output JSON schema]
{
  "problem_id": "string",
  "korean_problem": "string",
  "english_problem": "string",
  "korean_solution": "string",
  "english_solution": "string",
  "choices": {"A":"string","B":"string","C":"string","D":"string"},
  "answer": "A|B|C|D",
  "curriculum": {"대단원":"string","소단원":"string","학년":"string"},
  "difficulty": "string"
}"#;

static RE_WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").unwrap());

/// Flatten a field before it is embedded in the prompt.
///
/// LaTeX line breaks (`\\`) become spaces, paragraph breaks become single
/// newlines, and any remaining whitespace run collapses to one space.
pub fn clean_text(s: &str) -> String {
    let s = s.replace("\\\\", " ").replace("\n\n", "\n");
    RE_WHITESPACE_RUN.replace_all(&s, " ").trim().to_string()
}

/// Build the `(system, user)` message pair for one question.
pub fn build_messages(item: &ExtractedQuestion, curriculum: Option<&str>) -> (String, String) {
    let problem_id = clean_text(&item.problem_id);
    let question_text = clean_text(&item.question_text);
    let choice = |label: &str| {
        item.choices
            .as_ref()
            .and_then(|c| c.get(label))
            .map(|t| clean_text(t))
            .unwrap_or_default()
    };
    let answer = item.answer.as_deref().map(clean_text).unwrap_or_default();
    let rationale = item.rationale.as_deref().map(clean_text).unwrap_or_default();
    let difficulty = item
        .difficulty
        .map(|d| d.as_str().to_string())
        .unwrap_or_default();
    let curriculum = curriculum.unwrap_or(DEFAULT_CURRICULUM);

    let user = format!(
        "Rewrite the SAT question below for a Korean 9th-grade (중3) student.\n\
- Write the problem and the solution in both Korean and English.\n\
- The problem must be set in an everyday situation a student meets \
(bus fares, supermarket discounts, sports results, measuring recipe ingredients, ...). \
A rewrite without such a situation is not finished.\n\
- Keep exactly four choices (A-D) and keep number formatting consistent.\n\
- Choose 대단원, 소단원 and 학년 only from the curriculum list provided.\n\
- Output JSON only.\n\
\n\
[Question ID] {problem_id}\n\
\n\
[Original SAT question]\n\
{question_text}\n\
\n\
[Choices]\n\
A. {a}\n\
B. {b}\n\
C. {c}\n\
D. {d}\n\
\n\
[Answer (keep it if given)]: {answer}\n\
[Rationale (if any)]: {rationale}\n\
[Difficulty hint (if any)]: {difficulty}\n\
\n\
{curriculum}\n\
\n\
{OUTPUT_SCHEMA}\n",
        a = choice("A"),
        b = choice("B"),
        c = choice("C"),
        d = choice("D"),
    );

    (SYSTEM_PROMPT.to_string(), user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{Difficulty, SourceRef};
    use std::collections::BTreeMap;

    fn sample() -> ExtractedQuestion {
        let mut choices = BTreeMap::new();
        choices.insert("A".to_string(), "1".to_string());
        choices.insert("B".to_string(), "  2  ".to_string());
        ExtractedQuestion {
            problem_id: "6d99b141".into(),
            question_text: "If $x\\\\y$ holds,\n\nwhat   is x?".into(),
            choices: Some(choices),
            answer: Some("B".into()),
            rationale: None,
            difficulty: Some(Difficulty::Medium),
            images: vec![],
            source: SourceRef::single_page("bank.pdf"),
        }
    }

    #[test]
    fn clean_text_flattens_whitespace() {
        assert_eq!(clean_text("a\\\\b"), "a b");
        assert_eq!(clean_text("one\n\ntwo"), "one\ntwo");
        assert_eq!(clean_text("  x    y \t z  "), "x y z");
        assert_eq!(clean_text(""), "");
    }

    #[test]
    fn user_prompt_embeds_fields() {
        let (system, user) = build_messages(&sample(), None);
        assert_eq!(system, SYSTEM_PROMPT);
        assert!(user.contains("[Question ID] 6d99b141"));
        assert!(user.contains("If $x y$ holds,\nwhat is x?"));
        assert!(user.contains("A. 1\n"));
        assert!(user.contains("B. 2\n"));
        // Absent choices are listed empty rather than invented.
        assert!(user.contains("C. \n"));
        assert!(user.contains("[Answer (keep it if given)]: B"));
        assert!(user.contains("[Difficulty hint (if any)]: Medium"));
        assert!(user.contains("[Rationale (if any)]: \n"));
        assert!(user.contains(DEFAULT_CURRICULUM));
        assert!(user.contains(OUTPUT_SCHEMA));
    }

    #[test]
    fn custom_curriculum_replaces_default() {
        let (_, user) = build_messages(&sample(), Some("[custom list]"));
        assert!(user.contains("[custom list]"));
        assert!(!user.contains(DEFAULT_CURRICULUM));
    }

    #[test]
    fn schema_text_lists_every_required_key() {
        for key in crate::output::REQUIRED_KEYS {
            assert!(OUTPUT_SCHEMA.contains(&format!("\"{key}\"")), "missing {key}");
        }
    }
}
