//! Records produced by the pipeline.
//!
//! [`ExtractedQuestion`] is what the markdown parser builds from one
//! converted document; [`TransformedQuestion`] is what the transformation
//! stage accepts back from the LLM. Both serialise to the JSON artifacts
//! written under the output root.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Difficulty label printed by the source question bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    /// Case-insensitive parse of `easy` / `medium` / `hard`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "easy" => Some(Difficulty::Easy),
            "medium" => Some(Difficulty::Medium),
            "hard" => Some(Difficulty::Hard),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "Easy",
            Difficulty::Medium => "Medium",
            Difficulty::Hard => "Hard",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A figure referenced by the question, stored under the images directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub alt: String,
    /// Path relative to the output root, `/`-separated (e.g. `images/fig.png`).
    #[serde(rename = "src")]
    pub local_path: String,
}

/// Where a record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub origin: String,
    pub page: u32,
}

impl SourceRef {
    /// One document holds one question, always on its first page.
    pub fn single_page(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            page: 1,
        }
    }
}

/// Structured question extracted from converted markdown.
///
/// Optional fields are `None` (serialised as `null`) when the source had no
/// such section; they are never filled with placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedQuestion {
    pub problem_id: String,
    #[serde(default)]
    pub question_text: String,
    /// Choice label (`A`–`D`) → choice text.
    #[serde(default)]
    pub choices: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub difficulty: Option<Difficulty>,
    #[serde(default)]
    pub images: Vec<ImageEntry>,
    #[serde(default = "unknown_source")]
    pub source: SourceRef,
}

fn unknown_source() -> SourceRef {
    SourceRef::single_page("")
}

/// Top-level keys every transformed record must carry.
pub const REQUIRED_KEYS: [&str; 9] = [
    "problem_id",
    "korean_problem",
    "english_problem",
    "korean_solution",
    "english_solution",
    "choices",
    "answer",
    "curriculum",
    "difficulty",
];

/// Keys required inside `choices`.
pub const CHOICE_KEYS: [&str; 4] = ["A", "B", "C", "D"];

/// Keys required inside `curriculum` (major unit, minor unit, grade).
pub const CURRICULUM_KEYS: [&str; 3] = ["대단원", "소단원", "학년"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceSet {
    #[serde(rename = "A")]
    pub a: String,
    #[serde(rename = "B")]
    pub b: String,
    #[serde(rename = "C")]
    pub c: String,
    #[serde(rename = "D")]
    pub d: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Curriculum {
    #[serde(rename = "대단원")]
    pub major_unit: String,
    #[serde(rename = "소단원")]
    pub minor_unit: String,
    #[serde(rename = "학년")]
    pub grade: String,
}

/// Bilingual, curriculum-tagged rewrite of an [`ExtractedQuestion`].
///
/// Keys the model adds beyond the mandatory set are kept in `extra` so the
/// written artifact is exactly what the model returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedQuestion {
    pub problem_id: String,
    pub korean_problem: String,
    pub english_problem: String,
    pub korean_solution: String,
    pub english_solution: String,
    pub choices: ChoiceSet,
    pub answer: String,
    pub curriculum: Curriculum,
    pub difficulty: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
