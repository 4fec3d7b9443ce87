//! Structural parser: converted markdown → [`ExtractedQuestion`].
//!
//! One document holds one question. The conversion service renders it as
//! loosely structured markdown: a metadata table and ID headers, the stem,
//! lettered choices, an `Answer:` line, a `Rationale` section and a
//! difficulty line, in no guaranteed order. Extraction is a fixed sequence
//! of named steps over a [`Draft`]; the input text is never mutated, each
//! step only adds fields or derives a new working view.
//!
//! ## Step Order
//!
//! 1. difficulty + rationale from the **unmodified** source (these sections
//!    may sit inside regions that metadata stripping removes)
//! 2. strip metadata (assessment table, ID headers, difficulty header)
//!    → working view
//! 3. collect and remove image references (dedup by source, first wins)
//! 4. answer
//! 5. difficulty + rationale again from the working view, only if step 1
//!    found nothing
//! 6. choices, read outside the rationale section
//! 7. question text: working view minus rationale section, answer line,
//!    difficulty line and choice lines; blank runs collapsed; trimmed
//!
//! Parsing never fails. A field the document does not carry stays `None`.

use crate::output::{Difficulty, ExtractedQuestion, SourceRef};
use crate::pipeline::images::ImageStore;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::ops::Range;
use tracing::trace;

/// An embedded image reference found in the markdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub alt: String,
    pub src: String,
}

/// Result of the pure extraction pass: the record (with `images` still
/// empty) and the remote images it references, in encounter order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub question: ExtractedQuestion,
    pub image_refs: Vec<ImageRef>,
}

/// Parse `markdown` and download its figures into the image store.
///
/// Figures that fail to download are left out of `images`; everything else
/// is deterministic for a given input.
pub async fn parse(
    markdown: &str,
    problem_id: &str,
    origin: &str,
    images: &ImageStore,
) -> ExtractedQuestion {
    let Extraction {
        mut question,
        image_refs,
    } = extract(markdown, problem_id, origin);
    question.images = images.store_all(&image_refs).await;
    question
}

/// Run every extraction step, without any I/O.
pub fn extract(markdown: &str, problem_id: &str, origin: &str) -> Extraction {
    let mut draft = Draft::new(markdown);
    for (name, step) in STEPS {
        step(&mut draft);
        trace!("parse step '{}' done", name);
    }
    draft.finish(problem_id, origin)
}

/// Names of the extraction steps, in execution order.
pub fn step_names() -> impl Iterator<Item = &'static str> {
    STEPS.iter().map(|(name, _)| *name)
}

// ── Draft ────────────────────────────────────────────────────────────────────

/// Accumulating parse state.
#[derive(Debug, Default)]
struct Draft {
    /// Input with normalised line endings; read-only after construction.
    source: String,
    /// Metadata-stripped, image-free view used for user-facing content.
    working: String,
    difficulty: Option<Difficulty>,
    rationale: Option<String>,
    answer: Option<String>,
    choices: Option<BTreeMap<String, String>>,
    image_refs: Vec<ImageRef>,
    question_text: String,
}

impl Draft {
    fn new(markdown: &str) -> Self {
        let source = markdown.replace("\r\n", "\n").replace('\r', "\n");
        Self {
            working: source.clone(),
            source,
            ..Default::default()
        }
    }

    fn finish(self, problem_id: &str, origin: &str) -> Extraction {
        Extraction {
            question: ExtractedQuestion {
                problem_id: problem_id.to_string(),
                question_text: self.question_text,
                choices: self.choices,
                answer: self.answer,
                rationale: self.rationale,
                difficulty: self.difficulty,
                images: Vec::new(),
                source: SourceRef::single_page(origin),
            },
            image_refs: self.image_refs,
        }
    }
}

type Step = fn(&mut Draft);

const STEPS: [(&str, Step); 7] = [
    ("sections_from_source", step_sections_from_source),
    ("strip_metadata", step_strip_metadata),
    ("images", step_images),
    ("answer", step_answer),
    ("sections_retry", step_sections_retry),
    ("choices", step_choices),
    ("question_text", step_question_text),
];

fn step_sections_from_source(d: &mut Draft) {
    d.difficulty = find_difficulty(&d.source);
    d.rationale = find_rationale(&d.source).map(|(_, body)| body);
}

fn step_strip_metadata(d: &mut Draft) {
    d.working = strip_metadata(&d.source);
}

fn step_images(d: &mut Draft) {
    let (text, refs) = take_images(&d.working);
    d.working = text;
    d.image_refs = refs;
}

fn step_answer(d: &mut Draft) {
    d.answer = find_answer(&d.working);
}

fn step_sections_retry(d: &mut Draft) {
    if d.difficulty.is_none() {
        d.difficulty = find_difficulty(&d.working);
    }
    if d.rationale.is_none() {
        d.rationale = find_rationale(&d.working).map(|(_, body)| body);
    }
}

fn step_choices(d: &mut Draft) {
    d.choices = find_choices(&without_rationale(&d.working));
}

fn step_question_text(d: &mut Draft) {
    d.question_text = question_body(&d.working);
}

// ── Patterns ─────────────────────────────────────────────────────────────────

static RE_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[(?P<alt>[^\]]*)\]\((?P<src>[^)]+)\)").unwrap());

static RE_CHOICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*([A-D])[).][ \t]*(.+)$").unwrap());

static RE_ANSWER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)^[ \t]*(?:correct[ \t]*)?answer[ \t]*:[ \t]*(-?[0-9]+(?:\.[0-9]+)?(?:/[0-9]+)?|-?\.[0-9]+|[A-D])\b",
    )
    .unwrap()
});

static RE_ANSWER_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^[ \t]*(?:correct[ \t]*)?answer[ \t]*:[^\n]*$").unwrap());

static RE_DIFFICULTY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)^[ \t]*(?:##[ \t]*)?(?:question[ \t]*)?difficulty[ \t]*:[ \t]*(easy|medium|hard)\b",
    )
    .unwrap()
});

static RE_DIFFICULTY_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^[ \t]*(?:##[ \t]*)?(?:question[ \t]*)?difficulty[ \t]*:[^\n]*$").unwrap()
});

static RE_RATIONALE_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^[ \t]*(?:##[ \t]*)?rationale:?\s*\n").unwrap());

static RE_QUESTION_ID_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^[ \t]*##[ \t]*question id[^\n]*\n?").unwrap());

static RE_ID_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^[ \t]*##[ \t]*id[ \t]*:[^\n]*\n?").unwrap());

static RE_DIFFICULTY_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^[ \t]*##[ \t]*question difficulty[ \t]*:[^\n]*\n?").unwrap());

static RE_ASSESSMENT_ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[ \t]*\|[ \t]*assessment[ \t]*\|").unwrap());

static RE_BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

// ── Field finders ────────────────────────────────────────────────────────────

/// First `Difficulty: X` / `## Question Difficulty: X` line.
pub fn find_difficulty(text: &str) -> Option<Difficulty> {
    RE_DIFFICULTY
        .captures(text)
        .and_then(|c| Difficulty::parse(&c[1]))
}

/// First non-empty `Rationale` section: its full span (header included) and
/// its trimmed body.
pub fn find_rationale(text: &str) -> Option<(Range<usize>, String)> {
    rationale_sections(text)
        .into_iter()
        .find(|(_, body)| !body.is_empty())
}

/// Every `Rationale` section, empty ones included, in order.
///
/// A body runs until the next `##` heading or the next choice, answer or
/// difficulty line. Its first non-blank line is never taken for a choice,
/// since explanations often open with the label they defend.
fn rationale_sections(text: &str) -> Vec<(Range<usize>, String)> {
    let mut sections: Vec<(Range<usize>, String)> = Vec::new();
    for header in RE_RATIONALE_HEADER.find_iter(text) {
        if sections.last().is_some_and(|(span, _)| header.start() < span.end) {
            continue;
        }
        let body_start = header.end();
        let mut end = text.len();
        let mut offset = body_start;
        let mut first = true;
        for line in text[body_start..].split_inclusive('\n') {
            let line_text = line.trim_end_matches('\n');
            if ends_rationale(line_text, first) {
                end = offset;
                break;
            }
            if !line_text.trim().is_empty() {
                first = false;
            }
            offset += line.len();
        }
        let body = text[body_start..end].trim().to_string();
        sections.push((header.start()..end, body));
    }
    sections
}

fn ends_rationale(line: &str, first: bool) -> bool {
    line.starts_with("##")
        || (!first && RE_CHOICE.is_match(line))
        || RE_ANSWER_LINE.is_match(line)
        || RE_DIFFICULTY_LINE.is_match(line)
}

/// `text` with every rationale section (header and body) cut out.
pub fn without_rationale(text: &str) -> String {
    let mut s = text.to_string();
    for (span, _) in rationale_sections(text).into_iter().rev() {
        s.replace_range(span, "");
    }
    s
}

/// First `Answer: X` / `Correct Answer: X` value: a choice label or a number.
pub fn find_answer(text: &str) -> Option<String> {
    RE_ANSWER.captures(text).map(|c| c[1].to_string())
}

/// Every `A) text` / `A. text` line. `None` when there is none.
///
/// Choice text is whitespace-normalised; a repeated label keeps its last text.
pub fn find_choices(text: &str) -> Option<BTreeMap<String, String>> {
    let mut choices = BTreeMap::new();
    for caps in RE_CHOICE.captures_iter(text) {
        let body = RE_WHITESPACE.replace_all(caps[2].trim(), " ").to_string();
        if body.is_empty() {
            continue;
        }
        choices.insert(caps[1].to_ascii_uppercase(), body);
    }
    if choices.is_empty() {
        None
    } else {
        Some(choices)
    }
}

// ── Text views ───────────────────────────────────────────────────────────────

/// Remove the assessment table, `## Question ID` / `## ID:` headers and the
/// `## Question Difficulty:` header, then trim.
pub fn strip_metadata(text: &str) -> String {
    let s = remove_assessment_table(text);
    let s = RE_QUESTION_ID_HEADER.replace_all(&s, "");
    let s = RE_ID_HEADER.replace_all(&s, "");
    let s = RE_DIFFICULTY_HEADER.replace_all(&s, "");
    s.trim().to_string()
}

/// Drop a pipe table whose header row starts with `| Assessment |`.
///
/// The table runs from that row through every following `|`-prefixed line;
/// a header row with no rows beneath it is left alone.
fn remove_assessment_table(text: &str) -> String {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < lines.len() {
        if RE_ASSESSMENT_ROW.is_match(lines[i]) {
            let rows = lines[i + 1..]
                .iter()
                .take_while(|l| l.trim_start().starts_with('|'))
                .count();
            if rows > 0 {
                i += 1 + rows;
                continue;
            }
        }
        out.push_str(lines[i]);
        i += 1;
    }
    out
}

/// Remove every image tag; return the remaining text and the remote
/// references (deduplicated by source, in encounter order).
pub fn take_images(text: &str) -> (String, Vec<ImageRef>) {
    let mut seen = HashSet::new();
    let mut refs = Vec::new();

    for caps in RE_IMAGE.captures_iter(text) {
        let src = caps["src"].trim().to_string();
        if !seen.insert(src.clone()) {
            continue;
        }
        if !(src.starts_with("http://") || src.starts_with("https://")) {
            trace!("skipping non-remote image '{}'", src);
            continue;
        }
        let alt = match caps["alt"].trim() {
            "" => "figure".to_string(),
            a => a.to_string(),
        };
        refs.push(ImageRef { alt, src });
    }

    (RE_IMAGE.replace_all(text, "").to_string(), refs)
}

/// The question stem left after every other field is cut out.
pub fn question_body(text: &str) -> String {
    let s = without_rationale(text);
    let s = RE_ANSWER_LINE.replace_all(&s, "");
    let s = RE_DIFFICULTY_LINE.replace_all(&s, "");
    let s = RE_CHOICE.replace_all(&s, "");
    RE_BLANK_RUN.replace_all(&s, "\n\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = "## Rationale\nBecause x>0.\n\nA) 1\nB) 2\nC) 3\nD) 4\nAnswer: B\n## Question Difficulty: Medium\nWhat is x?";

    const BANK_PAGE: &str = "| Assessment | Test | Domain | Skill | Difficulty |\n\
| :--- | :--- | :--- | :--- | :--- |\n\
| SAT | Math | Algebra | Linear equations | |\n\
\n\
## ID: 6d99b141\n\
\n\
![](https://cdn.mathpix.com/cropped/fig1.jpg?height=200)\n\
\n\
The line has slope 3. Which equation describes it?\n\
A. $y=3x+1$\n\
B. $y=x+3$\n\
C. $y=-3x$\n\
D. $y=\\frac{1}{3}x$\n\
\n\
## ID: 6d99b141 Answer\n\
\n\
Correct Answer: A\n\
\n\
Rationale\n\
\n\
Choice A is correct. A slope of 3 means the coefficient of x is 3.\n\
\n\
Question Difficulty: Easy\n";

    #[test]
    fn step_order_is_fixed() {
        let names: Vec<_> = step_names().collect();
        assert_eq!(
            names,
            vec![
                "sections_from_source",
                "strip_metadata",
                "images",
                "answer",
                "sections_retry",
                "choices",
                "question_text",
            ]
        );
    }

    #[test]
    fn end_to_end_scenario() {
        let q = extract(SCENARIO, "p1", "bank.pdf").question;
        assert_eq!(q.question_text, "What is x?");
        let choices = q.choices.expect("choices");
        assert_eq!(choices.len(), 4);
        assert_eq!(choices["A"], "1");
        assert_eq!(choices["B"], "2");
        assert_eq!(choices["C"], "3");
        assert_eq!(choices["D"], "4");
        assert_eq!(q.answer.as_deref(), Some("B"));
        assert_eq!(q.difficulty, Some(Difficulty::Medium));
        assert_eq!(q.rationale.as_deref(), Some("Because x>0."));
        assert_eq!(q.source, SourceRef::single_page("bank.pdf"));
    }

    #[test]
    fn question_bank_page() {
        let ex = extract(BANK_PAGE, "6d99b141", "bank.pdf");
        let q = ex.question;
        assert_eq!(
            q.question_text,
            "The line has slope 3. Which equation describes it?"
        );
        assert_eq!(q.answer.as_deref(), Some("A"));
        assert_eq!(q.difficulty, Some(Difficulty::Easy));
        assert_eq!(
            q.rationale.as_deref(),
            Some("Choice A is correct. A slope of 3 means the coefficient of x is 3.")
        );
        assert_eq!(q.choices.as_ref().map(|c| c["D"].as_str()), Some("$y=\\frac{1}{3}x$"));
        assert_eq!(
            ex.image_refs,
            vec![ImageRef {
                alt: "figure".into(),
                src: "https://cdn.mathpix.com/cropped/fig1.jpg?height=200".into(),
            }]
        );
    }

    #[test]
    fn answer_line_is_extracted_and_removed() {
        for value in ["A", "C", "12", "-3", "2.5", "3/4", ".75"] {
            let md = format!("Find the value.\nAnswer: {value}\n");
            let q = extract(&md, "p", "o").question;
            assert_eq!(q.answer.as_deref(), Some(value), "value {value}");
            assert_eq!(q.question_text, "Find the value.");
        }
    }

    #[test]
    fn correct_answer_prefix() {
        assert_eq!(find_answer("Correct Answer: D").as_deref(), Some("D"));
        assert_eq!(find_answer("correct answer:7").as_deref(), Some("7"));
        assert_eq!(find_answer("Answer: Apple"), None);
        assert_eq!(find_answer("no answer here"), None);
    }

    #[test]
    fn no_choice_lines_means_absent_choices() {
        let q = extract("Solve 2x = 4 for x.\nAnswer: 2", "p", "o").question;
        assert_eq!(q.choices, None);
    }

    #[test]
    fn choice_variants() {
        let c = find_choices("A) one\nB.  two   words\n  C) three\nE) nope\nD) four").unwrap();
        assert_eq!(c.keys().cloned().collect::<Vec<_>>(), vec!["A", "B", "C", "D"]);
        assert_eq!(c["B"], "two words");
        assert_eq!(c["C"], "three");
    }

    #[test]
    fn repeated_image_yields_one_entry() {
        let md = "![a](https://x.test/f.png)\nText\n![b](https://x.test/f.png)\n![](https://x.test/f.png)";
        let ex = extract(md, "p", "o");
        assert_eq!(ex.image_refs.len(), 1);
        assert_eq!(ex.image_refs[0].alt, "a");
        assert_eq!(ex.question.question_text, "Text");
    }

    #[test]
    fn non_remote_images_are_stripped_but_not_kept() {
        let (text, refs) = take_images("See ![fig](local/fig.png) here");
        assert_eq!(text, "See  here");
        assert!(refs.is_empty());
    }

    #[test]
    fn question_text_never_contains_image_markup() {
        let md = "Look: ![x](https://a.test/1.png) and ![y](https://a.test/2.png)\nA) 1\nAnswer: A";
        let q = extract(md, "p", "o").question;
        assert!(!q.question_text.contains("!["));
        assert_eq!(q.question_text, "Look:  and");
    }

    #[test]
    fn metadata_is_stripped() {
        let md = "| Assessment | Test |\n| --- | --- |\n| SAT | Math |\n## Question ID 123\n## ID: 123\n## Question Difficulty: Hard\nBody";
        assert_eq!(strip_metadata(md), "Body");
    }

    #[test]
    fn lone_assessment_row_is_kept() {
        let md = "| Assessment |\nBody";
        assert_eq!(strip_metadata(md), md);
    }

    #[test]
    fn difficulty_from_source_beats_retry() {
        // Header form is stripped in step 2 but was already read in step 1.
        let md = "## Question Difficulty: hard\nStem";
        let q = extract(md, "p", "o").question;
        assert_eq!(q.difficulty, Some(Difficulty::Hard));
        assert_eq!(q.question_text, "Stem");
    }

    #[test]
    fn missing_sections_stay_absent() {
        let q = extract("Just a stem.", "p", "o").question;
        assert_eq!(q.question_text, "Just a stem.");
        assert_eq!(q.answer, None);
        assert_eq!(q.rationale, None);
        assert_eq!(q.difficulty, None);
        assert_eq!(q.choices, None);
    }

    #[test]
    fn empty_rationale_section_is_absent() {
        assert_eq!(find_rationale("## Rationale\n\n## Next\n"), None);
    }

    #[test]
    fn rationale_opening_with_a_label_stays_out_of_choices() {
        let md = "Stem?\nA) 1\nB) 2\nAnswer: A\n## Rationale\nA) is right because 1 < 2.\n";
        let q = extract(md, "p", "o").question;
        assert_eq!(q.question_text, "Stem?");
        assert_eq!(q.rationale.as_deref(), Some("A) is right because 1 < 2."));
        let choices = q.choices.unwrap();
        assert_eq!(choices.len(), 2);
        assert_eq!(choices["A"], "1");
        assert_eq!(q.answer.as_deref(), Some("A"));
    }

    #[test]
    fn empty_rationale_header_is_still_cut_from_stem() {
        let q = extract("Stem?\n## Rationale\nAnswer: B\n", "p", "o").question;
        assert_eq!(q.question_text, "Stem?");
        assert_eq!(q.rationale, None);
        assert_eq!(q.answer.as_deref(), Some("B"));
    }

    #[test]
    fn rationale_stops_at_later_choice_line() {
        let (_, body) = find_rationale("## Rationale\nBecause.\nB) 2\n").unwrap();
        assert_eq!(body, "Because.");
    }

    #[test]
    fn rationale_stops_at_next_heading() {
        let text = "Stem\n## Rationale\nLine one.\nLine two.\n## Other\nx";
        let (span, body) = find_rationale(text).unwrap();
        assert_eq!(body, "Line one.\nLine two.");
        assert_eq!(span, 5..37);
    }

    #[test]
    fn blank_runs_collapse_to_one_blank_line() {
        assert_eq!(question_body("a\n\n\n\n\nb"), "a\n\nb");
    }

    #[test]
    fn crlf_input_is_normalised() {
        let q = extract("Stem\r\nA) 1\r\nB) 2\r\nAnswer: B\r\n", "p", "o").question;
        assert_eq!(q.question_text, "Stem");
        assert_eq!(q.choices.unwrap()["B"], "2");
    }

    #[test]
    fn extraction_is_deterministic() {
        let a = extract(BANK_PAGE, "id", "o");
        let b = extract(BANK_PAGE, "id", "o");
        assert_eq!(
            serde_json::to_string(&a.question).unwrap(),
            serde_json::to_string(&b.question).unwrap()
        );
        assert_eq!(a.image_refs, b.image_refs);
    }
}
