//! Building blocks of a pipeline run.
//!
//! Each submodule owns one concern and is testable on its own; the stage
//! entry points in [`crate::convert`] and the orchestrator in [`crate::run`]
//! wire them together.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ conversion ──▶ parse ──▶ artifacts ──▶ transform ──▶ artifacts
//! (path/URL)  (remote OCR)  (regex)   problem.json   (LLM)    converted_with_schema.json
//!                              │
//!                              └──▶ images (figure downloads)
//! ```
//!
//! 1. [`input`]      : canonicalise the user-supplied path or URL to a local PDF
//! 2. [`conversion`] : submit / poll / fetch against the conversion service
//! 3. [`parse`]      : ordered extraction steps: markdown → `ExtractedQuestion`
//! 4. [`images`]     : save referenced figures under the images directory
//! 5. [`transform`]  : LLM rewrite with retry and schema validation
//! 6. [`artifacts`]  : discovery, output-path rules, atomic writes, verification
//! 7. [`lock`]       : one run per output root

pub mod artifacts;
pub mod conversion;
pub mod images;
pub mod input;
pub mod lock;
pub mod parse;
pub mod transform;
