//! Interface to an OCR engine.
//!
//! Engines are synchronous. Callers run them from blocking tasks, since every
//! call is CPU-bound and usually shells out.

use std::fmt;

use image::GrayImage;
use schemars::JsonSchema;

use crate::prelude::*;

pub mod tesseract;

/// Page segmentation modes we ask the engine for. These map directly onto
/// tesseract's `--psm` values.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutMode {
    /// A single column of text of variable sizes (`psm 4`).
    SingleColumn,
    /// A single uniform block of text (`psm 6`).
    SingleBlock,
    /// A single text line (`psm 7`).
    SingleLine,
    /// A single word (`psm 8`).
    SingleWord,
    /// As much text as possible, in no particular order (`psm 11`).
    SparseText,
    /// A single raw line, bypassing tesseract-specific hacks (`psm 13`).
    RawLine,
}

impl LayoutMode {
    /// The tesseract `--psm` value.
    pub fn psm(self) -> u8 {
        match self {
            LayoutMode::SingleColumn => 4,
            LayoutMode::SingleBlock => 6,
            LayoutMode::SingleLine => 7,
            LayoutMode::SingleWord => 8,
            LayoutMode::SparseText => 11,
            LayoutMode::RawLine => 13,
        }
    }
}

impl fmt::Display for LayoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "psm{}", self.psm())
    }
}

/// A single recognized word.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognizedWord {
    /// The word, without surrounding whitespace.
    pub text: String,
    /// Engine confidence, `0..=100`. Negative means "no estimate".
    pub confidence: f64,
    /// Identifies the text line this word belongs to, so we can rebuild
    /// line structure.
    pub line_key: (u32, u32, u32, u32),
}

/// Everything an engine recognized on one image.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Recognition {
    /// Recognized words in reading order. Never contains empty words.
    pub words: Vec<RecognizedWord>,
}

impl Recognition {
    /// Build a recognition from words, dropping empty ones.
    pub fn from_words(words: impl IntoIterator<Item = RecognizedWord>) -> Self {
        let words = words
            .into_iter()
            .filter_map(|mut word| {
                let trimmed = word.text.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    if trimmed.len() != word.text.len() {
                        word.text = trimmed.to_owned();
                    }
                    Some(word)
                }
            })
            .collect();
        Self { words }
    }

    /// Whitespace-normalized text: all words separated by single spaces.
    pub fn text(&self) -> String {
        normalize_whitespace(
            &self
                .words
                .iter()
                .map(|w| w.text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        )
    }

    /// Text with one output line per recognized line.
    pub fn raw_text(&self) -> String {
        let mut out = String::new();
        let mut current_line = None;
        for word in &self.words {
            match current_line {
                Some(key) if key == word.line_key => out.push(' '),
                Some(_) => out.push('\n'),
                None => {}
            }
            out.push_str(&word.text);
            current_line = Some(word.line_key);
        }
        out
    }

    /// Mean confidence over words that have one, or 0 if none do.
    pub fn mean_confidence(&self) -> f64 {
        let (sum, count) = self
            .words
            .iter()
            .filter(|w| w.confidence >= 0.0)
            .fold((0.0, 0usize), |(sum, count), w| (sum + w.confidence, count + 1));
        if count == 0 { 0.0 } else { sum / count as f64 }
    }

    /// Text of the words whose confidence is strictly above `min_confidence`.
    pub fn text_above(&self, min_confidence: f64) -> String {
        self.words
            .iter()
            .filter(|w| w.confidence > min_confidence)
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Collapse runs of whitespace to single spaces and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Interface to an OCR engine.
pub trait OcrEngine: Send + Sync + 'static {
    /// Recognize text in a grayscale image.
    fn recognize(
        &self,
        image: &GrayImage,
        language: &str,
        mode: LayoutMode,
    ) -> Result<Recognition>;
}
