//! Client-name recovery for receipts ("micro-scan").
//!
//! Handwritten signatures on thermal receipts tend to land right on top of
//! the client name. When the page text has no usable name, we OCR a few
//! narrow horizontal strips with aggressive preprocessing and try to rebuild
//! a name from whatever fragments survive. The results are hints recorded
//! next to the page text. They never replace it.

use std::{collections::HashSet, fmt, sync::LazyLock};

use image::{GrayImage, imageops};
use imageproc::{
    distance_transform::Norm,
    morphology::{close, dilate, erode},
};
use regex::Regex;
use schemars::JsonSchema;

use super::engines::{LayoutMode, OcrEngine, Recognition};
use crate::{
    imaging::{AdaptiveMethod, adaptive_threshold, add_weighted, blur, clahe, invert_if_dark},
    policy::ProcessingPolicy,
    prelude::*,
};

/// Field labels that introduce the client name.
static NAME_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(CLIENTE|CONSUMIDOR|DESTINAT[ÁA]RIO?)").expect("failed to compile regex")
});

/// A marker followed by at least three capitalized words.
static COMPLETE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(CLIENTE|CONSUMIDOR|DESTINAT[ÁA]RIO?)\s*[:\-]?\s*([A-ZÀ-Ÿ][A-ZÀ-Ÿ]+(?:\s+[A-ZÀ-Ÿ][A-ZÀ-Ÿ]+){2,})",
    )
    .expect("failed to compile regex")
});

/// Everything after a marker.
static AFTER_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(CLIENTE|CONSUMIDOR|DESTINAT[ÁA]RIO?)\s*[:\-]?\s*(.+)")
        .expect("failed to compile regex")
});

/// Name patterns, most specific first.
static NAME_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)(?:CLIENTE|CONSUMIDOR|DESTINAT[ÁA]RIO?)\s*[:\-]?\s*([A-ZÀ-Ÿ][A-ZÀ-Ÿ\s]+?)(?:\s+CPF|\s+RG|$)",
        r"(?i)(?:^|\s)([A-ZÀ-Ÿ][A-ZÀ-Ÿ]+(?:\s+[A-ZÀ-Ÿ][A-ZÀ-Ÿ]+){1,4})(?:\s+CPF|\s+RG|\s+ENDEREÇO)",
        r"(?i)([A-ZÀ-Ÿ][A-ZÀ-Ÿ]+\s+[A-ZÀ-Ÿ][A-ZÀ-Ÿ]+(?:\s+[A-ZÀ-Ÿ][A-ZÀ-Ÿ]+)?)",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("failed to compile regex"))
    .collect()
});

/// Symbols OCR tends to sprinkle through damaged names.
static OCR_SYMBOLS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[!@#$%^&*()_+=\[\]{}|;:,.<>?/~`]").expect("failed to compile regex")
});

/// Runs of two or more name letters.
static LETTER_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[A-ZÀ-Ÿ]{2,}").expect("failed to compile regex"));

/// A single name letter.
static NAME_LETTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[A-ZÀ-Ÿ]").expect("failed to compile regex"));

/// Alphabetic tokens, including accented letters.
static ALPHA_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-zÀ-ÿ]{2,}").expect("failed to compile regex"));

/// Words that follow a name but are never part of one.
const SKIP_WORDS: &[&str] = &[
    "ENDERECO", "ENDEREÇO", "CPF", "RG", "TELEFONE", "FONE", "CEP", "CIDADE",
];

/// Receipt field labels and noise that must not be mistaken for name parts.
const FRAGMENT_BLACKLIST: &[&str] = &[
    "CPF", "RG", "ENDERECO", "ENDEREÇO", "FONE", "TELEFONE", "CEP", "CIDADE", "DATA", "VALOR",
    "TOTAL", "NOTA", "EMITENTE", "DOCUMENTO", "NR", "Nº", "N°", "NUMERO", "NÚMERO", "ITEM",
    "QTDE", "CUPOM", "FISCAL", "TRIBUTO", "CODIGO", "CÓDIGO", "UF",
];

/// Strip centers, as fractions of the page height.
const STRIP_CENTERS: [f64; 3] = [0.32, 0.45, 0.58];

/// Strip height as a fraction of the page height.
const STRIP_HEIGHT_RATIO: f64 = 0.10;

/// Minimum strip height in pixels.
const MIN_STRIP_HEIGHT: u32 = 80;

/// Vertical band scanned by the name-region pass.
const NAME_REGION: (f64, f64) = (0.40, 0.70);

/// How a name candidate was found.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateSource {
    /// Read directly after a client marker.
    Direct,
    /// Rebuilt from a window of fragments.
    Reconstructed,
    /// Everything after the marker, lightly cleaned.
    Fallback,
    /// Rebuilt from fragments on a strip with no marker.
    FragmentsOnly,
    /// Found by the name-region pass.
    Enhanced,
}

/// Preprocessing applied to a strip before OCR.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub enum Technique {
    #[serde(rename = "clahe_enhanced")]
    ClaheEnhanced,
    #[serde(rename = "adaptive_1")]
    Adaptive1,
    #[serde(rename = "adaptive_2")]
    Adaptive2,
    #[serde(rename = "morph_connect")]
    MorphConnect,
    #[serde(rename = "unsharp")]
    Unsharp,
    #[serde(rename = "denoise")]
    Denoise,
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Technique::ClaheEnhanced => "clahe_enhanced",
            Technique::Adaptive1 => "adaptive_1",
            Technique::Adaptive2 => "adaptive_2",
            Technique::MorphConnect => "morph_connect",
            Technique::Unsharp => "unsharp",
            Technique::Denoise => "denoise",
        };
        f.write_str(label)
    }
}

/// A possible client name, with where it came from.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct NameCandidate {
    /// The name as recovered.
    pub value: String,
    /// How it was found.
    pub source: CandidateSource,
    /// Preprocessing that produced the OCR text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technique: Option<Technique>,
    /// Heuristic name quality, `0..=1`.
    pub quality: f64,
    /// OCR confidence of the text it came from, `0..=100`.
    pub confidence: f64,
}

impl NameCandidate {
    fn new(
        value: String,
        source: CandidateSource,
        technique: Technique,
        confidence: f64,
    ) -> Self {
        Self {
            quality: name_quality(&value),
            value,
            source,
            technique: Some(technique),
            confidence,
        }
    }
}

/// Does the text already contain a complete client name (a marker followed
/// by at least three words, none of them suspiciously short)?
pub fn has_client_name(text: &str) -> bool {
    let Some(caps) = COMPLETE_NAME.captures(text) else {
        return false;
    };
    let words = caps[2].split_whitespace().collect::<Vec<_>>();
    words.len() >= 3
        && !words
            .iter()
            .any(|w| w.chars().count() <= 2 || w.contains('!'))
}

/// Extract a name from free text, trying the most specific pattern first.
pub fn extract_name(text: &str) -> Option<String> {
    NAME_PATTERNS.iter().find_map(|pattern| {
        let caps = pattern.captures(text)?;
        let words = caps[1]
            .split_whitespace()
            .filter(|w| {
                !SKIP_WORDS.contains(&w.to_uppercase().as_str()) && w.chars().count() >= 2
            })
            .collect::<Vec<_>>();
        if words.len() < 2 {
            return None;
        }
        let name = words.join(" ");
        is_valid_name(&name).then_some(name)
    })
}

/// Upper-cased alphabetic tokens that could be parts of a name, in reading
/// order, with consecutive repeats collapsed.
pub fn name_fragments(text: &str) -> Vec<String> {
    let mut fragments: Vec<String> = vec![];
    for token in ALPHA_TOKEN.find_iter(text) {
        let upper = token.as_str().to_uppercase();
        if FRAGMENT_BLACKLIST.contains(&upper.as_str()) {
            continue;
        }
        let len = upper.chars().count();
        if !(3..=20).contains(&len) {
            continue;
        }
        let letters = upper.chars().filter(|c| c.is_alphabetic()).count();
        if (letters as f64) / (len as f64) < 0.7 {
            continue;
        }
        if fragments.last() != Some(&upper) {
            fragments.push(upper);
        }
    }
    fragments
}

/// Score a window of fragments as a plausible full name.
fn window_score(window: &[&str]) -> f64 {
    if !(2..=5).contains(&window.len()) {
        return 0.0;
    }
    let joined_len = window.iter().map(|w| w.chars().count()).sum::<usize>() + window.len() - 1;
    if !(8..=60).contains(&joined_len) {
        return 0.0;
    }
    let lengths = window.iter().map(|w| w.chars().count());
    let longest = lengths.clone().max().unwrap_or(0);
    let shortest = lengths.clone().min().unwrap_or(0);
    let short_tokens = lengths.filter(|&len| len <= 2).count();

    let mut score = if window.len() <= 4 { 0.5 } else { 0.35 };
    if longest - shortest >= 2 {
        score += 0.15;
    }
    score -= short_tokens as f64 * 0.2;
    score.clamp(0.0, 1.0)
}

/// Find the best run of 2 to 5 consecutive fragments that looks like a name.
/// Returns it title-cased, or `None` if nothing scores at least `threshold`.
pub fn reconstruct_name(fragments: &[String], threshold: f64) -> Option<String> {
    let tokens = fragments
        .iter()
        .map(String::as_str)
        .filter(|t| !FRAGMENT_BLACKLIST.contains(&t.to_uppercase().as_str()))
        .collect::<Vec<_>>();

    let mut best: Option<(&[&str], f64)> = None;
    for start in 0..tokens.len() {
        for end in (start + 2)..=(start + 5).min(tokens.len()) {
            let window = &tokens[start..end];
            let score = window_score(window);
            if score > best.map_or(0.0, |(_, s)| s) {
                best = Some((window, score));
            }
        }
    }

    let (window, score) = best?;
    if score < threshold {
        return None;
    }
    let name = title_case(&window.join(" "));
    is_valid_name(&name).then_some(name)
}

/// Capitalize the first letter of each run of letters and lower-case the
/// rest.
pub fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_word = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}

fn letter_ratio(text: &str) -> f64 {
    let len = text.chars().count();
    if len == 0 {
        return 0.0;
    }
    NAME_LETTER.find_iter(text).count() as f64 / len as f64
}

/// Does this look like a person's name? At least two words of two letters
/// each, and mostly letters overall.
pub fn is_valid_name(candidate: &str) -> bool {
    if candidate.chars().count() < 4 {
        return false;
    }
    let words = candidate.split_whitespace().collect::<Vec<_>>();
    words.len() >= 2
        && words
            .iter()
            .all(|w| NAME_LETTER.find_iter(w).count() >= 2)
        && letter_ratio(candidate) >= 0.7
}

/// Heuristic name quality in `0..=1`.
pub fn name_quality(name: &str) -> f64 {
    if name.is_empty() {
        return 0.0;
    }
    let mut score = match name.split_whitespace().count() {
        2..=4 => 0.3,
        1 => 0.1,
        _ => 0.0,
    };
    if (10..=40).contains(&name.chars().count()) {
        score += 0.3;
    }
    score += letter_ratio(name) * 0.4;
    score.min(1.0)
}

/// Every preprocessing technique applied to a strip.
pub fn techniques(roi: &GrayImage) -> Vec<(Technique, GrayImage)> {
    let threshold = |image: &GrayImage, block, c| {
        let mut out = adaptive_threshold(image, AdaptiveMethod::Gaussian, block, c, false);
        invert_if_dark(&mut out);
        out
    };

    let enhanced = threshold(&clahe(roi, 4.0, 8), 15, 6.0);
    let adaptive_1 = threshold(roi, 11, 4.0);
    let adaptive_2 = threshold(roi, 21, 8.0);
    let connected = close(&adaptive_1, Norm::L1, 1);
    let unsharp = threshold(&add_weighted(roi, 2.0, &blur(roi, 1.5), -1.0), 15, 6.0);
    let denoised = dilate(&erode(&adaptive_1, Norm::L1, 1), Norm::L1, 2);

    vec![
        (Technique::ClaheEnhanced, enhanced),
        (Technique::Adaptive1, adaptive_1),
        (Technique::Adaptive2, adaptive_2),
        (Technique::MorphConnect, connected),
        (Technique::Unsharp, unsharp),
        (Technique::Denoise, denoised),
    ]
}

/// Sort candidates best first by `(quality, confidence)` and drop repeated
/// values.
pub fn finalize_candidates(mut candidates: Vec<NameCandidate>) -> Vec<NameCandidate> {
    candidates.sort_by(|a, b| {
        b.quality
            .total_cmp(&a.quality)
            .then(b.confidence.total_cmp(&a.confidence))
    });
    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.value.clone()));
    candidates
}

/// Targeted OCR passes looking for a client name.
pub struct NameScanner<'a> {
    policy: &'a ProcessingPolicy,
    ocr: &'a dyn OcrEngine,
}

impl<'a> NameScanner<'a> {
    pub fn new(policy: &'a ProcessingPolicy, ocr: &'a dyn OcrEngine) -> Self {
        Self { policy, ocr }
    }

    /// OCR one preprocessed strip. Failures are logged and treated as no
    /// text.
    fn recognize(&self, image: &GrayImage, mode: LayoutMode) -> Option<Recognition> {
        match self.ocr.recognize(image, &self.policy.language, mode) {
            Ok(recognition) => Some(recognition),
            Err(err) => {
                debug!(%mode, "Name scan OCR failed: {err:#}");
                None
            }
        }
    }

    /// Scan three horizontal strips of `reference` for name candidates.
    #[instrument(level = "debug", skip_all)]
    pub fn micro_scan(&self, reference: &GrayImage) -> Vec<NameCandidate> {
        let names = &self.policy.names;
        let (width, height) = reference.dimensions();
        let strip_height = ((f64::from(height) * STRIP_HEIGHT_RATIO) as u32).max(MIN_STRIP_HEIGHT);

        let mut candidates = vec![];
        for center in STRIP_CENTERS {
            let center = (f64::from(height) * center) as u32;
            let top = center.saturating_sub(strip_height / 2);
            let bottom = (top + strip_height).min(height);
            if bottom <= top {
                continue;
            }
            let roi = imageops::crop_imm(reference, 0, top, width, bottom - top).to_image();

            for (technique, image) in techniques(&roi) {
                for &mode in &self.policy.micro_scan_modes {
                    let Some(recognition) = self.recognize(&image, mode) else {
                        continue;
                    };
                    let text = recognition.text();
                    if text.is_empty() {
                        continue;
                    }
                    let confidence = recognition.mean_confidence();

                    if NAME_MARKER.is_match(&text) && confidence >= names.marker_min_confidence {
                        if let Some(name) = extract_name(&text) {
                            candidates.push(NameCandidate::new(
                                name,
                                CandidateSource::Direct,
                                technique,
                                confidence,
                            ));
                        }
                        if let Some(name) = reconstruct_name(
                            &name_fragments(&text),
                            names.reconstruction_threshold,
                        ) {
                            candidates.push(NameCandidate::new(
                                name,
                                CandidateSource::Reconstructed,
                                technique,
                                confidence,
                            ));
                        }
                        if let Some(name) = after_marker(&text) {
                            candidates.push(NameCandidate::new(
                                name,
                                CandidateSource::Fallback,
                                technique,
                                confidence,
                            ));
                        }
                    } else if confidence >= names.fragments_min_confidence {
                        let fragments = name_fragments(&text);
                        if fragments.len() >= 2
                            && let Some(name) =
                                reconstruct_name(&fragments, names.reconstruction_threshold)
                        {
                            candidates.push(NameCandidate::new(
                                name,
                                CandidateSource::FragmentsOnly,
                                technique,
                                confidence * names.fragments_only_penalty,
                            ));
                        }
                    }
                }
            }
        }
        debug!(count = candidates.len(), "Micro-scan finished");
        candidates
    }

    /// Scan the middle band of the page, where the client block usually
    /// sits, keeping only reasonably confident words.
    #[instrument(level = "debug", skip_all)]
    pub fn scan_name_region(&self, page: &GrayImage) -> Vec<NameCandidate> {
        let names = &self.policy.names;
        let (width, height) = page.dimensions();
        let top = (f64::from(height) * NAME_REGION.0) as u32;
        let bottom = (f64::from(height) * NAME_REGION.1) as u32;
        if bottom <= top || width == 0 {
            return vec![];
        }
        let roi = imageops::crop_imm(page, 0, top, width, bottom - top).to_image();

        let mut candidates = vec![];
        for (technique, image) in techniques(&roi) {
            for &mode in &self.policy.name_region_modes {
                let Some(recognition) = self.recognize(&image, mode) else {
                    continue;
                };
                let text = recognition.text_above(names.region_word_min_confidence);
                if text.is_empty() {
                    continue;
                }
                let confidence = recognition.mean_confidence();
                if let Some(name) = extract_name(&text) {
                    candidates.push(NameCandidate::new(
                        name,
                        CandidateSource::Enhanced,
                        technique,
                        confidence,
                    ));
                }
                if let Some(name) =
                    reconstruct_name(&name_fragments(&text), names.reconstruction_threshold)
                {
                    candidates.push(NameCandidate::new(
                        name,
                        CandidateSource::Reconstructed,
                        technique,
                        confidence,
                    ));
                }
            }
        }
        candidates
    }
}

/// The text after a client marker, with OCR symbols removed, if it holds at
/// least two letter runs.
fn after_marker(text: &str) -> Option<String> {
    let caps = AFTER_MARKER.captures(text)?;
    let cleaned = OCR_SYMBOLS.replace_all(caps[2].trim(), " ");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    (LETTER_RUN.find_iter(&cleaned).count() >= 2).then_some(cleaned)
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;
    use crate::ocr::candidates::tests::{ScriptedEngine, recognition};

    fn strings(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn reconstruction_skips_labels_and_title_cases() {
        let name = reconstruct_name(&strings(&["JOAO", "DA", "SILVA", "CPF"]), 0.45);
        assert_eq!(name.as_deref(), Some("Joao Da Silva"));
        assert!((window_score(&["JOAO", "DA", "SILVA"]) - 0.45).abs() < 1e-12);
    }

    #[test]
    fn reconstruction_needs_two_tokens() {
        assert_eq!(reconstruct_name(&strings(&["AB"]), 0.45), None);
        assert_eq!(reconstruct_name(&[], 0.45), None);
    }

    #[test]
    fn reconstruction_prefers_the_first_best_window() {
        let name = reconstruct_name(&strings(&["MARIA", "APARECIDA", "SOUZA", "LIMA"]), 0.45);
        assert_eq!(name.as_deref(), Some("Maria Aparecida"));
    }

    #[test]
    fn complete_names_need_three_solid_words() {
        assert!(has_client_name("CONSUMIDOR: MARIA APARECIDA SOUZA"));
        assert!(has_client_name("cliente - Pedro Alves Cabral"));
        assert!(!has_client_name("CLIENTE: JOAO DA SILVA"));
        assert!(!has_client_name("CLIENTE: JOAO SILVA"));
        assert!(!has_client_name("CUPOM FISCAL ELETRONICO"));
    }

    #[test]
    fn names_are_extracted_after_markers() {
        assert_eq!(
            extract_name("CLIENTE: MARIA SOUZA CPF 123").as_deref(),
            Some("MARIA SOUZA")
        );
        assert_eq!(
            extract_name("CONSUMIDOR JOAO DA SILVA").as_deref(),
            Some("JOAO DA SILVA")
        );
        assert_eq!(extract_name("123 456"), None);
    }

    #[test]
    fn fragments_drop_noise_and_repeats() {
        let fragments = name_fragments("CLIENTE: JOAO JOAO da SILVA CPF 123.456 Nº TOTAL xy");
        assert_eq!(fragments, strings(&["CLIENTE", "JOAO", "SILVA"]));
    }

    #[test]
    fn validity_and_quality() {
        assert!(is_valid_name("Joao Da Silva"));
        assert!(!is_valid_name("Joao"));
        assert!(!is_valid_name("Jo 12345 A"));
        assert!(!is_valid_name("R2 D2"));

        let quality = name_quality("Joao Da Silva");
        let expected = 0.3 + 0.3 + (11.0 / 13.0) * 0.4;
        assert!((quality - expected).abs() < 1e-12);
        assert_eq!(name_quality(""), 0.0);
    }

    #[test]
    fn title_case_handles_accents() {
        assert_eq!(title_case("JOSÉ ÁLVARES"), "José Álvares");
    }

    #[test]
    fn fallback_strips_symbols() {
        assert_eq!(
            after_marker("CLIENTE: JO!AO; SIL|VA").as_deref(),
            Some("JO AO SIL VA")
        );
        assert_eq!(after_marker("CLIENTE: 12"), None);
    }

    #[test]
    fn candidates_are_sorted_and_deduplicated() {
        let make = |value: &str, quality, confidence| NameCandidate {
            value: value.to_owned(),
            source: CandidateSource::Direct,
            technique: None,
            quality,
            confidence,
        };
        let finalized = finalize_candidates(vec![
            make("A B", 0.5, 90.0),
            make("C D", 0.9, 40.0),
            make("A B", 0.5, 95.0),
            make("E F", 0.9, 60.0),
        ]);
        let values = finalized.iter().map(|c| (c.value.as_str(), c.confidence)).collect::<Vec<_>>();
        assert_eq!(values, vec![("E F", 60.0), ("C D", 40.0), ("A B", 95.0)]);
    }

    #[test]
    fn micro_scan_reads_names_from_strips() {
        let policy = crate::policy::Preset::Nfce.policy();
        let engine = ScriptedEngine::new(|_, _| Ok(recognition("CLIENTE: JOAO DA SILVA", 70.0)));
        let reference = GrayImage::from_pixel(300, 400, Luma([255]));
        let candidates = NameScanner::new(&policy, &engine).micro_scan(&reference);

        // 3 strips x 6 techniques x 3 modes.
        assert_eq!(engine.calls(), 54);
        let finalized = finalize_candidates(candidates);
        let sources = finalized.iter().map(|c| (c.value.as_str(), c.source)).collect::<Vec<_>>();
        assert!(sources.contains(&("JOAO DA SILVA", CandidateSource::Direct)));
        assert!(sources.contains(&("Cliente Joao", CandidateSource::Reconstructed)));
        assert_eq!(finalized.len(), 2);
    }

    #[test]
    fn micro_scan_penalizes_unmarked_fragments() {
        let policy = crate::policy::Preset::Nfce.policy();
        let engine = ScriptedEngine::new(|_, _| Ok(recognition("MARIA APARECIDA", 50.0)));
        let reference = GrayImage::from_pixel(300, 400, Luma([255]));
        let candidates = NameScanner::new(&policy, &engine).micro_scan(&reference);
        assert!(!candidates.is_empty());
        assert!(candidates.iter().all(|c| c.source == CandidateSource::FragmentsOnly));
        assert!(candidates.iter().all(|c| (c.confidence - 40.0).abs() < 1e-9));
    }

    #[test]
    fn weak_strips_yield_nothing() {
        let policy = crate::policy::Preset::Nfce.policy();
        let engine = ScriptedEngine::new(|_, _| Ok(recognition("MARIA APARECIDA", 20.0)));
        let reference = GrayImage::from_pixel(300, 400, Luma([255]));
        assert!(NameScanner::new(&policy, &engine).micro_scan(&reference).is_empty());
    }

    #[test]
    fn name_region_keeps_confident_words() {
        let policy = crate::policy::Preset::Nfce.policy();
        let engine = ScriptedEngine::new(|_, _| {
            Ok(Recognition::from_words(
                [("PEDRO", 80.0), ("##", 10.0), ("CABRAL", 80.0)].map(|(text, confidence)| {
                    crate::ocr::engines::RecognizedWord {
                        text: text.to_owned(),
                        confidence,
                        line_key: (1, 1, 1, 1),
                    }
                }),
            ))
        });
        let page = GrayImage::from_pixel(300, 400, Luma([255]));
        let candidates = NameScanner::new(&policy, &engine).scan_name_region(&page);
        assert_eq!(engine.calls(), 18);
        assert!(candidates.iter().any(|c| c.value == "PEDRO CABRAL"
            && c.source == CandidateSource::Enhanced
            && c.technique.is_some()));
    }
}
