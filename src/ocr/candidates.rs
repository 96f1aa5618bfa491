//! Candidate generation and scoring.
//!
//! For each page we OCR a number of (image variant, rotation, layout mode)
//! combinations, score each result, and keep the best one. Cheap baseline
//! images are tried first, and if one of them is already good enough we never
//! build the expensive variants at all.

use std::{cmp::Ordering, fmt, sync::LazyLock};

use image::{GrayImage, RgbImage, imageops};
use regex::Regex;
use schemars::JsonSchema;

use super::engines::{LayoutMode, OcrEngine};
use crate::{
    imaging::{
        PreparedVariants, binarize::baseline_variants, marks::MaskOutcome,
        prepare_variants, to_gray,
    },
    policy::{ProcessingPolicy, ScoringPolicy},
    prelude::*,
};

/// A word counts as "lexical" if it has two letters in a row.
static LEXICAL_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-zÀ-ÿ]{2,}").expect("failed to compile regex"));

/// Which image a trial was run on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageVariant {
    /// Plain grayscale page.
    BaselineGray,
    /// Global Otsu threshold of the page.
    BaselineOtsu,
    /// Full binarization, marks left alone.
    Clean,
    /// Full binarization after mark suppression.
    Processed,
}

impl ImageVariant {
    /// Short label used in metadata.
    pub fn label(self) -> &'static str {
        match self {
            ImageVariant::BaselineGray => "baseline_gray",
            ImageVariant::BaselineOtsu => "baseline_otsu",
            ImageVariant::Clean => "clean",
            ImageVariant::Processed => "processed",
        }
    }

    /// The coarser family reported as `used_variant`.
    pub fn family(self) -> UsedVariant {
        match self {
            ImageVariant::BaselineGray | ImageVariant::BaselineOtsu => UsedVariant::Baseline,
            ImageVariant::Clean => UsedVariant::Clean,
            ImageVariant::Processed => UsedVariant::Processed,
        }
    }
}

/// Which family of images produced the winning text.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsedVariant {
    Baseline,
    Clean,
    Processed,
}

/// Counter-clockwise page rotations we try.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub enum Rotation {
    #[serde(rename = "rot0")]
    Rot0,
    #[serde(rename = "rot90")]
    Rot90,
    #[serde(rename = "rot180")]
    Rot180,
    #[serde(rename = "rot270")]
    Rot270,
}

impl Rotation {
    /// Rotations worth trying under a policy. Receipts are only ever scanned
    /// upright or sideways.
    pub fn for_policy(policy: &ProcessingPolicy) -> &'static [Rotation] {
        if policy.receipt_mode {
            &[Rotation::Rot0, Rotation::Rot90]
        } else {
            &[
                Rotation::Rot0,
                Rotation::Rot90,
                Rotation::Rot180,
                Rotation::Rot270,
            ]
        }
    }

    /// Rotate an image counter-clockwise, growing the canvas as needed.
    pub fn apply(self, image: &GrayImage) -> GrayImage {
        match self {
            Rotation::Rot0 => image.clone(),
            Rotation::Rot90 => imageops::rotate270(image),
            Rotation::Rot180 => imageops::rotate180(image),
            Rotation::Rot270 => imageops::rotate90(image),
        }
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Rotation::Rot0 => "rot0",
            Rotation::Rot90 => "rot90",
            Rotation::Rot180 => "rot180",
            Rotation::Rot270 => "rot270",
        };
        f.write_str(label)
    }
}

/// One scored OCR attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct Trial {
    /// Whitespace-normalized text.
    pub text: String,
    /// Text with the engine's line breaks.
    pub raw_text: String,
    /// Mean word confidence, `0..=100`.
    pub confidence: f64,
    /// Composite score, `0..=1`.
    pub score: f64,
    /// Length of `text` in characters.
    pub length: usize,
    pub variant: ImageVariant,
    pub rotation: Rotation,
    pub mode: LayoutMode,
}

impl Trial {
    /// Label combining variant and rotation, e.g. `clean_rot90`.
    pub fn label(&self) -> String {
        match self.variant.family() {
            UsedVariant::Baseline => self.variant.label().to_owned(),
            _ => format!("{}_{}", self.variant.label(), self.rotation),
        }
    }

    /// Compare by `(score, confidence, length)`.
    fn rank(&self, other: &Trial) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then(self.confidence.total_cmp(&other.confidence))
            .then(self.length.cmp(&other.length))
    }
}

/// Score recognized text.
///
/// The score mixes mean confidence, the share of words that look lexical,
/// and a saturating length bonus, weighted by `scoring`.
pub fn score_text(text: &str, words: &[&str], confidence: f64, scoring: &ScoringPolicy) -> f64 {
    let lexical = words.iter().filter(|w| LEXICAL_WORD.is_match(w)).count();
    let lexical_ratio = lexical as f64 / words.len().max(1) as f64;
    let ceiling = scoring.length_ceiling.max(1) as f64;
    let length_norm = (text.chars().count() as f64 / ceiling).min(1.0);
    (confidence / 100.0) * scoring.confidence_weight
        + lexical_ratio * scoring.lexical_weight
        + length_norm * scoring.length_weight
}

/// Pick the trial with the greatest `(score, confidence, length)`. Exact ties
/// go to the earliest trial.
pub fn select_best(trials: &[Trial]) -> Option<&Trial> {
    trials.iter().fold(None, |best, trial| match best {
        Some(best) if trial.rank(best) != Ordering::Greater => Some(best),
        _ => Some(trial),
    })
}

/// Source of the expensive image variants. Abstracted so tests can check
/// whether the full pipeline ran.
pub trait VariantPipeline: Send + Sync + 'static {
    /// Build the clean and processed variants for a page.
    fn prepare(&self, page: &RgbImage, policy: &ProcessingPolicy) -> Result<PreparedVariants>;
}

/// The real pipeline: deskew, binarize, suppress marks.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardVariants;

impl VariantPipeline for StandardVariants {
    fn prepare(&self, page: &RgbImage, policy: &ProcessingPolicy) -> Result<PreparedVariants> {
        Ok(prepare_variants(page, policy))
    }
}

/// The outcome of candidate selection for one page.
pub struct Selection {
    /// The winning trial.
    pub best: Trial,
    /// How many trials succeeded.
    pub trial_count: usize,
    /// Did a baseline trial let us skip the full pipeline?
    pub early_exit: bool,
    /// What mark suppression decided, if it ran.
    pub mask: MaskOutcome,
    /// Skew correction applied by the full pipeline.
    pub deskew_angle: Option<f64>,
    /// Unrotated image the winner came from, for targeted rescans.
    pub reference: GrayImage,
    /// The deskewed grayscale page, if the full pipeline ran.
    pub page_gray: Option<GrayImage>,
}

/// Generates, scores and selects trials for a page.
pub struct CandidateEngine<'a> {
    policy: &'a ProcessingPolicy,
    ocr: &'a dyn OcrEngine,
    variants: &'a dyn VariantPipeline,
}

impl<'a> CandidateEngine<'a> {
    pub fn new(
        policy: &'a ProcessingPolicy,
        ocr: &'a dyn OcrEngine,
        variants: &'a dyn VariantPipeline,
    ) -> Self {
        Self {
            policy,
            ocr,
            variants,
        }
    }

    /// OCR one image and add the scored result to `trials`. Engine failures
    /// drop the trial and are remembered in `last_error`.
    fn run_trial(
        &self,
        trials: &mut Vec<Trial>,
        last_error: &mut Option<anyhow::Error>,
        image: &GrayImage,
        variant: ImageVariant,
        rotation: Rotation,
        mode: LayoutMode,
    ) {
        match self.ocr.recognize(image, &self.policy.language, mode) {
            Ok(recognition) => {
                let text = recognition.text();
                let words = recognition
                    .words
                    .iter()
                    .map(|w| w.text.as_str())
                    .collect::<Vec<_>>();
                let confidence = recognition.mean_confidence();
                let score = score_text(&text, &words, confidence, &self.policy.scoring);
                trace!(variant = variant.label(), %rotation, %mode, score, confidence, "Trial");
                trials.push(Trial {
                    length: text.chars().count(),
                    raw_text: recognition.raw_text(),
                    text,
                    confidence,
                    score,
                    variant,
                    rotation,
                    mode,
                });
            }
            Err(err) => {
                debug!(variant = variant.label(), %rotation, %mode, "OCR trial failed: {err:#}");
                *last_error = Some(err);
            }
        }
    }

    /// Is a baseline trial good enough to skip the full pipeline?
    fn is_good_enough(&self, trial: &Trial) -> bool {
        let scoring = &self.policy.scoring;
        trial.score >= scoring.early_exit_min_score
            && trial.confidence >= scoring.early_exit_min_confidence
            && trial.length >= self.policy.min_acceptable_chars
    }

    /// Run both phases and select the best trial.
    #[instrument(level = "debug", skip_all)]
    pub fn select(&self, page: &RgbImage) -> Result<Selection> {
        let mut trials = vec![];
        let mut last_error = None;

        // Phase 0: cheap baselines.
        let (gray, otsu) = baseline_variants(&to_gray(page));
        for (variant, image) in [
            (ImageVariant::BaselineGray, &gray),
            (ImageVariant::BaselineOtsu, &otsu),
        ] {
            for &mode in &self.policy.baseline_modes {
                self.run_trial(&mut trials, &mut last_error, image, variant, Rotation::Rot0, mode);
            }
        }

        if let Some(best) = select_best(&trials)
            && self.is_good_enough(best)
        {
            debug!(score = best.score, confidence = best.confidence, "Baseline is good enough");
            return Ok(Selection {
                best: best.clone(),
                trial_count: trials.len(),
                early_exit: true,
                mask: MaskOutcome::None,
                deskew_angle: None,
                reference: otsu,
                page_gray: None,
            });
        }

        // Phase 1: the full pipeline.
        let prepared = self.variants.prepare(page, self.policy)?;
        let variants = [
            (ImageVariant::Clean, Some(&prepared.clean)),
            (ImageVariant::Processed, prepared.processed.as_ref()),
        ];
        for (variant, image) in variants {
            let Some(image) = image else {
                continue;
            };
            for &rotation in Rotation::for_policy(self.policy) {
                let rotated = rotation.apply(image);
                for &mode in self.policy.pipeline_modes() {
                    self.run_trial(&mut trials, &mut last_error, &rotated, variant, rotation, mode);
                }
            }
        }

        let Some(best) = select_best(&trials).cloned() else {
            let err = last_error.unwrap_or_else(|| anyhow!("no OCR modes configured"));
            return Err(err.context("every OCR attempt on this page failed"));
        };
        let reference = match (best.variant, prepared.processed) {
            (ImageVariant::Clean, _) | (_, None) => prepared.clean,
            (_, Some(processed)) => processed,
        };
        Ok(Selection {
            best,
            trial_count: trials.len(),
            early_exit: false,
            mask: prepared.mask,
            deskew_angle: prepared.deskew_angle,
            reference,
            page_gray: Some(prepared.gray),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
    };

    use image::{Luma, Rgb};

    use super::*;
    use crate::ocr::engines::{Recognition, RecognizedWord};

    /// Build a recognition where every word has the same confidence.
    pub(crate) fn recognition(text: &str, confidence: f64) -> Recognition {
        Recognition::from_words(text.split_whitespace().map(|w| RecognizedWord {
            text: w.to_owned(),
            confidence,
            line_key: (1, 1, 1, 1),
        }))
    }

    /// An engine that answers every call with a function of the image, and
    /// counts calls.
    pub(crate) struct ScriptedEngine<F> {
        pub respond: F,
        pub calls: AtomicUsize,
    }

    impl<F> ScriptedEngine<F>
    where
        F: Fn(&GrayImage, LayoutMode) -> Result<Recognition> + Send + Sync + 'static,
    {
        pub(crate) fn new(respond: F) -> Self {
            Self {
                respond,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(AtomicOrdering::SeqCst)
        }
    }

    impl<F> OcrEngine for ScriptedEngine<F>
    where
        F: Fn(&GrayImage, LayoutMode) -> Result<Recognition> + Send + Sync + 'static,
    {
        fn recognize(
            &self,
            image: &GrayImage,
            _language: &str,
            mode: LayoutMode,
        ) -> Result<Recognition> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            (self.respond)(image, mode)
        }
    }

    /// A variant pipeline that records calls and returns fixed images.
    #[derive(Default)]
    struct CountingVariants {
        calls: Mutex<usize>,
        with_processed: bool,
    }

    impl VariantPipeline for CountingVariants {
        fn prepare(&self, page: &RgbImage, _policy: &ProcessingPolicy) -> Result<PreparedVariants> {
            *self.calls.lock().unwrap() += 1;
            let gray = to_gray(page);
            Ok(PreparedVariants {
                clean: gray.clone(),
                processed: self
                    .with_processed
                    .then(|| GrayImage::from_pixel(gray.width(), gray.height(), Luma([7]))),
                mask: if self.with_processed {
                    MaskOutcome::Color
                } else {
                    MaskOutcome::None
                },
                gray,
                deskew_angle: None,
            })
        }
    }

    fn trial(score: f64, confidence: f64, length: usize) -> Trial {
        Trial {
            text: "x".repeat(length),
            raw_text: "x".repeat(length),
            confidence,
            score,
            length,
            variant: ImageVariant::Clean,
            rotation: Rotation::Rot0,
            mode: LayoutMode::SingleBlock,
        }
    }

    fn page() -> RgbImage {
        RgbImage::from_pixel(40, 60, Rgb([250, 250, 250]))
    }

    const LONG_TEXT: &str = "DOCUMENTO AUXILIAR DA NOTA FISCAL DE CONSUMIDOR ELETRONICA \
        EMITIDA EM AMBIENTE DE PRODUCAO";

    #[test]
    fn selection_prefers_score_then_confidence_then_length() {
        let trials = [trial(0.5, 70.0, 10), trial(0.5, 70.0, 12), trial(0.5, 60.0, 50)];
        assert_eq!(select_best(&trials).unwrap().length, 12);

        let trials = [trial(0.4, 99.0, 99), trial(0.6, 10.0, 1)];
        assert_eq!(select_best(&trials).unwrap().score, 0.6);
    }

    #[test]
    fn exact_ties_keep_the_first_trial() {
        let mut second = trial(0.5, 70.0, 10);
        second.rotation = Rotation::Rot90;
        let trials = [trial(0.5, 70.0, 10), second];
        assert_eq!(select_best(&trials).unwrap().rotation, Rotation::Rot0);
        assert!(select_best(&[]).is_none());
    }

    #[test]
    fn score_weights_confidence_words_and_length() {
        let scoring = ScoringPolicy::default();
        let score = score_text("AB 12", &["AB", "12"], 80.0, &scoring);
        let expected = 0.8 * 0.7 + 0.5 * 0.25 + (5.0 / 800.0) * 0.05;
        assert!((score - expected).abs() < 1e-12);
        assert_eq!(score_text("", &[], 0.0, &scoring), 0.0);
    }

    #[test]
    fn confident_baselines_skip_the_full_pipeline() {
        let policy = ProcessingPolicy::default();
        let engine = ScriptedEngine::new(|_, _| Ok(recognition(LONG_TEXT, 80.0)));
        let variants = CountingVariants::default();
        let selection = CandidateEngine::new(&policy, &engine, &variants)
            .select(&page())
            .unwrap();

        assert!(selection.early_exit);
        assert_eq!(*variants.calls.lock().unwrap(), 0);
        assert_eq!(engine.calls(), 4);
        assert_eq!(selection.best.variant, ImageVariant::BaselineGray);
        assert_eq!(selection.best.mode, LayoutMode::SingleBlock);
        assert!(selection.best.score >= 0.55);
    }

    #[test]
    fn weak_baselines_run_every_rotation_and_mode() {
        let policy = ProcessingPolicy::default();
        let engine = ScriptedEngine::new(|_, _| Ok(recognition("NOTA FISCAL", 40.0)));
        let variants = CountingVariants {
            with_processed: true,
            ..CountingVariants::default()
        };
        let selection = CandidateEngine::new(&policy, &engine, &variants)
            .select(&page())
            .unwrap();

        assert!(!selection.early_exit);
        assert_eq!(*variants.calls.lock().unwrap(), 1);
        // 2 baselines x 2 modes, then 2 variants x 4 rotations x 3 modes.
        assert_eq!(engine.calls(), 4 + 24);
        assert_eq!(selection.trial_count, 28);
        // Everything ties, so the first trial wins.
        assert_eq!(selection.best.variant, ImageVariant::BaselineGray);
        assert_eq!(selection.mask, MaskOutcome::Color);
    }

    #[test]
    fn receipts_try_two_rotations_and_skip_identical_variants() {
        let policy = crate::policy::Preset::Nfce.policy();
        // Only the clean variant reads well, and only sideways.
        let engine = ScriptedEngine::new(|image, _| {
            if image.width() > image.height() {
                Ok(recognition("CUPOM FISCAL ELETRONICO", 90.0))
            } else {
                Ok(recognition("x", 10.0))
            }
        });
        let variants = CountingVariants::default();
        let selection = CandidateEngine::new(&policy, &engine, &variants)
            .select(&page())
            .unwrap();

        assert_eq!(engine.calls(), 4 + 2 * 3);
        assert_eq!(selection.best.variant, ImageVariant::Clean);
        assert_eq!(selection.best.rotation, Rotation::Rot90);
        assert_eq!(selection.best.label(), "clean_rot90");
        assert_eq!(selection.best.mode, LayoutMode::SparseText);
    }

    #[test]
    fn failed_trials_are_dropped() {
        let policy = ProcessingPolicy::default();
        let engine = ScriptedEngine::new(|_, mode| {
            if mode == LayoutMode::SingleColumn {
                Ok(recognition("RECIBO", 50.0))
            } else {
                Err(anyhow!("engine crashed"))
            }
        });
        let variants = CountingVariants::default();
        let selection = CandidateEngine::new(&policy, &engine, &variants)
            .select(&page())
            .unwrap();
        assert_eq!(selection.best.mode, LayoutMode::SingleColumn);
        assert_eq!(selection.best.text, "RECIBO");
    }

    #[test]
    fn pages_fail_when_every_trial_fails() {
        let policy = ProcessingPolicy::default();
        let engine = ScriptedEngine::new(|_, _| Err(anyhow!("engine crashed")));
        let variants = CountingVariants::default();
        let result = CandidateEngine::new(&policy, &engine, &variants).select(&page());
        let err = result.err().unwrap();
        assert!(format!("{err:#}").contains("engine crashed"));
    }

    #[test]
    fn rotations_turn_counter_clockwise() {
        let mut image = GrayImage::new(3, 2);
        image.put_pixel(2, 0, Luma([255]));
        // Top-right corner ends up top-left after a quarter turn left.
        let rotated = Rotation::Rot90.apply(&image);
        assert_eq!(rotated.dimensions(), (2, 3));
        assert_eq!(rotated.get_pixel(0, 0)[0], 255);
    }
}
