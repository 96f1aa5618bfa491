//! Processing policies and the named presets that produce them.
//!
//! A [`ProcessingPolicy`] is built once per extraction run and then shared
//! read-only between pages. Presets are pure data: resolving a name never has
//! side effects, and unknown names fall back to [`Preset::Default`].

use schemars::JsonSchema;

use crate::{ocr::engines::LayoutMode, prelude::*};

/// The kind of ink a [`ColorRange`] is meant to catch.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InkColor {
    /// Ballpoint blue. The only range restricted to the page bottom in receipt
    /// mode.
    Blue,
    /// Black or dark gray ink.
    Dark,
    /// Green ink or stamps.
    Green,
    /// Red ink or stamps.
    Red,
}

/// An inclusive HSV interval, using 8-bit OpenCV conventions: hue in `0..=180`,
/// saturation and value in `0..=255`.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ColorRange {
    /// What this range is meant to detect.
    pub ink: InkColor,
    /// Lower `[h, s, v]` bound.
    pub lower: [u8; 3],
    /// Upper `[h, s, v]` bound.
    pub upper: [u8; 3],
}

impl ColorRange {
    /// Create a new range.
    pub const fn new(ink: InkColor, lower: [u8; 3], upper: [u8; 3]) -> Self {
        Self { ink, lower, upper }
    }

    /// Does this range contain an HSV pixel?
    pub fn contains(&self, hsv: [u8; 3]) -> bool {
        (0..3).all(|i| self.lower[i] <= hsv[i] && hsv[i] <= self.upper[i])
    }
}

/// Default ink ranges: blue, dark, green and red.
const DEFAULT_COLOR_RANGES: [ColorRange; 4] = [
    ColorRange::new(InkColor::Blue, [90, 80, 40], [150, 255, 255]),
    ColorRange::new(InkColor::Dark, [0, 0, 0], [180, 255, 50]),
    ColorRange::new(InkColor::Green, [35, 40, 40], [85, 255, 255]),
    ColorRange::new(InkColor::Red, [0, 120, 70], [10, 255, 255]),
];

/// Weights and thresholds used to rank OCR trials.
///
/// These started life as hand-tuned constants. They are exposed so they can
/// be recalibrated against a labelled corpus.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringPolicy {
    /// Weight of the normalized mean word confidence.
    pub confidence_weight: f64,
    /// Weight of the share of words containing two consecutive letters.
    pub lexical_weight: f64,
    /// Weight of the normalized text length.
    pub length_weight: f64,
    /// Character count at which the length component saturates.
    pub length_ceiling: usize,
    /// Minimum composite score for the baseline early exit.
    pub early_exit_min_score: f64,
    /// Minimum mean confidence (0-100) for the baseline early exit.
    pub early_exit_min_confidence: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            confidence_weight: 0.70,
            lexical_weight: 0.25,
            length_weight: 0.05,
            length_ceiling: 800,
            early_exit_min_score: 0.55,
            early_exit_min_confidence: 60.0,
        }
    }
}

/// Thresholds for the receipt name micro-scan.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NameScanPolicy {
    /// Minimum sliding-window score for a reconstructed name.
    pub reconstruction_threshold: f64,
    /// Minimum OCR confidence for a strip containing a client marker.
    pub marker_min_confidence: f64,
    /// Minimum OCR confidence for a strip without a marker.
    pub fragments_min_confidence: f64,
    /// Confidence multiplier for candidates found without a marker.
    pub fragments_only_penalty: f64,
    /// Minimum per-word confidence kept by the name-region pass.
    pub region_word_min_confidence: f64,
}

impl Default for NameScanPolicy {
    fn default() -> Self {
        Self {
            reconstruction_threshold: 0.45,
            marker_min_confidence: 35.0,
            fragments_min_confidence: 30.0,
            fragments_only_penalty: 0.8,
            region_word_min_confidence: 25.0,
        }
    }
}

/// Every knob used while turning a page raster into text.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingPolicy {
    /// Rasterization resolution.
    pub dpi: u32,
    /// OCR language, in tesseract syntax (`por`, `por+eng`).
    pub language: String,

    /// Layout modes tried on the cheap baseline images.
    pub baseline_modes: Vec<LayoutMode>,
    /// Layout modes tried by the full pipeline on general documents.
    pub general_modes: Vec<LayoutMode>,
    /// Layout modes tried by the full pipeline in receipt mode.
    pub receipt_modes: Vec<LayoutMode>,
    /// Layout modes tried on each micro-scan strip.
    pub micro_scan_modes: Vec<LayoutMode>,
    /// Layout modes tried by the name-region pass.
    pub name_region_modes: Vec<LayoutMode>,

    /// A baseline result shorter than this never exits early.
    pub min_acceptable_chars: usize,

    /// Straighten slightly rotated pages.
    pub enable_deskew: bool,
    /// Largest skew angle considered, in degrees.
    pub deskew_max_angle_deg: f64,
    /// Skew angles below this are treated as noise.
    pub deskew_min_angle_deg: f64,

    /// Detect marks by ink color.
    pub enable_color_removal: bool,
    /// Use every configured ink range instead of just the blue ones.
    pub enable_multi_color_removal: bool,
    /// Ink ranges to detect.
    pub color_ranges: Vec<ColorRange>,
    /// Color masks covering less than this share of the page are ignored.
    pub color_mask_min_area_ratio: f64,

    /// Detect marks by stroke shape when no color mask qualifies.
    pub enable_contour_removal: bool,
    /// Smallest contour considered, as a share of the page area.
    pub contour_min_area_ratio: f64,
    /// Largest contour considered, as a share of the page area.
    pub contour_max_area_ratio: f64,
    /// Contours less solid than this look like pen strokes.
    pub contour_max_solidity: f64,
    /// Contours at least this elongated look like pen strokes...
    pub contour_min_aspect: f64,
    /// ...when their major axis is at least this long.
    pub contour_min_length_px: u32,

    /// Side of the square closing kernel applied to masks.
    pub morph_closing_kernel_size: u32,
    /// Neighbourhood radius used when filling masked pixels.
    pub inpainting_radius: u32,
    /// Masks covering more than this share of a general page are rejected.
    pub max_mask_coverage: f64,
    /// Masks covering more than this share of a receipt are rejected.
    pub receipt_max_mask_coverage: f64,

    /// Use the thermal-receipt pipeline.
    pub receipt_mode: bool,
    /// Scale factor applied when printed text is too small.
    pub upscale_factor: f64,
    /// Adaptive threshold window for receipts.
    pub receipt_block_size: u32,
    /// Adaptive threshold offset for receipts.
    pub receipt_c: i32,
    /// In receipt mode, blue ink is only searched for in this bottom share of
    /// the page.
    pub limit_blue_mask_to_bottom_ratio: f64,

    /// Trial ranking.
    pub scoring: ScoringPolicy,
    /// Receipt name recovery.
    pub names: NameScanPolicy,
}

impl Default for ProcessingPolicy {
    fn default() -> Self {
        use LayoutMode::*;
        Self {
            dpi: 300,
            language: "por".to_owned(),
            baseline_modes: vec![SingleBlock, SingleColumn],
            general_modes: vec![SingleBlock, SingleColumn, SparseText],
            receipt_modes: vec![SparseText, SingleLine, SingleBlock],
            micro_scan_modes: vec![SingleLine, RawLine, SingleBlock],
            name_region_modes: vec![SingleBlock, SingleLine, SingleWord],
            min_acceptable_chars: 25,
            enable_deskew: true,
            deskew_max_angle_deg: 5.0,
            deskew_min_angle_deg: 0.2,
            enable_color_removal: true,
            enable_multi_color_removal: true,
            color_ranges: DEFAULT_COLOR_RANGES.to_vec(),
            color_mask_min_area_ratio: 0.001,
            enable_contour_removal: true,
            contour_min_area_ratio: 8e-6,
            contour_max_area_ratio: 0.02,
            contour_max_solidity: 0.55,
            contour_min_aspect: 1.6,
            contour_min_length_px: 25,
            morph_closing_kernel_size: 5,
            inpainting_radius: 4,
            max_mask_coverage: 0.15,
            receipt_max_mask_coverage: 0.10,
            receipt_mode: false,
            upscale_factor: 1.7,
            receipt_block_size: 25,
            receipt_c: 7,
            limit_blue_mask_to_bottom_ratio: 0.50,
            scoring: ScoringPolicy::default(),
            names: NameScanPolicy::default(),
        }
    }
}

impl ProcessingPolicy {
    /// Resolve a free-form preset name. Unknown names get the default policy.
    pub fn for_preset(name: &str) -> Self {
        match Preset::from_name(name) {
            Some(preset) => preset.policy(),
            None => {
                warn!(preset = name, "Unknown preset, using default policy");
                Preset::Default.policy()
            }
        }
    }

    /// Merge a partial JSON object on top of this policy.
    pub fn with_overrides(self, overrides: Value) -> Result<Self> {
        let mut merged =
            serde_json::to_value(&self).context("cannot serialize policy")?;
        merge_json(&mut merged, overrides);
        serde_json::from_value(merged).context("invalid policy override")
    }

    /// Maximum share of the page a suppression mask may cover.
    pub fn mask_coverage_ceiling(&self) -> f64 {
        if self.receipt_mode {
            self.receipt_max_mask_coverage
        } else {
            self.max_mask_coverage
        }
    }

    /// Layout modes used by the full pipeline.
    pub fn pipeline_modes(&self) -> &[LayoutMode] {
        if self.receipt_mode {
            &self.receipt_modes
        } else {
            &self.general_modes
        }
    }

    /// Color ranges that are active under this policy.
    pub fn active_color_ranges(&self) -> impl Iterator<Item = &ColorRange> {
        self.color_ranges
            .iter()
            .filter(|r| self.enable_multi_color_removal || r.ink == InkColor::Blue)
    }

    /// Replace the bounds of every blue range.
    fn with_blue_range(mut self, lower: [u8; 3], upper: [u8; 3]) -> Self {
        for range in &mut self.color_ranges {
            if range.ink == InkColor::Blue {
                range.lower = lower;
                range.upper = upper;
            }
        }
        self
    }
}

/// Recursively merge `overrides` into `base`. Objects merge key by key;
/// everything else is replaced.
fn merge_json(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overrides) => *base = overrides,
    }
}

/// Named document classes with tuned policies.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Preset {
    Default,
    ColorOnly,
    ContourOnly,
    HighDpi,
    FastProcessing,
    PhotoHard,
    SignatureResistant,
    Nfe,
    Nfse,
    Nfce,
    HighQualityOcr,
    NameFocused,
    NameHybrid,
    SignatureRemoval,
    BlueSignatureFocused,
}

impl Preset {
    /// Every preset, in display order.
    pub const ALL: &[Preset] = &[
        Preset::Default,
        Preset::ColorOnly,
        Preset::ContourOnly,
        Preset::HighDpi,
        Preset::FastProcessing,
        Preset::PhotoHard,
        Preset::SignatureResistant,
        Preset::Nfe,
        Preset::Nfse,
        Preset::Nfce,
        Preset::HighQualityOcr,
        Preset::NameFocused,
        Preset::NameHybrid,
        Preset::SignatureRemoval,
        Preset::BlueSignatureFocused,
    ];

    /// Canonical name.
    pub fn name(self) -> &'static str {
        match self {
            Preset::Default => "default",
            Preset::ColorOnly => "color-only",
            Preset::ContourOnly => "contour-only",
            Preset::HighDpi => "high-dpi",
            Preset::FastProcessing => "fast-processing",
            Preset::PhotoHard => "photo-hard",
            Preset::SignatureResistant => "signature-resistant",
            Preset::Nfe => "nfe",
            Preset::Nfse => "nfse",
            Preset::Nfce => "nfce",
            Preset::HighQualityOcr => "high-quality-ocr",
            Preset::NameFocused => "name-focused",
            Preset::NameHybrid => "name-hybrid",
            Preset::SignatureRemoval => "signature-removal",
            Preset::BlueSignatureFocused => "blue-signature-focused",
        }
    }

    /// One-line description for `presets` output.
    pub fn description(self) -> &'static str {
        match self {
            Preset::Default => "General documents, all mark detectors enabled",
            Preset::ColorOnly => "Only remove marks detected by ink color",
            Preset::ContourOnly => "Only remove marks detected by stroke shape",
            Preset::HighDpi => "Default policy rendered at 400 DPI",
            Preset::FastProcessing => "Lower DPI, color removal only",
            Preset::PhotoHard => "Hard photographs, Portuguese + English",
            Preset::SignatureResistant => "Receipts with heavy signatures",
            Preset::Nfe => "Product invoices, usually clean",
            Preset::Nfse => "Service invoices with stamps or signatures",
            Preset::Nfce => "Thermal register receipts",
            Preset::HighQualityOcr => "High resolution receipts, conservative masks",
            Preset::NameFocused => "Receipts where the client name matters most",
            Preset::NameHybrid => "Receipts, selective signature removal",
            Preset::SignatureRemoval => "Receipts with blue signatures over names",
            Preset::BlueSignatureFocused => "Receipts, narrow blue-pen range",
        }
    }

    /// Resolve a free-form name: case, spaces and underscores are ignored.
    pub fn from_name(name: &str) -> Option<Preset> {
        let normalized = name
            .trim()
            .to_lowercase()
            .replace(['_', ' '], "-");
        let preset = match normalized.as_str() {
            "" | "default" | "general" => Preset::Default,
            "color-only" | "colour-only" => Preset::ColorOnly,
            "contour-only" => Preset::ContourOnly,
            "high-dpi" => Preset::HighDpi,
            "fast-processing" | "fast" => Preset::FastProcessing,
            "photo-hard" => Preset::PhotoHard,
            "signature-resistant" => Preset::SignatureResistant,
            "nfe" | "invoice" | "product-invoice" => Preset::Nfe,
            "nfse" | "nfs-e" | "service-invoice" | "service-note" => Preset::Nfse,
            "nfce" | "nfc-e" | "nfce-cupom" | "cupom" | "receipt"
            | "general-receipt" => Preset::Nfce,
            "high-quality-ocr" => Preset::HighQualityOcr,
            "name-focused" => Preset::NameFocused,
            "name-hybrid" => Preset::NameHybrid,
            "signature-removal" => Preset::SignatureRemoval,
            "blue-signature-focused" => Preset::BlueSignatureFocused,
            _ => return None,
        };
        Some(preset)
    }

    /// Build the policy for this preset.
    pub fn policy(self) -> ProcessingPolicy {
        let base = ProcessingPolicy::default();
        match self {
            Preset::Default => base,
            Preset::ColorOnly => ProcessingPolicy {
                enable_contour_removal: false,
                ..base
            },
            Preset::ContourOnly => ProcessingPolicy {
                enable_color_removal: false,
                ..base
            },
            Preset::HighDpi => ProcessingPolicy { dpi: 400, ..base },
            Preset::FastProcessing => ProcessingPolicy {
                dpi: 220,
                enable_contour_removal: false,
                ..base
            },
            Preset::PhotoHard => ProcessingPolicy {
                dpi: 380,
                language: "por+eng".to_owned(),
                ..base
            },
            Preset::SignatureResistant => ProcessingPolicy {
                dpi: 350,
                language: "por+eng".to_owned(),
                morph_closing_kernel_size: 7,
                inpainting_radius: 6,
                receipt_mode: true,
                upscale_factor: 2.0,
                ..base
            },
            Preset::Nfe => ProcessingPolicy {
                enable_color_removal: false,
                enable_contour_removal: false,
                ..base
            },
            Preset::Nfse => ProcessingPolicy {
                dpi: 360,
                language: "por+eng".to_owned(),
                ..base
            },
            Preset::Nfce => ProcessingPolicy {
                dpi: 360,
                // Thin thermal digits are easily mistaken for pen strokes.
                enable_contour_removal: false,
                receipt_mode: true,
                ..base
            },
            Preset::HighQualityOcr => ProcessingPolicy {
                dpi: 450,
                general_modes: vec![
                    LayoutMode::SingleColumn,
                    LayoutMode::SingleBlock,
                    LayoutMode::SparseText,
                ],
                min_acceptable_chars: 50,
                deskew_max_angle_deg: 2.0,
                upscale_factor: 4.0,
                color_mask_min_area_ratio: 0.003,
                contour_max_solidity: 0.20,
                contour_min_aspect: 2.5,
                contour_min_length_px: 40,
                morph_closing_kernel_size: 3,
                receipt_mode: true,
                limit_blue_mask_to_bottom_ratio: 0.20,
                ..base
            }
            .with_blue_range([95, 120, 60], [130, 255, 255]),
            Preset::NameFocused => ProcessingPolicy {
                dpi: 500,
                min_acceptable_chars: 100,
                deskew_max_angle_deg: 1.5,
                upscale_factor: 3.5,
                color_mask_min_area_ratio: 0.008,
                contour_max_solidity: 0.15,
                contour_min_aspect: 3.5,
                contour_min_length_px: 60,
                morph_closing_kernel_size: 2,
                receipt_mode: true,
                limit_blue_mask_to_bottom_ratio: 0.08,
                ..base
            }
            .with_blue_range([108, 150, 80], [118, 255, 255]),
            Preset::NameHybrid => ProcessingPolicy {
                dpi: 420,
                deskew_max_angle_deg: 1.5,
                upscale_factor: 2.8,
                color_mask_min_area_ratio: 0.005,
                contour_max_solidity: 0.25,
                contour_min_aspect: 2.8,
                contour_min_length_px: 35,
                morph_closing_kernel_size: 3,
                receipt_mode: true,
                limit_blue_mask_to_bottom_ratio: 0.15,
                ..base
            }
            .with_blue_range([105, 140, 70], [125, 255, 255]),
            Preset::SignatureRemoval => ProcessingPolicy {
                dpi: 450,
                deskew_max_angle_deg: 1.2,
                upscale_factor: 3.0,
                color_mask_min_area_ratio: 0.003,
                contour_max_solidity: 0.30,
                contour_min_aspect: 1.8,
                contour_min_length_px: 30,
                morph_closing_kernel_size: 4,
                receipt_mode: true,
                limit_blue_mask_to_bottom_ratio: 0.25,
                ..base
            }
            .with_blue_range([100, 130, 60], [130, 255, 255]),
            Preset::BlueSignatureFocused => ProcessingPolicy {
                dpi: 400,
                deskew_max_angle_deg: 1.0,
                upscale_factor: 2.5,
                color_mask_min_area_ratio: 0.004,
                contour_max_solidity: 0.20,
                contour_min_aspect: 3.0,
                contour_min_length_px: 40,
                morph_closing_kernel_size: 3,
                receipt_mode: true,
                limit_blue_mask_to_bottom_ratio: 0.20,
                ..base
            }
            .with_blue_range([110, 150, 80], [125, 255, 220]),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn unknown_preset_falls_back_to_default() {
        let policy = ProcessingPolicy::for_preset("no such document class");
        assert_eq!(policy, ProcessingPolicy::default());
    }

    #[test]
    fn free_form_names_are_normalized() {
        assert_eq!(Preset::from_name("General Receipt"), Some(Preset::Nfce));
        assert_eq!(Preset::from_name("service_invoice"), Some(Preset::Nfse));
        assert_eq!(
            Preset::from_name("  Signature-Resistant "),
            Some(Preset::SignatureResistant)
        );
        assert_eq!(Preset::from_name("name focused"), Some(Preset::NameFocused));
        assert_eq!(Preset::from_name("bogus"), None);
    }

    #[test]
    fn every_canonical_name_round_trips() {
        for &preset in Preset::ALL {
            assert_eq!(Preset::from_name(preset.name()), Some(preset));
        }
    }

    #[test]
    fn receipt_presets_disable_contours_where_expected() {
        let nfce = Preset::Nfce.policy();
        assert!(nfce.receipt_mode);
        assert!(!nfce.enable_contour_removal);
        assert_eq!(nfce.mask_coverage_ceiling(), 0.10);
        assert_eq!(nfce.pipeline_modes(), nfce.receipt_modes.as_slice());

        let general = Preset::Default.policy();
        assert!(!general.receipt_mode);
        assert_eq!(general.mask_coverage_ceiling(), 0.15);
    }

    #[test]
    fn blue_range_overrides_only_touch_blue() {
        let policy = Preset::NameFocused.policy();
        let blue = policy
            .color_ranges
            .iter()
            .find(|r| r.ink == InkColor::Blue)
            .unwrap();
        assert_eq!(blue.lower, [108, 150, 80]);
        let dark = policy
            .color_ranges
            .iter()
            .find(|r| r.ink == InkColor::Dark)
            .unwrap();
        assert_eq!(dark.upper, [180, 255, 50]);
    }

    #[test]
    fn single_color_mode_keeps_only_blue_ranges() {
        let policy = ProcessingPolicy {
            enable_multi_color_removal: false,
            ..ProcessingPolicy::default()
        };
        let inks = policy
            .active_color_ranges()
            .map(|r| r.ink)
            .collect::<Vec<_>>();
        assert_eq!(inks, vec![InkColor::Blue]);
    }

    #[test]
    fn overrides_merge_nested_fields() {
        let policy = Preset::Nfce
            .policy()
            .with_overrides(json!({
                "dpi": 200,
                "scoring": { "early_exit_min_score": 0.7 },
            }))
            .unwrap();
        assert_eq!(policy.dpi, 200);
        assert_eq!(policy.scoring.early_exit_min_score, 0.7);
        // Untouched nested fields keep their preset values.
        assert_eq!(policy.scoring.confidence_weight, 0.70);
        assert!(policy.receipt_mode);
    }

    #[test]
    fn overrides_reject_unknown_fields() {
        let result = ProcessingPolicy::default().with_overrides(json!({ "dpii": 1 }));
        assert!(result.is_err());
    }

    #[test]
    fn color_range_contains_is_inclusive() {
        let range = ColorRange::new(InkColor::Blue, [90, 80, 40], [150, 255, 255]);
        assert!(range.contains([90, 80, 40]));
        assert!(range.contains([150, 255, 255]));
        assert!(!range.contains([89, 200, 200]));
        assert!(!range.contains([120, 79, 200]));
    }
}
