//! Binarization pipelines: cheap baselines, the general "robust" pipeline, and
//! the thermal receipt pipeline.

use image::{GrayImage, Luma};
use imageproc::{filter::median_filter, region_labelling::{Connectivity, connected_components}};

use super::{
    AdaptiveMethod, adaptive_threshold, add_weighted, blur, clahe, invert_if_dark,
    otsu_binarize, sharpen, vertical_open,
};
use crate::{imaging::deskew::median, policy::ProcessingPolicy, prelude::*};

/// Component heights outside this range are not considered text strokes.
const STROKE_HEIGHT_RANGE: std::ops::RangeInclusive<u32> = 6..=40;

/// Text with a median stroke height below this gets upscaled.
const MIN_STROKE_HEIGHT: f64 = 12.0;

/// The two non-destructive baseline images: plain grayscale and a global Otsu
/// threshold.
pub fn baseline_variants(gray: &GrayImage) -> (GrayImage, GrayImage) {
    (gray.clone(), otsu_binarize(gray))
}

/// Light edge-preserving denoise.
fn denoise(gray: &GrayImage) -> GrayImage {
    median_filter(gray, 1, 1)
}

/// General documents: denoise, local contrast, sharpen, then a wide gaussian
/// adaptive threshold.
#[instrument(level = "trace", skip_all)]
pub fn binarize_robust(gray: &GrayImage) -> GrayImage {
    let denoised = clahe(&denoise(gray), 2.5, 8);
    let sharp = sharpen(&denoised, 1.0, 1.6);
    let mut bin = adaptive_threshold(&sharp, AdaptiveMethod::Gaussian, 31, 10.0, false);
    invert_if_dark(&mut bin);
    bin
}

/// Flatten uneven thermal-paper background by dividing by a heavy blur.
pub fn normalize_background(gray: &GrayImage) -> GrayImage {
    let background = blur(gray, 21.0);
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let value = f64::from(gray.get_pixel(x, y)[0]);
        let bg = f64::from(background.get_pixel(x, y)[0]);
        if bg == 0.0 {
            Luma([0])
        } else {
            Luma([(value * 128.0 / bg).round().clamp(0.0, 255.0) as u8])
        }
    })
}

/// Remove vertical print-head streaks: tall dark runs are lifted out of the
/// inverted image before it is flipped back.
pub fn remove_banding(gray: &GrayImage) -> GrayImage {
    let mut inverted = gray.clone();
    image::imageops::invert(&mut inverted);
    let streaks = vertical_open(&inverted, 25);
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let cleaned = inverted
            .get_pixel(x, y)[0]
            .saturating_sub(streaks.get_pixel(x, y)[0]);
        Luma([255 - cleaned])
    })
}

/// Thermal receipts: background flattening, denoise, strong local contrast,
/// sharpening, streak removal and a policy-tuned adaptive threshold.
#[instrument(level = "trace", skip_all)]
pub fn binarize_receipt(gray: &GrayImage, policy: &ProcessingPolicy) -> GrayImage {
    let normalized = normalize_background(gray);
    let enhanced = clahe(&denoise(&normalized), 3.2, 8);
    let sharp = add_weighted(&enhanced, 1.5, &blur(&enhanced, 1.0), -0.5);
    let debanded = remove_banding(&sharp);
    let mut bin = adaptive_threshold(
        &debanded,
        AdaptiveMethod::Gaussian,
        policy.receipt_block_size,
        f64::from(policy.receipt_c),
        false,
    );
    invert_if_dark(&mut bin);
    bin
}

/// Binarize with the pipeline the policy calls for.
pub fn binarize_for_policy(gray: &GrayImage, policy: &ProcessingPolicy) -> GrayImage {
    if policy.receipt_mode {
        binarize_receipt(gray, policy)
    } else {
        binarize_robust(gray)
    }
}

/// Median height of text-sized connected components, if there are any.
pub fn median_stroke_height(gray: &GrayImage) -> Option<f64> {
    let ink = adaptive_threshold(gray, AdaptiveMethod::Mean, 31, 12.0, true);
    let ink = vertical_open(&ink, 3);
    let labels = connected_components(&ink, Connectivity::Eight, Luma([0u8]));

    // (min_y, max_y) per label.
    let mut extents: Vec<Option<(u32, u32)>> = vec![];
    for (_, y, label) in labels.enumerate_pixels() {
        let label = label[0] as usize;
        if label == 0 {
            continue;
        }
        if extents.len() <= label {
            extents.resize(label + 1, None);
        }
        extents[label] = Some(match extents[label] {
            Some((lo, hi)) => (lo.min(y), hi.max(y)),
            None => (y, y),
        });
    }

    let mut heights = extents
        .into_iter()
        .flatten()
        .map(|(lo, hi)| hi - lo + 1)
        .filter(|h| STROKE_HEIGHT_RANGE.contains(h))
        .map(f64::from)
        .collect::<Vec<_>>();
    median(&mut heights)
}

/// Upscale factor to apply before binarizing a receipt, if its text is small.
pub fn small_text_upscale(gray: &GrayImage, policy: &ProcessingPolicy) -> Option<f64> {
    let height = median_stroke_height(gray)?;
    if height < MIN_STROKE_HEIGHT && policy.upscale_factor > 1.0 {
        debug!(height, factor = policy.upscale_factor, "Upscaling small text");
        Some(policy.upscale_factor)
    } else {
        None
    }
}
