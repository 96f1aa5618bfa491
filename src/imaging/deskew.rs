//! Skew detection and correction.

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::{
    edges::canny,
    geometric_transformations::{Interpolation, rotate_about_center},
    hough::{LineDetectionOptions, detect_lines},
};

use crate::{policy::ProcessingPolicy, prelude::*};

/// Canny hysteresis thresholds.
const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;

/// Minimum Hough accumulator votes for a line.
const HOUGH_VOTES: u32 = 120;

/// Estimate the page skew in degrees, from the median angle of long,
/// near-horizontal lines.
///
/// Returns `None` when deskew is disabled, when no line falls inside the
/// configured window, or when the angle is below the noise floor.
#[instrument(level = "trace", skip_all)]
pub fn estimate_skew(gray: &GrayImage, policy: &ProcessingPolicy) -> Option<f64> {
    if !policy.enable_deskew || gray.width() < 3 || gray.height() < 3 {
        return None;
    }
    let edges = canny(gray, CANNY_LOW, CANNY_HIGH);
    let lines = detect_lines(
        &edges,
        LineDetectionOptions {
            vote_threshold: HOUGH_VOTES,
            suppression_radius: 8,
        },
    );

    // A horizontal line has a vertical normal, so its angle is 90 degrees.
    let mut angles = lines
        .iter()
        .map(|line| f64::from(line.angle_in_degrees) - 90.0)
        .filter(|angle| angle.abs() <= policy.deskew_max_angle_deg)
        .collect::<Vec<_>>();
    let angle = median(&mut angles)?;
    trace!(lines = lines.len(), angle, "Estimated skew");
    (angle.abs() >= policy.deskew_min_angle_deg).then_some(angle)
}

/// Median of a list of values, or `None` if it is empty.
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Rotate a grayscale page counter-clockwise by `angle` degrees, filling
/// exposed corners with white.
pub fn rotate_gray(image: &GrayImage, angle: f64) -> GrayImage {
    rotate_about_center(
        image,
        -(angle as f32).to_radians(),
        Interpolation::Bilinear,
        Luma([255]),
    )
}

/// Rotate a color page counter-clockwise by `angle` degrees.
pub fn rotate_rgb(image: &RgbImage, angle: f64) -> RgbImage {
    rotate_about_center(
        image,
        -(angle as f32).to_radians(),
        Interpolation::Bilinear,
        Rgb([255, 255, 255]),
    )
}

/// A page after skew correction, in both color and grayscale.
pub struct DeskewedPage {
    /// Color page, for ink-color analysis.
    pub color: RgbImage,
    /// Grayscale page, for everything else.
    pub gray: GrayImage,
    /// Applied correction in degrees, if any.
    pub angle: Option<f64>,
}

/// Measure skew on the grayscale page and apply the same correction to both
/// representations.
pub fn deskew_page(color: &RgbImage, policy: &ProcessingPolicy) -> DeskewedPage {
    let gray = super::to_gray(color);
    match estimate_skew(&gray, policy) {
        Some(angle) => {
            debug!(angle, "Deskewing page");
            DeskewedPage {
                color: rotate_rgb(color, angle),
                gray: rotate_gray(&gray, angle),
                angle: Some(angle),
            }
        }
        None => DeskewedPage {
            color: color.clone(),
            gray,
            angle: None,
        },
    }
}
