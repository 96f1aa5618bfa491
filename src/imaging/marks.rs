//! Signature and stamp suppression.
//!
//! We build a mask of probable handwritten or stamped marks, either from ink
//! color or from stroke shape, and fill the masked pixels from their
//! surroundings. A mask that covers too much of the page is rejected
//! outright, because at that point it is more likely to be eating real text.

use image::{GrayImage, Luma, RgbImage};
use imageproc::{
    contours::{BorderType, find_contours},
    distance_transform::Norm,
    drawing::draw_polygon_mut,
    geometry::convex_hull,
    morphology::close,
    point::Point,
};
use schemars::JsonSchema;

use super::{AdaptiveMethod, adaptive_threshold, coverage, rgb_to_hsv};
use crate::{
    policy::{InkColor, ProcessingPolicy},
    prelude::*,
};

/// Contours smaller than this many pixels are never marks.
const MIN_CONTOUR_AREA_PX: f64 = 30.0;

/// What the suppression stage decided for a page.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskOutcome {
    /// No qualifying mask was found.
    #[default]
    None,
    /// Marks were found by ink color and filled in.
    Color,
    /// Marks were found by stroke shape and filled in.
    Contour,
    /// A mask was found but covered too much of the page, so it was ignored.
    Rejected,
}

/// The result of looking for marks on a page.
pub struct Suppression {
    /// What happened.
    pub outcome: MaskOutcome,
    /// The accepted mask, if any. Non-zero pixels are to be filled.
    pub mask: Option<GrayImage>,
}

/// Close small gaps in a mask with a square kernel.
fn close_mask(mask: &GrayImage, kernel_size: u32) -> GrayImage {
    let radius = (kernel_size / 2).clamp(1, u32::from(u8::MAX)) as u8;
    close(mask, Norm::LInf, radius)
}

/// Mask pixels falling inside any active ink range.
///
/// In receipt mode, blue ink is only looked for near the bottom of the page,
/// where the signature line is.
pub fn color_mask(color: &RgbImage, policy: &ProcessingPolicy) -> Option<GrayImage> {
    if !policy.enable_color_removal {
        return None;
    }
    let ranges = policy.active_color_ranges().collect::<Vec<_>>();
    if ranges.is_empty() {
        return None;
    }
    let height = color.height();
    let blue_cutoff = if policy.receipt_mode {
        let ratio = policy.limit_blue_mask_to_bottom_ratio.clamp(0.0, 1.0);
        (f64::from(height) * (1.0 - ratio)) as u32
    } else {
        0
    };

    let mask = GrayImage::from_fn(color.width(), height, |x, y| {
        let hsv = rgb_to_hsv(color.get_pixel(x, y).0);
        let hit = ranges.iter().any(|range| {
            (range.ink != InkColor::Blue || y >= blue_cutoff) && range.contains(hsv)
        });
        Luma([if hit { 255 } else { 0 }])
    });

    let ratio = coverage(&mask);
    if ratio < policy.color_mask_min_area_ratio {
        trace!(ratio, "Color mask too small");
        return None;
    }
    Some(close_mask(&mask, policy.morph_closing_kernel_size))
}

/// Polygon area by the shoelace formula.
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice_area: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| i64::from(a.x) * i64::from(b.y) - i64::from(b.x) * i64::from(a.y))
        .sum();
    twice_area.abs() as f64 / 2.0
}

/// Fill a contour into a mask.
fn fill_contour(mask: &mut GrayImage, points: &[Point<i32>]) {
    let mut polygon = points.to_vec();
    polygon.dedup();
    while polygon.len() > 1 && polygon.first() == polygon.last() {
        polygon.pop();
    }
    if polygon.len() >= 3 {
        draw_polygon_mut(mask, &polygon, Luma([255]));
    }
    for p in points {
        if p.x >= 0 && p.y >= 0 && (p.x as u32) < mask.width() && (p.y as u32) < mask.height()
        {
            mask.put_pixel(p.x as u32, p.y as u32, Luma([255]));
        }
    }
}

/// Mask outer contours that look like pen strokes: irregular (low solidity),
/// or long and thin.
///
/// Receipt mode never uses this, since thin thermal glyphs look a lot like
/// strokes.
pub fn contour_mask(gray: &GrayImage, policy: &ProcessingPolicy) -> Option<GrayImage> {
    if !policy.enable_contour_removal || policy.receipt_mode {
        return None;
    }
    let ink = adaptive_threshold(gray, AdaptiveMethod::Mean, 31, 10.0, true);
    let image_area = f64::from(gray.width()) * f64::from(gray.height());
    let min_area = (policy.contour_min_area_ratio * image_area).floor().max(MIN_CONTOUR_AREA_PX);
    let max_area = (policy.contour_max_area_ratio * image_area).floor();

    let mut mask = GrayImage::new(gray.width(), gray.height());
    let mut drawn = 0usize;
    for contour in find_contours::<i32>(&ink) {
        if contour.parent.is_some() || contour.border_type != BorderType::Outer {
            continue;
        }
        let area = polygon_area(&contour.points);
        if area < min_area || area > max_area {
            continue;
        }
        let hull = convex_hull(contour.points.as_slice());
        let hull_area = match polygon_area(&hull) {
            a if a > 0.0 => a,
            _ => 1.0,
        };
        let solidity = area / hull_area;

        let (min_x, max_x, min_y, max_y) = contour.points.iter().fold(
            (i32::MAX, i32::MIN, i32::MAX, i32::MIN),
            |(x0, x1, y0, y1), p| (x0.min(p.x), x1.max(p.x), y0.min(p.y), y1.max(p.y)),
        );
        let width = f64::from(max_x - min_x + 1);
        let height = f64::from(max_y - min_y + 1);
        let major = width.max(height);
        let aspect = major / width.min(height).max(1.0);

        let irregular = solidity < policy.contour_max_solidity;
        let stroke_like = aspect >= policy.contour_min_aspect
            && major >= f64::from(policy.contour_min_length_px);
        if irregular || stroke_like {
            fill_contour(&mut mask, &contour.points);
            drawn += 1;
        }
    }

    if drawn == 0 || coverage(&mask) == 0.0 {
        return None;
    }
    trace!(contours = drawn, "Contour mask built");
    Some(close_mask(&mask, policy.morph_closing_kernel_size))
}

/// Look for marks on a deskewed page. Color masks win; contour masks are only
/// tried when no color mask qualifies.
#[instrument(level = "trace", skip_all)]
pub fn find_marks(color: &RgbImage, gray: &GrayImage, policy: &ProcessingPolicy) -> Suppression {
    let found = color_mask(color, policy)
        .map(|mask| (MaskOutcome::Color, mask))
        .or_else(|| contour_mask(gray, policy).map(|mask| (MaskOutcome::Contour, mask)));
    let Some((outcome, mask)) = found else {
        return Suppression {
            outcome: MaskOutcome::None,
            mask: None,
        };
    };

    let ratio = coverage(&mask);
    let ceiling = policy.mask_coverage_ceiling();
    if ratio == 0.0 {
        Suppression {
            outcome: MaskOutcome::None,
            mask: None,
        }
    } else if ratio >= ceiling {
        debug!(?outcome, ratio, ceiling, "Rejecting oversized mark mask");
        Suppression {
            outcome: MaskOutcome::Rejected,
            mask: None,
        }
    } else {
        debug!(?outcome, ratio, "Suppressing marks");
        Suppression {
            outcome,
            mask: Some(mask),
        }
    }
}

/// Fill masked pixels from their known neighbours, working inwards one layer
/// at a time. Each filled pixel becomes the mean of the known pixels within
/// `radius`.
pub fn inpaint(gray: &GrayImage, mask: &GrayImage, radius: u32) -> GrayImage {
    let (width, height) = gray.dimensions();
    let radius = radius.max(1) as i64;
    let index = |x: u32, y: u32| y as usize * width as usize + x as usize;

    let mut out = gray.clone();
    let mut known = mask.as_raw().iter().map(|&m| m == 0).collect::<Vec<_>>();
    let mut pending = mask
        .enumerate_pixels()
        .filter(|(_, _, m)| m[0] != 0)
        .map(|(x, y, _)| (x, y))
        .collect::<Vec<_>>();

    while !pending.is_empty() {
        let mut filled = vec![];
        let mut remaining = Vec::with_capacity(pending.len());
        for (x, y) in pending.drain(..) {
            let mut sum = 0u64;
            let mut count = 0u64;
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    if dx * dx + dy * dy > radius * radius {
                        continue;
                    }
                    let (nx, ny) = (i64::from(x) + dx, i64::from(y) + dy);
                    if nx < 0 || ny < 0 || nx >= i64::from(width) || ny >= i64::from(height) {
                        continue;
                    }
                    let (nx, ny) = (nx as u32, ny as u32);
                    if known[index(nx, ny)] {
                        sum += u64::from(out.get_pixel(nx, ny)[0]);
                        count += 1;
                    }
                }
            }
            if count > 0 {
                filled.push((x, y, ((sum + count / 2) / count) as u8));
            } else {
                remaining.push((x, y));
            }
        }
        if filled.is_empty() {
            // Nothing left to grow from, e.g. a fully masked page.
            break;
        }
        for (x, y, value) in filled {
            out.put_pixel(x, y, Luma([value]));
            known[index(x, y)] = true;
        }
        pending = remaining;
    }
    out
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;
    use crate::policy::Preset;

    /// White page with some black print and a blue scribble in the given rows.
    fn page_with_blue(rows: std::ops::Range<u32>) -> RgbImage {
        RgbImage::from_fn(200, 200, |x, y| {
            if rows.contains(&y) && (20..180).contains(&x) && (x + y) % 7 < 3 {
                Rgb([30, 40, 200])
            } else if y % 20 == 5 && x % 10 < 6 {
                Rgb([0, 0, 0])
            } else {
                Rgb([250, 250, 250])
            }
        })
    }

    fn blue_only(policy: ProcessingPolicy) -> ProcessingPolicy {
        ProcessingPolicy {
            enable_multi_color_removal: false,
            ..policy
        }
    }

    #[test]
    fn blue_ink_is_masked() {
        let page = page_with_blue(170..190);
        let mask = color_mask(&page, &blue_only(ProcessingPolicy::default())).unwrap();
        let blue = page
            .enumerate_pixels()
            .find(|(_, _, p)| p.0 == [30, 40, 200])
            .unwrap();
        assert_eq!(mask.get_pixel(blue.0, blue.1)[0], 255);
        assert_eq!(mask.get_pixel(5, 5)[0], 0);
    }

    #[test]
    fn receipt_mode_ignores_blue_near_the_top() {
        let policy = blue_only(Preset::Nfce.policy());
        assert!(color_mask(&page_with_blue(10..30), &policy).is_none());
        assert!(color_mask(&page_with_blue(170..190), &policy).is_some());
    }

    #[test]
    fn oversized_masks_are_rejected() {
        // Blue over most of the page.
        let page = RgbImage::from_fn(100, 100, |_, y| {
            if y < 60 { Rgb([30, 40, 200]) } else { Rgb([250, 250, 250]) }
        });
        let gray = crate::imaging::to_gray(&page);
        let suppression = find_marks(&page, &gray, &ProcessingPolicy::default());
        assert_eq!(suppression.outcome, MaskOutcome::Rejected);
        assert!(suppression.mask.is_none());
    }

    #[test]
    fn clean_pages_have_no_marks() {
        let page = RgbImage::from_pixel(100, 100, Rgb([250, 250, 250]));
        let gray = crate::imaging::to_gray(&page);
        let suppression = find_marks(&page, &gray, &ProcessingPolicy::default());
        assert_eq!(suppression.outcome, MaskOutcome::None);
    }

    #[test]
    fn long_thin_strokes_are_masked_by_shape() {
        // A long, gently sloping pen stroke on an otherwise blank page.
        let gray = GrayImage::from_fn(300, 300, |x, y| {
            if y.abs_diff(100 + x / 5) < 2 && (40..260).contains(&x) {
                Luma([0])
            } else {
                Luma([255])
            }
        });
        let policy = ProcessingPolicy {
            enable_color_removal: false,
            ..ProcessingPolicy::default()
        };
        let mask = contour_mask(&gray, &policy).unwrap();
        assert_eq!(mask.get_pixel(150, 130)[0], 255);
        assert_eq!(mask.get_pixel(10, 290)[0], 0);
    }

    #[test]
    fn receipts_never_use_contour_masks() {
        let gray = GrayImage::from_fn(300, 300, |x, y| {
            if x.abs_diff(y) < 2 { Luma([0]) } else { Luma([255]) }
        });
        let policy = ProcessingPolicy {
            receipt_mode: true,
            ..ProcessingPolicy::default()
        };
        assert!(contour_mask(&gray, &policy).is_none());
    }

    #[test]
    fn inpainting_fills_from_surroundings() {
        let mut gray = GrayImage::from_pixel(20, 20, Luma([200]));
        let mut mask = GrayImage::new(20, 20);
        for y in 8..12 {
            for x in 8..12 {
                gray.put_pixel(x, y, Luma([0]));
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let filled = inpaint(&gray, &mask, 3);
        assert_eq!(filled.get_pixel(10, 10)[0], 200);
        assert_eq!(filled.get_pixel(0, 0)[0], 200);
    }

    #[test]
    fn inpainting_works_inwards_layer_by_layer() {
        let mut gray = GrayImage::from_pixel(30, 30, Luma([180]));
        let mut mask = GrayImage::new(30, 30);
        for y in 5..25 {
            for x in 5..25 {
                gray.put_pixel(x, y, Luma([0]));
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        // Radius 1 needs ten layers to reach the centre.
        let filled = inpaint(&gray, &mask, 1);
        assert!(filled.pixels().all(|p| p[0] == 180));

        // Nothing is known, so nothing can be filled.
        let everything = GrayImage::from_pixel(30, 30, Luma([255]));
        let dark = GrayImage::from_pixel(30, 30, Luma([7]));
        assert_eq!(inpaint(&dark, &everything, 2), dark);
    }

    #[test]
    fn shoelace_area_of_a_square() {
        let square = [
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(10, 10),
            Point::new(0, 10),
        ];
        assert_eq!(polygon_area(&square), 100.0);
    }
}
