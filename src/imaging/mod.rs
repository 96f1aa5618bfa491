//! Raster primitives shared by the binarization, deskew and mark-suppression
//! stages.
//!
//! Everything here works on 8-bit [`GrayImage`]s (or [`RgbImage`]s for color
//! work) and uses "white paper, black ink" conventions unless noted otherwise.
//! Thresholds and scales follow the usual OpenCV semantics so that tuned
//! constants carry over.

use image::{GrayImage, Luma, RgbImage, imageops};
use imageproc::filter::gaussian_blur_f32;

use self::{
    binarize::{binarize_for_policy, small_text_upscale},
    deskew::deskew_page,
    marks::{MaskOutcome, find_marks, inpaint},
};
use crate::{policy::ProcessingPolicy, prelude::*};

pub mod binarize;
pub mod deskew;
pub mod marks;

/// The images the full pipeline OCRs for one page.
pub struct PreparedVariants {
    /// Binarized page, marks left alone.
    pub clean: GrayImage,
    /// Binarized page after mark suppression, or `None` when no mark was
    /// suppressed (it would be identical to `clean`).
    pub processed: Option<GrayImage>,
    /// What mark suppression decided.
    pub mask: MaskOutcome,
    /// The deskewed (and possibly upscaled) grayscale page.
    pub gray: GrayImage,
    /// Skew correction that was applied, in degrees.
    pub deskew_angle: Option<f64>,
}

/// Deskew, binarize and suppress marks on a color page.
#[instrument(level = "debug", skip_all)]
pub fn prepare_variants(page: &RgbImage, policy: &ProcessingPolicy) -> PreparedVariants {
    let deskewed = deskew_page(page, policy);
    let deskew_angle = deskewed.angle;
    let (color, gray) = match policy
        .receipt_mode
        .then(|| small_text_upscale(&deskewed.gray, policy))
        .flatten()
    {
        Some(factor) => (scale(&deskewed.color, factor), scale(&deskewed.gray, factor)),
        None => (deskewed.color, deskewed.gray),
    };

    let clean = binarize_for_policy(&gray, policy);
    let suppression = find_marks(&color, &gray, policy);
    let processed = suppression
        .mask
        .map(|mask| binarize_for_policy(&fill_marks(&gray, &mask, policy), policy));
    PreparedVariants {
        clean,
        processed,
        mask: suppression.outcome,
        gray,
        deskew_angle,
    }
}

/// Inpaint masked marks. On receipts, text size is checked again afterwards,
/// because print hidden under a mark may be smaller than the rest.
fn fill_marks(gray: &GrayImage, mask: &GrayImage, policy: &ProcessingPolicy) -> GrayImage {
    let filled = inpaint(gray, mask, policy.inpainting_radius);
    match policy
        .receipt_mode
        .then(|| small_text_upscale(&filled, policy))
        .flatten()
    {
        Some(factor) => scale(&filled, factor),
        None => filled,
    }
}

/// Convert a color page to grayscale.
pub fn to_gray(image: &RgbImage) -> GrayImage {
    imageops::grayscale(image)
}

/// Mean pixel value, in `0.0..=255.0`.
pub fn mean_intensity(image: &GrayImage) -> f64 {
    let pixel_count = u64::from(image.width()) * u64::from(image.height());
    if pixel_count == 0 {
        return 0.0;
    }
    let sum: u64 = image.as_raw().iter().map(|&p| u64::from(p)).sum();
    sum as f64 / pixel_count as f64
}

/// Invert a binary image if most of it is dark, so text ends up black on
/// white.
pub fn invert_if_dark(image: &mut GrayImage) {
    if mean_intensity(image) < 127.0 {
        imageops::invert(image);
    }
}

/// Share of non-zero pixels in a mask.
pub fn coverage(mask: &GrayImage) -> f64 {
    let total = mask.as_raw().len();
    if total == 0 {
        return 0.0;
    }
    let set = mask.as_raw().iter().filter(|&&p| p > 0).count();
    set as f64 / total as f64
}

/// Gaussian blur that tolerates a zero sigma.
pub fn blur(image: &GrayImage, sigma: f32) -> GrayImage {
    if sigma <= 0.0 {
        image.clone()
    } else {
        gaussian_blur_f32(image, sigma)
    }
}

/// Weighted sum `a * alpha + b * beta`, saturating to `0..=255`.
pub fn add_weighted(a: &GrayImage, alpha: f64, b: &GrayImage, beta: f64) -> GrayImage {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    let data = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(&pa, &pb)| {
            (f64::from(pa) * alpha + f64::from(pb) * beta)
                .round()
                .clamp(0.0, 255.0) as u8
        })
        .collect();
    GrayImage::from_raw(a.width(), a.height(), data)
        .unwrap_or_else(|| GrayImage::new(a.width(), a.height()))
}

/// Unsharp masking: `image * amount - blur(image) * (amount - 1)`.
pub fn sharpen(image: &GrayImage, sigma: f32, amount: f64) -> GrayImage {
    add_weighted(image, amount, &blur(image, sigma), 1.0 - amount)
}

/// Summed-area table for fast box means.
pub struct IntegralImage {
    width: u32,
    height: u32,
    sums: Vec<u64>,
}

impl IntegralImage {
    /// Build the table for an image.
    pub fn new(image: &GrayImage) -> Self {
        let (width, height) = image.dimensions();
        let stride = width as usize + 1;
        let mut sums = vec![0u64; stride * (height as usize + 1)];
        for y in 0..height as usize {
            let mut row_sum = 0u64;
            for x in 0..width as usize {
                row_sum += u64::from(image.get_pixel(x as u32, y as u32)[0]);
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row_sum;
            }
        }
        Self {
            width,
            height,
            sums,
        }
    }

    /// Mean of the box centered on `(x, y)` with the given radius, clipped to
    /// the image.
    pub fn box_mean(&self, x: u32, y: u32, radius: u32) -> f64 {
        let x0 = x.saturating_sub(radius) as usize;
        let y0 = y.saturating_sub(radius) as usize;
        let x1 = (x + radius + 1).min(self.width) as usize;
        let y1 = (y + radius + 1).min(self.height) as usize;
        let stride = self.width as usize + 1;
        let sum = self.sums[y1 * stride + x1] + self.sums[y0 * stride + x0]
            - self.sums[y0 * stride + x1]
            - self.sums[y1 * stride + x0];
        let area = ((x1 - x0) * (y1 - y0)).max(1);
        sum as f64 / area as f64
    }
}

/// How an adaptive threshold computes its local reference value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdaptiveMethod {
    /// Box mean over the window.
    Mean,
    /// Gaussian-weighted mean over the window.
    Gaussian,
}

/// Locally adaptive threshold.
///
/// A pixel becomes white when it is brighter than its local reference minus
/// `c`. With `inverse`, the output is flipped (ink becomes white), which is
/// what contour and component analysis want.
pub fn adaptive_threshold(
    image: &GrayImage,
    method: AdaptiveMethod,
    block_size: u32,
    c: f64,
    inverse: bool,
) -> GrayImage {
    let block_size = block_size.max(3) | 1;
    let (on, off) = if inverse { (0u8, 255u8) } else { (255u8, 0u8) };
    let mut out = GrayImage::new(image.width(), image.height());
    match method {
        AdaptiveMethod::Mean => {
            let integral = IntegralImage::new(image);
            let radius = block_size / 2;
            for (x, y, pixel) in image.enumerate_pixels() {
                let reference = integral.box_mean(x, y, radius) - c;
                let value = if f64::from(pixel[0]) > reference { on } else { off };
                out.put_pixel(x, y, Luma([value]));
            }
        }
        AdaptiveMethod::Gaussian => {
            let sigma = 0.3 * ((block_size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
            let local = blur(image, sigma);
            for (x, y, pixel) in image.enumerate_pixels() {
                let reference = f64::from(local.get_pixel(x, y)[0]) - c;
                let value = if f64::from(pixel[0]) > reference { on } else { off };
                out.put_pixel(x, y, Luma([value]));
            }
        }
    }
    out
}

/// Global binarization at the Otsu level, black text on white.
pub fn otsu_binarize(image: &GrayImage) -> GrayImage {
    let level = imageproc::contrast::otsu_level(image);
    let mut out = GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([if image.get_pixel(x, y)[0] > level { 255 } else { 0 }])
    });
    invert_if_dark(&mut out);
    out
}

/// Contrast-limited adaptive histogram equalization on a `grid x grid` tile
/// layout, with bilinear blending between tile mappings.
pub fn clahe(image: &GrayImage, clip_limit: f64, grid: u32) -> GrayImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }
    let tiles_x = grid.clamp(1, width);
    let tiles_y = grid.clamp(1, height);
    let bounds = |i: u32, n: u32, len: u32| (i * len / n, (i + 1) * len / n);

    let mut maps = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        let (y0, y1) = bounds(ty, tiles_y, height);
        for tx in 0..tiles_x {
            let (x0, x1) = bounds(tx, tiles_x, width);
            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[image.get_pixel(x, y)[0] as usize] += 1;
                }
            }
            let area = (x1 - x0) * (y1 - y0);
            maps.push(clipped_equalization(&mut hist, area, clip_limit));
        }
    }

    let tile_w = f64::from(width) / f64::from(tiles_x);
    let tile_h = f64::from(height) / f64::from(tiles_y);
    let locate = |pos: u32, tile: f64, n: u32| {
        let f = (f64::from(pos) + 0.5) / tile - 0.5;
        let i0 = f.floor().clamp(0.0, f64::from(n - 1)) as u32;
        let i1 = (i0 + 1).min(n - 1);
        let t = (f - f64::from(i0)).clamp(0.0, 1.0);
        (i0, i1, t)
    };

    GrayImage::from_fn(width, height, |x, y| {
        let (tx0, tx1, ax) = locate(x, tile_w, tiles_x);
        let (ty0, ty1, ay) = locate(y, tile_h, tiles_y);
        let v = image.get_pixel(x, y)[0] as usize;
        let at = |tx: u32, ty: u32| f64::from(maps[(ty * tiles_x + tx) as usize][v]);
        let top = at(tx0, ty0) * (1.0 - ax) + at(tx1, ty0) * ax;
        let bottom = at(tx0, ty1) * (1.0 - ax) + at(tx1, ty1) * ax;
        Luma([(top * (1.0 - ay) + bottom * ay).round().clamp(0.0, 255.0) as u8])
    })
}

/// Clip a tile histogram, redistribute the excess and build the lookup table.
fn clipped_equalization(hist: &mut [u32; 256], area: u32, clip_limit: f64) -> [u8; 256] {
    let limit = ((clip_limit * f64::from(area) / 256.0) as u32).max(1);
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let share = excess / 256;
    let remainder = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += share + u32::from(i < remainder);
    }

    let mut map = [0u8; 256];
    let mut cdf = 0u64;
    let scale = 255.0 / f64::from(area.max(1));
    for (i, &count) in hist.iter().enumerate() {
        cdf += u64::from(count);
        map[i] = (cdf as f64 * scale).round().min(255.0) as u8;
    }
    map
}

/// Column-wise minimum (`erode`) or maximum (`dilate`) over a vertical window
/// of `length` pixels.
fn vertical_extreme(image: &GrayImage, length: u32, take_max: bool) -> GrayImage {
    let (width, height) = image.dimensions();
    let above = length.saturating_sub(1) / 2;
    let below = length.saturating_sub(1) - above;
    GrayImage::from_fn(width, height, |x, y| {
        let y0 = y.saturating_sub(above);
        let y1 = (y + below).min(height.saturating_sub(1));
        let column = (y0..=y1).map(|yy| image.get_pixel(x, yy)[0]);
        let value = if take_max { column.max() } else { column.min() };
        Luma([value.unwrap_or(0)])
    })
}

/// Morphological opening with a `1 x length` vertical line. Keeps bright
/// vertical runs at least `length` pixels tall.
pub fn vertical_open(image: &GrayImage, length: u32) -> GrayImage {
    let eroded = vertical_extreme(image, length, false);
    vertical_extreme(&eroded, length, true)
}

/// Convert an RGB pixel to HSV with 8-bit OpenCV scales: hue `0..=180`,
/// saturation and value `0..=255`.
pub fn rgb_to_hsv(rgb: [u8; 3]) -> [u8; 3] {
    let [r, g, b] = rgb.map(f64::from);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let saturation = if max > 0.0 { delta * 255.0 / max } else { 0.0 };
    let mut hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    if hue < 0.0 {
        hue += 360.0;
    }
    [
        (hue / 2.0).round().min(180.0) as u8,
        saturation.round() as u8,
        max as u8,
    ]
}

/// Resize by a uniform factor using bicubic interpolation.
pub fn scale<P>(
    image: &image::ImageBuffer<P, Vec<P::Subpixel>>,
    factor: f64,
) -> image::ImageBuffer<P, Vec<P::Subpixel>>
where
    P: image::Pixel + 'static,
    P::Subpixel: 'static,
{
    let width = ((f64::from(image.width()) * factor) as u32).max(1);
    let height = ((f64::from(image.height()) * factor) as u32).max(1);
    imageops::resize(image, width, height, imageops::FilterType::CatmullRom)
}
