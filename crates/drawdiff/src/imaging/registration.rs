//! Content-based registration for sparse drawings.
//!
//! Line drawings with few distinct corners (a handful of rectangles on a
//! blank sheet) do not give the keypoint matcher enough unambiguous
//! correspondences. Here the ink itself is the evidence: a translation is
//! searched coarse to fine so that as much of the old page's content as
//! possible lands on content in the new page.

use image::{GrayImage, RgbImage};

use crate::config::AlignmentConfig;
use crate::error::AlignError;

use super::transform::{AlignmentMethod, AlignmentResult, Transform2D};

/// Pages with less content than this cannot be registered reliably.
pub const MIN_CONTENT_PIXELS: usize = 64;
/// Downsampling factors, coarsest first.
const FACTORS: [u32; 4] = [8, 4, 2, 1];
/// Search radius, in cells, around the estimate carried down from the coarser level.
const REFINE_RADIUS: i64 = 2;

/// Binary content map: `true` where a pixel is darker than the content threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ContentMask {
    width: u32,
    height: u32,
    cells: Vec<bool>,
}

impl ContentMask {
    fn from_gray(gray: &GrayImage, threshold: u8) -> Self {
        let (width, height) = gray.dimensions();
        Self {
            width,
            height,
            cells: gray.pixels().map(|p| p.0[0] < threshold).collect(),
        }
    }

    fn get(&self, x: i64, y: i64) -> bool {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return false;
        }
        self.cells[(y as u32 * self.width + x as u32) as usize]
    }

    fn count(&self) -> usize {
        self.cells.iter().filter(|&&c| c).count()
    }

    /// Max-pools `factor` x `factor` blocks, so thin lines survive.
    fn downsample(&self, factor: u32) -> Self {
        if factor <= 1 {
            return self.clone();
        }
        let width = self.width.div_ceil(factor);
        let height = self.height.div_ceil(factor);
        let mut cells = vec![false; (width * height) as usize];
        for y in 0..self.height {
            for x in 0..self.width {
                if self.cells[(y * self.width + x) as usize] {
                    cells[((y / factor) * width + x / factor) as usize] = true;
                }
            }
        }
        Self {
            width,
            height,
            cells,
        }
    }

    fn points(&self) -> Vec<(i64, i64)> {
        let mut points = Vec::new();
        for y in 0..self.height {
            for x in 0..self.width {
                if self.cells[(y * self.width + x) as usize] {
                    points.push((x as i64, y as i64));
                }
            }
        }
        points
    }
}

/// How many of `points`, shifted by `(dx, dy)`, land on content in `target`.
fn overlap(points: &[(i64, i64)], target: &ContentMask, dx: i64, dy: i64) -> usize {
    points
        .iter()
        .filter(|&&(x, y)| target.get(x + dx, y + dy))
        .count()
}

/// Best shift within `radius` of `center`. Ties go to the smaller shift.
fn search(
    points: &[(i64, i64)],
    target: &ContentMask,
    center: (i64, i64),
    radius: i64,
) -> ((i64, i64), usize) {
    let mut best = (center, overlap(points, target, center.0, center.1));
    for dy in center.1 - radius..=center.1 + radius {
        for dx in center.0 - radius..=center.0 + radius {
            let score = overlap(points, target, dx, dy);
            let better = score > best.1
                || (score == best.1 && dx.abs() + dy.abs() < best.0 .0.abs() + best.0 .1.abs());
            if better {
                best = ((dx, dy), score);
            }
        }
    }
    best
}

/// Estimates the translation that best puts the old page's content on the
/// new page's content. The inlier ratio is the fraction of old content
/// pixels that land on new content.
pub fn register_content(
    old: &GrayImage,
    new: &GrayImage,
    config: &AlignmentConfig,
    content_threshold: u8,
) -> Result<AlignmentResult, AlignError> {
    let old_mask = ContentMask::from_gray(old, content_threshold);
    let new_mask = ContentMask::from_gray(new, content_threshold);
    let found = old_mask.count().min(new_mask.count());
    if found < MIN_CONTENT_PIXELS {
        return Err(AlignError::InsufficientFeatures {
            found,
            required: MIN_CONTENT_PIXELS,
        });
    }

    let (width, height) = new.dimensions();
    let max_shift = (f64::from(width.max(height)) * config.max_registration_shift).ceil() as i64;

    let mut shift = (0_i64, 0_i64);
    let mut previous: Option<u32> = None;
    let mut score = 0;
    for factor in FACTORS {
        let old_level = old_mask.downsample(factor);
        let new_level = new_mask.downsample(factor);
        let radius = match previous {
            None => (max_shift + i64::from(factor) - 1) / i64::from(factor),
            Some(coarser) => {
                let step = i64::from(coarser / factor);
                shift = (shift.0 * step, shift.1 * step);
                REFINE_RADIUS
            }
        };
        let (best, best_score) = search(&old_level.points(), &new_level, shift, radius);
        shift = best;
        score = best_score;
        previous = Some(factor);
    }

    let total = old_mask.count();
    let ratio = score as f64 / total as f64;
    tracing::debug!(
        dx = shift.0,
        dy = shift.1,
        content_pixels = total,
        agreement = ratio,
        "Registered page content"
    );

    if ratio < config.min_inlier_ratio {
        return Err(AlignError::Alignment {
            inlier_ratio: ratio,
            threshold: config.min_inlier_ratio,
        });
    }

    Ok(AlignmentResult {
        transform: Transform2D::translation(shift.0 as f64, shift.1 as f64),
        inlier_ratio: ratio,
        correspondences: 0,
        inliers: 0,
        confidence: ratio,
        method: AlignmentMethod::Content,
    })
}

/// Searches integer translations within a few pixels of `start` at full
/// resolution. Used to settle a near-translation found by keypoints onto
/// the exact pixel grid. `None` when either page has too little content.
pub fn refine_translation(
    old: &GrayImage,
    new: &GrayImage,
    start: (f64, f64),
    content_threshold: u8,
) -> Option<AlignmentResult> {
    let old_mask = ContentMask::from_gray(old, content_threshold);
    let new_mask = ContentMask::from_gray(new, content_threshold);
    let total = old_mask.count();
    if total.min(new_mask.count()) < MIN_CONTENT_PIXELS {
        return None;
    }

    let center = (start.0.round() as i64, start.1.round() as i64);
    let (shift, score) = search(&old_mask.points(), &new_mask, center, REFINE_RADIUS);
    let ratio = score as f64 / total as f64;
    Some(AlignmentResult {
        transform: Transform2D::translation(shift.0 as f64, shift.1 as f64),
        inlier_ratio: ratio,
        correspondences: 0,
        inliers: 0,
        confidence: ratio,
        method: AlignmentMethod::Content,
    })
}

/// Fraction of the aligned old page's content that coincides with content
/// in the new page. `None` when the old page has too little content to
/// judge.
pub fn content_agreement(aligned_old: &RgbImage, new: &RgbImage, content_threshold: u8) -> Option<f64> {
    if aligned_old.dimensions() != new.dimensions() {
        return None;
    }
    let old_gray = image::imageops::grayscale(aligned_old);
    let new_gray = image::imageops::grayscale(new);

    let (mut content, mut shared) = (0_usize, 0_usize);
    for (old_pixel, new_pixel) in old_gray.pixels().zip(new_gray.pixels()) {
        if old_pixel.0[0] < content_threshold {
            content += 1;
            if new_pixel.0[0] < content_threshold {
                shared += 1;
            }
        }
    }
    (content >= MIN_CONTENT_PIXELS).then(|| shared as f64 / content as f64)
}
