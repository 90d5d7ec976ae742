//! Keypoint detection and descriptor matching.
//!
//! FAST-9 corners are detected on a small image pyramid (scale) and
//! described by a rotated 256-bit binary test pattern steered by the
//! intensity-centroid orientation (rotation). Detection is confined to the
//! central part of the page: title blocks and revision clouds near the
//! borders change between revisions and produce false matches.

use std::cmp::Ordering;
use std::sync::OnceLock;

use image::imageops::FilterType;
use image::GrayImage;
use imageproc::corners::{corners_fast9, Corner};
use imageproc::filter::gaussian_blur_f32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::AlignmentConfig;
use crate::error::AlignError;

use super::Point;

/// Distance from a keypoint to the nearest pixel its descriptor may sample.
const PATCH_BORDER: u32 = 16;
/// Radius of the descriptor sampling disc; rotation keeps samples inside `PATCH_BORDER`.
const PATTERN_RADIUS: i32 = 13;
/// Radius used for the orientation moment.
const ORIENTATION_RADIUS: i32 = 12;
const DESCRIPTOR_BITS: usize = 256;
const PATTERN_SEED: u64 = 0x0D1F_F5EE_D000_0001;
const SMOOTHING_SIGMA: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    /// Position in level-0 pixels.
    pub position: Point,
    pub level: u32,
    /// Orientation in radians.
    pub angle: f32,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(pub [u64; 4]);

impl Descriptor {
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Keypoints and their descriptors, index-aligned.
#[derive(Debug, Clone, Default)]
pub struct Features {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl Features {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// An accepted match between a keypoint in the old page and one in the new page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub old: Point,
    pub new: Point,
    pub distance: u32,
}

type TestPair = ((f32, f32), (f32, f32));

fn sampling_pattern() -> &'static [TestPair] {
    static PATTERN: OnceLock<Vec<TestPair>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let sample = |rng: &mut StdRng| loop {
            let x = rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
            let y = rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
            if x * x + y * y <= PATTERN_RADIUS * PATTERN_RADIUS {
                return (x as f32, y as f32);
            }
        };
        (0..DESCRIPTOR_BITS)
            .map(|_| (sample(&mut rng), sample(&mut rng)))
            .collect()
    })
}

/// Detects up to `config.max_keypoints` keypoints inside the central region.
pub fn detect_features(gray: &GrayImage, config: &AlignmentConfig) -> Features {
    let (width, height) = gray.dimensions();
    let margin = config.border_margin;
    let x_range = (width as f64 * margin, width as f64 * (1.0 - margin));
    let y_range = (height as f64 * margin, height as f64 * (1.0 - margin));

    let mut candidates: Vec<(Keypoint, Descriptor)> = Vec::new();
    let mut scale = 1.0_f64;

    for level in 0..config.pyramid_levels.max(1) {
        let level_image = if level == 0 {
            gray.clone()
        } else {
            scale *= config.pyramid_scale;
            let w = (width as f64 * scale).round() as u32;
            let h = (height as f64 * scale).round() as u32;
            if w <= 2 * PATCH_BORDER || h <= 2 * PATCH_BORDER {
                break;
            }
            image::imageops::resize(gray, w, h, FilterType::Triangle)
        };
        let (lw, lh) = level_image.dimensions();
        if lw <= 2 * PATCH_BORDER || lh <= 2 * PATCH_BORDER {
            break;
        }

        let smoothed = gaussian_blur_f32(&level_image, SMOOTHING_SIGMA);
        let corners = suppress_non_maxima(corners_fast9(&level_image, config.fast_threshold));

        for corner in corners {
            if corner.x < PATCH_BORDER
                || corner.y < PATCH_BORDER
                || corner.x + PATCH_BORDER >= lw
                || corner.y + PATCH_BORDER >= lh
            {
                continue;
            }

            let position = Point::new(corner.x as f64 / scale, corner.y as f64 / scale);
            if position.x < x_range.0
                || position.x > x_range.1
                || position.y < y_range.0
                || position.y > y_range.1
            {
                continue;
            }

            let angle = orientation(&smoothed, corner.x, corner.y);
            let descriptor = describe(&smoothed, corner.x, corner.y, angle);
            candidates.push((
                Keypoint {
                    position,
                    level,
                    angle,
                    score: corner.score,
                },
                descriptor,
            ));
        }
    }

    candidates.sort_by(|(a, _), (b, _)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.level.cmp(&b.level))
            .then(a.position.y.total_cmp(&b.position.y))
            .then(a.position.x.total_cmp(&b.position.x))
    });
    candidates.truncate(config.max_keypoints);

    let (keypoints, descriptors) = candidates.into_iter().unzip();
    Features {
        keypoints,
        descriptors,
    }
}

/// Keeps a corner only if no 8-neighbour scores higher. Equal scores are
/// broken by raster order so that exactly one of a plateau survives.
fn suppress_non_maxima(mut corners: Vec<Corner>) -> Vec<Corner> {
    corners.sort_by(|a, b| (a.y, a.x).cmp(&(b.y, b.x)));
    let index_of = |x: u32, y: u32| {
        corners
            .binary_search_by(|c| (c.y, c.x).cmp(&(y, x)))
            .ok()
    };

    let mut kept = Vec::with_capacity(corners.len());
    'corners: for (i, corner) in corners.iter().enumerate() {
        for dy in -1_i64..=1 {
            for dx in -1_i64..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let nx = corner.x as i64 + dx;
                let ny = corner.y as i64 + dy;
                if nx < 0 || ny < 0 {
                    continue;
                }
                if let Some(j) = index_of(nx as u32, ny as u32) {
                    let other = &corners[j];
                    if other.score > corner.score || (other.score == corner.score && j < i) {
                        continue 'corners;
                    }
                }
            }
        }
        kept.push(*corner);
    }
    kept
}

/// Intensity-centroid orientation of the ink (dark pixels) around a corner.
fn orientation(image: &GrayImage, cx: u32, cy: u32) -> f32 {
    let mut m10 = 0.0_f64;
    let mut m01 = 0.0_f64;
    let r2 = ORIENTATION_RADIUS * ORIENTATION_RADIUS;
    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let x = (cx as i32 + dx) as u32;
            let y = (cy as i32 + dy) as u32;
            let ink = 255.0 - f64::from(image.get_pixel(x, y).0[0]);
            m10 += dx as f64 * ink;
            m01 += dy as f64 * ink;
        }
    }
    if m10 == 0.0 && m01 == 0.0 {
        0.0
    } else {
        m01.atan2(m10) as f32
    }
}

fn describe(smoothed: &GrayImage, cx: u32, cy: u32, angle: f32) -> Descriptor {
    let (sin, cos) = angle.sin_cos();
    let sample = |(px, py): (f32, f32)| {
        let rx = (px * cos - py * sin).round() as i32;
        let ry = (px * sin + py * cos).round() as i32;
        let x = (cx as i32 + rx) as u32;
        let y = (cy as i32 + ry) as u32;
        smoothed.get_pixel(x, y).0[0]
    };

    let mut bits = [0_u64; 4];
    for (i, &(p, q)) in sampling_pattern().iter().enumerate() {
        if sample(p) < sample(q) {
            bits[i / 64] |= 1 << (i % 64);
        }
    }
    Descriptor(bits)
}

/// Nearest-descriptor matching filtered by the ratio test.
///
/// A match is kept only when its distance is below `ratio` times the
/// distance of the second-best candidate. When several old keypoints pick
/// the same new keypoint, only the closest one survives.
pub fn match_features(old: &Features, new: &Features, ratio: f64) -> Vec<Correspondence> {
    if new.descriptors.len() < 2 {
        return Vec::new();
    }

    // new index -> (old index, distance)
    let mut best_for_new: Vec<Option<(usize, u32)>> = vec![None; new.descriptors.len()];

    for (i, descriptor) in old.descriptors.iter().enumerate() {
        let mut best = (u32::MAX, usize::MAX);
        let mut second = u32::MAX;
        for (j, candidate) in new.descriptors.iter().enumerate() {
            let distance = descriptor.distance(candidate);
            if distance < best.0 {
                second = best.0;
                best = (distance, j);
            } else if distance < second {
                second = distance;
            }
        }

        if (best.0 as f64) >= ratio * second as f64 {
            continue;
        }

        let slot = &mut best_for_new[best.1];
        match slot {
            Some((_, existing)) if *existing <= best.0 => {}
            _ => *slot = Some((i, best.0)),
        }
    }

    let mut matches: Vec<Correspondence> = best_for_new
        .iter()
        .enumerate()
        .filter_map(|(j, slot)| {
            slot.map(|(i, distance)| Correspondence {
                old: old.keypoints[i].position,
                new: new.keypoints[j].position,
                distance,
            })
        })
        .collect();
    matches.sort_by(|a, b| {
        a.distance
            .cmp(&b.distance)
            .then(a.old.y.total_cmp(&b.old.y))
            .then(a.old.x.total_cmp(&b.old.x))
    });
    matches
}

/// Detects and matches keypoints between two pages.
pub fn match_pages(
    old: &GrayImage,
    new: &GrayImage,
    config: &AlignmentConfig,
) -> Result<Vec<Correspondence>, AlignError> {
    let old_features = detect_features(old, config);
    let new_features = detect_features(new, config);
    tracing::debug!(
        old_keypoints = old_features.len(),
        new_keypoints = new_features.len(),
        "Detected keypoints"
    );

    let matches = match_features(&old_features, &new_features, config.ratio_test);
    if matches.len() < config.min_matches {
        return Err(AlignError::InsufficientFeatures {
            found: matches.len(),
            required: config.min_matches,
        });
    }
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::fixtures::{blank_page, scatter_blobs, shifted};

    fn config() -> AlignmentConfig {
        AlignmentConfig::default()
    }

    fn feature(x: f64, y: f64, descriptor: [u64; 4]) -> (Keypoint, Descriptor) {
        (
            Keypoint {
                position: Point::new(x, y),
                level: 0,
                angle: 0.0,
                score: 1.0,
            },
            Descriptor(descriptor),
        )
    }

    fn features(items: Vec<(Keypoint, Descriptor)>) -> Features {
        let (keypoints, descriptors) = items.into_iter().unzip();
        Features {
            keypoints,
            descriptors,
        }
    }

    #[test]
    fn test_descriptor_distance() {
        let a = Descriptor([0, 0, 0, 0]);
        let b = Descriptor([0b1011, 0, u64::MAX, 0]);
        assert_eq!(a.distance(&a), 0);
        assert_eq!(a.distance(&b), 3 + 64);
        assert_eq!(b.distance(&a), a.distance(&b));
    }

    #[test]
    fn test_sampling_pattern_is_stable_and_bounded() {
        let pattern = sampling_pattern();
        assert_eq!(pattern.len(), DESCRIPTOR_BITS);
        let limit = (PATTERN_RADIUS * PATTERN_RADIUS) as f32;
        for ((px, py), (qx, qy)) in pattern {
            assert!(px * px + py * py <= limit);
            assert!(qx * qx + qy * qy <= limit);
        }
        assert_eq!(pattern.as_ptr(), sampling_pattern().as_ptr());
    }

    #[test]
    fn test_ratio_test_rejects_ambiguous_match() {
        let old = features(vec![feature(10.0, 10.0, [0xFF, 0, 0, 0])]);
        let new = features(vec![
            feature(10.0, 10.0, [0xFF, 0, 0, 0]),
            feature(50.0, 50.0, [0xFF, 0, 0, 0]),
        ]);
        assert!(match_features(&old, &new, 0.75).is_empty());
    }

    #[test]
    fn test_ratio_test_accepts_distinct_match() {
        let old = features(vec![feature(10.0, 10.0, [0xFF, 0, 0, 0])]);
        let new = features(vec![
            feature(12.0, 11.0, [0xFE, 0, 0, 0]),
            feature(50.0, 50.0, [0, u64::MAX, 0, 0]),
        ]);
        let matches = match_features(&old, &new, 0.75);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].new, Point::new(12.0, 11.0));
        assert_eq!(matches[0].distance, 1);
    }

    #[test]
    fn test_single_candidate_is_not_matched() {
        let old = features(vec![feature(10.0, 10.0, [1, 0, 0, 0])]);
        let new = features(vec![feature(10.0, 10.0, [1, 0, 0, 0])]);
        assert!(match_features(&old, &new, 0.75).is_empty());
    }

    #[test]
    fn test_blank_page_has_no_features() {
        let page = blank_page(200, 200);
        assert!(detect_features(&page, &config()).is_empty());

        let result = match_pages(&page, &page, &config());
        assert_eq!(
            result.unwrap_err(),
            AlignError::InsufficientFeatures {
                found: 0,
                required: 4
            }
        );
    }

    #[test]
    fn test_keypoints_stay_inside_central_region() {
        let mut page = blank_page(400, 300);
        scatter_blobs(&mut page, (0, 0, 400, 300), 300, 11);

        let features = detect_features(&page, &config());
        assert!(!features.is_empty());
        for kp in &features.keypoints {
            assert!(kp.position.x >= 80.0 && kp.position.x <= 320.0);
            assert!(kp.position.y >= 60.0 && kp.position.y <= 240.0);
        }
    }

    #[test]
    fn test_keypoint_cap() {
        let mut page = blank_page(400, 300);
        scatter_blobs(&mut page, (80, 60, 320, 240), 200, 3);

        let capped = AlignmentConfig {
            max_keypoints: 10,
            ..config()
        };
        assert!(detect_features(&page, &capped).len() <= 10);
    }

    #[test]
    fn test_identical_pages_match_in_place() {
        let mut page = blank_page(400, 300);
        scatter_blobs(&mut page, (100, 80, 300, 220), 120, 7);

        let matches = match_pages(&page, &page, &config()).unwrap();
        assert!(matches.len() >= 4);
        for m in &matches {
            assert_eq!(m.distance, 0);
            assert!(m.old.distance_squared(m.new) < 1e-9);
        }
    }

    #[test]
    fn test_translated_page_matches_follow_shift() {
        let mut page = blank_page(400, 300);
        scatter_blobs(&mut page, (100, 80, 300, 220), 120, 21);
        let moved = shifted(&page, 7, -4);

        let matches = match_pages(&page, &moved, &config()).unwrap();
        let consistent = matches
            .iter()
            .filter(|m| {
                (m.new.x - m.old.x - 7.0).abs() <= 2.0 && (m.new.y - m.old.y + 4.0).abs() <= 2.0
            })
            .count();
        assert!(consistent >= 4, "only {} consistent matches", consistent);
    }

    #[test]
    fn test_detection_is_deterministic() {
        let mut page = blank_page(300, 300);
        scatter_blobs(&mut page, (60, 60, 240, 240), 80, 5);

        let a = detect_features(&page, &config());
        let b = detect_features(&page, &config());
        assert_eq!(a.descriptors, b.descriptors);
        assert_eq!(a.keypoints, b.keypoints);
    }
}
