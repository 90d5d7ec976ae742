//! Robust transform estimation and resampling.
//!
//! The fitted models never include shear: CAD revisions of the same sheet
//! are related by rotation, scale and translation only.

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::{AlignmentConfig, Resampling, TransformModel};
use crate::error::AlignError;

use super::keypoints::Correspondence;
use super::Point;

const RANSAC_SEED: u64 = 0x5EED_A11C_0000_0002;
/// Hypotheses whose scale falls outside this range are discarded.
const PLAUSIBLE_SCALE: (f64, f64) = (0.25, 4.0);
const EPSILON: f64 = 1e-9;

/// A 2x3 matrix mapping old-page coordinates into the new page:
/// `x' = a·x + b·y + tx`, `y' = c·x + d·y + ty`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform2D {
    pub a: f64,
    pub b: f64,
    pub tx: f64,
    pub c: f64,
    pub d: f64,
    pub ty: f64,
}

impl Transform2D {
    pub fn identity() -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            tx: 0.0,
            c: 0.0,
            d: 1.0,
            ty: 0.0,
        }
    }

    pub fn translation(tx: f64, ty: f64) -> Self {
        Self {
            tx,
            ty,
            ..Self::identity()
        }
    }

    pub fn similarity(scale: f64, rotation: f64, tx: f64, ty: f64) -> Self {
        let (sin, cos) = rotation.sin_cos();
        Self {
            a: scale * cos,
            b: -scale * sin,
            tx,
            c: scale * sin,
            d: scale * cos,
            ty,
        }
    }

    pub fn apply(&self, p: Point) -> Point {
        Point::new(
            self.a * p.x + self.b * p.y + self.tx,
            self.c * p.x + self.d * p.y + self.ty,
        )
    }

    pub fn determinant(&self) -> f64 {
        self.a * self.d - self.b * self.c
    }

    pub fn inverse(&self) -> Option<Self> {
        let det = self.determinant();
        if det.abs() < EPSILON {
            return None;
        }
        let a = self.d / det;
        let b = -self.b / det;
        let c = -self.c / det;
        let d = self.a / det;
        Some(Self {
            a,
            b,
            tx: -(a * self.tx + b * self.ty),
            c,
            d,
            ty: -(c * self.tx + d * self.ty),
        })
    }

    /// Rotation of the x axis, in radians.
    pub fn rotation(&self) -> f64 {
        self.c.atan2(self.a)
    }

    pub fn scale_x(&self) -> f64 {
        self.a.hypot(self.c)
    }

    pub fn scale_y(&self) -> f64 {
        self.b.hypot(self.d)
    }

    /// Cosine of the angle between the transformed axes; zero when there is no shear.
    pub fn shear(&self) -> f64 {
        let sx = self.scale_x();
        let sy = self.scale_y();
        if sx < EPSILON || sy < EPSILON {
            return 0.0;
        }
        (self.a * self.b + self.c * self.d) / (sx * sy)
    }

    fn is_identity(&self) -> bool {
        let id = Self::identity();
        (self.a - id.a).abs() < EPSILON
            && self.b.abs() < EPSILON
            && self.tx.abs() < EPSILON
            && self.c.abs() < EPSILON
            && (self.d - id.d).abs() < EPSILON
            && self.ty.abs() < EPSILON
    }

    fn residual_squared(&self, m: &Correspondence) -> f64 {
        self.apply(m.old).distance_squared(m.new)
    }
}

/// Evidence an alignment was derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentMethod {
    /// Matched keypoints fitted with RANSAC.
    #[default]
    Keypoints,
    /// Translation search over the page content masks.
    Content,
}

/// Output of a successful alignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentResult {
    pub transform: Transform2D,
    pub inlier_ratio: f64,
    /// Accepted correspondences the estimate was computed from.
    pub correspondences: usize,
    pub inliers: usize,
    /// `inlier_ratio` weighted by how many correspondences backed it, in [0, 1].
    /// Raised to the content agreement of the aligned pages when that is higher.
    pub confidence: f64,
    #[serde(default)]
    pub method: AlignmentMethod,
}

/// Fraction of `matches` that `transform` maps to within `threshold` pixels.
pub fn inlier_ratio(transform: &Transform2D, matches: &[Correspondence], threshold: f64) -> f64 {
    if matches.is_empty() {
        return 0.0;
    }
    count_inliers(transform, matches, threshold * threshold) as f64 / matches.len() as f64
}

fn count_inliers(transform: &Transform2D, matches: &[Correspondence], threshold_sq: f64) -> usize {
    matches
        .iter()
        .filter(|m| transform.residual_squared(m) <= threshold_sq)
        .count()
}

/// Fits the configured model to `matches` with RANSAC followed by a
/// least-squares refit on the consensus set.
pub fn estimate_transform(
    matches: &[Correspondence],
    config: &AlignmentConfig,
) -> Result<AlignmentResult, AlignError> {
    let required = config.min_matches.max(2);
    if matches.len() < required {
        return Err(AlignError::InsufficientFeatures {
            found: matches.len(),
            required,
        });
    }

    let threshold_sq = config.inlier_threshold_px * config.inlier_threshold_px;
    let (mut transform, mut inliers) = ransac(matches, config, threshold_sq)
        .ok_or(AlignError::DegenerateTransform)?;

    // Refit until the consensus set stops growing; two passes are almost always enough.
    for _ in 0..3 {
        let consensus: Vec<Correspondence> = matches
            .iter()
            .filter(|m| transform.residual_squared(m) <= threshold_sq)
            .copied()
            .collect();
        let refit = match config.model {
            TransformModel::Similarity => fit_similarity(&consensus),
            TransformModel::ScaledRotation => fit_scaled_rotation(&consensus),
        };
        let Some(refit) = refit else { break };
        let refit_inliers = count_inliers(&refit, matches, threshold_sq);
        if refit_inliers < inliers {
            break;
        }
        let grew = refit_inliers > inliers;
        transform = refit;
        inliers = refit_inliers;
        if !grew {
            break;
        }
    }

    let ratio = inliers as f64 / matches.len() as f64;
    tracing::debug!(
        correspondences = matches.len(),
        inliers,
        inlier_ratio = ratio,
        rotation = transform.rotation(),
        scale_x = transform.scale_x(),
        scale_y = transform.scale_y(),
        "Estimated transform"
    );

    if ratio < config.min_inlier_ratio {
        return Err(AlignError::Alignment {
            inlier_ratio: ratio,
            threshold: config.min_inlier_ratio,
        });
    }

    let saturation = config.confidence_saturation.max(1);
    let support = matches.len().min(saturation) as f64 / saturation as f64;

    Ok(AlignmentResult {
        transform,
        inlier_ratio: ratio,
        correspondences: matches.len(),
        inliers,
        confidence: (ratio * support).clamp(0.0, 1.0),
        method: AlignmentMethod::Keypoints,
    })
}

/// Minimal-sample hypotheses: two points for a similarity, three for a
/// scaled rotation.
fn ransac(
    matches: &[Correspondence],
    config: &AlignmentConfig,
    threshold_sq: f64,
) -> Option<(Transform2D, usize)> {
    let sample_size = match config.model {
        TransformModel::ScaledRotation if matches.len() >= 3 => 3,
        _ => 2,
    };
    let mut rng = StdRng::seed_from_u64(RANSAC_SEED);
    let mut best: Option<(Transform2D, usize)> = None;
    let plausible = |s: f64| (PLAUSIBLE_SCALE.0..=PLAUSIBLE_SCALE.1).contains(&s);

    for _ in 0..config.ransac_iterations.max(1) {
        let picked = index::sample(&mut rng, matches.len(), sample_size);
        let hypothesis = if sample_size == 2 {
            similarity_from_pair(&matches[picked.index(0)], &matches[picked.index(1)])
        } else {
            let sample: Vec<Correspondence> = picked.iter().map(|i| matches[i]).collect();
            fit_scaled_rotation(&sample)
        };
        let Some(hypothesis) = hypothesis else {
            continue;
        };
        if !plausible(hypothesis.scale_x()) || !plausible(hypothesis.scale_y()) {
            continue;
        }

        let count = count_inliers(&hypothesis, matches, threshold_sq);
        if best.as_ref().map_or(true, |(_, n)| count > *n) {
            best = Some((hypothesis, count));
            if count == matches.len() {
                break;
            }
        }
    }

    best
}

/// The unique similarity taking `p.old -> p.new` and `q.old -> q.new`.
fn similarity_from_pair(p: &Correspondence, q: &Correspondence) -> Option<Transform2D> {
    // Treat points as complex numbers: z = (q' - p') / (q - p) = s·e^{iθ}.
    let (ux, uy) = (q.old.x - p.old.x, q.old.y - p.old.y);
    let (vx, vy) = (q.new.x - p.new.x, q.new.y - p.new.y);
    let norm = ux * ux + uy * uy;
    if norm < EPSILON {
        return None;
    }
    let a = (vx * ux + vy * uy) / norm;
    let c = (vy * ux - vx * uy) / norm;
    Some(Transform2D {
        a,
        b: -c,
        tx: p.new.x - (a * p.old.x - c * p.old.y),
        c,
        d: a,
        ty: p.new.y - (c * p.old.x + a * p.old.y),
    })
}

fn centroids(matches: &[Correspondence]) -> (Point, Point) {
    let n = matches.len() as f64;
    let (mut ox, mut oy, mut nx, mut ny) = (0.0, 0.0, 0.0, 0.0);
    for m in matches {
        ox += m.old.x;
        oy += m.old.y;
        nx += m.new.x;
        ny += m.new.y;
    }
    (Point::new(ox / n, oy / n), Point::new(nx / n, ny / n))
}

/// Least-squares similarity (closed form, 2D Umeyama without reflection).
fn fit_similarity(matches: &[Correspondence]) -> Option<Transform2D> {
    if matches.len() < 2 {
        return None;
    }
    let (mo, mn) = centroids(matches);
    let (mut dot, mut cross, mut var) = (0.0, 0.0, 0.0);
    for m in matches {
        let (px, py) = (m.old.x - mo.x, m.old.y - mo.y);
        let (qx, qy) = (m.new.x - mn.x, m.new.y - mn.y);
        dot += px * qx + py * qy;
        cross += px * qy - py * qx;
        var += px * px + py * py;
    }
    if var < EPSILON {
        return None;
    }
    let a = dot / var;
    let c = cross / var;
    Some(Transform2D {
        a,
        b: -c,
        tx: mn.x - (a * mo.x - c * mo.y),
        c,
        d: a,
        ty: mn.y - (c * mo.x + a * mo.y),
    })
}

/// Least-squares affine fit with the shear projected out, leaving rotation
/// and independent axis scales.
fn fit_scaled_rotation(matches: &[Correspondence]) -> Option<Transform2D> {
    if matches.len() < 3 {
        return fit_similarity(matches);
    }
    let (mo, mn) = centroids(matches);
    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    let (mut bx_x, mut bx_y, mut by_x, mut by_y) = (0.0, 0.0, 0.0, 0.0);
    for m in matches {
        let (px, py) = (m.old.x - mo.x, m.old.y - mo.y);
        let (qx, qy) = (m.new.x - mn.x, m.new.y - mn.y);
        sxx += px * px;
        sxy += px * py;
        syy += py * py;
        bx_x += px * qx;
        bx_y += py * qx;
        by_x += px * qy;
        by_y += py * qy;
    }
    let det = sxx * syy - sxy * sxy;
    if det.abs() < EPSILON {
        return None;
    }
    let a = (syy * bx_x - sxy * bx_y) / det;
    let b = (sxx * bx_y - sxy * bx_x) / det;
    let c = (syy * by_x - sxy * by_y) / det;
    let d = (sxx * by_y - sxy * by_x) / det;

    // Gram-Schmidt on the columns: keep the x axis, force the y axis orthogonal.
    let sx = a.hypot(c);
    if sx < EPSILON {
        return None;
    }
    let (ux, uy) = (a / sx, c / sx);
    let (vx, vy) = (-uy, ux);
    let sy = b * vx + d * vy;
    if sy <= EPSILON {
        return None;
    }

    let (a, c, b, d) = (ux * sx, uy * sx, vx * sy, vy * sy);
    Some(Transform2D {
        a,
        b,
        tx: mn.x - (a * mo.x + b * mo.y),
        c,
        d,
        ty: mn.y - (c * mo.x + d * mo.y),
    })
}

/// Resamples `old` into a `width` x `height` grid using `transform`
/// (old -> new coordinates). Pixels with no source are white.
pub fn warp_to(
    old: &RgbImage,
    transform: &Transform2D,
    width: u32,
    height: u32,
    resampling: Resampling,
) -> Result<RgbImage, AlignError> {
    let white = Rgb([255, 255, 255]);

    if transform.is_identity() && old.dimensions() == (width, height) {
        return Ok(old.clone());
    }

    let matrix = [
        transform.a as f32,
        transform.b as f32,
        transform.tx as f32,
        transform.c as f32,
        transform.d as f32,
        transform.ty as f32,
        0.0,
        0.0,
        1.0,
    ];
    let projection = Projection::from_matrix(matrix).ok_or(AlignError::DegenerateTransform)?;
    let interpolation = match resampling {
        Resampling::Nearest => Interpolation::Nearest,
        Resampling::Bilinear => Interpolation::Bilinear,
    };

    let mut out = RgbImage::from_pixel(width, height, white);
    warp_into(old, &projection, interpolation, white, &mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn correspondence(old: Point, new: Point) -> Correspondence {
        Correspondence { old, new, distance: 0 }
    }

    fn synthetic(truth: &Transform2D, count: usize, seed: u64) -> Vec<Correspondence> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let p = Point::new(rng.gen_range(100.0..700.0), rng.gen_range(100.0..500.0));
                correspondence(p, truth.apply(p))
            })
            .collect()
    }

    fn outliers(truth: &Transform2D, count: usize, seed: u64) -> Vec<Correspondence> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let p = Point::new(rng.gen_range(100.0..700.0), rng.gen_range(100.0..500.0));
                let q = truth.apply(p);
                let offset = rng.gen_range(50.0..150.0);
                correspondence(p, Point::new(q.x + offset, q.y - offset))
            })
            .collect()
    }

    fn assert_close(actual: f64, expected: f64, tolerance: f64) {
        assert!(
            (actual - expected).abs() <= tolerance,
            "expected {} +- {}, got {}",
            expected,
            tolerance,
            actual
        );
    }

    #[test]
    fn test_inverse_round_trip() {
        let t = Transform2D::similarity(1.3, 0.2, 15.0, -4.0);
        let inv = t.inverse().unwrap();
        let p = Point::new(123.0, 45.0);
        let back = inv.apply(t.apply(p));
        assert!(back.distance_squared(p) < 1e-12);
    }

    #[test]
    fn test_singular_transform_has_no_inverse() {
        let t = Transform2D {
            a: 1.0,
            b: 2.0,
            tx: 0.0,
            c: 2.0,
            d: 4.0,
            ty: 0.0,
        };
        assert!(t.inverse().is_none());
    }

    #[test]
    fn test_similarity_from_pair_is_exact() {
        let truth = Transform2D::similarity(0.9, -0.4, 30.0, 12.0);
        let p = Point::new(10.0, 20.0);
        let q = Point::new(200.0, 90.0);
        let fitted = similarity_from_pair(
            &correspondence(p, truth.apply(p)),
            &correspondence(q, truth.apply(q)),
        )
        .unwrap();
        assert_close(fitted.a, truth.a, 1e-9);
        assert_close(fitted.c, truth.c, 1e-9);
        assert_close(fitted.tx, truth.tx, 1e-9);
        assert_close(fitted.ty, truth.ty, 1e-9);
    }

    #[test]
    fn test_recovers_similarity_despite_outliers() {
        let truth = Transform2D::similarity(1.02, 3f64.to_radians(), 12.0, -7.0);
        let mut matches = synthetic(&truth, 30, 1);
        matches.extend(outliers(&truth, 10, 2));

        let result = estimate_transform(&matches, &AlignmentConfig::default()).unwrap();
        assert_eq!(result.inliers, 30);
        assert_close(result.inlier_ratio, 0.75, 1e-12);
        assert_close(result.transform.scale_x(), 1.02, 1e-6);
        assert_close(result.transform.rotation(), 3f64.to_radians(), 1e-6);
        assert_close(result.transform.tx, 12.0, 1e-4);
        assert_close(result.transform.ty, -7.0, 1e-4);
        assert_close(result.confidence, 0.75, 1e-12);
    }

    #[test]
    fn test_identity_alignment_has_full_confidence() {
        let matches = synthetic(&Transform2D::identity(), 40, 3);
        let result = estimate_transform(&matches, &AlignmentConfig::default()).unwrap();
        assert_eq!(result.inlier_ratio, 1.0);
        assert_close(result.confidence, 1.0, 1e-12);
        assert_close(result.transform.a, 1.0, 1e-9);
        assert_close(result.transform.tx, 0.0, 1e-6);
    }

    #[test]
    fn test_confidence_scales_with_support_below_saturation() {
        let matches = synthetic(&Transform2D::identity(), 10, 4);
        let result = estimate_transform(&matches, &AlignmentConfig::default()).unwrap();
        assert_close(result.confidence, 10.0 / 25.0, 1e-12);
    }

    #[test]
    fn test_adding_valid_correspondences_never_lowers_inlier_ratio() {
        let truth = Transform2D::similarity(1.1, 0.05, -20.0, 8.0);
        let mut matches = outliers(&truth, 6, 5);
        matches.extend(synthetic(&truth, 6, 6));

        let mut previous = inlier_ratio(&truth, &matches, 3.0);
        for extra in synthetic(&truth, 20, 7) {
            matches.push(extra);
            let ratio = inlier_ratio(&truth, &matches, 3.0);
            assert!(ratio >= previous, "{} dropped below {}", ratio, previous);
            previous = ratio;
        }
    }

    #[test]
    fn test_low_inlier_ratio_is_alignment_error() {
        let truth = Transform2D::identity();
        let mut matches = synthetic(&truth, 4, 8);
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..16 {
            let p = Point::new(rng.gen_range(0.0..800.0), rng.gen_range(0.0..600.0));
            let q = Point::new(rng.gen_range(0.0..800.0), rng.gen_range(0.0..600.0));
            matches.push(correspondence(p, q));
        }

        match estimate_transform(&matches, &AlignmentConfig::default()) {
            Err(AlignError::Alignment {
                inlier_ratio,
                threshold,
            }) => {
                assert!(inlier_ratio < 0.5);
                assert_eq!(threshold, 0.5);
            }
            other => panic!("Expected Alignment error, got {:?}", other),
        }
    }

    #[test]
    fn test_too_few_matches() {
        let matches = synthetic(&Transform2D::identity(), 3, 10);
        assert_eq!(
            estimate_transform(&matches, &AlignmentConfig::default()).unwrap_err(),
            AlignError::InsufficientFeatures {
                found: 3,
                required: 4
            }
        );
    }

    #[test]
    fn test_coincident_points_are_degenerate() {
        let p = Point::new(50.0, 50.0);
        let matches = vec![correspondence(p, p); 6];
        assert_eq!(
            estimate_transform(&matches, &AlignmentConfig::default()).unwrap_err(),
            AlignError::DegenerateTransform
        );
    }

    #[test]
    fn test_scaled_rotation_recovers_axis_scales_without_shear() {
        let (sin, cos) = 0.1f64.sin_cos();
        let (sx, sy) = (1.05, 0.97);
        let truth = Transform2D {
            a: cos * sx,
            b: -sin * sy,
            tx: 4.0,
            c: sin * sx,
            d: cos * sy,
            ty: -9.0,
        };
        let matches = synthetic(&truth, 30, 11);
        let config = AlignmentConfig {
            model: TransformModel::ScaledRotation,
            ..AlignmentConfig::default()
        };

        let result = estimate_transform(&matches, &config).unwrap();
        assert_eq!(result.inliers, 30);
        assert_close(result.transform.scale_x(), sx, 1e-6);
        assert_close(result.transform.scale_y(), sy, 1e-6);
        assert_close(result.transform.rotation(), 0.1, 1e-6);
        assert_close(result.transform.shear(), 0.0, 1e-9);
    }

    #[test]
    fn test_scaled_rotation_projects_out_shear() {
        let sheared = Transform2D {
            a: 1.0,
            b: 0.2,
            tx: 0.0,
            c: 0.0,
            d: 1.0,
            ty: 0.0,
        };
        let fitted = fit_scaled_rotation(&synthetic(&sheared, 20, 12)).unwrap();
        assert_close(fitted.shear(), 0.0, 1e-9);
    }

    #[test]
    fn test_warp_identity_is_copy() {
        let mut img = RgbImage::from_pixel(20, 10, Rgb([255, 255, 255]));
        img.put_pixel(3, 4, Rgb([0, 0, 0]));
        let out = warp_to(&img, &Transform2D::identity(), 20, 10, Resampling::Bilinear).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn test_warp_translation_fills_white() {
        let img = RgbImage::from_pixel(20, 20, Rgb([0, 0, 0]));
        let t = Transform2D {
            tx: 5.0,
            ty: 3.0,
            ..Transform2D::identity()
        };
        let out = warp_to(&img, &t, 30, 25, Resampling::Nearest).unwrap();
        assert_eq!(out.dimensions(), (30, 25));
        assert_eq!(out.get_pixel(10, 10).0, [0, 0, 0]);
        assert_eq!(out.get_pixel(2, 1).0, [255, 255, 255]);
        assert_eq!(out.get_pixel(28, 24).0, [255, 255, 255]);
    }
}
