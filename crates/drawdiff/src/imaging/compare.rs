//! Alignment and diff of one page pair.

use image::RgbImage;

use crate::config::{AlignmentConfig, OverlayConfig};
use crate::error::AlignError;

use super::keypoints::match_pages;
use super::loader::LoadedPage;
use super::overlay::{generate_overlay, OverlayOutput};
use super::registration::{content_agreement, refine_translation, register_content};
use super::transform::{estimate_transform, warp_to, AlignmentMethod, AlignmentResult, Transform2D};

/// Everything the alignment+diff step produces for a page pair.
#[derive(Debug, Clone)]
pub struct Comparison {
    pub alignment: AlignmentResult,
    /// The old page resampled into the new page's pixel grid.
    pub aligned_old: RgbImage,
    pub overlay: OverlayOutput,
}

/// Aligns `old` onto `new` and classifies the differences.
///
/// Keypoints are tried first. When they are too few or inconsistent, the
/// page content is registered directly instead. Either way the confidence
/// is raised to the content agreement of the aligned pages when that is
/// higher, so sparse drawings that overlap exactly are not penalised for
/// having few corners.
pub fn compare_pages(
    old: &LoadedPage,
    new: &LoadedPage,
    alignment: &AlignmentConfig,
    overlay: &OverlayConfig,
) -> Result<Comparison, AlignError> {
    let mut result = match align_keypoints(old, new, alignment) {
        Ok(result) => result,
        Err(
            e @ (AlignError::InsufficientFeatures { .. }
            | AlignError::Alignment { .. }
            | AlignError::DegenerateTransform),
        ) => {
            let _span = tracing::info_span!("register_content").entered();
            tracing::debug!("Keypoint alignment failed ({}); registering content", e);
            // Report the keypoint failure when the content gives no answer either.
            register_content(&old.gray, &new.gray, alignment, overlay.content_threshold)
                .map_err(|_| e)?
        }
        Err(e) => return Err(e),
    };

    let (width, height) = new.dimensions();
    let mut aligned_old = {
        let _span = tracing::info_span!("warp").entered();
        warp_to(&old.rgb, &result.transform, width, height, alignment.resampling)?
    };
    let mut agreement = content_agreement(&aligned_old, &new.rgb, overlay.content_threshold);

    if let (AlignmentMethod::Keypoints, Some(current)) = (result.method, agreement) {
        let candidate = if current < RECHECK_AGREEMENT {
            let _span = tracing::info_span!("register_content").entered();
            register_content(&old.gray, &new.gray, alignment, overlay.content_threshold).ok()
        } else if current < 1.0 && is_near_translation(&result.transform) {
            refine_translation(
                &old.gray,
                &new.gray,
                (result.transform.tx, result.transform.ty),
                overlay.content_threshold,
            )
        } else {
            None
        };
        if let Some(candidate) = candidate.filter(|c| c.inlier_ratio > current) {
            tracing::debug!(
                keypoint_agreement = current,
                content_agreement = candidate.inlier_ratio,
                "Content registration agrees better than keypoints"
            );
            aligned_old = warp_to(&old.rgb, &candidate.transform, width, height, alignment.resampling)?;
            agreement = content_agreement(&aligned_old, &new.rgb, overlay.content_threshold);
            result = candidate;
        }
    }

    if let Some(agreement) = agreement {
        result.confidence = result.confidence.max(agreement).clamp(0.0, 1.0);
    }

    let overlay = {
        let _span = tracing::info_span!("generate_overlay").entered();
        generate_overlay(&aligned_old, &new.rgb, overlay)?
    };

    tracing::info!(
        confidence = result.confidence,
        inlier_ratio = result.inlier_ratio,
        method = ?result.method,
        change_count = overlay.stats.change_count,
        "Compared pages"
    );

    Ok(Comparison {
        alignment: result,
        aligned_old,
        overlay,
    })
}

/// Below this content agreement a keypoint alignment is checked against a
/// full content registration.
const RECHECK_AGREEMENT: f64 = 0.95;

fn is_near_translation(t: &Transform2D) -> bool {
    const TOLERANCE: f64 = 1e-2;
    (t.a - 1.0).abs() < TOLERANCE
        && t.b.abs() < TOLERANCE
        && t.c.abs() < TOLERANCE
        && (t.d - 1.0).abs() < TOLERANCE
}

fn align_keypoints(
    old: &LoadedPage,
    new: &LoadedPage,
    alignment: &AlignmentConfig,
) -> Result<AlignmentResult, AlignError> {
    let matches = {
        let _span = tracing::info_span!("match_keypoints").entered();
        match_pages(&old.gray, &new.gray, alignment)?
    };

    let _span = tracing::info_span!("estimate_transform", matches = matches.len()).entered();
    estimate_transform(&matches, alignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::fixtures::{blank_page, fill_rect, scatter_blobs, shifted, to_rgb};
    use crate::imaging::PixelClass;

    fn drawing() -> image::GrayImage {
        let mut page = blank_page(400, 300);
        scatter_blobs(&mut page, (100, 80, 220, 220), 90, 17);
        page
    }

    #[test]
    fn test_added_rectangle_is_one_change() {
        let old = drawing();
        let mut new = old.clone();
        fill_rect(&mut new, (250, 100, 300, 150), 0);

        let comparison = compare_pages(
            &LoadedPage::from_rgb(to_rgb(&old)),
            &LoadedPage::from_rgb(to_rgb(&new)),
            &AlignmentConfig::default(),
            &OverlayConfig::default(),
        )
        .unwrap();

        assert!(comparison.alignment.confidence > 0.9);
        let stats = &comparison.overlay.stats;
        assert_eq!(stats.change_count, 1);
        assert_eq!(stats.regions[0].added_pixels, 2500);
        assert_eq!(stats.totals.removed_pixels, 0);
        assert_eq!(comparison.overlay.mask.get(275, 125), PixelClass::Added);
    }

    #[test]
    fn test_translated_revision_is_aligned() {
        let old = drawing();
        let new = shifted(&old, 6, 4);

        let comparison = compare_pages(
            &LoadedPage::from_rgb(to_rgb(&old)),
            &LoadedPage::from_rgb(to_rgb(&new)),
            &AlignmentConfig::default(),
            &OverlayConfig::default(),
        )
        .unwrap();

        let t = comparison.alignment.transform;
        assert!((t.tx - 6.0).abs() < 1.0, "tx = {}", t.tx);
        assert!((t.ty - 4.0).abs() < 1.0, "ty = {}", t.ty);
        assert!((t.scale_x() - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_two_rectangle_revision_aligns_with_full_confidence() {
        let mut old = blank_page(800, 600);
        fill_rect(&mut old, (250, 200, 380, 300), 0);
        let mut new = old.clone();
        fill_rect(&mut new, (450, 320, 560, 420), 0);

        let comparison = compare_pages(
            &LoadedPage::from_rgb(to_rgb(&old)),
            &LoadedPage::from_rgb(to_rgb(&new)),
            &AlignmentConfig::default(),
            &OverlayConfig::default(),
        )
        .unwrap();

        let t = comparison.alignment.transform;
        assert!(t.tx.abs() < 0.5 && t.ty.abs() < 0.5, "transform = {:?}", t);
        assert!((t.scale_x() - 1.0).abs() < 0.01);
        assert!(comparison.alignment.confidence > 0.99);
        let stats = &comparison.overlay.stats;
        assert!(stats.changes_detected);
        assert_eq!(stats.change_count, 1);
        assert_eq!(stats.regions[0].added_pixels, 110 * 100);
        assert_eq!(stats.totals.removed_pixels, 0);
        assert_eq!(comparison.overlay.mask.get(500, 370), PixelClass::Added);
        assert_eq!(comparison.overlay.mask.get(300, 250), PixelClass::Unchanged);
    }

    #[test]
    fn test_outlined_rectangles_align_with_full_confidence() {
        let outline = |page: &mut image::GrayImage, (x0, y0, x1, y1): (u32, u32, u32, u32)| {
            fill_rect(page, (x0, y0, x1, y0 + 3), 0);
            fill_rect(page, (x0, y1 - 3, x1, y1), 0);
            fill_rect(page, (x0, y0, x0 + 3, y1), 0);
            fill_rect(page, (x1 - 3, y0, x1, y1), 0);
        };
        let mut old = blank_page(800, 600);
        outline(&mut old, (250, 200, 380, 300));
        let mut new = old.clone();
        outline(&mut new, (450, 320, 560, 420));

        let comparison = compare_pages(
            &LoadedPage::from_rgb(to_rgb(&old)),
            &LoadedPage::from_rgb(to_rgb(&new)),
            &AlignmentConfig::default(),
            &OverlayConfig::default(),
        )
        .unwrap();

        assert!(comparison.alignment.confidence > 0.99);
        assert_eq!(comparison.overlay.stats.change_count, 1);
        assert_eq!(comparison.overlay.stats.totals.removed_pixels, 0);
    }

    #[test]
    fn test_sparse_translation_is_recovered() {
        let mut old = blank_page(800, 600);
        fill_rect(&mut old, (250, 200, 380, 300), 0);
        let new = shifted(&old, 9, 5);

        let comparison = compare_pages(
            &LoadedPage::from_rgb(to_rgb(&old)),
            &LoadedPage::from_rgb(to_rgb(&new)),
            &AlignmentConfig::default(),
            &OverlayConfig::default(),
        )
        .unwrap();

        let t = comparison.alignment.transform;
        assert!((t.tx - 9.0).abs() < 0.5, "tx = {}", t.tx);
        assert!((t.ty - 5.0).abs() < 0.5, "ty = {}", t.ty);
        assert!(comparison.alignment.confidence > 0.99);
    }

    #[test]
    fn test_blank_pages_fail_with_insufficient_features() {
        let page = LoadedPage::from_rgb(to_rgb(&blank_page(200, 200)));
        let result = compare_pages(
            &page,
            &page,
            &AlignmentConfig::default(),
            &OverlayConfig::default(),
        );
        assert!(matches!(
            result,
            Err(AlignError::InsufficientFeatures { .. })
        ));
    }
}
