//! Change classification and overlay compositing.

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};

use crate::config::OverlayConfig;
use crate::error::AlignError;

/// Content present only in the old page.
pub const REMOVED_TINT: [u8; 3] = [200, 90, 90];
/// Content present only in the new page.
pub const ADDED_TINT: [u8; 3] = [70, 150, 90];
/// Content present in both pages.
pub const UNCHANGED_TINT: [u8; 3] = [120, 120, 135];

/// Faint lines still get this much tint so they stay visible.
const MIN_TINT_WEIGHT: f32 = 0.35;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PixelClass {
    Background = 0,
    Removed = 1,
    Added = 2,
    Unchanged = 3,
}

impl PixelClass {
    fn classify(old_content: bool, new_content: bool) -> Self {
        match (old_content, new_content) {
            (false, false) => PixelClass::Background,
            (true, false) => PixelClass::Removed,
            (false, true) => PixelClass::Added,
            (true, true) => PixelClass::Unchanged,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            1 => PixelClass::Removed,
            2 => PixelClass::Added,
            3 => PixelClass::Unchanged,
            _ => PixelClass::Background,
        }
    }

    pub fn is_change(self) -> bool {
        matches!(self, PixelClass::Removed | PixelClass::Added)
    }
}

/// Per-pixel classification, stored as one byte per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMask(GrayImage);

impl ClassMask {
    pub fn get(&self, x: u32, y: u32) -> PixelClass {
        PixelClass::from_code(self.0.get_pixel(x, y).0[0])
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }

    pub fn as_raw(&self) -> &[u8] {
        self.0.as_raw()
    }

    /// Number of pixels of `class` inside the half-open box.
    pub fn count_in(&self, class: PixelClass, (x0, y0, x1, y1): (u32, u32, u32, u32)) -> u64 {
        let mut count = 0;
        for y in y0..y1.min(self.0.height()) {
            for x in x0..x1.min(self.0.width()) {
                if self.get(x, y) == class {
                    count += 1;
                }
            }
        }
        count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quadrant {
    NorthWest,
    NorthEast,
    SouthWest,
    SouthEast,
}

impl Quadrant {
    pub const ALL: [Quadrant; 4] = [
        Quadrant::NorthWest,
        Quadrant::NorthEast,
        Quadrant::SouthWest,
        Quadrant::SouthEast,
    ];

    fn locate(x: u32, y: u32, width: u32, height: u32) -> Self {
        let east = x >= width / 2;
        let south = y >= height / 2;
        match (south, east) {
            (false, false) => Quadrant::NorthWest,
            (false, true) => Quadrant::NorthEast,
            (true, false) => Quadrant::SouthWest,
            (true, true) => Quadrant::SouthEast,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts {
    pub removed_pixels: u64,
    pub added_pixels: u64,
    pub unchanged_pixels: u64,
}

impl ClassCounts {
    fn record(&mut self, class: PixelClass) {
        match class {
            PixelClass::Removed => self.removed_pixels += 1,
            PixelClass::Added => self.added_pixels += 1,
            PixelClass::Unchanged => self.unchanged_pixels += 1,
            PixelClass::Background => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuadrantStats {
    pub quadrant: Quadrant,
    #[serde(flatten)]
    pub counts: ClassCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }
}

/// A connected group of changed pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRegion {
    pub bbox: BoundingBox,
    pub area: u64,
    pub added_pixels: u64,
    pub removed_pixels: u64,
    pub quadrant: Quadrant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    #[serde(flatten)]
    pub totals: ClassCounts,
    pub quadrants: Vec<QuadrantStats>,
    pub regions: Vec<ChangeRegion>,
    pub change_count: usize,
    pub changes_detected: bool,
}

#[derive(Debug, Clone)]
pub struct OverlayOutput {
    pub mask: ClassMask,
    pub composite: RgbImage,
    pub stats: DiffStats,
}

/// Classifies every pixel of two equal-sized pages and composites the tinted
/// overlay. Deterministic: the same inputs always give the same output.
pub fn generate_overlay(
    aligned_old: &RgbImage,
    new: &RgbImage,
    config: &OverlayConfig,
) -> Result<OverlayOutput, AlignError> {
    if aligned_old.dimensions() != new.dimensions() {
        return Err(AlignError::DimensionMismatch {
            left: aligned_old.dimensions(),
            right: new.dimensions(),
        });
    }
    let (width, height) = new.dimensions();
    let old_gray = image::imageops::grayscale(aligned_old);
    let new_gray = image::imageops::grayscale(new);
    let threshold = config.content_threshold;

    let mut mask = GrayImage::new(width, height);
    let mut changed = GrayImage::new(width, height);
    let mut composite = RgbImage::new(width, height);
    let mut totals = ClassCounts::default();
    let mut quadrants = [ClassCounts::default(); 4];

    for (x, y, pixel) in mask.enumerate_pixels_mut() {
        let old_value = old_gray.get_pixel(x, y).0[0];
        let new_value = new_gray.get_pixel(x, y).0[0];
        let class = PixelClass::classify(old_value < threshold, new_value < threshold);
        pixel.0[0] = class as u8;

        totals.record(class);
        quadrants[Quadrant::locate(x, y, width, height).index()].record(class);
        if class.is_change() {
            changed.put_pixel(x, y, Luma([255]));
        }

        let color = match class {
            PixelClass::Background => *new.get_pixel(x, y),
            PixelClass::Removed => tint(REMOVED_TINT, old_value),
            PixelClass::Added => tint(ADDED_TINT, new_value),
            PixelClass::Unchanged => tint(UNCHANGED_TINT, old_value.min(new_value)),
        };
        composite.put_pixel(x, y, color);
    }

    let mask = ClassMask(mask);
    let regions = change_regions(&changed, &mask, config.min_region_area);
    let change_count = regions.len();

    Ok(OverlayOutput {
        mask,
        composite,
        stats: DiffStats {
            totals,
            quadrants: Quadrant::ALL
                .iter()
                .map(|&quadrant| QuadrantStats {
                    quadrant,
                    counts: quadrants[quadrant.index()],
                })
                .collect(),
            regions,
            change_count,
            changes_detected: change_count > 0,
        },
    })
}

/// Blends white toward `color`, darker source lines giving a stronger tint.
fn tint(color: [u8; 3], gray: u8) -> Rgb<u8> {
    let darkness = f32::from(255 - gray) / 255.0;
    let weight = darkness.max(MIN_TINT_WEIGHT);
    Rgb(color.map(|c| (255.0 * (1.0 - weight) + f32::from(c) * weight).round() as u8))
}

struct RegionAccumulator {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    counts: ClassCounts,
    area: u64,
}

fn change_regions(changed: &GrayImage, mask: &ClassMask, min_area: u32) -> Vec<ChangeRegion> {
    let (width, height) = changed.dimensions();
    let labels = connected_components(changed, Connectivity::Eight, Luma([0u8]));

    let mut accumulators: Vec<Option<RegionAccumulator>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label.0[0] as usize;
        if label == 0 {
            continue;
        }
        if accumulators.len() <= label {
            accumulators.resize_with(label + 1, || None);
        }
        let acc = accumulators[label].get_or_insert(RegionAccumulator {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
            counts: ClassCounts::default(),
            area: 0,
        });
        acc.min_x = acc.min_x.min(x);
        acc.min_y = acc.min_y.min(y);
        acc.max_x = acc.max_x.max(x);
        acc.max_y = acc.max_y.max(y);
        acc.area += 1;
        acc.counts.record(mask.get(x, y));
    }

    let mut regions: Vec<ChangeRegion> = accumulators
        .into_iter()
        .flatten()
        .filter(|acc| acc.area >= u64::from(min_area))
        .map(|acc| {
            let center_x = acc.min_x + (acc.max_x - acc.min_x) / 2;
            let center_y = acc.min_y + (acc.max_y - acc.min_y) / 2;
            ChangeRegion {
                bbox: BoundingBox {
                    x: acc.min_x,
                    y: acc.min_y,
                    width: acc.max_x - acc.min_x + 1,
                    height: acc.max_y - acc.min_y + 1,
                },
                area: acc.area,
                added_pixels: acc.counts.added_pixels,
                removed_pixels: acc.counts.removed_pixels,
                quadrant: Quadrant::locate(center_x, center_y, width, height),
            }
        })
        .collect();
    regions.sort_by_key(|r| (r.bbox.y, r.bbox.x));
    regions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::fixtures::{blank_page, fill_rect, scatter_blobs, to_rgb};

    fn config() -> OverlayConfig {
        OverlayConfig::default()
    }

    #[test]
    fn test_content_threshold_boundary() {
        let old = to_rgb(&GrayImage::from_fn(3, 1, |x, _| Luma([239 + x as u8])));
        let new = to_rgb(&blank_page(3, 1));

        let out = generate_overlay(&old, &new, &config()).unwrap();
        assert_eq!(out.mask.get(0, 0), PixelClass::Removed, "239 is content");
        assert_eq!(out.mask.get(1, 0), PixelClass::Background, "240 is not content");
        assert_eq!(out.mask.get(2, 0), PixelClass::Background, "241 is not content");
    }

    #[test]
    fn test_every_class_is_assigned() {
        let mut old = blank_page(4, 1);
        let mut new = blank_page(4, 1);
        fill_rect(&mut old, (1, 0, 2, 1), 0);
        fill_rect(&mut new, (2, 0, 3, 1), 0);
        fill_rect(&mut old, (3, 0, 4, 1), 0);
        fill_rect(&mut new, (3, 0, 4, 1), 0);

        let out = generate_overlay(&to_rgb(&old), &to_rgb(&new), &config()).unwrap();
        assert_eq!(out.mask.get(0, 0), PixelClass::Background);
        assert_eq!(out.mask.get(1, 0), PixelClass::Removed);
        assert_eq!(out.mask.get(2, 0), PixelClass::Added);
        assert_eq!(out.mask.get(3, 0), PixelClass::Unchanged);
        assert_eq!(
            out.stats.totals,
            ClassCounts {
                removed_pixels: 1,
                added_pixels: 1,
                unchanged_pixels: 1
            }
        );
    }

    #[test]
    fn test_classification_is_idempotent() {
        let mut old = blank_page(120, 90);
        let mut new = blank_page(120, 90);
        scatter_blobs(&mut old, (0, 0, 120, 90), 40, 1);
        scatter_blobs(&mut new, (0, 0, 120, 90), 40, 2);
        let (old, new) = (to_rgb(&old), to_rgb(&new));

        let first = generate_overlay(&old, &new, &config()).unwrap();
        let second = generate_overlay(&old, &new, &config()).unwrap();
        assert_eq!(first.mask.as_raw(), second.mask.as_raw());
        assert_eq!(first.stats, second.stats);
        assert_eq!(first.composite, second.composite);
    }

    #[test]
    fn test_dimension_mismatch() {
        let result = generate_overlay(
            &to_rgb(&blank_page(10, 10)),
            &to_rgb(&blank_page(10, 11)),
            &config(),
        );
        assert_eq!(
            result.unwrap_err(),
            AlignError::DimensionMismatch {
                left: (10, 10),
                right: (10, 11)
            }
        );
    }

    #[test]
    fn test_regions_and_quadrants() {
        let old = blank_page(100, 100);
        let mut new = blank_page(100, 100);
        fill_rect(&mut new, (60, 60, 70, 70), 0);
        // A speck below the minimum area.
        fill_rect(&mut new, (5, 5, 7, 7), 0);

        let out = generate_overlay(&to_rgb(&old), &to_rgb(&new), &config()).unwrap();
        assert_eq!(out.stats.change_count, 1);
        assert!(out.stats.changes_detected);

        let region = &out.stats.regions[0];
        assert_eq!(
            region.bbox,
            BoundingBox {
                x: 60,
                y: 60,
                width: 10,
                height: 10
            }
        );
        assert_eq!(region.area, 100);
        assert_eq!(region.added_pixels, 100);
        assert_eq!(region.quadrant, Quadrant::SouthEast);

        let south_east = out
            .stats
            .quadrants
            .iter()
            .find(|q| q.quadrant == Quadrant::SouthEast)
            .unwrap();
        assert_eq!(south_east.counts.added_pixels, 100);
        let north_west = out
            .stats
            .quadrants
            .iter()
            .find(|q| q.quadrant == Quadrant::NorthWest)
            .unwrap();
        assert_eq!(north_west.counts.added_pixels, 4);
    }

    #[test]
    fn test_diagonal_pixels_form_one_region() {
        let old = blank_page(20, 20);
        let mut new = blank_page(20, 20);
        for i in 0..16 {
            fill_rect(&mut new, (2 + i, 2 + i, 3 + i, 3 + i), 0);
        }
        let out = generate_overlay(&to_rgb(&old), &to_rgb(&new), &config()).unwrap();
        assert_eq!(out.stats.change_count, 1);
        assert_eq!(out.stats.regions[0].area, 16);
    }

    #[test]
    fn test_identical_pages_have_no_changes() {
        let mut page = blank_page(50, 50);
        scatter_blobs(&mut page, (0, 0, 50, 50), 10, 3);
        let rgb = to_rgb(&page);

        let out = generate_overlay(&rgb, &rgb, &config()).unwrap();
        assert!(!out.stats.changes_detected);
        assert_eq!(out.stats.totals.added_pixels, 0);
        assert_eq!(out.stats.totals.removed_pixels, 0);
        assert!(out.stats.totals.unchanged_pixels > 0);
    }

    #[test]
    fn test_composite_tints() {
        let mut old = blank_page(3, 1);
        let mut new = blank_page(3, 1);
        fill_rect(&mut old, (0, 0, 1, 1), 0);
        fill_rect(&mut new, (1, 0, 2, 1), 0);

        let out = generate_overlay(&to_rgb(&old), &to_rgb(&new), &config()).unwrap();
        assert_eq!(out.composite.get_pixel(0, 0).0, REMOVED_TINT);
        assert_eq!(out.composite.get_pixel(1, 0).0, ADDED_TINT);
        assert_eq!(out.composite.get_pixel(2, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_faint_lines_keep_minimum_tint() {
        let color = tint(ADDED_TINT, 230);
        let expected = ADDED_TINT.map(|c| (255.0 * 0.65 + f32::from(c) * 0.35).round() as u8);
        assert_eq!(color.0, expected);
    }
}
