//! Image alignment and change classification.
//!
//! Everything here is synchronous, single-threaded and free of persistence:
//! pages in, aligned page plus overlay out.

pub mod compare;
#[cfg(test)]
pub(crate) mod fixtures;
pub mod keypoints;
pub mod loader;
pub mod overlay;
pub mod registration;
pub mod transform;

use serde::{Deserialize, Serialize};

pub use compare::{compare_pages, Comparison};
pub use keypoints::{detect_features, match_features, match_pages, Correspondence, Features};
pub use loader::{decode_page, load_page, LoadedPage};
pub use overlay::{
    generate_overlay, BoundingBox, ChangeRegion, ClassCounts, ClassMask, DiffStats, OverlayOutput,
    PixelClass, Quadrant, QuadrantStats,
};
pub use registration::{content_agreement, refine_translation, register_content};
pub use transform::{
    estimate_transform, inlier_ratio, warp_to, AlignmentMethod, AlignmentResult, Transform2D,
};

/// A position in level-0 page pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_squared(self, other: Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}
