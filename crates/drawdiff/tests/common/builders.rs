#![allow(dead_code)]

use std::io::Cursor;

use image::{GrayImage, ImageFormat, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const PAGE_WIDTH: u32 = 800;
pub const PAGE_HEIGHT: u32 = 600;

/// Textured area present on both revisions.
pub const DETAIL: (u32, u32, u32, u32) = (200, 160, 400, 440);
/// Solid block added in the second revision.
pub const ADDITION: (u32, u32, u32, u32) = (480, 200, 600, 320);

pub fn fill_rect(page: &mut GrayImage, (x0, y0, x1, y1): (u32, u32, u32, u32), value: u8) {
    for y in y0..y1 {
        for x in x0..x1 {
            page.put_pixel(x, y, Luma([value]));
        }
    }
}

/// A white page with a cluster of small dark blobs in `DETAIL`.
pub fn base_drawing() -> GrayImage {
    let mut page = GrayImage::from_pixel(PAGE_WIDTH, PAGE_HEIGHT, Luma([255]));
    let (x0, y0, x1, y1) = DETAIL;
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..160 {
        let w = rng.gen_range(3..10);
        let h = rng.gen_range(3..10);
        let x = rng.gen_range(x0..x1 - w);
        let y = rng.gen_range(y0..y1 - h);
        fill_rect(&mut page, (x, y, x + w, y + h), 0);
    }
    page
}

/// `base_drawing` with the `ADDITION` block drawn in.
pub fn revised_drawing() -> GrayImage {
    let mut page = base_drawing();
    fill_rect(&mut page, ADDITION, 0);
    page
}

/// Rectangle on the sparse sheet present in both revisions.
pub const FRAME: (u32, u32, u32, u32) = (250, 200, 380, 300);
/// Rectangle added to the sparse sheet in the second revision.
pub const ANNEX: (u32, u32, u32, u32) = (450, 320, 560, 420);

/// A white page holding only the solid `FRAME` rectangle.
pub fn sparse_drawing() -> GrayImage {
    let mut page = blank_drawing();
    fill_rect(&mut page, FRAME, 0);
    page
}

/// `sparse_drawing` with the `ANNEX` rectangle drawn in.
pub fn sparse_revision() -> GrayImage {
    let mut page = sparse_drawing();
    fill_rect(&mut page, ANNEX, 0);
    page
}

pub fn blank_drawing() -> GrayImage {
    GrayImage::from_pixel(PAGE_WIDTH, PAGE_HEIGHT, Luma([255]))
}

pub fn png_bytes(page: &GrayImage) -> Vec<u8> {
    let rgb = image::DynamicImage::ImageLuma8(page.clone()).to_rgb8();
    let mut buf = Cursor::new(Vec::new());
    rgb.write_to(&mut buf, ImageFormat::Png)
        .expect("Failed to encode test page");
    buf.into_inner()
}
