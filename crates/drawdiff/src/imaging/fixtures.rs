//! Synthetic drawings for imaging tests.

use image::{GrayImage, Luma, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn blank_page(width: u32, height: u32) -> GrayImage {
    GrayImage::from_pixel(width, height, Luma([255]))
}

pub fn fill_rect(page: &mut GrayImage, (x0, y0, x1, y1): (u32, u32, u32, u32), value: u8) {
    for y in y0..y1 {
        for x in x0..x1 {
            page.put_pixel(x, y, Luma([value]));
        }
    }
}

/// Scatters `count` small dark rectangles inside `(x0, y0, x1, y1)`.
pub fn scatter_blobs(page: &mut GrayImage, (x0, y0, x1, y1): (u32, u32, u32, u32), count: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..count {
        let w = rng.gen_range(3..10);
        let h = rng.gen_range(3..10);
        let x = rng.gen_range(x0..x1 - w);
        let y = rng.gen_range(y0..y1 - h);
        fill_rect(page, (x, y, x + w, y + h), 0);
    }
}

/// Moves the content by `(dx, dy)`, filling uncovered pixels with white.
pub fn shifted(page: &GrayImage, dx: i64, dy: i64) -> GrayImage {
    let (w, h) = page.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        let sx = x as i64 - dx;
        let sy = y as i64 - dy;
        if sx < 0 || sy < 0 || sx >= w as i64 || sy >= h as i64 {
            Luma([255])
        } else {
            *page.get_pixel(sx as u32, sy as u32)
        }
    })
}

pub fn to_rgb(page: &GrayImage) -> RgbImage {
    RgbImage::from_fn(page.width(), page.height(), |x, y| {
        let v = page.get_pixel(x, y).0[0];
        image::Rgb([v, v, v])
    })
}
