//! Page decoding.
//!
//! Turns a stored raster page into an RGB pixel grid plus a grayscale
//! view. Transparent pixels are composited over white so that every page,
//! whatever its source format, has a white background.

use image::{DynamicImage, GrayImage, RgbImage};

use crate::error::{DecodeError, StorageError};
use crate::storage::ObjectStore;

/// Media types a rasterized page may be stored as.
const SUPPORTED_MEDIA_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/tiff",
    "image/bmp",
    "image/webp",
    "image/gif",
];

/// A decoded page.
#[derive(Debug, Clone)]
pub struct LoadedPage {
    pub rgb: RgbImage,
    pub gray: GrayImage,
}

impl LoadedPage {
    pub fn from_rgb(rgb: RgbImage) -> Self {
        let gray = DynamicImage::ImageRgb8(rgb.clone()).to_luma8();
        Self { rgb, gray }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.rgb.dimensions()
    }
}

/// Reads and decodes the page stored under `reference`.
pub fn load_page(store: &dyn ObjectStore, reference: &str) -> Result<LoadedPage, DecodeError> {
    let _span = tracing::debug_span!("load_page", reference = %reference).entered();

    check_media_type(reference)?;

    let bytes = store.get(reference).map_err(|e| match e {
        StorageError::NotFound { .. } => DecodeError::Missing {
            reference: reference.to_string(),
        },
        other => DecodeError::Read {
            reference: reference.to_string(),
            source: other,
        },
    })?;

    decode_page(&bytes, reference)
}

/// Decodes page bytes. `reference` is only used for error messages.
pub fn decode_page(bytes: &[u8], reference: &str) -> Result<LoadedPage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty {
            reference: reference.to_string(),
        });
    }

    let img = image::load_from_memory(bytes).map_err(|e| DecodeError::Corrupt {
        reference: reference.to_string(),
        source: e,
    })?;

    let rgb = if img.color().has_alpha() {
        flatten_on_white(&img)
    } else {
        img.to_rgb8()
    };

    Ok(LoadedPage::from_rgb(rgb))
}

pub(crate) fn check_media_type(reference: &str) -> Result<(), DecodeError> {
    let media_type = mime_guess::from_path(reference)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    if SUPPORTED_MEDIA_TYPES.contains(&media_type.as_str()) {
        Ok(())
    } else {
        Err(DecodeError::UnsupportedMediaType {
            reference: reference.to_string(),
            media_type,
        })
    }
}

fn flatten_on_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = u32::from(a);
        let blend = |c: u8| ((u32::from(c) * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        image::Rgb([blend(r), blend(g), blend(b)])
    })
}
