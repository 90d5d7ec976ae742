//! Object storage for pages, overlays and stage outputs.
//!
//! Objects are addressed by opaque string keys. The key layout is:
//!
//! | Key | Content |
//! |---|---|
//! | `pages/<drawing_version_id>.<ext>` | rasterized page |
//! | `overlays/<diff_result_id>.png` | generated overlay |
//! | `aligned/<diff_result_id>.png` | old page resampled into the new page grid |
//! | `overlays/<diff_result_id>/manual_<n>.png` | manual overlay version `n` |
//! | `summaries/<job_id>.json` | summary stage output |

pub mod filesystem;

use std::io::Cursor;

use image::RgbImage;

use crate::error::StorageError;

pub use filesystem::FileStorage;

/// Minimal blob store interface used by the pipeline.
pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    fn put(&self, key: &str, content: &[u8]) -> Result<(), StorageError>;
    fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

pub fn page_key(drawing_version_id: &str, extension: &str) -> String {
    format!("pages/{}.{}", drawing_version_id, extension)
}

pub fn overlay_key(diff_result_id: &str) -> String {
    format!("overlays/{}.png", diff_result_id)
}

pub fn aligned_key(diff_result_id: &str) -> String {
    format!("aligned/{}.png", diff_result_id)
}

pub fn manual_overlay_key(diff_result_id: &str, version: u32) -> String {
    format!("overlays/{}/manual_{}.png", diff_result_id, version)
}

pub fn summary_key(job_id: &str) -> String {
    format!("summaries/{}.json", job_id)
}

/// Encodes `image` as PNG and stores it under `key`.
pub fn put_png(store: &dyn ObjectStore, key: &str, image: &RgbImage) -> Result<(), StorageError> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, image::ImageFormat::Png)
        .map_err(|e| StorageError::Encode {
            key: key.to_string(),
            source: e,
        })?;
    store.put(key, buf.get_ref())
}
