use serde::{Deserialize, Serialize};

use crate::stage::StageKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_storage_root")]
    pub storage_root: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub alignment: AlignmentConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database_path: default_database_path(),
            storage_root: default_storage_root(),
            worker_count: default_worker_count(),
            alignment: AlignmentConfig::default(),
            overlay: OverlayConfig::default(),
            retry: RetryConfig::default(),
            worker: WorkerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_database_path() -> String {
    crate::db::default_database_path()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| "drawdiff.db".to_string())
}

fn default_storage_root() -> String {
    dirs::home_dir()
        .map(|h| {
            h.join(".drawdiff")
                .join("objects")
                .to_string_lossy()
                .to_string()
        })
        .unwrap_or_else(|| "objects".to_string())
}

/// Geometric model fitted between the two pages. Shear is never estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformModel {
    /// Rotation, uniform scale and translation.
    Similarity,
    /// Rotation, independent x/y scale and translation.
    ScaledRotation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resampling {
    Nearest,
    Bilinear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentConfig {
    /// Upper bound on keypoints kept per image.
    #[serde(default = "default_max_keypoints")]
    pub max_keypoints: usize,
    /// Fraction of width/height excluded on each page border.
    #[serde(default = "default_border_margin")]
    pub border_margin: f64,
    /// Lowe ratio: best distance must be below `ratio_test * second_best`.
    #[serde(default = "default_ratio_test")]
    pub ratio_test: f64,
    #[serde(default = "default_min_matches")]
    pub min_matches: usize,
    #[serde(default = "default_min_inlier_ratio")]
    pub min_inlier_ratio: f64,
    #[serde(default = "default_ransac_iterations")]
    pub ransac_iterations: usize,
    /// Maximum reprojection error, in pixels, for a correspondence to count as an inlier.
    #[serde(default = "default_inlier_threshold_px")]
    pub inlier_threshold_px: f64,
    /// Correspondence count at which the confidence score stops growing.
    #[serde(default = "default_confidence_saturation")]
    pub confidence_saturation: usize,
    #[serde(default = "default_pyramid_levels")]
    pub pyramid_levels: u32,
    #[serde(default = "default_pyramid_scale")]
    pub pyramid_scale: f64,
    #[serde(default = "default_fast_threshold")]
    pub fast_threshold: u8,
    #[serde(default = "default_model")]
    pub model: TransformModel,
    #[serde(default = "default_resampling")]
    pub resampling: Resampling,
    /// Largest translation, as a fraction of the longer page side, searched
    /// when registering sparse pages by their content.
    #[serde(default = "default_max_registration_shift")]
    pub max_registration_shift: f64,
}

fn default_max_keypoints() -> usize {
    10_000
}

fn default_border_margin() -> f64 {
    0.2
}

fn default_ratio_test() -> f64 {
    0.75
}

fn default_min_matches() -> usize {
    4
}

fn default_min_inlier_ratio() -> f64 {
    0.5
}

fn default_ransac_iterations() -> usize {
    1000
}

fn default_inlier_threshold_px() -> f64 {
    3.0
}

fn default_confidence_saturation() -> usize {
    25
}

fn default_pyramid_levels() -> u32 {
    3
}

fn default_pyramid_scale() -> f64 {
    0.75
}

fn default_fast_threshold() -> u8 {
    20
}

fn default_model() -> TransformModel {
    TransformModel::Similarity
}

fn default_max_registration_shift() -> f64 {
    0.1
}

fn default_resampling() -> Resampling {
    Resampling::Bilinear
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            max_keypoints: default_max_keypoints(),
            border_margin: default_border_margin(),
            ratio_test: default_ratio_test(),
            min_matches: default_min_matches(),
            min_inlier_ratio: default_min_inlier_ratio(),
            ransac_iterations: default_ransac_iterations(),
            inlier_threshold_px: default_inlier_threshold_px(),
            confidence_saturation: default_confidence_saturation(),
            pyramid_levels: default_pyramid_levels(),
            pyramid_scale: default_pyramid_scale(),
            fast_threshold: default_fast_threshold(),
            model: default_model(),
            resampling: default_resampling(),
            max_registration_shift: default_max_registration_shift(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Gray values strictly below this count as drawn content.
    #[serde(default = "default_content_threshold")]
    pub content_threshold: u8,
    /// Changed regions smaller than this many pixels are ignored when counting changes.
    #[serde(default = "default_min_region_area")]
    pub min_region_area: u32,
}

fn default_content_threshold() -> u8 {
    240
}

fn default_min_region_area() -> u32 {
    16
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            content_threshold: default_content_threshold(),
            min_region_area: default_min_region_area(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Failed-to-pending loops allowed before a stage fails terminally.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Deliveries of one message before it is dead-lettered.
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    #[serde(default = "default_ack_deadline_secs")]
    pub ack_deadline_secs: u64,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_delivery_attempts() -> u32 {
    5
}

fn default_ack_deadline_secs() -> u64 {
    300
}

fn default_retry_backoff_secs() -> u64 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_delivery_attempts: default_max_delivery_attempts(),
            ack_deadline_secs: default_ack_deadline_secs(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Stage kinds this process consumes.
    #[serde(default = "default_stage_kinds")]
    pub stage_kinds: Vec<StageKind>,
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_stage_kinds() -> Vec<StageKind> {
    vec![StageKind::AlignmentDiff, StageKind::Summary]
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stage_kinds: default_stage_kinds(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: default_log_format(),
        }
    }
}
