use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::error::{Result, SimilarityError};
use crate::metrics::MetricKind;

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "WEIGHBRIDGE_SIMILARITY_CONFIG";

/// Configuration file picked up from the working directory when present
pub const DEFAULT_CONFIG_FILE: &str = "similarity_config.json";

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Named pipeline variants
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Full-metric single-pair pipeline at 256x256
    Precision,
    /// Full-metric batch pipeline at 128x128
    Throughput,
    /// SIFT plus color histogram, percent scale
    Sift,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Precision => "precision",
            Variant::Throughput => "throughput",
            Variant::Sift => "sift",
        }
    }
}

/// Declared range of a pipeline's fused score
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputScale {
    /// [0.0, 1.0]
    Unit,
    /// [0.0, 100.0]
    Percent,
}

impl OutputScale {
    pub fn max(&self) -> f64 {
        match self {
            OutputScale::Unit => 1.0,
            OutputScale::Percent => 100.0,
        }
    }
}

/// Which images the histogram comparator reads
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistogramSource {
    /// Intensity histogram of the prepared grayscale pair
    Gray,
    /// Joint RGB histogram of the original, unresized images
    Color,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HistogramParams {
    pub source: HistogramSource,
    /// Bin count (per channel for color histograms)
    pub bins: u32,
}

/// ORB detector and matcher settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OrbParams {
    pub max_keypoints: usize,
    /// Hamming distance a cross-checked match must stay below to count as good
    pub match_distance: u32,
    /// Descriptor floor; images with no more descriptors than this score 0
    pub min_descriptors: usize,
    #[serde(default = "default_fast_threshold")]
    pub fast_threshold: u8,
    #[serde(default = "default_pyramid_levels")]
    pub pyramid_levels: u8,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f32,
}

/// SIFT detector and ratio-test settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SiftParams {
    /// Lowe's ratio test threshold
    pub ratio_threshold: f32,
    #[serde(default = "default_octave_layers")]
    pub octave_layers: usize,
    #[serde(default = "default_contrast_threshold")]
    pub contrast_threshold: f32,
    #[serde(default = "default_edge_threshold")]
    pub edge_threshold: f32,
    #[serde(default = "default_sigma")]
    pub sigma: f32,
    /// Keep only the strongest keypoints; `None` keeps all of them
    #[serde(default)]
    pub max_keypoints: Option<usize>,
}

/// Keypoint detector used by the feature comparator
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "detector", rename_all = "lowercase")]
pub enum FeatureParams {
    Orb(OrbParams),
    Sift(SiftParams),
}

/// Per-metric contribution to the fused score
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    #[serde(default)]
    pub structural: f64,
    #[serde(default)]
    pub histogram: f64,
    #[serde(default)]
    pub feature: f64,
    #[serde(default)]
    pub template: f64,
}

impl FusionWeights {
    pub fn get(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::Structural => self.structural,
            MetricKind::Histogram => self.histogram,
            MetricKind::Feature => self.feature,
            MetricKind::Template => self.template,
        }
    }

    pub fn sum(&self) -> f64 {
        MetricKind::ALL.iter().map(|&kind| self.get(kind)).sum()
    }

    /// Metrics that contribute to the fused score
    pub fn active_kinds(&self) -> Vec<MetricKind> {
        MetricKind::ALL
            .iter()
            .copied()
            .filter(|&kind| self.get(kind) > 0.0)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        for kind in MetricKind::ALL {
            let weight = self.get(kind);
            if !weight.is_finite() || weight < 0.0 {
                return Err(SimilarityError::Config(format!(
                    "weight for {} must be a non-negative number, got {}",
                    kind, weight
                )));
            }
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(SimilarityError::Config(format!(
                "fusion weights must sum to 1.0, got {}",
                sum
            )));
        }
        Ok(())
    }
}

/// Everything that distinguishes one pipeline variant from another
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Square working resolution; `None` keeps full-resolution grayscale
    #[serde(default)]
    pub resolution: Option<u32>,
    pub histogram: HistogramParams,
    pub feature: FeatureParams,
    pub weights: FusionWeights,
    pub scale: OutputScale,
}

impl PipelineConfig {
    pub fn precision() -> Self {
        PipelineConfig {
            resolution: Some(256),
            histogram: HistogramParams {
                source: HistogramSource::Gray,
                bins: 256,
            },
            feature: FeatureParams::Orb(OrbParams {
                max_keypoints: 500,
                match_distance: 30,
                min_descriptors: 10,
                fast_threshold: default_fast_threshold(),
                pyramid_levels: default_pyramid_levels(),
                scale_factor: default_scale_factor(),
            }),
            weights: FusionWeights {
                structural: 0.4,
                histogram: 0.2,
                feature: 0.3,
                template: 0.1,
            },
            scale: OutputScale::Unit,
        }
    }

    pub fn throughput() -> Self {
        PipelineConfig {
            resolution: Some(128),
            histogram: HistogramParams {
                source: HistogramSource::Gray,
                bins: 64,
            },
            feature: FeatureParams::Orb(OrbParams {
                max_keypoints: 200,
                match_distance: 40,
                min_descriptors: 5,
                fast_threshold: default_fast_threshold(),
                pyramid_levels: default_pyramid_levels(),
                scale_factor: default_scale_factor(),
            }),
            weights: FusionWeights {
                structural: 0.5,
                histogram: 0.25,
                feature: 0.15,
                template: 0.1,
            },
            scale: OutputScale::Unit,
        }
    }

    pub fn sift() -> Self {
        PipelineConfig {
            resolution: None,
            histogram: HistogramParams {
                source: HistogramSource::Color,
                bins: 50,
            },
            feature: FeatureParams::Sift(SiftParams {
                ratio_threshold: 0.7,
                octave_layers: default_octave_layers(),
                contrast_threshold: default_contrast_threshold(),
                edge_threshold: default_edge_threshold(),
                sigma: default_sigma(),
                max_keypoints: None,
            }),
            weights: FusionWeights {
                structural: 0.0,
                histogram: 0.3,
                feature: 0.7,
                template: 0.0,
            },
            scale: OutputScale::Percent,
        }
    }

    /// Interpolation used when resizing to the working resolution
    pub fn filter_type(&self) -> FilterType {
        FilterType::Triangle
    }

    pub fn validate(&self) -> Result<()> {
        self.weights.validate()?;
        if self.resolution == Some(0) {
            return Err(SimilarityError::Config("resolution must be positive".into()));
        }
        if self.histogram.bins == 0 || self.histogram.bins > 256 {
            return Err(SimilarityError::Config(format!(
                "histogram bins must be within 1..=256, got {}",
                self.histogram.bins
            )));
        }
        match &self.feature {
            FeatureParams::Orb(orb) => {
                if orb.pyramid_levels == 0 || orb.scale_factor <= 1.0 {
                    return Err(SimilarityError::Config(
                        "orb needs at least one pyramid level and a scale factor above 1".into(),
                    ));
                }
            }
            FeatureParams::Sift(sift) => {
                if !(sift.ratio_threshold > 0.0 && sift.ratio_threshold <= 1.0) {
                    return Err(SimilarityError::Config(format!(
                        "sift ratio threshold must be within (0, 1], got {}",
                        sift.ratio_threshold
                    )));
                }
                if sift.octave_layers == 0 {
                    return Err(SimilarityError::Config("sift needs at least one octave layer".into()));
                }
            }
        }
        Ok(())
    }
}

/// Application configuration structure that matches similarity_config.json
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Upper bound for the platform-derived batch worker count
    #[serde(default = "default_max_workers_ceiling")]
    pub max_workers_ceiling: usize,

    #[serde(default = "PipelineConfig::precision")]
    pub precision: PipelineConfig,
    #[serde(default = "PipelineConfig::throughput")]
    pub throughput: PipelineConfig,
    #[serde(default = "PipelineConfig::sift")]
    pub sift: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            max_workers_ceiling: default_max_workers_ceiling(),
            precision: PipelineConfig::precision(),
            throughput: PipelineConfig::throughput(),
            sift: PipelineConfig::sift(),
        }
    }
}

// Default functions for parameters
fn default_log_level() -> String {
    "warn".to_string()
}

fn default_max_workers_ceiling() -> usize {
    8
}

fn default_fast_threshold() -> u8 {
    20
}

fn default_pyramid_levels() -> u8 {
    8
}

fn default_scale_factor() -> f32 {
    1.2
}

fn default_octave_layers() -> usize {
    3
}

fn default_contrast_threshold() -> f32 {
    0.04
}

fn default_edge_threshold() -> f32 {
    10.0
}

fn default_sigma() -> f32 {
    1.6
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config: Config = serde_json::from_reader(reader).map_err(|e| {
            SimilarityError::Config(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| SimilarityError::Config(e.to_string()))?;
        Ok(())
    }

    pub fn pipeline(&self, variant: Variant) -> &PipelineConfig {
        match variant {
            Variant::Precision => &self.precision,
            Variant::Throughput => &self.throughput,
            Variant::Sift => &self.sift,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers_ceiling == 0 {
            return Err(SimilarityError::Config("max_workers_ceiling must be positive".into()));
        }
        for variant in [Variant::Precision, Variant::Throughput, Variant::Sift] {
            self.pipeline(variant).validate().map_err(|e| {
                SimilarityError::Config(format!("{} pipeline: {}", variant.as_str(), e))
            })?;
        }
        Ok(())
    }
}

/// Path of the configuration file to read, if any
pub fn config_path() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        if !explicit.is_empty() {
            return Some(PathBuf::from(explicit));
        }
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    local.exists().then_some(local)
}

/// Load the configuration, falling back to built-in defaults when no file exists
pub fn load_config() -> Result<Config> {
    let mut config = match config_path() {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if config.log_level.is_empty() {
        config.log_level = default_log_level();
    }

    Ok(config)
}
