//! Independent similarity metrics over a [`PreparedPair`].
//!
//! Every comparator reads the same pair and returns a raw score in its own
//! natural range; mapping onto the pipeline scale happens in [`crate::fusion`].
//! With the `opencv` feature the histogram, feature and template comparators
//! come from [`cv`]; otherwise the pure Rust modules provide them.

#[cfg(feature = "opencv")]
pub mod cv;
pub mod histogram;
pub mod orb;
pub mod sift;
pub mod structural;
pub mod template;

pub use structural::StructuralComparator;

#[cfg(not(feature = "opencv"))]
pub use {
    histogram::HistogramComparator, orb::OrbComparator, sift::SiftComparator,
    template::TemplateComparator,
};

#[cfg(feature = "opencv")]
pub use cv::{HistogramComparator, OrbComparator, SiftComparator, TemplateComparator};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{FeatureParams, PipelineConfig};
use crate::error::Result;
use crate::preprocess::PreparedPair;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Structural,
    Histogram,
    Feature,
    Template,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::Structural,
        MetricKind::Histogram,
        MetricKind::Feature,
        MetricKind::Template,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Structural => "structural",
            MetricKind::Histogram => "histogram",
            MetricKind::Feature => "feature",
            MetricKind::Template => "template",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw, pre-normalization output of one comparator
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MetricScore {
    pub kind: MetricKind,
    pub raw: f64,
}

/// Trait implemented by all metric comparators.
pub trait MetricComparator: Send + Sync {
    fn kind(&self) -> MetricKind;

    /// Stable comparator name used for logging.
    fn name(&self) -> &'static str;

    /// Computes the raw score. Must not depend on anything but `pair`.
    fn compare(&self, pair: &PreparedPair) -> Result<f64>;
}

/// Builds the comparator for one metric kind of a pipeline
pub fn build_comparator(kind: MetricKind, pipeline: &PipelineConfig) -> Box<dyn MetricComparator> {
    match kind {
        MetricKind::Structural => Box::new(StructuralComparator::new()),
        MetricKind::Histogram => Box::new(HistogramComparator::new(pipeline.histogram.clone())),
        MetricKind::Feature => match &pipeline.feature {
            FeatureParams::Orb(params) => Box::new(OrbComparator::new(params.clone())),
            FeatureParams::Sift(params) => Box::new(SiftComparator::new(params.clone())),
        },
        MetricKind::Template => Box::new(TemplateComparator::new()),
    }
}

/// Comparators for every metric with a non-zero fusion weight
pub fn build_comparators(pipeline: &PipelineConfig) -> Vec<Box<dyn MetricComparator>> {
    pipeline
        .weights
        .active_kinds()
        .into_iter()
        .map(|kind| build_comparator(kind, pipeline))
        .collect()
}

#[cfg(test)]
pub(crate) mod test_images {
    use image::{GrayImage, Luma};

    /// Deterministic blocky noise with plenty of distinct corners
    pub fn textured(width: u32, height: u32, seed: u64) -> GrayImage {
        let block = 8;
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let cols = width.div_ceil(block);
        let rows = height.div_ceil(block);
        let mut values = Vec::with_capacity((cols * rows) as usize);
        for _ in 0..cols * rows {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            values.push((state >> 24) as u8);
        }
        GrayImage::from_fn(width, height, |x, y| {
            Luma([values[((y / block) * cols + x / block) as usize]])
        })
    }

    pub fn checkerboard(size: u32, square: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            if (x / square + y / square) % 2 == 0 {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }
}
