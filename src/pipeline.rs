use rayon::prelude::*;
use std::path::Path;

use crate::config::{Config, OutputScale, PipelineConfig, Variant};
use crate::error::Result;
use crate::fusion;
use crate::metrics::{build_comparators, MetricComparator, MetricKind, MetricScore};
use crate::preprocess::PreparedPair;

/// Final fused score plus the per-metric values it was built from
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityResult {
    pub similarity: f64,
    pub scale: OutputScale,
    /// Raw scores of the metrics that could be computed
    pub metrics: Vec<MetricScore>,
    /// Metrics that failed and were scored as zero
    pub failed: Vec<MetricKind>,
}

impl SimilarityResult {
    pub fn raw(&self, kind: MetricKind) -> Option<f64> {
        self.metrics.iter().find(|m| m.kind == kind).map(|m| m.raw)
    }

    /// Score of one metric on the pipeline scale, zero when it failed
    pub fn normalized(&self, kind: MetricKind) -> Option<f64> {
        if self.failed.contains(&kind) {
            return Some(0.0);
        }
        self.raw(kind).map(|raw| fusion::normalize(kind, raw, self.scale))
    }
}

/// One parameterized similarity pipeline: preprocessing, comparators,
/// normalization and fusion for a single variant.
pub struct SimilarityPipeline {
    config: PipelineConfig,
    comparators: Vec<Box<dyn MetricComparator>>,
}

impl SimilarityPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let comparators = build_comparators(&config);
        Ok(Self { config, comparators })
    }

    pub fn for_variant(config: &Config, variant: Variant) -> Result<Self> {
        Self::new(config.pipeline(variant).clone())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Load, prepare and score two image files
    pub fn compare_paths<P: AsRef<Path>, Q: AsRef<Path>>(&self, first: P, second: Q) -> Result<SimilarityResult> {
        let pair = PreparedPair::load(first, second, &self.config)?;
        Ok(self.score(&pair))
    }

    /// Run every comparator over the shared pair and fuse the results.
    ///
    /// A comparator error only zeroes that metric.
    pub fn score(&self, pair: &PreparedPair) -> SimilarityResult {
        let outcomes: Vec<(MetricKind, &'static str, Result<f64>)> = self
            .comparators
            .par_iter()
            .map(|comparator| (comparator.kind(), comparator.name(), comparator.compare(pair)))
            .collect();

        let mut metrics = Vec::with_capacity(outcomes.len());
        let mut failed = Vec::new();
        for (kind, name, outcome) in outcomes {
            match outcome {
                Ok(raw) => {
                    log::debug!(
                        "  {} ({}): raw {:.6}, normalized {:.6}",
                        kind,
                        name,
                        raw,
                        fusion::normalize(kind, raw, self.config.scale)
                    );
                    metrics.push(MetricScore { kind, raw });
                }
                Err(e) => {
                    log::warn!("{}, scoring it as 0", e);
                    failed.push(kind);
                }
            }
        }

        let similarity = fusion::fuse(&metrics, &self.config.weights, self.config.scale);
        log::debug!("  fused similarity: {:.6}", similarity);

        SimilarityResult {
            similarity,
            scale: self.config.scale,
            metrics,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::test_images::textured;
    use image::{GrayImage, Luma};

    fn gray_pair(first: GrayImage, second: GrayImage) -> PreparedPair {
        PreparedPair { first, second, color: None }
    }

    #[test]
    fn identical_textures_reach_the_maximum() {
        let pipeline = SimilarityPipeline::new(PipelineConfig::precision()).unwrap();
        let image = textured(256, 256, 17);
        let result = pipeline.score(&gray_pair(image.clone(), image));
        assert!(result.similarity >= 0.99, "similarity was {}", result.similarity);
        assert!(result.failed.is_empty());
        for kind in MetricKind::ALL {
            let normalized = result.normalized(kind).unwrap();
            assert!((0.0..=1.0).contains(&normalized));
        }
    }

    #[test]
    fn white_against_black_scores_low() {
        let pipeline = SimilarityPipeline::new(PipelineConfig::precision()).unwrap();
        let result = pipeline.score(&gray_pair(
            GrayImage::from_pixel(256, 256, Luma([255])),
            GrayImage::from_pixel(256, 256, Luma([0])),
        ));
        assert_eq!(result.normalized(MetricKind::Feature), Some(0.0));
        assert_eq!(result.normalized(MetricKind::Histogram), Some(0.0));
        assert_eq!(result.normalized(MetricKind::Template), Some(0.0));
        // a structural index of ~0 maps to ~0.5 before weighting
        assert!(result.normalized(MetricKind::Structural).unwrap() <= 0.51);
        assert!(result.similarity <= 0.21, "similarity was {}", result.similarity);
    }

    #[test]
    fn failing_metric_only_zeroes_itself() {
        let pipeline = SimilarityPipeline::new(PipelineConfig::precision()).unwrap();
        // a larger second image breaks structural and template, not histogram
        let result = pipeline.score(&gray_pair(textured(32, 32, 3), textured(64, 64, 3)));
        assert!(result.failed.contains(&MetricKind::Structural));
        assert!(result.failed.contains(&MetricKind::Template));
        assert!(result.raw(MetricKind::Histogram).is_some());
        assert!((0.0..=1.0).contains(&result.similarity));
    }

    #[test]
    fn sift_variant_runs_two_metrics() {
        let pipeline = SimilarityPipeline::new(PipelineConfig::sift()).unwrap();
        assert_eq!(pipeline.comparators.len(), 2);
        assert_eq!(pipeline.config().scale, OutputScale::Percent);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = PipelineConfig::throughput();
        config.weights.feature = 0.9;
        assert!(SimilarityPipeline::new(config).is_err());
    }
}
