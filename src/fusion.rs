use crate::config::{FusionWeights, OutputScale};
use crate::metrics::{MetricKind, MetricScore};

/// `max(lo, min(hi, value))`; NaN maps to `lo`
pub fn clamp(value: f64, lo: f64, hi: f64) -> f64 {
    if value.is_nan() {
        return lo;
    }
    value.min(hi).max(lo)
}

pub fn clamp_unit(value: f64) -> f64 {
    clamp(value, 0.0, 1.0)
}

/// Map a raw comparator output onto the pipeline scale.
///
/// On the unit scale the structural index is shifted from [-1, 1] before
/// clamping. On the percent scale the feature score is already a percentage
/// and the histogram correlation is multiplied up to one.
pub fn normalize(kind: MetricKind, raw: f64, scale: OutputScale) -> f64 {
    match scale {
        OutputScale::Unit => match kind {
            MetricKind::Structural => clamp_unit((raw + 1.0) / 2.0),
            MetricKind::Histogram | MetricKind::Feature | MetricKind::Template => clamp_unit(raw),
        },
        OutputScale::Percent => match kind {
            MetricKind::Structural => clamp_unit((raw + 1.0) / 2.0) * 100.0,
            MetricKind::Feature => clamp(raw, 0.0, 100.0),
            MetricKind::Histogram | MetricKind::Template => clamp(raw * 100.0, 0.0, 100.0),
        },
    }
}

/// Weighted sum of normalized scores, clamped to the declared output range.
///
/// Metrics missing from `scores` contribute nothing.
pub fn fuse(scores: &[MetricScore], weights: &FusionWeights, scale: OutputScale) -> f64 {
    let total: f64 = scores
        .iter()
        .map(|score| normalize(score.kind, score.raw, scale) * weights.get(score.kind))
        .sum();
    clamp(total, 0.0, scale.max())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    fn score(kind: MetricKind, raw: f64) -> MetricScore {
        MetricScore { kind, raw }
    }

    #[test]
    fn clamp_is_idempotent() {
        for value in [-3.0, -0.0, 0.0, 0.25, 1.0, 1.0000001, 42.0, f64::NAN, f64::INFINITY] {
            let once = clamp_unit(value);
            assert!((0.0..=1.0).contains(&once));
            assert_eq!(clamp_unit(once), once);
        }
    }

    #[test]
    fn structural_index_is_shifted_onto_the_unit_range() {
        assert_eq!(normalize(MetricKind::Structural, 1.0, OutputScale::Unit), 1.0);
        assert_eq!(normalize(MetricKind::Structural, 0.0, OutputScale::Unit), 0.5);
        assert_eq!(normalize(MetricKind::Structural, -1.0, OutputScale::Unit), 0.0);
        assert_eq!(normalize(MetricKind::Structural, -1.5, OutputScale::Unit), 0.0);
    }

    #[test]
    fn correlations_are_clamped_not_shifted() {
        assert_eq!(normalize(MetricKind::Histogram, -0.4, OutputScale::Unit), 0.0);
        assert_eq!(normalize(MetricKind::Histogram, 1.0000002, OutputScale::Unit), 1.0);
        assert_eq!(normalize(MetricKind::Template, 0.3, OutputScale::Unit), 0.3);
        assert_eq!(normalize(MetricKind::Feature, 1.7, OutputScale::Unit), 1.0);
    }

    #[test]
    fn percent_scale_keeps_feature_percentages() {
        assert_eq!(normalize(MetricKind::Feature, 87.5, OutputScale::Percent), 87.5);
        assert_eq!(normalize(MetricKind::Feature, 130.0, OutputScale::Percent), 100.0);
        assert!((normalize(MetricKind::Histogram, 0.9, OutputScale::Percent) - 90.0).abs() < 1e-9);
        assert_eq!(normalize(MetricKind::Histogram, -0.2, OutputScale::Percent), 0.0);
    }

    #[test]
    fn perfect_scores_fuse_to_the_maximum() {
        let precision = PipelineConfig::precision();
        let perfect = [
            score(MetricKind::Structural, 1.0),
            score(MetricKind::Histogram, 1.0),
            score(MetricKind::Feature, 1.0),
            score(MetricKind::Template, 1.0),
        ];
        assert!((fuse(&perfect, &precision.weights, precision.scale) - 1.0).abs() < 1e-9);

        let sift = PipelineConfig::sift();
        let perfect = [score(MetricKind::Histogram, 1.0), score(MetricKind::Feature, 100.0)];
        assert!((fuse(&perfect, &sift.weights, sift.scale) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn throughput_weights_are_applied() {
        let throughput = PipelineConfig::throughput();
        let scores = [
            score(MetricKind::Structural, 1.0),
            score(MetricKind::Histogram, 0.0),
            score(MetricKind::Feature, 0.0),
            score(MetricKind::Template, 0.0),
        ];
        assert!((fuse(&scores, &throughput.weights, throughput.scale) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn sift_fusion_matches_the_weighted_percentages() {
        let sift = PipelineConfig::sift();
        let scores = [score(MetricKind::Feature, 40.0), score(MetricKind::Histogram, 0.5)];
        let fused = fuse(&scores, &sift.weights, sift.scale);
        assert!((fused - (40.0 * 0.7 + 50.0 * 0.3)).abs() < 1e-9);
    }
}
