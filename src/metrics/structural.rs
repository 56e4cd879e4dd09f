use image_compare::Algorithm;

use super::{MetricComparator, MetricKind};
use crate::error::{Result, SimilarityError};
use crate::preprocess::PreparedPair;

/// Mean structural similarity of the two grayscale grids.
///
/// Local windows contribute their mean, variance and covariance to the
/// standard SSIM formula; the output lies in [-1, 1] with 1 meaning
/// identical local structure.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralComparator;

impl StructuralComparator {
    pub fn new() -> Self {
        StructuralComparator
    }
}

impl MetricComparator for StructuralComparator {
    fn kind(&self) -> MetricKind {
        MetricKind::Structural
    }

    fn name(&self) -> &'static str {
        "mssim"
    }

    fn compare(&self, pair: &PreparedPair) -> Result<f64> {
        if !pair.same_dimensions() {
            return Err(SimilarityError::metric(
                self.kind(),
                format!(
                    "dimension mismatch {:?} vs {:?}",
                    pair.first.dimensions(),
                    pair.second.dimensions()
                ),
            ));
        }

        let similarity =
            image_compare::gray_similarity_structure(&Algorithm::MSSIMSimple, &pair.first, &pair.second)
                .map_err(|e| SimilarityError::metric(self.kind(), e.to_string()))?;

        Ok(similarity.score)
    }
}
