use image::{GrayImage, RgbImage};

use super::{MetricComparator, MetricKind};
use crate::config::{HistogramParams, HistogramSource};
use crate::error::{Result, SimilarityError};
use crate::preprocess::PreparedPair;

/// Pearson correlation between the binned histograms of the two images.
#[derive(Debug, Clone)]
pub struct HistogramComparator {
    params: HistogramParams,
}

impl HistogramComparator {
    pub fn new(params: HistogramParams) -> Self {
        Self { params }
    }
}

impl MetricComparator for HistogramComparator {
    fn kind(&self) -> MetricKind {
        MetricKind::Histogram
    }

    fn name(&self) -> &'static str {
        match self.params.source {
            HistogramSource::Gray => "gray-histogram",
            HistogramSource::Color => "color-histogram",
        }
    }

    fn compare(&self, pair: &PreparedPair) -> Result<f64> {
        let bins = self.params.bins;
        let (hist1, hist2) = match self.params.source {
            HistogramSource::Gray => (
                gray_histogram(&pair.first, bins),
                gray_histogram(&pair.second, bins),
            ),
            HistogramSource::Color => {
                let (color1, color2) = pair.color.as_ref().ok_or_else(|| {
                    SimilarityError::metric(self.kind(), "color images were not retained")
                })?;
                (color_histogram(color1, bins), color_histogram(color2, bins))
            }
        };

        Ok(correlation(&hist1, &hist2))
    }
}

#[inline]
fn bin_of(value: u8, bins: u32) -> usize {
    (value as u32 * bins / 256) as usize
}

/// Intensity histogram with `bins` equal-width bins over [0, 256)
pub fn gray_histogram(image: &GrayImage, bins: u32) -> Vec<f64> {
    let mut hist = vec![0.0; bins as usize];
    for pixel in image.pixels() {
        hist[bin_of(pixel[0], bins)] += 1.0;
    }
    hist
}

/// Joint histogram over the three channels, `bins` per channel
pub fn color_histogram(image: &RgbImage, bins: u32) -> Vec<f64> {
    let n = bins as usize;
    let mut hist = vec![0.0; n * n * n];
    for pixel in image.pixels() {
        let r = bin_of(pixel[0], bins);
        let g = bin_of(pixel[1], bins);
        let b = bin_of(pixel[2], bins);
        hist[(r * n + g) * n + b] += 1.0;
    }
    hist
}

/// Correlation of two histograms of equal length.
///
/// Returns 1.0 when the denominator vanishes, which happens when either
/// histogram is flat.
pub fn correlation(hist1: &[f64], hist2: &[f64]) -> f64 {
    debug_assert_eq!(hist1.len(), hist2.len());
    let n = hist1.len().min(hist2.len());
    if n == 0 {
        return 0.0;
    }

    let mean1 = hist1[..n].iter().sum::<f64>() / n as f64;
    let mean2 = hist2[..n].iter().sum::<f64>() / n as f64;

    let mut num = 0.0;
    let mut var1 = 0.0;
    let mut var2 = 0.0;
    for (a, b) in hist1[..n].iter().zip(&hist2[..n]) {
        let d1 = a - mean1;
        let d2 = b - mean2;
        num += d1 * d2;
        var1 += d1 * d1;
        var2 += d2 * d2;
    }

    let denom = var1 * var2;
    if denom.abs() > f64::EPSILON {
        num / denom.sqrt()
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::test_images::textured;
    use image::{Luma, Rgb};

    fn gray_params(bins: u32) -> HistogramParams {
        HistogramParams {
            source: HistogramSource::Gray,
            bins,
        }
    }

    #[test]
    fn bins_cover_the_full_range() {
        assert_eq!(bin_of(0, 64), 0);
        assert_eq!(bin_of(255, 64), 63);
        assert_eq!(bin_of(255, 50), 49);
        assert_eq!(bin_of(128, 256), 128);
    }

    #[test]
    fn identical_images_correlate_perfectly() {
        let image = textured(64, 64, 7);
        let pair = PreparedPair {
            first: image.clone(),
            second: image,
            color: None,
        };
        let score = HistogramComparator::new(gray_params(256)).compare(&pair).unwrap();
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn white_against_black_correlates_negatively() {
        let pair = PreparedPair {
            first: GrayImage::from_pixel(32, 32, Luma([255])),
            second: GrayImage::from_pixel(32, 32, Luma([0])),
            color: None,
        };
        let score = HistogramComparator::new(gray_params(256)).compare(&pair).unwrap();
        assert!(score < 0.0);
    }

    #[test]
    fn color_histogram_separates_hues() {
        let red = RgbImage::from_pixel(16, 16, Rgb([250, 0, 0]));
        let blue = RgbImage::from_pixel(16, 16, Rgb([0, 0, 250]));
        let params = HistogramParams {
            source: HistogramSource::Color,
            bins: 50,
        };
        let pair = PreparedPair {
            first: GrayImage::new(16, 16),
            second: GrayImage::new(16, 16),
            color: Some((red.clone(), blue)),
        };
        let comparator = HistogramComparator::new(params);
        assert!(comparator.compare(&pair).unwrap() < 0.01);

        let same = PreparedPair {
            color: Some((red.clone(), red)),
            ..pair
        };
        assert!((comparator.compare(&same).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn color_source_without_color_images_fails() {
        let params = HistogramParams {
            source: HistogramSource::Color,
            bins: 50,
        };
        let pair = PreparedPair {
            first: GrayImage::new(4, 4),
            second: GrayImage::new(4, 4),
            color: None,
        };
        assert!(HistogramComparator::new(params).compare(&pair).is_err());
    }

    #[test]
    fn flat_histograms_correlate_to_one() {
        assert_eq!(correlation(&[2.0, 2.0], &[5.0, 5.0]), 1.0);
    }

    #[test]
    fn one_flat_histogram_also_correlates_to_one() {
        assert_eq!(correlation(&[3.0, 3.0, 3.0], &[0.0, 9.0, 1.0]), 1.0);
        assert_eq!(correlation(&[0.0, 9.0, 1.0], &[3.0, 3.0, 3.0]), 1.0);
    }
}
