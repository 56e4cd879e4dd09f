use image::GrayImage;
use rayon::prelude::*;

use super::{MetricComparator, MetricKind};
use crate::error::{Result, SimilarityError};
use crate::preprocess::PreparedPair;

/// Best zero-mean normalized cross-correlation of the second grid slid over
/// the first. With equally sized grids there is exactly one offset.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateComparator;

impl TemplateComparator {
    pub fn new() -> Self {
        TemplateComparator
    }
}

impl MetricComparator for TemplateComparator {
    fn kind(&self) -> MetricKind {
        MetricKind::Template
    }

    fn name(&self) -> &'static str {
        "ccoeff-normed"
    }

    fn compare(&self, pair: &PreparedPair) -> Result<f64> {
        let responses = match_template(&pair.first, &pair.second)
            .ok_or_else(|| SimilarityError::metric(self.kind(), "template larger than image"))?;

        Ok(responses.into_iter().fold(f64::MIN, f64::max))
    }
}

/// Correlation coefficient for every offset of `template` inside `image`,
/// row-major. `None` when the template does not fit.
pub fn match_template(image: &GrayImage, template: &GrayImage) -> Option<Vec<f64>> {
    let (iw, ih) = image.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > iw || th > ih {
        return None;
    }

    let n = (tw * th) as f64;
    let t_mean = template.pixels().map(|p| p[0] as f64).sum::<f64>() / n;
    let centered: Vec<f64> = template.pixels().map(|p| p[0] as f64 - t_mean).collect();
    let t_energy: f64 = centered.iter().map(|v| v * v).sum();

    let out_w = iw - tw + 1;
    let out_h = ih - th + 1;

    let responses = (0..out_w * out_h)
        .into_par_iter()
        .map(|offset| {
            let (u, v) = (offset % out_w, offset / out_w);
            let mut cross = 0.0;
            let mut sum = 0.0;
            let mut sum_sq = 0.0;
            for y in 0..th {
                for x in 0..tw {
                    let value = image.get_pixel(u + x, v + y)[0] as f64;
                    cross += centered[(y * tw + x) as usize] * value;
                    sum += value;
                    sum_sq += value * value;
                }
            }
            let window_energy = (sum_sq - sum * sum / n).max(0.0);
            let denom = (t_energy * window_energy).sqrt();
            if denom > f64::EPSILON {
                cross / denom
            } else {
                0.0
            }
        })
        .collect();

    Some(responses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::test_images::{checkerboard, textured};
    use image::Luma;

    #[test]
    fn identical_images_correlate_to_one() {
        let image = textured(48, 48, 3);
        let pair = PreparedPair {
            first: image.clone(),
            second: image,
            color: None,
        };
        let score = TemplateComparator::new().compare(&pair).unwrap();
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn inverted_image_correlates_to_minus_one() {
        let board = checkerboard(32, 4);
        let inverted = GrayImage::from_fn(32, 32, |x, y| Luma([255 - board.get_pixel(x, y)[0]]));
        let pair = PreparedPair {
            first: board,
            second: inverted,
            color: None,
        };
        let score = TemplateComparator::new().compare(&pair).unwrap();
        assert!((score + 1.0).abs() < 1e-9);
    }

    #[test]
    fn flat_images_score_zero() {
        let pair = PreparedPair {
            first: GrayImage::from_pixel(16, 16, Luma([255])),
            second: GrayImage::from_pixel(16, 16, Luma([0])),
            color: None,
        };
        assert_eq!(TemplateComparator::new().compare(&pair).unwrap(), 0.0);
    }

    #[test]
    fn finds_the_best_offset_of_a_smaller_template() {
        let image = textured(40, 40, 11);
        let patch = image::imageops::crop_imm(&image, 12, 5, 16, 16).to_image();
        let responses = match_template(&image, &patch).unwrap();
        assert_eq!(responses.len(), 25 * 25);
        let best = responses
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(best, 5 * 25 + 12);
    }

    #[test]
    fn oversized_template_fails() {
        let pair = PreparedPair {
            first: GrayImage::new(8, 8),
            second: GrayImage::new(9, 8),
            color: None,
        };
        assert!(TemplateComparator::new().compare(&pair).is_err());
    }
}
