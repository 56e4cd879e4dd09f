//! OpenCV backed comparators, built with the `opencv` feature.
//!
//! They carry the same names and constructors as the pure Rust comparators
//! and replace them in [`super::build_comparator`].

use image::{GrayImage, RgbImage};
use opencv::{
    core::{self, DMatch, KeyPoint, Mat, Vector},
    features2d::{self, Feature2DTrait, ORB_ScoreType, SIFT},
    imgproc,
    prelude::*,
};
use std::os::raw::c_void;
use std::sync::Once;

use super::{MetricComparator, MetricKind};
use crate::config::{HistogramParams, HistogramSource, OrbParams, SiftParams};
use crate::error::{Result, SimilarityError};
use crate::preprocess::PreparedPair;

static OPENCV_INIT: Once = Once::new();

fn init_opencv() {
    OPENCV_INIT.call_once(|| {
        opencv::core::set_num_threads(0).ok();
    });
}

/// Copy a grayscale buffer into an owned single channel `Mat`
fn gray_to_mat(image: &GrayImage) -> opencv::Result<Mat> {
    let (width, height) = image.dimensions();
    // The borrowed view is cloned before `image` can go away
    let view = unsafe {
        Mat::new_rows_cols_with_data(
            height as i32,
            width as i32,
            core::CV_8UC1,
            image.as_raw().as_ptr() as *mut c_void,
            core::Mat_AUTO_STEP,
        )?
    };
    view.try_clone()
}

/// Convert an RGB buffer into an owned BGR `Mat`
fn rgb_to_mat(image: &RgbImage) -> opencv::Result<Mat> {
    let (width, height) = image.dimensions();
    let view = unsafe {
        Mat::new_rows_cols_with_data(
            height as i32,
            width as i32,
            core::CV_8UC3,
            image.as_raw().as_ptr() as *mut c_void,
            core::Mat_AUTO_STEP,
        )?
    };

    let mut bgr = Mat::default();
    imgproc::cvt_color(&view, &mut bgr, imgproc::COLOR_RGB2BGR, 0)?;
    Ok(bgr)
}

fn detect(detector: &mut impl Feature2DTrait, image: &Mat) -> opencv::Result<(Vector<KeyPoint>, Mat)> {
    let mut keypoints = Vector::new();
    let mut descriptors = Mat::default();
    detector.detect_and_compute(image, &Mat::default(), &mut keypoints, &mut descriptors, false)?;
    Ok((keypoints, descriptors))
}

/// ORB keypoints matched with a cross-checking Hamming brute-force matcher
#[derive(Debug, Clone)]
pub struct OrbComparator {
    params: OrbParams,
}

impl OrbComparator {
    pub fn new(params: OrbParams) -> Self {
        Self { params }
    }

    fn score(&self, pair: &PreparedPair) -> opencv::Result<f64> {
        init_opencv();
        let params = &self.params;
        let mut orb = features2d::ORB::create(
            params.max_keypoints as i32,
            params.scale_factor,
            params.pyramid_levels as i32,
            31,
            0,
            2,
            ORB_ScoreType::HARRIS_SCORE,
            31,
            params.fast_threshold as i32,
        )?;

        let (keypoints1, descriptors1) = detect(&mut orb, &gray_to_mat(&pair.first)?)?;
        let (keypoints2, descriptors2) = detect(&mut orb, &gray_to_mat(&pair.second)?)?;

        let floor = params.min_descriptors as i32;
        if descriptors1.rows() <= floor || descriptors2.rows() <= floor {
            log::debug!(
                "orb: too few descriptors ({} / {}, floor {}), scoring 0",
                descriptors1.rows(),
                descriptors2.rows(),
                floor
            );
            return Ok(0.0);
        }

        let matcher = features2d::BFMatcher::create(core::NORM_HAMMING, true)?;
        let mut matches = Vector::<DMatch>::new();
        matcher.train_match(&descriptors1, &descriptors2, &mut matches, &Mat::default())?;

        let good = matches
            .iter()
            .filter(|m| m.distance < params.match_distance as f32)
            .count();
        let denominator = keypoints1.len().max(keypoints2.len());
        log::debug!(
            "orb: {} / {} keypoints, {} cross-checked matches, {} good",
            keypoints1.len(),
            keypoints2.len(),
            matches.len(),
            good
        );

        Ok((good as f64 / denominator as f64).min(1.0))
    }
}

impl MetricComparator for OrbComparator {
    fn kind(&self) -> MetricKind {
        MetricKind::Feature
    }

    fn name(&self) -> &'static str {
        "orb"
    }

    fn compare(&self, pair: &PreparedPair) -> Result<f64> {
        self.score(pair)
            .map_err(|e| SimilarityError::metric(self.kind(), e.to_string()))
    }
}

/// SIFT keypoints matched with FLANN 2-NN and Lowe's ratio test, as a percentage
#[derive(Debug, Clone)]
pub struct SiftComparator {
    params: SiftParams,
}

impl SiftComparator {
    pub fn new(params: SiftParams) -> Self {
        Self { params }
    }

    fn score(&self, pair: &PreparedPair) -> opencv::Result<f64> {
        init_opencv();
        let params = &self.params;
        let mut sift = SIFT::create(
            params.max_keypoints.unwrap_or(0) as i32,
            params.octave_layers as i32,
            params.contrast_threshold as f64,
            params.edge_threshold as f64,
            params.sigma as f64,
        )?;

        let (keypoints1, descriptors1) = detect(&mut sift, &gray_to_mat(&pair.first)?)?;
        let (keypoints2, descriptors2) = detect(&mut sift, &gray_to_mat(&pair.second)?)?;

        if keypoints1.is_empty() || keypoints2.is_empty() || descriptors1.empty() || descriptors2.empty() {
            log::debug!(
                "sift: no keypoints ({} / {}), scoring 0",
                keypoints1.len(),
                keypoints2.len()
            );
            return Ok(0.0);
        }

        let matcher = features2d::FlannBasedMatcher::create()?;
        let mut knn_matches = Vector::<Vector<DMatch>>::new();
        matcher.knn_train_match(&descriptors1, &descriptors2, &mut knn_matches, 2, &Mat::default(), false)?;

        let mut good = 0usize;
        for candidates in knn_matches.iter() {
            if candidates.len() < 2 {
                continue;
            }
            let (best, second) = (candidates.get(0)?, candidates.get(1)?);
            if best.distance < params.ratio_threshold * second.distance {
                good += 1;
            }
        }
        let average = (keypoints1.len() + keypoints2.len()) as f64 / 2.0;

        log::debug!(
            "sift: {} / {} keypoints, {} matches pass the ratio test",
            keypoints1.len(),
            keypoints2.len(),
            good
        );

        Ok((good as f64 / average * 100.0).clamp(0.0, 100.0))
    }
}

impl MetricComparator for SiftComparator {
    fn kind(&self) -> MetricKind {
        MetricKind::Feature
    }

    fn name(&self) -> &'static str {
        "sift"
    }

    fn compare(&self, pair: &PreparedPair) -> Result<f64> {
        self.score(pair)
            .map_err(|e| SimilarityError::metric(self.kind(), e.to_string()))
    }
}

/// `TM_CCOEFF_NORMED` template matching; the best response wins
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateComparator;

impl TemplateComparator {
    pub fn new() -> Self {
        TemplateComparator
    }

    fn score(&self, pair: &PreparedPair) -> opencv::Result<f64> {
        init_opencv();
        let image = gray_to_mat(&pair.first)?;
        let template = gray_to_mat(&pair.second)?;

        let mut responses = Mat::default();
        imgproc::match_template(&image, &template, &mut responses, imgproc::TM_CCOEFF_NORMED, &Mat::default())?;

        let mut best = 0.0f64;
        core::min_max_loc(&responses, None, Some(&mut best), None, None, &Mat::default())?;
        Ok(best)
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
        let (iw, ih) = pair.first.dimensions();
        let (tw, th) = pair.second.dimensions();
        if tw == 0 || th == 0 || tw > iw || th > ih {
            return Err(SimilarityError::metric(self.kind(), "template larger than image"));
        }
        self.score(pair)
            .map_err(|e| SimilarityError::metric(self.kind(), e.to_string()))
    }
}

/// `calcHist` histograms compared with `HISTCMP_CORREL`
#[derive(Debug, Clone)]
pub struct HistogramComparator {
    params: HistogramParams,
}

impl HistogramComparator {
    pub fn new(params: HistogramParams) -> Self {
        Self { params }
    }

    fn histogram(&self, image: Mat, channels: usize) -> opencv::Result<Mat> {
        let bins = self.params.bins as i32;
        let mut images = Vector::<Mat>::new();
        images.push(image);

        let channel_list: Vector<i32> = (0..channels as i32).collect();
        let sizes: Vector<i32> = std::iter::repeat(bins).take(channels).collect();
        let ranges: Vector<f32> = std::iter::repeat([0.0f32, 256.0])
            .take(channels)
            .flatten()
            .collect();

        let mut hist = Mat::default();
        imgproc::calc_hist(&images, &channel_list, &Mat::default(), &mut hist, &sizes, &ranges, false)?;
        Ok(hist)
    }

    fn score(&self, pair: &PreparedPair) -> Result<f64> {
        init_opencv();
        let cv_error = |e: opencv::Error| SimilarityError::metric(self.kind(), e.to_string());

        let (hist1, hist2) = match self.params.source {
            HistogramSource::Gray => (
                self.histogram(gray_to_mat(&pair.first).map_err(cv_error)?, 1),
                self.histogram(gray_to_mat(&pair.second).map_err(cv_error)?, 1),
            ),
            HistogramSource::Color => {
                let (color1, color2) = pair.color.as_ref().ok_or_else(|| {
                    SimilarityError::metric(self.kind(), "color images were not retained")
                })?;
                (
                    self.histogram(rgb_to_mat(color1).map_err(cv_error)?, 3),
                    self.histogram(rgb_to_mat(color2).map_err(cv_error)?, 3),
                )
            }
        };

        imgproc::compare_hist(&hist1.map_err(cv_error)?, &hist2.map_err(cv_error)?, imgproc::HISTCMP_CORREL)
            .map_err(cv_error)
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
        self.score(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::metrics::test_images::textured;

    fn identical_pair(size: u32) -> PreparedPair {
        let image = textured(size, size, 5);
        PreparedPair {
            first: image.clone(),
            second: image,
            color: None,
        }
    }

    #[test]
    fn identical_images_reach_the_maximum() {
        let pipeline = PipelineConfig::precision();
        let pair = identical_pair(128);

        let template = TemplateComparator::new().compare(&pair).unwrap();
        assert!((template - 1.0).abs() < 1e-4, "template {}", template);

        let histogram = HistogramComparator::new(pipeline.histogram.clone()).compare(&pair).unwrap();
        assert!((histogram - 1.0).abs() < 1e-9, "histogram {}", histogram);

        if let crate::config::FeatureParams::Orb(params) = &pipeline.feature {
            let orb = OrbComparator::new(params.clone()).compare(&pair).unwrap();
            assert!(orb > 0.95, "orb {}", orb);
        }
    }

    #[test]
    fn oversized_template_is_a_metric_error() {
        let pair = PreparedPair {
            first: GrayImage::new(8, 8),
            second: GrayImage::new(16, 16),
            color: None,
        };
        assert!(matches!(
            TemplateComparator::new().compare(&pair),
            Err(SimilarityError::MetricComputation { metric: MetricKind::Template, .. })
        ));
    }

    #[test]
    fn flat_images_have_no_sift_matches() {
        let pair = PreparedPair {
            first: GrayImage::new(64, 64),
            second: GrayImage::new(64, 64),
            color: None,
        };
        let crate::config::FeatureParams::Sift(params) = PipelineConfig::sift().feature else {
            panic!("sift pipeline without sift parameters");
        };
        let score = SiftComparator::new(params).compare(&pair).unwrap();
        assert_eq!(score, 0.0);
    }
}
