use image::{DynamicImage, GrayImage, RgbImage};
use std::path::Path;

use crate::config::{HistogramSource, PipelineConfig};
use crate::error::{Result, SimilarityError};

/// Read-only input shared by every comparator of one pipeline invocation
#[derive(Debug, Clone)]
pub struct PreparedPair {
    pub first: GrayImage,
    pub second: GrayImage,
    /// Original color images, kept only when the histogram reads them
    pub color: Option<(RgbImage, RgbImage)>,
}

impl PreparedPair {
    /// Load both images from disk and prepare them for `pipeline`
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        first: P,
        second: Q,
        pipeline: &PipelineConfig,
    ) -> Result<Self> {
        let img1 = load_image(first.as_ref())?;
        let img2 = load_image(second.as_ref())?;
        Ok(Self::from_images(&img1, &img2, pipeline))
    }

    /// Prepare two already decoded images
    pub fn from_images(img1: &DynamicImage, img2: &DynamicImage, pipeline: &PipelineConfig) -> Self {
        let color = match pipeline.histogram.source {
            HistogramSource::Color => Some((img1.to_rgb8(), img2.to_rgb8())),
            HistogramSource::Gray => None,
        };

        PreparedPair {
            first: to_working_gray(img1, pipeline),
            second: to_working_gray(img2, pipeline),
            color,
        }
    }

    pub fn same_dimensions(&self) -> bool {
        self.first.dimensions() == self.second.dimensions()
    }
}

/// Open an image, distinguishing a missing file from an undecodable one
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    if !path.is_file() {
        return Err(SimilarityError::NotFound(path.to_path_buf()));
    }
    image::open(path).map_err(|source| SimilarityError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

fn to_working_gray(img: &DynamicImage, pipeline: &PipelineConfig) -> GrayImage {
    let gray = img.to_luma8();
    match pipeline.resolution {
        Some(size) if gray.dimensions() != (size, size) => {
            image::imageops::resize(&gray, size, size, pipeline.filter_type())
        }
        _ => gray,
    }
}
