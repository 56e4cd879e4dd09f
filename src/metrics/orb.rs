use image::{imageops, imageops::FilterType, GrayImage};
use imageproc::corners::corners_fast9;
use imageproc::filter::gaussian_blur_f32;
use rayon::prelude::*;
use std::sync::OnceLock;

use super::{MetricComparator, MetricKind};
use crate::config::OrbParams;
use crate::error::Result;
use crate::preprocess::PreparedPair;

/// Radius of the circular patch used for orientation
const HALF_PATCH: i32 = 15;
/// Rotated sampling pairs reach at most 13 * sqrt(2) pixels from the center
const EDGE: u32 = 19;
/// Smoothing applied before sampling descriptor bits
const DESCRIPTOR_SIGMA: f32 = 2.0;
/// Minimum spacing between kept keypoints on one pyramid level
const SUPPRESSION_RADIUS: f32 = 3.0;

/// ORB keypoint matching: share of cross-checked descriptor matches that are
/// closer than the configured Hamming distance.
#[derive(Debug, Clone)]
pub struct OrbComparator {
    params: OrbParams,
}

impl OrbComparator {
    pub fn new(params: OrbParams) -> Self {
        Self { params }
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
        let (features1, features2) = rayon::join(
            || detect_and_compute(&pair.first, &self.params),
            || detect_and_compute(&pair.second, &self.params),
        );

        let floor = self.params.min_descriptors;
        if features1.len() <= floor || features2.len() <= floor {
            log::debug!(
                "orb: too few descriptors ({} / {}, floor {}), scoring 0",
                features1.len(),
                features2.len(),
                floor
            );
            return Ok(0.0);
        }

        let matches = cross_check_match(&features1.descriptors, &features2.descriptors);
        let good = matches
            .iter()
            .filter(|m| m.distance < self.params.match_distance)
            .count();
        let denominator = features1.len().max(features2.len());

        log::debug!(
            "orb: {} / {} keypoints, {} cross-checked matches, {} good",
            features1.len(),
            features2.len(),
            matches.len(),
            good
        );

        Ok((good as f64 / denominator as f64).min(1.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    /// Position in base image coordinates
    pub x: f32,
    pub y: f32,
    pub response: f32,
    /// Orientation in radians
    pub angle: f32,
    pub octave: u8,
}

/// 256-bit binary descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u64; 4]);

impl Descriptor {
    pub fn hamming(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrbFeatures {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl OrbFeatures {
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorMatch {
    pub query: usize,
    pub train: usize,
    pub distance: u32,
}

/// BRIEF sampling pairs `(ax, ay, bx, by)` drawn once from a fixed seed,
/// roughly Gaussian around the center and clipped to the 31x31 patch.
fn sampling_pattern() -> &'static [(i8, i8, i8, i8); 256] {
    static PATTERN: OnceLock<[(i8, i8, i8, i8); 256]> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next_uniform = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
        };
        let mut sample = move || {
            let g = next_uniform() + next_uniform() + next_uniform();
            (g * 6.2).round().clamp(-13.0, 13.0) as i8
        };

        let mut pattern = [(0i8, 0i8, 0i8, 0i8); 256];
        for slot in pattern.iter_mut() {
            loop {
                let candidate = (sample(), sample(), sample(), sample());
                if (candidate.0, candidate.1) != (candidate.2, candidate.3) {
                    *slot = candidate;
                    break;
                }
            }
        }
        pattern
    })
}

struct Candidate {
    x: u32,
    y: u32,
    response: f32,
}

/// Detect up to `max_keypoints` oriented FAST keypoints over an image pyramid
/// and compute their rotated BRIEF descriptors.
pub fn detect_and_compute(image: &GrayImage, params: &OrbParams) -> OrbFeatures {
    let (width, height) = image.dimensions();
    let mut collected: Vec<(Keypoint, Descriptor)> = Vec::new();

    for octave in 0..params.pyramid_levels {
        let scale = params.scale_factor.powi(octave as i32);
        let level_w = (width as f32 / scale).round() as u32;
        let level_h = (height as f32 / scale).round() as u32;
        if level_w < 2 * EDGE + 1 || level_h < 2 * EDGE + 1 {
            break;
        }

        let level = if octave == 0 {
            image.clone()
        } else {
            imageops::resize(image, level_w, level_h, FilterType::Triangle)
        };
        let smoothed = gaussian_blur_f32(&level, DESCRIPTOR_SIGMA);

        for candidate in detect_level(&level, params.fast_threshold) {
            let angle = intensity_centroid_angle(&level, candidate.x, candidate.y);
            let descriptor = describe(&smoothed, candidate.x, candidate.y, angle);
            let keypoint = Keypoint {
                x: candidate.x as f32 * scale,
                y: candidate.y as f32 * scale,
                response: candidate.response,
                angle,
                octave,
            };
            collected.push((keypoint, descriptor));
        }
    }

    collected.sort_by(|a, b| {
        b.0.response
            .total_cmp(&a.0.response)
            .then(a.0.octave.cmp(&b.0.octave))
            .then(a.0.y.total_cmp(&b.0.y))
            .then(a.0.x.total_cmp(&b.0.x))
    });
    collected.truncate(params.max_keypoints);

    let (keypoints, descriptors) = collected.into_iter().unzip();
    OrbFeatures {
        keypoints,
        descriptors,
    }
}

/// FAST-9 corners away from the border, thinned so that no two kept corners
/// lie within the suppression radius.
fn detect_level(level: &GrayImage, threshold: u8) -> Vec<Candidate> {
    let (w, h) = level.dimensions();
    let mut corners: Vec<Candidate> = corners_fast9(level, threshold)
        .into_iter()
        .filter(|c| c.x >= EDGE && c.y >= EDGE && c.x < w - EDGE && c.y < h - EDGE)
        .map(|c| Candidate {
            x: c.x,
            y: c.y,
            response: c.score,
        })
        .collect();

    corners.sort_by(|a, b| {
        b.response
            .total_cmp(&a.response)
            .then(a.y.cmp(&b.y))
            .then(a.x.cmp(&b.x))
    });

    let radius_sq = SUPPRESSION_RADIUS * SUPPRESSION_RADIUS;
    let mut kept: Vec<Candidate> = Vec::new();
    for corner in corners {
        let crowded = kept.iter().any(|k| {
            let dx = k.x as f32 - corner.x as f32;
            let dy = k.y as f32 - corner.y as f32;
            dx * dx + dy * dy <= radius_sq
        });
        if !crowded {
            kept.push(corner);
        }
    }
    kept
}

/// Orientation from the intensity centroid of a circular patch
fn intensity_centroid_angle(level: &GrayImage, cx: u32, cy: u32) -> f32 {
    let mut m01 = 0.0f64;
    let mut m10 = 0.0f64;
    for dy in -HALF_PATCH..=HALF_PATCH {
        let span = ((HALF_PATCH * HALF_PATCH - dy * dy) as f64).sqrt() as i32;
        for dx in -span..=span {
            let value = level.get_pixel((cx as i32 + dx) as u32, (cy as i32 + dy) as u32)[0] as f64;
            m10 += dx as f64 * value;
            m01 += dy as f64 * value;
        }
    }
    m01.atan2(m10) as f32
}

fn describe(smoothed: &GrayImage, cx: u32, cy: u32, angle: f32) -> Descriptor {
    let (sin, cos) = angle.sin_cos();
    let sample = |x: i8, y: i8| -> u8 {
        let (x, y) = (x as f32, y as f32);
        let rx = (x * cos - y * sin).round() as i32;
        let ry = (x * sin + y * cos).round() as i32;
        smoothed.get_pixel((cx as i32 + rx) as u32, (cy as i32 + ry) as u32)[0]
    };

    let mut bits = [0u64; 4];
    for (i, &(ax, ay, bx, by)) in sampling_pattern().iter().enumerate() {
        if sample(ax, ay) < sample(bx, by) {
            bits[i / 64] |= 1 << (i % 64);
        }
    }
    Descriptor(bits)
}

fn best_match(query: &Descriptor, train: &[Descriptor]) -> Option<(usize, u32)> {
    train
        .iter()
        .enumerate()
        .map(|(j, d)| (j, query.hamming(d)))
        .min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
}

/// Brute-force Hamming matching keeping only mutual best matches
pub fn cross_check_match(first: &[Descriptor], second: &[Descriptor]) -> Vec<DescriptorMatch> {
    if first.is_empty() || second.is_empty() {
        return Vec::new();
    }

    let forward: Vec<(usize, u32)> = first
        .par_iter()
        .map(|d| best_match(d, second).unwrap_or((usize::MAX, u32::MAX)))
        .collect();
    let backward: Vec<usize> = second
        .par_iter()
        .map(|d| best_match(d, first).map(|(i, _)| i).unwrap_or(usize::MAX))
        .collect();

    forward
        .into_iter()
        .enumerate()
        .filter_map(|(query, (train, distance))| {
            (train != usize::MAX && backward[train] == query).then_some(DescriptorMatch {
                query,
                train,
                distance,
            })
        })
        .collect()
}
