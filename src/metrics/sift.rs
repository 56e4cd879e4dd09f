//! Scale-invariant keypoints and ratio-test matching.
//!
//! Detection follows Lowe's difference-of-Gaussian construction: extrema of
//! the DoG stack are refined to subpixel accuracy, low-contrast and edge-like
//! responses are dropped, every survivor gets one keypoint per dominant
//! gradient orientation, and a 4x4x8 gradient histogram describes it.

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::filter::gaussian_blur_f32;
use imageproc::map::map_colors2;
use rayon::prelude::*;
use std::collections::HashSet;
use std::f32::consts::PI;

use super::{MetricComparator, MetricKind};
use crate::config::SiftParams;
use crate::error::Result;
use crate::preprocess::PreparedPair;

/// Blur assumed to be present in the input image
const INITIAL_SIGMA: f32 = 0.5;
const IMAGE_BORDER: usize = 5;
const MAX_INTERP_STEPS: usize = 5;
const ORI_BINS: usize = 36;
const ORI_SIG_FACTOR: f32 = 1.5;
const ORI_RADIUS_FACTOR: f32 = 3.0 * ORI_SIG_FACTOR;
const ORI_PEAK_RATIO: f32 = 0.8;
const DESC_WIDTH: usize = 4;
const DESC_BINS: usize = 8;
const DESC_SCALE_FACTOR: f32 = 3.0;
const DESC_MAG_THRESHOLD: f32 = 0.2;
/// Smallest octave side that still leaves room for the border
const MIN_OCTAVE_SIDE: usize = 16;

pub const DESCRIPTOR_LEN: usize = DESC_WIDTH * DESC_WIDTH * DESC_BINS;

/// SIFT matching: accepted ratio-test matches per average keypoint count,
/// as a percentage.
#[derive(Debug, Clone)]
pub struct SiftComparator {
    params: SiftParams,
}

impl SiftComparator {
    pub fn new(params: SiftParams) -> Self {
        Self { params }
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
        let (features1, features2) = rayon::join(
            || detect_and_compute(&pair.first, &self.params),
            || detect_and_compute(&pair.second, &self.params),
        );

        if features1.is_empty() || features2.is_empty() {
            log::debug!(
                "sift: no keypoints ({} / {}), scoring 0",
                features1.len(),
                features2.len()
            );
            return Ok(0.0);
        }

        let good = ratio_test_matches(
            &features1.descriptors,
            &features2.descriptors,
            self.params.ratio_threshold,
        );
        let average = (features1.len() + features2.len()) as f64 / 2.0;

        log::debug!(
            "sift: {} / {} keypoints, {} matches pass the ratio test",
            features1.len(),
            features2.len(),
            good
        );

        Ok((good as f64 / average * 100.0).clamp(0.0, 100.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiftKeypoint {
    /// Position in base image coordinates
    pub x: f32,
    pub y: f32,
    /// Scale in base image pixels
    pub sigma: f32,
    /// Dominant gradient orientation in degrees
    pub angle: f32,
    pub response: f32,
    pub octave: usize,
}

pub type SiftDescriptor = [f32; DESCRIPTOR_LEN];

#[derive(Debug, Clone, Default)]
pub struct SiftFeatures {
    pub keypoints: Vec<SiftKeypoint>,
    pub descriptors: Vec<SiftDescriptor>,
}

impl SiftFeatures {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Single-channel float image with intensities in [0, 1]
type Plane = ImageBuffer<Luma<f32>, Vec<f32>>;

trait PlaneExt {
    fn at(&self, x: usize, y: usize) -> f32;
    fn w(&self) -> usize;
    fn h(&self) -> usize;
}

impl PlaneExt for Plane {
    #[inline]
    fn at(&self, x: usize, y: usize) -> f32 {
        self.as_raw()[y * self.width() as usize + x]
    }

    fn w(&self) -> usize {
        self.width() as usize
    }

    fn h(&self) -> usize {
        self.height() as usize
    }
}

fn to_plane(image: &GrayImage) -> Plane {
    ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
        Luma([image.get_pixel(x, y)[0] as f32 / 255.0])
    })
}

fn blur(plane: &Plane, sigma: f32) -> Plane {
    if sigma <= 0.0 {
        return plane.clone();
    }
    gaussian_blur_f32(plane, sigma)
}

/// Keep every second pixel in both directions
fn halve(plane: &Plane) -> Plane {
    ImageBuffer::from_fn(plane.width() / 2, plane.height() / 2, |x, y| {
        *plane.get_pixel(x * 2, y * 2)
    })
}

fn difference(upper: &Plane, lower: &Plane) -> Plane {
    map_colors2(upper, lower, |a: Luma<f32>, b: Luma<f32>| Luma([a[0] - b[0]]))
}

struct Octave {
    gaussians: Vec<Plane>,
    dogs: Vec<Plane>,
}

fn build_scale_space(image: &GrayImage, params: &SiftParams) -> Vec<Octave> {
    let min_side = image.width().min(image.height()) as usize;
    if min_side < MIN_OCTAVE_SIDE {
        return Vec::new();
    }
    let octave_count = ((min_side as f32).log2().floor() as usize)
        .saturating_sub(MIN_OCTAVE_SIDE.ilog2() as usize - 1)
        .max(1);

    let layers = params.octave_layers;
    let k = 2f32.powf(1.0 / layers as f32);
    let mut increments = vec![params.sigma; layers + 3];
    for (i, inc) in increments.iter_mut().enumerate().skip(1) {
        let previous = params.sigma * k.powi(i as i32 - 1);
        let total = previous * k;
        *inc = (total * total - previous * previous).sqrt();
    }

    let initial = (params.sigma * params.sigma - INITIAL_SIGMA * INITIAL_SIGMA)
        .max(0.01)
        .sqrt();
    let mut base = blur(&to_plane(image), initial);

    let mut octaves = Vec::with_capacity(octave_count);
    for o in 0..octave_count {
        if o > 0 {
            let previous: &Octave = &octaves[o - 1];
            base = halve(&previous.gaussians[layers]);
        }
        let mut gaussians = Vec::with_capacity(layers + 3);
        gaussians.push(base.clone());
        for inc in increments.iter().skip(1) {
            let next = blur(&gaussians[gaussians.len() - 1], *inc);
            gaussians.push(next);
        }
        let dogs = gaussians.windows(2).map(|w| difference(&w[1], &w[0])).collect();
        octaves.push(Octave { gaussians, dogs });
    }
    octaves
}

/// A refined DoG extremum before orientation assignment
#[derive(Debug, Clone, Copy)]
struct Extremum {
    octave: usize,
    layer: usize,
    x: usize,
    y: usize,
    offset: [f32; 3],
    response: f32,
}

fn is_extremum(dogs: &[Plane], layer: usize, x: usize, y: usize) -> bool {
    let value = dogs[layer].at(x, y);
    let mut is_max = value > 0.0;
    let mut is_min = value < 0.0;
    for plane in &dogs[layer - 1..=layer + 1] {
        for ny in y - 1..=y + 1 {
            for nx in x - 1..=x + 1 {
                let neighbor = plane.at(nx, ny);
                is_max &= value >= neighbor;
                is_min &= value <= neighbor;
            }
        }
        if !is_max && !is_min {
            return false;
        }
    }
    is_max || is_min
}

/// Solve the 3x3 system `h * x = b` by Cramer's rule
fn solve3(h: [[f32; 3]; 3], b: [f32; 3]) -> Option<[f32; 3]> {
    let det = |m: [[f32; 3]; 3]| {
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    };
    let d = det(h);
    if d.abs() < 1e-12 {
        return None;
    }
    let mut solution = [0.0; 3];
    for (col, value) in solution.iter_mut().enumerate() {
        let mut m = h;
        for row in 0..3 {
            m[row][col] = b[row];
        }
        *value = det(m) / d;
    }
    Some(solution)
}

fn refine(
    octave: &Octave,
    octave_index: usize,
    mut layer: usize,
    mut x: usize,
    mut y: usize,
    params: &SiftParams,
) -> Option<Extremum> {
    let layers = params.octave_layers;
    let dogs = &octave.dogs;
    let (width, height) = (dogs[0].w(), dogs[0].h());

    let mut offset = [0.0f32; 3];
    let mut gradient = [0.0f32; 3];
    let mut converged = false;

    for _ in 0..MAX_INTERP_STEPS {
        let (prev, cur, next) = (&dogs[layer - 1], &dogs[layer], &dogs[layer + 1]);
        let v = cur.at(x, y);
        gradient = [
            (cur.at(x + 1, y) - cur.at(x - 1, y)) * 0.5,
            (cur.at(x, y + 1) - cur.at(x, y - 1)) * 0.5,
            (next.at(x, y) - prev.at(x, y)) * 0.5,
        ];
        let dxx = cur.at(x + 1, y) + cur.at(x - 1, y) - 2.0 * v;
        let dyy = cur.at(x, y + 1) + cur.at(x, y - 1) - 2.0 * v;
        let dss = next.at(x, y) + prev.at(x, y) - 2.0 * v;
        let dxy = (cur.at(x + 1, y + 1) - cur.at(x - 1, y + 1) - cur.at(x + 1, y - 1)
            + cur.at(x - 1, y - 1))
            * 0.25;
        let dxs = (next.at(x + 1, y) - next.at(x - 1, y) - prev.at(x + 1, y) + prev.at(x - 1, y))
            * 0.25;
        let dys = (next.at(x, y + 1) - next.at(x, y - 1) - prev.at(x, y + 1) + prev.at(x, y - 1))
            * 0.25;
        let hessian = [[dxx, dxy, dxs], [dxy, dyy, dys], [dxs, dys, dss]];

        let step = solve3(hessian, gradient)?;
        offset = [-step[0], -step[1], -step[2]];

        if offset.iter().all(|o| o.abs() < 0.5) {
            converged = true;
            break;
        }
        if offset.iter().any(|o| o.abs() > (i32::MAX / 3) as f32) {
            return None;
        }

        let nx = x as i64 + offset[0].round() as i64;
        let ny = y as i64 + offset[1].round() as i64;
        let nl = layer as i64 + offset[2].round() as i64;
        if nl < 1
            || nl > layers as i64
            || nx < IMAGE_BORDER as i64
            || nx >= (width - IMAGE_BORDER) as i64
            || ny < IMAGE_BORDER as i64
            || ny >= (height - IMAGE_BORDER) as i64
        {
            return None;
        }
        x = nx as usize;
        y = ny as usize;
        layer = nl as usize;
    }
    if !converged {
        return None;
    }

    let contrast = dogs[layer].at(x, y)
        + 0.5 * (gradient[0] * offset[0] + gradient[1] * offset[1] + gradient[2] * offset[2]);
    if contrast.abs() * (layers as f32) < params.contrast_threshold {
        return None;
    }

    let cur = &dogs[layer];
    let v = cur.at(x, y);
    let dxx = cur.at(x + 1, y) + cur.at(x - 1, y) - 2.0 * v;
    let dyy = cur.at(x, y + 1) + cur.at(x, y - 1) - 2.0 * v;
    let dxy = (cur.at(x + 1, y + 1) - cur.at(x - 1, y + 1) - cur.at(x + 1, y - 1)
        + cur.at(x - 1, y - 1))
        * 0.25;
    let trace = dxx + dyy;
    let det = dxx * dyy - dxy * dxy;
    let r = params.edge_threshold;
    if det <= 0.0 || trace * trace * r >= (r + 1.0) * (r + 1.0) * det {
        return None;
    }

    Some(Extremum {
        octave: octave_index,
        layer,
        x,
        y,
        offset,
        response: contrast.abs(),
    })
}

fn find_extrema(octaves: &[Octave], params: &SiftParams) -> Vec<Extremum> {
    let layers = params.octave_layers;
    let prefilter = 0.5 * params.contrast_threshold / layers as f32;
    let mut extrema = Vec::new();
    let mut seen = HashSet::new();

    for (o, octave) in octaves.iter().enumerate() {
        let (width, height) = (octave.dogs[0].w(), octave.dogs[0].h());
        if width <= 2 * IMAGE_BORDER || height <= 2 * IMAGE_BORDER {
            continue;
        }
        for layer in 1..=layers {
            let found: Vec<Extremum> = (IMAGE_BORDER..height - IMAGE_BORDER)
                .into_par_iter()
                .flat_map_iter(|y| {
                    (IMAGE_BORDER..width - IMAGE_BORDER).filter_map(move |x| {
                        let value = octave.dogs[layer].at(x, y);
                        if value.abs() <= prefilter || !is_extremum(&octave.dogs, layer, x, y) {
                            return None;
                        }
                        refine(octave, o, layer, x, y, params)
                    })
                })
                .collect();
            for extremum in found {
                // refinement can walk two starting points onto the same sample
                if seen.insert((extremum.octave, extremum.layer, extremum.x, extremum.y)) {
                    extrema.push(extremum);
                }
            }
        }
    }
    extrema
}

/// Scale of an extremum relative to its own octave
fn octave_sigma(extremum: &Extremum, params: &SiftParams) -> f32 {
    let layers = params.octave_layers as f32;
    params.sigma * 2f32.powf((extremum.layer as f32 + extremum.offset[2]) / layers)
}

#[inline]
fn gradient(plane: &Plane, x: usize, y: usize) -> (f32, f32) {
    let dx = plane.at(x + 1, y) - plane.at(x - 1, y);
    let dy = plane.at(x, y - 1) - plane.at(x, y + 1);
    (dx, dy)
}

/// Dominant gradient orientations (degrees) around an extremum
fn orientations(plane: &Plane, x: usize, y: usize, sigma: f32) -> Vec<f32> {
    let radius = (ORI_RADIUS_FACTOR * sigma).round() as i64;
    let weight_sigma = ORI_SIG_FACTOR * sigma;
    let denom = -1.0 / (2.0 * weight_sigma * weight_sigma);
    let mut hist = [0.0f32; ORI_BINS];

    for dy in -radius..=radius {
        let py = y as i64 + dy;
        if py <= 0 || py >= plane.h() as i64 - 1 {
            continue;
        }
        for dx in -radius..=radius {
            let px = x as i64 + dx;
            if px <= 0 || px >= plane.w() as i64 - 1 {
                continue;
            }
            let (gx, gy) = gradient(plane, px as usize, py as usize);
            let magnitude = (gx * gx + gy * gy).sqrt();
            let weight = (((dx * dx + dy * dy) as f32) * denom).exp();
            let angle = gy.atan2(gx).to_degrees().rem_euclid(360.0);
            let bin = ((angle * ORI_BINS as f32 / 360.0).round() as usize) % ORI_BINS;
            hist[bin] += weight * magnitude;
        }
    }

    let n = ORI_BINS;
    let smoothed: Vec<f32> = (0..n)
        .map(|i| {
            (hist[(i + n - 2) % n] + hist[(i + 2) % n]) * (1.0 / 16.0)
                + (hist[(i + n - 1) % n] + hist[(i + 1) % n]) * (4.0 / 16.0)
                + hist[i] * (6.0 / 16.0)
        })
        .collect();

    let max = smoothed.iter().cloned().fold(0.0f32, f32::max);
    if max <= 0.0 {
        return Vec::new();
    }
    let threshold = max * ORI_PEAK_RATIO;

    (0..n)
        .filter_map(|i| {
            let left = smoothed[(i + n - 1) % n];
            let right = smoothed[(i + 1) % n];
            let center = smoothed[i];
            if center > left && center > right && center >= threshold {
                let shift = 0.5 * (left - right) / (left - 2.0 * center + right);
                let bin = (i as f32 + shift).rem_euclid(n as f32);
                Some(bin * 360.0 / n as f32)
            } else {
                None
            }
        })
        .collect()
}

fn describe(plane: &Plane, x: usize, y: usize, sigma: f32, angle: f32) -> SiftDescriptor {
    let d = DESC_WIDTH as f32;
    let n = DESC_BINS as f32;
    let hist_width = DESC_SCALE_FACTOR * sigma;
    let max_radius = ((plane.w() * plane.w() + plane.h() * plane.h()) as f32).sqrt();
    let radius = (hist_width * std::f32::consts::SQRT_2 * (d + 1.0) * 0.5)
        .round()
        .min(max_radius) as i64;
    let (sin_t, cos_t) = (angle * PI / 180.0).sin_cos();
    let (sin_t, cos_t) = (sin_t / hist_width, cos_t / hist_width);
    let exp_scale = -1.0 / (d * d * 0.5);
    let bins_per_degree = n / 360.0;

    let mut hist = [0.0f32; DESCRIPTOR_LEN];
    let mut accumulate = |row: i64, col: i64, ori: i64, value: f32| {
        if (0..DESC_WIDTH as i64).contains(&row) && (0..DESC_WIDTH as i64).contains(&col) {
            let ori = ori.rem_euclid(DESC_BINS as i64) as usize;
            hist[(row as usize * DESC_WIDTH + col as usize) * DESC_BINS + ori] += value;
        }
    };

    for i in -radius..=radius {
        for j in -radius..=radius {
            let c_rot = j as f32 * cos_t - i as f32 * sin_t;
            let r_rot = j as f32 * sin_t + i as f32 * cos_t;
            let rbin = r_rot + d / 2.0 - 0.5;
            let cbin = c_rot + d / 2.0 - 0.5;
            if rbin <= -1.0 || rbin >= d || cbin <= -1.0 || cbin >= d {
                continue;
            }
            let py = y as i64 + i;
            let px = x as i64 + j;
            if py <= 0 || py >= plane.h() as i64 - 1 || px <= 0 || px >= plane.w() as i64 - 1 {
                continue;
            }

            let (gx, gy) = gradient(plane, px as usize, py as usize);
            let magnitude = (gx * gx + gy * gy).sqrt();
            let weight = ((c_rot * c_rot + r_rot * r_rot) * exp_scale).exp();
            let ori = gy.atan2(gx).to_degrees();
            let obin = (ori - angle).rem_euclid(360.0) * bins_per_degree;
            let value = magnitude * weight;

            let (r0, c0, o0) = (rbin.floor(), cbin.floor(), obin.floor());
            let (fr, fc, fo) = (rbin - r0, cbin - c0, obin - o0);
            let (r0, c0, o0) = (r0 as i64, c0 as i64, o0 as i64);

            for (dr, wr) in [(0, 1.0 - fr), (1, fr)] {
                for (dc, wc) in [(0, 1.0 - fc), (1, fc)] {
                    for (dori, wo) in [(0, 1.0 - fo), (1, fo)] {
                        accumulate(r0 + dr, c0 + dc, o0 + dori, value * wr * wc * wo);
                    }
                }
            }
        }
    }

    let norm = hist.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        let cap = norm * DESC_MAG_THRESHOLD;
        hist.iter_mut().for_each(|v| *v = v.min(cap));
        let norm = hist.iter().map(|v| v * v).sum::<f32>().sqrt().max(f32::EPSILON);
        hist.iter_mut().for_each(|v| *v /= norm);
    }
    hist
}

/// Detect keypoints on a full-resolution grayscale image and describe them
pub fn detect_and_compute(image: &GrayImage, params: &SiftParams) -> SiftFeatures {
    let octaves = build_scale_space(image, params);
    let extrema = find_extrema(&octaves, params);

    let mut described: Vec<(SiftKeypoint, SiftDescriptor)> = extrema
        .par_iter()
        .flat_map_iter(|extremum| {
            let octave = &octaves[extremum.octave];
            let plane = &octave.gaussians[extremum.layer];
            let sigma = octave_sigma(extremum, params);
            let scale = 2f32.powi(extremum.octave as i32);
            orientations(plane, extremum.x, extremum.y, sigma)
                .into_iter()
                .map(move |angle| {
                    let keypoint = SiftKeypoint {
                        x: (extremum.x as f32 + extremum.offset[0]) * scale,
                        y: (extremum.y as f32 + extremum.offset[1]) * scale,
                        sigma: sigma * scale,
                        angle,
                        response: extremum.response,
                        octave: extremum.octave,
                    };
                    (keypoint, describe(plane, extremum.x, extremum.y, sigma, angle))
                })
        })
        .collect();

    if let Some(limit) = params.max_keypoints {
        described.sort_by(|a, b| b.0.response.total_cmp(&a.0.response));
        described.truncate(limit);
    }

    let (keypoints, descriptors) = described.into_iter().unzip();
    SiftFeatures {
        keypoints,
        descriptors,
    }
}

fn euclidean(a: &SiftDescriptor, b: &SiftDescriptor) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Two nearest neighbours of `query` in `train` as (distance, distance)
fn two_nearest(query: &SiftDescriptor, train: &[SiftDescriptor]) -> Option<(f32, f32)> {
    if train.len() < 2 {
        return None;
    }
    let mut best = f32::INFINITY;
    let mut second = f32::INFINITY;
    for candidate in train {
        let distance = euclidean(query, candidate);
        if distance < best {
            second = best;
            best = distance;
        } else if distance < second {
            second = distance;
        }
    }
    Some((best, second))
}

/// Number of query descriptors whose nearest neighbour is clearly closer
/// than the second nearest
pub fn ratio_test_matches(first: &[SiftDescriptor], second: &[SiftDescriptor], ratio: f32) -> usize {
    first
        .par_iter()
        .filter(|query| match two_nearest(query, second) {
            Some((best, runner_up)) => best < ratio * runner_up,
            None => false,
        })
        .count()
}
