use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};

/// Blocky RGB noise; every 8x8 block has its own color
pub fn textured_rgb(size: u32, seed: u64) -> RgbImage {
    let block = 8;
    let cols = size.div_ceil(block);
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state >> 24) as u8
    };
    let values: Vec<[u8; 3]> = (0..cols * cols).map(|_| [next(), next(), next()]).collect();
    RgbImage::from_fn(size, size, |x, y| Rgb(values[((y / block) * cols + x / block) as usize]))
}

pub fn write_textured(dir: &Path, name: &str, size: u32, seed: u64) -> PathBuf {
    let path = dir.join(name);
    textured_rgb(size, seed).save(&path).unwrap();
    path
}

pub fn write_flat(dir: &Path, name: &str, size: u32, value: u8) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_pixel(size, size, Rgb([value; 3])).save(&path).unwrap();
    path
}

pub fn arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
