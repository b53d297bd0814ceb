use std::path::Path;

use image::imageops::FilterType;
use image::GrayImage;

use crate::error::ScoringError;

pub const CANONICAL_SIZE: u32 = 512;
const WINDOW: u32 = 7;
const K1: f64 = 0.01;
const K2: f64 = 0.03;
const DATA_RANGE: f64 = 255.0;

pub trait SimilarityScorer {
    /// Bounded similarity in [0, 1]. Pure: same inputs, same score.
    fn score(&self, a: &Path, b: &Path) -> Result<f64, ScoringError>;
}

/// Structural similarity over luma, both images forced to one square size.
#[derive(Debug, Clone, Copy)]
pub struct SsimScorer {
    size: u32,
}

impl Default for SsimScorer {
    fn default() -> Self {
        Self {
            size: CANONICAL_SIZE,
        }
    }
}

impl SsimScorer {
    pub fn with_size(size: u32) -> Self {
        Self { size: size.max(1) }
    }

    fn load(&self, path: &Path) -> Result<GrayImage, ScoringError> {
        let decoded = image::open(path).map_err(|err| ScoringError::Unreadable {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        Ok(image::imageops::resize(
            &decoded.to_luma8(),
            self.size,
            self.size,
            FilterType::Lanczos3,
        ))
    }
}

impl SimilarityScorer for SsimScorer {
    fn score(&self, a: &Path, b: &Path) -> Result<f64, ScoringError> {
        let left = self.load(a)?;
        let right = self.load(b)?;
        Ok(ssim_luma(&left, &right).clamp(0.0, 1.0))
    }
}

/// Raw mean SSIM (nominally in [-1, 1]) of two equally sized luma images.
pub fn ssim_luma(a: &GrayImage, b: &GrayImage) -> f64 {
    let width = a.width().min(b.width());
    let height = a.height().min(b.height());
    if width == 0 || height == 0 {
        return 0.0;
    }
    let window = WINDOW.min(width).min(height);
    let n = f64::from(window * window);
    let covariance_norm = if n > 1.0 { n / (n - 1.0) } else { 1.0 };
    let c1 = (K1 * DATA_RANGE).powi(2);
    let c2 = (K2 * DATA_RANGE).powi(2);

    let sums = WindowSums::build(a, b, width, height);
    let mut total = 0.0;
    let mut count = 0u64;
    for y in 0..=(height - window) {
        for x in 0..=(width - window) {
            let [sx, sy, sxx, syy, sxy] = sums.window(x, y, window);
            let mx = sx / n;
            let my = sy / n;
            let vx = (sxx / n - mx * mx) * covariance_norm;
            let vy = (syy / n - my * my) * covariance_norm;
            let vxy = (sxy / n - mx * my) * covariance_norm;
            let numerator = (2.0 * mx * my + c1) * (2.0 * vxy + c2);
            let denominator = (mx * mx + my * my + c1) * (vx + vy + c2);
            total += numerator / denominator;
            count += 1;
        }
    }
    total / count as f64
}

/// Summed-area tables for x, y, x², y² and xy.
struct WindowSums {
    stride: usize,
    tables: [Vec<f64>; 5],
}

impl WindowSums {
    fn build(a: &GrayImage, b: &GrayImage, width: u32, height: u32) -> Self {
        let stride = width as usize + 1;
        let len = stride * (height as usize + 1);
        let mut tables: [Vec<f64>; 5] = std::array::from_fn(|_| vec![0.0; len]);
        for y in 0..height {
            let mut row = [0.0f64; 5];
            for x in 0..width {
                let xv = f64::from(a.get_pixel(x, y)[0]);
                let yv = f64::from(b.get_pixel(x, y)[0]);
                let values = [xv, yv, xv * xv, yv * yv, xv * yv];
                let here = (y as usize + 1) * stride + x as usize + 1;
                let above = y as usize * stride + x as usize + 1;
                for (slot, value) in values.iter().enumerate() {
                    row[slot] += value;
                    tables[slot][here] = tables[slot][above] + row[slot];
                }
            }
        }
        Self { stride, tables }
    }

    fn window(&self, x: u32, y: u32, size: u32) -> [f64; 5] {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + size as usize, y0 + size as usize);
        std::array::from_fn(|slot| {
            let table = &self.tables[slot];
            table[y1 * self.stride + x1] - table[y0 * self.stride + x1]
                - table[y1 * self.stride + x0]
                + table[y0 * self.stride + x0]
        })
    }
}
