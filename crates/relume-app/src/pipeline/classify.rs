//! Degradation classifier.
//!
//! Image-statistics heuristics scoring seven degradation kinds in [0, 1].
//! Each stage that cannot produce a finite value falls back to a
//! conservative 0.0 (treat the image as clean rather than over-correct) and
//! logs a warning.

use std::collections::BTreeMap;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator};

/// Longest edge used for statistics; larger inputs are thumbnailed first.
const ANALYSIS_EDGE_PX: u32 = 256;

const LAPLACIAN_VARIANCE_REF: f64 = 0.01;
const NOISE_STDDEV_REF: f64 = 0.1;
const LOW_LIGHT_KNEE: f64 = 0.3;
const COLORFULNESS_REF: f64 = 0.3;
const CONTRAST_REF: f64 = 0.25;
const SCRATCH_EDGE_HIGH: f64 = 0.25;
const SCRATCH_EDGE_LOW: f64 = 0.08;
const CONSERVATIVE_FALLBACK: f32 = 0.0;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum DegradationKind {
    Blur,
    Noise,
    LowLight,
    Compression,
    Scratch,
    Fade,
    ColorShift,
}

/// Frozen classifier output: every kind present, every score in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationMap(BTreeMap<DegradationKind, f32>);

impl DegradationMap {
    /// Build a map from explicit scores, clamping into [0, 1] and filling
    /// missing kinds with zero.
    pub fn from_scores<I: IntoIterator<Item = (DegradationKind, f32)>>(scores: I) -> Self {
        let mut full: BTreeMap<DegradationKind, f32> =
            DegradationKind::iter().map(|kind| (kind, 0.0)).collect();
        for (kind, score) in scores {
            full.insert(kind, score.clamp(0.0, 1.0));
        }
        Self(full)
    }

    pub fn score(&self, kind: DegradationKind) -> f32 {
        self.0.get(&kind).copied().unwrap_or(0.0)
    }

    pub fn scores(&self) -> &BTreeMap<DegradationKind, f32> {
        &self.0
    }

    /// String-keyed view stored on the job record.
    pub fn to_summary(&self) -> BTreeMap<String, f32> {
        self.0
            .iter()
            .map(|(kind, score)| (kind.to_string(), *score))
            .collect()
    }
}

struct Luma {
    data: Vec<f32>,
    width: usize,
    height: usize,
}

pub fn classify(image: &DynamicImage, source_is_jpeg: bool) -> DegradationMap {
    let thumb = if image.width().max(image.height()) > ANALYSIS_EDGE_PX {
        image.thumbnail(ANALYSIS_EDGE_PX, ANALYSIS_EDGE_PX)
    } else {
        image.clone()
    };

    let luma = Luma {
        data: thumb.to_luma32f().into_raw(),
        width: thumb.width() as usize,
        height: thumb.height() as usize,
    };
    let rgb = thumb.to_rgb32f();
    let pixels: Vec<[f32; 3]> = rgb.pixels().map(|p| p.0).collect();

    let mut scores = BTreeMap::new();
    for kind in DegradationKind::iter() {
        let raw = match kind {
            DegradationKind::Blur => blur_score(&luma),
            DegradationKind::Noise => noise_score(&luma),
            DegradationKind::LowLight => low_light_score(&luma),
            DegradationKind::Compression => {
                if source_is_jpeg {
                    compression_score(&luma)
                } else {
                    Some(0.0)
                }
            }
            DegradationKind::Scratch => scratch_score(&luma),
            DegradationKind::Fade => fade_score(&pixels, &luma),
            DegradationKind::ColorShift => color_shift_score(&pixels),
        };
        let score = match raw {
            Some(value) if value.is_finite() => value.clamp(0.0, 1.0) as f32,
            _ => {
                tracing::warn!(kind = %kind, "classifier stage failed; using fallback");
                CONSERVATIVE_FALLBACK
            }
        };
        scores.insert(kind, score);
    }

    DegradationMap(scores)
}

fn mean(values: &[f32]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().map(|v| f64::from(*v)).sum::<f64>() / values.len() as f64)
}

fn variance(values: &[f32]) -> Option<f64> {
    let mu = mean(values)?;
    Some(
        values
            .iter()
            .map(|v| {
                let d = f64::from(*v) - mu;
                d * d
            })
            .sum::<f64>()
            / values.len() as f64,
    )
}

/// 3x3 box blur over the luminance plane.
fn box_blur(luma: &Luma) -> Option<Vec<f32>> {
    let (w, h) = (luma.width, luma.height);
    if w < 3 || h < 3 {
        return None;
    }
    let mut out = luma.data.clone();
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let mut sum = 0.0_f32;
            for dy in 0..3 {
                for dx in 0..3 {
                    sum += luma.data[(y + dy - 1) * w + (x + dx - 1)];
                }
            }
            out[y * w + x] = sum / 9.0;
        }
    }
    Some(out)
}

/// Variance of the Laplacian response, inverted: sharp detail scores low.
fn blur_score(luma: &Luma) -> Option<f64> {
    let (w, h) = (luma.width, luma.height);
    if w < 3 || h < 3 {
        return None;
    }
    let mut responses = Vec::with_capacity((w - 2) * (h - 2));
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = luma.data[y * w + x];
            let response = 4.0 * center
                - luma.data[(y - 1) * w + x]
                - luma.data[(y + 1) * w + x]
                - luma.data[y * w + x - 1]
                - luma.data[y * w + x + 1];
            responses.push(response);
        }
    }
    let var = variance(&responses)?;
    Some(1.0 - (var / LAPLACIAN_VARIANCE_REF).min(1.0))
}

/// Standard deviation of the high-pass residual.
fn noise_score(luma: &Luma) -> Option<f64> {
    let blurred = box_blur(luma)?;
    let residual: Vec<f32> = luma
        .data
        .iter()
        .zip(blurred.iter())
        .map(|(a, b)| a - b)
        .collect();
    let std = variance(&residual)?.sqrt();
    Some((std / NOISE_STDDEV_REF).min(1.0))
}

/// Piecewise on mean luminance: zero above the knee, linear ramp below.
fn low_light_score(luma: &Luma) -> Option<f64> {
    let mu = mean(&luma.data)?;
    if mu >= LOW_LIGHT_KNEE {
        Some(0.0)
    } else {
        Some((LOW_LIGHT_KNEE - mu) / LOW_LIGHT_KNEE)
    }
}

/// Blockiness proxy: how much variance a light blur removes.
fn compression_score(luma: &Luma) -> Option<f64> {
    let var = variance(&luma.data)?;
    if var <= f64::EPSILON {
        return Some(0.0);
    }
    let blurred = box_blur(luma)?;
    let var_blurred = variance(&blurred)?;
    let drop = (var - var_blurred) / var;
    Some((drop * 1.5).clamp(0.0, 1.0))
}

/// Density of linear high-contrast pixels over a grid sample: pixels with a
/// strong gradient along exactly one axis.
fn scratch_score(luma: &Luma) -> Option<f64> {
    let (w, h) = (luma.width, luma.height);
    if w < 3 || h < 3 {
        return None;
    }
    let step = (w.min(h) / 64).max(1);
    let mut samples = 0_u32;
    let mut linear = 0_u32;
    let mut y = 1;
    while y < h - 1 {
        let mut x = 1;
        while x < w - 1 {
            let dx = f64::from(luma.data[y * w + x + 1] - luma.data[y * w + x - 1]).abs();
            let dy = f64::from(luma.data[(y + 1) * w + x] - luma.data[(y - 1) * w + x]).abs();
            samples += 1;
            let (major, minor) = if dx > dy { (dx, dy) } else { (dy, dx) };
            if major > SCRATCH_EDGE_HIGH && minor < SCRATCH_EDGE_LOW {
                linear += 1;
            }
            x += step;
        }
        y += step;
    }
    if samples == 0 {
        return None;
    }
    Some((f64::from(linear) / f64::from(samples) * 8.0).min(1.0))
}

/// Weighted mix of washed-out color and washed-out contrast.
fn fade_score(pixels: &[[f32; 3]], luma: &Luma) -> Option<f64> {
    if pixels.is_empty() {
        return None;
    }
    let rg: Vec<f32> = pixels.iter().map(|p| p[0] - p[1]).collect();
    let yb: Vec<f32> = pixels.iter().map(|p| 0.5 * (p[0] + p[1]) - p[2]).collect();
    let std_rg = variance(&rg)?.sqrt();
    let std_yb = variance(&yb)?.sqrt();
    let mean_rg = mean(&rg)?;
    let mean_yb = mean(&yb)?;
    let colorfulness = (std_rg * std_rg + std_yb * std_yb).sqrt()
        + 0.3 * (mean_rg * mean_rg + mean_yb * mean_yb).sqrt();
    let colorfulness = (colorfulness / COLORFULNESS_REF).min(1.0);

    let contrast = (variance(&luma.data)?.sqrt() / CONTRAST_REF).min(1.0);
    Some(0.6 * (1.0 - colorfulness) + 0.4 * (1.0 - contrast))
}

/// Largest per-channel deviation from the cross-channel mean.
fn color_shift_score(pixels: &[[f32; 3]]) -> Option<f64> {
    if pixels.is_empty() {
        return None;
    }
    let n = pixels.len() as f64;
    let mut channel_means = [0.0_f64; 3];
    for pixel in pixels {
        for (slot, value) in channel_means.iter_mut().zip(pixel.iter()) {
            *slot += f64::from(*value);
        }
    }
    for slot in channel_means.iter_mut() {
        *slot /= n;
    }
    let overall = channel_means.iter().sum::<f64>() / 3.0;
    let deviation = channel_means
        .iter()
        .map(|m| (m - overall).abs())
        .fold(0.0, f64::max);
    Some((deviation * 4.0).min(1.0))
}
