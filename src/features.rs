//! Feature extraction from signal windows.
//!
//! An extractor turns one source's [`SignalWindow`] into a [`FeatureSet`]:
//! spectral slope, lag-1 autocorrelation, volatility, a data quality score,
//! plus any domain sub-scores. Extraction is deterministic: identical windows
//! produce identical features.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;

use crate::buffer::SignalWindow;

const EPS: f64 = 1e-12;

/// Fraction of IQR outliers tolerated before quality is penalized.
pub const OUTLIER_ALLOWANCE: f64 = 0.05;

/// Frequency band (cycles per sample) used for the spectral slope fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectralBand {
    pub low: f64,
    pub high: f64,
}

impl Default for SpectralBand {
    fn default() -> Self {
        Self { low: 0.0, high: 0.5 }
    }
}

impl SpectralBand {
    pub fn is_valid(&self) -> bool {
        self.low.is_finite()
            && self.high.is_finite()
            && self.low >= 0.0
            && self.low < self.high
            && self.high <= 0.5
    }
}

/// Per-tick parameters handed to every extractor, read from live config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractionParams {
    /// Windows shorter than this yield an empty, zero-quality feature set
    pub min_window: usize,
    pub band: SpectralBand,
}

impl Default for ExtractionParams {
    fn default() -> Self {
        Self {
            min_window: 10,
            band: SpectralBand::default(),
        }
    }
}

/// Features for one source, produced fresh each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub source_id: String,
    /// Log-log slope of the power spectrum; flattening towards 0 means instability
    pub spectral_slope: f64,
    /// Variance of the window; zero means there is no spectrum to fit
    pub spectral_power: f64,
    /// Lag-1 autocorrelation of the demeaned window
    pub autocorrelation: f64,
    /// Std of first differences, relative to the window mean when non-zero
    pub volatility: f64,
    /// 1.0 minus data quality penalties, clamped to [0, 1]
    pub quality_score: f64,
    pub sample_count: usize,
    /// Domain sub-scores, each expected in [0, 1]
    pub domain_fields: BTreeMap<String, f64>,
}

impl FeatureSet {
    /// Zeroed set signalling "not yet confident".
    pub fn empty(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            spectral_slope: 0.0,
            spectral_power: 0.0,
            autocorrelation: 0.0,
            volatility: 0.0,
            quality_score: 0.0,
            sample_count: 0,
            domain_fields: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    pub fn with_field(mut self, name: &str, value: f64) -> Self {
        self.domain_fields.insert(name.to_string(), value);
        self
    }
}

/// Pluggable per-domain feature logic.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, window: &SignalWindow, params: &ExtractionParams) -> FeatureSet;
}

impl<F> FeatureExtractor for F
where
    F: Fn(&SignalWindow, &ExtractionParams) -> FeatureSet + Send + Sync,
{
    fn extract(&self, window: &SignalWindow, params: &ExtractionParams) -> FeatureSet {
        self(window, params)
    }
}

/// The structural features every domain shares.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardExtractor;

impl FeatureExtractor for StandardExtractor {
    fn extract(&self, window: &SignalWindow, params: &ExtractionParams) -> FeatureSet {
        standard_features(window, params)
    }
}

/// Compute the shared feature set. Non-finite values are excluded from the
/// statistics and penalized in the quality score.
pub fn standard_features(window: &SignalWindow, params: &ExtractionParams) -> FeatureSet {
    let raw = window.values();
    let values: Vec<f64> = raw.iter().copied().filter(|v| v.is_finite()).collect();
    if values.len() < params.min_window.max(2) {
        return FeatureSet::empty(&window.source_id);
    }

    let (spectral_slope, spectral_power) = spectral_slope(&values, &params.band);
    FeatureSet {
        source_id: window.source_id.clone(),
        spectral_slope,
        spectral_power,
        autocorrelation: lag1_autocorrelation(&values),
        volatility: relative_volatility(&values),
        quality_score: quality_score(&raw, window.missing as usize),
        sample_count: values.len(),
        domain_fields: BTreeMap::new(),
    }
}

// =============================================================================
// Statistical kernels
// =============================================================================

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Population variance
pub fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

/// Linearly interpolated percentile, `p` in [0, 1].
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pos = (sorted.len() - 1) as f64 * p.clamp(0.0, 1.0);
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Lag-1 autocorrelation over the demeaned window.
///
/// A constant window is perfectly persistent and returns 1.0.
pub fn lag1_autocorrelation(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let dev: Vec<f64> = values.iter().map(|v| v - m).collect();
    let denom: f64 = dev.iter().map(|d| d * d).sum();
    if denom < EPS {
        return 1.0;
    }
    let num: f64 = dev.windows(2).map(|w| w[0] * w[1]).sum();
    (num / denom).clamp(-1.0, 1.0)
}

/// Population std of first differences, divided by |mean| when the mean is
/// meaningfully non-zero.
pub fn relative_volatility(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    let std = variance(&diffs).sqrt();
    let m = mean(values).abs();
    if m > 1e-9 {
        std / m
    } else {
        std
    }
}

/// Periodogram of the demeaned signal for bins 1..=n/2.
///
/// Direct DFT; windows are a few hundred samples at most.
pub fn power_spectrum(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return Vec::new();
    }
    let m = mean(values);
    let half = n / 2;
    let mut psd = Vec::with_capacity(half);
    for k in 1..=half {
        let mut re = 0.0;
        let mut im = 0.0;
        for (t, v) in values.iter().enumerate() {
            let angle = -2.0 * PI * (k * t) as f64 / n as f64;
            re += (v - m) * angle.cos();
            im += (v - m) * angle.sin();
        }
        psd.push((re * re + im * im) / n as f64);
    }
    psd
}

/// Least-squares slope of log power against log frequency inside `band`.
///
/// Returns `(slope, variance)`. A window without variance, or with fewer than
/// three usable bins, has slope 0.
pub fn spectral_slope(values: &[f64], band: &SpectralBand) -> (f64, f64) {
    let power = variance(values);
    if power < EPS {
        return (0.0, 0.0);
    }

    let n = values.len() as f64;
    let psd = power_spectrum(values);
    let points: Vec<(f64, f64)> = psd
        .iter()
        .enumerate()
        .filter_map(|(i, &p)| {
            let freq = (i + 1) as f64 / n;
            (freq >= band.low && freq <= band.high && p > EPS).then(|| (freq.ln(), p.ln()))
        })
        .collect();

    if points.len() < 3 {
        return (0.0, power);
    }

    let mx = points.iter().map(|p| p.0).sum::<f64>() / points.len() as f64;
    let my = points.iter().map(|p| p.1).sum::<f64>() / points.len() as f64;
    let sxx: f64 = points.iter().map(|p| (p.0 - mx).powi(2)).sum();
    let sxy: f64 = points.iter().map(|p| (p.0 - mx) * (p.1 - my)).sum();
    if sxx < EPS {
        return (0.0, power);
    }
    (sxy / sxx, power)
}

/// 1.0 minus penalties for missing samples, non-finite values and IQR
/// outliers beyond [`OUTLIER_ALLOWANCE`].
pub fn quality_score(raw: &[f64], missing: usize) -> f64 {
    let expected = raw.len() + missing;
    if expected == 0 {
        return 0.0;
    }
    let finite: Vec<f64> = raw.iter().copied().filter(|v| v.is_finite()).collect();
    let non_finite = raw.len() - finite.len();

    let mut score = 1.0;
    score -= missing as f64 / expected as f64;
    score -= non_finite as f64 / expected as f64;

    if finite.len() >= 4 {
        let q1 = percentile(&finite, 0.25);
        let q3 = percentile(&finite, 0.75);
        let iqr = q3 - q1;
        let (lo, hi) = (q1 - 1.5 * iqr, q3 + 1.5 * iqr);
        let outliers = finite.iter().filter(|&&v| v < lo || v > hi).count();
        let frac = outliers as f64 / finite.len() as f64;
        score -= (frac - OUTLIER_ALLOWANCE).max(0.0);
    }

    score.clamp(0.0, 1.0)
}
