//! Summary statistics for residual distributions.

/// Mean and population standard deviation of a sample.
///
/// Returns `None` for an empty slice.
pub fn mean_and_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    Some((mean, var.sqrt()))
}

/// One-sided sigma-clipping threshold over a sample of non-negative contributions
/// (typically per-term chi-square values).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SigmaClip {
    pub mean: f64,
    pub sigma: f64,
    pub n_sigma: f64,
}

impl SigmaClip {
    /// Build the clip from a sample; `None` if the sample is empty.
    pub fn from_sample(values: &[f64], n_sigma: f64) -> Option<Self> {
        let (mean, sigma) = mean_and_std(values)?;
        Some(Self {
            mean,
            sigma,
            n_sigma,
        })
    }

    /// Values strictly above this are outliers.
    pub fn threshold(&self) -> f64 {
        self.mean + self.n_sigma * self.sigma
    }

    pub fn is_outlier(&self, value: f64) -> bool {
        value > self.threshold()
    }
}
