//! Fit statistics
//!
//! All statistics follow the `-2 ln L` convention, so that differences between two
//! evaluations are distributed as a chi-square in the large-sample limit.

use ndarray::{Array1, Zip};

/// Predicted counts are truncated to this value before taking the logarithm
pub const TRUNCATION_VALUE: f64 = 1e-25;

/// Cash statistic for Poisson-distributed counts `n` given the prediction `mu`
///
/// `C = 2 (mu - n ln mu)`
#[inline]
pub fn cash(n: f64, mu: f64) -> f64 {
    let mu = mu.max(TRUNCATION_VALUE);
    2.0 * (mu - n * mu.ln())
}

/// Element-wise [cash] statistic
pub fn cash_array(counts: &Array1<f64>, npred: &Array1<f64>) -> Array1<f64> {
    Zip::from(counts)
        .and(npred)
        .map_collect(|&n, &mu| cash(n, mu))
}

/// Background estimate which maximises the ON/OFF likelihood for a given signal
///
/// This is the profile of the Poisson likelihood of both regions over the unknown background,
/// where `alpha` is the ON/OFF exposure ratio.
#[inline]
pub fn wstat_mu_bkg(n_on: f64, n_off: f64, alpha: f64, mu_sig: f64) -> f64 {
    let c = alpha * (n_on + n_off) - (1.0 + alpha) * mu_sig;
    let d = (c * c + 4.0 * alpha * (alpha + 1.0) * n_off * mu_sig).sqrt();
    ((c + d) / (2.0 * alpha * (alpha + 1.0))).max(0.0)
}

/// WStat statistic for an ON/OFF measurement with profiled background
///
/// The saturated-model terms are included, so a prediction matching the data gives zero.
pub fn wstat(n_on: f64, n_off: f64, alpha: f64, mu_sig: f64) -> f64 {
    let mu_bkg = wstat_mu_bkg(n_on, n_off, alpha, mu_sig);
    let mut stat = mu_sig + (1.0 + alpha) * mu_bkg;
    if n_on > 0.0 {
        stat -= n_on * (mu_sig + alpha * mu_bkg).max(TRUNCATION_VALUE).ln();
        stat -= n_on * (1.0 - n_on.ln());
    }
    if n_off > 0.0 {
        stat -= n_off * mu_bkg.max(TRUNCATION_VALUE).ln();
        stat -= n_off * (1.0 - n_off.ln());
    }
    2.0 * stat
}

/// Element-wise [wstat] statistic
pub fn wstat_array(
    n_on: &Array1<f64>,
    n_off: &Array1<f64>,
    alpha: &Array1<f64>,
    mu_sig: &Array1<f64>,
) -> Array1<f64> {
    Zip::from(n_on)
        .and(n_off)
        .and(alpha)
        .and(mu_sig)
        .map_collect(|&on, &off, &a, &mu| wstat(on, off, a, mu))
}

/// Chi-square contribution of a single measurement
#[inline]
pub fn chi2(data: f64, model: f64, error: f64) -> f64 {
    ((data - model) / error).powi(2)
}

/// Element-wise [chi2] statistic
pub fn chi2_array(data: &Array1<f64>, model: &Array1<f64>, error: &Array1<f64>) -> Array1<f64> {
    Zip::from(data)
        .and(model)
        .and(error)
        .map_collect(|&d, &m, &e| chi2(d, m, e))
}
