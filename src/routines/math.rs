//! Numerical helpers for spectral integration and energy binning

/// Number of Simpson intervals used per integration range
pub const INTEGRATION_STEPS: usize = 16;

/// Integrate `f` from `emin` to `emax` with Simpson's rule in log-energy
///
/// Spectra spanning decades are close to power laws, which are smooth in `ln E`.
/// The substitution `E = exp(u)` gives `∫ f(E) dE = ∫ f(exp(u)) exp(u) du`.
pub fn integrate_log<F>(f: F, emin: f64, emax: f64) -> f64
where
    F: Fn(f64) -> f64,
{
    if emin <= 0.0 || emax <= emin {
        return 0.0;
    }
    let (a, b) = (emin.ln(), emax.ln());
    let n = INTEGRATION_STEPS;
    let h = (b - a) / n as f64;
    let g = |u: f64| {
        let e = u.exp();
        f(e) * e
    };

    let mut sum = g(a) + g(b);
    for i in 1..n {
        let weight = if i % 2 == 1 { 4.0 } else { 2.0 };
        sum += weight * g(a + i as f64 * h);
    }
    sum * h / 3.0
}

/// Geometric mean of the bin edges, the usual reference energy of a bin
#[inline]
pub fn log_center(emin: f64, emax: f64) -> f64 {
    (emin * emax).sqrt()
}

/// `n` logarithmically spaced bins between `emin` and `emax`, returned as `n + 1` edges
pub fn log_edges(emin: f64, emax: f64, n: usize) -> Vec<f64> {
    let (a, b) = (emin.ln(), emax.ln());
    (0..=n)
        .map(|i| (a + (b - a) * i as f64 / n as f64).exp())
        .collect()
}
