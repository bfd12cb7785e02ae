use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use argmin::core::{CostFunction, Error, Executor};
use argmin::solver::brent::{BrentOpt, BrentRoot};
use ndarray::Array1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::datasets::{check_edges, Datasets, FluxPointsDataset};
use crate::models::spectral::ScaledSpectralModel;
use crate::models::SkyModel;
use crate::routines::math::log_center;
use crate::routines::output::OutputFile;
use crate::routines::settings::{FluxPointsSettings, Settings};
use crate::structs::parameter::Parameter;

const BRENT_MAX_ITERS: u64 = 200;
const BRENT_TOLERANCE: f64 = 1e-6;

/// Estimated flux in a single energy bin
///
/// The flux is expressed as a `norm` relative to the source model evaluated at `e_ref`. Errors
/// and upper limits that cannot be bracketed within the norm range are NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluxPoint {
    pub e_min: f64,
    pub e_max: f64,
    pub e_ref: f64,
    /// Differential flux of the source model at `e_ref`, in `cm-2 s-1 TeV-1`
    pub ref_dnde: f64,
    pub norm: f64,
    pub norm_errn: f64,
    pub norm_errp: f64,
    pub norm_ul: f64,
    /// Test statistic of the source in the bin, `stat(norm = 0) - stat(norm)`
    pub ts: f64,
    /// Observed counts in the bin, NaN when no dataset holds counts
    pub counts: f64,
    pub is_ul: bool,
}

impl FluxPoint {
    /// A point without data in its bin: every estimated quantity is NaN
    fn undefined(e_min: f64, e_max: f64, e_ref: f64, ref_dnde: f64) -> Self {
        FluxPoint {
            e_min,
            e_max,
            e_ref,
            ref_dnde,
            norm: f64::NAN,
            norm_errn: f64::NAN,
            norm_errp: f64::NAN,
            norm_ul: f64::NAN,
            ts: f64::NAN,
            counts: f64::NAN,
            is_ul: false,
        }
    }

    /// Whether the bin held any data to estimate the flux from
    pub fn is_defined(&self) -> bool {
        !self.norm.is_nan()
    }

    pub fn dnde(&self) -> f64 {
        self.norm * self.ref_dnde
    }

    pub fn e2dnde(&self) -> f64 {
        self.e_ref * self.e_ref * self.dnde()
    }

    pub fn sqrt_ts(&self) -> f64 {
        self.ts.max(0.0).sqrt()
    }
}

/// A spectral energy distribution, one [FluxPoint] per energy bin
#[derive(Debug, Clone, Default)]
pub struct FluxPoints {
    pub source: String,
    pub points: Vec<FluxPoint>,
}

impl FluxPoints {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FluxPoint> {
        self.points.iter()
    }

    pub fn e_ref(&self) -> Array1<f64> {
        self.points.iter().map(|p| p.e_ref).collect()
    }

    pub fn dnde(&self) -> Array1<f64> {
        self.points.iter().map(|p| p.dnde()).collect()
    }

    pub fn dnde_ul(&self) -> Array1<f64> {
        self.points.iter().map(|p| p.norm_ul * p.ref_dnde).collect()
    }

    pub fn e2dnde(&self) -> Array1<f64> {
        self.points.iter().map(|p| p.e2dnde()).collect()
    }

    pub fn is_ul(&self) -> Array1<bool> {
        self.points.iter().map(|p| p.is_ul).collect()
    }

    /// Write the table to `flux_points.csv` in `folder`
    pub fn write_csv(&self, folder: &str) -> Result<()> {
        let outputfile = OutputFile::new(folder, "flux_points.csv")?;
        let mut writer = outputfile.csv_writer();
        for point in &self.points {
            writer.serialize(point)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Convert the points into a dataset of differential flux measurements
    ///
    /// Upper limits are kept as such, at the `norm_ul` flux. Measured points use the mean of
    /// the available asymmetric errors. Points without data are skipped.
    pub fn to_dataset(&self, name: &str) -> Result<FluxPointsDataset> {
        let points: Vec<&FluxPoint> = self.points.iter().filter(|p| p.is_defined()).collect();
        let mut e_ref = Vec::with_capacity(points.len());
        let mut is_ul = Vec::with_capacity(points.len());
        let mut dnde = Vec::with_capacity(points.len());
        let mut dnde_err = Vec::with_capacity(points.len());
        for point in points {
            e_ref.push(point.e_ref);
            is_ul.push(point.is_ul);
            if point.is_ul {
                dnde.push(point.norm_ul * point.ref_dnde);
                dnde_err.push(0.0);
            } else {
                let errors: Vec<f64> = [point.norm_errn, point.norm_errp]
                    .into_iter()
                    .filter(|e| e.is_finite())
                    .collect();
                let err = if errors.is_empty() {
                    f64::NAN
                } else {
                    errors.iter().sum::<f64>() / errors.len() as f64
                };
                dnde.push(point.dnde());
                dnde_err.push(err * point.ref_dnde);
            }
        }
        FluxPointsDataset::new(
            name,
            Array1::from(e_ref),
            Array1::from(dnde),
            Array1::from(dnde_err),
            Array1::from(is_ul),
        )
    }
}

/// The joint statistic as a function of the source norm
struct NormCost<'a> {
    datasets: &'a Datasets,
    norm: &'a Parameter,
    /// Subtracted from the statistic, for root finding
    offset: f64,
}

impl<'a> NormCost<'a> {
    fn stat(&self, norm: f64) -> Result<f64> {
        self.norm.set_value(norm);
        let stat = self.datasets.stat_sum()?;
        if stat.is_nan() {
            bail!("The fit statistic is NaN at norm = {}", norm);
        }
        Ok(stat - self.offset)
    }
}

impl<'a> CostFunction for NormCost<'a> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, norm: &Self::Param) -> Result<Self::Output, Error> {
        self.stat(*norm)
    }
}

/// Estimate the flux of a source in energy bins, by fitting a norm on its spectral model
///
/// In each bin the fit is restricted to the data within the bin, and every model parameter is
/// frozen: only the normalisation of the source spectrum varies.
#[derive(Debug, Clone)]
pub struct FluxPointsEstimator {
    energy_edges: Vec<f64>,
    source: String,
    settings: FluxPointsSettings,
}

impl FluxPointsEstimator {
    pub fn new(energy_edges: Vec<f64>, source: impl Into<String>, settings: &Settings) -> Result<Self> {
        check_edges(&energy_edges)?;
        settings.flux_points.validate()?;
        Ok(FluxPointsEstimator {
            energy_edges,
            source: source.into(),
            settings: settings.flux_points.clone(),
        })
    }

    pub fn run(&self, datasets: &Datasets) -> Result<FluxPoints> {
        let source = match datasets.models()?.get(&self.source) {
            Some(source) => source,
            None => bail!(
                "Source '{}' is not attached to any dataset",
                self.source
            ),
        };

        let bins: Vec<(f64, f64)> = self.energy_edges.windows(2).map(|w| (w[0], w[1])).collect();
        let points = if self.settings.parallel {
            bins.par_iter()
                .map(|&(emin, emax)| self.estimate_bin(datasets, &source, emin, emax))
                .collect::<Result<Vec<_>>>()?
        } else {
            bins.iter()
                .map(|&(emin, emax)| self.estimate_bin(datasets, &source, emin, emax))
                .collect::<Result<Vec<_>>>()?
        };

        tracing::info!(
            "Estimated {} flux point(s) for '{}', {} upper limit(s)",
            points.len(),
            self.source,
            points.iter().filter(|p| p.is_ul).count()
        );
        Ok(FluxPoints {
            source: self.source.clone(),
            points,
        })
    }

    fn estimate_bin(
        &self,
        datasets: &Datasets,
        source: &SkyModel,
        emin: f64,
        emax: f64,
    ) -> Result<FluxPoint> {
        let e_ref = log_center(emin, emax);
        let ref_dnde = source.spectral().evaluate(e_ref);

        let mut datasets = datasets.deep_copy()?;
        for dataset in datasets.iter_mut() {
            let mask = dataset.energy_mask(emin, emax);
            dataset.set_mask_fit(Some(mask))?;
        }
        let has_data = datasets
            .iter()
            .any(|d| d.mask().map_or(true, |m| m.iter().any(|&inside| inside)));
        if !has_data {
            tracing::warn!(
                "No data bin within [{:.3}, {:.3}] TeV, flux point left undefined",
                emin,
                emax
            );
            return Ok(FluxPoint::undefined(emin, emax, e_ref, ref_dnde));
        }
        datasets.parameters().freeze_all();

        let copied = datasets
            .models()?
            .get(&self.source)
            .ok_or_else(|| anyhow!("Source '{}' lost in copy", self.source))?;
        let scaled = ScaledSpectralModel::new(copied.spectral().deep_copy(), 1.0);
        let norm = scaled.norm.clone();
        let replacement = Arc::new(copied.with_spectral(Box::new(scaled)));
        for dataset in datasets.iter_mut() {
            let models = dataset
                .models()
                .iter()
                .map(|m| {
                    if Arc::ptr_eq(m, &copied) {
                        replacement.clone()
                    } else {
                        m.clone()
                    }
                })
                .collect();
            dataset.set_models(models);
        }

        let counts: Vec<f64> = datasets
            .iter()
            .filter_map(|d| d.counts_in_range(emin, emax))
            .collect();
        let counts = if counts.is_empty() {
            f64::NAN
        } else {
            counts.iter().sum()
        };

        let (lo, hi) = (self.settings.norm_min, self.settings.norm_max);
        let (datasets, norm) = (&datasets, &norm);
        let cost = move |offset: f64| NormCost {
            datasets,
            norm,
            offset,
        };

        let res = Executor::new(cost(0.0), BrentOpt::new(lo, hi).set_tolerance(BRENT_TOLERANCE, 1e-8))
            .configure(|state| state.max_iters(BRENT_MAX_ITERS))
            .run()?;
        let best = match res.state.best_param {
            Some(best) => best,
            None => bail!("Norm fit failed in bin [{}, {}] TeV", emin, emax),
        };
        let best_stat = cost(0.0).stat(best)?;
        let ts = cost(0.0).stat(0.0)? - best_stat;

        let n_err = self.settings.n_sigma.powi(2);
        let n_ul = self.settings.n_sigma_ul.powi(2);
        let errn = find_crossing(&cost(best_stat + n_err), lo, best)?.map_or(f64::NAN, |x| best - x);
        let errp = find_crossing(&cost(best_stat + n_err), best, hi)?.map_or(f64::NAN, |x| x - best);
        let ul = find_crossing(&cost(best_stat + n_ul), best, hi)?.unwrap_or(f64::NAN);

        let is_ul = (!counts.is_nan() && counts < self.settings.min_counts)
            || ts < self.settings.ts_threshold;

        tracing::debug!(
            "Bin [{:.3}, {:.3}] TeV: norm {:.4} (-{:.4}, +{:.4}), ts {:.2}",
            emin,
            emax,
            best,
            errn,
            errp,
            ts
        );

        Ok(FluxPoint {
            e_min: emin,
            e_max: emax,
            e_ref,
            ref_dnde,
            norm: best,
            norm_errn: errn,
            norm_errp: errp,
            norm_ul: ul,
            ts,
            counts,
            is_ul,
        })
    }
}

/// Root of the cost in `[a, b]`, if it changes sign over the interval
fn find_crossing(cost: &NormCost, a: f64, b: f64) -> Result<Option<f64>> {
    if !(b > a) {
        return Ok(None);
    }
    let (fa, fb) = (cost.stat(a)?, cost.stat(b)?);
    if fa.signum() == fb.signum() {
        return Ok(None);
    }
    let problem = NormCost {
        datasets: cost.datasets,
        norm: cost.norm,
        offset: cost.offset,
    };
    let res = Executor::new(problem, BrentRoot::new(a, b, BRENT_TOLERANCE))
        .configure(|state| state.max_iters(BRENT_MAX_ITERS))
        .run()?;
    Ok(res.state.best_param)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(norm: f64, errn: f64, errp: f64, is_ul: bool) -> FluxPoint {
        FluxPoint {
            e_min: 1.0,
            e_max: 4.0,
            e_ref: 2.0,
            ref_dnde: 1e-12,
            norm,
            norm_errn: errn,
            norm_errp: errp,
            norm_ul: 3.0,
            ts: 25.0,
            counts: 100.0,
            is_ul,
        }
    }

    #[test]
    fn test_derived_quantities() {
        let p = point(2.0, 0.1, 0.2, false);
        assert_eq!(p.dnde(), 2e-12);
        assert!((p.e2dnde() - 8e-12).abs() < 1e-24);
        assert_eq!(p.sqrt_ts(), 5.0);
    }

    #[test]
    fn test_to_dataset() {
        let points = FluxPoints {
            source: "crab".to_string(),
            points: vec![
                point(2.0, 0.1, 0.3, false),
                point(0.5, f64::NAN, 0.2, false),
                point(0.1, 0.1, 0.1, true),
                FluxPoint::undefined(4.0, 8.0, 5.6, 1e-13),
            ],
        };
        let dataset = points.to_dataset("sed").unwrap();
        assert_eq!(dataset.e_ref.len(), 3);
        assert!((dataset.dnde_err[0] - 2e-13).abs() < 1e-25);
        assert!((dataset.dnde_err[1] - 2e-13).abs() < 1e-25);
        assert!((dataset.dnde[2] - 3e-12).abs() < 1e-25);
        assert!(dataset.is_ul[2]);
    }
}
