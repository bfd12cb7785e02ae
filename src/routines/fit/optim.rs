use std::sync::atomic::{AtomicUsize, Ordering};

use argmin::core::{CostFunction, Error};
use ndarray::Array1;

use crate::datasets::Datasets;
use crate::routines::fit::FitError;
use crate::structs::parameter::Parameters;

/// The joint statistic as a function of the free parameter factors
///
/// Every evaluation writes the candidate factors into the shared parameters before summing the
/// statistic of all datasets. Candidates outside the bounds cost `+inf`, a NaN statistic aborts
/// the minimisation with [FitError::NonFinite].
pub(crate) struct StatCost<'a> {
    datasets: &'a Datasets,
    parameters: &'a Parameters,
    bounds: Vec<(f64, f64)>,
    evaluations: &'a AtomicUsize,
}

impl<'a> StatCost<'a> {
    pub fn new(
        datasets: &'a Datasets,
        parameters: &'a Parameters,
        evaluations: &'a AtomicUsize,
    ) -> Self {
        StatCost {
            datasets,
            parameters,
            bounds: parameters.iter().map(|p| p.factor_bounds()).collect(),
            evaluations,
        }
    }

    pub fn bounds(&self) -> &[(f64, f64)] {
        &self.bounds
    }

    fn in_bounds(&self, factors: &[f64]) -> bool {
        factors
            .iter()
            .zip(&self.bounds)
            .all(|(x, (lo, hi))| x.is_finite() && x >= lo && x <= hi)
    }

    /// Statistic at `factors`, leaving the parameters at `factors`
    pub fn evaluate(&self, factors: &[f64]) -> Result<f64, FitError> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        if !self.in_bounds(factors) {
            return Ok(f64::INFINITY);
        }
        self.parameters.set_factors(factors);
        let stat = self
            .datasets
            .stat_sum()
            .map_err(|e| FitError::Optimizer(format!("{:#}", e)))?;
        if stat.is_nan() {
            return Err(FitError::NonFinite {
                parameters: self
                    .parameters
                    .names()
                    .into_iter()
                    .zip(self.parameters.values())
                    .collect(),
            });
        }
        Ok(stat)
    }
}

impl<'a> CostFunction for StatCost<'a> {
    type Param = Array1<f64>;
    type Output = f64;

    fn cost(&self, factors: &Self::Param) -> Result<Self::Output, Error> {
        Ok(self.evaluate(&factors.to_vec())?)
    }
}

/// Build a starting simplex around `x0` whose vertices all satisfy the bounds
///
/// Each vertex moves one coordinate by a fraction `step` of its value, towards the inside of the
/// allowed range when the outward move would cross a bound.
pub(crate) fn initial_simplex(x0: &Array1<f64>, bounds: &[(f64, f64)], step: f64) -> Vec<Array1<f64>> {
    let mut vertices = Vec::with_capacity(x0.len() + 1);
    vertices.push(x0.to_owned());

    for i in 0..x0.len() {
        let (lo, hi) = bounds[i];
        let mut delta = if x0[i] == 0.0 {
            step
        } else {
            step * x0[i].abs()
        };
        if x0[i] + delta > hi {
            if x0[i] - delta >= lo {
                delta = -delta;
            } else {
                // Both moves leave the range, use half of the widest side
                let up = hi - x0[i];
                let down = x0[i] - lo;
                delta = if up >= down { 0.5 * up } else { -0.5 * down };
            }
        }
        let mut vertex = x0.to_owned();
        vertex[i] += delta;
        vertices.push(vertex);
    }

    vertices
}
