use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use argmin::core::{Executor, State, TerminationReason};
use argmin::solver::neldermead::NelderMead;
use ndarray::{Array1, Array2};
use serde::Serialize;
use thiserror::Error;

use crate::datasets::Datasets;
use crate::routines::output::OutputFile;
use crate::routines::settings::Settings;
use crate::structs::parameter::Parameters;

mod covariance;
mod optim;

use covariance::invert_spd;
use optim::{initial_simplex, StatCost};

/// Relative size of the starting simplex, in units of the scaled parameters
const SIMPLEX_STEP: f64 = 0.1;
/// Number of Nelder-Mead passes, each restarting from the best point of the previous one
const PASSES: usize = 2;

/// The ways a fit can fail
///
/// Whatever the failure, the parameters are restored to their values before the fit.
#[derive(Debug, Error)]
pub enum FitError {
    #[error("No free parameters to fit")]
    NoFreeParameters,
    #[error("Parameter '{name}' starts at {value}, outside its bounds [{min}, {max}]")]
    OutOfBounds {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("The fit statistic is not finite at {parameters:?}")]
    NonFinite { parameters: Vec<(String, f64)> },
    #[error("Fit did not converge after {iterations} iterations, best statistic {stat}")]
    NotConverged { iterations: u64, stat: f64 },
    #[error("Optimizer failed: {0}")]
    Optimizer(String),
}

impl From<argmin::core::Error> for FitError {
    fn from(error: argmin::core::Error) -> Self {
        match error.downcast::<FitError>() {
            Ok(fit_error) => fit_error,
            Err(other) => FitError::Optimizer(format!("{:#}", other)),
        }
    }
}

/// Outcome of a successful fit
#[derive(Debug, Clone)]
pub struct FitResult {
    /// Handles to the fitted parameters, holding the covariance if it was computed
    pub parameters: Parameters,
    /// Best-fit values, in the order of `parameters`
    pub values: Vec<f64>,
    pub total_stat: f64,
    pub converged: bool,
    pub iterations: u64,
    pub n_evaluations: usize,
    pub message: String,
}

impl FitResult {
    pub fn names(&self) -> Vec<String> {
        self.parameters.names()
    }

    /// Best-fit value of the first parameter with the given name
    pub fn value(&self, name: &str) -> Option<f64> {
        let position = self.names().iter().position(|n| n == name)?;
        Some(self.values[position])
    }

    pub fn error(&self, name: &str) -> Option<f64> {
        self.parameters.get(name)?.error()
    }

    pub fn covariance(&self) -> Option<&Array2<f64>> {
        self.parameters.covariance()
    }

    /// Write the fitted parameters to `fit_result.csv` in `folder`
    pub fn write_csv(&self, folder: &str) -> Result<()> {
        let outputfile = OutputFile::new(folder, "fit_result.csv")?;
        let mut writer = outputfile.csv_writer();
        for (par, value) in self.parameters.iter().zip(&self.values) {
            let state = par.state();
            writer.serialize(ParameterRow {
                name: state.name,
                value: *value,
                error: state.error,
                unit: state.unit,
                min: state.min,
                max: state.max,
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct ParameterRow {
    name: String,
    value: f64,
    error: Option<f64>,
    unit: String,
    min: f64,
    max: f64,
}

impl fmt::Display for FitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Fit result")?;
        writeln!(f, "  converged    : {}", self.converged)?;
        writeln!(f, "  message      : {}", self.message)?;
        writeln!(f, "  iterations   : {}", self.iterations)?;
        writeln!(f, "  evaluations  : {}", self.n_evaluations)?;
        writeln!(f, "  total stat   : {:.4}", self.total_stat)?;
        write!(f, "{}", self.parameters)
    }
}

/// Joint maximum-likelihood fit of a collection of datasets
///
/// The free parameters are the unique, non-frozen parameters of all models attached to the
/// datasets. A model shared by several datasets is fitted once, against all of them.
#[derive(Debug, Clone, Default)]
pub struct Fit {
    settings: Settings,
}

impl Fit {
    pub fn new(settings: Settings) -> Self {
        Fit { settings }
    }

    /// Minimise the joint statistic, then estimate the covariance of the free parameters
    pub fn run(&self, datasets: &Datasets) -> Result<FitResult, FitError> {
        let mut result = self.optimize(datasets)?;
        match self.covariance(datasets)? {
            Some(covariance) => {
                result
                    .parameters
                    .set_covariance(covariance)
                    .map_err(|e| FitError::Optimizer(e.to_string()))?;
            }
            None => tracing::warn!("Covariance matrix could not be estimated"),
        }
        Ok(result)
    }

    /// Minimise the joint statistic over the free parameters
    ///
    /// On success the best-fit values are left in the shared parameters.
    pub fn optimize(&self, datasets: &Datasets) -> Result<FitResult, FitError> {
        let parameters = datasets.parameters().free();
        if parameters.is_empty() {
            return Err(FitError::NoFreeParameters);
        }
        if let Some(par) = parameters.iter().find(|p| !p.contains(p.value())) {
            let state = par.state();
            let error = FitError::OutOfBounds {
                name: state.name,
                value: state.value,
                min: state.min,
                max: state.max,
            };
            tracing::warn!("{}", error);
            return Err(error);
        }
        let initial = parameters.values();
        parameters.autoscale();

        let result = self.minimize(datasets, &parameters);
        if let Err(error) = &result {
            parameters.set_values(&initial);
            tracing::warn!("{}", error);
        }
        result
    }

    fn minimize(&self, datasets: &Datasets, parameters: &Parameters) -> Result<FitResult, FitError> {
        let evaluations = AtomicUsize::new(0);
        let mut best = Array1::from(parameters.factors());

        let start = StatCost::new(datasets, parameters, &evaluations).evaluate(&best.to_vec())?;
        if !start.is_finite() {
            return Err(FitError::NonFinite {
                parameters: parameters
                    .names()
                    .into_iter()
                    .zip(parameters.values())
                    .collect(),
            });
        }
        tracing::debug!("Starting fit of {} parameter(s), statistic {:.4}", parameters.len(), start);

        let mut iterations = 0;
        let mut stat = start;
        let mut converged = false;
        let mut message = String::new();
        for pass in 0..PASSES {
            let cost = StatCost::new(datasets, parameters, &evaluations);
            let simplex = initial_simplex(&best, cost.bounds(), SIMPLEX_STEP);
            let solver = NelderMead::new(simplex).with_sd_tolerance(self.settings.fit.sd_tolerance)?;
            let res = Executor::new(cost, solver)
                .configure(|state| state.max_iters(self.settings.fit.max_iters))
                .run()?;

            iterations += res.state.get_iter();
            converged = matches!(
                res.state.get_termination_reason(),
                Some(TerminationReason::SolverConverged)
            );
            message = match res.state.get_termination_reason() {
                Some(reason) => reason.text().to_string(),
                None => "Not terminated".to_string(),
            };
            if let Some(param) = res.state.get_best_param() {
                best = param.clone();
                stat = res.state.get_best_cost();
            }
            tracing::debug!(
                "Pass {}: {} after {} iterations, statistic {:.6}",
                pass + 1,
                message,
                res.state.get_iter(),
                stat
            );
            if !converged {
                break;
            }
        }

        if !converged {
            return Err(FitError::NotConverged { iterations, stat });
        }

        parameters.set_factors(&best.to_vec());
        let total_stat = datasets
            .stat_sum()
            .map_err(|e| FitError::Optimizer(e.to_string()))?;
        let result = FitResult {
            values: parameters.values(),
            parameters: parameters.clone(),
            total_stat,
            converged,
            iterations,
            n_evaluations: evaluations.load(Ordering::Relaxed),
            message,
        };
        tracing::info!(
            "Fit converged after {} iterations, total statistic {:.4}",
            result.iterations,
            result.total_stat
        );
        Ok(result)
    }

    /// Covariance of the free parameters at their current values
    ///
    /// Estimated as twice the inverse of the Hessian of the statistic, as the statistics are
    /// `-2 ln L`. Returns `None` when the Hessian cannot be inverted. The errors of the parameters
    /// are set from the diagonal. The parameter values are left unchanged.
    pub fn covariance(&self, datasets: &Datasets) -> Result<Option<Array2<f64>>, FitError> {
        let mut parameters = datasets.parameters().free();
        if parameters.is_empty() {
            return Err(FitError::NoFreeParameters);
        }
        let initial = parameters.values();
        parameters.autoscale();
        let x = parameters.factors();
        let bounds: Vec<(f64, f64)> = parameters.iter().map(|p| p.factor_bounds()).collect();
        let steps: Vec<f64> = x
            .iter()
            .zip(&bounds)
            .map(|(xi, (lo, hi))| {
                let step = self.settings.fit.hessian_step * xi.abs().max(1.0);
                // Stay inside the bounds on both sides
                step.min(0.5 * (hi - xi)).min(0.5 * (xi - lo))
            })
            .collect();

        let scales: Vec<f64> = parameters.iter().map(|p| p.scale()).collect();
        let hessian = if steps.iter().all(|s| *s > 0.0) {
            let evaluations = AtomicUsize::new(0);
            let cost = StatCost::new(datasets, &parameters, &evaluations);
            covariance::hessian(|f| Ok(cost.evaluate(f)?), &x, &steps)
        } else {
            Err(anyhow::anyhow!("A parameter is at one of its bounds"))
        };
        parameters.set_values(&initial);

        let inverse = hessian.and_then(|h| invert_spd(&h));
        let covariance = match inverse {
            Ok(inverse) => Array2::from_shape_fn(inverse.dim(), |(i, j)| {
                2.0 * inverse[[i, j]] * scales[i] * scales[j]
            }),
            Err(error) => {
                tracing::warn!("Covariance estimation failed: {}", error);
                parameters.iter().for_each(|p| p.set_error(None));
                return Ok(None);
            }
        };
        parameters
            .set_covariance(covariance.clone())
            .map_err(|e| FitError::Optimizer(e.to_string()))?;
        Ok(Some(covariance))
    }
}
