use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{bail, Result};
use ndarray::Array2;

/// The state behind a [Parameter] handle
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterState {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub min: f64,
    pub max: f64,
    pub frozen: bool,
    /// The optimizer works on `value / scale`
    pub scale: f64,
    pub error: Option<f64>,
}

/// A shared handle to a model parameter
///
/// Cloning a [Parameter] does not copy its state: both handles refer to the same parameter,
/// and a value set through one is seen through the other. This is how a single spectral model
/// attached to several datasets ends up contributing a single entry to the free parameter vector.
/// Use [Parameter::deep_copy] to obtain an independent parameter.
#[derive(Clone)]
pub struct Parameter {
    inner: Arc<RwLock<ParameterState>>,
}

impl Parameter {
    /// Create a new, unbounded and free parameter
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Parameter {
            inner: Arc::new(RwLock::new(ParameterState {
                name: name.into(),
                value,
                unit: String::new(),
                min: f64::NEG_INFINITY,
                max: f64::INFINITY,
                frozen: false,
                scale: 1.0,
                error: None,
            })),
        }
    }

    pub fn with_unit(self, unit: impl Into<String>) -> Self {
        self.write().unit = unit.into();
        self
    }

    /// Set the bounds of the parameter
    ///
    /// Infinite bounds are allowed, and denote an unbounded side.
    pub fn with_bounds(self, min: f64, max: f64) -> Result<Self> {
        self.set_bounds(min, max)?;
        Ok(self)
    }

    pub fn frozen(self) -> Self {
        self.set_frozen(true);
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, ParameterState> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ParameterState> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// A copy of the current state
    pub fn state(&self) -> ParameterState {
        self.read().clone()
    }

    pub fn name(&self) -> String {
        self.read().name.clone()
    }

    pub fn value(&self) -> f64 {
        self.read().value
    }

    pub fn set_value(&self, value: f64) {
        self.write().value = value;
    }

    pub fn unit(&self) -> String {
        self.read().unit.clone()
    }

    pub fn min(&self) -> f64 {
        self.read().min
    }

    pub fn max(&self) -> f64 {
        self.read().max
    }

    pub fn set_bounds(&self, min: f64, max: f64) -> Result<()> {
        if min.is_nan() || max.is_nan() {
            bail!("Bounds of parameter '{}' must not be NaN", self.name());
        }
        if min >= max {
            bail!(
                "In parameter '{}', lower bound ({}) is not less than upper bound ({})",
                self.name(),
                min,
                max
            );
        }
        let mut state = self.write();
        state.min = min;
        state.max = max;
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.read().frozen
    }

    pub fn set_frozen(&self, frozen: bool) {
        self.write().frozen = frozen;
    }

    pub fn error(&self) -> Option<f64> {
        self.read().error
    }

    pub fn set_error(&self, error: Option<f64>) {
        self.write().error = error;
    }

    pub fn scale(&self) -> f64 {
        self.read().scale
    }

    /// Whether `value` lies within the (inclusive) bounds
    pub fn contains(&self, value: f64) -> bool {
        let state = self.read();
        value >= state.min && value <= state.max
    }

    /// Choose a power-of-ten scale so that the factor is of order unity
    pub fn autoscale(&self) {
        let mut state = self.write();
        state.scale = if state.value != 0.0 && state.value.is_finite() {
            10_f64.powf(state.value.abs().log10().floor())
        } else {
            1.0
        };
    }

    pub fn factor(&self) -> f64 {
        let state = self.read();
        state.value / state.scale
    }

    pub fn set_factor(&self, factor: f64) {
        let mut state = self.write();
        state.value = factor * state.scale;
    }

    /// Bounds in factor space
    ///
    /// A negative scale swaps the bounds.
    pub fn factor_bounds(&self) -> (f64, f64) {
        let state = self.read();
        let (a, b) = (state.min / state.scale, state.max / state.scale);
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Whether both handles refer to the same parameter
    pub fn ptr_eq(&self, other: &Parameter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// An independent parameter with the same state
    pub fn deep_copy(&self) -> Parameter {
        Parameter {
            inner: Arc::new(RwLock::new(self.state())),
        }
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("Parameter")
            .field("name", &state.name)
            .field("value", &state.value)
            .field("unit", &state.unit)
            .field("min", &state.min)
            .field("max", &state.max)
            .field("frozen", &state.frozen)
            .finish()
    }
}

/// An ordered list of [Parameter] handles, with an optional covariance matrix
#[derive(Debug, Clone, Default)]
pub struct Parameters {
    parameters: Vec<Parameter>,
    covariance: Option<Array2<f64>>,
}

impl Parameters {
    pub fn new(parameters: Vec<Parameter>) -> Self {
        Parameters {
            parameters,
            covariance: None,
        }
    }

    /// Concatenate several parameter lists, keeping duplicates
    pub fn from_stack<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Parameters>,
    {
        let parameters = iter.into_iter().flat_map(|p| p.parameters).collect();
        Parameters::new(parameters)
    }

    /// Remove duplicate handles, keeping the first occurrence of each parameter
    pub fn unique(&self) -> Parameters {
        let mut unique: Vec<Parameter> = Vec::with_capacity(self.parameters.len());
        for par in &self.parameters {
            if !unique.iter().any(|p| p.ptr_eq(par)) {
                unique.push(par.clone());
            }
        }
        Parameters::new(unique)
    }

    /// The parameters which are not frozen
    pub fn free(&self) -> Parameters {
        Parameters::new(
            self.parameters
                .iter()
                .filter(|p| !p.is_frozen())
                .cloned()
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Parameter> {
        self.parameters.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name()).collect()
    }

    /// Get the first parameter with the given name
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.read().name == name)
    }

    /// Position of the given handle in the list, by identity
    pub fn index_of(&self, parameter: &Parameter) -> Option<usize> {
        self.parameters.iter().position(|p| p.ptr_eq(parameter))
    }

    pub fn values(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.value()).collect()
    }

    pub fn set_values(&self, values: &[f64]) {
        for (par, value) in self.parameters.iter().zip(values) {
            par.set_value(*value);
        }
    }

    pub fn factors(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.factor()).collect()
    }

    pub fn set_factors(&self, factors: &[f64]) {
        for (par, factor) in self.parameters.iter().zip(factors) {
            par.set_factor(*factor);
        }
    }

    pub fn autoscale(&self) {
        self.parameters.iter().for_each(|p| p.autoscale());
    }

    pub fn freeze_all(&self) {
        self.parameters.iter().for_each(|p| p.set_frozen(true));
    }

    pub fn covariance(&self) -> Option<&Array2<f64>> {
        self.covariance.as_ref()
    }

    /// Store the covariance matrix, and set the error of each parameter from its diagonal
    pub fn set_covariance(&mut self, covariance: Array2<f64>) -> Result<()> {
        let n = self.parameters.len();
        if covariance.dim() != (n, n) {
            bail!(
                "Covariance matrix has shape {:?}, expected ({}, {})",
                covariance.dim(),
                n,
                n
            );
        }
        for (i, par) in self.parameters.iter().enumerate() {
            let var = covariance[[i, i]];
            par.set_error(if var >= 0.0 { Some(var.sqrt()) } else { None });
        }
        self.covariance = Some(covariance);
        Ok(())
    }

    /// Correlation coefficient between the i-th and j-th parameter
    pub fn correlation(&self, i: usize, j: usize) -> Option<f64> {
        let cov = self.covariance.as_ref()?;
        let n = self.parameters.len();
        if i >= n || j >= n {
            return None;
        }
        let (si, sj) = (cov[[i, i]].sqrt(), cov[[j, j]].sqrt());
        if si <= 0.0 || sj <= 0.0 || si.is_nan() || sj.is_nan() {
            return None;
        }
        Some(cov[[i, j]] / (si * sj))
    }
}

impl From<Vec<Parameter>> for Parameters {
    fn from(parameters: Vec<Parameter>) -> Self {
        Parameters::new(parameters)
    }
}

impl<'a> IntoIterator for &'a Parameters {
    type Item = &'a Parameter;
    type IntoIter = std::slice::Iter<'a, Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.parameters.iter()
    }
}

impl fmt::Display for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<12} {:>12} {:>12} {:<16} {:>10} {:>10} {:>6}",
            "name", "value", "error", "unit", "min", "max", "frozen"
        )?;
        for par in &self.parameters {
            let state = par.read();
            let error = match state.error {
                Some(err) => format!("{:.4e}", err),
                None => "nan".to_string(),
            };
            writeln!(
                f,
                "{:<12} {:>12.4e} {:>12} {:<16} {:>10.3e} {:>10.3e} {:>6}",
                state.name, state.value, error, state.unit, state.min, state.max, state.frozen
            )?;
        }
        Ok(())
    }
}
