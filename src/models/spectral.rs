use std::fmt::Debug;

use anyhow::{bail, Result};

use crate::models::{ComponentDescription, ParameterDescription};
use crate::routines::math::integrate_log;
use crate::structs::parameter::{Parameter, Parameters};

/// Differential flux in `cm-2 s-1 TeV-1` as a function of energy in TeV
pub trait SpectralModel: Send + Sync + Debug {
    /// The type name used in model manifests
    fn tag(&self) -> &'static str;

    /// Shared handles to the parameters of the model
    fn parameters(&self) -> Parameters;

    /// Differential flux at `energy`
    fn evaluate(&self, energy: f64) -> f64;

    /// Integral flux between `emin` and `emax`, in `cm-2 s-1`
    fn integral(&self, emin: f64, emax: f64) -> f64 {
        integrate_log(|e| self.evaluate(e), emin, emax)
    }

    /// A copy of the model with independent parameters
    fn deep_copy(&self) -> Box<dyn SpectralModel>;

    fn description(&self) -> ComponentDescription {
        ComponentDescription::new(self.tag(), &self.parameters())
    }

    /// Energy flux `E^2 dN/dE` in `TeV cm-2 s-1`
    fn e2dnde(&self, energy: f64) -> f64 {
        energy * energy * self.evaluate(energy)
    }
}

/// Power law `A (E / E0)^-index`
#[derive(Debug, Clone)]
pub struct PowerLaw {
    pub index: Parameter,
    pub amplitude: Parameter,
    pub reference: Parameter,
}

impl PowerLaw {
    pub fn new(index: f64, amplitude: f64, reference: f64) -> Self {
        PowerLaw {
            index: Parameter::new("index", index),
            amplitude: Parameter::new("amplitude", amplitude).with_unit("cm-2 s-1 TeV-1"),
            reference: Parameter::new("reference", reference)
                .with_unit("TeV")
                .frozen(),
        }
    }

    fn from_parameters(pars: &[ParameterDescription]) -> Result<Self> {
        Ok(PowerLaw {
            index: find(pars, "index")?,
            amplitude: find(pars, "amplitude")?,
            reference: find(pars, "reference")?,
        })
    }
}

impl Default for PowerLaw {
    fn default() -> Self {
        PowerLaw::new(2.0, 1e-12, 1.0)
    }
}

impl SpectralModel for PowerLaw {
    fn tag(&self) -> &'static str {
        "PowerLaw"
    }

    fn parameters(&self) -> Parameters {
        Parameters::new(vec![
            self.index.clone(),
            self.amplitude.clone(),
            self.reference.clone(),
        ])
    }

    fn evaluate(&self, energy: f64) -> f64 {
        self.amplitude.value() * (energy / self.reference.value()).powf(-self.index.value())
    }

    fn integral(&self, emin: f64, emax: f64) -> f64 {
        let (index, amplitude, reference) = (
            self.index.value(),
            self.amplitude.value(),
            self.reference.value(),
        );
        if (index - 1.0).abs() < 1e-10 {
            amplitude * reference * (emax / emin).ln()
        } else {
            let p = 1.0 - index;
            amplitude * reference / p * ((emax / reference).powf(p) - (emin / reference).powf(p))
        }
    }

    fn deep_copy(&self) -> Box<dyn SpectralModel> {
        Box::new(PowerLaw {
            index: self.index.deep_copy(),
            amplitude: self.amplitude.deep_copy(),
            reference: self.reference.deep_copy(),
        })
    }
}

/// Power law with exponential cutoff `A (E / E0)^-index exp(-lambda E)`
#[derive(Debug, Clone)]
pub struct ExpCutoffPowerLaw {
    pub index: Parameter,
    pub amplitude: Parameter,
    pub reference: Parameter,
    /// Inverse cutoff energy, in `TeV-1`
    pub lambda: Parameter,
}

impl ExpCutoffPowerLaw {
    pub fn new(index: f64, amplitude: f64, reference: f64, lambda: f64) -> Self {
        ExpCutoffPowerLaw {
            index: Parameter::new("index", index),
            amplitude: Parameter::new("amplitude", amplitude).with_unit("cm-2 s-1 TeV-1"),
            reference: Parameter::new("reference", reference)
                .with_unit("TeV")
                .frozen(),
            lambda: Parameter::new("lambda_", lambda).with_unit("TeV-1"),
        }
    }

    fn from_parameters(pars: &[ParameterDescription]) -> Result<Self> {
        Ok(ExpCutoffPowerLaw {
            index: find(pars, "index")?,
            amplitude: find(pars, "amplitude")?,
            reference: find(pars, "reference")?,
            lambda: find(pars, "lambda_")?,
        })
    }
}

impl SpectralModel for ExpCutoffPowerLaw {
    fn tag(&self) -> &'static str {
        "ExpCutoffPowerLaw"
    }

    fn parameters(&self) -> Parameters {
        Parameters::new(vec![
            self.index.clone(),
            self.amplitude.clone(),
            self.reference.clone(),
            self.lambda.clone(),
        ])
    }

    fn evaluate(&self, energy: f64) -> f64 {
        self.amplitude.value()
            * (energy / self.reference.value()).powf(-self.index.value())
            * (-self.lambda.value() * energy).exp()
    }

    fn deep_copy(&self) -> Box<dyn SpectralModel> {
        Box::new(ExpCutoffPowerLaw {
            index: self.index.deep_copy(),
            amplitude: self.amplitude.deep_copy(),
            reference: self.reference.deep_copy(),
            lambda: self.lambda.deep_copy(),
        })
    }
}

/// Log parabola `A (E / E0)^(-alpha - beta ln(E / E0))`
#[derive(Debug, Clone)]
pub struct LogParabola {
    pub amplitude: Parameter,
    pub reference: Parameter,
    pub alpha: Parameter,
    pub beta: Parameter,
}

impl LogParabola {
    pub fn new(amplitude: f64, reference: f64, alpha: f64, beta: f64) -> Self {
        LogParabola {
            amplitude: Parameter::new("amplitude", amplitude).with_unit("cm-2 s-1 TeV-1"),
            reference: Parameter::new("reference", reference)
                .with_unit("TeV")
                .frozen(),
            alpha: Parameter::new("alpha", alpha),
            beta: Parameter::new("beta", beta),
        }
    }

    fn from_parameters(pars: &[ParameterDescription]) -> Result<Self> {
        Ok(LogParabola {
            amplitude: find(pars, "amplitude")?,
            reference: find(pars, "reference")?,
            alpha: find(pars, "alpha")?,
            beta: find(pars, "beta")?,
        })
    }
}

impl SpectralModel for LogParabola {
    fn tag(&self) -> &'static str {
        "LogParabola"
    }

    fn parameters(&self) -> Parameters {
        Parameters::new(vec![
            self.amplitude.clone(),
            self.reference.clone(),
            self.alpha.clone(),
            self.beta.clone(),
        ])
    }

    fn evaluate(&self, energy: f64) -> f64 {
        let x = energy / self.reference.value();
        self.amplitude.value() * x.powf(-self.alpha.value() - self.beta.value() * x.ln())
    }

    fn deep_copy(&self) -> Box<dyn SpectralModel> {
        Box::new(LogParabola {
            amplitude: self.amplitude.deep_copy(),
            reference: self.reference.deep_copy(),
            alpha: self.alpha.deep_copy(),
            beta: self.beta.deep_copy(),
        })
    }
}

/// Another spectral model multiplied by a free normalisation
///
/// The flux point estimator wraps the source spectrum in this model and fits `norm` alone.
#[derive(Debug)]
pub struct ScaledSpectralModel {
    pub model: Box<dyn SpectralModel>,
    pub norm: Parameter,
}

impl ScaledSpectralModel {
    pub fn new(model: Box<dyn SpectralModel>, norm: f64) -> Self {
        ScaledSpectralModel {
            model,
            norm: Parameter::new("norm", norm),
        }
    }
}

impl SpectralModel for ScaledSpectralModel {
    fn tag(&self) -> &'static str {
        "ScaledSpectralModel"
    }

    fn parameters(&self) -> Parameters {
        Parameters::from_stack(vec![
            Parameters::new(vec![self.norm.clone()]),
            self.model.parameters(),
        ])
    }

    fn evaluate(&self, energy: f64) -> f64 {
        self.norm.value() * self.model.evaluate(energy)
    }

    fn integral(&self, emin: f64, emax: f64) -> f64 {
        self.norm.value() * self.model.integral(emin, emax)
    }

    fn deep_copy(&self) -> Box<dyn SpectralModel> {
        Box::new(ScaledSpectralModel {
            model: self.model.deep_copy(),
            norm: self.norm.deep_copy(),
        })
    }
}

/// Build a spectral model from its manifest form
pub fn from_description(description: &ComponentDescription) -> Result<Box<dyn SpectralModel>> {
    let pars = &description.parameters;
    let model: Box<dyn SpectralModel> = match description.kind.as_str() {
        "PowerLaw" => Box::new(PowerLaw::from_parameters(pars)?),
        "ExpCutoffPowerLaw" => Box::new(ExpCutoffPowerLaw::from_parameters(pars)?),
        "LogParabola" => Box::new(LogParabola::from_parameters(pars)?),
        other => bail!(
            "Spectral model type '{}' not supported. Possible types are 'PowerLaw', 'ExpCutoffPowerLaw' and 'LogParabola'",
            other
        ),
    };
    Ok(model)
}

pub(crate) fn find(pars: &[ParameterDescription], name: &str) -> Result<Parameter> {
    match pars.iter().find(|p| p.name == name) {
        Some(p) => p.to_parameter(),
        None => bail!("Missing parameter '{}' in model description", name),
    }
}
