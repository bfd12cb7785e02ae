use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::structs::parameter::{Parameter, Parameters};
use spatial::SpatialModel;
use spectral::SpectralModel;

pub mod spatial;
pub mod spectral;

/// Manifest form of a single [Parameter]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterDescription {
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<f64>,
}

impl ParameterDescription {
    /// Create a new, independent [Parameter] from the description
    pub fn to_parameter(&self) -> Result<Parameter> {
        let mut parameter = Parameter::new(self.name.clone(), self.value).with_unit(&self.unit);
        if self.min.is_some() || self.max.is_some() {
            parameter = parameter.with_bounds(
                self.min.unwrap_or(f64::NEG_INFINITY),
                self.max.unwrap_or(f64::INFINITY),
            )?;
        }
        parameter.set_frozen(self.frozen);
        parameter.set_error(self.error);
        Ok(parameter)
    }
}

impl From<&Parameter> for ParameterDescription {
    fn from(parameter: &Parameter) -> Self {
        let state = parameter.state();
        ParameterDescription {
            name: state.name,
            value: state.value,
            unit: state.unit,
            min: Some(state.min).filter(|v| v.is_finite()),
            max: Some(state.max).filter(|v| v.is_finite()),
            frozen: state.frozen,
            error: state.error,
        }
    }
}

/// Manifest form of a spectral or spatial model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub parameters: Vec<ParameterDescription>,
}

impl ComponentDescription {
    pub fn new(kind: &str, parameters: &Parameters) -> Self {
        ComponentDescription {
            kind: kind.to_string(),
            parameters: parameters.iter().map(ParameterDescription::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkyModelDescription {
    pub name: String,
    pub spectral: ComponentDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spatial: Option<ComponentDescription>,
}

/// Contents of a models YAML manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ModelsDescription {
    pub components: Vec<SkyModelDescription>,
}

/// A named source model: a spectrum and, optionally, a morphology
///
/// Sky models are attached to datasets as `Arc<SkyModel>`. All datasets holding the same
/// `Arc` evaluate the same parameters, so a joint fit moves them together.
#[derive(Debug)]
pub struct SkyModel {
    name: String,
    spectral: Box<dyn SpectralModel>,
    spatial: Option<Box<dyn SpatialModel>>,
}

impl SkyModel {
    pub fn new(name: impl Into<String>, spectral: impl SpectralModel + 'static) -> Self {
        SkyModel {
            name: name.into(),
            spectral: Box::new(spectral),
            spatial: None,
        }
    }

    pub fn from_boxed(
        name: impl Into<String>,
        spectral: Box<dyn SpectralModel>,
        spatial: Option<Box<dyn SpatialModel>>,
    ) -> Self {
        SkyModel {
            name: name.into(),
            spectral,
            spatial,
        }
    }

    pub fn with_spatial(mut self, spatial: impl SpatialModel + 'static) -> Self {
        self.spatial = Some(Box::new(spatial));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spectral(&self) -> &dyn SpectralModel {
        self.spectral.as_ref()
    }

    pub fn spatial(&self) -> Option<&dyn SpatialModel> {
        self.spatial.as_deref()
    }

    /// Spectral parameters followed by spatial parameters
    pub fn parameters(&self) -> Parameters {
        let mut stack = vec![self.spectral.parameters()];
        if let Some(spatial) = &self.spatial {
            stack.push(spatial.parameters());
        }
        Parameters::from_stack(stack)
    }

    /// A copy of the model with independent parameters
    pub fn deep_copy(&self) -> SkyModel {
        SkyModel {
            name: self.name.clone(),
            spectral: self.spectral.deep_copy(),
            spatial: self.spatial.as_ref().map(|s| s.deep_copy()),
        }
    }

    /// A copy of the model whose spectrum is replaced, with an independent copy of the spatial model
    pub fn with_spectral(&self, spectral: Box<dyn SpectralModel>) -> SkyModel {
        SkyModel {
            name: self.name.clone(),
            spectral,
            spatial: self.spatial.as_ref().map(|s| s.deep_copy()),
        }
    }

    pub fn description(&self) -> SkyModelDescription {
        SkyModelDescription {
            name: self.name.clone(),
            spectral: self.spectral.description(),
            spatial: self.spatial.as_ref().map(|s| s.description()),
        }
    }

    pub fn from_description(description: &SkyModelDescription) -> Result<SkyModel> {
        let spectral = spectral::from_description(&description.spectral)
            .with_context(|| format!("In spectral model of '{}'", description.name))?;
        let spatial = match &description.spatial {
            Some(spatial) => Some(
                spatial::from_description(spatial)
                    .with_context(|| format!("In spatial model of '{}'", description.name))?,
            ),
            None => None,
        };
        Ok(SkyModel::from_boxed(
            description.name.clone(),
            spectral,
            spatial,
        ))
    }
}

/// A registry of uniquely named, shared [SkyModel]s
#[derive(Debug, Clone, Default)]
pub struct Models {
    models: Vec<Arc<SkyModel>>,
}

impl Models {
    pub fn new() -> Self {
        Models { models: Vec::new() }
    }

    /// Build a registry from shared models, skipping repeated handles to the same model
    pub fn from_shared(models: impl IntoIterator<Item = Arc<SkyModel>>) -> Result<Self> {
        let mut registry = Models::new();
        for model in models {
            if registry.models.iter().any(|m| Arc::ptr_eq(m, &model)) {
                continue;
            }
            registry.push(model)?;
        }
        Ok(registry)
    }

    /// Add a model, returning the shared handle to attach to datasets
    pub fn add(&mut self, model: SkyModel) -> Result<Arc<SkyModel>> {
        let model = Arc::new(model);
        self.push(model.clone())?;
        Ok(model)
    }

    pub fn push(&mut self, model: Arc<SkyModel>) -> Result<()> {
        if self.models.iter().any(|m| m.name() == model.name()) {
            bail!("Model names must be unique, '{}' is already used", model.name());
        }
        self.models.push(model);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<SkyModel>> {
        self.models.iter().find(|m| m.name() == name).cloned()
    }

    /// Get several models by name, failing on the first unknown name
    pub fn select(&self, names: &[String]) -> Result<Vec<Arc<SkyModel>>> {
        names
            .iter()
            .map(|name| match self.get(name) {
                Some(model) => Ok(model),
                None => bail!("Model '{}' not found. Available models: {:?}", name, self.names()),
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.models.iter().map(|m| m.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<SkyModel>> {
        self.models.iter()
    }

    /// Unique parameters of all models
    pub fn parameters(&self) -> Parameters {
        Parameters::from_stack(self.models.iter().map(|m| m.parameters())).unique()
    }

    pub fn description(&self) -> ModelsDescription {
        ModelsDescription {
            components: self.models.iter().map(|m| m.description()).collect(),
        }
    }

    pub fn from_description(description: &ModelsDescription) -> Result<Self> {
        let mut models = Models::new();
        for component in &description.components {
            models.add(SkyModel::from_description(component)?)?;
        }
        Ok(models)
    }

    /// Read a models YAML manifest
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open models file {:?}", path))?;
        let description: ModelsDescription = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse models file {:?}", path))?;
        tracing::debug!(
            "Read {} model(s) from {:?}",
            description.components.len(),
            path
        );
        Models::from_description(&description)
    }

    /// Write the models YAML manifest
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create models file {:?}", path))?;
        serde_yaml::to_writer(file, &self.description())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spatial::PointSpatial;
    use spectral::PowerLaw;

    #[test]
    fn test_duplicate_names_rejected() {
        let mut models = Models::new();
        models.add(SkyModel::new("crab", PowerLaw::default())).unwrap();
        assert!(models.add(SkyModel::new("crab", PowerLaw::default())).is_err());
        assert_eq!(models.names(), vec!["crab"]);
    }

    #[test]
    fn test_shared_handles_are_deduplicated() {
        let crab = Arc::new(SkyModel::new("crab", PowerLaw::default()));
        let models = Models::from_shared(vec![crab.clone(), crab.clone()]).unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models.parameters().len(), 3);
    }

    #[test]
    fn test_parameters_order() {
        let model = SkyModel::new("crab", PowerLaw::default()).with_spatial(PointSpatial::new(83.6, 22.0));
        assert_eq!(
            model.parameters().names(),
            vec!["index", "amplitude", "reference", "lon_0", "lat_0"]
        );
    }

    #[test]
    fn test_with_spectral_copies_spatial() {
        let model = SkyModel::new("crab", PowerLaw::default()).with_spatial(PointSpatial::new(83.6, 22.0));
        let replaced = model.with_spectral(Box::new(PowerLaw::new(2.0, 1e-12, 1.0)));
        replaced.parameters().get("lon_0").unwrap().set_value(84.0);
        assert_eq!(model.parameters().get("lon_0").unwrap().value(), 83.6);
        assert_eq!(replaced.parameters().get("index").unwrap().value(), 2.0);
    }

    #[test]
    fn test_select_unknown() {
        let mut models = Models::new();
        models.add(SkyModel::new("crab", PowerLaw::default())).unwrap();
        assert!(models.select(&["crab".to_string()]).is_ok());
        assert!(models.select(&["vela".to_string()]).is_err());
    }

    #[test]
    fn test_yaml_description() {
        let mut models = Models::new();
        let pwl = PowerLaw::new(2.4, 3.5e-11, 1.0);
        pwl.index.set_bounds(1.0, 5.0).unwrap();
        models
            .add(SkyModel::new("crab", pwl).with_spatial(PointSpatial::new(83.6, 22.0)))
            .unwrap();

        let yaml = serde_yaml::to_string(&models.description()).unwrap();
        assert!(yaml.contains("type: PowerLaw"));
        assert!(yaml.contains("type: PointSpatial"));

        let description: ModelsDescription = serde_yaml::from_str(&yaml).unwrap();
        let restored = Models::from_description(&description).unwrap();
        let crab = restored.get("crab").unwrap();
        let index = crab.parameters().get("index").unwrap().clone();
        assert_eq!(index.value(), 2.4);
        assert_eq!((index.min(), index.max()), (1.0, 5.0));
        assert!(crab.spatial().is_some());
    }
}
