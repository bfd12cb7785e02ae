use std::any::Any;
use std::fmt::Debug;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use ndarray::{Array1, Zip};

use crate::models::{Models, SkyModel};
use crate::structs::parameter::Parameters;

pub mod flux_points;
pub mod io;
pub mod map;
pub mod spectrum;

pub use flux_points::FluxPointsDataset;
pub use io::DatasetDescription;
pub use map::{MapDataset, MapGeom};
pub use spectrum::{SpectrumDataset, SpectrumDatasetOnOff, SpectrumInfo};

/// How to compare data and model in [Dataset::residuals]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualMethod {
    /// `data - model`
    Diff,
    /// `(data - model) / model`
    DiffModel,
    /// `(data - model) / sqrt(model)`
    DiffSqrtModel,
}

impl FromStr for ResidualMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "diff" => Ok(ResidualMethod::Diff),
            "diff/model" => Ok(ResidualMethod::DiffModel),
            "diff/sqrt(model)" => Ok(ResidualMethod::DiffSqrtModel),
            other => bail!(
                "Invalid residual method: '{}'. Choose between 'diff', 'diff/model' and 'diff/sqrt(model)'",
                other
            ),
        }
    }
}

/// Compute residuals between data and model
///
/// Divisions by zero give NaN or infinite entries, which are kept.
pub fn compute_residuals(
    data: &Array1<f64>,
    model: &Array1<f64>,
    method: ResidualMethod,
) -> Array1<f64> {
    Zip::from(data).and(model).map_collect(|&d, &m| match method {
        ResidualMethod::Diff => d - m,
        ResidualMethod::DiffModel => (d - m) / m,
        ResidualMethod::DiffSqrtModel => (d - m) / m.sqrt(),
    })
}

/// A measurement with a likelihood that depends on the attached sky models
///
/// The statistic of a dataset depends only on its data and on the current values of the
/// parameters of its models. Statistic arrays hold one value per data bin, and the energy range
/// of each bin is given by [Dataset::energy_ranges].
pub trait Dataset: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// The type name used in dataset manifests
    fn tag(&self) -> &'static str;

    fn models(&self) -> &[Arc<SkyModel>];

    fn set_models(&mut self, models: Vec<Arc<SkyModel>>);

    /// Unique parameters of the attached models
    fn parameters(&self) -> Parameters {
        Parameters::from_stack(self.models().iter().map(|m| m.parameters())).unique()
    }

    /// Fit statistic, one value per data bin
    fn stat_array(&self) -> Result<Array1<f64>>;

    /// The measured quantity per bin, as compared to [Dataset::model_values]
    fn data(&self) -> Array1<f64>;

    /// The predicted quantity per bin
    fn model_values(&self) -> Result<Array1<f64>>;

    /// Observed counts per bin, if the dataset is counts-based
    fn counts(&self) -> Option<Array1<f64>>;

    /// Energy interval covered by each bin, in TeV
    fn energy_ranges(&self) -> Vec<(f64, f64)>;

    fn mask_safe(&self) -> Option<&Array1<bool>>;

    fn mask_fit(&self) -> Option<&Array1<bool>>;

    fn set_mask_fit(&mut self, mask: Option<Array1<bool>>) -> Result<()>;

    /// Combined safe and fit mask
    fn mask(&self) -> Option<Array1<bool>> {
        match (self.mask_safe(), self.mask_fit()) {
            (Some(safe), Some(fit)) => Some(Zip::from(safe).and(fit).map_collect(|&s, &f| s && f)),
            (Some(safe), None) => Some(safe.clone()),
            (None, Some(fit)) => Some(fit.clone()),
            (None, None) => None,
        }
    }

    /// Total statistic over the unmasked bins
    fn stat_sum(&self) -> Result<f64> {
        let stat = self.stat_array()?;
        let sum = match self.mask() {
            Some(mask) => stat
                .iter()
                .zip(mask.iter())
                .filter(|(_, m)| **m)
                .map(|(s, _)| *s)
                .sum(),
            None => stat.sum(),
        };
        Ok(sum)
    }

    /// Bins whose energy range lies within `[emin, emax]`
    fn energy_mask(&self, emin: f64, emax: f64) -> Array1<bool> {
        let rtol = 1e-6;
        self.energy_ranges()
            .iter()
            .map(|&(lo, hi)| {
                if lo == hi {
                    // Point-like measurement
                    lo >= emin * (1.0 - rtol) && lo < emax * (1.0 - rtol)
                } else {
                    lo >= emin * (1.0 - rtol) && hi <= emax * (1.0 + rtol)
                }
            })
            .collect()
    }

    /// Observed counts in the safe bins within `[emin, emax]`
    fn counts_in_range(&self, emin: f64, emax: f64) -> Option<f64> {
        let counts = self.counts()?;
        let in_range = self.energy_mask(emin, emax);
        let safe = self.mask_safe();
        Some(
            counts
                .iter()
                .enumerate()
                .filter(|(i, _)| in_range[*i] && safe.map_or(true, |m| m[*i]))
                .map(|(_, c)| *c)
                .sum(),
        )
    }

    fn residuals(&self, method: ResidualMethod) -> Result<Array1<f64>> {
        Ok(compute_residuals(&self.data(), &self.model_values()?, method))
    }

    /// Shape of the data, one entry per axis
    fn data_shape(&self) -> Vec<usize> {
        vec![self.data().len()]
    }

    /// A copy of the data, attached to the given models
    fn copy_with_models(&self, models: Vec<Arc<SkyModel>>) -> Box<dyn Dataset>;

    /// A copy of the dataset under another name, attached to the same models
    fn copy_named(&self, name: &str) -> Box<dyn Dataset>;

    /// Stack another dataset of the same type into this one
    fn stack_with(&mut self, other: &dyn Dataset) -> Result<()> {
        bail!(
            "Stacking is not supported for {} '{}' (stacking {} '{}')",
            self.tag(),
            self.name(),
            other.tag(),
            other.name()
        )
    }

    /// Summary of the counts, for counts spectra
    fn spectrum_info(&self) -> Option<SpectrumInfo> {
        None
    }

    /// Write the data table of the dataset
    fn write_data(&self, path: &Path) -> Result<()>;

    /// Manifest entry for the dataset, pointing to its data table
    fn description(&self, filename: String) -> DatasetDescription;

    fn as_any(&self) -> &dyn Any;
}

/// Check that a mask has one entry per bin
pub(crate) fn check_mask(mask: &Option<Array1<bool>>, n: usize, name: &str) -> Result<()> {
    if let Some(mask) = mask {
        if mask.len() != n {
            bail!(
                "Mask of dataset '{}' has {} entries, expected {}",
                name,
                mask.len(),
                n
            );
        }
    }
    Ok(())
}

/// Check that energy edges are positive and increasing
pub(crate) fn check_edges(edges: &[f64]) -> Result<()> {
    if edges.len() < 2 {
        bail!("At least two energy edges are required, got {}", edges.len());
    }
    if edges[0] <= 0.0 || edges.windows(2).any(|w| w[1] <= w[0]) {
        bail!("Energy edges must be positive and strictly increasing");
    }
    Ok(())
}

/// A collection of datasets with unique names, fitted jointly
#[derive(Debug, Default)]
pub struct Datasets {
    datasets: Vec<Box<dyn Dataset>>,
}

impl Datasets {
    pub fn new() -> Self {
        Datasets {
            datasets: Vec::new(),
        }
    }

    pub fn from_vec(datasets: Vec<Box<dyn Dataset>>) -> Result<Self> {
        let mut collection = Datasets::new();
        for dataset in datasets {
            collection.push(dataset)?;
        }
        Ok(collection)
    }

    pub fn push(&mut self, dataset: Box<dyn Dataset>) -> Result<()> {
        if self.datasets.iter().any(|d| d.name() == dataset.name()) {
            bail!("Dataset names must be unique, '{}' is already used", dataset.name());
        }
        self.datasets.push(dataset);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Dataset> {
        self.datasets
            .iter()
            .find(|d| d.name() == name)
            .map(|d| d.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn Dataset>> {
        self.datasets.iter_mut().find(|d| d.name() == name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Dataset>> {
        let index = self.datasets.iter().position(|d| d.name() == name)?;
        Some(self.datasets.remove(index))
    }

    pub fn names(&self) -> Vec<String> {
        self.datasets.iter().map(|d| d.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Dataset> {
        self.datasets.iter().map(|d| d.as_ref())
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Box<dyn Dataset>> {
        self.datasets.iter_mut()
    }

    /// Unique parameters across all datasets
    ///
    /// A model attached to several datasets contributes its parameters once.
    pub fn parameters(&self) -> Parameters {
        Parameters::from_stack(self.datasets.iter().map(|d| d.parameters())).unique()
    }

    /// All models attached to the datasets, each shared model once
    pub fn models(&self) -> Result<Models> {
        Models::from_shared(
            self.datasets
                .iter()
                .flat_map(|d| d.models().to_vec())
                .collect::<Vec<_>>(),
        )
    }

    /// Joint statistic, the sum of the statistics of all datasets
    pub fn stat_sum(&self) -> Result<f64> {
        let mut total = 0.0;
        for dataset in &self.datasets {
            total += dataset.stat_sum()?;
        }
        Ok(total)
    }

    /// Whether all datasets are of the same type
    pub fn is_all_same_type(&self) -> bool {
        self.datasets
            .windows(2)
            .all(|w| w[0].tag() == w[1].tag())
    }

    /// A copy of the collection with independent models
    ///
    /// Models shared between datasets remain shared between the copied datasets.
    pub fn deep_copy(&self) -> Result<Datasets> {
        let originals: Vec<Arc<SkyModel>> = self.models()?.iter().cloned().collect();
        let copies: Vec<Arc<SkyModel>> = originals
            .iter()
            .map(|m| Arc::new(m.deep_copy()))
            .collect();

        let mut datasets = Datasets::new();
        for dataset in &self.datasets {
            let models = dataset
                .models()
                .iter()
                .filter_map(|m| {
                    originals
                        .iter()
                        .position(|o| Arc::ptr_eq(o, m))
                        .map(|i| copies[i].clone())
                })
                .collect();
            datasets.push(dataset.copy_with_models(models))?;
        }
        Ok(datasets)
    }

    /// Whether all datasets hold data of the same shape
    pub fn is_all_same_shape(&self) -> bool {
        self.datasets
            .windows(2)
            .all(|w| w[0].data_shape() == w[1].data_shape())
    }

    /// Reduce the collection to a single dataset by stacking
    ///
    /// Supported for collections of [SpectrumDataset]s or of [SpectrumDatasetOnOff]s with
    /// identical energy binning. The stacked dataset keeps the models of the first one.
    pub fn stack_reduce(&self, name: &str) -> Result<Box<dyn Dataset>> {
        if !self.is_all_same_type() {
            bail!("Stacking impossible: all Datasets contained are not of a unique type.");
        }
        let (first, rest) = self
            .datasets
            .split_first()
            .ok_or_else(|| anyhow!("Cannot stack an empty collection of datasets"))?;
        let mut stacked = first.copy_named(name);
        for other in rest {
            stacked.stack_with(other.as_ref())?;
        }
        Ok(stacked)
    }

    /// Summary table of the counts spectra, one row per dataset
    ///
    /// With `cumulative`, each row summarises the stack of all datasets up to that one, under
    /// the name `stacked`.
    pub fn info_table(&self, cumulative: bool) -> Result<Vec<SpectrumInfo>> {
        if !self.is_all_same_type() {
            bail!("Info table not supported for mixed dataset types.");
        }
        let summary = |dataset: &dyn Dataset| {
            dataset.spectrum_info().ok_or_else(|| {
                anyhow!(
                    "Info table not supported for {} '{}'",
                    dataset.tag(),
                    dataset.name()
                )
            })
        };

        let (first, rest) = match self.datasets.split_first() {
            Some(split) => split,
            None => return Ok(Vec::new()),
        };
        if !cumulative {
            return self.datasets.iter().map(|d| summary(d.as_ref())).collect();
        }
        let mut stacked = first.copy_named("stacked");
        let mut rows = vec![summary(stacked.as_ref())?];
        for dataset in rest {
            stacked.stack_with(dataset.as_ref())?;
            rows.push(summary(stacked.as_ref())?);
        }
        Ok(rows)
    }
}
