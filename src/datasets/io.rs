use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::datasets::{
    Dataset, Datasets, FluxPointsDataset, MapDataset, MapGeom, SpectrumDataset,
    SpectrumDatasetOnOff,
};
use crate::models::Models;

/// Manifest entry of a single dataset
///
/// `filename` points to the data table, relative to the directory of the manifest. `models`
/// lists the names of the attached models, resolved against the models manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum DatasetDescription {
    SpectrumDataset {
        name: String,
        filename: String,
        #[serde(default)]
        models: Vec<String>,
    },
    SpectrumDatasetOnOff {
        name: String,
        filename: String,
        #[serde(default)]
        models: Vec<String>,
    },
    MapDataset {
        name: String,
        filename: String,
        #[serde(default)]
        models: Vec<String>,
        geom: MapGeom,
        #[serde(default)]
        psf_sigma: f64,
    },
    FluxPointsDataset {
        name: String,
        filename: String,
        #[serde(default)]
        models: Vec<String>,
    },
}

impl DatasetDescription {
    pub fn name(&self) -> &str {
        match self {
            DatasetDescription::SpectrumDataset { name, .. }
            | DatasetDescription::SpectrumDatasetOnOff { name, .. }
            | DatasetDescription::MapDataset { name, .. }
            | DatasetDescription::FluxPointsDataset { name, .. } => name,
        }
    }

    pub fn models(&self) -> &[String] {
        match self {
            DatasetDescription::SpectrumDataset { models, .. }
            | DatasetDescription::SpectrumDatasetOnOff { models, .. }
            | DatasetDescription::MapDataset { models, .. }
            | DatasetDescription::FluxPointsDataset { models, .. } => models,
        }
    }

    /// Read the data table and build the dataset, without models
    pub fn load(&self, base: &Path) -> Result<Box<dyn Dataset>> {
        let dataset: Box<dyn Dataset> = match self {
            DatasetDescription::SpectrumDataset { name, filename, .. } => {
                Box::new(SpectrumDataset::read_csv(name, &base.join(filename))?)
            }
            DatasetDescription::SpectrumDatasetOnOff { name, filename, .. } => {
                Box::new(SpectrumDatasetOnOff::read_csv(name, &base.join(filename))?)
            }
            DatasetDescription::MapDataset {
                name,
                filename,
                geom,
                psf_sigma,
                ..
            } => Box::new(
                MapDataset::read_csv(name, &base.join(filename), geom.clone())?
                    .with_psf_sigma(*psf_sigma)?,
            ),
            DatasetDescription::FluxPointsDataset { name, filename, .. } => {
                Box::new(FluxPointsDataset::read_csv(name, &base.join(filename))?)
            }
        };
        Ok(dataset)
    }
}

/// Contents of a datasets YAML manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DatasetsDescription {
    pub datasets: Vec<DatasetDescription>,
}

/// Paths written by [Datasets::write]
#[derive(Debug, Clone)]
pub struct WrittenFiles {
    pub datasets: PathBuf,
    pub models: PathBuf,
    pub data: Vec<PathBuf>,
}

impl Datasets {
    /// Write the datasets and their models
    ///
    /// Creates `<prefix>_datasets.yaml`, `<prefix>_models.yaml` and one
    /// `<prefix>_<name>.csv` data table per dataset in `dir`. Unless `overwrite` is set, nothing
    /// is written when any of these files already exists.
    pub fn write(
        &self,
        dir: impl AsRef<Path>,
        prefix: &str,
        overwrite: bool,
    ) -> Result<WrittenFiles> {
        let dir = dir.as_ref();
        let datasets_path = dir.join(format!("{}_datasets.yaml", prefix));
        let models_path = dir.join(format!("{}_models.yaml", prefix));
        if !overwrite {
            let targets = self
                .iter()
                .map(|d| dir.join(format!("{}_{}.csv", prefix, d.name())))
                .chain([datasets_path.clone(), models_path.clone()]);
            for target in targets {
                if target.exists() {
                    bail!("File {:?} already exists and overwrite is not set", target);
                }
            }
        }
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {:?}", dir))?;

        let mut description = DatasetsDescription::default();
        let mut data = Vec::with_capacity(self.len());
        for dataset in self.iter() {
            let filename = format!("{}_{}.csv", prefix, dataset.name());
            let path = dir.join(&filename);
            dataset
                .write_data(&path)
                .with_context(|| format!("Failed to write dataset '{}'", dataset.name()))?;
            description.datasets.push(dataset.description(filename));
            data.push(path);
        }

        let file = File::create(&datasets_path)
            .with_context(|| format!("Failed to create datasets file {:?}", datasets_path))?;
        serde_yaml::to_writer(file, &description)?;

        self.models()?.write(&models_path)?;

        tracing::info!("Wrote {} dataset(s) to {:?}", self.len(), dir);
        Ok(WrittenFiles {
            datasets: datasets_path,
            models: models_path,
            data,
        })
    }

    /// Read datasets and attach the models they reference
    ///
    /// Datasets naming the same model share a single instance of it.
    pub fn read(datasets_path: impl AsRef<Path>, models_path: impl AsRef<Path>) -> Result<Datasets> {
        let datasets_path = datasets_path.as_ref();
        let file = File::open(datasets_path)
            .with_context(|| format!("Failed to open datasets file {:?}", datasets_path))?;
        let description: DatasetsDescription = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse datasets file {:?}", datasets_path))?;
        let models = Models::read(models_path)?;
        let base = datasets_path.parent().unwrap_or_else(|| Path::new("."));

        let mut datasets = Datasets::new();
        for entry in &description.datasets {
            let mut dataset = entry
                .load(base)
                .with_context(|| format!("Failed to load dataset '{}'", entry.name()))?;
            dataset.set_models(models.select(entry.models())?);
            tracing::debug!(
                "Loaded {} '{}' with models {:?}",
                dataset.tag(),
                dataset.name(),
                entry.models()
            );
            datasets.push(dataset)?;
        }
        Ok(datasets)
    }
}
