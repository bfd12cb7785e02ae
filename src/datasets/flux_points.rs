use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ndarray::{Array1, Zip};
use serde::{Deserialize, Serialize};

use crate::datasets::{check_mask, Dataset, DatasetDescription};
use crate::models::SkyModel;
use crate::routines::stats::chi2_array;

/// Differential flux measurements at reference energies
///
/// Compared to the summed `dnde` of the attached models with a chi-square statistic. Points
/// flagged as upper limits do not contribute to the statistic.
#[derive(Debug, Clone)]
pub struct FluxPointsDataset {
    name: String,
    /// Reference energies, in TeV
    pub e_ref: Array1<f64>,
    /// Differential flux, in `cm-2 s-1 TeV-1`
    pub dnde: Array1<f64>,
    pub dnde_err: Array1<f64>,
    pub is_ul: Array1<bool>,
    mask_safe: Option<Array1<bool>>,
    mask_fit: Option<Array1<bool>>,
    models: Vec<Arc<SkyModel>>,
}

impl FluxPointsDataset {
    pub fn new(
        name: impl Into<String>,
        e_ref: Array1<f64>,
        dnde: Array1<f64>,
        dnde_err: Array1<f64>,
        is_ul: Array1<bool>,
    ) -> Result<Self> {
        let name = name.into();
        let n = e_ref.len();
        if n == 0 {
            bail!("Dataset '{}' contains no flux points", name);
        }
        if dnde.len() != n || dnde_err.len() != n || is_ul.len() != n {
            bail!(
                "Dataset '{}': e_ref, dnde, dnde_err and is_ul must have {} entries",
                name,
                n
            );
        }
        if e_ref.iter().any(|&e| e <= 0.0) {
            bail!("Dataset '{}': reference energies must be positive", name);
        }
        let bad_error = Zip::from(&dnde_err)
            .and(&is_ul)
            .fold(false, |acc, &err, &ul| acc || (!ul && (err.is_nan() || err <= 0.0)));
        if bad_error {
            bail!(
                "Dataset '{}': flux errors must be positive for measured points",
                name
            );
        }
        Ok(FluxPointsDataset {
            name,
            e_ref,
            dnde,
            dnde_err,
            is_ul,
            mask_safe: None,
            mask_fit: None,
            models: Vec::new(),
        })
    }

    pub fn with_mask_safe(mut self, mask: Array1<bool>) -> Result<Self> {
        let mask = Some(mask);
        check_mask(&mask, self.e_ref.len(), &self.name)?;
        self.mask_safe = mask;
        Ok(self)
    }

    pub fn with_models(mut self, models: Vec<Arc<SkyModel>>) -> Self {
        self.models = models;
        self
    }

    /// Summed differential flux of the models at the reference energies
    pub fn dnde_model(&self) -> Array1<f64> {
        self.e_ref.mapv(|e| {
            self.models
                .iter()
                .map(|m| m.spectral().evaluate(e))
                .sum::<f64>()
        })
    }

    pub fn read_csv(name: &str, path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open data file {:?}", path))?;
        let rows = reader
            .deserialize::<FluxPointRow>()
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to parse data file {:?}", path))?;
        FluxPointsDataset::new(
            name,
            rows.iter().map(|r| r.e_ref).collect(),
            rows.iter().map(|r| r.dnde).collect(),
            rows.iter().map(|r| r.dnde_err).collect(),
            rows.iter().map(|r| r.is_ul).collect(),
        )?
        .with_mask_safe(rows.iter().map(|r| r.mask_safe).collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FluxPointRow {
    e_ref: f64,
    dnde: f64,
    dnde_err: f64,
    is_ul: bool,
    mask_safe: bool,
}

impl Dataset for FluxPointsDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn tag(&self) -> &'static str {
        "FluxPointsDataset"
    }

    fn models(&self) -> &[Arc<SkyModel>] {
        &self.models
    }

    fn set_models(&mut self, models: Vec<Arc<SkyModel>>) {
        self.models = models;
    }

    fn stat_array(&self) -> Result<Array1<f64>> {
        let mut stat = chi2_array(&self.dnde, &self.dnde_model(), &self.dnde_err);
        Zip::from(&mut stat).and(&self.is_ul).for_each(|s, &ul| {
            if ul {
                *s = 0.0;
            }
        });
        Ok(stat)
    }

    fn data(&self) -> Array1<f64> {
        self.dnde.clone()
    }

    fn model_values(&self) -> Result<Array1<f64>> {
        Ok(self.dnde_model())
    }

    fn counts(&self) -> Option<Array1<f64>> {
        None
    }

    fn energy_ranges(&self) -> Vec<(f64, f64)> {
        self.e_ref.iter().map(|&e| (e, e)).collect()
    }

    fn mask_safe(&self) -> Option<&Array1<bool>> {
        self.mask_safe.as_ref()
    }

    fn mask_fit(&self) -> Option<&Array1<bool>> {
        self.mask_fit.as_ref()
    }

    fn set_mask_fit(&mut self, mask: Option<Array1<bool>>) -> Result<()> {
        check_mask(&mask, self.e_ref.len(), &self.name)?;
        self.mask_fit = mask;
        Ok(())
    }

    fn copy_with_models(&self, models: Vec<Arc<SkyModel>>) -> Box<dyn Dataset> {
        Box::new(FluxPointsDataset {
            models,
            ..self.clone()
        })
    }

    fn copy_named(&self, name: &str) -> Box<dyn Dataset> {
        Box::new(FluxPointsDataset {
            name: name.to_string(),
            ..self.clone()
        })
    }

    fn write_data(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create data file {:?}", path))?;
        for i in 0..self.e_ref.len() {
            writer.serialize(FluxPointRow {
                e_ref: self.e_ref[i],
                dnde: self.dnde[i],
                dnde_err: self.dnde_err[i],
                is_ul: self.is_ul[i],
                mask_safe: self.mask_safe.as_ref().map_or(true, |m| m[i]),
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    fn description(&self, filename: String) -> DatasetDescription {
        DatasetDescription::FluxPointsDataset {
            name: self.name.clone(),
            filename,
            models: self.models.iter().map(|m| m.name().to_string()).collect(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
