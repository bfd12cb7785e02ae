use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use ndarray::{Array1, Zip};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};

use crate::datasets::{check_edges, check_mask, Dataset, DatasetDescription};
use crate::models::SkyModel;
use crate::routines::stats::{cash_array, wstat_array, wstat_mu_bkg};

/// Predicted signal counts per energy bin, summed over models
pub(crate) fn npred_signal(
    models: &[Arc<SkyModel>],
    edges: &[f64],
    exposure: &Array1<f64>,
) -> Array1<f64> {
    let mut npred = Array1::zeros(exposure.len());
    for model in models {
        for (i, w) in edges.windows(2).enumerate() {
            npred[i] += exposure[i] * model.spectral().integral(w[0], w[1]);
        }
    }
    npred
}

/// Rebuild contiguous energy edges from per-bin intervals
pub(crate) fn edges_from_bins(bins: &[(f64, f64)]) -> Result<Vec<f64>> {
    let mut edges: Vec<f64> = bins.iter().map(|b| b.0).collect();
    match bins.last() {
        Some(last) => edges.push(last.1),
        None => bail!("Data table contains no energy bins"),
    }
    for (i, w) in bins.windows(2).enumerate() {
        if (w[0].1 - w[1].0).abs() > 1e-9 * w[0].1.abs() {
            bail!("Energy bins {} and {} are not contiguous", i, i + 1);
        }
    }
    check_edges(&edges)?;
    Ok(edges)
}

/// Draw Poisson counts with the given means
pub(crate) fn poisson_draw(means: &Array1<f64>, rng: &mut StdRng) -> Result<Array1<f64>> {
    let mut draws = Array1::zeros(means.len());
    for (draw, &mu) in draws.iter_mut().zip(means.iter()) {
        *draw = if mu > 0.0 {
            Poisson::new(mu)
                .map_err(|e| anyhow!("Invalid Poisson mean {}: {}", mu, e))?
                .sample(rng)
        } else {
            0.0
        };
    }
    Ok(draws)
}

/// Check that two datasets share the same energy binning before stacking them
fn check_same_binning(
    name: &str,
    edges: &[f64],
    other_name: &str,
    other_edges: &[f64],
) -> Result<()> {
    let same_edges = edges.len() == other_edges.len()
        && edges
            .iter()
            .zip(other_edges)
            .all(|(a, b)| (a - b).abs() <= 1e-9 * a.abs());
    if !same_edges {
        bail!(
            "Cannot stack '{}' into '{}': energy binning differs",
            other_name,
            name
        );
    }
    Ok(())
}

fn safe_or_all(mask: &Option<Array1<bool>>, n: usize) -> Array1<bool> {
    mask.clone().unwrap_or_else(|| Array1::from_elem(n, true))
}

/// Bin-wise sum of two arrays, each entry counted only where its own safe mask is set
fn sum_within_safe(
    a: &Array1<f64>,
    b: &Array1<f64>,
    safe_a: &Array1<bool>,
    safe_b: &Array1<bool>,
) -> Array1<f64> {
    Zip::from(a)
        .and(b)
        .and(safe_a)
        .and(safe_b)
        .map_collect(|&a, &b, &sa, &sb| {
            (if sa { a } else { 0.0 }) + (if sb { b } else { 0.0 })
        })
}

fn masked_sum(values: &Array1<f64>, mask: &Array1<bool>) -> f64 {
    values
        .iter()
        .zip(mask.iter())
        .filter(|(_, m)| **m)
        .map(|(v, _)| v)
        .sum()
}

/// Alpha of a stacked ON/OFF bin
///
/// `runs` holds `(alpha, counts_off, total_off)` of every run whose safe mask includes the bin,
/// `total_off` being the OFF counts of the run summed over its safe bins. The alphas are weighted
/// by the OFF counts of the bin, or by the total OFF counts of each run when the bin has none.
fn stacked_alpha(runs: &[(f64, f64, f64)]) -> Option<f64> {
    let weighted = |weight: fn(&(f64, f64, f64)) -> f64| {
        let total: f64 = runs.iter().map(weight).sum();
        (total > 0.0).then(|| runs.iter().map(|r| r.0 * weight(r)).sum::<f64>() / total)
    };
    weighted(|r| r.1).or_else(|| weighted(|r| r.2)).or_else(|| {
        (!runs.is_empty()).then(|| runs.iter().map(|r| r.0).sum::<f64>() / runs.len() as f64)
    })
}

/// Summary of a counts spectrum over its selected bins
#[derive(Debug, Clone, Serialize)]
pub struct SpectrumInfo {
    pub name: String,
    pub n_bins: usize,
    pub counts: f64,
    /// OFF counts, for ON/OFF spectra only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts_off: Option<f64>,
    pub background: f64,
    pub excess: f64,
    pub npred: f64,
}

/// Counts spectrum with a known background
///
/// The statistic is the Cash statistic between the observed counts and
/// `npred = background + exposure * integral flux`.
#[derive(Debug, Clone)]
pub struct SpectrumDataset {
    name: String,
    pub energy_edges: Vec<f64>,
    pub counts: Array1<f64>,
    /// Exposure in `cm2 s`
    pub exposure: Array1<f64>,
    pub background: Array1<f64>,
    mask_safe: Option<Array1<bool>>,
    mask_fit: Option<Array1<bool>>,
    models: Vec<Arc<SkyModel>>,
}

impl SpectrumDataset {
    pub fn new(
        name: impl Into<String>,
        energy_edges: Vec<f64>,
        counts: Array1<f64>,
        exposure: Array1<f64>,
        background: Array1<f64>,
    ) -> Result<Self> {
        let name = name.into();
        check_edges(&energy_edges)?;
        let n = energy_edges.len() - 1;
        if counts.len() != n || exposure.len() != n || background.len() != n {
            bail!(
                "Dataset '{}': counts, exposure and background must have {} bins, got {}, {} and {}",
                name,
                n,
                counts.len(),
                exposure.len(),
                background.len()
            );
        }
        Ok(SpectrumDataset {
            name,
            energy_edges,
            counts,
            exposure,
            background,
            mask_safe: None,
            mask_fit: None,
            models: Vec::new(),
        })
    }

    pub fn with_mask_safe(mut self, mask: Array1<bool>) -> Result<Self> {
        let mask = Some(mask);
        check_mask(&mask, self.counts.len(), &self.name)?;
        self.mask_safe = mask;
        Ok(self)
    }

    pub fn with_models(mut self, models: Vec<Arc<SkyModel>>) -> Self {
        self.models = models;
        self
    }

    /// A copy of the dataset under another name
    pub fn renamed(&self, name: &str) -> Self {
        SpectrumDataset {
            name: name.to_string(),
            ..self.clone()
        }
    }

    pub fn npred_signal(&self) -> Array1<f64> {
        npred_signal(&self.models, &self.energy_edges, &self.exposure)
    }

    /// Total predicted counts
    pub fn npred(&self) -> Array1<f64> {
        self.npred_signal() + &self.background
    }

    /// Replace the counts by a Poisson realisation of the predicted counts
    pub fn fake(&mut self, seed: u64) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.counts = poisson_draw(&self.npred(), &mut rng)?;
        Ok(())
    }

    /// Stack another dataset into this one
    ///
    /// Counts, exposure and background are summed within the safe mask of each dataset. The
    /// resulting safe mask is the union of both, and the fit mask is reset.
    pub fn stack(&mut self, other: &SpectrumDataset) -> Result<()> {
        check_same_binning(&self.name, &self.energy_edges, &other.name, &other.energy_edges)?;
        let n = self.counts.len();
        let safe_self = safe_or_all(&self.mask_safe, n);
        let safe_other = safe_or_all(&other.mask_safe, n);

        let sum =
            |a: &Array1<f64>, b: &Array1<f64>| sum_within_safe(a, b, &safe_self, &safe_other);
        self.counts = sum(&self.counts, &other.counts);
        self.exposure = sum(&self.exposure, &other.exposure);
        self.background = sum(&self.background, &other.background);
        self.mask_safe = Some(
            Zip::from(&safe_self)
                .and(&safe_other)
                .map_collect(|&a, &b| a || b),
        );
        self.mask_fit = None;
        tracing::debug!("Stacked '{}' into '{}'", other.name, self.name);
        Ok(())
    }

    pub fn info(&self) -> SpectrumInfo {
        let mask = self
            .mask()
            .unwrap_or_else(|| Array1::from_elem(self.counts.len(), true));
        let counts = masked_sum(&self.counts, &mask);
        let background = masked_sum(&self.background, &mask);
        SpectrumInfo {
            name: self.name.clone(),
            n_bins: self.counts.len(),
            counts,
            counts_off: None,
            background,
            excess: counts - background,
            npred: masked_sum(&self.npred(), &mask),
        }
    }

    /// Read the data table written by [Dataset::write_data]
    pub fn read_csv(name: &str, path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open data file {:?}", path))?;
        let rows = reader
            .deserialize::<SpectrumRow>()
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to parse data file {:?}", path))?;
        let edges = edges_from_bins(&rows.iter().map(|r| (r.e_min, r.e_max)).collect::<Vec<_>>())?;
        SpectrumDataset::new(
            name,
            edges,
            rows.iter().map(|r| r.counts).collect(),
            rows.iter().map(|r| r.exposure).collect(),
            rows.iter().map(|r| r.background).collect(),
        )?
        .with_mask_safe(rows.iter().map(|r| r.mask_safe).collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SpectrumRow {
    e_min: f64,
    e_max: f64,
    counts: f64,
    exposure: f64,
    background: f64,
    mask_safe: bool,
}

impl Dataset for SpectrumDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn tag(&self) -> &'static str {
        "SpectrumDataset"
    }

    fn models(&self) -> &[Arc<SkyModel>] {
        &self.models
    }

    fn set_models(&mut self, models: Vec<Arc<SkyModel>>) {
        self.models = models;
    }

    fn stat_array(&self) -> Result<Array1<f64>> {
        Ok(cash_array(&self.counts, &self.npred()))
    }

    fn data(&self) -> Array1<f64> {
        self.counts.clone()
    }

    fn model_values(&self) -> Result<Array1<f64>> {
        Ok(self.npred())
    }

    fn counts(&self) -> Option<Array1<f64>> {
        Some(self.counts.clone())
    }

    fn energy_ranges(&self) -> Vec<(f64, f64)> {
        self.energy_edges.windows(2).map(|w| (w[0], w[1])).collect()
    }

    fn mask_safe(&self) -> Option<&Array1<bool>> {
        self.mask_safe.as_ref()
    }

    fn mask_fit(&self) -> Option<&Array1<bool>> {
        self.mask_fit.as_ref()
    }

    fn set_mask_fit(&mut self, mask: Option<Array1<bool>>) -> Result<()> {
        check_mask(&mask, self.counts.len(), &self.name)?;
        self.mask_fit = mask;
        Ok(())
    }

    fn copy_with_models(&self, models: Vec<Arc<SkyModel>>) -> Box<dyn Dataset> {
        Box::new(SpectrumDataset {
            models,
            ..self.clone()
        })
    }

    fn copy_named(&self, name: &str) -> Box<dyn Dataset> {
        Box::new(self.renamed(name))
    }

    fn stack_with(&mut self, other: &dyn Dataset) -> Result<()> {
        match other.as_any().downcast_ref::<SpectrumDataset>() {
            Some(other) => self.stack(other),
            None => bail!(
                "Cannot stack {} '{}' into SpectrumDataset '{}'",
                other.tag(),
                other.name(),
                self.name
            ),
        }
    }

    fn spectrum_info(&self) -> Option<SpectrumInfo> {
        Some(self.info())
    }

    fn write_data(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create data file {:?}", path))?;
        for (i, w) in self.energy_edges.windows(2).enumerate() {
            writer.serialize(SpectrumRow {
                e_min: w[0],
                e_max: w[1],
                counts: self.counts[i],
                exposure: self.exposure[i],
                background: self.background[i],
                mask_safe: self.mask_safe.as_ref().map_or(true, |m| m[i]),
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    fn description(&self, filename: String) -> DatasetDescription {
        DatasetDescription::SpectrumDataset {
            name: self.name.clone(),
            filename,
            models: self.models.iter().map(|m| m.name().to_string()).collect(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// ON/OFF counts spectrum
///
/// The background in the ON region is unknown and is estimated from the OFF region, scaled by
/// `alpha`. The statistic is WStat, where the background is profiled out bin by bin.
#[derive(Debug, Clone)]
pub struct SpectrumDatasetOnOff {
    name: String,
    pub energy_edges: Vec<f64>,
    pub counts: Array1<f64>,
    pub counts_off: Array1<f64>,
    /// Ratio of ON to OFF exposure
    pub alpha: Array1<f64>,
    pub exposure: Array1<f64>,
    mask_safe: Option<Array1<bool>>,
    mask_fit: Option<Array1<bool>>,
    models: Vec<Arc<SkyModel>>,
}

impl SpectrumDatasetOnOff {
    pub fn new(
        name: impl Into<String>,
        energy_edges: Vec<f64>,
        counts: Array1<f64>,
        counts_off: Array1<f64>,
        alpha: Array1<f64>,
        exposure: Array1<f64>,
    ) -> Result<Self> {
        let name = name.into();
        check_edges(&energy_edges)?;
        let n = energy_edges.len() - 1;
        if counts.len() != n || counts_off.len() != n || alpha.len() != n || exposure.len() != n
        {
            bail!(
                "Dataset '{}': counts, counts_off, alpha and exposure must have {} bins",
                name,
                n
            );
        }
        if alpha.iter().any(|&a| a <= 0.0 || !a.is_finite()) {
            bail!("Dataset '{}': alpha must be positive and finite", name);
        }
        Ok(SpectrumDatasetOnOff {
            name,
            energy_edges,
            counts,
            counts_off,
            alpha,
            exposure,
            mask_safe: None,
            mask_fit: None,
            models: Vec::new(),
        })
    }

    pub fn with_mask_safe(mut self, mask: Array1<bool>) -> Result<Self> {
        let mask = Some(mask);
        check_mask(&mask, self.counts.len(), &self.name)?;
        self.mask_safe = mask;
        Ok(self)
    }

    pub fn with_models(mut self, models: Vec<Arc<SkyModel>>) -> Self {
        self.models = models;
        self
    }

    /// A copy of the dataset under another name
    pub fn renamed(&self, name: &str) -> Self {
        SpectrumDatasetOnOff {
            name: name.to_string(),
            ..self.clone()
        }
    }

    pub fn npred_signal(&self) -> Array1<f64> {
        npred_signal(&self.models, &self.energy_edges, &self.exposure)
    }

    /// Predicted ON counts, with the background at its profile likelihood estimate
    pub fn npred(&self) -> Array1<f64> {
        let mu_sig = self.npred_signal();
        Zip::from(&self.counts)
            .and(&self.counts_off)
            .and(&self.alpha)
            .and(&mu_sig)
            .map_collect(|&on, &off, &alpha, &mu| mu + alpha * wstat_mu_bkg(on, off, alpha, mu))
    }

    /// Background estimate in the ON region, `alpha * counts_off`
    pub fn background(&self) -> Array1<f64> {
        &self.alpha * &self.counts_off
    }

    /// Excess counts, `counts - alpha * counts_off`
    pub fn excess(&self) -> Array1<f64> {
        &self.counts - &self.background()
    }

    /// Draw ON and OFF counts from the predicted signal and the given true ON background
    pub fn fake(&mut self, background: &Array1<f64>, seed: u64) -> Result<()> {
        if background.len() != self.counts.len() {
            bail!(
                "Background has {} bins, dataset '{}' has {}",
                background.len(),
                self.name,
                self.counts.len()
            );
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mu_on = self.npred_signal() + background;
        let mu_off = background / &self.alpha;
        self.counts = poisson_draw(&mu_on, &mut rng)?;
        self.counts_off = poisson_draw(&mu_off, &mut rng)?;
        Ok(())
    }

    /// Stack another ON/OFF dataset into this one
    ///
    /// ON counts, OFF counts and exposure are summed within the safe mask of each dataset. The
    /// stacked alpha is the average of the alphas weighted by the OFF counts, so that
    /// `alpha * counts_off` stays the summed background estimate. The resulting safe mask is the
    /// union of both, and the fit mask is reset.
    pub fn stack(&mut self, other: &SpectrumDatasetOnOff) -> Result<()> {
        check_same_binning(&self.name, &self.energy_edges, &other.name, &other.energy_edges)?;
        let n = self.counts.len();
        let safe_self = safe_or_all(&self.mask_safe, n);
        let safe_other = safe_or_all(&other.mask_safe, n);

        let runs = [
            (&*self, &safe_self, masked_sum(&self.counts_off, &safe_self)),
            (other, &safe_other, masked_sum(&other.counts_off, &safe_other)),
        ];
        let mut alpha = self.alpha.clone();
        for (i, value) in alpha.iter_mut().enumerate() {
            let bin: Vec<(f64, f64, f64)> = runs
                .iter()
                .filter(|(_, safe, _)| safe[i])
                .map(|(ds, _, total_off)| (ds.alpha[i], ds.counts_off[i], *total_off))
                .collect();
            if let Some(stacked) = stacked_alpha(&bin) {
                *value = stacked;
            }
        }

        let sum =
            |a: &Array1<f64>, b: &Array1<f64>| sum_within_safe(a, b, &safe_self, &safe_other);
        self.counts = sum(&self.counts, &other.counts);
        self.counts_off = sum(&self.counts_off, &other.counts_off);
        self.exposure = sum(&self.exposure, &other.exposure);
        self.alpha = alpha;
        self.mask_safe = Some(
            Zip::from(&safe_self)
                .and(&safe_other)
                .map_collect(|&a, &b| a || b),
        );
        self.mask_fit = None;
        tracing::debug!("Stacked '{}' into '{}'", other.name, self.name);
        Ok(())
    }

    pub fn info(&self) -> SpectrumInfo {
        let mask = self
            .mask()
            .unwrap_or_else(|| Array1::from_elem(self.counts.len(), true));
        let counts = masked_sum(&self.counts, &mask);
        let background = masked_sum(&self.background(), &mask);
        SpectrumInfo {
            name: self.name.clone(),
            n_bins: self.counts.len(),
            counts,
            counts_off: Some(masked_sum(&self.counts_off, &mask)),
            background,
            excess: counts - background,
            npred: masked_sum(&self.npred(), &mask),
        }
    }

    pub fn read_csv(name: &str, path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open data file {:?}", path))?;
        let rows = reader
            .deserialize::<OnOffRow>()
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to parse data file {:?}", path))?;
        let edges = edges_from_bins(&rows.iter().map(|r| (r.e_min, r.e_max)).collect::<Vec<_>>())?;
        SpectrumDatasetOnOff::new(
            name,
            edges,
            rows.iter().map(|r| r.counts).collect(),
            rows.iter().map(|r| r.counts_off).collect(),
            rows.iter().map(|r| r.alpha).collect(),
            rows.iter().map(|r| r.exposure).collect(),
        )?
        .with_mask_safe(rows.iter().map(|r| r.mask_safe).collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OnOffRow {
    e_min: f64,
    e_max: f64,
    counts: f64,
    counts_off: f64,
    alpha: f64,
    exposure: f64,
    mask_safe: bool,
}

impl Dataset for SpectrumDatasetOnOff {
    fn name(&self) -> &str {
        &self.name
    }

    fn tag(&self) -> &'static str {
        "SpectrumDatasetOnOff"
    }

    fn models(&self) -> &[Arc<SkyModel>] {
        &self.models
    }

    fn set_models(&mut self, models: Vec<Arc<SkyModel>>) {
        self.models = models;
    }

    fn stat_array(&self) -> Result<Array1<f64>> {
        Ok(wstat_array(
            &self.counts,
            &self.counts_off,
            &self.alpha,
            &self.npred_signal(),
        ))
    }

    fn data(&self) -> Array1<f64> {
        self.counts.clone()
    }

    fn model_values(&self) -> Result<Array1<f64>> {
        Ok(self.npred())
    }

    fn counts(&self) -> Option<Array1<f64>> {
        Some(self.counts.clone())
    }

    fn energy_ranges(&self) -> Vec<(f64, f64)> {
        self.energy_edges.windows(2).map(|w| (w[0], w[1])).collect()
    }

    fn mask_safe(&self) -> Option<&Array1<bool>> {
        self.mask_safe.as_ref()
    }

    fn mask_fit(&self) -> Option<&Array1<bool>> {
        self.mask_fit.as_ref()
    }

    fn set_mask_fit(&mut self, mask: Option<Array1<bool>>) -> Result<()> {
        check_mask(&mask, self.counts.len(), &self.name)?;
        self.mask_fit = mask;
        Ok(())
    }

    fn copy_with_models(&self, models: Vec<Arc<SkyModel>>) -> Box<dyn Dataset> {
        Box::new(SpectrumDatasetOnOff {
            models,
            ..self.clone()
        })
    }

    fn copy_named(&self, name: &str) -> Box<dyn Dataset> {
        Box::new(self.renamed(name))
    }

    fn stack_with(&mut self, other: &dyn Dataset) -> Result<()> {
        match other.as_any().downcast_ref::<SpectrumDatasetOnOff>() {
            Some(other) => self.stack(other),
            None => bail!(
                "Cannot stack {} '{}' into SpectrumDatasetOnOff '{}'",
                other.tag(),
                other.name(),
                self.name
            ),
        }
    }

    fn spectrum_info(&self) -> Option<SpectrumInfo> {
        Some(self.info())
    }

    fn write_data(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create data file {:?}", path))?;
        for (i, w) in self.energy_edges.windows(2).enumerate() {
            writer.serialize(OnOffRow {
                e_min: w[0],
                e_max: w[1],
                counts: self.counts[i],
                counts_off: self.counts_off[i],
                alpha: self.alpha[i],
                exposure: self.exposure[i],
                mask_safe: self.mask_safe.as_ref().map_or(true, |m| m[i]),
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    fn description(&self, filename: String) -> DatasetDescription {
        DatasetDescription::SpectrumDatasetOnOff {
            name: self.name.clone(),
            filename,
            models: self.models.iter().map(|m| m.name().to_string()).collect(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::spectral::PowerLaw;
    use ndarray::array;

    fn crab() -> Arc<SkyModel> {
        Arc::new(SkyModel::new("crab", PowerLaw::new(2.0, 1e-11, 1.0)))
    }

    #[test]
    fn test_shape_validation() {
        let result = SpectrumDataset::new(
            "hess",
            vec![1.0, 2.0, 4.0],
            array![1.0],
            array![1.0, 1.0],
            array![0.0, 0.0],
        );
        assert!(result.is_err());
        assert!(SpectrumDataset::new("hess", vec![2.0, 1.0], array![1.0], array![1.0], array![0.0]).is_err());
    }

    #[test]
    fn test_npred_power_law() {
        // 1e-11 * (1 - 1/2) = 5e-12 cm-2 s-1 in [1, 2] TeV
        let ds = SpectrumDataset::new(
            "hess",
            vec![1.0, 2.0],
            array![0.0],
            array![1e12],
            array![3.0],
        )
        .unwrap()
        .with_models(vec![crab()]);
        let npred = ds.npred();
        assert!((npred[0] - 8.0).abs() < 1e-9);
        assert!((ds.npred_signal()[0] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_stat_sum_respects_mask() {
        let ds = SpectrumDataset::new(
            "hess",
            vec![1.0, 2.0, 4.0],
            array![5.0, 100.0],
            array![1e12, 1e12],
            array![0.0, 0.0],
        )
        .unwrap()
        .with_models(vec![crab()])
        .with_mask_safe(array![true, false])
        .unwrap();
        let stat = ds.stat_array().unwrap();
        assert!((ds.stat_sum().unwrap() - stat[0]).abs() < 1e-12);
        assert_eq!(ds.info().counts, 5.0);
    }

    #[test]
    fn test_fake_is_reproducible() {
        let mut a = SpectrumDataset::new(
            "hess",
            vec![1.0, 2.0, 4.0],
            array![0.0, 0.0],
            array![1e13, 1e13],
            array![1.0, 1.0],
        )
        .unwrap()
        .with_models(vec![crab()]);
        let mut b = a.clone();
        a.fake(42).unwrap();
        b.fake(42).unwrap();
        assert_eq!(a.counts, b.counts);
        assert!(a.counts.iter().all(|&c| c >= 0.0 && c.fract() == 0.0));
    }

    #[test]
    fn test_stack_with_safe_masks() {
        let a = SpectrumDataset::new(
            "a",
            vec![1.0, 2.0, 4.0],
            array![10.0, 20.0],
            array![1.0, 1.0],
            array![1.0, 2.0],
        )
        .unwrap()
        .with_mask_safe(array![false, true])
        .unwrap();
        let b = SpectrumDataset::new(
            "b",
            vec![1.0, 2.0, 4.0],
            array![1.0, 2.0],
            array![3.0, 3.0],
            array![0.5, 0.5],
        )
        .unwrap();
        let mut stacked = a.renamed("stacked");
        stacked.stack(&b).unwrap();
        assert_eq!(stacked.counts, array![1.0, 22.0]);
        assert_eq!(stacked.exposure, array![3.0, 4.0]);
        assert_eq!(stacked.background, array![0.5, 2.5]);
        assert_eq!(stacked.mask_safe().unwrap(), &array![true, true]);

        let other = SpectrumDataset::new("c", vec![1.0, 3.0, 4.0], array![1.0, 1.0], array![1.0, 1.0], array![0.0, 0.0]).unwrap();
        assert!(stacked.stack(&other).is_err());
    }

    #[test]
    fn test_onoff_wstat_zero_at_truth() {
        // Signal of 5 counts in [1, 2] TeV, background 4 = 0.1 * 40
        let ds = SpectrumDatasetOnOff::new(
            "magic",
            vec![1.0, 2.0],
            array![9.0],
            array![40.0],
            array![0.1],
            array![1e12],
        )
        .unwrap()
        .with_models(vec![crab()]);
        assert!(ds.stat_sum().unwrap().abs() < 1e-6);
        assert!((ds.model_values().unwrap()[0] - 9.0).abs() < 1e-6);
        assert_eq!(ds.excess(), array![5.0]);
    }

    #[test]
    fn test_onoff_stack_weights_alpha_by_off_counts() {
        let edges = vec![1.0, 2.0, 4.0, 8.0];
        let a = SpectrumDatasetOnOff::new(
            "a",
            edges.clone(),
            array![1.0, 1.0, 1.0],
            array![1.0, 0.0, 1.0],
            array![0.5, 0.5, 0.5],
            array![1e12, 1e12, 1e12],
        )
        .unwrap();
        let b = SpectrumDatasetOnOff::new(
            "b",
            edges,
            array![2.0, 2.0, 2.0],
            array![3.0, 0.0, 3.0],
            array![0.25, 0.25, 0.25],
            array![1e12, 1e12, 1e12],
        )
        .unwrap();
        let mut stacked = a.renamed("stacked");
        stacked.stack(&b).unwrap();

        assert_eq!(stacked.counts, array![3.0, 3.0, 3.0]);
        assert_eq!(stacked.counts_off, array![4.0, 0.0, 4.0]);
        assert!((stacked.alpha[0] - 1.25 / 4.0).abs() < 1e-12);
        // No OFF counts in the bin: weighted by the total OFF counts of each run
        assert!((stacked.alpha[1] - 2.5 / 8.0).abs() < 1e-12);
        // The background estimate is additive
        assert!((stacked.background()[0] - (a.background()[0] + b.background()[0])).abs() < 1e-12);

        let info = stacked.info();
        assert_eq!(info.counts, 9.0);
        assert_eq!(info.counts_off, Some(8.0));
        assert!((info.background - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_onoff_stack_with_safe_masks() {
        let edges = vec![1.0, 2.0, 4.0];
        let a = SpectrumDatasetOnOff::new(
            "a",
            edges.clone(),
            array![10.0, 10.0],
            array![20.0, 20.0],
            array![0.1, 0.1],
            array![1.0, 1.0],
        )
        .unwrap()
        .with_mask_safe(array![false, true])
        .unwrap();
        let b = SpectrumDatasetOnOff::new(
            "b",
            edges,
            array![5.0, 5.0],
            array![10.0, 10.0],
            array![0.2, 0.2],
            array![2.0, 2.0],
        )
        .unwrap();
        let mut stacked = a.renamed("stacked");
        stacked.stack(&b).unwrap();
        assert_eq!(stacked.counts, array![5.0, 15.0]);
        assert_eq!(stacked.exposure, array![2.0, 3.0]);
        assert!((stacked.alpha[0] - 0.2).abs() < 1e-12);
        assert!((stacked.alpha[1] - 4.0 / 30.0).abs() < 1e-12);
        assert_eq!(stacked.mask_safe().unwrap(), &array![true, true]);
    }

    #[test]
    fn test_stack_with_rejects_other_types() {
        let spectrum = SpectrumDataset::new(
            "hess",
            vec![1.0, 2.0],
            array![1.0],
            array![1.0],
            array![0.0],
        )
        .unwrap();
        let mut onoff = SpectrumDatasetOnOff::new(
            "magic",
            vec![1.0, 2.0],
            array![1.0],
            array![1.0],
            array![0.5],
            array![1.0],
        )
        .unwrap();
        assert!(onoff.stack_with(&spectrum).is_err());
        let mut copy = spectrum.copy_named("copy");
        assert_eq!(copy.name(), "copy");
        copy.stack_with(&spectrum).unwrap();
        assert_eq!(copy.data(), array![2.0]);
    }

    #[test]
    fn test_onoff_invalid_alpha() {
        let result = SpectrumDatasetOnOff::new(
            "magic",
            vec![1.0, 2.0],
            array![9.0],
            array![40.0],
            array![0.0],
            array![1e12],
        );
        assert!(result.is_err());
    }
}
