use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::datasets::spectrum::{edges_from_bins, poisson_draw};
use crate::datasets::{check_edges, check_mask, Dataset, DatasetDescription};
use crate::models::SkyModel;
use crate::routines::stats::cash_array;

/// A regular grid of square pixels on a flat patch of sky
///
/// Pixels are numbered row by row: pixel `p` is at column `p % nx` and row `p / nx`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MapGeom {
    /// Centre of the first pixel, in degrees
    pub lon_min: f64,
    pub lat_min: f64,
    /// Side of a pixel, in degrees
    pub bin_size: f64,
    pub nx: usize,
    pub ny: usize,
}

impl MapGeom {
    /// A `width` by `width` degrees field of view centred on (`lon`, `lat`)
    pub fn centred(lon: f64, lat: f64, width: f64, bin_size: f64) -> Result<Self> {
        if bin_size <= 0.0 || width < bin_size {
            bail!(
                "Invalid map geometry: width {} and bin size {}",
                width,
                bin_size
            );
        }
        let n = (width / bin_size).round() as usize;
        let half = 0.5 * (n as f64 - 1.0) * bin_size;
        Ok(MapGeom {
            lon_min: lon - half,
            lat_min: lat - half,
            bin_size,
            nx: n,
            ny: n,
        })
    }

    pub fn n_pixels(&self) -> usize {
        self.nx * self.ny
    }

    /// Centre of pixel `p`
    pub fn pixel_center(&self, p: usize) -> (f64, f64) {
        let (ix, iy) = (p % self.nx, p / self.nx);
        (
            self.lon_min + ix as f64 * self.bin_size,
            self.lat_min + iy as f64 * self.bin_size,
        )
    }
}

/// Counts cube binned in energy and sky position
///
/// Cubes have shape `(n_energy, n_pixels)`. The exposure of a pixel is in `cm2 s`. Attached
/// models must have a spatial component. The statistic is Cash, flattened in the same order as
/// the cubes.
#[derive(Debug, Clone)]
pub struct MapDataset {
    name: String,
    pub energy_edges: Vec<f64>,
    pub geom: MapGeom,
    pub counts: Array2<f64>,
    pub exposure: Array2<f64>,
    pub background: Array2<f64>,
    /// Width of the gaussian point spread function, in degrees
    pub psf_sigma: f64,
    mask_safe: Option<Array1<bool>>,
    mask_fit: Option<Array1<bool>>,
    models: Vec<Arc<SkyModel>>,
}

impl MapDataset {
    pub fn new(
        name: impl Into<String>,
        energy_edges: Vec<f64>,
        geom: MapGeom,
        counts: Array2<f64>,
        exposure: Array2<f64>,
        background: Array2<f64>,
    ) -> Result<Self> {
        let name = name.into();
        check_edges(&energy_edges)?;
        let shape = (energy_edges.len() - 1, geom.n_pixels());
        if counts.dim() != shape || exposure.dim() != shape || background.dim() != shape {
            bail!(
                "Dataset '{}': counts, exposure and background must have shape {:?}",
                name,
                shape
            );
        }
        Ok(MapDataset {
            name,
            energy_edges,
            geom,
            counts,
            exposure,
            background,
            psf_sigma: 0.0,
            mask_safe: None,
            mask_fit: None,
            models: Vec::new(),
        })
    }

    pub fn with_psf_sigma(mut self, psf_sigma: f64) -> Result<Self> {
        if psf_sigma < 0.0 || !psf_sigma.is_finite() {
            bail!("PSF width must be non-negative, got {}", psf_sigma);
        }
        self.psf_sigma = psf_sigma;
        Ok(self)
    }

    /// Safe mask over the flattened cube
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

    /// Predicted signal counts cube
    pub fn npred_signal(&self) -> Result<Array2<f64>> {
        let (n_e, n_pix) = self.counts.dim();
        let mut npred = Array2::zeros((n_e, n_pix));
        for model in &self.models {
            let spatial = match model.spatial() {
                Some(spatial) => spatial,
                None => bail!(
                    "Model '{}' has no spatial component and cannot be attached to map dataset '{}'",
                    model.name(),
                    self.name
                ),
            };
            let fractions: Vec<f64> = (0..n_pix)
                .map(|p| {
                    let (lon, lat) = self.geom.pixel_center(p);
                    spatial.integrate_pixel(lon, lat, self.geom.bin_size, self.psf_sigma)
                })
                .collect();
            for (e, w) in self.energy_edges.windows(2).enumerate() {
                let flux = model.spectral().integral(w[0], w[1]);
                for (p, fraction) in fractions.iter().enumerate() {
                    npred[[e, p]] += flux * fraction * self.exposure[[e, p]];
                }
            }
        }
        Ok(npred)
    }

    pub fn npred(&self) -> Result<Array2<f64>> {
        Ok(self.npred_signal()? + &self.background)
    }

    /// Replace the counts by a Poisson realisation of the predicted counts
    pub fn fake(&mut self, seed: u64) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(seed);
        let npred = flatten(&self.npred()?);
        let counts = poisson_draw(&npred, &mut rng)?;
        self.counts = counts.into_shape(self.counts.dim())?;
        Ok(())
    }

    pub fn read_csv(name: &str, path: &Path, geom: MapGeom) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open data file {:?}", path))?;
        let rows = reader
            .deserialize::<MapRow>()
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to parse data file {:?}", path))?;

        let n_pix = geom.n_pixels();
        if n_pix == 0 || rows.len() % n_pix != 0 {
            bail!(
                "Data file {:?} has {} rows, not a multiple of {} pixels",
                path,
                rows.len(),
                n_pix
            );
        }
        let n_e = rows.len() / n_pix;
        let bins: Vec<(f64, f64)> = (0..n_e)
            .map(|e| (rows[e * n_pix].e_min, rows[e * n_pix].e_max))
            .collect();
        let edges = edges_from_bins(&bins)?;
        for (i, row) in rows.iter().enumerate() {
            if row.pixel != i % n_pix {
                bail!("Data file {:?}: row {} is out of order", path, i);
            }
        }

        let cube = |f: fn(&MapRow) -> f64| -> Result<Array2<f64>> {
            Ok(Array2::from_shape_vec((n_e, n_pix), rows.iter().map(f).collect())?)
        };
        MapDataset::new(
            name,
            edges,
            geom,
            cube(|r| r.counts)?,
            cube(|r| r.exposure)?,
            cube(|r| r.background)?,
        )?
        .with_mask_safe(rows.iter().map(|r| r.mask_safe).collect())
    }
}

fn flatten(cube: &Array2<f64>) -> Array1<f64> {
    cube.iter().cloned().collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct MapRow {
    e_min: f64,
    e_max: f64,
    pixel: usize,
    counts: f64,
    exposure: f64,
    background: f64,
    mask_safe: bool,
}

impl Dataset for MapDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn tag(&self) -> &'static str {
        "MapDataset"
    }

    fn models(&self) -> &[Arc<SkyModel>] {
        &self.models
    }

    fn set_models(&mut self, models: Vec<Arc<SkyModel>>) {
        self.models = models;
    }

    fn stat_array(&self) -> Result<Array1<f64>> {
        Ok(cash_array(&flatten(&self.counts), &flatten(&self.npred()?)))
    }

    fn data(&self) -> Array1<f64> {
        flatten(&self.counts)
    }

    fn model_values(&self) -> Result<Array1<f64>> {
        Ok(flatten(&self.npred()?))
    }

    fn counts(&self) -> Option<Array1<f64>> {
        Some(flatten(&self.counts))
    }

    fn energy_ranges(&self) -> Vec<(f64, f64)> {
        let n_pix = self.geom.n_pixels();
        self.energy_edges
            .windows(2)
            .flat_map(|w| std::iter::repeat((w[0], w[1])).take(n_pix))
            .collect()
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
        Box::new(MapDataset {
            models,
            ..self.clone()
        })
    }

    fn copy_named(&self, name: &str) -> Box<dyn Dataset> {
        Box::new(MapDataset {
            name: name.to_string(),
            ..self.clone()
        })
    }

    fn data_shape(&self) -> Vec<usize> {
        self.counts.shape().to_vec()
    }

    fn write_data(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create data file {:?}", path))?;
        let n_pix = self.geom.n_pixels();
        for (e, w) in self.energy_edges.windows(2).enumerate() {
            for p in 0..n_pix {
                writer.serialize(MapRow {
                    e_min: w[0],
                    e_max: w[1],
                    pixel: p,
                    counts: self.counts[[e, p]],
                    exposure: self.exposure[[e, p]],
                    background: self.background[[e, p]],
                    mask_safe: self.mask_safe.as_ref().map_or(true, |m| m[e * n_pix + p]),
                })?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    fn description(&self, filename: String) -> DatasetDescription {
        DatasetDescription::MapDataset {
            name: self.name.clone(),
            filename,
            models: self.models.iter().map(|m| m.name().to_string()).collect(),
            geom: self.geom.clone(),
            psf_sigma: self.psf_sigma,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
