use std::f64::consts::{PI, SQRT_2};
use std::fmt::Debug;

use anyhow::{bail, Result};
use statrs::function::erf::erf;

use crate::models::spectral::find;
use crate::models::ComponentDescription;
use crate::structs::parameter::{Parameter, Parameters};

/// Morphology of a source on a small patch of sky
///
/// Positions are in degrees on a flat (cartesian) patch; the models are meant for fields of a
/// few degrees, where the curvature of the sphere can be neglected.
pub trait SpatialModel: Send + Sync + Debug {
    fn tag(&self) -> &'static str;

    fn parameters(&self) -> Parameters;

    /// Fraction of the source flux falling into a square pixel
    ///
    /// The pixel is centred on (`lon`, `lat`) and has side `size`. The source is convolved with a
    /// gaussian point spread function of width `psf_sigma`, which may be zero.
    fn integrate_pixel(&self, lon: f64, lat: f64, size: f64, psf_sigma: f64) -> f64;

    fn deep_copy(&self) -> Box<dyn SpatialModel>;

    fn description(&self) -> ComponentDescription {
        ComponentDescription::new(self.tag(), &self.parameters())
    }
}

/// Fraction of a 1D gaussian centred on `mu` contained in `[lo, hi]`
fn gauss_fraction(lo: f64, hi: f64, mu: f64, sigma: f64) -> f64 {
    0.5 * (erf((hi - mu) / (SQRT_2 * sigma)) - erf((lo - mu) / (SQRT_2 * sigma)))
}

fn gauss_pixel(lon: f64, lat: f64, size: f64, lon_0: f64, lat_0: f64, sigma: f64) -> f64 {
    let h = 0.5 * size;
    gauss_fraction(lon - h, lon + h, lon_0, sigma) * gauss_fraction(lat - h, lat + h, lat_0, sigma)
}

/// Point source at (`lon_0`, `lat_0`)
#[derive(Debug, Clone)]
pub struct PointSpatial {
    pub lon_0: Parameter,
    pub lat_0: Parameter,
}

impl PointSpatial {
    pub fn new(lon_0: f64, lat_0: f64) -> Self {
        PointSpatial {
            lon_0: Parameter::new("lon_0", lon_0).with_unit("deg"),
            lat_0: Parameter::new("lat_0", lat_0).with_unit("deg"),
        }
    }
}

impl SpatialModel for PointSpatial {
    fn tag(&self) -> &'static str {
        "PointSpatial"
    }

    fn parameters(&self) -> Parameters {
        Parameters::new(vec![self.lon_0.clone(), self.lat_0.clone()])
    }

    fn integrate_pixel(&self, lon: f64, lat: f64, size: f64, psf_sigma: f64) -> f64 {
        let (lon_0, lat_0) = (self.lon_0.value(), self.lat_0.value());
        if psf_sigma > 0.0 {
            return gauss_pixel(lon, lat, size, lon_0, lat_0, psf_sigma);
        }
        let h = 0.5 * size;
        let inside = |x: f64, c: f64| x >= c - h && x < c + h;
        if inside(lon_0, lon) && inside(lat_0, lat) {
            1.0
        } else {
            0.0
        }
    }

    fn deep_copy(&self) -> Box<dyn SpatialModel> {
        Box::new(PointSpatial {
            lon_0: self.lon_0.deep_copy(),
            lat_0: self.lat_0.deep_copy(),
        })
    }
}

/// Symmetric gaussian source of width `sigma`
#[derive(Debug, Clone)]
pub struct GaussianSpatial {
    pub lon_0: Parameter,
    pub lat_0: Parameter,
    pub sigma: Parameter,
}

impl GaussianSpatial {
    pub fn new(lon_0: f64, lat_0: f64, sigma: f64) -> Result<Self> {
        Ok(GaussianSpatial {
            lon_0: Parameter::new("lon_0", lon_0).with_unit("deg"),
            lat_0: Parameter::new("lat_0", lat_0).with_unit("deg"),
            sigma: Parameter::new("sigma", sigma)
                .with_unit("deg")
                .with_bounds(0.0, f64::INFINITY)?,
        })
    }
}

impl SpatialModel for GaussianSpatial {
    fn tag(&self) -> &'static str {
        "GaussianSpatial"
    }

    fn parameters(&self) -> Parameters {
        Parameters::new(vec![
            self.lon_0.clone(),
            self.lat_0.clone(),
            self.sigma.clone(),
        ])
    }

    fn integrate_pixel(&self, lon: f64, lat: f64, size: f64, psf_sigma: f64) -> f64 {
        let sigma = self.sigma.value().hypot(psf_sigma);
        if sigma <= 0.0 {
            return 0.0;
        }
        gauss_pixel(
            lon,
            lat,
            size,
            self.lon_0.value(),
            self.lat_0.value(),
            sigma,
        )
    }

    fn deep_copy(&self) -> Box<dyn SpatialModel> {
        Box::new(GaussianSpatial {
            lon_0: self.lon_0.deep_copy(),
            lat_0: self.lat_0.deep_copy(),
            sigma: self.sigma.deep_copy(),
        })
    }
}

/// Sub-samples per axis when integrating a sharp-edged profile over a pixel
const OVERSAMPLE: usize = 8;
/// Sub-sources per axis when smearing a sharp-edged profile with the PSF
const SMEAR_CELLS: usize = 16;

/// Pixel fraction of a radially symmetric profile without an analytic integral
///
/// `brightness` is the normalised surface brightness (deg^-2) as a function of the distance to
/// the centre, and vanishes beyond `extent`. Without a PSF the pixel is oversampled; with a PSF
/// the profile is split into a grid of sub-sources, each smeared into a gaussian.
fn radial_pixel<F>(
    lon: f64,
    lat: f64,
    size: f64,
    psf_sigma: f64,
    centre: (f64, f64),
    extent: f64,
    brightness: F,
) -> f64
where
    F: Fn(f64) -> f64,
{
    let (lon_0, lat_0) = centre;
    if psf_sigma <= 0.0 {
        let step = size / OVERSAMPLE as f64;
        let start = -0.5 * size + 0.5 * step;
        let mut sum = 0.0;
        for i in 0..OVERSAMPLE {
            for j in 0..OVERSAMPLE {
                let x = lon + start + i as f64 * step - lon_0;
                let y = lat + start + j as f64 * step - lat_0;
                sum += brightness(x.hypot(y));
            }
        }
        return sum * step * step;
    }

    let step = 2.0 * extent / SMEAR_CELLS as f64;
    let start = -extent + 0.5 * step;
    let (mut sum, mut weights) = (0.0, 0.0);
    for i in 0..SMEAR_CELLS {
        for j in 0..SMEAR_CELLS {
            let (x, y) = (start + i as f64 * step, start + j as f64 * step);
            let weight = brightness(x.hypot(y));
            if weight > 0.0 {
                weights += weight;
                sum += weight * gauss_pixel(lon, lat, size, lon_0 + x, lat_0 + y, psf_sigma);
            }
        }
    }
    if weights > 0.0 {
        sum / weights
    } else {
        0.0
    }
}

/// Uniform disk of radius `r_0`
#[derive(Debug, Clone)]
pub struct DiskSpatial {
    pub lon_0: Parameter,
    pub lat_0: Parameter,
    pub r_0: Parameter,
}

impl DiskSpatial {
    pub fn new(lon_0: f64, lat_0: f64, r_0: f64) -> Result<Self> {
        Ok(DiskSpatial {
            lon_0: Parameter::new("lon_0", lon_0).with_unit("deg"),
            lat_0: Parameter::new("lat_0", lat_0).with_unit("deg"),
            r_0: Parameter::new("r_0", r_0)
                .with_unit("deg")
                .with_bounds(0.0, f64::INFINITY)?,
        })
    }

    /// Surface brightness at distance `theta` from the centre, normalised to one
    pub fn evaluate(&self, theta: f64) -> f64 {
        let r_0 = self.r_0.value();
        if r_0 <= 0.0 || theta > r_0 {
            return 0.0;
        }
        1.0 / (PI * r_0 * r_0)
    }
}

impl SpatialModel for DiskSpatial {
    fn tag(&self) -> &'static str {
        "DiskSpatial"
    }

    fn parameters(&self) -> Parameters {
        Parameters::new(vec![
            self.lon_0.clone(),
            self.lat_0.clone(),
            self.r_0.clone(),
        ])
    }

    fn integrate_pixel(&self, lon: f64, lat: f64, size: f64, psf_sigma: f64) -> f64 {
        let centre = (self.lon_0.value(), self.lat_0.value());
        radial_pixel(lon, lat, size, psf_sigma, centre, self.r_0.value(), |theta| {
            self.evaluate(theta)
        })
    }

    fn deep_copy(&self) -> Box<dyn SpatialModel> {
        Box::new(DiskSpatial {
            lon_0: self.lon_0.deep_copy(),
            lat_0: self.lat_0.deep_copy(),
            r_0: self.r_0.deep_copy(),
        })
    }
}

/// Projection of an optically thin spherical shell
///
/// The shell extends from `radius` to `radius + width`; seen in projection it is limb
/// brightened, peaking at the inner radius.
#[derive(Debug, Clone)]
pub struct ShellSpatial {
    pub lon_0: Parameter,
    pub lat_0: Parameter,
    pub radius: Parameter,
    pub width: Parameter,
}

impl ShellSpatial {
    pub fn new(lon_0: f64, lat_0: f64, radius: f64, width: f64) -> Result<Self> {
        Ok(ShellSpatial {
            lon_0: Parameter::new("lon_0", lon_0).with_unit("deg"),
            lat_0: Parameter::new("lat_0", lat_0).with_unit("deg"),
            radius: Parameter::new("radius", radius)
                .with_unit("deg")
                .with_bounds(0.0, f64::INFINITY)?,
            width: Parameter::new("width", width)
                .with_unit("deg")
                .with_bounds(0.0, f64::INFINITY)?,
        })
    }

    fn outer_radius(&self) -> f64 {
        self.radius.value() + self.width.value()
    }

    /// Surface brightness at distance `theta` from the centre, normalised to one
    pub fn evaluate(&self, theta: f64) -> f64 {
        let r_in = self.radius.value();
        let r_out = self.outer_radius();
        if r_out <= r_in || theta >= r_out {
            return 0.0;
        }
        let norm = 3.0 / (2.0 * PI * (r_out.powi(3) - r_in.powi(3)));
        let outer = (r_out * r_out - theta * theta).sqrt();
        if theta < r_in {
            norm * (outer - (r_in * r_in - theta * theta).sqrt())
        } else {
            norm * outer
        }
    }
}

impl SpatialModel for ShellSpatial {
    fn tag(&self) -> &'static str {
        "ShellSpatial"
    }

    fn parameters(&self) -> Parameters {
        Parameters::new(vec![
            self.lon_0.clone(),
            self.lat_0.clone(),
            self.radius.clone(),
            self.width.clone(),
        ])
    }

    fn integrate_pixel(&self, lon: f64, lat: f64, size: f64, psf_sigma: f64) -> f64 {
        let centre = (self.lon_0.value(), self.lat_0.value());
        radial_pixel(lon, lat, size, psf_sigma, centre, self.outer_radius(), |theta| {
            self.evaluate(theta)
        })
    }

    fn deep_copy(&self) -> Box<dyn SpatialModel> {
        Box::new(ShellSpatial {
            lon_0: self.lon_0.deep_copy(),
            lat_0: self.lat_0.deep_copy(),
            radius: self.radius.deep_copy(),
            width: self.width.deep_copy(),
        })
    }
}

/// Build a spatial model from its manifest form
pub fn from_description(description: &ComponentDescription) -> Result<Box<dyn SpatialModel>> {
    let pars = &description.parameters;
    let model: Box<dyn SpatialModel> = match description.kind.as_str() {
        "PointSpatial" => Box::new(PointSpatial {
            lon_0: find(pars, "lon_0")?,
            lat_0: find(pars, "lat_0")?,
        }),
        "GaussianSpatial" => Box::new(GaussianSpatial {
            lon_0: find(pars, "lon_0")?,
            lat_0: find(pars, "lat_0")?,
            sigma: find(pars, "sigma")?,
        }),
        "DiskSpatial" => Box::new(DiskSpatial {
            lon_0: find(pars, "lon_0")?,
            lat_0: find(pars, "lat_0")?,
            r_0: find(pars, "r_0")?,
        }),
        "ShellSpatial" => Box::new(ShellSpatial {
            lon_0: find(pars, "lon_0")?,
            lat_0: find(pars, "lat_0")?,
            radius: find(pars, "radius")?,
            width: find(pars, "width")?,
        }),
        other => bail!(
            "Spatial model type '{}' not supported. Possible types are 'PointSpatial', \
             'GaussianSpatial', 'DiskSpatial' and 'ShellSpatial'",
            other
        ),
    };
    Ok(model)
}
