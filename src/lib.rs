//! Joint likelihood fitting of gamma-ray datasets
//!
//! Datasets hold binned measurements ([datasets::SpectrumDataset], [datasets::MapDataset], ...)
//! and shared [models::SkyModel]s. A model attached to several datasets is fitted once against
//! all of them with [routines::fit::Fit], and [routines::estimators::FluxPointsEstimator] derives
//! a spectral energy distribution from the fitted model.

pub mod datasets;
pub mod models;
pub mod routines;
pub mod structs;

pub mod prelude {
    pub use crate::datasets::{
        Dataset, DatasetDescription, Datasets, FluxPointsDataset, MapDataset, MapGeom,
        ResidualMethod, SpectrumDataset, SpectrumDatasetOnOff, SpectrumInfo,
    };
    pub use crate::models::spatial::{
        DiskSpatial, GaussianSpatial, PointSpatial, ShellSpatial, SpatialModel,
    };
    pub use crate::models::spectral::{
        ExpCutoffPowerLaw, LogParabola, PowerLaw, ScaledSpectralModel, SpectralModel,
    };
    pub use crate::models::{Models, SkyModel};
    pub use crate::routines::estimators::{FluxPoint, FluxPoints, FluxPointsEstimator};
    pub use crate::routines::fit::{Fit, FitError, FitResult};
    pub use crate::routines::logger::setup_log;
    pub use crate::routines::math::{log_center, log_edges};
    pub use crate::routines::settings::{self, Settings};
    pub use crate::structs::parameter::{Parameter, Parameters};
}
