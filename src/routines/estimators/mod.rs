// Flux points from a norm fit in energy bins
pub mod flux_points;

pub use flux_points::{FluxPoint, FluxPoints, FluxPointsEstimator};
