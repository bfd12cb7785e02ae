// Estimators built on top of the fit
pub mod estimators;
// Joint likelihood fit
pub mod fit;
// Routines for logging
pub mod logger;
// Numerical helpers
pub mod math;
// Routines for output
pub mod output;
// Routines for settings
pub mod settings;
// Fit statistics
pub mod stats;
