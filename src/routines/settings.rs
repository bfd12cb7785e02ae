use crate::routines::output::OutputFile;
use anyhow::{bail, Result};
use config::Config as eConfig;
use serde::{Deserialize, Serialize};

/// Contains all settings for gammafit
#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    /// Configuration of the joint likelihood fit
    pub fit: FitSettings,
    /// Configuration of the flux point estimator
    pub flux_points: FluxPointsSettings,
    /// Configuration for logging
    pub log: Log,
    /// Configuration for the output files
    pub output: Output,
}

impl Settings {
    pub fn new() -> Self {
        Settings::default()
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        self.fit.validate()?;
        self.flux_points.validate()?;
        Ok(())
    }
}

/// Hyperparameters of the Nelder-Mead minimisation and of the covariance estimate
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct FitSettings {
    /// Maximum number of Nelder-Mead iterations
    pub max_iters: u64,
    /// Convergence is reached when the standard deviation of the statistic over the simplex
    /// falls below this value
    pub sd_tolerance: f64,
    /// Relative step of the finite-difference Hessian, in units of the scaled parameters
    pub hessian_step: f64,
}

impl Default for FitSettings {
    fn default() -> Self {
        FitSettings {
            max_iters: 5000,
            sd_tolerance: 1e-8,
            hessian_step: 1e-4,
        }
    }
}

impl FitSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_iters == 0 {
            bail!("The maximum number of iterations must be positive");
        }
        if !(self.sd_tolerance > 0.0) {
            bail!(
                "The simplex tolerance must be positive, got {}",
                self.sd_tolerance
            );
        }
        if !(self.hessian_step > 0.0 && self.hessian_step < 1.0) {
            bail!(
                "The Hessian step must be in (0, 1), got {}",
                self.hessian_step
            );
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct FluxPointsSettings {
    /// Number of sigma for the asymmetric norm errors
    pub n_sigma: f64,
    /// Number of sigma for the norm upper limit
    pub n_sigma_ul: f64,
    /// A bin is reported as an upper limit below this test statistic
    ///
    /// The default of 4 corresponds to a 2 sigma detection.
    pub ts_threshold: f64,
    /// A bin is reported as an upper limit when fewer counts are observed
    pub min_counts: f64,
    /// Range searched for the best-fit norm and its errors
    pub norm_min: f64,
    pub norm_max: f64,
    /// Evaluate the energy bins in parallel
    pub parallel: bool,
}

impl Default for FluxPointsSettings {
    fn default() -> Self {
        FluxPointsSettings {
            n_sigma: 1.0,
            n_sigma_ul: 2.0,
            ts_threshold: 4.0,
            min_counts: 1.0,
            norm_min: 0.0,
            norm_max: 50.0,
            parallel: true,
        }
    }
}

impl FluxPointsSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.n_sigma > 0.0) || !(self.n_sigma_ul > 0.0) {
            bail!("n_sigma and n_sigma_ul must be positive");
        }
        if self.norm_min < 0.0 || !(self.norm_max > self.norm_min) {
            bail!(
                "Invalid norm range [{}, {}]: the lower bound must be non-negative and below the upper bound",
                self.norm_min,
                self.norm_max
            );
        }
        if self.min_counts < 0.0 {
            bail!("min_counts must be non-negative, got {}", self.min_counts);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Log {
    /// The maximum log level to display
    ///
    /// The log level is defined as a string, and can be one of the following:
    /// - `trace`
    /// - `debug`
    /// - `info`
    /// - `warn`
    /// - `error`
    pub level: String,
    /// The file to write the log to
    pub file: String,
    /// Whether to write logs
    ///
    /// If set to `false`, a global subscriber will not be set by gammafit.
    pub write: bool,
}

impl Default for Log {
    fn default() -> Self {
        Log {
            level: String::from("info"),
            file: String::from("log.txt"),
            write: true,
        }
    }
}

/// Configuration for the output files
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Output {
    /// Whether to write the output files
    pub write: bool,
    /// The (relative) path to write the output files to
    pub path: String,
}

impl Default for Output {
    fn default() -> Self {
        Output {
            write: true,
            path: String::from("outputs/"),
        }
    }
}

impl Output {
    /// Parses the output folder location
    ///
    /// If a `#` symbol is found, it is replaced by the first number for which the folder does not exist yet.
    pub fn parse_output_folder(&mut self) -> Result<()> {
        if self.path.is_empty() {
            self.path = Output::default().path;
        }

        match self.path.matches('#').count() {
            0 => Ok(()),
            1 => {
                let mut num = 1;
                while std::path::Path::new(&self.path.replace('#', &num.to_string())).exists() {
                    num += 1;
                }
                self.path = self.path.replace('#', &num.to_string());
                Ok(())
            }
            _ => {
                bail!("Only one `#` symbol is allowed in the output path. Rename the `output.path` setting in the configuration file and re-run the program.")
            }
        }
    }
}

/// Parses the settings from a TOML configuration file
///
/// The settings are validated, and a copy is written to `settings.json` in the output folder.
///
/// Entries in the TOML file may be overridden by environment variables prefixed with `GAMMAFIT_`,
/// with the TOML entry in uppercase and a single underscore, `_`, as the separator for nested
/// entries. For example, `GAMMAFIT_OUTPUT_WRITE=false` disables the output files.
pub fn read(path: impl Into<String>) -> Result<Settings> {
    let settings_path = path.into();

    let parsed = eConfig::builder()
        .add_source(config::File::with_name(&settings_path).format(config::FileFormat::Toml))
        .add_source(config::Environment::with_prefix("GAMMAFIT").separator("_"))
        .build()?;

    let mut settings: Settings = parsed.try_deserialize()?;
    settings.validate()?;
    settings.output.parse_output_folder()?;

    if settings.output.write {
        if let Err(error) = write_settings_to_file(&settings) {
            bail!("Could not write settings to file: {}", error);
        }
    }

    Ok(settings)
}

/// Writes a copy of the parsed settings to `settings.json` in the output folder
pub fn write_settings_to_file(settings: &Settings) -> Result<()> {
    let serialized = serde_json::to_string_pretty(settings)?;
    let outputfile = OutputFile::new(settings.output.path.as_str(), "settings.json")?;
    let mut file = outputfile.file_owned();
    std::io::Write::write_all(&mut file, serialized.as_bytes())?;
    Ok(())
}
