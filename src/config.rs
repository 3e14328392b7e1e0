//! Run configuration.
//!
//! Every knob of the pipeline lives in [`RunConfig`]. It can be loaded from a
//! toml, yaml or json file (chosen by extension), command line flags are
//! applied on top, and [`RunConfig::validate`] reports every problem at once
//! before any stage runs.

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::debug;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

use crate::sky::{epoch_from_datetime, radec_from_degrees, FixedTarget, SolarTarget, TargetLocator};

/// File types a [`RunConfig`] can be read from
#[derive(Debug, Display, EnumIter, EnumString, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFileType {
    #[strum(serialize = "toml")]
    /// toml
    Toml,
    #[strum(to_string = "yaml", serialize = "yml")]
    /// yaml
    Yaml,
    #[strum(serialize = "json")]
    /// json
    Json,
}

lazy_static! {
    // not imported, the derived iterator has its own `get`
    static ref CONFIG_FILE_TYPES_COMMA_SEPARATED: String =
        itertools::Itertools::join(&mut ConfigFileType::iter(), ", ");
}

/// Places the run can be told to stop after.
pub const STOP_POINTS: [&str; 9] = [
    "bandpass",
    "flag_avg",
    "initial_image",
    "selfcal",
    "catalog_image",
    "mask_sources",
    "subtract",
    "phaseshift",
    "final_image",
];

#[derive(Error, Debug)]
/// Configuration problems
pub enum ConfigError {
    /// The file couldn't be read.
    #[error("could not read config {path:?}: {source}")]
    Read {
        /// config file
        path: PathBuf,
        /// cause
        source: std::io::Error,
    },

    /// The extension isn't one we know how to parse.
    #[error("config file {0:?} has an unsupported extension, supported types: {}", *CONFIG_FILE_TYPES_COMMA_SEPARATED)]
    UnsupportedType(PathBuf),

    /// The file didn't match the schema.
    #[error("Couldn't decode {file_type} structure from {path:?}:\n{message}")]
    Decode {
        /// which parser was used
        file_type: ConfigFileType,
        /// config file
        path: PathBuf,
        /// parser message
        message: String,
    },

    /// One or more values are out of range.
    #[error("invalid configuration:\n  {}", .0.join("\n  "))]
    Invalid(Vec<String>),
}

/// Container runtime and images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerConfig {
    /// podman / docker compatible executable
    pub runtime: String,
    /// image with DP3 and WSClean
    pub linc_image: String,
    /// image with casatasks, used for the bandpass stage
    pub casa_image: String,
    /// pull the images before the first stage
    pub pull: bool,
    /// allow bind-mounting `/` when paths share no other ancestor
    pub allow_root_mount: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "podman".to_string(),
            linc_image: "astronrd/linc:latest".to_string(),
            casa_image: "peijin/lwa-solar-pipehost:v202510".to_string(),
            pull: true,
            allow_root_mount: false,
        }
    }
}

/// CASA bandpass application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BandpassConfig {
    /// `applycal` applymode
    pub applymode: String,
    /// flag baselines outside this uv range before applying, e.g. `<10lambda`
    pub flag_uvrange: Option<String>,
}

impl Default for BandpassConfig {
    fn default() -> Self {
        Self {
            applymode: "calflag".to_string(),
            flag_uvrange: None,
        }
    }
}

/// DP3 flagging and averaging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlagAvgConfig {
    /// AOFlagger lua strategy, as a path inside the container
    pub strategy: String,
    /// channels averaged together
    pub freqstep: u32,
    /// `flag.keepstatistics`
    pub keep_statistics: bool,
    /// `msout.writefullresflag`
    pub write_full_res_flag: bool,
}

impl Default for FlagAvgConfig {
    fn default() -> Self {
        Self {
            strategy: "/usr/local/share/linc/rfistrategies/lofar-default.lua".to_string(),
            freqstep: 3,
            keep_statistics: false,
            write_full_res_flag: false,
        }
    }
}

/// WSClean settings shared by every imaging stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImagingConfig {
    /// image width and height in pixels
    pub size: u32,
    /// pixel scale, e.g. `2arcmin`
    pub scale: String,
    /// weighting scheme
    pub weight: String,
    /// clean iterations for self-cal images
    pub niter: u32,
    /// major cycle gain, must be below 1 so MODEL_DATA gets filled
    pub mgain: f64,
    /// `-auto-threshold` in sigma
    pub auto_threshold: f64,
    /// `-auto-mask` in sigma
    pub auto_mask: f64,
    /// `-minuv-l` in wavelengths
    pub minuv_l: f64,
    /// polarisation to image
    pub pol: String,
    /// `-mem`, percentage of memory
    pub mem: f64,
    /// `-j`, 0 lets WSClean decide
    pub threads: u32,
    /// `-horizon-mask`, empty disables
    pub horizon_mask: String,
    /// `-no-negative`
    pub no_negative: bool,
    /// clean iterations for the source catalog image
    pub catalog_niter: u32,
    /// clean iterations for the final image
    pub final_niter: u32,
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            size: 4096,
            scale: "2arcmin".to_string(),
            weight: "uniform".to_string(),
            niter: 1000,
            mgain: 0.9,
            auto_threshold: 3.0,
            auto_mask: 8.0,
            minuv_l: 10.0,
            pol: "I".to_string(),
            mem: 2.0,
            threads: 8,
            horizon_mask: "2deg".to_string(),
            no_negative: true,
            catalog_niter: 5000,
            final_niter: 1000,
        }
    }
}

/// Self-calibration loop and DP3 gaincal solver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelfCalConfig {
    /// number of image / solve / apply rounds
    pub rounds: u32,
    /// `cal.solint`, 0 means the whole observation
    pub solint: u32,
    /// `cal.caltype`
    pub caltype: String,
    /// `cal.maxiter`
    pub maxiter: u32,
    /// `cal.tolerance`
    pub tolerance: f64,
    /// `cal.uvlambdamin`
    pub uvlambdamin: f64,
    /// `cal.smoothnessconstraint` in Hz, 0 disables
    pub smoothness_constraint: f64,
    /// `cal.modelcolumn`
    pub model_column: String,
    /// `apply.correction`
    pub correction: String,
    /// keep a copy of every round's solutions
    pub archive_solutions: bool,
}

impl Default for SelfCalConfig {
    fn default() -> Self {
        Self {
            rounds: 3,
            solint: 0,
            caltype: "diagonal".to_string(),
            maxiter: 100,
            tolerance: 1e-4,
            uvlambdamin: 10.0,
            smoothness_constraint: 0.0,
            model_column: "MODEL_DATA".to_string(),
            correction: "phase000".to_string(),
            archive_solutions: false,
        }
    }
}

/// Source masking around the target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaskConfig {
    /// sources closer than this to the target are not subtracted
    pub radius_deg: f64,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self { radius_deg: 2.0 }
    }
}

/// Where the data is finally phased to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetConfig {
    /// The Sun. Without a time, the observation time is read from the
    /// measurement set's file name.
    Sun {
        /// observation time override
        #[serde(default)]
        time: Option<DateTime<Utc>>,
    },
    /// Fixed coordinates
    Fixed {
        /// right ascension \[degrees\]
        ra_deg: f64,
        /// declination \[degrees\]
        dec_deg: f64,
    },
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self::Sun { time: None }
    }
}

impl TargetConfig {
    /// The locator for this target.
    pub fn locator(&self) -> Box<dyn TargetLocator> {
        match *self {
            Self::Sun { time } => Box::new(SolarTarget {
                time: time.map(epoch_from_datetime),
            }),
            Self::Fixed { ra_deg, dec_deg } => {
                Box::new(FixedTarget(radec_from_degrees(ra_deg, dec_deg)))
            }
        }
    }
}

/// Optional extra products for debugging a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiagnosticsConfig {
    /// image the flagged data before self-cal
    pub initial_image: bool,
}

/// Which part of the chain runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// stop after this stage, one of [`STOP_POINTS`]
    pub stop_after: Option<String>,
}

/// Everything a run needs besides its input paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// runtime and images
    pub container: ContainerConfig,
    /// bandpass stage
    pub bandpass: BandpassConfig,
    /// flag + average stage
    pub flag_avg: FlagAvgConfig,
    /// all imaging stages
    pub imaging: ImagingConfig,
    /// self-cal loop
    pub selfcal: SelfCalConfig,
    /// source masking
    pub mask: MaskConfig,
    /// phase centre target
    pub target: TargetConfig,
    /// debug products
    pub diagnostics: DiagnosticsConfig,
    /// chain control
    pub pipeline: PipelineConfig,
}

impl RunConfig {
    /// Read a config file, parser chosen by extension.
    ///
    /// Values are not validated here, call [`RunConfig::validate`] once any
    /// overrides have been applied.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`], [`ConfigError::UnsupportedType`] or
    /// [`ConfigError::Decode`]
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Attempting to parse config file {}", path.display());
        let file_type = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .and_then(|e| ConfigFileType::from_str(&e).ok())
            .ok_or_else(|| ConfigError::UnsupportedType(path.to_path_buf()))?;

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str_as(&contents, file_type, path)
    }

    fn from_str_as(
        contents: &str,
        file_type: ConfigFileType,
        path: &Path,
    ) -> Result<Self, ConfigError> {
        let decode = |message: String| ConfigError::Decode {
            file_type,
            path: path.to_path_buf(),
            message,
        };
        match file_type {
            ConfigFileType::Toml => toml::from_str(contents).map_err(|e| decode(e.to_string())),
            ConfigFileType::Yaml => {
                serde_yaml::from_str(contents).map_err(|e| decode(e.to_string()))
            }
            ConfigFileType::Json => {
                serde_json::from_str(contents).map_err(|e| decode(e.to_string()))
            }
        }
    }

    /// Check every value, reporting all problems together.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] listing each problem
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = vec![];
        let mut check = |ok: bool, message: &str| {
            if !ok {
                problems.push(message.to_string());
            }
        };

        let container = &self.container;
        check(!container.runtime.trim().is_empty(), "container.runtime must not be empty");
        check(!container.linc_image.trim().is_empty(), "container.linc_image must not be empty");
        check(!container.casa_image.trim().is_empty(), "container.casa_image must not be empty");

        check(!self.bandpass.applymode.trim().is_empty(), "bandpass.applymode must not be empty");

        check(!self.flag_avg.strategy.trim().is_empty(), "flag_avg.strategy must not be empty");
        check(self.flag_avg.freqstep >= 1, "flag_avg.freqstep must be at least 1");

        let imaging = &self.imaging;
        check(imaging.size > 0, "imaging.size must be positive");
        check(!imaging.scale.trim().is_empty(), "imaging.scale must not be empty");
        check(imaging.niter > 0, "imaging.niter must be positive");
        check(
            imaging.mgain > 0.0 && imaging.mgain < 1.0,
            "imaging.mgain must be in (0, 1) so that MODEL_DATA is filled",
        );
        check(imaging.auto_threshold > 0.0, "imaging.auto_threshold must be positive");
        check(imaging.auto_mask > 0.0, "imaging.auto_mask must be positive");
        check(imaging.minuv_l >= 0.0, "imaging.minuv_l must not be negative");
        check(
            imaging.mem > 0.0 && imaging.mem <= 100.0,
            "imaging.mem must be a percentage in (0, 100]",
        );
        check(imaging.catalog_niter > 0, "imaging.catalog_niter must be positive");
        check(imaging.final_niter > 0, "imaging.final_niter must be positive");

        let selfcal = &self.selfcal;
        check(!selfcal.caltype.trim().is_empty(), "selfcal.caltype must not be empty");
        check(selfcal.maxiter > 0, "selfcal.maxiter must be positive");
        check(selfcal.tolerance > 0.0, "selfcal.tolerance must be positive");
        check(selfcal.uvlambdamin >= 0.0, "selfcal.uvlambdamin must not be negative");
        check(
            selfcal.smoothness_constraint >= 0.0,
            "selfcal.smoothness_constraint must not be negative",
        );
        check(!selfcal.model_column.trim().is_empty(), "selfcal.model_column must not be empty");
        check(!selfcal.correction.trim().is_empty(), "selfcal.correction must not be empty");

        check(
            self.mask.radius_deg > 0.0 && self.mask.radius_deg < 180.0,
            "mask.radius_deg must be in (0, 180)",
        );

        if let TargetConfig::Fixed { ra_deg, dec_deg } = self.target {
            check(ra_deg.is_finite(), "target.ra_deg must be finite");
            check(
                (-90.0..=90.0).contains(&dec_deg),
                "target.dec_deg must be in [-90, 90]",
            );
        }

        if let Some(stop_after) = &self.pipeline.stop_after {
            if !STOP_POINTS.contains(&stop_after.as_str()) {
                problems.push(format!(
                    "pipeline.stop_after {stop_after:?} is not one of: {}",
                    STOP_POINTS.join(", ")
                ));
            } else if stop_after == "initial_image" && !self.diagnostics.initial_image {
                problems.push(
                    "pipeline.stop_after = initial_image needs diagnostics.initial_image".to_string(),
                );
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        RunConfig::default().validate().unwrap();
    }

    #[test]
    fn configured_sun_time_overrides_the_file_name() {
        let target = TargetConfig::Sun {
            time: Some(Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap()),
        };
        let locator = target.locator();
        // no time in this name, so only the configured one can work
        let sun = locator.locate(Path::new("/data/obs.ms")).unwrap();
        approx::assert_abs_diff_eq!(sun.ra.to_degrees(), 281.29, epsilon = 0.05);
        approx::assert_abs_diff_eq!(sun.dec.to_degrees(), -23.03, epsilon = 0.05);
        assert!(locator.describe().starts_with("Sun at 2000-01-01"));
    }

    #[test]
    fn load_toml_overrides_some_fields() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("run.toml");
        fs::write(
            &path,
            r#"
[selfcal]
rounds = 5
archive_solutions = true

[imaging]
mgain = 0.8

[target]
kind = "fixed"
ra_deg = 83.63
dec_deg = 22.01
"#,
        )
        .unwrap();
        let config = RunConfig::from_file(&path).unwrap();
        assert_eq!(config.selfcal.rounds, 5);
        assert!(config.selfcal.archive_solutions);
        assert_eq!(config.selfcal.maxiter, 100);
        assert_eq!(config.imaging.mgain, 0.8);
        assert_eq!(
            config.target,
            TargetConfig::Fixed {
                ra_deg: 83.63,
                dec_deg: 22.01
            }
        );
        config.validate().unwrap();
    }

    #[test]
    fn load_yaml_and_json() {
        let tmp_dir = tempdir().unwrap();
        let yaml = tmp_dir.path().join("run.YML");
        fs::write(
            &yaml,
            "flag_avg:\n  freqstep: 4\ntarget:\n  kind: sun\n  time: 2024-05-19T17:30:02Z\n",
        )
        .unwrap();
        let config = RunConfig::from_file(&yaml).unwrap();
        assert_eq!(config.flag_avg.freqstep, 4);
        assert_eq!(
            config.target,
            TargetConfig::Sun {
                time: Some(Utc.with_ymd_and_hms(2024, 5, 19, 17, 30, 2).unwrap())
            }
        );

        let json = tmp_dir.path().join("run.json");
        fs::write(&json, r#"{"container": {"runtime": "docker", "pull": false}}"#).unwrap();
        let config = RunConfig::from_file(&json).unwrap();
        assert_eq!(config.container.runtime, "docker");
        assert!(!config.container.pull);
        assert_eq!(config.container.linc_image, "astronrd/linc:latest");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("run.toml");
        fs::write(&path, "[selfcal]\nroundz = 2\n").unwrap();
        assert!(matches!(
            RunConfig::from_file(&path),
            Err(ConfigError::Decode {
                file_type: ConfigFileType::Toml,
                ..
            })
        ));
    }

    #[test]
    fn unsupported_extension() {
        assert!(matches!(
            RunConfig::from_file(Path::new("/tmp/run.ini")),
            Err(ConfigError::UnsupportedType(_))
        ));
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut config = RunConfig::default();
        config.imaging.mgain = 1.0;
        config.flag_avg.freqstep = 0;
        config.mask.radius_deg = -1.0;
        config.pipeline.stop_after = Some("somewhere".to_string());
        match config.validate() {
            Err(ConfigError::Invalid(problems)) => {
                assert_eq!(problems.len(), 4, "{problems:?}");
                assert!(problems.iter().any(|p| p.starts_with("imaging.mgain")));
                assert!(problems.iter().any(|p| p.starts_with("pipeline.stop_after")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stop_after_initial_image_needs_diagnostics() {
        let mut config = RunConfig::default();
        config.pipeline.stop_after = Some("initial_image".to_string());
        assert!(config.validate().is_err());
        config.diagnostics.initial_image = true;
        config.validate().unwrap();
    }
}
