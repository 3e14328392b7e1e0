//! WSClean imaging.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use derive_builder::Builder;

use super::container_str;
use crate::{
    config::ImagingConfig,
    mount::{MountMapping, PathResolutionError},
    stage::ToolCommand,
};

/// Typed WSClean arguments, everything but `-name` and the measurement set.
#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct WscleanArgs {
    /// image width and height in pixels
    #[builder(default = "4096")]
    pub size: u32,
    /// pixel scale
    #[builder(setter(into), default = "\"2arcmin\".to_string()")]
    pub scale: String,
    /// weighting scheme
    #[builder(setter(into), default = "\"uniform\".to_string()")]
    pub weight: String,
    /// clean iterations
    #[builder(default = "1000")]
    pub niter: u32,
    /// major cycle gain
    #[builder(default = "0.9")]
    pub mgain: f64,
    /// `-auto-threshold`
    #[builder(setter(strip_option), default)]
    pub auto_threshold: Option<f64>,
    /// `-auto-mask`
    #[builder(setter(strip_option), default)]
    pub auto_mask: Option<f64>,
    /// polarisation
    #[builder(setter(into), default = "\"I\".to_string()")]
    pub pol: String,
    /// `-minuv-l`
    #[builder(setter(strip_option), default)]
    pub minuv_l: Option<f64>,
    /// `-mem`
    #[builder(setter(strip_option), default)]
    pub mem: Option<f64>,
    /// `-j`
    #[builder(setter(strip_option), default)]
    pub threads: Option<u32>,
    /// `-horizon-mask`
    #[builder(setter(into, strip_option), default)]
    pub horizon_mask: Option<String>,
    /// skip the dirty image
    #[builder(default = "true")]
    pub no_dirty: bool,
    /// don't write MODEL_DATA back. Never set when imaging for self-cal.
    #[builder(default = "false")]
    pub no_update_model_required: bool,
    /// `-no-negative`
    #[builder(default = "false")]
    pub no_negative: bool,
    /// write `<prefix>-sources.txt`
    #[builder(default = "false")]
    pub save_source_list: bool,
}

impl WscleanArgsBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.size == Some(0) {
            return Err("image size must be positive".to_string());
        }
        if let Some(mgain) = self.mgain {
            if !(mgain > 0.0 && mgain <= 1.0) {
                return Err(format!("mgain {mgain} is not in (0, 1]"));
            }
            let fills_model = !self.no_update_model_required.unwrap_or(false);
            if fills_model && mgain >= 1.0 {
                return Err("filling MODEL_DATA needs mgain below 1".to_string());
            }
        }
        Ok(())
    }
}

impl WscleanArgs {
    /// A builder pre-filled from the run's imaging settings.
    pub fn configured(config: &ImagingConfig) -> WscleanArgsBuilder {
        let mut builder = WscleanArgsBuilder::default();
        builder
            .size(config.size)
            .scale(config.scale.as_str())
            .weight(config.weight.as_str())
            .niter(config.niter)
            .mgain(config.mgain)
            .auto_threshold(config.auto_threshold)
            .auto_mask(config.auto_mask)
            .pol(config.pol.as_str())
            .minuv_l(config.minuv_l)
            .mem(config.mem)
            .no_negative(config.no_negative);
        if config.threads > 0 {
            builder.threads(config.threads);
        }
        if !config.horizon_mask.is_empty() {
            builder.horizon_mask(config.horizon_mask.as_str());
        }
        builder
    }

    /// Render as command line arguments.
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-size".into(),
            self.size.to_string(),
            self.size.to_string(),
            "-scale".into(),
            self.scale.clone(),
            "-weight".into(),
            self.weight.clone(),
            "-niter".into(),
            self.niter.to_string(),
            "-mgain".into(),
            self.mgain.to_string(),
        ];
        let mut opt = |flag: &str, value: Option<String>| {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value);
            }
        };
        opt("-auto-threshold", self.auto_threshold.map(|v| v.to_string()));
        opt("-auto-mask", self.auto_mask.map(|v| v.to_string()));
        opt("-pol", Some(self.pol.clone()));
        opt("-minuv-l", self.minuv_l.map(|v| v.to_string()));
        opt("-mem", self.mem.map(|v| v.to_string()));
        opt("-j", self.threads.map(|v| v.to_string()));
        opt("-horizon-mask", self.horizon_mask.clone());

        for (enabled, flag) in [
            (self.no_dirty, "-no-dirty"),
            (self.no_update_model_required, "-no-update-model-required"),
            (self.no_negative, "-no-negative"),
            (self.save_source_list, "-save-source-list"),
        ] {
            if enabled {
                args.push(flag.to_string());
            }
        }
        args
    }
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = prefix.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// `<prefix>-image.fits`
pub fn image_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, "-image.fits")
}

/// `<prefix>-sources.txt`
pub fn sources_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, "-sources.txt")
}

/// One WSClean run on one measurement set.
#[derive(Debug, Clone, PartialEq)]
pub struct WscleanCommand {
    image: String,
    ms: PathBuf,
    prefix: PathBuf,
    args: WscleanArgs,
}

impl WscleanCommand {
    /// Image `ms`, writing files named `<prefix>-*`. `prefix` is a host path.
    pub fn new(
        image: impl Into<String>,
        ms: impl Into<PathBuf>,
        prefix: impl Into<PathBuf>,
        args: WscleanArgs,
    ) -> Self {
        Self {
            image: image.into(),
            ms: ms.into(),
            prefix: prefix.into(),
            args,
        }
    }
}

impl ToolCommand for WscleanCommand {
    fn image(&self) -> &str {
        &self.image
    }

    fn host_paths(&self) -> Vec<PathBuf> {
        vec![self.ms.clone(), self.prefix.clone()]
    }

    fn argv(
        &self,
        mapping: &MountMapping,
        _config: Option<&Path>,
    ) -> Result<Vec<String>, PathResolutionError> {
        let mut argv = vec![
            "wsclean".to_string(),
            "-name".to_string(),
            container_str(mapping, &self.prefix)?,
        ];
        argv.extend(self.args.to_args());
        argv.push(container_str(mapping, &self.ms)?);
        Ok(argv)
    }

    /// WSClean writes temporary files to its working directory, keep them next
    /// to the outputs.
    fn workdir(&self, mapping: &MountMapping) -> Result<PathBuf, PathResolutionError> {
        match self.prefix.parent() {
            Some(parent) => mapping.translate(parent),
            None => Ok(mapping.container_mount_point().to_path_buf()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_model_args_from_defaults() {
        let args = WscleanArgs::configured(&ImagingConfig::default())
            .build()
            .unwrap();
        assert_eq!(
            args.to_args(),
            vec![
                "-size", "4096", "4096", "-scale", "2arcmin", "-weight", "uniform", "-niter",
                "1000", "-mgain", "0.9", "-auto-threshold", "3", "-auto-mask", "8", "-pol", "I",
                "-minuv-l", "10", "-mem", "2", "-j", "8", "-horizon-mask", "2deg", "-no-dirty",
                "-no-negative",
            ]
        );
        assert!(!args.no_update_model_required);
    }

    #[test]
    fn catalog_args() {
        let args = WscleanArgs::configured(&ImagingConfig::default())
            .niter(5000)
            .save_source_list(true)
            .no_update_model_required(true)
            .build()
            .unwrap();
        let rendered = args.to_args();
        assert!(rendered.contains(&"-save-source-list".to_string()));
        assert!(rendered.contains(&"-no-update-model-required".to_string()));
        assert!(rendered.windows(2).any(|w| w == ["-niter", "5000"]));
    }

    #[test]
    fn fill_model_rejects_unit_mgain() {
        assert!(WscleanArgsBuilder::default().mgain(1.0).build().is_err());
        assert!(WscleanArgsBuilder::default()
            .mgain(1.0)
            .no_update_model_required(true)
            .build()
            .is_ok());
        assert!(WscleanArgsBuilder::default().mgain(0.0).build().is_err());
        assert!(WscleanArgsBuilder::default().size(0).build().is_err());
    }

    #[test]
    fn output_paths() {
        let prefix = Path::new("/scratch/obs/proc_image_iter_1");
        assert_eq!(
            image_path(prefix),
            PathBuf::from("/scratch/obs/proc_image_iter_1-image.fits")
        );
        assert_eq!(
            sources_path(prefix),
            PathBuf::from("/scratch/obs/proc_image_iter_1-sources.txt")
        );
    }

    #[test]
    fn argv_uses_container_paths() {
        let args = WscleanArgsBuilder::default()
            .no_dirty(false)
            .build()
            .unwrap();
        let command = WscleanCommand::new(
            "astronrd/linc:latest",
            "/scratch/obs/a.ms",
            "/scratch/obs/img/proc",
            args,
        );
        let mapping = MountMapping::resolve(command.host_paths()).unwrap();
        assert_eq!(mapping.host_root(), Path::new("/scratch/obs"));
        let argv = command.argv(&mapping, None).unwrap();
        assert_eq!(&argv[..3], ["wsclean", "-name", "/data/img/proc"]);
        assert_eq!(argv.last().unwrap(), "/data/a.ms");
        assert_eq!(command.workdir(&mapping).unwrap(), PathBuf::from("/data/img"));
    }
}
