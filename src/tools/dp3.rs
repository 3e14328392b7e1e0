//! DP3 invocations, one parset per run.

use std::path::{Path, PathBuf};

use marlu::RADec;

use crate::{
    config::{FlagAvgConfig, SelfCalConfig},
    mount::{MountMapping, PathResolutionError},
    parset::{Parset, ParsetValue},
    stage::ToolCommand,
};

/// What a DP3 run does between reading `msin` and writing `msout`.
#[derive(Debug, Clone, PartialEq)]
pub enum Dp3Operation {
    /// AOFlagger then frequency averaging
    FlagAvg {
        /// lua strategy, container path
        strategy: String,
        /// channels to average
        freqstep: u32,
        /// `flag.keepstatistics`
        keep_statistics: bool,
        /// `msout.writefullresflag`
        write_full_res_flag: bool,
    },
    /// Gain calibration against the model column
    GainCal {
        /// `cal.solint`
        solint: u32,
        /// `cal.caltype`
        caltype: String,
        /// `cal.maxiter`
        maxiter: u32,
        /// `cal.tolerance`
        tolerance: f64,
        /// `cal.uvlambdamin`
        uvlambdamin: f64,
        /// `cal.smoothnessconstraint`, omitted when 0
        smoothness_constraint: f64,
        /// `cal.modelcolumn`
        model_column: String,
        /// h5parm written by the solver, host path
        solution: PathBuf,
    },
    /// Apply an h5parm
    ApplyCal {
        /// h5parm, host path
        solution: PathBuf,
        /// `apply.correction`
        correction: String,
    },
    /// Predict a source list and subtract it
    Subtract {
        /// WSClean source list, host path
        sourcedb: PathBuf,
    },
    /// Move the phase centre
    PhaseShift {
        /// new phase centre
        target: RADec,
    },
}

/// One DP3 run.
#[derive(Debug, Clone, PartialEq)]
pub struct Dp3Command {
    image: String,
    msin: PathBuf,
    /// `None` means update in place (`msout = .`)
    msout: Option<PathBuf>,
    datacolumn: Option<String>,
    operation: Dp3Operation,
}

impl Dp3Command {
    /// A DP3 run of `operation`.
    pub fn new(
        image: impl Into<String>,
        msin: impl Into<PathBuf>,
        msout: Option<PathBuf>,
        operation: Dp3Operation,
    ) -> Self {
        Self {
            image: image.into(),
            msin: msin.into(),
            msout,
            datacolumn: None,
            operation,
        }
    }

    /// Read `column` instead of DATA.
    #[must_use]
    pub fn datacolumn(mut self, column: impl Into<String>) -> Self {
        self.datacolumn = Some(column.into());
        self
    }

    /// Flag and average the bandpass-corrected data.
    pub fn flag_avg(
        image: impl Into<String>,
        msin: impl Into<PathBuf>,
        msout: impl Into<PathBuf>,
        config: &FlagAvgConfig,
    ) -> Self {
        Self::new(
            image,
            msin,
            Some(msout.into()),
            Dp3Operation::FlagAvg {
                strategy: config.strategy.clone(),
                freqstep: config.freqstep,
                keep_statistics: config.keep_statistics,
                write_full_res_flag: config.write_full_res_flag,
            },
        )
        .datacolumn("CORRECTED_DATA")
    }

    /// Solve for gains, writing `solution`.
    pub fn gaincal(
        image: impl Into<String>,
        msin: impl Into<PathBuf>,
        solution: impl Into<PathBuf>,
        config: &SelfCalConfig,
    ) -> Self {
        Self::new(
            image,
            msin,
            None,
            Dp3Operation::GainCal {
                solint: config.solint,
                caltype: config.caltype.clone(),
                maxiter: config.maxiter,
                tolerance: config.tolerance,
                uvlambdamin: config.uvlambdamin,
                smoothness_constraint: config.smoothness_constraint,
                model_column: config.model_column.clone(),
                solution: solution.into(),
            },
        )
    }

    /// Apply `solution`, writing a new measurement set.
    pub fn applycal(
        image: impl Into<String>,
        msin: impl Into<PathBuf>,
        msout: impl Into<PathBuf>,
        solution: impl Into<PathBuf>,
        correction: impl Into<String>,
    ) -> Self {
        Self::new(
            image,
            msin,
            Some(msout.into()),
            Dp3Operation::ApplyCal {
                solution: solution.into(),
                correction: correction.into(),
            },
        )
    }

    /// Subtract the sources in `sourcedb`.
    pub fn subtract(
        image: impl Into<String>,
        msin: impl Into<PathBuf>,
        msout: impl Into<PathBuf>,
        sourcedb: impl Into<PathBuf>,
    ) -> Self {
        Self::new(
            image,
            msin,
            Some(msout.into()),
            Dp3Operation::Subtract {
                sourcedb: sourcedb.into(),
            },
        )
    }

    /// Phase shift to `target`.
    pub fn phaseshift(
        image: impl Into<String>,
        msin: impl Into<PathBuf>,
        msout: impl Into<PathBuf>,
        target: RADec,
    ) -> Self {
        Self::new(
            image,
            msin,
            Some(msout.into()),
            Dp3Operation::PhaseShift { target },
        )
    }

    /// The operation
    pub fn operation(&self) -> &Dp3Operation {
        &self.operation
    }

    /// The parset for this run, with container paths from `mapping`.
    ///
    /// # Errors
    ///
    /// [`PathResolutionError::OutsideRoot`] if a path isn't in the mapping.
    pub fn parset(&self, mapping: &MountMapping) -> Result<Parset, PathResolutionError> {
        let mut parset = Parset::default().msin(mapping.translate(&self.msin)?);
        if let Some(column) = &self.datacolumn {
            parset = parset.io("msin.datacolumn", column.as_str());
        }
        parset = match &self.msout {
            Some(msout) => parset.msout(mapping.translate(msout)?),
            None => parset.msout("."),
        };

        Ok(match &self.operation {
            Dp3Operation::FlagAvg {
                strategy,
                freqstep,
                keep_statistics,
                write_full_res_flag,
            } => parset
                .io("msout.writefullresflag", *write_full_res_flag)
                .step("flag", "aoflagger")
                .param("flag", "strategy", strategy.as_str())
                .param("flag", "keepstatistics", *keep_statistics)
                .step("avg", "averager")
                .param("avg", "freqstep", *freqstep),
            Dp3Operation::GainCal {
                solint,
                caltype,
                maxiter,
                tolerance,
                uvlambdamin,
                smoothness_constraint,
                model_column,
                solution,
            } => {
                let mut parset = parset
                    .step("cal", "gaincal")
                    .param("cal", "solint", *solint)
                    .param("cal", "caltype", caltype.as_str())
                    .param("cal", "maxiter", *maxiter)
                    .param("cal", "tolerance", *tolerance)
                    .param("cal", "uvlambdamin", *uvlambdamin);
                if *smoothness_constraint > 0.0 {
                    parset = parset.param("cal", "smoothnessconstraint", *smoothness_constraint);
                }
                parset
                    .param("cal", "usemodelcolumn", true)
                    .param("cal", "modelcolumn", model_column.as_str())
                    .param("cal", "parmdb", mapping.translate(solution)?)
            }
            Dp3Operation::ApplyCal {
                solution,
                correction,
            } => parset
                .step("apply", "applycal")
                .param("apply", "parmdb", mapping.translate(solution)?)
                .param("apply", "correction", correction.as_str()),
            Dp3Operation::Subtract { sourcedb } => parset
                .step("predict", "predict")
                .param("predict", "sourcedb", mapping.translate(sourcedb)?)
                .param("predict", "operation", "subtract"),
            Dp3Operation::PhaseShift { target } => parset.step("shift", "phaseshift").param(
                "shift",
                "phasecenter",
                ParsetValue::List(vec![
                    format!("{:.6}deg", target.ra.to_degrees()).into(),
                    format!("{:.6}deg", target.dec.to_degrees()).into(),
                ]),
            ),
        })
    }
}

impl ToolCommand for Dp3Command {
    fn image(&self) -> &str {
        &self.image
    }

    fn host_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.msin.clone()];
        paths.extend(self.msout.clone());
        match &self.operation {
            Dp3Operation::GainCal { solution, .. } | Dp3Operation::ApplyCal { solution, .. } => {
                paths.push(solution.clone());
            }
            Dp3Operation::Subtract { sourcedb } => paths.push(sourcedb.clone()),
            Dp3Operation::FlagAvg { .. } | Dp3Operation::PhaseShift { .. } => {}
        }
        paths
    }

    fn config_suffix(&self) -> Option<&'static str> {
        Some(".parset")
    }

    fn render_config(&self, mapping: &MountMapping) -> Result<String, PathResolutionError> {
        Ok(self.parset(mapping)?.render())
    }

    fn argv(
        &self,
        _mapping: &MountMapping,
        config: Option<&Path>,
    ) -> Result<Vec<String>, PathResolutionError> {
        let mut argv = vec!["DP3".to_string()];
        argv.extend(config.map(|path| path.display().to_string()));
        Ok(argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sky::radec_from_degrees;

    const IMAGE: &str = "astronrd/linc:latest";

    fn mapping() -> MountMapping {
        MountMapping::resolve(["/scratch/obs/x.ms"]).unwrap()
    }

    #[test]
    fn flag_avg_parset() {
        let command = Dp3Command::flag_avg(
            IMAGE,
            "/scratch/obs/obs_bandpass.ms",
            "/scratch/obs/obs_flagged_avg.ms",
            &FlagAvgConfig::default(),
        );
        assert_eq!(
            command.render_config(&mapping()).unwrap(),
            "\
msin = /data/obs_bandpass.ms
msin.datacolumn = CORRECTED_DATA
msout = /data/obs_flagged_avg.ms
msout.writefullresflag = false
steps = [flag, avg]
flag.type = aoflagger
flag.strategy = /usr/local/share/linc/rfistrategies/lofar-default.lua
flag.keepstatistics = false
avg.type = averager
avg.freqstep = 3
"
        );
    }

    #[test]
    fn gaincal_parset_updates_in_place() {
        let command = Dp3Command::gaincal(
            IMAGE,
            "/scratch/obs/obs_flagged_avg.ms",
            "/scratch/obs/proc_solution.h5",
            &SelfCalConfig::default(),
        );
        assert_eq!(
            command.render_config(&mapping()).unwrap(),
            "\
msin = /data/obs_flagged_avg.ms
msout = .
steps = [cal]
cal.type = gaincal
cal.solint = 0
cal.caltype = diagonal
cal.maxiter = 100
cal.tolerance = 0.0001
cal.uvlambdamin = 10.0
cal.usemodelcolumn = true
cal.modelcolumn = MODEL_DATA
cal.parmdb = /data/proc_solution.h5
"
        );
    }

    #[test]
    fn gaincal_smoothness_constraint_when_set() {
        let config = SelfCalConfig {
            smoothness_constraint: 2e6,
            ..SelfCalConfig::default()
        };
        let text = Dp3Command::gaincal(IMAGE, "/scratch/obs/a.ms", "/scratch/obs/s.h5", &config)
            .render_config(&mapping())
            .unwrap();
        assert!(text.contains("cal.smoothnessconstraint = 2000000.0\n"));
    }

    #[test]
    fn applycal_subtract_and_phaseshift_parsets() {
        let m = mapping();
        let apply = Dp3Command::applycal(
            IMAGE,
            "/scratch/obs/a.ms",
            "/scratch/obs/a_cal_iter_1.ms",
            "/scratch/obs/proc_solution.h5",
            "phase000",
        );
        assert_eq!(
            apply.render_config(&m).unwrap(),
            "msin = /data/a.ms\nmsout = /data/a_cal_iter_1.ms\nsteps = [apply]\napply.type = applycal\napply.parmdb = /data/proc_solution.h5\napply.correction = phase000\n"
        );

        let subtract = Dp3Command::subtract(
            IMAGE,
            "/scratch/obs/a.ms",
            "/scratch/obs/a_subtracted.ms",
            "/scratch/obs/proc_masked-sources.txt",
        );
        let text = subtract.render_config(&m).unwrap();
        assert!(text.contains("predict.sourcedb = /data/proc_masked-sources.txt\n"));
        assert!(text.ends_with("predict.operation = subtract\n"));

        let shift = Dp3Command::phaseshift(
            IMAGE,
            "/scratch/obs/a_subtracted.ms",
            "/scratch/obs/a_shifted.ms",
            radec_from_degrees(57.123_456_7, 19.8),
        );
        assert!(shift
            .render_config(&m)
            .unwrap()
            .ends_with("shift.phasecenter = [57.123457deg, 19.800000deg]\n"));
    }

    #[test]
    fn argv_and_paths() {
        let command = Dp3Command::subtract(
            IMAGE,
            "/scratch/obs/a.ms",
            "/scratch/obs/b.ms",
            "/scratch/obs/s.txt",
        );
        assert_eq!(
            command
                .argv(&mapping(), Some(Path::new("/data/.subtract-1.parset")))
                .unwrap(),
            vec!["DP3", "/data/.subtract-1.parset"]
        );
        assert_eq!(
            command.host_paths(),
            vec![
                PathBuf::from("/scratch/obs/a.ms"),
                PathBuf::from("/scratch/obs/b.ms"),
                PathBuf::from("/scratch/obs/s.txt"),
            ]
        );
    }

    #[test]
    fn paths_outside_mapping_are_rejected() {
        let command = Dp3Command::gaincal(
            IMAGE,
            "/elsewhere/a.ms",
            "/scratch/obs/s.h5",
            &SelfCalConfig::default(),
        );
        assert!(command.render_config(&mapping()).is_err());
    }
}
