//! The fixed stage chain and the names of everything it writes.

use std::{
    fs,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use log::info;
use marlu::RADec;

use crate::{
    config::{ConfigError, RunConfig},
    error::PipelineError,
    selfcal::{self, SelfCalLoop, SelfCalStages, SelfCalStep},
    sky::{self, fmt_radec, radec_from_degrees},
    stage::{ArtifactKind, NativeStep, OutputDecl, StageAction, StageSpec},
    tools::{
        wsclean::{image_path, sources_path},
        CasaBandpassCommand, Dp3Command, WscleanArgs, WscleanCommand,
    },
};

/// Logical names of the artifacts outside the self-cal loop.
pub mod names {
    /// the raw measurement set given on the command line
    pub const RAW_MS: &str = "raw_ms";
    /// the bandpass table given on the command line
    pub const GAIN_TABLE: &str = "gain_table";
    /// raw data with the bandpass applied
    pub const BANDPASS_MS: &str = "bandpass_ms";
    /// flagged and averaged
    pub const FLAGGED_MS: &str = "flagged_ms";
    /// diagnostic image of the flagged data
    pub const INITIAL_IMAGE: &str = "initial_image";
    /// the stable gain solution file
    pub const SOLUTION: &str = "solution";
    /// deep image used for the source list
    pub const CATALOG_IMAGE: &str = "catalog_image";
    /// WSClean source list of the catalog image
    pub const CATALOG_SOURCES: &str = "catalog_sources";
    /// source list without the sources near the target
    pub const MASKED_SOURCES: &str = "masked_sources";
    /// masked sources subtracted
    pub const SUBTRACTED_MS: &str = "subtracted_ms";
    /// phase shifted to the target
    pub const SHIFTED_MS: &str = "shifted_ms";
    /// the final image
    pub const FINAL_IMAGE: &str = "final_image";
}

/// Host paths of every product of a run.
///
/// Measurement sets are named after the raw data's file stem, images and
/// other products after the output prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNaming {
    workdir: PathBuf,
    stem: String,
    prefix: String,
}

impl ArtifactNaming {
    /// Names for `raw_ms` processed into `workdir` with `prefix`.
    pub fn new(workdir: impl Into<PathBuf>, raw_ms: &Path, prefix: impl Into<String>) -> Self {
        let stem = raw_ms
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "quickproc".to_string());
        Self {
            workdir: workdir.into(),
            stem,
            prefix: prefix.into(),
        }
    }

    /// Working directory
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Output prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn ms(&self, suffix: &str) -> PathBuf {
        self.workdir.join(format!("{}_{suffix}.ms", self.stem))
    }

    fn prefixed(&self, suffix: &str) -> PathBuf {
        self.workdir.join(format!("{}_{suffix}", self.prefix))
    }

    /// `<stem>_bandpass.ms`
    pub fn bandpass_ms(&self) -> PathBuf {
        self.ms("bandpass")
    }

    /// `<stem>_flagged_avg.ms`
    pub fn flagged_ms(&self) -> PathBuf {
        self.ms("flagged_avg")
    }

    /// WSClean prefix of the diagnostic image
    pub fn initial_image_prefix(&self) -> PathBuf {
        self.prefixed("initial")
    }

    /// WSClean prefix of self-cal round `round`'s image
    pub fn selfcal_image_prefix(&self, round: u32) -> PathBuf {
        self.prefixed(&format!("image_iter_{round}"))
    }

    /// `<prefix>_solution.h5`, overwritten each round
    pub fn solution(&self) -> PathBuf {
        self.prefixed("solution.h5")
    }

    /// `<prefix>_solution_iter_<round>.h5`
    pub fn solution_archive(&self, round: u32) -> PathBuf {
        self.prefixed(&format!("solution_iter_{round}.h5"))
    }

    /// `<stem>_cal_iter_<round>.ms`
    pub fn selfcal_ms(&self, round: u32) -> PathBuf {
        self.ms(&format!("cal_iter_{round}"))
    }

    /// WSClean prefix of the catalog image
    pub fn catalog_prefix(&self) -> PathBuf {
        self.prefixed("catalog")
    }

    /// `<prefix>_masked-sources.txt`
    pub fn masked_sources(&self) -> PathBuf {
        self.prefixed("masked-sources.txt")
    }

    /// `<stem>_subtracted.ms`
    pub fn subtracted_ms(&self) -> PathBuf {
        self.ms("subtracted")
    }

    /// `<stem>_<prefix>_shifted.ms`
    pub fn shifted_ms(&self) -> PathBuf {
        self.ms(&format!("{}_shifted", self.prefix))
    }

    /// WSClean prefix of the final image
    pub fn final_prefix(&self) -> PathBuf {
        self.prefixed("final")
    }

    /// `<prefix>_run_report.json`
    pub fn report(&self) -> PathBuf {
        self.prefixed("run_report.json")
    }

    /// `<prefix>_pipeline.log`
    pub fn log(&self) -> PathBuf {
        self.prefixed("pipeline.log")
    }
}

/// One entry of a stage plan.
#[derive(Debug)]
pub enum PlannedStage {
    /// a single stage
    Single(StageSpec),
    /// the self-cal loop, expanded as it runs
    SelfCal(SelfCalLoop),
}

impl PlannedStage {
    /// Name used by `pipeline.stop_after`
    pub fn name(&self) -> &str {
        match self {
            Self::Single(stage) => stage.name(),
            Self::SelfCal(_) => "selfcal",
        }
    }

    /// Names of the stages this entry will run
    pub fn stage_names(&self) -> Vec<String> {
        match self {
            Self::Single(stage) => vec![stage.name().to_string()],
            Self::SelfCal(selfcal) => selfcal.steps().iter().map(SelfCalStep::stage_name).collect(),
        }
    }
}

/// Copies the stable solution file aside.
#[derive(Debug)]
struct ArchiveSolution {
    from: PathBuf,
    to: PathBuf,
}

impl NativeStep for ArchiveSolution {
    fn run(&self) -> Result<(), PipelineError> {
        fs::copy(&self.from, &self.to)?;
        Ok(())
    }
}

/// Writes the catalog without the sources near the target.
#[derive(Debug)]
struct MaskSources {
    input: PathBuf,
    output: PathBuf,
    target: RADec,
    radius_deg: f64,
}

impl NativeStep for MaskSources {
    fn run(&self) -> Result<(), PipelineError> {
        let summary = sky::mask_sources(&self.input, &self.output, self.target, self.radius_deg)?;
        info!(
            "kept {} sources, masked {} ({:.3} Jy) within {}° of {}",
            summary.kept,
            summary.removed,
            summary.removed_flux_jy,
            self.radius_deg,
            fmt_radec(self.target)
        );
        Ok(())
    }
}

fn wsclean_error(err: impl ToString) -> PipelineError {
    ConfigError::Invalid(vec![format!("imaging: {}", err.to_string())]).into()
}

/// Self-cal stages, built on demand by the loop.
#[derive(Debug, Clone)]
struct SelfCalFactory {
    config: RunConfig,
    naming: ArtifactNaming,
    image_args: WscleanArgs,
}

impl SelfCalStages for SelfCalFactory {
    fn stage(&self, step: SelfCalStep, current_ms: &str) -> Result<StageSpec, PipelineError> {
        let image = self.config.container.linc_image.clone();
        let name = step.stage_name();
        let ms_name = current_ms.to_string();
        let stage = match step {
            SelfCalStep::Image(r) => {
                let prefix = self.naming.selfcal_image_prefix(r);
                let args = self.image_args.clone();
                StageSpec::new(
                    name,
                    &[current_ms],
                    vec![OutputDecl::new(
                        selfcal::image_name(r),
                        image_path(&prefix),
                        ArtifactKind::Image,
                    )
                    .replacing()],
                    move |inputs| {
                        Ok(StageAction::Container(Box::new(WscleanCommand::new(
                            image.as_str(),
                            inputs.path(&ms_name)?,
                            prefix.as_path(),
                            args.clone(),
                        ))))
                    },
                )
            }
            SelfCalStep::Solve(_) => {
                let solution = self.naming.solution();
                let config = self.config.selfcal.clone();
                StageSpec::new(
                    name,
                    &[current_ms],
                    vec![OutputDecl::new(
                        names::SOLUTION,
                        &solution,
                        ArtifactKind::SolutionTable,
                    )
                    .replacing()],
                    move |inputs| {
                        Ok(StageAction::Container(Box::new(Dp3Command::gaincal(
                            image.as_str(),
                            inputs.path(&ms_name)?,
                            solution.as_path(),
                            &config,
                        ))))
                    },
                )
            }
            SelfCalStep::Archive(r) => {
                let archived = self.naming.solution_archive(r);
                StageSpec::new(
                    name,
                    &[names::SOLUTION],
                    vec![OutputDecl::new(
                        selfcal::solution_archive_name(r),
                        &archived,
                        ArtifactKind::SolutionTable,
                    )
                    .replacing()],
                    move |inputs| {
                        Ok(StageAction::Native(Box::new(ArchiveSolution {
                            from: inputs.path(names::SOLUTION)?.to_path_buf(),
                            to: archived.clone(),
                        })))
                    },
                )
            }
            SelfCalStep::Apply(r) => {
                let msout = self.naming.selfcal_ms(r);
                let correction = self.config.selfcal.correction.clone();
                StageSpec::new(
                    name,
                    &[current_ms, names::SOLUTION],
                    vec![OutputDecl::new(
                        selfcal::ms_name(r),
                        &msout,
                        ArtifactKind::MeasurementSet,
                    )
                    .replacing()],
                    move |inputs| {
                        Ok(StageAction::Container(Box::new(Dp3Command::applycal(
                            image.as_str(),
                            inputs.path(&ms_name)?,
                            msout.as_path(),
                            inputs.path(names::SOLUTION)?,
                            correction.as_str(),
                        ))))
                    },
                )
            }
        };
        Ok(stage)
    }
}

/// Builds the stage plan of a run.
#[derive(Debug, Clone)]
pub struct StageFactory {
    config: RunConfig,
    naming: ArtifactNaming,
    target: RADec,
    selfcal_args: WscleanArgs,
    initial_args: WscleanArgs,
    catalog_args: WscleanArgs,
    final_args: WscleanArgs,
}

impl StageFactory {
    /// A factory for one run. The WSClean arguments of every imaging stage are
    /// built here, so bad imaging settings fail before anything runs.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] if an argument set doesn't validate.
    pub fn new(config: &RunConfig, naming: ArtifactNaming, target: RADec) -> Result<Self, PipelineError> {
        let imaging = &config.imaging;
        let selfcal_args = WscleanArgs::configured(imaging)
            .build()
            .map_err(wsclean_error)?;
        let initial_args = WscleanArgs::configured(imaging)
            .no_update_model_required(true)
            .build()
            .map_err(wsclean_error)?;
        let catalog_args = WscleanArgs::configured(imaging)
            .niter(imaging.catalog_niter)
            .no_update_model_required(true)
            .save_source_list(true)
            .build()
            .map_err(wsclean_error)?;
        let final_args = WscleanArgs::configured(imaging)
            .niter(imaging.final_niter)
            .no_update_model_required(true)
            .build()
            .map_err(wsclean_error)?;
        Ok(Self {
            config: config.clone(),
            naming,
            target,
            selfcal_args,
            initial_args,
            catalog_args,
            final_args,
        })
    }

    /// Artifact names
    pub fn naming(&self) -> &ArtifactNaming {
        &self.naming
    }

    fn linc_image(&self) -> String {
        self.config.container.linc_image.clone()
    }

    fn imaging_stage(
        &self,
        name: &str,
        ms_name: &str,
        output: &str,
        prefix: PathBuf,
        args: &WscleanArgs,
    ) -> StageSpec {
        let image = self.linc_image();
        let ms = ms_name.to_string();
        let args = args.clone();
        StageSpec::new(
            name,
            &[ms_name],
            vec![OutputDecl::new(output, image_path(&prefix), ArtifactKind::Image).replacing()],
            move |inputs| {
                Ok(StageAction::Container(Box::new(WscleanCommand::new(
                    image.as_str(),
                    inputs.path(&ms)?,
                    prefix.as_path(),
                    args.clone(),
                ))))
            },
        )
    }

    /// CASA split + applycal of the raw data
    pub fn bandpass(&self) -> StageSpec {
        let image = self.config.container.casa_image.clone();
        let config = self.config.bandpass.clone();
        let output = self.naming.bandpass_ms();
        StageSpec::new(
            "bandpass",
            &[names::RAW_MS, names::GAIN_TABLE],
            vec![OutputDecl::new(names::BANDPASS_MS, &output, ArtifactKind::MeasurementSet).replacing()],
            move |inputs| {
                Ok(StageAction::Container(Box::new(
                    CasaBandpassCommand::new(
                        image.as_str(),
                        inputs.path(names::RAW_MS)?,
                        inputs.path(names::GAIN_TABLE)?,
                        output.as_path(),
                        config.applymode.as_str(),
                    )
                    .flag_uvrange(config.flag_uvrange.clone()),
                )))
            },
        )
    }

    /// DP3 AOFlagger + averaging
    pub fn flag_avg(&self) -> StageSpec {
        let image = self.linc_image();
        let config = self.config.flag_avg.clone();
        let output = self.naming.flagged_ms();
        StageSpec::new(
            "flag_avg",
            &[names::BANDPASS_MS],
            vec![OutputDecl::new(names::FLAGGED_MS, &output, ArtifactKind::MeasurementSet).replacing()],
            move |inputs| {
                Ok(StageAction::Container(Box::new(Dp3Command::flag_avg(
                    image.as_str(),
                    inputs.path(names::BANDPASS_MS)?,
                    output.as_path(),
                    &config,
                ))))
            },
        )
    }

    /// Diagnostic image of the flagged data, leaving MODEL_DATA alone
    pub fn initial_image(&self) -> StageSpec {
        self.imaging_stage(
            "initial_image",
            names::FLAGGED_MS,
            names::INITIAL_IMAGE,
            self.naming.initial_image_prefix(),
            &self.initial_args,
        )
    }

    /// The self-cal loop on the flagged data
    pub fn selfcal(&self) -> SelfCalLoop {
        SelfCalLoop::new(
            names::FLAGGED_MS,
            self.config.selfcal.rounds,
            self.config.selfcal.archive_solutions,
            Box::new(SelfCalFactory {
                config: self.config.clone(),
                naming: self.naming.clone(),
                image_args: self.selfcal_args.clone(),
            }),
        )
    }

    /// Deep image of `ms_name` that also writes a source list
    pub fn catalog_image(&self, ms_name: &str) -> StageSpec {
        let image = self.linc_image();
        let ms = ms_name.to_string();
        let prefix = self.naming.catalog_prefix();
        let args = self.catalog_args.clone();
        StageSpec::new(
            "catalog_image",
            &[ms_name],
            vec![
                OutputDecl::new(names::CATALOG_IMAGE, image_path(&prefix), ArtifactKind::Image)
                    .replacing(),
                OutputDecl::new(
                    names::CATALOG_SOURCES,
                    sources_path(&prefix),
                    ArtifactKind::SourceList,
                )
                .replacing(),
            ],
            move |inputs| {
                Ok(StageAction::Container(Box::new(WscleanCommand::new(
                    image.as_str(),
                    inputs.path(&ms)?,
                    prefix.as_path(),
                    args.clone(),
                ))))
            },
        )
    }

    /// Drop catalog sources near the target
    pub fn mask_sources(&self) -> StageSpec {
        let output = self.naming.masked_sources();
        let target = self.target;
        let radius_deg = self.config.mask.radius_deg;
        StageSpec::new(
            "mask_sources",
            &[names::CATALOG_SOURCES],
            vec![OutputDecl::new(names::MASKED_SOURCES, &output, ArtifactKind::SourceList).replacing()],
            move |inputs| {
                Ok(StageAction::Native(Box::new(MaskSources {
                    input: inputs.path(names::CATALOG_SOURCES)?.to_path_buf(),
                    output: output.clone(),
                    target,
                    radius_deg,
                })))
            },
        )
    }

    /// Predict and subtract the masked sources from `ms_name`
    pub fn subtract(&self, ms_name: &str) -> StageSpec {
        let image = self.linc_image();
        let ms = ms_name.to_string();
        let output = self.naming.subtracted_ms();
        StageSpec::new(
            "subtract",
            &[ms_name, names::MASKED_SOURCES],
            vec![OutputDecl::new(names::SUBTRACTED_MS, &output, ArtifactKind::MeasurementSet).replacing()],
            move |inputs| {
                Ok(StageAction::Container(Box::new(Dp3Command::subtract(
                    image.as_str(),
                    inputs.path(&ms)?,
                    output.as_path(),
                    inputs.path(names::MASKED_SOURCES)?,
                ))))
            },
        )
    }

    /// Phase shift the subtracted data to the target
    pub fn phaseshift(&self) -> StageSpec {
        let image = self.linc_image();
        let output = self.naming.shifted_ms();
        let target = self.target;
        StageSpec::new(
            "phaseshift",
            &[names::SUBTRACTED_MS],
            vec![OutputDecl::new(names::SHIFTED_MS, &output, ArtifactKind::MeasurementSet).replacing()],
            move |inputs| {
                Ok(StageAction::Container(Box::new(Dp3Command::phaseshift(
                    image.as_str(),
                    inputs.path(names::SUBTRACTED_MS)?,
                    output.as_path(),
                    target,
                ))))
            },
        )
    }

    /// Image the phase shifted data
    pub fn final_image(&self) -> StageSpec {
        self.imaging_stage(
            "final_image",
            names::SHIFTED_MS,
            names::FINAL_IMAGE,
            self.naming.final_prefix(),
            &self.final_args,
        )
    }

    /// The whole chain, cut after `pipeline.stop_after` if it's set.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] if `pipeline.stop_after` names no stage of
    /// the chain.
    pub fn plan(&self) -> Result<Vec<PlannedStage>, PipelineError> {
        let selfcal = self.selfcal();
        let selfcal_output = selfcal.output();

        let mut plan = vec![
            PlannedStage::Single(self.bandpass()),
            PlannedStage::Single(self.flag_avg()),
        ];
        if self.config.diagnostics.initial_image {
            plan.push(PlannedStage::Single(self.initial_image()));
        }
        plan.push(PlannedStage::SelfCal(selfcal));
        plan.extend(
            [
                self.catalog_image(&selfcal_output),
                self.mask_sources(),
                self.subtract(&selfcal_output),
                self.phaseshift(),
                self.final_image(),
            ]
            .into_iter()
            .map(PlannedStage::Single),
        );

        if let Some(stop_after) = &self.config.pipeline.stop_after {
            let idx = plan
                .iter()
                .position(|stage| stage.name() == stop_after)
                .ok_or_else(|| {
                    ConfigError::Invalid(vec![format!(
                        "pipeline.stop_after {stop_after:?} is not a stage of this run: {}",
                        plan.iter().map(PlannedStage::name).join(", ")
                    )])
                })?;
            plan.truncate(idx + 1);
        }
        Ok(plan)
    }
}

/// Names of every stage the configured chain runs, in order.
///
/// # Errors
///
/// [`PipelineError::Config`] if the imaging arguments don't validate.
pub fn planned_stage_names(
    config: &RunConfig,
    naming: ArtifactNaming,
) -> Result<Vec<String>, PipelineError> {
    // the target only changes stage parameters, never names
    let factory = StageFactory::new(config, naming, radec_from_degrees(0.0, 0.0))?;
    Ok(factory
        .plan()?
        .iter()
        .flat_map(PlannedStage::stage_names)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naming() -> ArtifactNaming {
        ArtifactNaming::new(
            "/scratch/obs",
            Path::new("/lwa/20240519_173002_55MHz.ms"),
            "sun",
        )
    }

    fn factory(config: &RunConfig) -> StageFactory {
        StageFactory::new(config, naming(), radec_from_degrees(57.0, 20.0)).unwrap()
    }

    fn all_names(plan: &[PlannedStage]) -> Vec<String> {
        plan.iter().flat_map(PlannedStage::stage_names).collect()
    }

    #[test]
    fn naming_follows_stem_and_prefix() {
        let naming = naming();
        assert_eq!(
            naming.bandpass_ms(),
            PathBuf::from("/scratch/obs/20240519_173002_55MHz_bandpass.ms")
        );
        assert_eq!(
            naming.selfcal_ms(2),
            PathBuf::from("/scratch/obs/20240519_173002_55MHz_cal_iter_2.ms")
        );
        assert_eq!(naming.solution(), PathBuf::from("/scratch/obs/sun_solution.h5"));
        assert_eq!(
            naming.solution_archive(3),
            PathBuf::from("/scratch/obs/sun_solution_iter_3.h5")
        );
        assert_eq!(
            naming.shifted_ms(),
            PathBuf::from("/scratch/obs/20240519_173002_55MHz_sun_shifted.ms")
        );
        assert_eq!(naming.report(), PathBuf::from("/scratch/obs/sun_run_report.json"));
        assert_eq!(naming.log(), PathBuf::from("/scratch/obs/sun_pipeline.log"));
    }

    #[test]
    fn full_chain_in_order() {
        let plan = factory(&RunConfig::default()).plan().unwrap();
        let top: Vec<_> = plan.iter().map(PlannedStage::name).collect();
        assert_eq!(
            top,
            [
                "bandpass",
                "flag_avg",
                "selfcal",
                "catalog_image",
                "mask_sources",
                "subtract",
                "phaseshift",
                "final_image"
            ]
        );
        assert_eq!(all_names(&plan).len(), 7 + 3 * 3);
    }

    #[test]
    fn downstream_stages_read_the_last_selfcal_output() {
        let plan = factory(&RunConfig::default()).plan().unwrap();
        let subtract = plan
            .iter()
            .find_map(|stage| match stage {
                PlannedStage::Single(spec) if spec.name() == "subtract" => Some(spec),
                _ => None,
            })
            .unwrap();
        assert_eq!(subtract.inputs(), ["selfcal_ms_iter_3", "masked_sources"]);

        let mut config = RunConfig::default();
        config.selfcal.rounds = 0;
        let plan = factory(&config).plan().unwrap();
        let catalog = plan
            .iter()
            .find_map(|stage| match stage {
                PlannedStage::Single(spec) if spec.name() == "catalog_image" => Some(spec),
                _ => None,
            })
            .unwrap();
        assert_eq!(catalog.inputs(), ["flagged_ms"]);
        assert_eq!(catalog.outputs().len(), 2);
    }

    #[test]
    fn initial_image_and_stop_after() {
        let mut config = RunConfig::default();
        config.diagnostics.initial_image = true;
        config.pipeline.stop_after = Some("initial_image".to_string());
        let plan = factory(&config).plan().unwrap();
        assert_eq!(all_names(&plan), ["bandpass", "flag_avg", "initial_image"]);

        config.pipeline.stop_after = Some("selfcal".to_string());
        config.selfcal.rounds = 1;
        config.selfcal.archive_solutions = true;
        let plan = factory(&config).plan().unwrap();
        assert_eq!(
            all_names(&plan),
            [
                "bandpass",
                "flag_avg",
                "initial_image",
                "selfcal_image_iter_1",
                "selfcal_solve_iter_1",
                "selfcal_archive_iter_1",
                "selfcal_apply_iter_1",
            ]
        );
    }

    #[test]
    fn unknown_stop_point_is_an_error() {
        let mut config = RunConfig::default();
        config.pipeline.stop_after = Some("slefcal".to_string());
        match factory(&config).plan() {
            Err(PipelineError::Config(ConfigError::Invalid(problems))) => {
                assert!(problems[0].contains("\"slefcal\""), "{problems:?}");
            }
            Err(e) => panic!("expected a config error, not {e}"),
            Ok(_) => panic!("expected error, but got Ok(_)"),
        }

        // a real stop point that isn't in this chain
        config.pipeline.stop_after = Some("initial_image".to_string());
        assert!(factory(&config).plan().is_err());
    }

    #[test]
    fn bad_imaging_settings_fail_early() {
        let mut config = RunConfig::default();
        config.imaging.mgain = 1.0;
        assert!(matches!(
            StageFactory::new(&config, naming(), radec_from_degrees(0.0, 0.0)),
            Err(PipelineError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn solution_outputs_replace_the_previous_file() {
        let factory = factory(&RunConfig::default());
        let stages = SelfCalFactory {
            config: RunConfig::default(),
            naming: factory.naming().clone(),
            image_args: factory.selfcal_args.clone(),
        };
        let solve = stages.stage(SelfCalStep::Solve(2), "selfcal_ms_iter_1").unwrap();
        assert_eq!(solve.inputs(), ["selfcal_ms_iter_1"]);
        let output = &solve.outputs()[0];
        assert_eq!(output.logical_name, "solution");
        assert_eq!(output.kind, ArtifactKind::SolutionTable);
        assert!(output.replace_existing);
    }
}
