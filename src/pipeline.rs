//! The top-level sequencer.
//!
//! [`PipelineOrchestrator::run`] checks the inputs, resolves the target, builds
//! the stage plan and runs it one stage at a time. The first failure stops the
//! run. Whatever happens, a [`RunReport`] is written into the working directory.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Instant,
};

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{error, info, warn};
use marlu::RADec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::RunConfig,
    container::{CancelFlag, ContainerRuntime},
    error::PipelineError,
    mount::normalize,
    plan::{names, planned_stage_names, ArtifactNaming, PlannedStage, StageFactory},
    report::RunReport,
    sky::fmt_radec,
    stage::{Artifact, ArtifactKind, ArtifactTable, StageContext, StageSpec},
};

/// Status of a run or of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// not finished yet
    Running,
    /// completed without error
    Succeeded,
    /// stopped by an error
    Failed,
}

/// One entry of the stage history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// stage name
    pub stage_name: String,
    /// when it started
    pub started_at: DateTime<Utc>,
    /// when it ended
    pub ended_at: DateTime<Utc>,
    /// wall clock seconds
    pub elapsed_s: f64,
    /// outcome
    pub status: RunStatus,
    /// error text on failure
    pub error: Option<String>,
}

/// The paths a run is given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineInputs {
    /// raw measurement set
    pub raw_ms: PathBuf,
    /// bandpass calibration table
    pub gain_table: PathBuf,
    /// prefix of the images and reports
    pub output_prefix: String,
    /// where every product is written
    pub working_dir: PathBuf,
}

impl PipelineInputs {
    /// Absolute, normalised inputs. The working directory defaults to the raw
    /// measurement set's parent.
    ///
    /// # Errors
    ///
    /// if the current directory can't be read
    pub fn new(
        raw_ms: &Path,
        gain_table: &Path,
        output_prefix: impl Into<String>,
        working_dir: Option<&Path>,
    ) -> std::io::Result<Self> {
        let cwd = env::current_dir()?;
        let absolute = |path: &Path| normalize(&cwd.join(path));
        let raw_ms = absolute(raw_ms);
        let working_dir = match working_dir {
            Some(dir) => absolute(dir),
            None => raw_ms
                .parent()
                .map_or_else(|| cwd.clone(), Path::to_path_buf),
        };
        Ok(Self {
            gain_table: absolute(gain_table),
            raw_ms,
            output_prefix: output_prefix.into(),
            working_dir,
        })
    }

    /// Names of everything the run writes
    pub fn naming(&self) -> ArtifactNaming {
        ArtifactNaming::new(&self.working_dir, &self.raw_ms, self.output_prefix.as_str())
    }
}

/// State of one run, owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    /// unique id
    pub run_id: Uuid,
    /// working directory
    pub working_directory: PathBuf,
    /// when the run started
    pub started_at: DateTime<Utc>,
    /// every artifact, in provenance order
    pub artifacts: ArtifactTable,
    /// every stage that started, in order
    pub stage_history: Vec<StageRecord>,
    /// overall status
    pub status: RunStatus,
}

impl PipelineRun {
    /// A fresh run in `working_directory`.
    pub fn new(working_directory: &Path) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            working_directory: working_directory.to_path_buf(),
            started_at: Utc::now(),
            artifacts: ArtifactTable::default(),
            stage_history: vec![],
            status: RunStatus::Running,
        }
    }
}

/// What a finished run left behind.
#[derive(Debug)]
pub struct RunOutcome {
    /// final state of the run
    pub run: PipelineRun,
    /// the report as written
    pub report: RunReport,
    /// where the report was written, `None` if that failed
    pub report_path: Option<PathBuf>,
    /// the error that stopped the run
    pub error: Option<PipelineError>,
}

impl RunOutcome {
    /// Whether every stage completed
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// The record of the stage that failed
    pub fn failed_stage(&self) -> Option<&StageRecord> {
        self.run
            .stage_history
            .iter()
            .rev()
            .find(|record| record.status == RunStatus::Failed)
    }
}

/// Runs the stage plan of one set of inputs.
pub struct PipelineOrchestrator<'a> {
    config: RunConfig,
    inputs: PipelineInputs,
    runtime: &'a dyn ContainerRuntime,
    cancel: CancelFlag,
    draw_progress: bool,
}

impl<'a> PipelineOrchestrator<'a> {
    /// An orchestrator running tools through `runtime`, stopping early once
    /// `cancel` is set.
    pub fn new(
        config: RunConfig,
        inputs: PipelineInputs,
        runtime: &'a dyn ContainerRuntime,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            config,
            inputs,
            runtime,
            cancel,
            draw_progress: true,
        }
    }

    /// Show a progress bar on stdout
    #[must_use]
    pub fn draw_progress(mut self, draw_progress: bool) -> Self {
        self.draw_progress = draw_progress;
        self
    }

    /// Names of every stage the configured plan runs, in order.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] if the imaging arguments don't validate.
    pub fn planned_stage_names(&self) -> Result<Vec<String>, PipelineError> {
        planned_stage_names(&self.config, self.inputs.naming())
    }

    /// Run the pipeline and write the report.
    pub fn run(&self) -> RunOutcome {
        let naming = self.inputs.naming();
        let mut run = PipelineRun::new(&self.inputs.working_dir);
        info!(
            "run {} of {} into {}",
            run.run_id,
            self.inputs.raw_ms.display(),
            run.working_directory.display()
        );

        let mut target = None;
        let result = self.run_plan(&naming, &mut run, &mut target);
        run.status = match result {
            Ok(()) => RunStatus::Succeeded,
            Err(_) => RunStatus::Failed,
        };

        let report = RunReport::new(
            &run,
            &self.config,
            &self.inputs,
            target,
            result.as_ref().err().map(ToString::to_string),
        );
        let report_path = naming.report();
        let report_path = match report.write(&report_path) {
            Ok(()) => {
                info!("run report written to {}", report_path.display());
                Some(report_path)
            }
            Err(err) => {
                warn!("could not write run report {}: {err}", report_path.display());
                None
            }
        };

        RunOutcome {
            run,
            report,
            report_path,
            error: result.err(),
        }
    }

    fn run_plan(
        &self,
        naming: &ArtifactNaming,
        run: &mut PipelineRun,
        target: &mut Option<(RADec, String)>,
    ) -> Result<(), PipelineError> {
        let started_at = Utc::now();
        let timer = Instant::now();
        let plan = match self.prepare(naming, run, target) {
            Ok(plan) => plan,
            Err(err) => {
                error!("preflight failed: {err}");
                run.stage_history.push(StageRecord {
                    stage_name: "preflight".to_string(),
                    started_at,
                    ended_at: Utc::now(),
                    elapsed_s: timer.elapsed().as_secs_f64(),
                    status: RunStatus::Failed,
                    error: Some(err.to_string()),
                });
                return Err(err);
            }
        };
        self.execute(plan, run)
    }

    /// Preflight checks, input registration, target and plan.
    fn prepare(
        &self,
        naming: &ArtifactNaming,
        run: &mut PipelineRun,
        target: &mut Option<(RADec, String)>,
    ) -> Result<Vec<PlannedStage>, PipelineError> {
        self.config.validate()?;
        let inputs = &self.inputs;
        for (what, path) in [
            ("raw measurement set", &inputs.raw_ms),
            ("gain table", &inputs.gain_table),
        ] {
            if !path.exists() {
                return Err(PipelineError::MissingInput {
                    what: what.to_string(),
                    path: path.clone(),
                });
            }
        }

        let version = self.runtime.version()?;
        info!("container runtime: {}", version.trim());
        let container = &self.config.container;
        if container.pull {
            for image in [&container.casa_image, &container.linc_image] {
                info!("pulling {image}");
                self.runtime.pull(image)?;
            }
        }
        fs::create_dir_all(&inputs.working_dir)?;

        for (logical_name, path, kind) in [
            (names::RAW_MS, &inputs.raw_ms, ArtifactKind::MeasurementSet),
            (names::GAIN_TABLE, &inputs.gain_table, ArtifactKind::SolutionTable),
        ] {
            run.artifacts.register(Artifact {
                logical_name: logical_name.to_string(),
                path: path.clone(),
                produced_by: "input".to_string(),
                kind,
            })?;
        }

        let locator = self.config.target.locator();
        let position = locator.locate(&inputs.raw_ms)?;
        info!("target {}: {}", locator.describe(), fmt_radec(position));
        *target = Some((position, locator.describe()));

        let factory = StageFactory::new(&self.config, naming.clone(), position)?;
        factory.plan()
    }

    fn execute(&self, plan: Vec<PlannedStage>, run: &mut PipelineRun) -> Result<(), PipelineError> {
        let num_stages: usize = plan.iter().map(|stage| stage.stage_names().len()).sum();
        let draw_target = if self.draw_progress {
            ProgressDrawTarget::stdout()
        } else {
            ProgressDrawTarget::hidden()
        };
        let progress = ProgressBar::with_draw_target(Some(num_stages as u64), draw_target);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{msg:24}: [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} stages")
                .unwrap()
                .progress_chars("=> "),
        );

        let ctx = StageContext {
            runtime: self.runtime,
            config_dir: &self.inputs.working_dir,
            allow_root_mount: self.config.container.allow_root_mount,
        };
        for planned in plan {
            match planned {
                PlannedStage::Single(stage) => self.run_stage(&ctx, &stage, run, &progress)?,
                PlannedStage::SelfCal(mut selfcal) => {
                    let output =
                        selfcal.run(|stage| self.run_stage(&ctx, &stage, run, &progress))?;
                    info!("self-cal finished after {} rounds: {output}", selfcal.rounds());
                }
            }
        }
        progress.finish_with_message("done");
        Ok(())
    }

    fn run_stage(
        &self,
        ctx: &StageContext,
        stage: &StageSpec,
        run: &mut PipelineRun,
        progress: &ProgressBar,
    ) -> Result<(), PipelineError> {
        let started_at = Utc::now();
        let timer = Instant::now();
        progress.set_message(stage.name().to_string());
        info!("stage {} started", stage.name());

        let result = if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            stage.execute(ctx, &run.artifacts)
        }
        .and_then(|artifacts| run.artifacts.register_all(artifacts));

        let elapsed = timer.elapsed().as_secs_f64();
        run.stage_history.push(StageRecord {
            stage_name: stage.name().to_string(),
            started_at,
            ended_at: Utc::now(),
            elapsed_s: elapsed,
            status: if result.is_ok() {
                RunStatus::Succeeded
            } else {
                RunStatus::Failed
            },
            error: result.as_ref().err().map(ToString::to_string),
        });
        match &result {
            Ok(()) => {
                info!("stage {} finished in {elapsed:.1}s", stage.name());
                progress.inc(1);
            }
            Err(err) => {
                progress.abandon_with_message(format!("{} failed", stage.name()));
                error!("stage {} failed after {elapsed:.1}s: {err}", stage.name());
            }
        }
        result
    }
}
