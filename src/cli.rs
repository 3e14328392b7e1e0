//! Command Line Interface helpers for quickproc

use std::{
    ffi::OsString,
    fmt::{Debug, Display},
    fs,
    path::Path,
    time::Duration,
};

use clap::{
    arg, command,
    ErrorKind::{ArgumentNotFound, DisplayHelp, DisplayVersion},
    ValueHint::{AnyPath, DirPath, ExecutablePath, FilePath},
};
use itertools::Itertools;
use log::{debug, info, trace, warn};
use prettytable::{format as prettyformat, row, table};

use crate::{
    config::{RunConfig, TargetConfig, STOP_POINTS},
    container::{CancelFlag, CliRuntime, ContainerRuntime},
    discover::LatestInputs,
    error::{tail, PipelineError, PipelineError::DryRun, STDERR_TAIL_BYTES},
    logging::attach_run_log,
    pipeline::{PipelineInputs, PipelineOrchestrator, RunOutcome, StageRecord},
    plan::{names, planned_stage_names},
};

// Add build-time information from the "built" crate.
include!(concat!(env!("OUT_DIR"), "/built.rs"));

/// Write how this executable was compiled.
///
/// # Errors
///
/// propagates writeln! fails
pub fn fmt_build_info(f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match GIT_HEAD_REF {
        Some(hr) => {
            let dirty = GIT_DIRTY.unwrap_or(false);
            writeln!(
                f,
                "Compiled on git commit hash: {}{}",
                GIT_COMMIT_HASH.unwrap_or("<unknown>"),
                if dirty { " (dirty)" } else { "" }
            )?;
            writeln!(f, "            git head ref: {hr}")?;
        }
        None => writeln!(f, "Compiled on git commit hash: <no git info>")?,
    }
    writeln!(f, "            {BUILT_TIME_UTC}")?;
    writeln!(f, "         with compiler {RUSTC_VERSION}")?;
    writeln!(f)?;
    Ok(())
}

/// Everything parsed from the command line.
#[derive(Debug, Clone)]
pub struct QuickprocContext {
    /// input and output paths
    pub inputs: PipelineInputs,
    /// configuration, file values overridden by flags
    pub config: RunConfig,
    /// show a progress bar
    pub draw_progress: bool,
    /// the newest observation, to be staged before the run
    pub latest: Option<LatestInputs>,
}

impl Display for QuickprocContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} version {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        )?;

        fmt_build_info(f)?;

        let config = &self.config;
        let target = match config.target {
            TargetConfig::Sun { time: Some(time) } => format!("Sun at {time}"),
            TargetConfig::Sun { time: None } => "Sun, time from file name".to_string(),
            TargetConfig::Fixed { ra_deg, dec_deg } => {
                format!("RA {ra_deg:.4}° Dec {dec_deg:.4}°")
            }
        };
        let mut summary = table!(
            ["raw measurement set", self.inputs.raw_ms.display()],
            ["gain table", self.inputs.gain_table.display()],
            ["output prefix", self.inputs.output_prefix],
            ["working directory", self.inputs.working_dir.display()],
            ["container runtime", config.container.runtime],
            ["linc image", config.container.linc_image],
            ["casa image", config.container.casa_image],
            ["pull images", config.container.pull],
            ["self-cal rounds", config.selfcal.rounds],
            [
                "solver",
                format!(
                    "{} solint={} maxiter={} tolerance={}",
                    config.selfcal.caltype,
                    config.selfcal.solint,
                    config.selfcal.maxiter,
                    config.selfcal.tolerance
                )
            ],
            ["target", target],
            ["mask radius", format!("{}°", config.mask.radius_deg)]
        );
        if let Some(latest) = &self.latest {
            summary.add_row(row!["newest observation", latest.source_ms.display()]);
            summary.add_row(row!["newest gain table", latest.source_gain_table.display()]);
            summary.add_row(row!["staged into", latest.proc_dir.display()]);
        }
        summary.set_format(*prettyformat::consts::FORMAT_CLEAN);
        writeln!(f, "Run summary:\n{summary}")?;

        match planned_stage_names(config, self.inputs.naming()) {
            Ok(stage_names) => writeln!(
                f,
                "Stages ({}): {}",
                stage_names.len(),
                stage_names.iter().join(", ")
            )?,
            Err(err) => writeln!(f, "Stages: <{err}>")?,
        }
        if let Some(stop_after) = &config.pipeline.stop_after {
            writeln!(f, "Will stop after {stop_after}")?;
        }
        Ok(())
    }
}

impl QuickprocContext {
    fn get_matches<I, T>(args: I) -> Result<clap::ArgMatches, PipelineError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        let mut app = command!()
            .arg_required_else_help(true)
            .allow_negative_numbers(true)
            .next_line_help(false)
            .about(
                "Apply a bandpass to an interferometer measurement set, then flag, average, \
                 self-calibrate, subtract the sky and image it, running each tool in a container.",
            )
            .args(&[
                // input options
                arg!(raw_ms: [RAW_MS] "Raw measurement set")
                    .required_unless_present("latest")
                    .value_hint(DirPath)
                    .help_heading("INPUT"),
                arg!(gain_table: [GAIN_TABLE] "Bandpass calibration table")
                    .required_unless_present("latest")
                    .value_hint(AnyPath)
                    .help_heading("INPUT"),
                arg!(output_prefix: [PREFIX] "Prefix of the images, logs and run report")
                    .default_value("proc")
                    .help_heading("INPUT"),
                arg!(-c --config <PATH> "Run configuration, toml, yaml or json")
                    .required(false)
                    .value_hint(FilePath)
                    .help_heading("INPUT"),
                arg!(-w --workdir <DIR> "Where to write everything [default: the raw measurement set's directory]")
                    .required(false)
                    .value_hint(DirPath)
                    .help_heading("INPUT"),

                // processing options
                arg!(--rounds <N> "Number of self-calibration rounds")
                    .required(false)
                    .help_heading("PROCESSING"),
                arg!(--"target-radec" "Phase the final image to these coordinates (degrees) instead of the Sun")
                    .value_names(&["RA", "DEC"])
                    .required(false)
                    .help_heading("PROCESSING"),
                arg!(--"stop-after" <STAGE> "Stop after this stage")
                    .required(false)
                    .possible_values(STOP_POINTS)
                    .help_heading("PROCESSING"),
                arg!(--"initial-image" "Also image the flagged data before self-cal")
                    .help_heading("PROCESSING"),

                // container options
                arg!(--runtime <EXE> "Podman or docker compatible container runtime")
                    .required(false)
                    .value_hint(ExecutablePath)
                    .help_heading("CONTAINER"),
                arg!(--image <IMAGE> "Image providing DP3 and WSClean")
                    .required(false)
                    .help_heading("CONTAINER"),
                arg!(--"casa-image" <IMAGE> "Image providing casatasks")
                    .required(false)
                    .help_heading("CONTAINER"),
                arg!(--"no-pull" "Use the images already present locally")
                    .help_heading("CONTAINER"),
                arg!(--"allow-root-mount" "Allow mounting / when the paths share no other directory")
                    .help_heading("CONTAINER"),

                // realtime options
                arg!(--latest <DATA_ROOT> "Process the newest observation in DATA_ROOT/<date>/<hour>/ instead of RAW_MS")
                    .required(false)
                    .requires_all(&["caltable-dir", "band"])
                    .conflicts_with_all(&["raw_ms", "gain_table"])
                    .value_hint(DirPath)
                    .help_heading("REALTIME"),
                arg!(--"caltable-dir" <DIR> "Where the *_<BAND>.bcal tables are")
                    .required(false)
                    .value_hint(DirPath)
                    .help_heading("REALTIME"),
                arg!(--band <BAND> "Band of the observation, e.g. 55MHz")
                    .required(false)
                    .help_heading("REALTIME"),
                arg!(--"proc-root" <DIR> "Where the processing directory is made")
                    .required(false)
                    .default_value(".")
                    .value_hint(DirPath)
                    .help_heading("REALTIME"),
                arg!(--settle <SECS> "Wait this long for the newest observation to finish writing")
                    .required(false)
                    .default_value("5")
                    .help_heading("REALTIME"),

                arg!(--"dry-run" "Just print the summary and exit"),
                arg!(--"no-draw-progress" "do not show progress bars"),
            ]);

        app.try_get_matches_from_mut(args).map_err(PipelineError::from)
    }

    fn parse_config_matches(matches: &clap::ArgMatches) -> Result<RunConfig, PipelineError> {
        let mut config = match matches.value_of("config") {
            Some(path) => RunConfig::from_file(Path::new(path))?,
            None => RunConfig::default(),
        };

        match matches.value_of_t::<u32>("rounds") {
            Ok(rounds) => config.selfcal.rounds = rounds,
            Err(e) if e.kind() == ArgumentNotFound => {}
            Err(e) => return Err(e.into()),
        }
        match matches.values_of_t::<f64>("target-radec") {
            Ok(radec) => {
                config.target = TargetConfig::Fixed {
                    ra_deg: radec[0],
                    dec_deg: radec[1],
                }
            }
            Err(e) if e.kind() == ArgumentNotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(stage) = matches.value_of("stop-after") {
            config.pipeline.stop_after = Some(stage.to_string());
        }
        if matches.is_present("initial-image") {
            config.diagnostics.initial_image = true;
        }
        if let Some(runtime) = matches.value_of("runtime") {
            config.container.runtime = runtime.to_string();
        }
        if let Some(image) = matches.value_of("image") {
            config.container.linc_image = image.to_string();
        }
        if let Some(image) = matches.value_of("casa-image") {
            config.container.casa_image = image.to_string();
        }
        if matches.is_present("no-pull") {
            config.container.pull = false;
        }
        if matches.is_present("allow-root-mount") {
            config.container.allow_root_mount = true;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse the command line into a context.
    ///
    /// # Errors
    ///
    /// Can raise:
    /// - [`PipelineError::ClapError`] if clap cannot parse `args`
    /// - [`PipelineError::Config`] if the config file is unreadable or invalid
    /// - [`PipelineError::Discover`] if `--latest` finds nothing to process
    /// - [`PipelineError::DryRun`] after printing the summary, if asked to
    pub fn from_args<I, T>(args: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        debug!("args:\n{:?}", &args);

        let matches = Self::get_matches(args)?;
        trace!("arg matches:\n{:?}", &matches);

        let config = Self::parse_config_matches(&matches)?;
        let workdir = matches.value_of("workdir").map(Path::new);
        let latest = match matches.value_of("latest") {
            Some(data_root) => Some(LatestInputs::discover(
                Path::new(data_root),
                Path::new(matches.value_of("caltable-dir").unwrap_or_default()),
                matches.value_of("band").unwrap_or_default(),
                Path::new(matches.value_of("proc-root").unwrap_or(".")),
                Duration::from_secs(matches.value_of_t::<u64>("settle")?),
            )?),
            None => None,
        };
        let inputs = match &latest {
            Some(latest) => latest.pipeline_inputs(workdir)?,
            None => PipelineInputs::new(
                Path::new(matches.value_of("raw_ms").unwrap_or_default()),
                Path::new(matches.value_of("gain_table").unwrap_or_default()),
                matches.value_of("output_prefix").unwrap_or("proc"),
                workdir,
            )?,
        };

        let result = Self {
            inputs,
            config,
            draw_progress: !matches.is_present("no-draw-progress"),
            latest,
        };

        info!("{}", &result);

        if matches.is_present("dry-run") {
            return Err(DryRun {});
        }

        Ok(result)
    }

    /// Copy the newest observation and its gain table into the processing
    /// directory, when running on the latest data.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Discover`] if the copy fails
    pub fn stage_inputs(&self) -> Result<(), PipelineError> {
        if let Some(latest) = &self.latest {
            latest.stage()?;
        }
        Ok(())
    }

    /// Run the pipeline through `runtime`.
    pub fn run_with_runtime(&self, runtime: &dyn ContainerRuntime, cancel: CancelFlag) -> RunOutcome {
        PipelineOrchestrator::new(self.config.clone(), self.inputs.clone(), runtime, cancel)
            .draw_progress(self.draw_progress)
            .run()
    }

    /// Stage the latest inputs if asked to, then run the pipeline with the
    /// configured container runtime, logging into `<prefix>_pipeline.log` and
    /// stopping on SIGINT, SIGTERM or SIGHUP.
    ///
    /// # Errors
    ///
    /// staging failures, and io errors from creating the working directory,
    /// opening the log or registering the signal handlers. Failures of the run
    /// itself are in the [`RunOutcome`].
    pub fn run(self) -> Result<RunOutcome, PipelineError> {
        self.stage_inputs()?;
        let naming = self.inputs.naming();
        fs::create_dir_all(naming.workdir())?;
        let _log_guard = attach_run_log(&naming.log())?;

        let cancel = CancelFlag::default();
        cancel.register_signals()?;
        let runtime = CliRuntime::new(self.config.container.runtime.as_str(), cancel.clone());
        Ok(self.run_with_runtime(&runtime, cancel))
    }
}

fn history_table(history: &[StageRecord]) -> prettytable::Table {
    let mut history_table = table!(["stage", "status", "elapsed [s]"]);
    history_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
    for record in history {
        history_table.add_row(row![
            record.stage_name,
            format!("{:?}", record.status).to_lowercase(),
            r->format!("{:.1}", record.elapsed_s)
        ]);
    }
    history_table
}

/// Print what happened and pick the exit code.
fn report_outcome(outcome: &RunOutcome) -> i32 {
    if let Some(failed) = outcome.failed_stage() {
        eprintln!(
            "stage {} failed after {:.1}s",
            failed.stage_name, failed.elapsed_s
        );
    }
    if let Some(err) = &outcome.error {
        eprintln!("{}", tail(&err.to_string(), STDERR_TAIL_BYTES));
    }

    println!("{}", history_table(&outcome.run.stage_history));
    match &outcome.report_path {
        Some(path) => println!("run report: {}", path.display()),
        None => warn!("no run report was written"),
    }

    if outcome.is_success() {
        if let Some(image) = outcome.report.artifact(names::FINAL_IMAGE) {
            println!("final image: {}", image.display());
        }
        info!("total duration: {:.1}s", outcome.report.elapsed_s);
        0
    } else {
        1
    }
}

/// Parse `args`, run the pipeline and return the process exit code.
pub fn main_with_args<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    I: Debug,
{
    let context = match QuickprocContext::from_args(args) {
        Ok(context) => context,
        Err(DryRun {}) => {
            info!("Dry run. No files will be written.");
            return 0;
        }
        Err(PipelineError::ClapError(inner)) => {
            // Swallow broken pipe errors
            trace!("clap error: {:?}", inner.kind());
            let _ = inner.print();
            match inner.kind() {
                DisplayHelp | DisplayVersion => return 0,
                _ => return 1,
            }
        }
        Err(e) => {
            eprintln!("error parsing args: {e}");
            return 1;
        }
    };

    match context.run() {
        Ok(outcome) => report_outcome(&outcome),
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}
