//! The persisted summary of a run.

use std::{
    fs::File,
    io::{self, BufReader, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::debug;
use marlu::RADec;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{
    config::RunConfig,
    pipeline::{PipelineInputs, PipelineRun, RunStatus, StageRecord},
    stage::Artifact,
};

/// Gain solver settings used by the self-cal loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverSummary {
    /// `cal.caltype`
    pub caltype: String,
    /// `cal.solint`
    pub solint: u32,
    /// `cal.maxiter`
    pub maxiter: u32,
    /// `cal.tolerance`
    pub tolerance: f64,
    /// `cal.uvlambdamin`
    pub uvlambdamin: f64,
}

/// Where the data was phased to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSummary {
    /// how the position was found
    pub description: String,
    /// right ascension \[degrees\]
    pub ra_deg: f64,
    /// declination \[degrees\]
    pub dec_deg: f64,
}

/// Snapshot of a [`PipelineRun`] at termination, written as
/// `<prefix>_run_report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// unique id of the run
    pub run_id: String,
    /// `succeeded` or `failed`
    pub status: RunStatus,
    /// raw measurement set
    pub input_ms: PathBuf,
    /// bandpass table
    pub gain_table: PathBuf,
    /// output prefix
    pub output_prefix: String,
    /// where everything was written
    pub working_directory: PathBuf,
    /// container runtime executable
    pub container_runtime: String,
    /// DP3 / WSClean image
    pub linc_image: String,
    /// CASA image
    pub casa_image: String,
    /// configured self-cal rounds
    pub selfcal_rounds: u32,
    /// gain solver settings
    pub solver: SolverSummary,
    /// phase centre target, once resolved
    pub target: Option<TargetSummary>,
    /// run start
    pub started_at: DateTime<Utc>,
    /// run end
    pub completed_at: DateTime<Utc>,
    /// wall clock seconds
    pub elapsed_s: f64,
    /// the stage that failed, if any
    pub failed_stage: Option<String>,
    /// error text of the failure
    pub error: Option<String>,
    /// every stage that started, in order
    pub stages: Vec<StageRecord>,
    /// every registered artifact, in provenance order
    pub artifacts: Vec<Artifact>,
    /// the full configuration used
    pub config: RunConfig,
}

impl RunReport {
    /// Summarise `run`.
    pub fn new(
        run: &PipelineRun,
        config: &RunConfig,
        inputs: &PipelineInputs,
        target: Option<(RADec, String)>,
        error: Option<String>,
    ) -> Self {
        let completed_at = Utc::now();
        let elapsed_s = (completed_at - run.started_at).num_milliseconds() as f64 / 1e3;
        let failed_stage = run
            .stage_history
            .iter()
            .rev()
            .find(|record| record.status == RunStatus::Failed)
            .map(|record| record.stage_name.clone());
        Self {
            run_id: run.run_id.to_string(),
            status: run.status,
            input_ms: inputs.raw_ms.clone(),
            gain_table: inputs.gain_table.clone(),
            output_prefix: inputs.output_prefix.clone(),
            working_directory: run.working_directory.clone(),
            container_runtime: config.container.runtime.clone(),
            linc_image: config.container.linc_image.clone(),
            casa_image: config.container.casa_image.clone(),
            selfcal_rounds: config.selfcal.rounds,
            solver: SolverSummary {
                caltype: config.selfcal.caltype.clone(),
                solint: config.selfcal.solint,
                maxiter: config.selfcal.maxiter,
                tolerance: config.selfcal.tolerance,
                uvlambdamin: config.selfcal.uvlambdamin,
            },
            target: target.map(|(position, description)| TargetSummary {
                description,
                ra_deg: position.ra.to_degrees(),
                dec_deg: position.dec.to_degrees(),
            }),
            started_at: run.started_at,
            completed_at,
            elapsed_s,
            failed_stage,
            error,
            stages: run.stage_history.clone(),
            artifacts: run.artifacts.iter().cloned().collect(),
            config: config.clone(),
        }
    }

    /// Path of an artifact by logical name
    pub fn artifact(&self, logical_name: &str) -> Option<&Path> {
        self.artifacts
            .iter()
            .find(|artifact| artifact.logical_name == logical_name)
            .map(|artifact| artifact.path.as_path())
    }

    /// Write as pretty json. The file is replaced atomically, so a reader
    /// never sees half a report.
    ///
    /// # Errors
    ///
    /// any io or serialization failure
    pub fn write(&self, path: &Path) -> io::Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        file.persist(path)?;
        debug!("wrote run report {}", path.display());
        Ok(())
    }

    /// Read a report back.
    ///
    /// # Errors
    ///
    /// any io or deserialization failure
    pub fn read(path: &Path) -> io::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}
