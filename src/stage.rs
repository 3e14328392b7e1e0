//! Declarative pipeline stages and the artifacts they exchange.

use std::{
    fmt::{self, Debug},
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use log::{debug, error, trace};
use serde::{Deserialize, Serialize};

use crate::{
    container::{ContainerInvocation, ContainerRuntime},
    error::PipelineError,
    mount::{MountMapping, PathResolutionError},
    parset::TransientConfig,
};

/// What sort of thing an artifact path points to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// a measurement set directory
    MeasurementSet,
    /// an h5parm gain solution file, overwritten every self-cal round
    SolutionTable,
    /// a FITS image
    Image,
    /// a WSClean text source list
    SourceList,
}

/// A named output of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// name used by later stages to ask for this artifact
    pub logical_name: String,
    /// host path
    pub path: PathBuf,
    /// stage that produced it, `input` for the run's inputs
    pub produced_by: String,
    /// kind of file
    pub kind: ArtifactKind,
}

/// Provenance-ordered table of every artifact in a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactTable {
    artifacts: IndexMap<String, Artifact>,
}

impl ArtifactTable {
    /// Look up an artifact by logical name
    pub fn get(&self, logical_name: &str) -> Option<&Artifact> {
        self.artifacts.get(logical_name)
    }

    /// Look up an artifact that `stage` depends on.
    ///
    /// # Errors
    ///
    /// [`PipelineError::UnknownArtifact`] if nothing has that name.
    pub fn require(&self, stage: &str, logical_name: &str) -> Result<&Artifact, PipelineError> {
        self.get(logical_name)
            .ok_or_else(|| PipelineError::UnknownArtifact {
                stage: stage.to_string(),
                logical_name: logical_name.to_string(),
            })
    }

    fn check_register(&self, artifact: &Artifact) -> Result<(), PipelineError> {
        match self.artifacts.get(&artifact.logical_name) {
            Some(existing)
                if existing.kind != ArtifactKind::SolutionTable
                    || artifact.kind != ArtifactKind::SolutionTable =>
            {
                Err(PipelineError::ArtifactConflict {
                    stage: artifact.produced_by.clone(),
                    logical_name: artifact.logical_name.clone(),
                    previous: existing.produced_by.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Add an artifact. Only solution tables may be registered twice.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ArtifactConflict`] on an illegal re-registration.
    pub fn register(&mut self, artifact: Artifact) -> Result<(), PipelineError> {
        self.check_register(&artifact)?;
        if let Some(existing) = self.artifacts.get(&artifact.logical_name) {
            trace!("replacing {} from {}", artifact.logical_name, existing.produced_by);
        }
        self.artifacts.insert(artifact.logical_name.clone(), artifact);
        Ok(())
    }

    /// Add every output of one stage, or none of them.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ArtifactConflict`] if any one of them is an illegal
    /// re-registration, in which case the table is unchanged.
    pub fn register_all(&mut self, artifacts: Vec<Artifact>) -> Result<(), PipelineError> {
        let mut staged = self.clone();
        for artifact in artifacts {
            staged.register(artifact)?;
        }
        *self = staged;
        Ok(())
    }

    /// Artifacts in the order they were first registered
    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.values()
    }

    /// Number of artifacts
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    /// Whether there are no artifacts
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

/// The resolved inputs of one stage.
#[derive(Debug, Clone)]
pub struct StageInputs {
    stage: String,
    artifacts: IndexMap<String, Artifact>,
}

impl StageInputs {
    /// Input artifact by logical name.
    ///
    /// # Errors
    ///
    /// [`PipelineError::UnknownArtifact`] if the stage didn't declare it.
    pub fn get(&self, logical_name: &str) -> Result<&Artifact, PipelineError> {
        self.artifacts
            .get(logical_name)
            .ok_or_else(|| PipelineError::UnknownArtifact {
                stage: self.stage.clone(),
                logical_name: logical_name.to_string(),
            })
    }

    /// Host path of an input.
    ///
    /// # Errors
    ///
    /// [`PipelineError::UnknownArtifact`] if the stage didn't declare it.
    pub fn path(&self, logical_name: &str) -> Result<&Path, PipelineError> {
        self.get(logical_name).map(|artifact| artifact.path.as_path())
    }
}

/// An output a stage promises to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDecl {
    /// logical name to register it under
    pub logical_name: String,
    /// host path
    pub path: PathBuf,
    /// kind of file
    pub kind: ArtifactKind,
    /// remove whatever is at `path` before the stage runs
    pub replace_existing: bool,
}

impl OutputDecl {
    /// An output that is left alone before the stage runs.
    pub fn new(logical_name: impl Into<String>, path: impl Into<PathBuf>, kind: ArtifactKind) -> Self {
        Self {
            logical_name: logical_name.into(),
            path: path.into(),
            kind,
            replace_existing: false,
        }
    }

    /// Remove any previous file or directory at this path before running.
    #[must_use]
    pub fn replacing(mut self) -> Self {
        self.replace_existing = true;
        self
    }
}

/// A tool run inside a container.
pub trait ToolCommand: Debug {
    /// Container image
    fn image(&self) -> &str;

    /// Host paths the tool reads or writes, outputs included.
    fn host_paths(&self) -> Vec<PathBuf>;

    /// File suffix of the transient config document, if the tool takes one.
    fn config_suffix(&self) -> Option<&'static str> {
        None
    }

    /// Render the config document with container paths.
    ///
    /// # Errors
    ///
    /// [`PathResolutionError`] if a path is outside the mapping.
    fn render_config(&self, _mapping: &MountMapping) -> Result<String, PathResolutionError> {
        Ok(String::new())
    }

    /// Argument vector. `config` is the container path of the config document.
    ///
    /// # Errors
    ///
    /// [`PathResolutionError`] if a path is outside the mapping.
    fn argv(
        &self,
        mapping: &MountMapping,
        config: Option<&Path>,
    ) -> Result<Vec<String>, PathResolutionError>;

    /// Working directory inside the container
    ///
    /// # Errors
    ///
    /// [`PathResolutionError`] if a path is outside the mapping.
    fn workdir(&self, mapping: &MountMapping) -> Result<PathBuf, PathResolutionError> {
        Ok(mapping.container_mount_point().to_path_buf())
    }
}

/// A step that runs in-process.
pub trait NativeStep: Debug {
    /// Do the work.
    ///
    /// # Errors
    ///
    /// any [`PipelineError`]
    fn run(&self) -> Result<(), PipelineError>;
}

/// What a stage actually does
#[derive(Debug)]
pub enum StageAction {
    /// run a tool in a container
    Container(Box<dyn ToolCommand>),
    /// run a step in this process
    Native(Box<dyn NativeStep>),
}

/// Builds a stage's action once its inputs are known.
pub type ActionBuilder = Box<dyn Fn(&StageInputs) -> Result<StageAction, PipelineError>>;

/// What a stage needs from the run.
pub struct StageContext<'a> {
    /// runs container invocations
    pub runtime: &'a dyn ContainerRuntime,
    /// where transient config documents are written
    pub config_dir: &'a Path,
    /// accept a mapping that mounts `/`
    pub allow_root_mount: bool,
}

/// One step of the pipeline: named inputs, declared outputs and an action.
pub struct StageSpec {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<OutputDecl>,
    build: ActionBuilder,
}

impl Debug for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSpec")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl StageSpec {
    /// A new stage.
    pub fn new<F>(name: impl Into<String>, inputs: &[&str], outputs: Vec<OutputDecl>, build: F) -> Self
    where
        F: Fn(&StageInputs) -> Result<StageAction, PipelineError> + 'static,
    {
        Self {
            name: name.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs,
            build: Box::new(build),
        }
    }

    /// Stage name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical names of the inputs
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Declared outputs
    pub fn outputs(&self) -> &[OutputDecl] {
        &self.outputs
    }

    fn resolve_inputs(&self, table: &ArtifactTable) -> Result<StageInputs, PipelineError> {
        let mut artifacts = IndexMap::new();
        for name in &self.inputs {
            let artifact = table.require(&self.name, name)?;
            artifacts.insert(name.clone(), artifact.clone());
        }
        Ok(StageInputs {
            stage: self.name.clone(),
            artifacts,
        })
    }

    /// Run the stage and return its outputs as artifacts.
    ///
    /// Outputs are only returned once the action succeeded and every declared
    /// output exists on disk. Registering them is up to the caller.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::UnknownArtifact`] for an input no earlier stage produced
    /// - [`PipelineError::PathResolution`] if the paths can't share a mount
    /// - [`PipelineError::ConfigWrite`] if the config document can't be written
    /// - [`PipelineError::ToolInvocation`] if the tool fails
    /// - [`PipelineError::MissingArtifact`] if an output is missing afterwards
    pub fn execute(
        &self,
        ctx: &StageContext,
        table: &ArtifactTable,
    ) -> Result<Vec<Artifact>, PipelineError> {
        let inputs = self.resolve_inputs(table)?;

        for output in self.outputs.iter().filter(|o| o.replace_existing) {
            remove_existing(&output.path)?;
        }

        match (self.build)(&inputs)? {
            StageAction::Container(command) => self.run_container(ctx, command.as_ref())?,
            StageAction::Native(step) => step.run()?,
        }

        self.outputs
            .iter()
            .map(|output| {
                if output.path.exists() {
                    Ok(Artifact {
                        logical_name: output.logical_name.clone(),
                        path: output.path.clone(),
                        produced_by: self.name.clone(),
                        kind: output.kind,
                    })
                } else {
                    Err(PipelineError::MissingArtifact {
                        stage: self.name.clone(),
                        logical_name: output.logical_name.clone(),
                        path: output.path.clone(),
                    })
                }
            })
            .collect()
    }

    fn run_container(
        &self,
        ctx: &StageContext,
        command: &dyn ToolCommand,
    ) -> Result<(), PipelineError> {
        // the config file is reserved first so that its path is part of the mount
        let config = command
            .config_suffix()
            .map(|suffix| TransientConfig::create(ctx.config_dir, &self.name, suffix))
            .transpose()?;

        let mut paths = command.host_paths();
        paths.extend(self.outputs.iter().map(|o| o.path.clone()));
        if let Some(config) = &config {
            paths.push(config.path().to_path_buf());
        }
        let mapping = MountMapping::resolve(&paths)?;
        if mapping.is_root() && !ctx.allow_root_mount {
            return Err(PathResolutionError::RootMount { paths }.into());
        }

        let config_in_container = match &config {
            Some(config) => {
                config.fill(&command.render_config(&mapping)?)?;
                Some(mapping.translate(config.path())?)
            }
            None => None,
        };

        let invocation = ContainerInvocation::new(
            self.name.as_str(),
            command.image(),
            command.workdir(&mapping)?,
            command.argv(&mapping, config_in_container.as_deref())?,
        )
        .mount(mapping.as_bind());

        let result = ctx.runtime.run(&invocation)?;
        if !result.success() {
            error!(
                "{} exited with code {}, stderr:\n{}",
                self.name, result.exit_code, result.stderr
            );
            return Err(PipelineError::ToolInvocation {
                stage: self.name.clone(),
                exit_code: Some(result.exit_code),
                stderr: result.stderr,
            });
        }
        debug!("{} finished, stderr:\n{}", self.name, result.stderr.trim_end());
        Ok(())
    }
}

fn remove_existing(path: &Path) -> Result<(), PipelineError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(_) => return Ok(()),
    };
    debug!("removed previous {}", path.display());
    Ok(())
}
