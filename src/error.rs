//! Errors that can occur while running the pipeline

use std::path::PathBuf;
use thiserror::Error;

use crate::{
    config::ConfigError, discover::DiscoverError, mount::PathResolutionError, sky::SkyError,
};

/// How many bytes of a tool's stderr are shown in an error message. The full
/// text is always logged.
pub const STDERR_TAIL_BYTES: usize = 2048;

/// Keep at most the last `max_bytes` bytes of `text`, on a char boundary.
pub fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

fn fmt_tool_invocation(stage: &str, exit_code: &Option<i32>, stderr: &str) -> String {
    let status = match exit_code {
        Some(code) => format!("exited with code {code}"),
        None => "could not be launched".to_string(),
    };
    let stderr = tail(stderr.trim_end(), STDERR_TAIL_BYTES);
    if stderr.is_empty() {
        format!("stage {stage}: tool {status}")
    } else {
        format!("stage {stage}: tool {status}\n{stderr}")
    }
}

/// Any error that can abort a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The paths of one invocation could not be mapped into the container.
    #[error(transparent)]
    PathResolution(#[from] PathResolutionError),

    /// A transient configuration document could not be written.
    #[error("could not write configuration {path:?}: {source}")]
    ConfigWrite {
        /// where the document was going
        path: PathBuf,
        /// underlying io failure
        source: std::io::Error,
    },

    /// The external tool failed, or the container runtime could not be started.
    #[error("{}", fmt_tool_invocation(.stage, .exit_code, .stderr))]
    ToolInvocation {
        /// stage name
        stage: String,
        /// `None` when the process never ran
        exit_code: Option<i32>,
        /// captured stderr (full text)
        stderr: String,
    },

    /// The tool exited 0 but a declared output is not on disk.
    #[error("stage {stage}: expected output {logical_name} missing at {path:?}")]
    MissingArtifact {
        /// stage name
        stage: String,
        /// logical name of the output
        logical_name: String,
        /// where it should have been
        path: PathBuf,
    },

    /// A required input of the run does not exist.
    #[error("{what} not found at {path:?}")]
    MissingInput {
        /// description of the input
        what: String,
        /// where we looked
        path: PathBuf,
    },

    /// A stage asked for an artifact that no earlier stage registered.
    #[error("stage {stage}: no artifact named {logical_name} has been produced")]
    UnknownArtifact {
        /// stage name
        stage: String,
        /// requested logical name
        logical_name: String,
    },

    /// A stage tried to re-register an artifact that may only be written once.
    #[error("stage {stage}: artifact {logical_name} was already produced by {previous}")]
    ArtifactConflict {
        /// stage name
        stage: String,
        /// logical name
        logical_name: String,
        /// stage that produced the existing artifact
        previous: String,
    },

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Source list or target position problems
    #[error(transparent)]
    Sky(#[from] SkyError),

    /// The newest inputs could not be found or staged.
    #[error(transparent)]
    Discover(#[from] DiscoverError),

    /// A termination signal was received.
    #[error("run cancelled by signal")]
    Cancelled,

    /// Generic io failure
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(feature = "cli")]
    /// Error derived from [`clap::Error`]
    #[error(transparent)]
    ClapError(#[from] clap::Error),

    /// The user asked for a dry run.
    #[error("Dry run")]
    DryRun {},
}
