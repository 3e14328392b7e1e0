#![warn(missing_docs)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::missing_errors_doc)]

//! quickproc is a self-calibration and imaging pipeline for radio
//! interferometer measurement sets. It never touches visibilities itself: each
//! step is an external tool (CASA, DP3 with AOFlagger, WSClean) run in a
//! container, and quickproc decides what runs when, with which configuration,
//! and where the products go.
//!
//! # Examples
//!
//! Here's how the mount for one invocation is worked out, and what DP3 is
//! told to do with it.
//!
//! ```rust
//! use quickproc::{mount::MountMapping, parset::Parset};
//! use std::path::Path;
//!
//! let mapping = MountMapping::resolve([
//!     "/scratch/a/raw.ms",
//!     "/scratch/a/sol.h5",
//!     "/scratch/b/out.ms",
//! ])
//! .unwrap();
//! assert_eq!(mapping.host_root(), Path::new("/scratch"));
//!
//! let parset = Parset::default()
//!     .msin(mapping.translate(Path::new("/scratch/a/raw.ms")).unwrap())
//!     .msout(mapping.translate(Path::new("/scratch/b/out.ms")).unwrap())
//!     .step("avg", "averager")
//!     .param("avg", "freqstep", 4_u32);
//! assert!(parset.render().starts_with("msin = /data/a/raw.ms\nmsout = /data/b/out.ms\n"));
//! ```
//!
//! # Details
//!
//! A run is a fixed chain of [`stage::StageSpec`]s built by
//! [`plan::StageFactory`]: bandpass, flag + average, a bounded
//! [`selfcal::SelfCalLoop`], catalog imaging, source masking, subtraction,
//! phase shift and a final image. [`pipeline::PipelineOrchestrator`] runs the
//! chain through a [`container::ContainerRuntime`], registers every product in
//! an artifact table and always leaves a [`report::RunReport`] behind.

pub mod config;
pub mod container;
pub mod discover;
pub mod error;
pub mod logging;
pub mod mount;
pub mod parset;
pub mod pipeline;
pub mod plan;
pub mod report;
pub mod selfcal;
pub mod sky;
pub mod stage;
pub mod tools;

#[cfg(feature = "cli")]
pub mod cli;

pub use config::{ConfigError, RunConfig};
pub use container::{CancelFlag, CliRuntime, ContainerInvocation, ContainerRuntime, RunResult};
pub use error::PipelineError;
pub use pipeline::{PipelineInputs, PipelineOrchestrator, RunOutcome, RunStatus};
pub use report::RunReport;

#[cfg(test)]
mod test_common;
