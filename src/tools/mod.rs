//! Command builders for the external tools: DP3, WSClean and CASA.
//!
//! Each builder holds host paths and typed parameters, and implements
//! [`crate::stage::ToolCommand`] so a stage can mount, render and run it.

pub mod casa;
pub mod dp3;
pub mod wsclean;

pub use casa::CasaBandpassCommand;
pub use dp3::{Dp3Command, Dp3Operation};
pub use wsclean::{WscleanArgs, WscleanArgsBuilder, WscleanCommand};

use std::path::Path;

use crate::mount::{MountMapping, PathResolutionError};

/// Container path of `host_path` as a string.
pub(crate) fn container_str(
    mapping: &MountMapping,
    host_path: &Path,
) -> Result<String, PathResolutionError> {
    mapping
        .translate(host_path)
        .map(|path| path.display().to_string())
}
