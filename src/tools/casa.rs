//! CASA bandpass application, run as a generated python script.

use std::path::{Path, PathBuf};

use super::container_str;
use crate::{
    mount::{MountMapping, PathResolutionError},
    stage::ToolCommand,
};

/// Quote `value` as a single-quoted python string literal.
fn py_str(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Split the raw data into a new measurement set and apply the bandpass table.
#[derive(Debug, Clone, PartialEq)]
pub struct CasaBandpassCommand {
    image: String,
    raw_ms: PathBuf,
    gain_table: PathBuf,
    output_ms: PathBuf,
    applymode: String,
    flag_uvrange: Option<String>,
}

impl CasaBandpassCommand {
    /// Apply `gain_table` to `raw_ms`, writing `output_ms`.
    pub fn new(
        image: impl Into<String>,
        raw_ms: impl Into<PathBuf>,
        gain_table: impl Into<PathBuf>,
        output_ms: impl Into<PathBuf>,
        applymode: impl Into<String>,
    ) -> Self {
        Self {
            image: image.into(),
            raw_ms: raw_ms.into(),
            gain_table: gain_table.into(),
            output_ms: output_ms.into(),
            applymode: applymode.into(),
            flag_uvrange: None,
        }
    }

    /// Flag `uvrange` on the split data before applying.
    #[must_use]
    pub fn flag_uvrange(mut self, uvrange: Option<String>) -> Self {
        self.flag_uvrange = uvrange;
        self
    }

    /// The python script, with container paths from `mapping`.
    ///
    /// # Errors
    ///
    /// [`PathResolutionError::OutsideRoot`] if a path isn't in the mapping.
    pub fn script(&self, mapping: &MountMapping) -> Result<String, PathResolutionError> {
        let raw = py_str(&container_str(mapping, &self.raw_ms)?);
        let out = py_str(&container_str(mapping, &self.output_ms)?);
        let table = py_str(&container_str(mapping, &self.gain_table)?);

        let mut lines = vec![
            "import casatasks".to_string(),
            String::new(),
            format!("casatasks.split(vis={raw}, outputvis={out}, datacolumn='data')"),
        ];
        if let Some(uvrange) = &self.flag_uvrange {
            lines.push(format!(
                "casatasks.flagdata(vis={out}, mode='manual', uvrange={})",
                py_str(uvrange)
            ));
        }
        lines.push(format!(
            "casatasks.applycal(vis={out}, gaintable=[{table}], applymode={})",
            py_str(&self.applymode)
        ));
        let mut script = lines.join("\n");
        script.push('\n');
        Ok(script)
    }
}

impl ToolCommand for CasaBandpassCommand {
    fn image(&self) -> &str {
        &self.image
    }

    fn host_paths(&self) -> Vec<PathBuf> {
        vec![
            self.raw_ms.clone(),
            self.gain_table.clone(),
            self.output_ms.clone(),
        ]
    }

    fn config_suffix(&self) -> Option<&'static str> {
        Some(".py")
    }

    fn render_config(&self, mapping: &MountMapping) -> Result<String, PathResolutionError> {
        self.script(mapping)
    }

    fn argv(
        &self,
        _mapping: &MountMapping,
        config: Option<&Path>,
    ) -> Result<Vec<String>, PathResolutionError> {
        let mut argv = vec!["python3".to_string()];
        argv.extend(config.map(|path| path.display().to_string()));
        Ok(argv)
    }
}
