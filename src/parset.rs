//! Rendering DP3 parsets and managing transient configuration files.

use std::{
    fmt::{self, Display},
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use itertools::Itertools;
use log::{debug, trace};
use tempfile::{Builder as TempBuilder, TempPath};

use crate::error::PipelineError;

/// A typed parset value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsetValue {
    /// rendered as `true` / `false`
    Bool(bool),
    /// integer
    Int(i64),
    /// rendered with the shortest round-trip representation
    Float(f64),
    /// verbatim string
    Str(String),
    /// a path as the container sees it, rendered verbatim
    Path(PathBuf),
    /// `[a, b, c]`
    List(Vec<ParsetValue>),
}

impl Display for ParsetValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Path(p) => write!(f, "{}", p.display()),
            Self::List(items) => write!(f, "[{}]", items.iter().join(", ")),
        }
    }
}

impl From<bool> for ParsetValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParsetValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for ParsetValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for ParsetValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ParsetValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ParsetValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<PathBuf> for ParsetValue {
    fn from(value: PathBuf) -> Self {
        Self::Path(value)
    }
}

impl From<&Path> for ParsetValue {
    fn from(value: &Path) -> Self {
        Self::Path(value.to_path_buf())
    }
}

/// Builder for a DP3 parset.
///
/// Input/output keys (`msin`, `msout`, `msin.datacolumn`, ...) come first, then
/// the `steps` list, then one block of `step.param` lines per step, each in
/// insertion order.
///
/// ```
/// use quickproc::parset::Parset;
///
/// let text = Parset::default()
///     .msin("/data/obs.ms")
///     .msout(".")
///     .step("cal", "gaincal")
///     .param("cal", "maxiter", 100_u32)
///     .render();
/// assert_eq!(
///     text,
///     "msin = /data/obs.ms\nmsout = .\nsteps = [cal]\ncal.type = gaincal\ncal.maxiter = 100\n"
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parset {
    io: IndexMap<String, ParsetValue>,
    steps: IndexMap<String, IndexMap<String, ParsetValue>>,
}

impl Parset {
    /// Set `msin`
    pub fn msin(self, value: impl Into<ParsetValue>) -> Self {
        self.io("msin", value)
    }

    /// Set `msout`
    pub fn msout(self, value: impl Into<ParsetValue>) -> Self {
        self.io("msout", value)
    }

    /// Set a top-level key such as `msin.datacolumn`.
    pub fn io(mut self, key: &str, value: impl Into<ParsetValue>) -> Self {
        self.io.insert(key.to_string(), value.into());
        self
    }

    /// Append a step of the given DP3 type.
    pub fn step(mut self, name: &str, step_type: &str) -> Self {
        self.steps
            .entry(name.to_string())
            .or_default()
            .insert("type".to_string(), step_type.into());
        self
    }

    /// Set a parameter of a step, adding the step if needed.
    pub fn param(mut self, step: &str, key: &str, value: impl Into<ParsetValue>) -> Self {
        self.steps
            .entry(step.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
        self
    }

    /// Render the parset text.
    pub fn render(&self) -> String {
        let mut lines = Vec::with_capacity(self.io.len() + 1 + self.steps.len() * 4);
        for (key, value) in &self.io {
            lines.push(format!("{key} = {value}"));
        }
        lines.push(format!("steps = [{}]", self.steps.keys().join(", ")));
        for (step, params) in &self.steps {
            for (key, value) in params {
                lines.push(format!("{step}.{key} = {value}"));
            }
        }
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}

impl Display for Parset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// A configuration file that only lives for one tool invocation.
///
/// The file is deleted when this is dropped, however the stage ends.
#[derive(Debug)]
pub struct TransientConfig {
    path: TempPath,
}

impl TransientConfig {
    /// Reserve a uniquely named, empty file in `dir`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ConfigWrite`] if the file can't be created.
    pub fn create(dir: &Path, stage_name: &str, suffix: &str) -> Result<Self, PipelineError> {
        let file = TempBuilder::new()
            .prefix(&format!(".{stage_name}-"))
            .suffix(suffix)
            .tempfile_in(dir)
            .map_err(|source| PipelineError::ConfigWrite {
                path: dir.join(format!(".{stage_name}-*{suffix}")),
                source,
            })?;
        let path = file.into_temp_path();
        trace!("reserved transient config {}", path.display());
        Ok(Self { path })
    }

    /// Create and fill a transient config in one go.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ConfigWrite`] if the file can't be created or written.
    pub fn write(
        dir: &Path,
        stage_name: &str,
        suffix: &str,
        text: &str,
    ) -> Result<Self, PipelineError> {
        let config = Self::create(dir, stage_name, suffix)?;
        config.fill(text)?;
        Ok(config)
    }

    /// Overwrite the file's contents with `text`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ConfigWrite`] on io failure.
    pub fn fill(&self, text: &str) -> Result<(), PipelineError> {
        let wrap = |source| PipelineError::ConfigWrite {
            path: self.path.to_path_buf(),
            source,
        };
        let mut file = File::create(&self.path).map_err(wrap)?;
        file.write_all(text.as_bytes()).map_err(wrap)?;
        file.sync_all().map_err(wrap)?;
        debug!("wrote {}:\n{}", self.path.display(), text.trim_end());
        Ok(())
    }

    /// Host path of the file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn flag_avg() -> Parset {
        Parset::default()
            .msin("/data/in.ms")
            .io("msin.datacolumn", "CORRECTED_DATA")
            .msout("/data/out.ms")
            .io("msout.writefullresflag", false)
            .step("flag", "aoflagger")
            .param("flag", "strategy", "/usr/local/share/linc/rfistrategies/lofar-default.lua")
            .param("flag", "keepstatistics", false)
            .step("avg", "averager")
            .param("avg", "freqstep", 3_u32)
    }

    #[test]
    fn render_orders_io_then_steps_then_params() {
        let expected = "\
msin = /data/in.ms
msin.datacolumn = CORRECTED_DATA
msout = /data/out.ms
msout.writefullresflag = false
steps = [flag, avg]
flag.type = aoflagger
flag.strategy = /usr/local/share/linc/rfistrategies/lofar-default.lua
flag.keepstatistics = false
avg.type = averager
avg.freqstep = 3
";
        assert_eq!(flag_avg().render(), expected);
    }

    #[test]
    fn render_is_deterministic() {
        let a = flag_avg().render();
        let b = flag_avg().render();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn value_formatting() {
        assert_eq!(ParsetValue::from(1e-4).to_string(), "0.0001");
        assert_eq!(ParsetValue::from(1e-10).to_string(), "1e-10");
        assert_eq!(ParsetValue::from(10.0).to_string(), "10.0");
        assert_eq!(ParsetValue::from(true).to_string(), "true");
        assert_eq!(
            ParsetValue::List(vec!["123.4deg".into(), "-5.1deg".into()]).to_string(),
            "[123.4deg, -5.1deg]"
        );
        assert_eq!(
            ParsetValue::from(PathBuf::from("/data/sol.h5")).to_string(),
            "/data/sol.h5"
        );
    }

    #[test]
    fn transient_config_is_removed_on_drop() {
        let tmp_dir = tempdir().unwrap();
        let path = {
            let config =
                TransientConfig::write(tmp_dir.path(), "flag_avg", ".parset", "msin = x\n").unwrap();
            let path = config.path().to_path_buf();
            assert!(path.exists());
            assert_eq!(std::fs::read_to_string(&path).unwrap(), "msin = x\n");
            let name = path.file_name().unwrap().to_str().unwrap();
            assert!(name.starts_with(".flag_avg-"));
            assert!(name.ends_with(".parset"));
            path
        };
        assert!(!path.exists());
    }

    #[test]
    fn transient_config_is_removed_on_unwind() {
        let tmp_dir = tempdir().unwrap();
        let dir = tmp_dir.path().to_path_buf();
        let result = std::panic::catch_unwind(|| {
            let _config = TransientConfig::write(&dir, "subtract", ".parset", "x").unwrap();
            panic!("tool blew up");
        });
        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(tmp_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn transient_config_write_failure() {
        let tmp_dir = tempdir().unwrap();
        let missing = tmp_dir.path().join("nope");
        assert!(matches!(
            TransientConfig::write(&missing, "bandpass", ".py", "x"),
            Err(PipelineError::ConfigWrite { .. })
        ));
    }
}
