//! Finding the newest observation and its bandpass table, and staging both
//! into a fresh processing directory.
//!
//! The realtime archive is laid out as `<data_root>/<date>/<hour>/<file>`.
//! Directory names sort chronologically, so the newest observation is the
//! last file of the last hour of the last date. Bandpass tables are named
//! `<anything>_<band>.bcal` and the newest one for a band sorts last.

use std::{
    fs, io,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use log::{debug, info};
use thiserror::Error;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::pipeline::PipelineInputs;

/// Where the raw data goes inside a processing directory
pub const SLOW_DIR: &str = "slow";
/// Where the bandpass table goes inside a processing directory
pub const CALTABLE_DIR: &str = "caltable";
/// Length of the random processing directory name
const PROC_ID_LEN: usize = 10;

#[derive(Error, Debug)]
/// Errors while looking for the newest inputs
pub enum DiscoverError {
    /// `<data_root>` has no date directories.
    #[error("no date directories found in {0:?}")]
    NoDateDirs(PathBuf),

    /// The newest date has no hour directories.
    #[error("no hour directories found in {0:?}")]
    NoHourDirs(PathBuf),

    /// The newest hour is empty.
    #[error("no files found in {0:?}")]
    NoFiles(PathBuf),

    /// No `*_<band>.bcal` in the caltable directory.
    #[error("no calibration table found for band {band} in {dir:?}")]
    NoCalTable {
        /// directory searched
        dir: PathBuf,
        /// band name, e.g. `55MHz`
        band: String,
    },

    /// io failure while listing or copying
    #[error("could not access {path:?}: {source}")]
    Io {
        /// offending path
        path: PathBuf,
        /// cause
        source: io::Error,
    },

    /// failure while walking a tree being copied
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> DiscoverError + '_ {
    move |source| DiscoverError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Sorted names of the entries of `dir`, only directories if `dirs_only`.
fn sorted_entries(dir: &Path, dirs_only: bool) -> Result<Vec<String>, DiscoverError> {
    let mut names = vec![];
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry.map_err(io_error(dir))?;
        if dirs_only && !entry.path().is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// The newest `<data_root>/<date>/<hour>/<file>`.
///
/// # Errors
///
/// [`DiscoverError::NoDateDirs`], [`DiscoverError::NoHourDirs`] or
/// [`DiscoverError::NoFiles`] when a level is empty, [`DiscoverError::Io`] if
/// a directory can't be listed.
pub fn newest_observation(data_root: &Path) -> Result<PathBuf, DiscoverError> {
    let date = sorted_entries(data_root, true)?
        .pop()
        .ok_or_else(|| DiscoverError::NoDateDirs(data_root.to_path_buf()))?;
    let date_path = data_root.join(date);

    let hour = sorted_entries(&date_path, true)?
        .pop()
        .ok_or_else(|| DiscoverError::NoHourDirs(date_path.clone()))?;
    let hour_path = date_path.join(hour);

    // measurement sets are directories, so anything counts here
    let file = sorted_entries(&hour_path, false)?
        .pop()
        .ok_or_else(|| DiscoverError::NoFiles(hour_path.clone()))?;
    Ok(hour_path.join(file))
}

/// The newest `*_<band>.bcal` in `caltable_dir`.
///
/// # Errors
///
/// [`DiscoverError::NoCalTable`] if there is none, [`DiscoverError::Io`] if
/// the directory can't be listed.
pub fn caltable_for_band(caltable_dir: &Path, band: &str) -> Result<PathBuf, DiscoverError> {
    let suffix = format!("_{band}.bcal");
    sorted_entries(caltable_dir, false)?
        .into_iter()
        .filter(|name| name.ends_with(&suffix))
        .last()
        .map(|name| caltable_dir.join(name))
        .ok_or_else(|| DiscoverError::NoCalTable {
            dir: caltable_dir.to_path_buf(),
            band: band.to_string(),
        })
}

/// Copy `src` to `dst`, recursing into directories.
fn copy_tree(src: &Path, dst: &Path) -> Result<(), DiscoverError> {
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src).unwrap_or(Path::new(""));
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(io_error(&target))?;
        } else {
            fs::copy(entry.path(), &target).map_err(io_error(&target))?;
        }
    }
    Ok(())
}

/// The newest observation and bandpass table, and where they will be
/// processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestInputs {
    /// observation found under the data root
    pub source_ms: PathBuf,
    /// bandpass table found for the band
    pub source_gain_table: PathBuf,
    /// `<proc_root>/<random id>`
    pub proc_dir: PathBuf,
    /// how long to wait for the observation to finish writing
    pub settle: Duration,
}

impl LatestInputs {
    /// Find the newest inputs and pick a new processing directory under
    /// `proc_root`. Nothing is written.
    ///
    /// # Errors
    ///
    /// Any [`DiscoverError`] from [`newest_observation`] or
    /// [`caltable_for_band`].
    pub fn discover(
        data_root: &Path,
        caltable_dir: &Path,
        band: &str,
        proc_root: &Path,
        settle: Duration,
    ) -> Result<Self, DiscoverError> {
        let source_ms = newest_observation(data_root)?;
        let source_gain_table = caltable_for_band(caltable_dir, band)?;
        info!(
            "newest data {}, caltable {}",
            source_ms.display(),
            source_gain_table.display()
        );
        let id = Uuid::new_v4().simple().to_string();
        Ok(Self {
            source_ms,
            source_gain_table,
            proc_dir: proc_root.join(&id[..PROC_ID_LEN]),
            settle,
        })
    }

    fn staged(&self, subdir: &str, source: &Path) -> PathBuf {
        let mut path = self.proc_dir.join(subdir);
        if let Some(name) = source.file_name() {
            path.push(name);
        }
        path
    }

    /// `<proc_dir>/slow/<observation>`
    pub fn staged_ms(&self) -> PathBuf {
        self.staged(SLOW_DIR, &self.source_ms)
    }

    /// `<proc_dir>/caltable/<table>`
    pub fn staged_gain_table(&self) -> PathBuf {
        self.staged(CALTABLE_DIR, &self.source_gain_table)
    }

    /// The observation's file name up to the first `.`
    pub fn output_prefix(&self) -> String {
        self.source_ms
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.split('.').next())
            .filter(|stem| !stem.is_empty())
            .unwrap_or("proc")
            .to_string()
    }

    /// Inputs for a run over the staged copies, writing into the processing
    /// directory unless `working_dir` says otherwise.
    ///
    /// # Errors
    ///
    /// if the current directory can't be read
    pub fn pipeline_inputs(&self, working_dir: Option<&Path>) -> io::Result<PipelineInputs> {
        PipelineInputs::new(
            &self.staged_ms(),
            &self.staged_gain_table(),
            self.output_prefix(),
            Some(working_dir.unwrap_or(&self.proc_dir)),
        )
    }

    /// Create the processing directory, wait for the observation to settle,
    /// then copy both inputs in.
    ///
    /// # Errors
    ///
    /// [`DiscoverError::Io`] or [`DiscoverError::Walk`]
    pub fn stage(&self) -> Result<(), DiscoverError> {
        for subdir in [CALTABLE_DIR, SLOW_DIR] {
            let dir = self.proc_dir.join(subdir);
            fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        }
        if !self.settle.is_zero() {
            debug!("waiting {:?} for {} to settle", self.settle, self.source_ms.display());
            thread::sleep(self.settle);
        }
        copy_tree(&self.source_gain_table, &self.staged_gain_table())?;
        copy_tree(&self.source_ms, &self.staged_ms())?;
        info!("staged inputs into {}", self.proc_dir.display());
        Ok(())
    }
}
