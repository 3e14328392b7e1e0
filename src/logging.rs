//! Console logging, mirrored into a run-scoped log file.
//!
//! The logger writes every record to stderr. While a [`RunLogGuard`] is alive
//! the same bytes are appended to the run's `<prefix>_pipeline.log`.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    sync::{Mutex, PoisonError},
};

use lazy_static::lazy_static;

lazy_static! {
    static ref RUN_LOG: Mutex<Option<File>> = Mutex::new(None);
}

/// Writes to stderr and, when attached, the run log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TeeWriter;

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        let mut slot = RUN_LOG.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(file) = slot.as_mut() {
            // a full disk must not take the console down with it
            if file.write_all(buf).is_err() {
                *slot = None;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(file) = RUN_LOG
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            file.flush()?;
        }
        Ok(())
    }
}

/// Detaches the run log when dropped.
#[derive(Debug)]
#[must_use = "the run log is detached when the guard is dropped"]
pub struct RunLogGuard {
    _private: (),
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        let mut slot = RUN_LOG.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut file) = slot.take() {
            let _ = file.flush();
        }
    }
}

/// Start appending log output to `path`, replacing any attached log.
///
/// # Errors
///
/// io errors from opening `path`
pub fn attach_run_log(path: &Path) -> io::Result<RunLogGuard> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    *RUN_LOG.lock().unwrap_or_else(PoisonError::into_inner) = Some(file);
    Ok(RunLogGuard { _private: () })
}

/// Initialise `env_logger` at level `info` (`RUST_LOG` overrides), writing
/// through a [`TeeWriter`]. Later calls do nothing.
#[cfg(feature = "cli")]
pub fn init_logger() {
    use env_logger::{Builder, Env, Target, DEFAULT_FILTER_ENV};
    let _ = Builder::from_env(Env::default().filter_or(DEFAULT_FILTER_ENV, "info"))
        .target(Target::Pipe(Box::new(TeeWriter)))
        .try_init();
}
