//! Helpers shared by the unit tests.

use std::{
    cell::{Cell, RefCell},
    fs,
    path::{Path, PathBuf},
};

use lazy_static::lazy_static;
use regex::Regex;

use crate::{
    container::{ContainerInvocation, ContainerRuntime, RunResult},
    error::PipelineError,
    pipeline::PipelineInputs,
};

lazy_static! {
    static ref RE_OUTPUTVIS: Regex = Regex::new(r"outputvis='([^']*)'").unwrap();
}

/// A WSClean source list with one source at (10°, 10°), one 2° away from it
/// and one far away.
pub const SOURCE_LIST: &str = "\
Format = Name, Type, Ra, Dec, I, SpectralIndex, LogarithmicSI, ReferenceFrequency='55000000', MajorAxis, MinorAxis, Orientation
s0c0,POINT,00:40:00.000,+10.00.00.000,1.5,[-0.7],false,55000000,,,
s0c1,POINT,00:48:00.000,+10.30.00.000,0.25,[-0.7],false,55000000,,,
s1c0,GAUSSIAN,08:28:05.152,+39.35.08.511,0.000748,[-0.00225],false,55000000,60,40,10
";

/// Raw data named like an LWA observation, a gain table next door, and the
/// working directory defaulting to the raw data's parent.
pub fn make_inputs(dir: &Path) -> PipelineInputs {
    let raw_ms = dir.join("obs").join("20240519_173002_55MHz.ms");
    let gain_table = dir.join("cal").join("20240519_bandpass.bcal");
    fs::create_dir_all(&raw_ms).unwrap();
    fs::create_dir_all(&gain_table).unwrap();
    PipelineInputs::new(&raw_ms, &gain_table, "proc", None).unwrap()
}

type Handler = Box<dyn Fn(&ContainerInvocation, &dyn Fn(&str) -> PathBuf) -> Option<RunResult>>;

/// A [`ContainerRuntime`] that pretends to be DP3, WSClean and CASA by
/// creating the files they would write, through the invocation's mounts.
///
/// A handler can take over any invocation. It gets a function mapping
/// container paths back to host paths, and returning `None` falls through to
/// the default emulation.
#[derive(Default)]
pub struct ToolEmulator {
    invocations: RefCell<Vec<ContainerInvocation>>,
    handler: Option<Handler>,
    solves: Cell<u32>,
}

impl ToolEmulator {
    /// Intercept invocations with `handler`.
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ContainerInvocation, &dyn Fn(&str) -> PathBuf) -> Option<RunResult> + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Every invocation so far
    pub fn invocations(&self) -> Vec<ContainerInvocation> {
        self.invocations.borrow().clone()
    }

    fn emulate(&self, invocation: &ContainerInvocation, host: &dyn Fn(&str) -> PathBuf) -> RunResult {
        let command = &invocation.command;
        let result = match command.first().map(String::as_str) {
            Some("DP3") => self.dp3(&host(&command[1]), host),
            Some("wsclean") => wsclean(command, host),
            Some("python3") => casa(&host(&command[1]), host),
            // anything else succeeds without writing
            _ => Ok(()),
        };
        match result {
            Ok(()) => RunResult::default(),
            Err(stderr) => RunResult {
                exit_code: 127,
                stderr,
                ..RunResult::default()
            },
        }
    }

    fn dp3(&self, parset: &Path, host: &dyn Fn(&str) -> PathBuf) -> Result<(), String> {
        let text = fs::read_to_string(parset).map_err(|e| e.to_string())?;
        let value = |key: &str| {
            text.lines()
                .filter_map(|line| line.split_once(" = "))
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        };
        if value("msin").is_none() {
            return Err("msin not set".to_string());
        }
        match value("msout") {
            Some(msout) if msout != "." => {
                fs::create_dir_all(host(&msout)).map_err(|e| e.to_string())?;
            }
            _ => {}
        }
        if let Some(parmdb) = value("cal.parmdb") {
            self.solves.set(self.solves.get() + 1);
            fs::write(host(&parmdb), format!("solution {}\n", self.solves.get()))
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

fn wsclean(command: &[String], host: &dyn Fn(&str) -> PathBuf) -> Result<(), String> {
    let name = command
        .iter()
        .position(|arg| arg == "-name")
        .and_then(|idx| command.get(idx + 1))
        .ok_or("missing -name")?;
    let prefix = host(name).display().to_string();
    for suffix in ["-image.fits", "-model.fits"] {
        fs::write(format!("{prefix}{suffix}"), "SIMPLE  =                    T").map_err(|e| e.to_string())?;
    }
    if command.iter().any(|arg| arg == "-save-source-list") {
        fs::write(format!("{prefix}-sources.txt"), SOURCE_LIST).map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn casa(script: &Path, host: &dyn Fn(&str) -> PathBuf) -> Result<(), String> {
    let text = fs::read_to_string(script).map_err(|e| e.to_string())?;
    let caps = RE_OUTPUTVIS.captures(&text).ok_or("no outputvis")?;
    fs::create_dir_all(host(&caps[1])).map_err(|e| e.to_string())
}

/// Map a container path back to the host through `mounts`.
fn host_path(mounts: &[(PathBuf, PathBuf)], container: &str) -> PathBuf {
    let container = Path::new(container);
    mounts
        .iter()
        .find_map(|(host, mount)| container.strip_prefix(mount).ok().map(|rel| host.join(rel)))
        .unwrap_or_else(|| container.to_path_buf())
}

impl ContainerRuntime for ToolEmulator {
    fn run(&self, invocation: &ContainerInvocation) -> Result<RunResult, PipelineError> {
        self.invocations.borrow_mut().push(invocation.clone());
        let host = |path: &str| host_path(&invocation.mounts, path);
        if let Some(handler) = &self.handler {
            if let Some(result) = handler(invocation, &host) {
                return Ok(result);
            }
        }
        Ok(self.emulate(invocation, &host))
    }

    fn version(&self) -> Result<String, PipelineError> {
        Ok("podman version 4.9.3 (emulated)".to_string())
    }

    fn pull(&self, _image: &str) -> Result<(), PipelineError> {
        Ok(())
    }
}
