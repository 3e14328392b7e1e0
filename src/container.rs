//! Running tools inside containers.

use std::{
    io::ErrorKind,
    path::PathBuf,
    process::{Command, Output, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{debug, info, trace};

use crate::error::PipelineError;

/// One containerized tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInvocation {
    /// Name of the pipeline stage, for diagnostics
    pub stage: String,
    /// Container image
    pub image: String,
    /// `(host, container)` bind mounts
    pub mounts: Vec<(PathBuf, PathBuf)>,
    /// Working directory inside the container
    pub workdir: PathBuf,
    /// Argument vector, first token selects the tool
    pub command: Vec<String>,
}

impl ContainerInvocation {
    /// An invocation with no mounts yet.
    pub fn new(
        stage: impl Into<String>,
        image: impl Into<String>,
        workdir: impl Into<PathBuf>,
        command: Vec<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            image: image.into(),
            mounts: vec![],
            workdir: workdir.into(),
            command,
        }
    }

    /// Add a `(host, container)` bind mount.
    pub fn mount(mut self, (host, container): (PathBuf, PathBuf)) -> Self {
        self.mounts.push((host, container));
        self
    }
}

/// What came back from one tool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    /// captured stdout
    pub stdout: String,
    /// captured stderr
    pub stderr: String,
    /// process exit code. Death by signal `n` is reported as `128 + n`.
    pub exit_code: i32,
}

impl RunResult {
    /// Whether the tool exited 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl From<Output> for RunResult {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: exit_code(&output.status),
        }
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Something that can run a [`ContainerInvocation`] to completion.
///
/// A nonzero exit is not an error at this level, it is returned in the
/// [`RunResult`]. Errors are reserved for not being able to run at all.
pub trait ContainerRuntime {
    /// Run the invocation and wait for it to exit.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::ToolInvocation`] with `exit_code: None` if the runtime
    ///   can't be launched
    /// - [`PipelineError::Cancelled`] if a termination signal arrived
    fn run(&self, invocation: &ContainerInvocation) -> Result<RunResult, PipelineError>;

    /// Version string of the runtime, used as an availability check.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ToolInvocation`] if the runtime is missing or broken.
    fn version(&self) -> Result<String, PipelineError>;

    /// Fetch `image` ahead of the first stage.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ToolInvocation`] if the pull fails.
    fn pull(&self, image: &str) -> Result<(), PipelineError>;
}

/// Process-wide cancellation flag, set by SIGINT, SIGTERM or SIGHUP.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Register the flag for termination signals.
    ///
    /// The first signal only sets the flag, so the running tool (which gets the
    /// same signal from the terminal) exits and the pipeline unwinds cleanly. A
    /// second signal terminates immediately.
    ///
    /// # Errors
    ///
    /// io errors from registering the handlers
    pub fn register_signals(&self) -> std::io::Result<()> {
        use signal_hook::{
            consts::{SIGHUP, SIGINT, SIGTERM},
            flag,
        };
        for sig in [SIGINT, SIGTERM, SIGHUP] {
            flag::register_conditional_shutdown(sig, 1, Arc::clone(&self.0))?;
            flag::register(sig, Arc::clone(&self.0))?;
        }
        Ok(())
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Has cancellation been requested?
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A podman or docker compatible command line runtime.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    executable: String,
    cancel: CancelFlag,
}

impl CliRuntime {
    /// Use `executable` (e.g. `podman`), aborting when `cancel` is set.
    pub fn new(executable: impl Into<String>, cancel: CancelFlag) -> Self {
        Self {
            executable: executable.into(),
            cancel,
        }
    }

    /// Arguments passed to the runtime executable for `invocation`.
    pub fn run_args(invocation: &ContainerInvocation) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        for (host, container) in &invocation.mounts {
            args.push("-v".to_string());
            args.push(format!("{}:{}", host.display(), container.display()));
        }
        args.push("-w".to_string());
        args.push(invocation.workdir.display().to_string());
        args.push(invocation.image.clone());
        args.extend(invocation.command.iter().cloned());
        args
    }

    fn output(&self, stage: &str, args: &[String]) -> Result<Output, PipelineError> {
        Command::new(&self.executable)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| PipelineError::ToolInvocation {
                stage: stage.to_string(),
                exit_code: None,
                stderr: match err.kind() {
                    ErrorKind::NotFound => {
                        format!("container runtime {} not found", self.executable)
                    }
                    _ => format!("could not launch {}: {err}", self.executable),
                },
            })
    }
}

impl ContainerRuntime for CliRuntime {
    fn run(&self, invocation: &ContainerInvocation) -> Result<RunResult, PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let args = Self::run_args(invocation);
        let mut line = vec![self.executable.as_str()];
        line.extend(args.iter().map(String::as_str));
        debug!(
            "{}: {}",
            invocation.stage,
            shlex::try_join(line.iter().copied()).unwrap_or_else(|_| line.join(" "))
        );

        let result = RunResult::from(self.output(&invocation.stage, &args)?);
        trace!("{} stdout:\n{}", invocation.stage, result.stdout);
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(result)
    }

    fn version(&self) -> Result<String, PipelineError> {
        let result = RunResult::from(self.output("preflight", &["--version".to_string()])?);
        if !result.success() {
            return Err(PipelineError::ToolInvocation {
                stage: "preflight".to_string(),
                exit_code: Some(result.exit_code),
                stderr: result.stderr,
            });
        }
        Ok(result.stdout.trim().to_string())
    }

    fn pull(&self, image: &str) -> Result<(), PipelineError> {
        info!("pulling {image}");
        let result =
            RunResult::from(self.output("preflight", &["pull".to_string(), image.to_string()])?);
        if !result.success() {
            return Err(PipelineError::ToolInvocation {
                stage: "preflight".to_string(),
                exit_code: Some(result.exit_code),
                stderr: result.stderr,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation() -> ContainerInvocation {
        ContainerInvocation::new(
            "flag_avg",
            "astronrd/linc:latest",
            "/data",
            vec!["DP3".to_string(), "/data/.flag_avg-x.parset".to_string()],
        )
        .mount((PathBuf::from("/scratch/obs"), PathBuf::from("/data")))
    }

    #[test]
    fn run_args_layout() {
        assert_eq!(
            CliRuntime::run_args(&invocation()),
            vec![
                "run",
                "--rm",
                "-v",
                "/scratch/obs:/data",
                "-w",
                "/data",
                "astronrd/linc:latest",
                "DP3",
                "/data/.flag_avg-x.parset",
            ]
        );
    }

    #[test]
    fn missing_runtime_is_a_tool_invocation_error() {
        let runtime = CliRuntime::new("/nonexistent/quickproc-runtime", CancelFlag::default());
        match runtime.run(&invocation()) {
            Err(PipelineError::ToolInvocation {
                stage, exit_code, ..
            }) => {
                assert_eq!(stage, "flag_avg");
                assert_eq!(exit_code, None);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(runtime.version().is_err());
    }

    #[test]
    fn cancelled_runtime_does_not_start() {
        let cancel = CancelFlag::default();
        cancel.cancel();
        let runtime = CliRuntime::new("true", cancel);
        assert!(matches!(
            runtime.run(&invocation()),
            Err(PipelineError::Cancelled)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_returned_not_raised() {
        // `false` ignores its arguments and exits 1
        let runtime = CliRuntime::new("false", CancelFlag::default());
        let result = runtime.run(&invocation()).unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, 1);
    }
}
