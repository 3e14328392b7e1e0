use std::{
    fs,
    path::{Path, PathBuf},
};

/// Inputs of a run laid out the way an LWA observation arrives.
pub struct Layout {
    pub raw_ms: PathBuf,
    pub gain_table: PathBuf,
}

pub fn make_layout(dir: &Path) -> Layout {
    let raw_ms = dir.join("obs").join("20240519_173002_55MHz.ms");
    let gain_table = dir.join("cal").join("20240519_bandpass.bcal");
    fs::create_dir_all(&raw_ms).unwrap();
    fs::create_dir_all(&gain_table).unwrap();
    Layout { raw_ms, gain_table }
}

/// A container runtime that answers `--version` and `pull`, but whose tools
/// all fail with `stderr`.
#[cfg(unix)]
pub fn failing_runtime(dir: &Path, stderr: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("stubman");
    let script = format!(
        "#!/bin/sh\n\
         case \"$1\" in\n\
         --version) echo 'stubman version 1.0.0'; exit 0 ;;\n\
         pull) exit 0 ;;\n\
         run) echo '{stderr}' >&2; exit 1 ;;\n\
         esac\n\
         exit 2\n"
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}
