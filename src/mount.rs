//! Mapping host paths into a single container bind mount.
//!
//! Every container invocation gets exactly one bind mount. Its host side is the
//! deepest directory that contains every path the invocation touches, and it
//! appears inside the container at [`CONTAINER_MOUNT_POINT`].

use std::path::{Component, Path, PathBuf};

use itertools::Itertools;
use log::warn;
use thiserror::Error;

/// Where the common host directory is mounted inside every container.
pub const CONTAINER_MOUNT_POINT: &str = "/data";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
/// Errors from resolving or translating a [`MountMapping`]
pub enum PathResolutionError {
    /// No paths were given.
    #[error("cannot resolve a mount for an empty set of paths")]
    Empty,

    /// Mount resolution only works on absolute paths.
    #[error("path {0:?} is not absolute")]
    NotAbsolute(PathBuf),

    /// The path is not below the mapping's host root.
    #[error("path {path:?} is outside the mounted directory {root:?}")]
    OutsideRoot {
        /// the offending path
        path: PathBuf,
        /// the mapping's root
        root: PathBuf,
    },

    /// The only common ancestor is the filesystem root.
    #[error("paths share no directory below / and mounting the root is disabled: {}", .paths.iter().map(|p| p.display()).join(", "))]
    RootMount {
        /// the paths that were being mounted
        paths: Vec<PathBuf>,
    },
}

/// Resolve `.` and `..` components without touching the filesystem.
///
/// `..` at the root stays at the root.
pub fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            other => result.push(other.as_os_str()),
        }
    }
    result
}

/// A host directory bind-mounted at [`CONTAINER_MOUNT_POINT`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountMapping {
    host_root: PathBuf,
    container_mount_point: PathBuf,
}

impl MountMapping {
    /// Find the deepest directory containing all of `paths`.
    ///
    /// Each path is treated as a file or directory entry, so the candidate
    /// directory for a single path is its parent. Paths that do not exist yet
    /// (outputs) are fine.
    ///
    /// # Errors
    ///
    /// - [`PathResolutionError::Empty`] if `paths` is empty
    /// - [`PathResolutionError::NotAbsolute`] for any relative path
    pub fn resolve<I, P>(paths: I) -> Result<Self, PathResolutionError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut normalized = Vec::new();
        for path in paths {
            let path = path.as_ref();
            if !path.is_absolute() {
                return Err(PathResolutionError::NotAbsolute(path.to_path_buf()));
            }
            normalized.push(normalize(path));
        }

        let mut host_root: Option<PathBuf> = None;
        for path in &normalized {
            let parent = path.parent().unwrap_or(path);
            match host_root.as_mut() {
                None => host_root = Some(parent.to_path_buf()),
                // Path::starts_with compares whole components
                Some(root) => {
                    while !parent.starts_with(root.as_path()) {
                        if !root.pop() {
                            break;
                        }
                    }
                }
            }
        }
        let host_root = host_root.ok_or(PathResolutionError::Empty)?;

        let mapping = Self {
            host_root,
            container_mount_point: PathBuf::from(CONTAINER_MOUNT_POINT),
        };
        if mapping.is_root() {
            warn!(
                "paths share no common directory below /, the whole filesystem would be mounted: {}",
                normalized.iter().map(|p| p.display()).join(", ")
            );
        }
        Ok(mapping)
    }

    /// The host side of the bind mount
    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    /// The container side of the bind mount
    pub fn container_mount_point(&self) -> &Path {
        &self.container_mount_point
    }

    /// Whether the mapping mounts the filesystem root.
    pub fn is_root(&self) -> bool {
        self.host_root.parent().is_none()
    }

    /// The part of `host_path` below the host root, with no leading separator.
    ///
    /// # Errors
    ///
    /// [`PathResolutionError::OutsideRoot`] if `host_path` is not under the root.
    pub fn relative(&self, host_path: &Path) -> Result<PathBuf, PathResolutionError> {
        let normalized = normalize(host_path);
        normalized
            .strip_prefix(&self.host_root)
            .map(Path::to_path_buf)
            .map_err(|_| PathResolutionError::OutsideRoot {
                path: host_path.to_path_buf(),
                root: self.host_root.clone(),
            })
    }

    /// Translate a host path to where the container will see it.
    ///
    /// # Errors
    ///
    /// [`PathResolutionError::OutsideRoot`] if `host_path` is not under the root.
    pub fn translate(&self, host_path: &Path) -> Result<PathBuf, PathResolutionError> {
        let relative = self.relative(host_path)?;
        if relative.as_os_str().is_empty() {
            Ok(self.container_mount_point.clone())
        } else {
            Ok(self.container_mount_point.join(relative))
        }
    }

    /// `(host, container)` pair for the runtime's bind mount.
    pub fn as_bind(&self) -> (PathBuf, PathBuf) {
        (self.host_root.clone(), self.container_mount_point.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_finds_deepest_common_directory() {
        let mapping = MountMapping::resolve([
            "/data/a/raw.ms",
            "/data/a/sol.h5",
            "/data/b/out.ms",
        ])
        .unwrap();
        assert_eq!(mapping.host_root(), Path::new("/data"));
        assert_eq!(
            mapping.relative(Path::new("/data/a/raw.ms")).unwrap(),
            PathBuf::from("a/raw.ms")
        );
        assert_eq!(
            mapping.translate(Path::new("/data/b/out.ms")).unwrap(),
            PathBuf::from("/data/b/out.ms")
        );
    }

    #[test]
    fn resolve_single_path_uses_parent() {
        let mapping = MountMapping::resolve(["/scratch/obs/raw.ms"]).unwrap();
        assert_eq!(mapping.host_root(), Path::new("/scratch/obs"));
        assert_eq!(
            mapping.translate(Path::new("/scratch/obs/raw.ms")).unwrap(),
            PathBuf::from("/data/raw.ms")
        );
    }

    #[test]
    fn resolve_is_component_wise_not_string_prefix() {
        let mapping = MountMapping::resolve(["/scratch/obs1/a.ms", "/scratch/obs10/b.ms"]).unwrap();
        assert_eq!(mapping.host_root(), Path::new("/scratch"));
    }

    #[test]
    fn resolve_normalizes_dot_components() {
        let mapping =
            MountMapping::resolve(["/scratch/obs/./x/../raw.ms", "/scratch/obs/sol.h5"]).unwrap();
        assert_eq!(mapping.host_root(), Path::new("/scratch/obs"));
    }

    #[test]
    fn resolve_disjoint_trees_falls_back_to_root() {
        let mapping = MountMapping::resolve(["/home/u/raw.ms", "/scratch/sol.h5"]).unwrap();
        assert!(mapping.is_root());
        assert_eq!(
            mapping.translate(Path::new("/home/u/raw.ms")).unwrap(),
            PathBuf::from("/data/home/u/raw.ms")
        );
    }

    #[test]
    fn resolve_empty_is_an_error() {
        let paths: [&str; 0] = [];
        assert_eq!(
            MountMapping::resolve(paths),
            Err(PathResolutionError::Empty)
        );
    }

    #[test]
    fn resolve_relative_is_an_error() {
        assert!(matches!(
            MountMapping::resolve(["/data/a.ms", "b.ms"]),
            Err(PathResolutionError::NotAbsolute(_))
        ));
    }

    #[test]
    fn translate_outside_root_is_an_error() {
        let mapping = MountMapping::resolve(["/data/a/raw.ms"]).unwrap();
        assert!(matches!(
            mapping.translate(Path::new("/data/b/other.ms")),
            Err(PathResolutionError::OutsideRoot { .. })
        ));
    }

    #[test]
    fn translate_root_itself() {
        let mapping = MountMapping::resolve(["/data/a/raw.ms"]).unwrap();
        assert_eq!(
            mapping.translate(Path::new("/data/a")).unwrap(),
            PathBuf::from(CONTAINER_MOUNT_POINT)
        );
    }
}
