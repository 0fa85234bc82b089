//! Mount validation against a workspace's allowlist.
//!
//! Every host directory a sandbox sees must resolve (after following
//! symlinks and `..`) to a location under one of the workspace's allowed
//! roots. Write access additionally requires a read-write root.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Path components that are never mounted, even below an allowed root.
const BLOCKED_COMPONENTS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".aws",
    ".azure",
    ".gcloud",
    ".kube",
    ".docker",
    ".env",
    ".netrc",
    ".npmrc",
    ".pypirc",
    "credentials",
    "id_rsa",
    "id_ed25519",
    "private_key",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    #[default]
    Ro,
    Rw,
}

impl MountMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountMode::Ro => "ro",
            MountMode::Rw => "rw",
        }
    }
}

/// A requested bind mount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    #[serde(default)]
    pub mode: MountMode,
}

/// One allowlist entry of a workspace.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AllowedRoot {
    pub path: PathBuf,
    #[serde(default)]
    pub read_write: bool,
}

/// A mount that passed policy, with its host path canonicalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub mode: MountMode,
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("mount `{path}` rejected: {reason}")]
pub struct MountRejection {
    pub path: String,
    pub reason: String,
}

impl MountRejection {
    fn new(path: &Path, reason: impl Into<String>) -> Self {
        Self {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}

/// Read-only view of a workspace's mount allowlist.
pub struct MountPolicy {
    roots: Vec<(PathBuf, bool)>,
    reserved: PathBuf,
}

impl MountPolicy {
    /// `reserved` is the container path of the IPC mount, which
    /// workspace mounts may not shadow.
    pub fn new(allowlist: &[AllowedRoot], reserved: &Path) -> Self {
        let roots = allowlist
            .iter()
            .map(|root| (resolve_root(&root.path), root.read_write))
            .collect();
        Self {
            roots,
            reserved: normalize(reserved),
        }
    }

    /// Validates the whole set; the first invalid spec rejects it.
    pub fn validate(&self, mounts: &[MountSpec]) -> Result<Vec<ValidatedMount>, MountRejection> {
        let mut targets = HashSet::new();
        let mut validated = Vec::with_capacity(mounts.len());

        for spec in mounts {
            let mount = self.validate_one(spec)?;
            if !targets.insert(mount.container_path.clone()) {
                return Err(MountRejection::new(
                    &spec.container_path,
                    "container path is mounted more than once",
                ));
            }
            validated.push(mount);
        }

        Ok(validated)
    }

    fn validate_one(&self, spec: &MountSpec) -> Result<ValidatedMount, MountRejection> {
        if !spec.host_path.is_absolute() {
            return Err(MountRejection::new(&spec.host_path, "host path must be absolute"));
        }

        let host = spec.host_path.canonicalize().map_err(|e| {
            MountRejection::new(&spec.host_path, format!("host path cannot be resolved: {e}"))
        })?;

        if let Some(blocked) = host.components().find_map(|c| match c {
            Component::Normal(name) => BLOCKED_COMPONENTS
                .iter()
                .find(|b| name.to_str() == Some(**b)),
            _ => None,
        }) {
            return Err(MountRejection::new(
                &spec.host_path,
                format!("path contains blocked component `{blocked}`"),
            ));
        }

        // A path may sit under several roots; any one granting the mode suffices.
        let matching: Vec<bool> = self
            .roots
            .iter()
            .filter(|(root, _)| host.starts_with(root))
            .map(|(_, rw)| *rw)
            .collect();
        if matching.is_empty() {
            return Err(MountRejection::new(
                &spec.host_path,
                "host path is outside the workspace allowlist",
            ));
        }
        if spec.mode == MountMode::Rw && !matching.iter().any(|rw| *rw) {
            return Err(MountRejection::new(
                &spec.host_path,
                "read-write access is not allowed for this path",
            ));
        }

        let container = &spec.container_path;
        if !container.is_absolute() {
            return Err(MountRejection::new(container, "container path must be absolute"));
        }
        if container.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(MountRejection::new(container, "container path must not contain `..`"));
        }
        let container = normalize(container);
        if container == Path::new("/") {
            return Err(MountRejection::new(&container, "cannot mount over the container root"));
        }
        if container.starts_with(&self.reserved) || self.reserved.starts_with(&container) {
            return Err(MountRejection::new(
                &container,
                "container path collides with the IPC mount",
            ));
        }

        Ok(ValidatedMount {
            host_path: host,
            container_path: container,
            mode: spec.mode,
        })
    }
}

/// Allowlist roots that exist are canonicalized so symlinked roots
/// compare correctly; missing roots fall back to lexical normalization.
fn resolve_root(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| normalize(path))
}

/// Lexically removes `.` and resolves `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const IPC: &str = "/workspace/ipc";

    fn spec(host: &Path, container: &str, mode: MountMode) -> MountSpec {
        MountSpec {
            host_path: host.to_path_buf(),
            container_path: PathBuf::from(container),
            mode,
        }
    }

    fn policy(root: &Path, read_write: bool) -> MountPolicy {
        MountPolicy::new(
            &[AllowedRoot {
                path: root.to_path_buf(),
                read_write,
            }],
            Path::new(IPC),
        )
    }

    #[test]
    fn test_mount_inside_root_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        fs::create_dir_all(project.join("src")).unwrap();

        let policy = policy(&project, true);
        let mounts = policy
            .validate(&[
                spec(&project, "/workspace/project", MountMode::Rw),
                spec(&project.join("src"), "/workspace/src", MountMode::Ro),
            ])
            .unwrap();

        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].host_path, project.canonicalize().unwrap());
        assert_eq!(mounts[0].mode, MountMode::Rw);
        assert_eq!(mounts[1].container_path, PathBuf::from("/workspace/src"));
    }

    #[test]
    fn test_etc_outside_allowlist_rejected() {
        let policy = MountPolicy::new(
            &[AllowedRoot {
                path: PathBuf::from("/home/user/project"),
                read_write: true,
            }],
            Path::new(IPC),
        );
        let err = policy
            .validate(&[spec(Path::new("/etc"), "/workspace/x", MountMode::Rw)])
            .unwrap_err();
        assert_eq!(err.path, "/etc");
        assert!(err.reason.contains("outside the workspace allowlist"));
    }

    #[test]
    fn test_rw_under_read_only_root_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path(), false);

        assert!(policy
            .validate(&[spec(dir.path(), "/workspace/data", MountMode::Ro)])
            .is_ok());
        let err = policy
            .validate(&[spec(dir.path(), "/workspace/data", MountMode::Rw)])
            .unwrap_err();
        assert!(err.reason.contains("read-write"));
    }

    #[test]
    fn test_rw_granted_by_any_matching_root() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("shared");
        fs::create_dir(&nested).unwrap();
        let policy = MountPolicy::new(
            &[
                AllowedRoot {
                    path: dir.path().to_path_buf(),
                    read_write: false,
                },
                AllowedRoot {
                    path: nested.clone(),
                    read_write: true,
                },
            ],
            Path::new(IPC),
        );
        assert!(policy
            .validate(&[spec(&nested, "/workspace/shared", MountMode::Rw)])
            .is_ok());
    }

    #[test]
    fn test_parent_dir_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        fs::create_dir(&project).unwrap();
        fs::create_dir(dir.path().join("other")).unwrap();

        let policy = policy(&project, true);
        let escape = project.join("../other");
        let err = policy
            .validate(&[spec(&escape, "/workspace/other", MountMode::Ro)])
            .unwrap_err();
        assert!(err.reason.contains("outside"));
    }

    #[test]
    fn test_symlink_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        let outside = dir.path().join("outside");
        fs::create_dir(&project).unwrap();
        fs::create_dir(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, project.join("link")).unwrap();

        let policy = policy(&project, true);
        let err = policy
            .validate(&[spec(&project.join("link"), "/workspace/link", MountMode::Ro)])
            .unwrap_err();
        assert!(err.reason.contains("outside"));
    }

    #[test]
    fn test_missing_host_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path(), true);
        let err = policy
            .validate(&[spec(&dir.path().join("nope"), "/workspace/nope", MountMode::Ro)])
            .unwrap_err();
        assert!(err.reason.contains("cannot be resolved"));
    }

    #[test]
    fn test_blocked_component_rejected_under_allowed_root() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = dir.path().join(".ssh");
        fs::create_dir(&ssh).unwrap();

        let policy = policy(dir.path(), true);
        let err = policy
            .validate(&[spec(&ssh, "/workspace/keys", MountMode::Ro)])
            .unwrap_err();
        assert!(err.reason.contains("`.ssh`"));
    }

    #[test]
    fn test_container_path_rules() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path(), true);

        let relative = policy.validate(&[spec(dir.path(), "workspace/x", MountMode::Ro)]);
        assert!(relative.unwrap_err().reason.contains("absolute"));

        let dotdot = policy.validate(&[spec(dir.path(), "/workspace/../etc", MountMode::Ro)]);
        assert!(dotdot.unwrap_err().reason.contains(".."));

        let root = policy.validate(&[spec(dir.path(), "/", MountMode::Ro)]);
        assert!(root.unwrap_err().reason.contains("root"));

        let ipc = policy.validate(&[spec(dir.path(), "/workspace/ipc/requests", MountMode::Ro)]);
        assert!(ipc.unwrap_err().reason.contains("IPC"));

        let parent_of_ipc = policy.validate(&[spec(dir.path(), "/workspace", MountMode::Ro)]);
        assert!(parent_of_ipc.unwrap_err().reason.contains("IPC"));
    }

    #[test]
    fn test_duplicate_container_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::create_dir(&a).unwrap();
        fs::create_dir(&b).unwrap();

        let policy = policy(dir.path(), true);
        let err = policy
            .validate(&[
                spec(&a, "/workspace/data", MountMode::Ro),
                spec(&b, "/workspace/data/", MountMode::Ro),
            ])
            .unwrap_err();
        assert!(err.reason.contains("more than once"));
    }

    #[test]
    fn test_empty_allowlist_rejects_everything() {
        let dir = tempfile::tempdir().unwrap();
        let policy = MountPolicy::new(&[], Path::new(IPC));
        assert!(policy
            .validate(&[spec(dir.path(), "/workspace/x", MountMode::Ro)])
            .is_err());
        assert!(policy.validate(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_mount_mode_serde() {
        let spec: MountSpec = serde_json::from_str(
            r#"{"host_path":"/a","container_path":"/b"}"#,
        )
        .unwrap();
        assert_eq!(spec.mode, MountMode::Ro);
        assert_eq!(MountMode::Rw.as_str(), "rw");
    }
}
