use crate::cgroup::LeafCgroups;
use crate::cred::Cred;
use crate::error::{ErrorKind, TaskError, TaskResult};
use crate::mount::resolve_bind_dest;
use crate::net::{GwVec, IpVec, NetCfg};
use crate::ns::{NamespaceFd, NamespaceSnapshot};
use log::trace;
use nix::unistd::chown;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One entry of the bind map: a host path made visible inside the
/// container view.
#[derive(Debug, Clone, Default)]
pub struct BindMap {
    pub source: PathBuf,
    /// Absolute inside the container view, or relative to the working
    /// directory.
    pub dest: PathBuf,
    pub rdonly: bool,
}

/// Everything the launch engine needs to know about one container,
/// immutable once prepared. The caller fills the fields from its own
/// configuration; `prepare` resolves credentials and validates what can
/// be validated before any process is spawned.
#[derive(Debug, Default)]
pub struct TaskEnv {
    /// Command line, shell-word expanded without command substitution.
    pub command: String,
    /// Working directory inside the container view.
    pub cwd: PathBuf,
    /// Create `cwd` as a private scratch directory owned by the task.
    pub create_cwd: bool,
    /// Rootfs directory on the host; "/" shares the host filesystem.
    pub root: PathBuf,
    pub root_rdonly: bool,
    pub user: String,
    pub group: String,
    /// Ordered key=value list, preserved verbatim into the execve
    /// environment.
    pub environ: Vec<String>,
    /// Fresh pid and ipc namespaces.
    pub isolate: bool,
    pub stdin_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    /// Namespaces to enter before the init is cloned.
    pub parent_ns: NamespaceSnapshot,
    /// The originating client's mount namespace, entered first so host
    /// path arguments resolve the way the client sees them.
    pub client_mnt_ns: NamespaceFd,
    /// Resource id to (soft, hard) pairs.
    pub rlimit: BTreeMap<i32, (u64, u64)>,
    /// Non-empty means a fresh UTS namespace with this name.
    pub hostname: String,
    /// Bind /etc/hosts and /etc/resolv.conf from the host.
    pub bind_dns: bool,
    pub bind_map: Vec<BindMap>,
    pub net_cfg: NetCfg,
    /// ext4 image backing the rootfs through a loop device.
    pub loop_image: Option<PathBuf>,
    pub loop_dev: i32,
    /// Capability bitmask kept in the inheritable and bounding sets.
    pub caps: u64,
    pub gw_vec: Vec<GwVec>,
    pub ip_vec: Vec<IpVec>,
    pub new_mount_ns: bool,
    pub leaf_cgroups: LeafCgroups,
    /// Resolved by `prepare`.
    pub cred: Cred,
}

impl TaskEnv {
    /// The container shares the host filesystem; rootfs construction and
    /// hostname changes are suppressed.
    pub fn root_is_host(&self) -> bool {
        self.root == Path::new("/")
    }

    /// Resolve the credential and reject invalid bind destinations. A
    /// task with an empty command has nothing to prepare.
    pub fn prepare(&mut self) -> TaskResult<()> {
        if self.command.is_empty() {
            return Ok(());
        }

        if !self.user.is_empty() {
            self.cred = Cred::resolve(&self.user, &self.group)?;
        }

        /* Bind destinations are checked against the real filesystem here
         * so an escaping bind fails the launch before any namespace is
         * created. Loop-backed roots do not exist yet and are checked
         * again by the init once mounted. */
        if self.loop_image.is_none() {
            for bind in &self.bind_map {
                resolve_bind_dest(&self.root, &self.cwd, bind)?;
            }
        }

        Ok(())
    }

    pub fn env_has_key(&self, key: &str) -> bool {
        self.environ
            .iter()
            .any(|entry| entry.split_once('=').map_or(entry.as_str(), |(k, _)| k) == key)
    }

    /// POSIX word splitting of the command line. Quoting is honored,
    /// command substitution is not available.
    pub fn split_command(&self) -> TaskResult<Vec<String>> {
        let words = shell_words::split(&self.command)
            .map_err(|e| TaskError::invalid(format!("invalid command line: {}", e)))?;
        if words.is_empty() {
            return Err(TaskError::invalid("empty command"));
        }
        Ok(words)
    }
}

/// Working directory created for the task. Directories under the
/// configured scratch prefix are temporary and removed on drop; anything
/// else is left in place.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    cleanup: bool,
}

impl ScratchDir {
    pub fn create(path: &Path, tmp_dir: &Path, cred: &Cred) -> TaskResult<ScratchDir> {
        let cleanup = path.starts_with(tmp_dir);

        if !path.exists() {
            std::fs::create_dir_all(path).map_err(|e| {
                let errno = nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(0));
                let kind = if errno == nix::errno::Errno::ENOSPC {
                    ErrorKind::NoSpace
                } else {
                    ErrorKind::Unknown
                };
                TaskError::new(kind, errno as i32, format!("mkdir({})", path.display()))
            })?;

            chown(path, Some(cred.uid), Some(cred.gid))
                .map_err(|e| TaskError::os(e, format!("chown({})", path.display())))?;
        }

        Ok(ScratchDir {
            path: path.to_path_buf(),
            cleanup,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.cleanup {
            trace!("Removing scratch cwd {}", self.path.display());
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_has_key() {
        let env = TaskEnv {
            environ: vec![
                "PATH=/bin:/usr/bin".to_string(),
                "TERM".to_string(),
                "HOME=/root".to_string(),
            ],
            ..TaskEnv::default()
        };
        assert!(env.env_has_key("PATH"));
        assert!(env.env_has_key("TERM"));
        assert!(env.env_has_key("HOME"));
        assert!(!env.env_has_key("SHELL"));
        assert!(!env.env_has_key("PAT"));
    }

    #[test]
    fn test_split_command() {
        let env = TaskEnv {
            command: "/bin/sh -c 'echo hello world'".to_string(),
            ..TaskEnv::default()
        };
        assert_eq!(
            env.split_command().expect("split"),
            vec!["/bin/sh", "-c", "echo hello world"]
        );
    }

    #[test]
    fn test_split_command_rejects_empty() {
        let env = TaskEnv::default();
        assert_eq!(
            env.split_command().expect_err("empty").kind,
            ErrorKind::InvalidValue
        );
    }

    #[test]
    fn test_split_command_rejects_unbalanced_quote() {
        let env = TaskEnv {
            command: "/bin/echo 'unterminated".to_string(),
            ..TaskEnv::default()
        };
        assert!(env.split_command().is_err());
    }

    #[test]
    fn test_prepare_empty_command_is_noop() {
        let mut env = TaskEnv {
            user: "no-such-user-42".to_string(),
            ..TaskEnv::default()
        };
        /* No command, nothing resolved, no error. */
        env.prepare().expect("noop");
    }

    #[test]
    fn test_prepare_rejects_escaping_bind() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut env = TaskEnv {
            command: "/bin/true".to_string(),
            root: root.path().to_path_buf(),
            cwd: PathBuf::from("/"),
            bind_map: vec![BindMap {
                source: PathBuf::from("/etc"),
                dest: PathBuf::from("../../../etc"),
                rdonly: true,
            }],
            ..TaskEnv::default()
        };
        let err = env.prepare().expect_err("escape");
        assert_eq!(err.kind, ErrorKind::InvalidValue);
    }

    #[test]
    fn test_scratch_dir_cleanup_under_prefix() {
        let base = tempfile::tempdir().expect("tempdir");
        let target = base.path().join("task-cwd");

        let cred = Cred {
            uid: nix::unistd::getuid(),
            gid: nix::unistd::getgid(),
            groups: vec![],
        };

        {
            let scratch =
                ScratchDir::create(&target, base.path(), &cred).expect("create scratch");
            assert!(scratch.path().is_dir());
        }
        assert!(!target.exists());
    }

    #[test]
    fn test_scratch_dir_kept_outside_prefix() {
        let base = tempfile::tempdir().expect("tempdir");
        let target = base.path().join("task-cwd");

        let cred = Cred {
            uid: nix::unistd::getuid(),
            gid: nix::unistd::getgid(),
            groups: vec![],
        };

        {
            let _scratch = ScratchDir::create(&target, Path::new("/nonexistent-prefix"), &cred)
                .expect("create scratch");
        }
        assert!(target.exists());
    }
}
