use crate::error::{TaskError, TaskResult};
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::{chroot, fchdir, Pid};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;

/// Pinned handle on one namespace (or the root directory) of some process,
/// opened via /proc. Holding the fd keeps the namespace alive even after
/// every process in it has exited.
#[derive(Debug, Default)]
pub struct NamespaceFd {
    fd: Option<OwnedFd>,
    path: PathBuf,
}

impl NamespaceFd {
    pub fn open(pid: Pid, name: &str) -> TaskResult<NamespaceFd> {
        let path = PathBuf::from(format!("/proc/{}/{}", pid, name));
        let raw = open(
            &path,
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| TaskError::os(e, format!("open({})", path.display())))?;

        Ok(NamespaceFd {
            /* SAFETY: freshly returned by open(2), owned here. */
            fd: Some(unsafe { OwnedFd::from_raw_fd(raw) }),
            path,
        })
    }

    pub fn is_opened(&self) -> bool {
        self.fd.is_some()
    }

    /// Join the namespace behind this handle.
    pub fn set_ns(&self, nstype: CloneFlags) -> TaskResult<()> {
        let fd = self
            .fd
            .as_ref()
            .ok_or_else(|| TaskError::invalid("setns on a closed namespace handle"))?;
        setns(fd.as_fd(), nstype)
            .map_err(|e| TaskError::os(e, format!("setns({})", self.path.display())))
    }

    /// Chroot into the directory behind this handle (used with a pinned
    /// /proc/<pid>/root fd after entering the owning mount namespace).
    pub fn chroot(&self) -> TaskResult<()> {
        let fd = self
            .fd
            .as_ref()
            .ok_or_else(|| TaskError::invalid("chroot on a closed namespace handle"))?;
        fchdir(fd.as_raw_fd())
            .map_err(|e| TaskError::os(e, format!("fchdir({})", self.path.display())))?;
        chroot(".").map_err(|e| TaskError::os(e, "chroot(.)"))
    }

    pub fn close(&mut self) {
        self.fd = None;
    }
}

/// Snapshot of the namespaces of one process, held open by the supervisor
/// and handed to the intermediate by fd inheritance.
#[derive(Debug, Default)]
pub struct NamespaceSnapshot {
    pub mnt: NamespaceFd,
    pub pid: NamespaceFd,
    pub net: NamespaceFd,
    pub ipc: NamespaceFd,
    pub uts: NamespaceFd,
    /// Root directory as seen by the snapshotted process; needed because
    /// entering `mnt` alone does not move our root.
    pub root: NamespaceFd,
}

impl NamespaceSnapshot {
    pub fn open(pid: Pid) -> TaskResult<NamespaceSnapshot> {
        Ok(NamespaceSnapshot {
            mnt: NamespaceFd::open(pid, "ns/mnt")?,
            pid: NamespaceFd::open(pid, "ns/pid")?,
            net: NamespaceFd::open(pid, "ns/net")?,
            ipc: NamespaceFd::open(pid, "ns/ipc")?,
            uts: NamespaceFd::open(pid, "ns/uts")?,
            root: NamespaceFd::open(pid, "root")?,
        })
    }

    /// Enter every namespace held by the snapshot, mount namespace last so
    /// the other /proc-derived fds stay usable while we need them. The
    /// handles are close-on-exec, so the init sheds them at execve and the
    /// supervisor's own copies stay open until dropped.
    pub fn enter(&self) -> TaskResult<()> {
        if self.ipc.is_opened() {
            self.ipc.set_ns(CloneFlags::CLONE_NEWIPC)?;
        }
        if self.uts.is_opened() {
            self.uts.set_ns(CloneFlags::CLONE_NEWUTS)?;
        }
        if self.net.is_opened() {
            self.net.set_ns(CloneFlags::CLONE_NEWNET)?;
        }
        if self.pid.is_opened() {
            self.pid.set_ns(CloneFlags::CLONE_NEWPID)?;
        }
        if self.mnt.is_opened() {
            self.mnt.set_ns(CloneFlags::CLONE_NEWNS)?;
        }

        Ok(())
    }

    pub fn close(&mut self) {
        self.mnt.close();
        self.pid.close();
        self.net.close();
        self.ipc.close();
        self.uts.close();
        self.root.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn test_open_own_namespaces() {
        let snapshot = NamespaceSnapshot::open(getpid()).expect("open own namespaces");
        assert!(snapshot.mnt.is_opened());
        assert!(snapshot.pid.is_opened());
        assert!(snapshot.net.is_opened());
        assert!(snapshot.ipc.is_opened());
        assert!(snapshot.uts.is_opened());
        assert!(snapshot.root.is_opened());
    }

    #[test]
    fn test_closed_handle_rejects_setns() {
        let fd = NamespaceFd::default();
        assert!(!fd.is_opened());
        assert!(fd.set_ns(CloneFlags::CLONE_NEWNS).is_err());
    }

    #[test]
    fn test_open_missing_pid() {
        assert!(NamespaceFd::open(Pid::from_raw(i32::MAX - 1), "ns/mnt").is_err());
    }
}
