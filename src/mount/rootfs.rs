use crate::error::{TaskError, TaskResult};
use crate::mount::loopdev::LoopMount;
use crate::mount::mount::{
    bind_dir, bind_file, detach, mount, mount_dir, remount, snapshot,
};
use crate::task::{BindMap, TaskEnv};
use log::{trace, warn};
use nix::errno::Errno;
use nix::mount::MsFlags;
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chdir, chroot, pivot_root};
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

const NONE: Option<&str> = None;

/* Kept writable even under a read-only root; they are already hardened
 * with their own bind mounts. */
const RO_PROC: [&str; 3] = ["/proc/sysrq-trigger", "/proc/irq", "/proc/bus"];

const TMPFS_DEV_OPTS: &str = "mode=755,size=32m";
const TMPFS_RUN_OPTS: &str = "mode=755,size=32m";
const TMPFS_SHM_OPTS: &str = "mode=1777,size=65536k";

fn io_errno(e: &std::io::Error) -> Errno {
    Errno::from_raw(e.raw_os_error().unwrap_or(0))
}

/// Composes the container's filesystem view. Runs inside the init, after
/// it has entered its mount namespace; the ordering of the steps is
/// dictated by the kernel, not by taste.
pub struct RootFs<'a> {
    env: &'a TaskEnv,
}

impl<'a> RootFs<'a> {
    pub fn new(env: &'a TaskEnv) -> RootFs<'a> {
        RootFs { env }
    }

    fn root(&self) -> &Path {
        &self.env.root
    }

    /// Join a container-view absolute path onto the root directory.
    fn inner(&self, path: &str) -> PathBuf {
        self.root().join(path.trim_start_matches('/'))
    }

    /// Receive mount propagations from the host but never leak ours back.
    pub fn remount_root_slave() -> TaskResult<()> {
        remount(Path::new("/"), MsFlags::MS_REC | MsFlags::MS_SLAVE)
    }

    /// Make everything shared again so subcontainers receive propagation.
    pub fn remount_root_shared() -> TaskResult<()> {
        remount(Path::new("/"), MsFlags::MS_REC | MsFlags::MS_SHARED)
    }

    /// Detach and remount /proc so the fresh pid namespace is reflected.
    pub fn refresh_proc() -> TaskResult<()> {
        detach(Path::new("/proc"))?;
        mount_dir(Some("proc"), Path::new("/proc"), Some("proc"), MsFlags::empty(), NONE)
    }

    /// For loop-backed roots the mount point may not exist yet.
    pub fn prepare_loop_root(&self) -> TaskResult<()> {
        if self.env.loop_image.is_some() && !self.root().exists() {
            std::fs::create_dir_all(self.root()).map_err(|e| {
                TaskError::os(io_errno(&e), format!("mkdir({})", self.root().display()))
            })?;
        }
        Ok(())
    }

    /// Rootfs construction: backing mount, pseudo filesystems, hardened
    /// procfs, device nodes, DNS binds.
    pub fn mount_root_fs(&self) -> TaskResult<()> {
        if self.env.root_is_host() {
            return Ok(());
        }

        if let Some(image) = &self.env.loop_image {
            LoopMount::new(image, self.root(), self.env.loop_dev)
                .mount(self.env.root_rdonly)?;
        } else {
            /* Bind the root onto itself so it becomes a mount point
             * eligible for pivot_root. */
            bind_dir(self.root(), self.root(), false)?;
        }

        let default_flags = MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;

        mount_dir(
            Some("sysfs"),
            &self.inner("/sys"),
            Some("sysfs"),
            default_flags | MsFlags::MS_RDONLY,
            NONE,
        )?;

        mount_dir(
            Some("proc"),
            &self.inner("/proc"),
            Some("proc"),
            default_flags,
            NONE,
        )?;

        self.restrict_proc(!self.env.cred.is_root())?;

        self.mount_dev()?;

        if self.env.loop_image.is_some() {
            self.mount_run()?;
        }

        mount_dir(
            Some("shm"),
            &self.inner("/dev/shm"),
            Some("tmpfs"),
            default_flags,
            Some(TMPFS_SHM_OPTS),
        )?;

        if self.env.bind_dns {
            self.bind_dns()?;
        }

        Ok(())
    }

    /* Bind the dangerous corners of procfs read-only over themselves and
     * hide the kernel image. Non-root containers additionally lose write
     * access to /proc/sys. */
    fn restrict_proc(&self, restrict_proc_sys: bool) -> TaskResult<()> {
        let mut dirs: Vec<&str> = RO_PROC.to_vec();
        if restrict_proc_sys {
            dirs.push("/proc/sys");
        }

        for path in dirs {
            let target = self.inner(path);
            if target.is_dir() {
                bind_dir(&target, &target, true)?;
            } else {
                bind_file(&target, &target, true)?;
            }
        }

        mount(
            Some("/dev/null"),
            &self.inner("/proc/kcore"),
            NONE,
            MsFlags::MS_BIND,
            NONE,
        )?;

        Ok(())
    }

    fn create_node(&self, path: &str, major: u64, minor: u64) -> TaskResult<()> {
        let target = self.inner(path);
        mknod(
            &target,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            makedev(major, minor),
        )
        .map_err(|e| TaskError::os(e, format!("mknod({})", target.display())))
    }

    fn mount_dev(&self) -> TaskResult<()> {
        mount_dir(
            Some("tmpfs"),
            &self.inner("/dev"),
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            Some(TMPFS_DEV_OPTS),
        )?;

        mount_dir(
            Some("devpts"),
            &self.inner("/dev/pts"),
            Some("devpts"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some("newinstance,ptmxmode=0666,mode=620,gid=5"),
        )?;

        for (path, major, minor) in [
            ("/dev/null", 1, 3),
            ("/dev/zero", 1, 5),
            ("/dev/full", 1, 7),
            ("/dev/random", 1, 8),
            ("/dev/urandom", 1, 9),
        ] {
            self.create_node(path, major, minor)?;
        }

        let ptmx = self.inner("/dev/ptmx");
        symlink("pts/ptmx", &ptmx)
            .map_err(|e| TaskError::os(io_errno(&e), format!("symlink({})", ptmx.display())))?;

        let fd = self.inner("/dev/fd");
        symlink("/proc/self/fd", &fd)
            .map_err(|e| TaskError::os(io_errno(&e), format!("symlink({})", fd.display())))?;

        let _ = std::fs::File::create(self.inner("/dev/console"));

        Ok(())
    }

    /* A fresh tmpfs over /run, keeping the names of whatever
     * subdirectories the image shipped (they come back empty). */
    fn mount_run(&self) -> TaskResult<()> {
        let run = self.inner("/run");
        let mut subdirs = Vec::new();

        if !run.exists() {
            std::fs::create_dir_all(&run)
                .map_err(|e| TaskError::os(io_errno(&e), format!("mkdir({})", run.display())))?;
        } else {
            let entries = std::fs::read_dir(&run)
                .map_err(|e| TaskError::os(io_errno(&e), format!("readdir({})", run.display())))?;
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    subdirs.push(entry.file_name());
                }
            }
        }

        mount_dir(
            Some("tmpfs"),
            &run,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            Some(TMPFS_RUN_OPTS),
        )?;

        for name in subdirs {
            let dir = run.join(&name);
            std::fs::create_dir(&dir)
                .map_err(|e| TaskError::os(io_errno(&e), format!("mkdir({})", dir.display())))?;
        }

        Ok(())
    }

    fn bind_dns(&self) -> TaskResult<()> {
        for file in ["/etc/hosts", "/etc/resolv.conf"] {
            bind_file(Path::new(file), &self.inner(file), true)?;
        }
        Ok(())
    }

    /// Apply the bind map. Every destination is re-resolved against the
    /// real filesystem so a symlink inside the rootfs cannot redirect the
    /// mount outside of it.
    pub fn bind_directories(&self) -> TaskResult<()> {
        for bind in &self.env.bind_map {
            let dest = resolve_bind_dest(self.root(), &self.env.cwd, bind)?;

            if bind.source.is_dir() {
                bind_dir(&bind.source, &dest, bind.rdonly)?;
            } else {
                bind_file(&bind.source, &dest, bind.rdonly)?;
            }

            /* Clear nosuid,noexec,nodev the bind picked up from its
             * carrier; user volumes keep their original flags. */
            if self.env.new_mount_ns {
                let mut flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND;
                if bind.rdonly {
                    flags |= MsFlags::MS_RDONLY;
                }
                remount(&dest, flags)?;
            }
        }

        Ok(())
    }

    /// With a read-only root on a bind-backed rootfs, walk the mount
    /// table and turn everything under the root read-only, except the
    /// hardened proc entries and the declared bind destinations.
    pub fn remount_root_ro(&self) -> TaskResult<()> {
        if !self.env.root_rdonly || self.env.loop_image.is_some() {
            return Ok(());
        }

        for mountpoint in snapshot(self.root())? {
            let inner = match inner_path(self.root(), &mountpoint) {
                Some(path) => path,
                None => continue,
            };

            /* A mount that contains one of the hardened proc paths keeps
             * its own flags; so does every declared bind target. */
            if RO_PROC.iter().any(|dir| Path::new(dir).starts_with(&inner)) {
                continue;
            }

            if self.env.bind_map.iter().any(|bind| {
                normal_path(&bind_dest_view(&self.env.cwd, bind)) == normal_path(&inner)
            }) {
                continue;
            }

            trace!("Remount {} ro", inner.display());
            remount(
                &mountpoint,
                MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
            )?;
        }

        Ok(())
    }

    /// Swap the root of this mount namespace. pivot_root(2) fails on
    /// hosts that are themselves chrooted, where plain chroot still
    /// works, so fall back. Afterwards the new root is remounted so suid
    /// binaries and device nodes stay usable.
    pub fn isolate_fs(&self) -> TaskResult<()> {
        if self.env.root_is_host() {
            return Ok(());
        }

        if let Err(error) = self.pivot_root() {
            warn!("Can't pivot root, roll back to chroot: {}", error);

            chroot(self.root())
                .map_err(|e| TaskError::os(e, format!("chroot({})", self.root().display())))?;
        }

        let mut flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND;
        if self.env.root_rdonly {
            flags |= MsFlags::MS_RDONLY;
        }
        remount(Path::new("/"), flags)?;

        chdir("/").map_err(|e| TaskError::os(e, "chdir(/)"))
    }

    fn pivot_root(&self) -> TaskResult<()> {
        let name = format!("old-root-{}", Uuid::new_v4());
        let old_root_host = self.root().join(&name);
        let old_root_local = PathBuf::from("/").join(&name);

        std::fs::create_dir(&old_root_host).map_err(|e| {
            TaskError::os(
                io_errno(&e),
                format!("mkdir({})", old_root_host.display()),
            )
        })?;

        if let Err(e) = pivot_root(self.root(), &old_root_host) {
            let _ = std::fs::remove_dir(&old_root_host);
            return Err(TaskError::os(e, format!("pivot_root({})", self.root().display())));
        }

        chdir("/").map_err(|e| TaskError::os(e, "chdir(/)"))?;

        detach(&old_root_local)?;

        std::fs::remove_dir(&old_root_local).map_err(|e| {
            TaskError::os(
                io_errno(&e),
                format!("rmdir({})", old_root_local.display()),
            )
        })?;

        Ok(())
    }
}

/* The container-view path of a mount point under root, "/" for the root
 * itself, None for anything outside. */
fn inner_path(root: &Path, mountpoint: &Path) -> Option<PathBuf> {
    let rel = mountpoint.strip_prefix(root).ok()?;
    Some(Path::new("/").join(rel))
}

/* Lexically normalized: ./ and ../ folded, no trailing slash. */
fn normal_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/* Where a bind lands in the container view (before joining the root). */
fn bind_dest_view(cwd: &Path, bind: &BindMap) -> PathBuf {
    if bind.dest.is_absolute() {
        bind.dest.clone()
    } else {
        cwd.join(&bind.dest)
    }
}

/* Resolve the path the way the kernel would: left to right, symlinks in
 * every existing prefix resolved before a following ".." is applied,
 * components that do not exist yet kept literally. */
fn realpath_nearest(path: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();

    for comp in path.components() {
        match comp {
            Component::RootDir => resolved.push("/"),
            Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                resolved.push(name);
                if let Ok(canonical) = resolved.canonicalize() {
                    resolved = canonical;
                }
            }
        }
    }

    resolved
}

/// Resolve a bind destination below the root and refuse anything whose
/// real path escapes it. The check runs both before the launch (against
/// the supervisor's view) and again in the init as the mounts are made.
pub fn resolve_bind_dest(root: &Path, cwd: &Path, bind: &BindMap) -> TaskResult<PathBuf> {
    let dest = root.join(
        bind_dest_view(cwd, bind)
            .strip_prefix("/")
            .unwrap_or(&bind.dest)
            .to_path_buf(),
    );

    /* No lexical ".." folding here: the kernel resolves symlinks before
     * dot-dot, so folding first would let a symlinked parent smuggle the
     * destination outside. realpath_nearest follows the same order. */
    let real_root = realpath_nearest(root);
    let real_dest = realpath_nearest(&dest);

    if !real_dest.starts_with(&real_root) {
        return Err(TaskError::invalid(format!(
            "Container bind mount {} resolves to {} outside of root {}",
            bind.source.display(),
            real_dest.display(),
            real_root.display(),
        )));
    }

    Ok(dest)
}
