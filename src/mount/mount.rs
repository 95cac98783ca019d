use crate::error::{TaskError, TaskResult};
use nix::mount::{umount2, MntFlags, MsFlags};
use std::ffi::CStr;
use std::ffi::CString;
use std::path::{Path, PathBuf};

pub fn mount<S1, S2, S3, S4>(
    source: Option<S1>,
    target: S2,
    fstype: Option<S3>,
    flags: MsFlags,
    data: Option<S4>,
) -> TaskResult<()>
where
    S1: AsRef<std::ffi::OsStr>,
    S2: AsRef<std::ffi::OsStr>,
    S3: AsRef<std::ffi::OsStr>,
    S4: AsRef<std::ffi::OsStr>,
{
    let cstr = |s: &std::ffi::OsStr| {
        CString::new(s.to_string_lossy().as_bytes())
            .map_err(|_| TaskError::invalid(format!("mount argument contains NUL: {:?}", s)))
    };

    let source_cstr = match &source {
        Some(source) => cstr(source.as_ref())?,
        None => CString::default(),
    };
    let target_cstr = cstr(target.as_ref())?;
    let fstype_cstr = match &fstype {
        Some(fstype) => cstr(fstype.as_ref())?,
        None => CString::default(),
    };
    let data_cstr = match &data {
        Some(data) => cstr(data.as_ref())?,
        None => CString::default(),
    };

    let source = source.map(|_| source_cstr.as_c_str());
    let fstype = fstype.map(|_| fstype_cstr.as_c_str());
    let data = data.map(|_| data_cstr.as_c_str());

    nix::mount::mount::<CStr, CStr, CStr, CStr>(
        source,
        target_cstr.as_c_str(),
        fstype,
        flags,
        data,
    )
    .map_err(|e| {
        TaskError::os(
            e,
            format!(
                "mount({} -> {}, type={}, flags={:#x}, data={})",
                source_cstr.to_string_lossy(),
                target_cstr.to_string_lossy(),
                fstype_cstr.to_string_lossy(),
                flags.bits(),
                data_cstr.to_string_lossy(),
            ),
        )
    })
}

/// Mount onto a directory, creating the mount point first if needed.
pub fn mount_dir<S1, S3, S4>(
    source: Option<S1>,
    target: &Path,
    fstype: Option<S3>,
    flags: MsFlags,
    data: Option<S4>,
) -> TaskResult<()>
where
    S1: AsRef<std::ffi::OsStr>,
    S3: AsRef<std::ffi::OsStr>,
    S4: AsRef<std::ffi::OsStr>,
{
    if !target.exists() {
        std::fs::create_dir_all(target).map_err(|e| {
            TaskError::os(
                nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(0)),
                format!("mkdir({})", target.display()),
            )
        })?;
    }

    mount(source, target, fstype, flags, data)
}

const NONE: Option<&str> = None;

/// Bind a directory over `target`, read-only when asked. The target
/// directory is created if missing.
pub fn bind_dir(source: &Path, target: &Path, rdonly: bool) -> TaskResult<()> {
    mount_dir(Some(source), target, NONE, MsFlags::MS_BIND, NONE)?;
    if rdonly {
        remount(
            target,
            MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
        )?;
    }
    Ok(())
}

/// Bind a single file over `target`, creating an empty carrier file (and
/// its parents) if missing.
pub fn bind_file(source: &Path, target: &Path, rdonly: bool) -> TaskResult<()> {
    if !target.exists() {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TaskError::os(
                    nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(0)),
                    format!("mkdir({})", parent.display()),
                )
            })?;
        }
        std::fs::File::create(target).map_err(|e| {
            TaskError::os(
                nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(0)),
                format!("touch({})", target.display()),
            )
        })?;
    }

    mount(Some(source), target, NONE, MsFlags::MS_BIND, NONE)?;
    if rdonly {
        remount(
            target,
            MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
        )?;
    }
    Ok(())
}

pub fn remount(target: &Path, flags: MsFlags) -> TaskResult<()> {
    mount(Some("none"), target, NONE, flags, NONE)
}

/// Lazily detach the mount at `target`.
pub fn detach(target: &Path) -> TaskResult<()> {
    umount2(target, MntFlags::MNT_DETACH)
        .map_err(|e| TaskError::os(e, format!("umount2({}, MNT_DETACH)", target.display())))
}

/* Mount points below base, deepest first, read from /proc/mounts. */
pub fn snapshot(base: &Path) -> TaskResult<Vec<PathBuf>> {
    let mut mounts = Vec::new();

    let system_mounts = unsafe { libc::setmntent(c"/proc/mounts".as_ptr(), c"r".as_ptr()) };
    if system_mounts.is_null() {
        return Err(TaskError::os(
            nix::errno::Errno::last(),
            "setmntent(/proc/mounts)",
        ));
    }

    loop {
        let mnt = unsafe { libc::getmntent(system_mounts) };
        if mnt.is_null() {
            break;
        }

        let mnt_dir =
            PathBuf::from(unsafe { CStr::from_ptr((*mnt).mnt_dir).to_string_lossy() }.as_ref());

        if mnt_dir.starts_with(base) {
            mounts.push(mnt_dir);
        }
    }

    unsafe { libc::endmntent(system_mounts) };

    mounts.sort_by(|a, b| b.cmp(a));

    Ok(mounts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_root_contains_proc() {
        let mounts = snapshot(Path::new("/")).expect("snapshot");
        assert!(mounts.iter().any(|m| m == Path::new("/proc")));
    }

    #[test]
    fn test_snapshot_is_deepest_first() {
        let mounts = snapshot(Path::new("/")).expect("snapshot");
        let mut sorted = mounts.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(mounts, sorted);
    }

    #[test]
    fn test_mount_failure_carries_errno() {
        /* Unprivileged, this must fail with a structured error rather
         * than panic. */
        let err = mount(
            Some("tmpfs"),
            "/definitely/not/a/mountpoint",
            Some("tmpfs"),
            MsFlags::empty(),
            NONE,
        )
        .expect_err("must fail");
        assert_ne!(err.errno, 0);
    }
}
