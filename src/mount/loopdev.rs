use crate::error::{TaskError, TaskResult};
use crate::mount::mount_dir;
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::mount::MsFlags;
use nix::sys::stat::Mode;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

/* Loop ioctls, from <linux/loop.h>. */
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

/// An ext4 image backing a container rootfs through /dev/loopN. The
/// device index is reserved by the rootfs subsystem and passed in; a
/// negative index asks the kernel for a free one.
pub struct LoopMount<'a> {
    image: &'a Path,
    target: &'a Path,
    dev_index: i32,
}

impl<'a> LoopMount<'a> {
    pub fn new(image: &'a Path, target: &'a Path, dev_index: i32) -> LoopMount<'a> {
        LoopMount {
            image,
            target,
            dev_index,
        }
    }

    fn open_fd(path: &Path, flags: OFlag) -> TaskResult<OwnedFd> {
        let raw = open(path, flags | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(|e| TaskError::os(e, format!("open({})", path.display())))?;
        /* SAFETY: freshly returned by open(2), owned here. */
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    }

    fn free_device() -> TaskResult<i32> {
        let ctl = Self::open_fd(Path::new("/dev/loop-control"), OFlag::O_RDWR)?;
        let index = unsafe { libc::ioctl(ctl.as_raw_fd(), LOOP_CTL_GET_FREE) };
        if index < 0 {
            return Err(TaskError::os(
                Errno::last(),
                "ioctl(LOOP_CTL_GET_FREE)",
            ));
        }
        Ok(index)
    }

    /// Attach the image to the loop device and mount it at the target.
    pub fn mount(&self, read_only: bool) -> TaskResult<()> {
        let index = if self.dev_index >= 0 {
            self.dev_index
        } else {
            Self::free_device()?
        };
        let device = PathBuf::from(format!("/dev/loop{}", index));

        let image_flags = if read_only {
            OFlag::O_RDONLY
        } else {
            OFlag::O_RDWR
        };
        let image_fd = Self::open_fd(self.image, image_flags)?;
        let device_fd = Self::open_fd(&device, OFlag::O_RDWR)?;

        let ret = unsafe {
            libc::ioctl(device_fd.as_raw_fd(), LOOP_SET_FD, image_fd.as_raw_fd())
        };
        if ret < 0 {
            return Err(TaskError::os(
                Errno::last(),
                format!("ioctl(LOOP_SET_FD, {})", device.display()),
            ));
        }

        let mut flags = MsFlags::empty();
        if read_only {
            flags |= MsFlags::MS_RDONLY;
        }

        let mounted = mount_dir(
            Some(&device),
            self.target,
            Some("ext4"),
            flags,
            None::<&str>,
        );

        if mounted.is_err() {
            /* Undo our own attach; the reservation of the index stays
             * with the caller. */
            unsafe {
                libc::ioctl(device_fd.as_raw_fd(), LOOP_CLR_FD);
            }
        }

        mounted
    }
}
