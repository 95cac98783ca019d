use crate::error::{TaskError, TaskResult};
use nix::errno::Errno;
use std::ffi::CString;

/// Arrange for `signal` to be delivered when the parent exits; 0 clears
/// the arrangement (the init clears it right before exec so the user
/// command does not inherit it).
pub fn set_die_on_parent_exit(signal: i32) -> TaskResult<()> {
    let ret = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, signal as libc::c_ulong, 0, 0, 0) };
    if ret < 0 {
        return Err(TaskError::os(Errno::last(), "prctl(PR_SET_PDEATHSIG)"));
    }
    Ok(())
}

/// Set the name shown for this process in ps/comm. Truncated by the
/// kernel to 15 bytes.
pub fn set_process_name(name: &str) {
    if let Ok(name) = CString::new(name) {
        unsafe {
            libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0);
        }
    }
}

/// Become a subreaper so the init reparents to us once the intermediate
/// exits. Used by the driver binary; the daemon's master fills this role
/// in production.
pub fn set_child_subreaper() -> TaskResult<()> {
    let ret = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
    if ret < 0 {
        return Err(TaskError::os(Errno::last(), "prctl(PR_SET_CHILD_SUBREAPER)"));
    }
    Ok(())
}

/// Put every catchable signal back to its default disposition and clear
/// the signal mask. Runs in the init after the sync-pipe read, so the
/// user command starts from a clean slate.
pub fn reset_all_signal_handlers() {
    for sig in 1..=libc::SIGRTMAX() {
        if sig == libc::SIGKILL || sig == libc::SIGSTOP {
            continue;
        }
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
        }
    }

    let empty = nix::sys::signal::SigSet::empty();
    let _ = nix::sys::signal::sigprocmask(
        nix::sys::signal::SigmaskHow::SIG_SETMASK,
        Some(&empty),
        None,
    );
}

pub fn gettid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gettid_nonzero() {
        assert!(gettid() > 0);
    }

    #[test]
    fn test_set_die_on_parent_exit() {
        set_die_on_parent_exit(libc::SIGTERM).expect("set pdeathsig");
        set_die_on_parent_exit(0).expect("clear pdeathsig");
    }
}
