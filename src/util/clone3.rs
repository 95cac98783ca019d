use nix::unistd::Pid;

#[repr(C, align(8))]
#[derive(Debug, Default, Copy, Clone)]
pub struct Clone3Args {
    pub flags: u64,        /* Flags bit mask. See libc::CLONE_* constants */
    pub pidfd: u64,        /* Where to store PID file descriptor (int *) */
    pub child_tid: u64,    /* Where to store child TID, in child's memory (pid_t *) */
    pub parent_tid: u64,   /* Where to store child TID, in parent's memory (pid_t *) */
    pub exit_signal: u64,  /* Signal to deliver to parent on child termination */
    pub stack: u64,        /* Pointer to lowest byte of stack */
    pub stack_size: u64,   /* Size of stack */
    pub tls: u64,          /* Location of new TLS */
    pub set_tid: u64,      /* Pointer to a pid_t array (since Linux 5.5) */
    pub set_tid_size: u64, /* Number of elements in set_tid (since Linux 5.5) */
    pub cgroup: u64,       /* File descriptor for target cgroup of child (since Linux 5.7) */
}

pub const CLONE_NEWNS: u64 = libc::CLONE_NEWNS as u64; /* New mount namespace */
pub const CLONE_NEWUTS: u64 = libc::CLONE_NEWUTS as u64; /* New UTS (hostname) namespace */
pub const CLONE_NEWIPC: u64 = libc::CLONE_NEWIPC as u64; /* New ipc namespace */
pub const CLONE_NEWPID: u64 = libc::CLONE_NEWPID as u64; /* New pid namespace */
pub const CLONE_NEWNET: u64 = libc::CLONE_NEWNET as u64; /* New network namespace */

pub fn clone3(args: &Clone3Args) -> Result<Pid, std::io::Error> {
    let result = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            args,
            core::mem::size_of::<Clone3Args>(),
        )
    };
    if result < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(Pid::from_raw(result as i32))
    }
}
