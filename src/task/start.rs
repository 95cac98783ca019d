use crate::config::Config;
use crate::error::{read_exact, write_all, ErrorKind, TaskError, TaskResult};
use crate::net::isolate_net;
use crate::task::child::child_main;
use crate::task::{ScratchDir, Task, TaskEnv, TaskState};
use crate::util::{
    clone3, set_die_on_parent_exit, set_process_name, Clone3Args, CLONE_NEWIPC, CLONE_NEWNET,
    CLONE_NEWNS, CLONE_NEWPID, CLONE_NEWUTS,
};
use log::{error, trace};
use nix::fcntl::{open, OFlag};
use nix::sched::CloneFlags;
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fchown, fork, getpid, pipe2, setsid, ForkResult, Pid};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;

impl Task {
    /// Launch the container. Forks an intermediate whose only child is
    /// the init, so the init reparents to our own parent once the
    /// intermediate exits; the init pid and the first fatal error of
    /// either process come back over the status pipe.
    pub fn start(&mut self, config: &Config) -> TaskResult<()> {
        let env = self
            .env
            .clone()
            .ok_or_else(|| TaskError::invalid("start on a task without environment"))?;

        self.pid = 0;

        if env.create_cwd {
            match ScratchDir::create(&env.cwd, &config.tmp_dir, &env.cred) {
                Ok(scratch) => self.scratch_cwd = Some(scratch),
                Err(error) => {
                    if error.kind != ErrorKind::NoSpace {
                        error!("Can't create temporary cwd: {}", error);
                    }
                    return Err(error);
                }
            }
        }

        self.exit_status = 0;

        let (status_r, status_w) = pipe2(OFlag::O_CLOEXEC).map_err(|e| {
            let error = TaskError::os(e, "pipe2(status)");
            error!("Can't create communication pipe for child: {}", error);
            error
        })?;

        match unsafe { fork() } {
            Err(e) => {
                let error = TaskError::os(e, "fork()");
                trace!("Can't spawn intermediate: {}", error);
                Err(error)
            }
            Ok(ForkResult::Child) => intermediate_main(&env, config, status_r, status_w),
            Ok(ForkResult::Parent { child }) => {
                drop(status_w);
                self.finish_start(child, status_r)
            }
        }
    }

    /* Supervisor side: reap the intermediate, read the init pid, then a
     * serialized error (empty means success). An error always wins over
     * a pid; a half constructed init is killed. */
    fn finish_start(&mut self, intermediate: Pid, status_r: OwnedFd) -> TaskResult<()> {
        let status = match waitpid(intermediate, None) {
            Ok(WaitStatus::Exited(_, code)) => code,
            Ok(_) => -1,
            Err(_) => {
                let _ = kill(intermediate, Signal::SIGKILL);
                -1
            }
        };

        let mut word = [0u8; 4];
        match read_exact(&status_r, &mut word) {
            Ok(true) => {}
            Ok(false) => {
                return Err(TaskError::new(
                    ErrorKind::InvalidValue,
                    0,
                    "Container couldn't start due to resource limits",
                ));
            }
            Err(e) => {
                return Err(TaskError::new(
                    ErrorKind::InvalidValue,
                    e as i32,
                    "Container couldn't start due to resource limits",
                ));
            }
        }
        self.pid = i32::from_ne_bytes(word);

        let error = TaskError::deserialize(&status_r).ok().flatten();
        drop(status_r);

        if error.is_some() || status != 0 {
            if self.pid > 0 {
                trace!("Kill partly constructed container {}", self.pid);
                let _ = kill(Pid::from_raw(self.pid), Signal::SIGKILL);
            }
            self.pid = 0;
            self.exit_status = -1;

            return Err(error.unwrap_or_else(|| {
                TaskError::new(
                    ErrorKind::InvalidValue,
                    0,
                    format!(
                        "Container couldn't start due to resource limits \
                         (intermediate exited with {})",
                        status
                    ),
                )
            }));
        }

        self.state = TaskState::Started;

        self.clear_env();

        Ok(())
    }
}

pub(crate) fn report_pid(status_w: &OwnedFd, pid: i32) {
    if write_all(status_w, &pid.to_ne_bytes()).is_err() {
        error!("partial write of pid: {}", pid);
    }
}

/// Serialize the first fatal error onto the status pipe and give up.
pub(crate) fn abort(status_w: &OwnedFd, error: TaskError) -> ! {
    if let Err(e) = error.serialize(status_w) {
        error!("{}", e);
    }
    std::process::exit(1);
}

fn open_std_file(path: &Path, expected: RawFd, env: &TaskEnv) -> TaskResult<()> {
    let fd = open(
        path,
        OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_APPEND,
        Mode::from_bits_truncate(0o660),
    )
    .map_err(|e| {
        TaskError::new(
            ErrorKind::InvalidValue,
            e as i32,
            format!("open({}) -> {}", path.display(), expected),
        )
    })?;

    if fd != expected {
        return Err(TaskError::new(
            ErrorKind::Unknown,
            libc::EINVAL,
            format!(
                "open({}) -> {}: unexpected fd {}",
                path.display(),
                expected,
                fd
            ),
        ));
    }

    fchown(fd, Some(env.cred.uid), Some(env.cred.gid)).map_err(|e| {
        TaskError::os(e, format!("fchown({}) -> {}", path.display(), expected))
    })?;

    Ok(())
}

/* Rebuild stdio from the task's paths. The inherited fds 0-2 are closed
 * first so the opens land exactly there; the status pipe and the pinned
 * namespace fds live above 2 and must survive. */
fn reopen_stdio(env: &TaskEnv, keep: RawFd) -> TaskResult<()> {
    for fd in 0..3 {
        if fd != keep {
            unsafe {
                libc::close(fd);
            }
        }
    }

    let fd = open(
        &env.stdin_path,
        OFlag::O_CREAT | OFlag::O_RDONLY,
        Mode::from_bits_truncate(0o660),
    )
    .map_err(|e| {
        TaskError::os(e, format!("open({}) -> 0", env.stdin_path.display()))
    })?;
    if fd != 0 {
        return Err(TaskError::new(
            ErrorKind::Unknown,
            libc::EINVAL,
            "open(0): unexpected fd",
        ));
    }

    open_std_file(&env.stdout_path, 1, env)?;
    open_std_file(&env.stderr_path, 2, env)?;

    Ok(())
}

/// The intermediate: a transient process whose duties are cgroup
/// placement, stdio plumbing, namespace entry and the namespace-creating
/// clone of the init. Its `getppid()` at clone time is the supervisor,
/// so after it exits the init reparents to the supervisor's parent.
pub(crate) fn intermediate_main(
    env: &TaskEnv,
    config: &Config,
    status_r: OwnedFd,
    status_w: OwnedFd,
) -> ! {
    /* An orphaned intermediate must never leak half finished setup. */
    let _ = set_die_on_parent_exit(libc::SIGKILL);
    set_process_name("vessel-spawn-p");

    let _ = setsid();

    /* Pre-clone so the init inherits membership even for subsystems
     * without per-namespace views. */
    for leaf in env.leaf_cgroups.values() {
        if let Err(error) = leaf.attach(getpid()) {
            error!("Can't attach to cgroup: {}", error);
            report_pid(&status_w, -1);
            abort(&status_w, error);
        }
    }

    /* Stdio paths are meaningful in the client's mount namespace. */
    if env.client_mnt_ns.is_opened() {
        if let Err(error) = env.client_mnt_ns.set_ns(CloneFlags::CLONE_NEWNS) {
            error!("Can't move task to client mount namespace: {}", error);
            report_pid(&status_w, -1);
            abort(&status_w, error);
        }
    }

    drop(status_r);
    if let Err(error) = reopen_stdio(env, status_w.as_raw_fd()) {
        report_pid(&status_w, -1);
        abort(&status_w, error);
    }

    if let Err(error) = env.parent_ns.enter() {
        error!("Cannot enter namespaces: {}", error);
        report_pid(&status_w, -1);
        abort(&status_w, error);
    }

    let mut flags = 0u64;
    if env.isolate {
        flags |= CLONE_NEWPID | CLONE_NEWIPC;
    }
    if env.new_mount_ns {
        flags |= CLONE_NEWNS;
    }
    if !env.hostname.is_empty() {
        flags |= CLONE_NEWUTS;
    }
    if env.net_cfg.new_net_ns {
        flags |= CLONE_NEWNET;
    }

    /* The init blocks on this pipe until the netns is populated. */
    let (sync_r, sync_w) = match pipe2(OFlag::O_CLOEXEC) {
        Ok(pair) => pair,
        Err(e) => {
            let error = TaskError::os(e, "pipe2(sync)");
            error!("Can't create sync pipe for child: {}", error);
            report_pid(&status_w, -1);
            abort(&status_w, error);
        }
    };

    let clone_args = Clone3Args {
        flags,
        exit_signal: libc::SIGCHLD as u64,
        ..Default::default()
    };

    match clone3(&clone_args) {
        Err(e) => {
            report_pid(&status_w, -1);

            let errno = e.raw_os_error().unwrap_or(0);
            let kind = if errno == libc::ENOMEM {
                ErrorKind::ResourceNotAvailable
            } else {
                ErrorKind::Unknown
            };
            let error = TaskError::new(kind, errno, "clone()");
            error!("Can't spawn child: {}", error);
            abort(&status_w, error);
        }
        Ok(pid) if pid.as_raw() == 0 => child_main(env, config, status_w, sync_r, sync_w),
        Ok(pid) => {
            drop(sync_r);
            report_pid(&status_w, pid.as_raw());

            /* Devices are created in the host netns and moved in from
             * here; the init configures them from inside afterwards. */
            if config.network_enabled {
                if let Err(error) = isolate_net(env, pid, config) {
                    error!("Can't isolate child network: {}", error);
                    abort(&status_w, error);
                }
            }

            let word = 0i32.to_ne_bytes();
            if write_all(&sync_w, &word).is_err() {
                let error =
                    TaskError::new(ErrorKind::Unknown, 0, "Partial write to child sync pipe");
                error!("Can't spawn child: {}", error);
                abort(&status_w, error);
            }

            std::process::exit(0);
        }
    }
}
