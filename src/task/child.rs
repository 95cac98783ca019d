use crate::caps::apply_capabilities;
use crate::config::Config;
use crate::error::{read_exact, ErrorKind, TaskError, TaskResult};
use crate::mount::RootFs;
use crate::net::enable_net;
use crate::task::start::abort;
use crate::task::TaskEnv;
use crate::util::{reset_all_signal_handlers, set_die_on_parent_exit, set_process_name};
use log::trace;
use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, execvpe, sethostname, setsid};
use std::convert::Infallible;
use std::ffi::CString;
use std::os::fd::OwnedFd;
use std::path::Path;

/// Entry point of the init, right after the namespace-creating clone.
/// Everything here runs inside the container's new namespaces; the only
/// ways out are execve or an error serialized back to the supervisor.
pub(crate) fn child_main(
    env: &TaskEnv,
    config: &Config,
    status_w: OwnedFd,
    sync_r: OwnedFd,
    sync_w: OwnedFd,
) -> ! {
    set_process_name("vessel-spawn-c");

    let error = match child_callback(env, config, sync_r, sync_w) {
        Ok(never) => match never {},
        Err(error) => error,
    };

    abort(&status_w, error)
}

fn io_errno(e: &std::io::Error) -> Errno {
    Errno::from_raw(e.raw_os_error().unwrap_or(0))
}

fn child_callback(
    env: &TaskEnv,
    config: &Config,
    sync_r: OwnedFd,
    sync_w: OwnedFd,
) -> TaskResult<Infallible> {
    drop(sync_w);

    /* Block until the intermediate has populated our netns. */
    let mut word = [0u8; 4];
    match read_exact(&sync_r, &mut word) {
        Ok(true) => {}
        Ok(false) => {
            return Err(TaskError::new(
                ErrorKind::Unknown,
                libc::ENODATA,
                "partial read from child sync pipe",
            ));
        }
        Err(e) => return Err(TaskError::os(e, "partial read from child sync pipe")),
    }
    drop(sync_r);

    reset_all_signal_handlers();

    /* Limits first, before anything that might fail because of them. */
    apply_limits(env)?;

    setsid().map_err(|e| TaskError::os(e, "setsid()"))?;

    umask(Mode::empty());

    if env.new_mount_ns {
        /* Receive propagations from the parent namespace but never leak
         * ours back. */
        RootFs::remount_root_slave()?;
    }

    if env.isolate {
        /* Remount proc so the fresh pid namespace is reflected. */
        RootFs::refresh_proc()?;
    }

    let rootfs = RootFs::new(env);

    if env.isolate {
        rootfs.prepare_loop_root()?;
    }

    if env.net_cfg.new_net_ns {
        enable_net(env)?;
    }

    if env.parent_ns.mnt.is_opened() {
        /* Somebody else's mount namespace is prescribed: join it and
         * take its root instead of constructing our own. */
        env.parent_ns.mnt.set_ns(CloneFlags::CLONE_NEWNS)?;
        env.parent_ns.root.chroot()?;
        chdir(&env.cwd)
            .map_err(|e| TaskError::os(e, format!("chdir({})", env.cwd.display())))?;
    } else {
        rootfs.mount_root_fs()?;
        rootfs.bind_directories()?;
        rootfs.remount_root_ro()?;
        rootfs.isolate_fs()?;

        chdir(&env.cwd)
            .map_err(|e| TaskError::os(e, format!("chdir({})", env.cwd.display())))?;

        set_hostname(env)?;
    }

    if env.new_mount_ns {
        /* Subcontainers will get propagation from us. */
        RootFs::remount_root_shared()?;
    }

    apply_capabilities(env.caps, &env.cred)?;

    env.cred.apply(config.log_verbose)?;

    child_exec(env, config)
}

fn apply_limits(env: &TaskEnv) -> TaskResult<()> {
    for (&resource, &(soft, hard)) in &env.rlimit {
        let lim = libc::rlimit {
            rlim_cur: soft,
            rlim_max: hard,
        };
        let ret = unsafe { libc::setrlimit(resource as _, &lim) };
        if ret < 0 {
            return Err(TaskError::os(
                Errno::last(),
                format!("setrlimit({}, {}:{})", resource, soft, hard),
            ));
        }
    }

    Ok(())
}

fn set_hostname(env: &TaskEnv) -> TaskResult<()> {
    if env.hostname.is_empty() || env.root_is_host() {
        return Ok(());
    }

    let etc_hostname = Path::new("/etc/hostname");
    if etc_hostname.exists() {
        std::fs::write(etc_hostname, format!("{}\n", env.hostname))
            .map_err(|e| TaskError::os(io_errno(&e), "write(/etc/hostname)"))?;
    }

    sethostname(&env.hostname).map_err(|e| TaskError::os(e, "sethostname()"))
}

fn child_exec(env: &TaskEnv, config: &Config) -> TaskResult<Infallible> {
    let words = env.split_command()?;

    let argv = words
        .iter()
        .map(|word| CString::new(word.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| TaskError::invalid("command contains NUL"))?;

    let envp = env
        .environ
        .iter()
        .map(|entry| CString::new(entry.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| TaskError::invalid("environment contains NUL"))?;

    if config.log_verbose {
        trace!("command={}", env.command);
        for (i, word) in words.iter().enumerate() {
            trace!("argv[{}]={}", i, word);
        }
        for (i, entry) in env.environ.iter().enumerate() {
            trace!("environ[{}]={}", i, entry);
        }
    }

    /* The user command must not inherit our death arrangement. */
    let _ = set_die_on_parent_exit(0);

    match execvpe(&argv[0], &argv, &envp) {
        Ok(never) => match never {},
        Err(e) => Err(TaskError::new(
            ErrorKind::InvalidValue,
            e as i32,
            format!(
                "execvpe({}, {}, {})",
                words[0],
                words.len(),
                env.environ.len()
            ),
        )),
    }
}
