#![allow(clippy::collapsible_else_if, clippy::collapsible_if, clippy::useless_format)]
#![deny(clippy::get_unwrap, clippy::panic, clippy::unwrap_used)]

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::Log;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{geteuid, Pid};
use std::collections::BTreeMap;
use std::path::PathBuf;
use vessel::caps::init_last_cap;
use vessel::config::resolve_config;
use vessel::logger::VesselLogger;
use vessel::net::NetCfg;
use vessel::task::{BindMap, Task, TaskEnv};
use vessel::util::set_child_subreaper;

/// Launch one command in an isolated container. This is a thin driver
/// around the launch engine; the daemon proper feeds the same
/// environment from its RPC surface.
#[derive(Parser, Clone)]
#[command(name = "vessel", version, about)]
struct Args {
    /// Rootfs directory; "/" shares the host filesystem.
    #[arg(long, default_value = "/")]
    root: PathBuf,

    /// Remount the container view read-only.
    #[arg(long)]
    root_rdonly: bool,

    /// ext4 image to loop-mount at the root.
    #[arg(long = "loop")]
    loop_image: Option<PathBuf>,

    /// Loop device index; negative asks the kernel for a free one.
    #[arg(long, default_value_t = -1)]
    loop_dev: i32,

    /// Working directory inside the container view.
    #[arg(long, default_value = "/")]
    cwd: PathBuf,

    /// Create the working directory owned by the task user.
    #[arg(long)]
    create_cwd: bool,

    #[arg(long, default_value = "root")]
    user: String,

    #[arg(long, default_value = "")]
    group: String,

    /// KEY=VALUE, order preserved into the task environment.
    #[arg(long = "env")]
    environ: Vec<String>,

    /// Fresh pid and ipc namespaces.
    #[arg(long)]
    isolate: bool,

    #[arg(long)]
    new_mount_ns: bool,

    /// Also creates a fresh UTS namespace.
    #[arg(long, default_value = "")]
    hostname: String,

    /// Create a fresh empty network namespace.
    #[arg(long)]
    new_netns: bool,

    /// SOURCE:DEST[:ro] binds into the container view.
    #[arg(long = "bind")]
    binds: Vec<String>,

    /// Bind /etc/hosts and /etc/resolv.conf from the host.
    #[arg(long)]
    bind_dns: bool,

    #[arg(long, default_value = "/dev/null")]
    stdin: PathBuf,

    #[arg(long, default_value = "/dev/null")]
    stdout: PathBuf,

    #[arg(long, default_value = "/dev/null")]
    stderr: PathBuf,

    /// Capability bitmask kept by the container (root tasks only).
    #[arg(long, default_value_t = 0)]
    caps: u64,

    /// RESOURCE=SOFT:HARD by numeric resource id.
    #[arg(long = "rlimit")]
    rlimits: Vec<String>,

    #[arg(long)]
    log_level: Option<log::LevelFilter>,

    /// Command to run inside the container.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

fn parse_bind(spec: &str) -> Result<BindMap> {
    let parts: Vec<&str> = spec.split(':').collect();
    match parts.as_slice() {
        [source, dest] => Ok(BindMap {
            source: PathBuf::from(source),
            dest: PathBuf::from(dest),
            rdonly: false,
        }),
        [source, dest, "ro"] => Ok(BindMap {
            source: PathBuf::from(source),
            dest: PathBuf::from(dest),
            rdonly: true,
        }),
        _ => Err(anyhow!("Invalid bind spec: {}", spec)),
    }
}

fn parse_rlimit(spec: &str) -> Result<(i32, (u64, u64))> {
    let (resource, limits) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid rlimit spec: {}", spec))?;
    let (soft, hard) = limits
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid rlimit spec: {}", spec))?;

    Ok((
        resource
            .parse()
            .context(format!("Invalid resource id in: {}", spec))?,
        (
            soft.parse().context(format!("Invalid soft limit in: {}", spec))?,
            hard.parse().context(format!("Invalid hard limit in: {}", spec))?,
        ),
    ))
}

fn main() -> Result<()> {
    let logger = VesselLogger::new(log::LevelFilter::Trace)
        .init()
        .map_err(|e| anyhow!("Failed to initialize logger: {}", e))?;

    let args = Args::parse();

    let config = resolve_config().context("Resolving config")?;

    logger.set_level(args.log_level.unwrap_or(config.log_level));
    logger.print_deferred();

    if !geteuid().is_root() {
        return Err(anyhow!(
            "Insufficient permissions to launch a container, please retry using `sudo`"
        ));
    }

    init_last_cap().map_err(|e| anyhow!("Reading cap_last_cap: {}", e))?;

    let mut rlimit = BTreeMap::new();
    for spec in &args.rlimits {
        let (resource, limits) = parse_rlimit(spec)?;
        rlimit.insert(resource, limits);
    }

    let mut env = TaskEnv {
        command: shell_words::join(&args.command),
        cwd: args.cwd.clone(),
        create_cwd: args.create_cwd,
        root: args.root.clone(),
        root_rdonly: args.root_rdonly,
        loop_image: args.loop_image.clone(),
        loop_dev: args.loop_dev,
        user: args.user.clone(),
        group: args.group.clone(),
        environ: args.environ.clone(),
        isolate: args.isolate,
        stdin_path: args.stdin.clone(),
        stdout_path: args.stdout.clone(),
        stderr_path: args.stderr.clone(),
        hostname: args.hostname.clone(),
        bind_dns: args.bind_dns,
        bind_map: args
            .binds
            .iter()
            .map(|spec| parse_bind(spec))
            .collect::<Result<Vec<_>>>()?,
        net_cfg: NetCfg {
            new_net_ns: args.new_netns,
            ..NetCfg::default()
        },
        caps: args.caps,
        rlimit,
        new_mount_ns: args.new_mount_ns,
        ..TaskEnv::default()
    };

    env.prepare().map_err(|e| anyhow!("Preparing task: {}", e))?;

    /* The init reparents to us once the intermediate exits; without this
     * it would fall through to pid 1 and we could not wait for it. */
    set_child_subreaper().map_err(|e| anyhow!("{}", e))?;

    let mut task = Task::new(env);
    task.start(&config).map_err(|e| anyhow!("Starting task: {}", e))?;

    let pid = task.get_pid();
    log::trace!("Started container init {}", pid);

    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Ok(WaitStatus::Exited(_, code)) => {
                task.exit(code);
                logger.flush();
                std::process::exit(code);
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                task.exit(128 + signal as i32);
                logger.flush();
                std::process::exit(128 + signal as i32);
            }
            Ok(_) => continue,
            Err(e) => {
                return Err(anyhow!("Waiting for container init {}: {}", pid, e));
            }
        }
    }
}
