use crate::error::{TaskError, TaskResult};
use nix::unistd::Pid;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

pub const FREEZER: &str = "freezer";

/// Subsystem name to leaf mapping a task should occupy. Ordered so the
/// attach sequence is stable.
pub type LeafCgroups = BTreeMap<String, CgroupLeaf>;

/// The deepest cgroup a container occupies in one subsystem hierarchy.
/// Creation and discovery of hierarchies belong to the cgroup subsystem
/// proper; the engine only attaches pids and compares paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupLeaf {
    subsystem: String,
    /// Hierarchy mount point on the host, e.g. /sys/fs/cgroup/freezer.
    mount: PathBuf,
    /// Path below the mount point, stored with a leading slash as it
    /// appears in /proc/<pid>/cgroup.
    rel: PathBuf,
}

impl CgroupLeaf {
    pub fn new(
        subsystem: impl Into<String>,
        mount: impl Into<PathBuf>,
        rel: impl Into<PathBuf>,
    ) -> CgroupLeaf {
        let rel = rel.into();
        let rel = if rel.is_absolute() {
            rel
        } else {
            Path::new("/").join(rel)
        };
        CgroupLeaf {
            subsystem: subsystem.into(),
            mount: mount.into(),
            rel,
        }
    }

    /// The hierarchy root of a subsystem, used to repair net_cls drift
    /// when networking is disabled.
    pub fn root(subsystem: impl Into<String>, mount: impl Into<PathBuf>) -> CgroupLeaf {
        CgroupLeaf::new(subsystem, mount, "/")
    }

    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    /// Path relative to the hierarchy mount, as /proc/<pid>/cgroup prints it.
    pub fn rel_path(&self) -> &Path {
        &self.rel
    }

    fn procs_file(&self) -> PathBuf {
        let rel = self.rel.strip_prefix("/").unwrap_or(&self.rel);
        self.mount.join(rel).join("cgroup.procs")
    }

    pub fn attach(&self, pid: Pid) -> TaskResult<()> {
        let procs = self.procs_file();
        std::fs::write(&procs, format!("{}\n", pid)).map_err(|e| {
            TaskError::os(
                nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(0)),
                format!("attach {} to {}", pid, procs.display()),
            )
        })
    }
}

/// Parse /proc/<pid>/cgroup into a subsystem -> path map. Compound v1
/// entries keep their compound key ("cpu,cpuacct"); the v2 entry gets the
/// empty key.
pub fn task_cgroups(pid: Pid) -> TaskResult<HashMap<String, String>> {
    let path = format!("/proc/{}/cgroup", pid);
    let text = std::fs::read_to_string(&path).map_err(|e| {
        TaskError::os(
            nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(0)),
            format!("read {}", path),
        )
    })?;

    Ok(parse_cgroup_lines(&text))
}

fn parse_cgroup_lines(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let mut fields = line.splitn(3, ':');
        let _id = fields.next();
        let subsystems = match fields.next() {
            Some(s) => s,
            None => continue,
        };
        let path = match fields.next() {
            Some(p) => p,
            None => continue,
        };

        /* A v1 field may carry a named hierarchy ("name=systemd"). */
        let key = subsystems.strip_prefix("name=").unwrap_or(subsystems);
        map.insert(key.to_string(), path.to_string());
    }
    map
}
