pub mod child;
pub mod env;
pub mod start;

pub use env::{BindMap, ScratchDir, TaskEnv};

use crate::cgroup::{task_cgroups, CgroupLeaf, FREEZER};
use crate::config::Config;
use crate::error::{TaskError, TaskResult};
use log::{error, trace, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getppid, Pid};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Stopped,
    Started,
}

/// A container's init process as tracked by the supervisor: launch,
/// signal, exit bookkeeping and restore-after-restart verification.
pub struct Task {
    pub(crate) env: Option<Arc<TaskEnv>>,
    state: TaskState,
    pub(crate) pid: i32,
    exit_status: i32,
    /// Keeps a created scratch cwd alive (and cleaned up) with the task.
    pub(crate) scratch_cwd: Option<ScratchDir>,
}

impl Task {
    pub fn new(env: TaskEnv) -> Task {
        Task {
            env: Some(Arc::new(env)),
            state: TaskState::Stopped,
            pid: 0,
            exit_status: 0,
            scratch_cwd: None,
        }
    }

    pub fn get_pid(&self) -> i32 {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.state == TaskState::Started
    }

    pub fn get_exit_status(&self) -> i32 {
        self.exit_status
    }

    /// Record the wait status collected by the supervisor loop.
    pub fn exit(&mut self, status: i32) {
        self.exit_status = status;
        self.state = TaskState::Stopped;
    }

    pub fn kill(&self, signal: Signal) -> TaskResult<()> {
        if self.pid == 0 {
            error!("Tried to kill a task that is not running");
            return Err(TaskError::invalid("kill on a stopped task"));
        }

        trace!("kill {} {}", signal, self.pid);

        kill(Pid::from_raw(self.pid), signal)
            .map_err(|e| TaskError::os(e, format!("kill({})", self.pid)))
    }

    /// Adopt a pid discovered after a supervisor restart, without any
    /// launch sequence. Callers are expected to verify the adoption with
    /// `has_correct_parent` and `has_correct_freezer`.
    pub fn restore(&mut self, pid: i32) {
        self.exit_status = 0;
        self.pid = pid;
        self.state = TaskState::Started;
    }

    /// Forget the launch environment once it is no longer needed.
    pub fn clear_env(&mut self) {
        self.env = None;
    }

    /// The working directory created for this task, if any. It is removed
    /// when the task is dropped.
    pub fn scratch_cwd(&self) -> Option<&std::path::Path> {
        self.scratch_cwd.as_ref().map(ScratchDir::path)
    }

    pub(crate) fn status_field(&self, field: &str) -> Option<String> {
        let text = std::fs::read_to_string(format!("/proc/{}/status", self.pid)).ok()?;
        let prefix = format!("{}:\t", field);
        text.lines()
            .find(|line| line.starts_with(&prefix))
            .map(|line| line[prefix.len()..].to_string())
    }

    /// Exited but not yet reaped. Zombies have no usable cgroup info.
    pub fn is_zombie(&self) -> bool {
        match self.status_field("State") {
            Some(state) => state.starts_with('Z'),
            None => false,
        }
    }

    pub fn get_ppid(&self) -> TaskResult<Pid> {
        self.status_field("PPid")
            .and_then(|value| value.trim().parse::<i32>().ok())
            .map(Pid::from_raw)
            .ok_or_else(|| {
                warn!("Can't parse /proc/{}/status", self.pid);
                TaskError::invalid(format!("Can't parse /proc/{}/status", self.pid))
            })
    }

    /// True iff the init has been reparented to this supervisor's parent,
    /// which is what a launch through the intermediate guarantees.
    pub fn has_correct_parent(&self) -> bool {
        match self.get_ppid() {
            Err(error) => {
                trace!("Can't get ppid of restored task: {}", error);
                false
            }
            Ok(ppid) => {
                if ppid != getppid() {
                    trace!("Invalid ppid of restored task: {} != {}", ppid, getppid());
                    return false;
                }
                true
            }
        }
    }

    /// A restored task must still sit in its configured freezer cgroup;
    /// pids may have wrapped or the stored state may be stale otherwise.
    pub fn has_correct_freezer(&mut self) -> bool {
        let cgmap = match task_cgroups(Pid::from_raw(self.pid)) {
            Err(error) => {
                trace!(
                    "Can't read {} cgroups of restored task: {}",
                    self.pid,
                    error
                );
                return false;
            }
            Ok(cgmap) => cgmap,
        };

        let leaf = match self.env.as_ref().and_then(|env| env.leaf_cgroups.get(FREEZER)) {
            Some(leaf) => leaf.clone(),
            None => {
                warn!("Task {} has no freezer cgroup configured", self.pid);
                return false;
            }
        };

        let actual = cgmap.get(FREEZER).map(String::as_str).unwrap_or("");
        if leaf.rel_path() != std::path::Path::new(actual) {
            /* A zombie has no cgroup info worth comparing. */
            if self.is_zombie() {
                return true;
            }

            warn!(
                "Unexpected freezer cgroup of restored task {}: {} != {}",
                self.pid,
                leaf.rel_path().display(),
                actual
            );
            self.pid = 0;
            self.state = TaskState::Stopped;
            return false;
        }

        true
    }

    /// Reattach the task to every configured leaf it has drifted out of.
    /// Compound subsystem entries are left alone. With networking
    /// disabled, net_cls drift is repaired back to the hierarchy root.
    pub fn fix_cgroups(&self, config: &Config) -> TaskResult<()> {
        if self.is_zombie() {
            return Ok(());
        }

        let env = self
            .env
            .as_ref()
            .ok_or_else(|| TaskError::invalid("fix_cgroups on a task without environment"))?;

        let pid = Pid::from_raw(self.pid);
        let cgmap = task_cgroups(pid)?;

        for (subsystem, path) in &cgmap {
            match env.leaf_cgroups.get(subsystem) {
                None => {
                    if subsystem.contains(',') {
                        continue;
                    }

                    if subsystem == "net_cls" && !config.network_enabled {
                        if path == "/" {
                            continue;
                        }

                        warn!("No network, disabled net_cls:{}", path);

                        let root = CgroupLeaf::root("net_cls", "/sys/fs/cgroup/net_cls");
                        if let Err(error) = root.attach(pid) {
                            error!("Can't reattach to root: {}", error);
                        }
                        continue;
                    }

                    warn!("Skip {}: task belongs to unknown subsystem", subsystem);
                }
                Some(leaf) => {
                    if leaf.rel_path() != std::path::Path::new(path) {
                        warn!("Fixed invalid task subsystem for {}:{}", subsystem, path);

                        if let Err(error) = leaf.attach(pid) {
                            error!("Can't fix: {}", error);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    fn running_task(pid: i32) -> Task {
        let mut task = Task::new(TaskEnv::default());
        task.restore(pid);
        task
    }

    #[test]
    fn test_state_machine() {
        let mut task = Task::new(TaskEnv::default());
        assert!(!task.is_running());
        assert_eq!(task.get_pid(), 0);

        task.restore(4242);
        assert!(task.is_running());
        assert_eq!(task.get_pid(), 4242);
        assert_eq!(task.get_exit_status(), 0);

        task.exit(137);
        assert!(!task.is_running());
        assert_eq!(task.get_exit_status(), 137);
    }

    #[test]
    fn test_kill_stopped_task_refused() {
        let task = Task::new(TaskEnv::default());
        assert!(task.kill(Signal::SIGKILL).is_err());
    }

    #[test]
    fn test_get_ppid_of_self() {
        let task = running_task(getpid().as_raw());
        assert_eq!(task.get_ppid().expect("ppid"), getppid());
    }

    #[test]
    fn test_self_is_not_zombie() {
        let task = running_task(getpid().as_raw());
        assert!(!task.is_zombie());
    }

    #[test]
    fn test_has_correct_parent_for_self() {
        /* Our own ppid is by definition the ppid of the test process, so
         * the check against getppid() holds. */
        let task = running_task(getpid().as_raw());
        assert!(task.has_correct_parent());
    }

    #[test]
    fn test_missing_pid_has_no_status() {
        let task = running_task(i32::MAX - 1);
        assert!(!task.is_zombie());
        assert!(task.get_ppid().is_err());
        assert!(!task.has_correct_parent());
    }

    #[test]
    fn test_has_correct_freezer_without_config_is_false() {
        let mut task = running_task(getpid().as_raw());
        /* No freezer leaf configured: restore must not be trusted. */
        assert!(!task.has_correct_freezer());
    }
}
