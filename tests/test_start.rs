use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{Pid, Uid};
use std::path::PathBuf;
use std::sync::Mutex;
use vessel::config::Config;
use vessel::error::ErrorKind;
use vessel::task::{Task, TaskEnv};
use vessel::util::set_child_subreaper;

/* One launch at a time: the intermediate forks from a threaded test
 * process, keep the other test threads parked while it runs. */
static START_MUTEX: Mutex<()> = Mutex::new(());

/* Launch scenarios need root: stdio reopening chowns files and the
 * capability clamp manipulates the bounding set. Everything that can be
 * verified unprivileged lives in the other test files. */
fn skip_without_root() -> bool {
    if !Uid::effective().is_root() {
        eprintln!("skipping: this test needs root");
        return true;
    }
    false
}

fn minimal_env(command: &str) -> TaskEnv {
    let mut env = TaskEnv {
        command: command.to_string(),
        root: PathBuf::from("/"),
        cwd: PathBuf::from("/"),
        user: "root".to_string(),
        stdin_path: PathBuf::from("/dev/null"),
        stdout_path: PathBuf::from("/dev/null"),
        stderr_path: PathBuf::from("/dev/null"),
        ..TaskEnv::default()
    };
    /* Keep the host's network view: no CLONE_NEWNET, no device pass. */
    env.net_cfg.new_net_ns = false;
    env
}

#[test]
fn test_minimal_root_shared_launch() {
    let _guard = START_MUTEX.lock().expect("lock");
    if skip_without_root() {
        return;
    }

    vessel::caps::init_last_cap().expect("cap_last_cap");
    set_child_subreaper().expect("subreaper");

    let mut env = minimal_env("/bin/true");
    env.prepare().expect("prepare");

    let mut task = Task::new(env);
    task.start(&Config::default()).expect("start");

    let pid = task.get_pid();
    assert!(pid > 0);
    assert!(task.is_running());

    /* The init reparented to us via the subreaper arrangement, so we
     * can reap it like the daemon's master would. */
    match waitpid(Pid::from_raw(pid), None).expect("waitpid") {
        WaitStatus::Exited(_, code) => {
            task.exit(code);
            assert_eq!(code, 0);
        }
        other => panic!("unexpected wait status: {:?}", other),
    }
    assert!(!task.is_running());
}

#[test]
fn test_exec_failure_reaches_supervisor() {
    let _guard = START_MUTEX.lock().expect("lock");
    if skip_without_root() {
        return;
    }

    vessel::caps::init_last_cap().expect("cap_last_cap");
    set_child_subreaper().expect("subreaper");

    let mut env = minimal_env("/no/such/binary-42");
    env.prepare().expect("prepare");

    let mut task = Task::new(env);
    let error = task.start(&Config::default()).expect_err("exec must fail");

    /* The init's execvpe error travels the status pipe verbatim and the
     * half constructed container is gone. */
    assert_eq!(error.kind, ErrorKind::InvalidValue);
    assert_eq!(error.errno, libc::ENOENT);
    assert_eq!(task.get_pid(), 0);
    assert!(!task.is_running());
}

#[test]
fn test_environ_reaches_command() {
    let _guard = START_MUTEX.lock().expect("lock");
    if skip_without_root() {
        return;
    }

    vessel::caps::init_last_cap().expect("cap_last_cap");
    set_child_subreaper().expect("subreaper");

    let out = tempfile::NamedTempFile::new().expect("tempfile");
    let out_path = out.path().to_path_buf();

    let mut env = minimal_env("/bin/sh -c 'echo $VESSEL_PROBE'");
    env.environ = vec![
        "PATH=/bin:/usr/bin".to_string(),
        "VESSEL_PROBE=it-works".to_string(),
    ];
    env.stdout_path = out_path.clone();
    env.prepare().expect("prepare");

    let mut task = Task::new(env);
    task.start(&Config::default()).expect("start");

    let pid = task.get_pid();
    waitpid(Pid::from_raw(pid), None).expect("waitpid");

    let output = std::fs::read_to_string(&out_path).expect("read output");
    assert!(output.contains("it-works"));
}
