use nix::unistd::getpid;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use vessel::task::{Task, TaskEnv};

fn spawn_sleeper() -> Child {
    Command::new("/bin/sleep")
        .arg("30")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn sleeper")
}

fn adopted(pid: i32) -> Task {
    let mut task = Task::new(TaskEnv::default());
    task.restore(pid);
    task
}

#[test]
fn test_restore_reports_running() {
    let mut child = spawn_sleeper();
    let task = adopted(child.id() as i32);

    assert!(task.is_running());
    assert_eq!(task.get_pid(), child.id() as i32);
    assert!(!task.is_zombie());

    /* A process we spawned directly has us as its parent. */
    assert_eq!(task.get_ppid().expect("ppid"), getpid());

    child.kill().expect("kill sleeper");
    child.wait().expect("reap sleeper");
}

#[test]
fn test_zombie_detection() {
    let mut child = Command::new("/bin/true")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn true");
    let task = adopted(child.id() as i32);

    /* Unreaped, the exited child shows up as Z in /proc. */
    let deadline = Instant::now() + Duration::from_secs(10);
    while !task.is_zombie() {
        assert!(Instant::now() < deadline, "child never became a zombie");
        std::thread::sleep(Duration::from_millis(10));
    }

    /* Zombies still answer PPid queries. */
    assert_eq!(task.get_ppid().expect("ppid"), getpid());

    child.wait().expect("reap");
    assert!(!task.is_zombie());
}

#[test]
fn test_kill_delivers_signal() {
    let mut child = spawn_sleeper();
    let task = adopted(child.id() as i32);

    task.kill(nix::sys::signal::Signal::SIGTERM)
        .expect("kill running task");

    let status = child.wait().expect("reap");
    assert!(!status.success());
}

#[test]
fn test_exit_transition() {
    let mut task = adopted(12345);
    assert!(task.is_running());

    task.exit(7);
    assert!(!task.is_running());
    assert_eq!(task.get_exit_status(), 7);
    /* The pid survives exit; only a failed start clears it. */
    assert_eq!(task.get_pid(), 12345);
}

#[test]
fn test_restore_after_exit_is_left_inverse() {
    let mut child = spawn_sleeper();
    let pid = child.id() as i32;

    let mut task = adopted(pid);
    task.exit(0);
    assert!(!task.is_running());

    /* A second adoption of a live pid brings the handle back. */
    task.restore(pid);
    assert!(task.is_running());
    assert_eq!(task.get_pid(), pid);
    assert_eq!(task.get_exit_status(), 0);

    child.kill().expect("kill");
    child.wait().expect("reap");
}
