use rstest::rstest;
use std::os::unix::fs::symlink;
use std::path::PathBuf;
use vessel::error::ErrorKind;
use vessel::task::{BindMap, TaskEnv};

fn env_with_bind(root: &std::path::Path, dest: &str, rdonly: bool) -> TaskEnv {
    TaskEnv {
        command: "/bin/true".to_string(),
        root: root.to_path_buf(),
        cwd: PathBuf::from("/"),
        bind_map: vec![BindMap {
            source: PathBuf::from("/etc"),
            dest: PathBuf::from(dest),
            rdonly,
        }],
        ..TaskEnv::default()
    }
}

#[rstest]
#[case("../../../etc")]
#[case("/../../../etc")]
#[case("a/../../../../etc")]
fn test_prepare_rejects_escaping_binds(#[case] dest: &str) {
    let root = tempfile::tempdir().expect("tempdir");
    let mut env = env_with_bind(root.path(), dest, true);

    let err = env.prepare().expect_err("escape must be rejected");
    assert_eq!(err.kind, ErrorKind::InvalidValue);
}

#[rstest]
#[case("/mnt/etc")]
#[case("data")]
#[case("/deeply/nested/target")]
fn test_prepare_accepts_inner_binds(#[case] dest: &str) {
    let root = tempfile::tempdir().expect("tempdir");
    let mut env = env_with_bind(root.path(), dest, false);

    env.prepare().expect("bind inside the root is fine");
}

#[test]
fn test_prepare_rejects_symlink_escape() {
    let root = tempfile::tempdir().expect("tempdir");
    symlink("/usr", root.path().join("jump")).expect("symlink");

    let mut env = env_with_bind(root.path(), "/jump/bin", true);

    let err = env.prepare().expect_err("symlink escape must be rejected");
    assert_eq!(err.kind, ErrorKind::InvalidValue);
}

#[test]
fn test_prepare_follows_symlinks_that_stay_inside() {
    let root = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(root.path().join("real")).expect("mkdir");
    symlink("real", root.path().join("alias")).expect("symlink");

    let mut env = env_with_bind(root.path(), "/alias/sub", false);

    env.prepare().expect("symlink inside the root is fine");
}

#[test]
fn test_prepare_resolves_user() {
    let mut env = TaskEnv {
        command: "/bin/true".to_string(),
        root: PathBuf::from("/"),
        cwd: PathBuf::from("/"),
        user: "root".to_string(),
        ..TaskEnv::default()
    };

    env.prepare().expect("resolve root");
    assert!(env.cred.is_root());
    assert!(!env.cred.groups.is_empty());
}

#[test]
fn test_environ_order_is_preserved() {
    let env = TaskEnv {
        environ: vec![
            "B=2".to_string(),
            "A=1".to_string(),
            "C=3".to_string(),
            "A=4".to_string(),
        ],
        ..TaskEnv::default()
    };

    /* Order matters: duplicates and ordering go to execve verbatim. */
    assert_eq!(env.environ, vec!["B=2", "A=1", "C=3", "A=4"]);
    assert!(env.env_has_key("A"));
    assert!(env.env_has_key("B"));
}

#[test]
fn test_command_word_splitting_preserves_quotes() {
    let env = TaskEnv {
        command: r#"/usr/bin/find / -name "*.log" -exec rm {} \;"#.to_string(),
        ..TaskEnv::default()
    };

    let words = env.split_command().expect("split");
    assert_eq!(words[0], "/usr/bin/find");
    assert_eq!(words[3], "*.log");
    assert_eq!(words.last().map(String::as_str), Some(";"));
}
