// vim: tw=80
use assert_cmd::prelude::*;
use std::{fs, time::Duration};

use nix::{
    errno::Errno,
    sys::signal::kill,
    unistd::Pid,
};
use pretty_assertions::assert_eq;
use predicates::prelude::*;
use rstest::rstest;
use tempfile::{Builder, TempDir};

use super::super::*;

const SCENARIOS: [&str; 5] =
    ["basic", "rewrite", "multi-thread", "multi-volume", "rebuild"];

fn tempdir() -> TempDir {
    Builder::new()
        .prefix(concat!(module_path!(), "."))
        .tempdir()
        .unwrap()
}

/// Every scenario passes against the simulator
#[test]
fn sim() {
    let tempdir = tempdir();
    let output = spor()
        .args(["run", "--quick", "--result-dir"])
        .arg(tempdir.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8(output.stdout).unwrap();
    let expected = SCENARIOS.iter()
        .map(|name| format!("{name}: pass"))
        .collect::<Vec<_>>();
    assert_eq!(stdout.lines().collect::<Vec<_>>(), expected);
    for name in SCENARIOS {
        let path = tempdir.path().join(format!("{name}.result"));
        let contents = fs::read_to_string(path).unwrap();
        assert!(contents.starts_with("pass (0)\n"), "{contents}");
    }
}

/// Only the named scenarios run, in the order given
#[test]
fn subset() {
    let tempdir = tempdir();
    spor()
        .args(["run", "-q", "-r"])
        .arg(tempdir.path())
        .args(["rebuild", "basic"])
        .assert()
        .success()
        .stdout("rebuild: pass\nbasic: pass\n");
    let mut artifacts = fs::read_dir(tempdir.path()).unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect::<Vec<_>>();
    artifacts.sort();
    assert_eq!(artifacts, vec!["basic.result", "rebuild.result"]);
}

/// The result directory comes from the configuration file unless overridden
#[rstest]
#[case(false)]
#[case(true)]
fn result_dir(#[case] overridden: bool) {
    let tempdir = tempdir();
    let configured = tempdir.path().join("configured");
    let cmdline = tempdir.path().join("cmdline");
    let config = write_config(tempdir.path(), &format!(
        "result_dir: {}\nquick: true\n", configured.display()));
    let mut cmd = spor();
    cmd.arg("--config").arg(&config).arg("run");
    if overridden {
        cmd.arg("--result-dir").arg(&cmdline);
    }
    cmd.arg("basic").assert().success();
    assert_eq!(configured.join("basic.result").exists(), !overridden);
    assert_eq!(cmdline.join("basic.result").exists(), overridden);
}

/// A service that loses acknowledged writes fails every scenario, and the
/// exit status says so.
#[test]
fn lost_writes() {
    let tempdir = tempdir();
    let config = write_config(tempdir.path(), &format!(
        "result_dir: {}\nsim:\n  lose_acked_writes: true\n",
        tempdir.path().display()));
    let output = spor()
        .arg("--config")
        .arg(&config)
        .args(["run", "--quick", "basic", "multi-thread"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout, "basic: fail\nmulti-thread: fail\n");
    let contents = fs::read_to_string(tempdir.path().join("basic.result"))
        .unwrap();
    assert!(contents.starts_with("fail (0)\n"), "{contents}");
    assert!(contents.contains("outcome: mismatch"), "{contents}");
}

#[test]
fn unknown_scenario() {
    let tempdir = tempdir();
    spor()
        .args(["run", "--result-dir"])
        .arg(tempdir.path())
        .arg("crash")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown scenario"));
    assert_eq!(fs::read_dir(tempdir.path()).unwrap().count(), 0);
}

#[test]
fn invalid_config() {
    let tempdir = tempdir();
    let config = write_config(tempdir.path(), "volumes: []\n");
    spor()
        .arg("--config")
        .arg(&config)
        .args(["run", "basic"])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty());
}

/// Drive a real child process through a stand-in administrative client.
///
/// The client acknowledges every request, and always reports the array as
/// rebuilding.  Volumes are plain files, which survive the crash.
#[test]
fn process() {
    let tempdir = tempdir();
    let dir = tempdir.path();
    let pidfile = dir.join("pids");
    let service = dir.join("service.sh");
    fs::write(&service, format!("echo $$ >> {}\nexec sleep 1000\n",
                                pidfile.display())).unwrap();
    let cli = dir.join("cli.sh");
    fs::write(&cli, r#"
case "$1 $2" in
    "array list") situation=REBUILDING ;;
    *) situation=NORMAL ;;
esac
echo "{\"Response\":{\"result\":{\"status\":{\"code\":0},\"data\":{\"situation\":\"$situation\"}}}}"
"#).unwrap();
    let device = dir.join("vol1");
    fs::File::create(&device).unwrap().set_len(16 << 20).unwrap();
    let results = dir.join("results");
    let config = write_config(dir, &format!(r#"
target: process
service:
  command: [sh, {}]
  startup_timeout_secs: 10
cli: [sh, {}]
volumes:
  - id: 1
    name: vol1
    size: 16M
    device: {}
poll_interval_ms: 10
state_timeout_secs: 10
result_dir: {}
"#, service.display(), cli.display(), device.display(), results.display()));

    let output = spor()
        .arg("--config")
        .arg(&config)
        .args(["run", "--quick"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8(output.stdout).unwrap();
    for name in SCENARIOS {
        assert!(stdout.contains(&format!("{name}: pass")), "{stdout}");
    }

    // One clean start and one dirty start per scenario, at least
    let pids = fs::read_to_string(&pidfile).unwrap()
        .lines()
        .map(|l| Pid::from_raw(l.trim().parse().unwrap()))
        .collect::<Vec<_>>();
    assert!(pids.len() >= 2 * SCENARIOS.len(), "{pids:?}");
    // And none of them outlive the run
    waitfor(Duration::from_secs(5), || {
        pids.iter().all(|&pid| kill(pid, None) == Err(Errno::ESRCH))
    }).unwrap();
}
