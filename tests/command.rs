use std::fs::File;
use std::io::Read;
use std::os::fd::{FromRawFd, OwnedFd};

use c_str_macro::c_str;
use palisade::{Command, ExitStatus, Mount, Namespace, PivotRoot, SpawnError};

mod common;

/// A pipe, as `(read_end, write_end)`.
fn pipe() -> eyre::Result<(File, OwnedFd)> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let [read, write] = fds;
    Ok(unsafe { (File::from_raw_fd(read), OwnedFd::from_raw_fd(write)) })
}

#[test]
fn sandboxed_command_runs_in_its_new_root() -> eyre::Result<()> {
    if !common::sandbox_supported() {
        return Ok(());
    }

    let (mut stdout, stdout_tx) = pipe()?;

    let mut cmd = Command::new("/bin/sh");
    cmd.verbose(true);
    cmd.args(["-c", r#"pwd; id -u; echo "$GREETING"; test -d /scratch && echo scratch"#]);
    cmd.env_clear();
    cmd.env("PATH", "/usr/bin:/bin");
    cmd.env("GREETING", "hi");
    cmd.unshare(Namespace::User);
    cmd.unshare(Namespace::Mount);
    cmd.map_current_identity();
    cmd.pivot_root(common::with_system_dirs(PivotRoot::tmpfs_default())?);
    cmd.mount(Mount::tmpfs(c_str!("/scratch")));
    cmd.current_dir("/scratch");
    cmd.stdout(stdout_tx);

    let child = cmd.spawn()?;
    let mut output = String::new();
    stdout.read_to_string(&mut output)?;
    assert_eq!(child.wait()?, ExitStatus::Code(0));
    assert_eq!(output, "/scratch\n0\nhi\nscratch\n");
    Ok(())
}

#[test]
fn failed_setup_is_returned_from_spawn() -> eyre::Result<()> {
    if !common::clone3_supported() {
        return Ok(());
    }

    let dir = tempfile::tempdir()?;
    let mut cmd = Command::new("/bin/sh");
    cmd.current_dir(dir.path().join("missing"));

    match cmd.spawn() {
        Err(SpawnError::Action(report)) => {
            assert_eq!(report.label, "chdir");
            assert!(report.message.contains("missing"));
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(child) => panic!("spawn should fail, but started pid {}", child.pid()),
    }
    Ok(())
}

#[test]
fn missing_program_fails_at_exec() -> eyre::Result<()> {
    if !common::clone3_supported() {
        return Ok(());
    }

    let err = Command::new("/no/such/program").spawn().unwrap_err();
    match err {
        SpawnError::Action(report) => {
            assert_eq!(report.label, "exec");
            assert!(report.message.starts_with("/no/such/program: "));
            assert!(report.message.ends_with(&format!("(errno {})", libc::ENOENT)));
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[test]
fn child_can_be_signalled() -> eyre::Result<()> {
    if !common::clone3_supported() {
        return Ok(());
    }

    let mut cmd = Command::new("/bin/sh");
    cmd.args(["-c", "exec sleep 10"]);
    let child = cmd.spawn()?;
    child.signal(libc::SIGKILL)?;
    assert_eq!(child.wait()?, ExitStatus::Signal(libc::SIGKILL));
    Ok(())
}
