#![allow(dead_code)]

use std::fs::File;
use std::io::Read;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::OnceLock;

use palisade::spawn::{spawn, SpawnRequest};
use palisade::{
    error_channel, Action, ChildHandle, ErrorReport, Exec, ExitStatus, MapIdentity, Namespace,
    NamespaceSet, PivotRoot, Redirect,
};

pub const PATH: &str = "PATH=/usr/local/bin:/usr/bin:/bin:/usr/local/sbin:/usr/sbin:/sbin";

/// Host directories needed to run `/bin/sh` and coreutils inside a new root.
const SYSTEM_DIRS: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64"];

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A user and a mount namespace: enough to pivot and mount without privileges on the host.
pub fn sandbox_namespaces() -> NamespaceSet {
    NamespaceSet::default()
        .with(Namespace::User)
        .with(Namespace::Mount)
}

/// Run `script` with `/bin/sh -c`.
pub fn script(script: &str) -> Action {
    Exec::from_strs("/bin/sh", ["sh", "-c", script], [PATH])
        .expect("script contains no NUL")
        .into()
}

/// Bind the host's system directories into the new root, skipping any that don't exist.
pub fn with_system_dirs(mut pivot: PivotRoot) -> eyre::Result<PivotRoot> {
    for dir in SYSTEM_DIRS {
        if Path::new(dir).exists() {
            pivot = pivot.mount(dir, dir)?;
        }
    }
    Ok(pivot)
}

/// What a finished child did.
#[derive(Debug)]
pub struct Outcome {
    pub report: Option<ErrorReport>,
    pub status: ExitStatus,
    pub stdout: String,
}

/// A started child, with its stdout captured.
pub struct Running {
    pub child: ChildHandle,
    pub report: Option<ErrorReport>,
    stdout: File,
}

impl Running {
    pub fn finish(mut self) -> eyre::Result<Outcome> {
        let mut stdout = String::new();
        self.stdout.read_to_string(&mut stdout)?;
        let status = self.child.wait()?;
        Ok(Outcome {
            report: self.report,
            status,
            stdout,
        })
    }
}

fn pipe() -> eyre::Result<(File, OwnedFd)> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let [read, write] = fds;
    Ok(unsafe { (File::from_raw_fd(read), OwnedFd::from_raw_fd(write)) })
}

/// Spawn a child running `actions`, with its stdout redirected to a pipe first.
///
/// Waits until the child has either executed its program or reported a failure.
pub fn start(namespaces: NamespaceSet, actions: Vec<Action>) -> eyre::Result<Running> {
    init_logging();

    let (stdout, stdout_tx) = pipe()?;
    let mut all_actions: Vec<Action> = vec![Redirect::new(stdout_tx, libc::STDOUT_FILENO).into()];
    all_actions.extend(actions);

    let (reader, writer) = error_channel()?;
    let child = spawn(SpawnRequest {
        namespaces,
        actions: &all_actions,
        errors: &writer,
        forward_logs: true,
    })?;

    // Close our copies of the write ends, so both reads see EOF once the child is done.
    drop(writer);
    drop(all_actions);

    let report = reader.read_report()?;
    Ok(Running {
        child,
        report,
        stdout,
    })
}

/// [`start`], then wait for the child to exit.
pub fn run(namespaces: NamespaceSet, actions: Vec<Action>) -> eyre::Result<Outcome> {
    start(namespaces, actions)?.finish()
}

/// Whether this kernel has `clone3(2)` with pidfds, and lets us use it.
pub fn clone3_supported() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| match run(NamespaceSet::default(), vec![]) {
        Ok(outcome) => outcome.status.success(),
        Err(e) => {
            eprintln!("skipping: clone3 unavailable: {e}");
            false
        }
    })
}

/// Whether unprivileged user namespaces work well enough to pivot into a tmpfs.
pub fn sandbox_supported() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| match check_sandbox() {
        Ok(()) => true,
        Err(e) => {
            eprintln!("skipping: user namespaces unavailable: {e}");
            false
        }
    })
}

fn check_sandbox() -> eyre::Result<()> {
    let actions = vec![
        MapIdentity::current().into(),
        with_system_dirs(PivotRoot::tmpfs_default())?.into(),
    ];
    let outcome = run(sandbox_namespaces(), actions)?;
    if let Some(report) = outcome.report {
        eyre::bail!("sandbox check failed: {report}");
    }
    eyre::ensure!(
        outcome.status.success(),
        "sandbox check exited with {:?}",
        outcome.status
    );
    Ok(())
}
