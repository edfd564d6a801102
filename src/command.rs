use std::collections::BTreeMap;
use std::ffi::{c_int, CString};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::action::{c_path, c_string, Action, Chdir, Exec, Redirect};
use crate::channel::error_channel;
use crate::error::SpawnError;
use crate::identity::MapIdentity;
use crate::libc_util::{self, ExitStatus};
use crate::mount::Mount;
use crate::pivot::PivotRoot;
use crate::spawn::{self, ChildHandle, Namespace, NamespaceSet, SpawnRequest};

/// Lowest descriptor number above the standard streams.
const STDIO_LIMIT: c_int = 3;

/// A command to be launched inside fresh namespaces.
///
/// The child runs its setup in a fixed order: stdio redirection, identity mapping, root pivot,
/// extra mounts, working directory, and finally `execve(2)` of the program.
pub struct Command {
    // Exec information
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, Option<String>>,
    inherit_parent_env: bool,

    // Stdio redirection.
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,

    // Namespace information.
    namespaces: NamespaceSet,

    // User and group information.
    identity: Option<MapIdentity>,

    // Roots, mounts, working directory.
    pivot_root: Option<PivotRoot>,
    mounts: Vec<Mount>,
    set_working_dir: Option<PathBuf>,

    forward_spawn_logs: bool,
}

/// A handle to a child spawned from a [`Command`], which has executed its program.
#[derive(Debug)]
pub struct Child(ChildHandle);

impl Command {
    /// Create a new command. The program path is used as-is, without a `PATH` search.
    pub fn new(program: impl AsRef<str>) -> Command {
        Command {
            command: program.as_ref().to_owned(),
            args: vec![program.as_ref().to_owned()],
            env: BTreeMap::new(),
            inherit_parent_env: true,
            stdin: None,
            stdout: None,
            stderr: None,
            namespaces: NamespaceSet::default(),
            identity: None,
            pivot_root: None,
            mounts: Vec::new(),
            set_working_dir: None,
            forward_spawn_logs: false,
        }
    }

    /// Enable verbose logging to `tracing`.
    pub fn verbose(&mut self, enabled: bool) -> &mut Command {
        self.forward_spawn_logs = enabled;
        self
    }

    /// Set the contents of `argv[0]`.
    pub fn argv0(&mut self, argv0: impl AsRef<str>) -> &mut Command {
        self.args[0] = argv0.as_ref().to_owned();
        self
    }

    /// Append an argument.
    pub fn arg(&mut self, arg: impl AsRef<str>) -> &mut Command {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Append several arguments.
    pub fn args(&mut self, args: impl IntoIterator<Item = impl AsRef<str>>) -> &mut Command {
        self.args
            .extend(args.into_iter().map(|e| e.as_ref().to_owned()));
        self
    }

    /// Set the working directory of the child, relative to its final root.
    pub fn current_dir(&mut self, path: impl AsRef<Path>) -> &mut Command {
        self.set_working_dir = Some(path.as_ref().into());
        self
    }

    /// Set the value of an environment variable in the child.
    pub fn env(&mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> &mut Command {
        let key = key.as_ref().to_owned();
        let value = value.as_ref().to_owned();
        self.env.insert(key, Some(value));
        self
    }

    /// Clear all environment variables, and prevent the child from inheriting the
    /// parent's environment.
    pub fn env_clear(&mut self) -> &mut Command {
        self.inherit_parent_env = false;
        self.env = BTreeMap::new();
        self
    }

    /// Explicitly removes an environment variable, preventing it from being inherited
    /// from the parent's environment.
    pub fn env_remove(&mut self, key: impl AsRef<str>) -> &mut Command {
        self.env.insert(key.as_ref().to_owned(), None);
        self
    }

    /// Sets several environment variables.
    pub fn envs(
        &mut self,
        envs: impl IntoIterator<Item = (impl AsRef<str>, impl AsRef<str>)>,
    ) -> &mut Command {
        let envs_iter = envs
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_owned(), Some(v.as_ref().to_owned())));
        self.env.extend(envs_iter);
        self
    }

    /// Configures the child's stdout stream.
    pub fn stdout(&mut self, stream: impl Into<OwnedFd>) -> &mut Command {
        self.stdout = Some(stream.into());
        self
    }

    /// Configures the child's stderr stream.
    pub fn stderr(&mut self, stream: impl Into<OwnedFd>) -> &mut Command {
        self.stderr = Some(stream.into());
        self
    }

    /// Configures the child's stdin stream.
    pub fn stdin(&mut self, stream: impl Into<OwnedFd>) -> &mut Command {
        self.stdin = Some(stream.into());
        self
    }

    /// Creates a namespace for the child process.
    pub fn unshare(&mut self, namespace: Namespace) -> &mut Command {
        self.namespaces.insert(namespace);
        self
    }

    /// Maps root in the child's user namespace to `uid` and `gid` outside it.
    pub fn map_identity(&mut self, uid: u32, gid: u32) -> &mut Command {
        self.identity = Some(MapIdentity::new(uid, gid));
        self
    }

    /// Maps root in the child's user namespace to the current user and group.
    pub fn map_current_identity(&mut self) -> &mut Command {
        self.identity = Some(MapIdentity::current());
        self
    }

    /// Pivots the child into a new root before running the program.
    pub fn pivot_root(&mut self, pivot: PivotRoot) -> &mut Command {
        self.pivot_root = Some(pivot);
        self
    }

    /// Adds a mount, carried out after any root pivot, so targets are inside the new root.
    pub fn mount(&mut self, mount: Mount) -> &mut Command {
        self.mounts.push(mount);
        self
    }

    /// Returns an iterator over the arguments passed to the program.
    pub fn get_args(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(|e| e.as_str())
    }

    /// Returns the working directory set for the child process. Returns None if the
    /// working directory will not be changed.
    pub fn get_current_dir(&self) -> Option<&Path> {
        self.set_working_dir.as_ref().map(|e| e.as_path())
    }

    /// Returns the environment variables explicitly set or removed for the child.
    pub fn get_envs(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_ref().map(|e| e.as_str())))
    }

    /// Gets the executable name.
    pub fn get_program(&self) -> &str {
        self.command.as_str()
    }

    /// Returns the namespaces the child will be created in.
    pub fn get_namespaces(&self) -> NamespaceSet {
        self.namespaces
    }

    /// Executes a command as a child process, waiting for it to finish and collecting
    /// its status.
    pub fn status(self) -> Result<ExitStatus, SpawnError> {
        let child = self.spawn()?;
        child.wait()
    }

    /// Spawn the subprocess, and return a handle to it once it has executed the program.
    ///
    /// If any setup action fails in the child, the child is reaped and the failure is returned
    /// as [`SpawnError::Action`].
    pub fn spawn(self) -> Result<Child, SpawnError> {
        let namespaces = self.namespaces;
        let forward_logs = self.forward_spawn_logs;
        let actions = self.into_actions()?;

        let (reader, writer) = error_channel().map_err(SpawnError::Channel)?;
        let child = spawn::spawn(SpawnRequest {
            namespaces,
            actions: &actions,
            errors: &writer,
            forward_logs,
        })
        .map_err(SpawnError::Spawn)?;

        // Drop our copy of the write end, so the read ends when the child execs or exits.
        drop(writer);

        match reader.read_report() {
            Ok(None) => Ok(Child(child)),
            Ok(Some(report)) => {
                debug!(%report, "child setup failed");
                let status = child.wait().map_err(SpawnError::Spawn)?;
                debug!(?status, "reaped failed child");
                Err(SpawnError::Action(report))
            }
            Err(e) => {
                warn!(err = %e, "failed to read child's error channel");
                let _ = child.send_signal(libc::SIGKILL);
                let _ = child.wait();
                Err(SpawnError::Channel(e))
            }
        }
    }

    /// Turn the command into the ordered list of actions the child will run.
    fn into_actions(self) -> Result<Vec<Action>, SpawnError> {
        let mut actions = Vec::new();

        for (fd, target) in [
            (self.stdin, libc::STDIN_FILENO),
            (self.stdout, libc::STDOUT_FILENO),
            (self.stderr, libc::STDERR_FILENO),
        ] {
            if let Some(fd) = fd {
                // Keep every source clear of the numbers the redirects write to.
                let fd = libc_util::dup_at_least(fd.as_fd(), STDIO_LIMIT)
                    .map_err(|e| SpawnError::Spawn(e.context("failed to move stdio stream")))?;
                actions.push(Redirect::new(fd, target).into());
            }
        }

        if let Some(identity) = self.identity {
            actions.push(identity.into());
        }
        if let Some(pivot) = self.pivot_root {
            actions.push(pivot.into());
        }
        actions.extend(self.mounts.into_iter().map(Action::from));
        if let Some(dir) = self.set_working_dir {
            actions.push(Chdir::new(c_path(dir, "working directory")?).into());
        }

        let program = c_string(self.command, "program")?;
        let args = self
            .args
            .into_iter()
            .map(|a| c_string(a, "argument"))
            .collect::<Result<Vec<_>, _>>()?;
        let env = build_env(self.inherit_parent_env, self.env)?;
        actions.push(Exec::new(program, args, env).into());

        Ok(actions)
    }
}

/// Merge the parent's environment (if inherited) with explicit settings, as `KEY=value` strings.
fn build_env(
    inherit_parent_env: bool,
    overrides: BTreeMap<String, Option<String>>,
) -> Result<Vec<CString>, SpawnError> {
    let mut env_map: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    if inherit_parent_env {
        env_map.extend(
            std::env::vars_os().map(|(k, v)| (k.into_vec(), v.into_vec())),
        );
    }
    for (k, v) in overrides {
        match v {
            Some(v) => env_map.insert(k.into_bytes(), v.into_bytes()),
            None => env_map.remove(k.as_bytes()),
        };
    }

    env_map
        .into_iter()
        .map(|(k, v)| {
            let mut kv = k;
            kv.push(b'=');
            kv.extend(v);
            c_string(kv, "environment variable")
        })
        .collect()
}

impl Child {
    /// The child's pid, in the parent's PID namespace.
    pub fn pid(&self) -> u32 {
        self.0.pid()
    }

    /// Send a signal to the child.
    pub fn signal(&self, signal: c_int) -> Result<(), SpawnError> {
        self.0.send_signal(signal).map_err(SpawnError::Spawn)
    }

    /// Wait for the child to exit, returning the exit status.
    pub fn wait(self) -> Result<ExitStatus, SpawnError> {
        self.0.wait().map_err(SpawnError::Spawn)
    }

    /// The underlying handle.
    pub fn handle(&self) -> &ChildHandle {
        &self.0
    }
}

impl AsFd for Child {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}
