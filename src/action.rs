//! Setup actions executed inside a freshly cloned child, and the pipeline that runs them.
//!
//! Everything an action needs is owned by the action and prepared in the parent, so the child
//! never allocates between the clone and `execve(2)`.

use alloc_counter::no_alloc;
use std::ffi::{c_char, c_int, CStr, CString};
use std::fmt;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use crate::channel::ErrorWriter;
use crate::error::{strerror, Error, SpawnError};
use crate::identity::MapIdentity;
use crate::libc_util::log_fd;
use crate::mount::{Mount, Unmount};
use crate::pivot::PivotRoot;

/// Exit status of a child whose action failed and was reported.
pub const EXIT_ACTION_FAILED: c_int = 1;

/// Exit status of a child that could not write to its error channel.
pub const EXIT_CHANNEL_FAILED: c_int = 125;

/// Exit status of a child that panicked while running its actions.
pub const EXIT_PANICKED: c_int = 126;

/// A single setup step, run inside the child in list order.
#[derive(Debug)]
pub enum Action {
    Mount(Mount),
    Unmount(Unmount),
    PivotRoot(PivotRoot),
    MapIdentity(MapIdentity),
    Chdir(Chdir),
    Redirect(Redirect),
    /// Replace the child with the target program. Later actions never run.
    Exec(Exec),
}

impl Action {
    /// Run the action in the current process.
    pub fn execute(&self) -> Result<(), ActionFailure<'_>> {
        match self {
            Action::Mount(mount) => mount.execute(),
            Action::Unmount(unmount) => unmount.execute(),
            Action::PivotRoot(pivot) => pivot.execute(),
            Action::MapIdentity(map) => map.execute(),
            Action::Chdir(chdir) => chdir.execute(),
            Action::Redirect(redirect) => redirect.execute(),
            Action::Exec(exec) => exec.execute(),
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Mount(_) => "mount",
            Action::Unmount(_) => "umount",
            Action::PivotRoot(_) => "pivot_root",
            Action::MapIdentity(_) => "map_uid_gid",
            Action::Chdir(_) => "chdir",
            Action::Redirect(_) => "dup2",
            Action::Exec(_) => "exec",
        }
    }
}

macro_rules! impl_from_action {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Action {
                fn from(a: $variant) -> Action {
                    Action::$variant(a)
                }
            }
        )*
    };
}
impl_from_action!(Mount, Unmount, PivotRoot, MapIdentity, Chdir, Redirect, Exec);

/// A failed action, as seen inside the child. Borrows the paths it names from the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionFailure<'a> {
    /// Identifies the action, or the step of the action, that failed.
    pub label: &'static str,
    pub errno: c_int,
    pub source: Option<&'a CStr>,
    pub target: Option<&'a CStr>,
}

impl<'a> ActionFailure<'a> {
    pub fn last_os_error(label: &'static str) -> ActionFailure<'a> {
        Self::from_error(label, Error::last_os_error())
    }

    pub fn from_error(label: &'static str, error: Error) -> ActionFailure<'a> {
        ActionFailure {
            label,
            errno: error.errno,
            source: None,
            target: None,
        }
    }

    pub fn source(self, source: &'a CStr) -> ActionFailure<'a> {
        ActionFailure {
            source: Some(source),
            ..self
        }
    }

    pub fn target(self, target: &'a CStr) -> ActionFailure<'a> {
        ActionFailure {
            target: Some(target),
            ..self
        }
    }
}

fn display_path(path: &CStr) -> &str {
    std::str::from_utf8(path.to_bytes()).unwrap_or("<non-utf8 path>")
}

impl fmt::Display for ActionFailure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.source, self.target) {
            (Some(source), Some(target)) => write!(
                f,
                "{} -> {}: ",
                display_path(source),
                display_path(target)
            )?,
            (Some(path), None) | (None, Some(path)) => write!(f, "{}: ", display_path(path))?,
            (None, None) => {}
        }
        write!(f, "{} (errno {})", strerror(self.errno), self.errno)
    }
}

/// Return an [`ActionFailure`] for the last OS error, with the given label.
macro_rules! fail {
    ($label:expr, target = $target:expr) => {
        return Err($crate::action::ActionFailure::last_os_error($label).target($target))
    };
    ($label:expr) => {
        return Err($crate::action::ActionFailure::last_os_error($label))
    };
}
pub(crate) use fail;

pub(crate) fn c_string(value: impl Into<Vec<u8>>, what: &'static str) -> Result<CString, SpawnError> {
    CString::new(value).map_err(|_| SpawnError::Nul(what))
}

pub(crate) fn c_path(path: impl AsRef<Path>, what: &'static str) -> Result<CString, SpawnError> {
    c_string(path.as_ref().as_os_str().as_bytes(), what)
}

/// Change the working directory.
#[derive(Debug, Clone)]
pub struct Chdir {
    path: CString,
}

impl Chdir {
    pub fn new(path: impl Into<CString>) -> Chdir {
        Chdir { path: path.into() }
    }

    pub fn execute(&self) -> Result<(), ActionFailure<'_>> {
        let 0 = (unsafe { libc::chdir(self.path.as_ptr()) }) else {
            fail!("chdir", target = &self.path);
        };
        Ok(())
    }
}

/// Duplicate an owned descriptor onto another descriptor number, e.g. stdout.
///
/// Redirects run in list order, so a source numbered like the target of an earlier redirect is
/// overwritten before it is used. [`crate::Command`] moves its sources above the standard
/// streams first.
#[derive(Debug)]
pub struct Redirect {
    fd: OwnedFd,
    target: RawFd,
}

impl Redirect {
    pub fn new(fd: impl Into<OwnedFd>, target: RawFd) -> Redirect {
        Redirect {
            fd: fd.into(),
            target,
        }
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn target(&self) -> RawFd {
        self.target
    }

    pub fn execute(&self) -> Result<(), ActionFailure<'_>> {
        let fd = self.fd.as_raw_fd();
        if fd == self.target {
            // dup2() would do nothing, so clear close-on-exec by hand.
            let 0.. = (unsafe { libc::fcntl(fd, libc::F_SETFD, 0) }) else {
                fail!("dup2");
            };
            return Ok(());
        }

        // dup2() clears close-on-exec on the target, so the program inherits it.
        let 0.. = (unsafe { libc::dup2(fd, self.target) }) else {
            fail!("dup2");
        };
        Ok(())
    }
}

/// Execute the target program with `execve(2)`.
///
/// The program path is used as-is: there is no `PATH` lookup.
pub struct Exec {
    program: CString,
    // Owners of the strings pointed to by `argv` and `envp`.
    _args: Vec<CString>,
    _env: Vec<CString>,
    argv: Vec<*const c_char>,
    envp: Vec<*const c_char>,
}

// SAFETY: the raw pointers only point into the heap buffers of `_args` and `_env`, which are
// owned by the same value and never mutated.
unsafe impl Send for Exec {}
unsafe impl Sync for Exec {}

impl Exec {
    /// Build an exec action. `args` includes `argv[0]`; `env` holds `KEY=value` entries.
    pub fn new(
        program: impl Into<CString>,
        args: impl IntoIterator<Item = CString>,
        env: impl IntoIterator<Item = CString>,
    ) -> Exec {
        let args: Vec<CString> = args.into_iter().collect();
        let env: Vec<CString> = env.into_iter().collect();
        let argv = args
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();
        let envp = env
            .iter()
            .map(|e| e.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();
        Exec {
            program: program.into(),
            _args: args,
            _env: env,
            argv,
            envp,
        }
    }

    /// Convenience constructor from string slices.
    pub fn from_strs<'s>(
        program: &str,
        args: impl IntoIterator<Item = &'s str>,
        env: impl IntoIterator<Item = &'s str>,
    ) -> Result<Exec, SpawnError> {
        let program = c_string(program, "program")?;
        let args = args
            .into_iter()
            .map(|a| c_string(a, "argument"))
            .collect::<Result<Vec<_>, _>>()?;
        let env = env
            .into_iter()
            .map(|e| c_string(e, "environment variable"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Exec::new(program, args, env))
    }

    pub fn program(&self) -> &CStr {
        &self.program
    }

    pub fn execute(&self) -> Result<(), ActionFailure<'_>> {
        unsafe { libc::execve(self.program.as_ptr(), self.argv.as_ptr(), self.envp.as_ptr()) };
        fail!("exec", target = &self.program);
    }
}

impl fmt::Debug for Exec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Exec")
            .field("program", &self.program)
            .field("args", &self._args)
            .field("env", &self._env)
            .finish()
    }
}

/// Run `actions` in order in the current (child) process, then exit. Never returns.
///
/// The first failing action is reported through `errors`, and the process exits with
/// [`EXIT_ACTION_FAILED`] without running anything further. If the list runs out without an
/// [`Action::Exec`], the process exits with status 0.
pub fn run(errors: &ErrorWriter, actions: &[Action], log: Option<c_int>) -> ! {
    let status = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        run_actions(errors, actions, log)
    })) {
        Ok(status) => status,
        Err(_) => {
            log_fd!(log, "caught panic while running actions");
            let _ = errors.report("spawn-child", format_args!("panic while running actions"));
            EXIT_PANICKED
        }
    };
    unsafe { libc::_exit(status) }
}

#[cfg_attr(debug_assertions, no_alloc)]
fn run_actions(errors: &ErrorWriter, actions: &[Action], log: Option<c_int>) -> c_int {
    for (index, action) in actions.iter().enumerate() {
        log_fd!(log, "action {index}: {}", action.name());

        let Err(failure) = action.execute() else {
            continue;
        };
        log_fd!(log, "action {index} failed: {}: {failure}", failure.label);

        return match errors.report(failure.label, format_args!("{failure}")) {
            Ok(()) => EXIT_ACTION_FAILED,
            Err(e) => {
                log_fd!(log, "failed to report action failure: {e}");
                EXIT_CHANNEL_FAILED
            }
        };
    }

    log_fd!(log, "ran out of actions without exec");
    0
}
