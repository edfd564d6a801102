use std::ffi::c_int;
use std::io::BufRead;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use tracing::{debug, span, Level};

use crate::action::{self, Action};
use crate::channel::ErrorWriter;
use crate::error::Result;
use crate::libc_util::{self, CloneResult, ExitStatus};

/// Bitset of namespaces to create for the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NamespaceSet {
    pub cgroup: bool,
    pub ipc: bool,
    pub network: bool,
    pub mount: bool,
    pub pid: bool,
    // pub time: bool, // clone3(2) can't create a time namespace.
    pub user: bool,
    pub uts: bool,
}

/// A single kind of namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Cgroup,
    Ipc,
    Network,
    Mount,
    Pid,
    User,
    Uts,
}

impl NamespaceSet {
    /// Add a namespace to the set.
    pub fn insert(&mut self, namespace: Namespace) {
        match namespace {
            Namespace::Cgroup => self.cgroup = true,
            Namespace::Ipc => self.ipc = true,
            Namespace::Network => self.network = true,
            Namespace::Mount => self.mount = true,
            Namespace::Pid => self.pid = true,
            Namespace::User => self.user = true,
            Namespace::Uts => self.uts = true,
        };
    }

    /// Builder-style [`NamespaceSet::insert`].
    pub fn with(mut self, namespace: Namespace) -> NamespaceSet {
        self.insert(namespace);
        self
    }

    /// Build a set from a `CLONE_NEW*` bitmask. Other bits are ignored.
    pub fn from_clone_flags(flags: u64) -> NamespaceSet {
        let has = |flag: c_int| flags & flag as u64 != 0;
        NamespaceSet {
            cgroup: has(libc::CLONE_NEWCGROUP),
            ipc: has(libc::CLONE_NEWIPC),
            network: has(libc::CLONE_NEWNET),
            mount: has(libc::CLONE_NEWNS),
            pid: has(libc::CLONE_NEWPID),
            user: has(libc::CLONE_NEWUSER),
            uts: has(libc::CLONE_NEWUTS),
        }
    }

    /// The `CLONE_NEW*` flags for this set.
    pub fn clone_flags(&self) -> u64 {
        let mut clone_flags: c_int = 0;
        if self.cgroup {
            clone_flags |= libc::CLONE_NEWCGROUP;
        }
        if self.ipc {
            clone_flags |= libc::CLONE_NEWIPC;
        }
        if self.network {
            clone_flags |= libc::CLONE_NEWNET;
        }
        if self.mount {
            clone_flags |= libc::CLONE_NEWNS;
        }
        if self.pid {
            clone_flags |= libc::CLONE_NEWPID;
        }
        if self.user {
            clone_flags |= libc::CLONE_NEWUSER;
        }
        if self.uts {
            clone_flags |= libc::CLONE_NEWUTS;
        }
        clone_flags as u32 as u64
    }
}

/// Everything needed to spawn a child.
#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest<'a> {
    /// Namespaces created for the child, atomically with the child itself.
    pub namespaces: NamespaceSet,

    /// Actions the child runs, in order, before anything else.
    pub actions: &'a [Action],

    /// Where the child reports the first failing action.
    pub errors: &'a ErrorWriter,

    /// Forward the child's progress messages to `tracing`, at debug level.
    pub forward_logs: bool,
}

/// Handle to a spawned child.
///
/// The pidfd is the child's identity. Unlike the numeric pid, it can never come to name a
/// different process, so every lifecycle operation goes through it.
#[derive(Debug)]
pub struct ChildHandle {
    pid: u32,
    pidfd: OwnedFd,
}

/// Spawn a child into the requested namespaces, and have it run the requested actions.
///
/// Returns as soon as the child exists. The child's outcome is reported separately: drop any
/// remaining copies of the error writer and read the matching [`crate::ErrorReader`].
pub fn spawn(request: SpawnRequest<'_>) -> Result<ChildHandle> {
    let span = span!(Level::DEBUG, "spawn");
    let _span_guard = span.enter();

    // Create the child's log stream, if configured.
    let log_pair = if request.forward_logs {
        let (log_tx, log_rx) = libc_util::socket_pair()
            .map_err(|e| e.context("Failed to create log stream for child socket"))?;
        let _log_follower_handle = spawn_log_forwarder(span!(Level::DEBUG, "child"), log_rx);
        Some(log_tx)
    } else {
        None
    };
    let log_fd = log_pair.as_ref().map(|fd| fd.as_raw_fd());

    let clone_flags = request.namespaces.clone_flags();
    debug!(namespaces = ?request.namespaces, actions = request.actions.len(), "cloning child");

    // SAFETY: the child only runs the action pipeline, which does not allocate, and then
    // execs or exits.
    match unsafe { libc_util::clone3(clone_flags) }.map_err(|e| e.context("spawn failed"))? {
        CloneResult::Child => action::run(request.errors, request.actions, log_fd),
        CloneResult::Parent { pid, pidfd } => {
            // Close our copy of the send end of the log stream, so the forwarder sees EOF once
            // the child is done with it.
            drop(log_pair);

            debug!(pid, "spawned child");
            Ok(ChildHandle {
                pid: pid as u32,
                pidfd,
            })
        }
    }
}

impl ChildHandle {
    /// The child's pid, in the parent's PID namespace.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Send a signal to the child. Fails with `ESRCH` once the child has been reaped.
    pub fn send_signal(&self, signal: c_int) -> Result<()> {
        libc_util::pidfd_send_signal(self.pidfd.as_fd(), signal)
    }

    /// Wait for the child to exit, returning the exit status.
    pub fn wait(&self) -> Result<ExitStatus> {
        let status = libc_util::waitid_pidfd(self.pidfd.as_fd(), true)?
            .ok_or_else(|| crate::error::Error::new().cause("waitid returned no child"))?;
        debug!(pid = self.pid, ?status, "child exited");
        Ok(status)
    }

    /// Reap the child if it has exited, without blocking.
    pub fn try_wait(&self) -> Result<Option<ExitStatus>> {
        libc_util::waitid_pidfd(self.pidfd.as_fd(), false)
    }

    /// Wait for the child by numeric pid.
    ///
    /// Prefer [`ChildHandle::wait`]: if something else reaps the child first, the pid may
    /// already belong to an unrelated process.
    pub fn wait_pid(&self) -> Result<ExitStatus> {
        unsafe { libc_util::waitpid(self.pid as c_int) }
    }
}

impl AsFd for ChildHandle {
    /// The pidfd, which polls readable once the child exits.
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.pidfd.as_fd()
    }
}

/// Start a thread to forward logs written to a socket to a particular span in the host's tracing
/// log.
fn spawn_log_forwarder(span: tracing::Span, log_rx: OwnedFd) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let log_rx = std::os::unix::net::UnixStream::from(log_rx);

        // Loop over lines
        for line in std::io::BufReader::new(log_rx).lines().map_while(|l| l.ok()) {
            debug!(parent: &span, "{}", line);
        }
    })
}
