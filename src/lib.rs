//! Spawn a child directly into fresh Linux namespaces, and have it run an ordered list of setup
//! actions (identity mapping, root pivot, mounts, ...) before executing its program.
//!
//! The low-level entry point is [`spawn::spawn`], paired with an [`error_channel`] through which
//! the child reports the first failing action. [`Command`] wraps both in a builder.

mod libc_util;

mod action;
mod channel;
mod error;
mod identity;
mod mount;
mod pivot;
pub mod spawn;

mod command;

pub use action::{
    run, Action, ActionFailure, Chdir, Exec, Redirect, EXIT_ACTION_FAILED, EXIT_CHANNEL_FAILED,
    EXIT_PANICKED,
};
pub use channel::{error_channel, ErrorReader, ErrorReport, ErrorWriter, REPORT_MAX};
pub use error::{Error, SpawnError};
pub use identity::{IdentityFiles, MapIdentity};
pub use libc_util::ExitStatus;
pub use mount::{Mount, MountpointType, Unmount};
pub use pivot::{BindMount, PivotRoot};
pub use spawn::{ChildHandle, Namespace, NamespaceSet, SpawnRequest};

pub use command::{Child, Command};

/// In test builds, use alloc_counter to verify at runtime that the functions which must be
/// async-signal-safe do not allocate.
#[cfg(debug_assertions)]
#[global_allocator]
static ALLOC: alloc_counter::AllocCounterSystem = alloc_counter::AllocCounterSystem;
