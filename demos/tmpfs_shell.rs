//! # Demo: a shell on an empty root
//!
//! Spawns `/bin/sh` in new user, mount, PID, UTS and IPC namespaces, as root inside the user
//! namespace, with a fresh tmpfs as `/`. The host's system directories are bind-mounted in so the
//! shell can run programs, and a small scratch tmpfs is mounted on `/scratch`.
//!
//! - `ls -a /` shows only the bind-mounted directories and `/scratch`.
//! - `touch /x` works: the root is a writable tmpfs that disappears with the shell.
//! - `echo $$` prints 1.
//! - `id` prints `uid=0(root) gid=0(root)`.

use c_str_macro::c_str;
use palisade::{Mount, Namespace, PivotRoot};
use tracing::info;
mod common;

pub fn main() -> eyre::Result<()> {
    common::configure_logging();

    let pivot = common::with_system_dirs(PivotRoot::tmpfs_default().tmpfs_size(64 << 20))?;

    let mut cmd = palisade::Command::new("/bin/sh");
    cmd.verbose(true);
    cmd.env("PS1", "palisade# ");
    cmd.unshare(Namespace::User);
    cmd.unshare(Namespace::Mount);
    cmd.unshare(Namespace::Pid);
    cmd.unshare(Namespace::Uts);
    cmd.unshare(Namespace::Ipc);
    cmd.map_current_identity();
    cmd.pivot_root(pivot);
    cmd.mount(Mount::tmpfs(c_str!("/scratch")).data(c_str!("size=1m")));
    cmd.current_dir("/");

    let child = cmd.spawn()?;
    info!(pid = child.pid(), "shell started");

    let exit = child.wait()?;
    info!(?exit);
    Ok(())
}
