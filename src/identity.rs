use std::ffi::{CStr, CString};
use std::path::Path;

use crate::action::{c_path, c_string, ActionFailure};
use crate::error::SpawnError;
use crate::libc_util::put_line;

/// The identity-mapping files of a user namespace: `setgroups`, `uid_map`, and `gid_map`.
///
/// Normally these are `/proc/self/*`, but any directory works, which lets tests write to a
/// scratch directory instead of the kernel's files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityFiles {
    setgroups: CString,
    uid_map: CString,
    gid_map: CString,
}

impl IdentityFiles {
    /// The files of whichever process executes the mapping.
    pub fn current_process() -> IdentityFiles {
        Self::at_prefix(b"/proc/self")
    }

    /// The files of another process, by pid.
    pub fn of_pid(pid: u32) -> IdentityFiles {
        Self::at_prefix(format!("/proc/{pid}").as_bytes())
    }

    /// Files named `setgroups`, `uid_map`, and `gid_map` in an arbitrary directory.
    pub fn at(dir: impl AsRef<Path>) -> Result<IdentityFiles, SpawnError> {
        let dir = dir.as_ref();
        Ok(IdentityFiles {
            setgroups: c_path(dir.join("setgroups"), "identity file path")?,
            uid_map: c_path(dir.join("uid_map"), "identity file path")?,
            gid_map: c_path(dir.join("gid_map"), "identity file path")?,
        })
    }

    fn at_prefix(prefix: &[u8]) -> IdentityFiles {
        let file = |name: &str| {
            let mut path = prefix.to_vec();
            path.push(b'/');
            path.extend_from_slice(name.as_bytes());
            CString::new(path).expect("prefix and file names contain no NUL")
        };
        IdentityFiles {
            setgroups: file("setgroups"),
            uid_map: file("uid_map"),
            gid_map: file("gid_map"),
        }
    }
}

/// Map root inside a fresh user namespace onto one real user and group outside it.
///
/// Writes, in order:
///
/// 1. `deny` to `setgroups`. Without this, an unprivileged process may not write `gid_map`.
/// 2. `0 <uid> 1` to `uid_map`.
/// 3. `0 <gid> 1` to `gid_map`.
///
/// Each file can be written once per namespace, so there is no undo: a failure part way through
/// leaves the earlier files written, and the child exits.
#[derive(Debug, Clone)]
pub struct MapIdentity {
    uid: u32,
    gid: u32,
    uid_line: CString,
    gid_line: CString,
    files: IdentityFiles,
}

impl MapIdentity {
    pub fn new(uid: u32, gid: u32) -> MapIdentity {
        MapIdentity {
            uid,
            gid,
            uid_line: map_line(uid),
            gid_line: map_line(gid),
            files: IdentityFiles::current_process(),
        }
    }

    /// Map the real uid and gid of the calling process.
    pub fn current() -> MapIdentity {
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        MapIdentity::new(uid, gid)
    }

    /// Write to a different set of files than `/proc/self`.
    pub fn with_files(self, files: IdentityFiles) -> MapIdentity {
        MapIdentity { files, ..self }
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn execute(&self) -> Result<(), ActionFailure<'_>> {
        write_file("map_uid_gid-setgroups", &self.files.setgroups, b"deny\n")?;
        write_file("map_uid_gid-uid", &self.files.uid_map, self.uid_line.as_bytes())?;
        write_file("map_uid_gid-gid", &self.files.gid_map, self.gid_line.as_bytes())?;
        Ok(())
    }
}

fn write_file<'a>(
    label: &'static str,
    path: &'a CStr,
    line: &[u8],
) -> Result<(), ActionFailure<'a>> {
    put_line(path.as_ptr(), line).map_err(|e| ActionFailure::from_error(label, e).target(path))
}

fn map_line(id: u32) -> CString {
    c_string(format!("0 {id} 1\n"), "id map line").expect("formatted ids contain no NUL")
}
