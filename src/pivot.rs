//! Swap the child's root filesystem with `pivot_root(2)`.

use c_str_macro::c_str;
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use crate::action::{c_string, fail, ActionFailure};
use crate::error::{Error, SpawnError};
use crate::libc_util::{mkdirp, mkdirp_parent, random_hex, stat, touch, StackPath};

/// Where the new root goes when none is given: a tmpfs over `/tmp`, which only exists in the
/// child's private mount namespace.
const DEFAULT_TMPFS_ROOT: &[u8] = b"/tmp";

/// Prefix of the staging directory that receives the old root.
const STAGING_PREFIX: &[u8] = b".old_root-";

/// Number of random hex digits after the prefix.
const STAGING_SUFFIX_LEN: usize = 8;

const STAGING_NAME_LEN: usize = STAGING_PREFIX.len() + STAGING_SUFFIX_LEN;

/// Pivot the child into a new root filesystem.
///
/// The new root is either a caller-provided directory (bind-mounted onto itself) or a fresh
/// tmpfs. After the pivot, each extra bind mount is applied in order, then the old root is
/// detached and its staging directory removed.
///
/// The staging directory gets a fresh random name each time the action runs, so one
/// `PivotRoot` can be shared by children that run at the same time, even onto the same
/// directory.
///
/// Needs `CAP_SYS_ADMIN` in the owning user namespace of the child's mount namespace. In
/// practice, spawn the child with both a new user and a new mount namespace and map its
/// identity first.
///
/// Mounts are not transactional. If an extra bind mount fails, the ones before it are active
/// and nothing is rolled back; the child exits, and the mounts go away with its mount
/// namespace.
#[derive(Debug, Clone)]
pub struct PivotRoot {
    new_root: CString,
    use_tmpfs: bool,
    tmpfs_size: Option<u64>,
    tmpfs_mode: Option<u32>,
    tmpfs_data: Option<CString>,
    mounts: Vec<BindMount>,
}

/// A bind mount from the old root into the new one, applied after the pivot.
#[derive(Debug, Clone)]
pub struct BindMount {
    /// Host path. After the pivot it is reached through the staging directory.
    source: CString,

    /// Path inside the new root.
    target: CString,
}

impl PivotRoot {
    /// Pivot into an existing directory.
    pub fn bind(new_root: impl AsRef<Path>) -> Result<PivotRoot, SpawnError> {
        let new_root = new_root.as_ref().as_os_str().as_bytes();
        Self::with_root(new_root, false)
    }

    /// Pivot into a fresh tmpfs mounted at `new_root`, creating the directory if needed.
    pub fn tmpfs(new_root: impl AsRef<Path>) -> Result<PivotRoot, SpawnError> {
        let new_root = new_root.as_ref().as_os_str().as_bytes();
        Self::with_root(new_root, true)
    }

    /// Pivot into a fresh tmpfs, without naming a directory for it.
    pub fn tmpfs_default() -> PivotRoot {
        Self::with_root(DEFAULT_TMPFS_ROOT, true).expect("default root contains no NUL")
    }

    fn with_root(new_root: &[u8], use_tmpfs: bool) -> Result<PivotRoot, SpawnError> {
        Ok(PivotRoot {
            new_root: c_string(new_root, "new root")?,
            use_tmpfs,
            tmpfs_size: None,
            tmpfs_mode: None,
            tmpfs_data: None,
            mounts: Vec::new(),
        })
    }

    /// Limit the size of the tmpfs root, in bytes.
    pub fn tmpfs_size(mut self, bytes: u64) -> PivotRoot {
        self.tmpfs_size = Some(bytes);
        self.update_tmpfs_data();
        self
    }

    /// Set the permissions of the tmpfs root directory.
    pub fn tmpfs_mode(mut self, mode: u32) -> PivotRoot {
        self.tmpfs_mode = Some(mode);
        self.update_tmpfs_data();
        self
    }

    fn update_tmpfs_data(&mut self) {
        let mut options = Vec::new();
        if let Some(size) = self.tmpfs_size {
            options.push(format!("size={size}"));
        }
        if let Some(mode) = self.tmpfs_mode {
            options.push(format!("mode={mode:04o}"));
        }
        self.tmpfs_data = Some(
            c_string(options.join(","), "tmpfs options").expect("tmpfs options contain no NUL"),
        );
    }

    /// Bind-mount the host path `source` at `target` inside the new root, after the pivot.
    ///
    /// Mounts are applied in the order they are added. The mountpoint is created as a directory
    /// or an empty file, depending on what `source` is.
    pub fn mount(
        mut self,
        source: impl AsRef<Path>,
        target: impl AsRef<Path>,
    ) -> Result<PivotRoot, SpawnError> {
        let source = source.as_ref().as_os_str().as_bytes();
        let target = target.as_ref().as_os_str().as_bytes();

        self.mounts.push(BindMount {
            source: c_string(source, "bind mount source")?,
            target: c_string(join(b"/", target), "bind mount target")?,
        });
        Ok(self)
    }

    pub fn new_root(&self) -> &CStr {
        &self.new_root
    }

    pub fn uses_tmpfs(&self) -> bool {
        self.use_tmpfs
    }

    pub fn mounts(&self) -> &[BindMount] {
        &self.mounts
    }

    pub fn execute(&self) -> Result<(), ActionFailure<'_>> {
        // Make every mount private: pivot_root(2) refuses shared mounts, and nothing done here
        // may propagate back to the parent namespace.
        let 0 = (unsafe {
            libc::mount(
                ptr::null(),
                c_str!("/").as_ptr(),
                ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                ptr::null(),
            )
        }) else {
            fail!("pivot_root-private");
        };

        if self.use_tmpfs {
            mkdirp(self.new_root.as_ptr()).map_err(|e| {
                ActionFailure::from_error("pivot_root-mkdir-new_root", e).target(&self.new_root)
            })?;

            let 0 = (unsafe {
                libc::mount(
                    c_str!("tmpfs").as_ptr(),
                    self.new_root.as_ptr(),
                    c_str!("tmpfs").as_ptr(),
                    0,
                    match &self.tmpfs_data {
                        Some(data) => data.as_ptr().cast(),
                        None => ptr::null(),
                    },
                )
            }) else {
                fail!("pivot_root-tmpfs", target = &self.new_root);
            };
        } else {
            // The new root must be a mount point, so bind-mount it onto itself.
            // MS_REC keeps mounts already inside the new root.
            let 0 = (unsafe {
                libc::mount(
                    self.new_root.as_ptr(),
                    self.new_root.as_ptr(),
                    ptr::null(),
                    libc::MS_BIND | libc::MS_REC,
                    ptr::null(),
                )
            }) else {
                fail!("pivot_root-new_root", target = &self.new_root);
            };
        }

        let staging_failed = |e: Error| {
            ActionFailure::from_error("pivot_root-mkdir-put_old", e).target(&self.new_root)
        };

        let mut staging_name = [0u8; STAGING_NAME_LEN];
        staging_name[..STAGING_PREFIX.len()].copy_from_slice(STAGING_PREFIX);
        random_hex(&mut staging_name[STAGING_PREFIX.len()..]).map_err(staging_failed)?;

        // The staging directory, before the pivot (`put_old`) and after it (`old_root`).
        let mut put_old = StackPath::new(self.new_root.to_bytes()).map_err(staging_failed)?;
        put_old.push(&staging_name).map_err(staging_failed)?;
        let mut old_root = StackPath::new(b"/").map_err(staging_failed)?;
        old_root.push(&staging_name).map_err(staging_failed)?;

        let 0 = (unsafe { libc::mkdir(put_old.as_ptr(), 0o700) }) else {
            fail!("pivot_root-mkdir-put_old", target = &self.new_root);
        };

        let 0 = (unsafe {
            libc::syscall(libc::SYS_pivot_root, self.new_root.as_ptr(), put_old.as_ptr())
        }) else {
            fail!("pivot_root", target = &self.new_root);
        };

        for mount in &self.mounts {
            mount.execute(&old_root)?;
        }

        let 0 = (unsafe { libc::chdir(c_str!("/").as_ptr()) }) else {
            fail!("pivot_root-chdir");
        };

        // Open files under the old root stay usable, but no new lookups can reach it.
        let 0 = (unsafe { libc::umount2(old_root.as_ptr(), libc::MNT_DETACH) }) else {
            fail!("pivot_root-umount-put_old");
        };

        let 0 = (unsafe { libc::rmdir(old_root.as_ptr()) }) else {
            fail!("pivot_root-rmdir-put_old");
        };

        Ok(())
    }
}

impl BindMount {
    pub fn source(&self) -> &CStr {
        &self.source
    }

    pub fn target(&self) -> &CStr {
        &self.target
    }

    /// Bind-mount the source, found under `old_root`, at the target.
    fn execute(&self, old_root: &StackPath) -> Result<(), ActionFailure<'_>> {
        let mkdir_failed = |e: Error| {
            ActionFailure::from_error("pivot_root-mkdir-mount", e)
                .source(&self.source)
                .target(&self.target)
        };

        let mut resolved_source = StackPath::new(old_root.as_bytes()).map_err(mkdir_failed)?;
        resolved_source
            .push(self.source.to_bytes())
            .map_err(mkdir_failed)?;

        let source_stat = stat(resolved_source.as_ptr()).map_err(mkdir_failed)?;
        if source_stat.st_mode & libc::S_IFMT == libc::S_IFDIR {
            mkdirp(self.target.as_ptr())
        } else {
            mkdirp_parent(self.target.as_ptr()).and_then(|()| touch(self.target.as_ptr()))
        }
        .map_err(mkdir_failed)?;

        let 0 = (unsafe {
            libc::mount(
                resolved_source.as_ptr(),
                self.target.as_ptr(),
                ptr::null(),
                libc::MS_BIND | libc::MS_REC,
                ptr::null(),
            )
        }) else {
            return Err(ActionFailure::last_os_error("pivot_root-mount")
                .source(&self.source)
                .target(&self.target));
        };

        Ok(())
    }
}

/// Join two byte paths with exactly one `/` between them.
fn join(base: &[u8], rest: &[u8]) -> Vec<u8> {
    let base = base.strip_suffix(b"/").unwrap_or(base);
    let rest = rest.strip_prefix(b"/").unwrap_or(rest);
    let mut path = Vec::with_capacity(base.len() + 1 + rest.len());
    path.extend_from_slice(base);
    path.push(b'/');
    path.extend_from_slice(rest);
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_pivot_keeps_its_root() {
        let pivot = PivotRoot::bind("/srv/root").unwrap();
        assert_eq!(pivot.new_root().to_str().unwrap(), "/srv/root");
        assert!(!pivot.uses_tmpfs());
        assert!(pivot.mounts().is_empty());
    }

    #[test]
    fn default_tmpfs_root_is_tmp() {
        let pivot = PivotRoot::tmpfs_default();
        assert!(pivot.uses_tmpfs());
        assert_eq!(pivot.new_root().to_str().unwrap(), "/tmp");
        assert!(pivot.tmpfs_data.is_none());
    }

    #[test]
    fn tmpfs_options_render_as_mount_data() {
        let pivot = PivotRoot::tmpfs("/run/box")
            .unwrap()
            .tmpfs_size(64 * 1024 * 1024)
            .tmpfs_mode(0o755);
        assert_eq!(
            pivot.tmpfs_data.as_deref().unwrap().to_str().unwrap(),
            "size=67108864,mode=0755"
        );
    }

    #[test]
    fn mount_targets_are_absolute_and_ordered() {
        let pivot = PivotRoot::tmpfs_default()
            .mount("/usr", "usr")
            .unwrap()
            .mount("/home/me/data/", "/data")
            .unwrap();

        let mounts = pivot.mounts();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].source().to_str().unwrap(), "/usr");
        assert_eq!(mounts[0].target().to_str().unwrap(), "/usr");
        assert_eq!(mounts[1].source().to_str().unwrap(), "/home/me/data/");
        assert_eq!(mounts[1].target().to_str().unwrap(), "/data");
    }

    #[test]
    fn sources_resolve_through_old_root() {
        let old_root = StackPath::new(b"/.old_root-0123abcd").unwrap();
        let mut resolved = StackPath::new(old_root.as_bytes()).unwrap();
        resolved.push(b"/home/me/data/").unwrap();
        assert_eq!(resolved.as_bytes(), b"/.old_root-0123abcd/home/me/data/");
    }

    #[test]
    fn rejects_nul_in_paths() {
        let err = PivotRoot::tmpfs_default()
            .mount("/usr\0", "/usr")
            .unwrap_err();
        assert!(matches!(err, SpawnError::Nul("bind mount source")));
    }

    #[test]
    fn join_normalizes_slashes() {
        assert_eq!(join(b"/a/", b"/b"), b"/a/b");
        assert_eq!(join(b"/a", b"b"), b"/a/b");
        assert_eq!(join(b"/", b"x"), b"/x");
    }
}
