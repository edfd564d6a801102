use c_str_macro::c_str;
use std::ffi::{c_int, c_ulong, CStr, CString};
use std::ptr;

use crate::action::{fail, ActionFailure};
use crate::libc_util::{mkdirp, mkdirp_parent, stat, touch};

/// A single `mount(2)` call, carried out inside the child process.
///
/// Mounting is stateless and never retried: the first failure aborts the pipeline.
#[derive(Debug, Clone)]
pub struct Mount {
    pub(crate) source: CString,
    pub(crate) target: CString,
    pub(crate) fstype: CString,
    pub(crate) flags: c_ulong,
    pub(crate) data: Option<CString>,

    /// Before this mount is created, should we create a mountpoint for it?
    pub(crate) create_mountpoint: Option<MountpointType>,
}

/// The type of mountpoint to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountpointType {
    Dir,
    File,

    /// `stat()` the source of the mount, and use that type. Useful for bind mounts.
    DetermineFromSource,
}

impl Mount {
    pub fn new(
        source: impl Into<CString>,
        target: impl Into<CString>,
        fstype: impl Into<CString>,
        flags: c_ulong,
    ) -> Mount {
        Mount {
            source: source.into(),
            target: target.into(),
            fstype: fstype.into(),
            flags,
            data: None,
            create_mountpoint: None,
        }
    }

    /// A recursive bind mount.
    pub fn bind(source: impl Into<CString>, target: impl Into<CString>) -> Mount {
        Mount::new(
            source,
            target,
            c_str!("<bind>"),
            libc::MS_BIND | libc::MS_REC, // Always use a recursive bind mount.
        )
        .create_mountpoint(MountpointType::DetermineFromSource)
    }

    /// A fresh tmpfs.
    pub fn tmpfs(target: impl Into<CString>) -> Mount {
        Mount::new(c_str!("tmpfs"), target, c_str!("tmpfs"), 0)
            .create_mountpoint(MountpointType::Dir)
    }

    /// A procfs. Only meaningful inside a new PID namespace.
    ///
    /// Inside a user namespace, the kernel only allows this while a procfs is still fully visible
    /// in the mount namespace, so it cannot follow a [`crate::PivotRoot`].
    pub fn proc(target: impl Into<CString>) -> Mount {
        Mount::new(c_str!("proc"), target, c_str!("proc"), 0)
            .create_mountpoint(MountpointType::Dir)
    }

    /// Set the filesystem-specific mount data, e.g. `size=64m,mode=0755`.
    pub fn data(mut self, data: impl Into<CString>) -> Mount {
        self.data = Some(data.into());
        self
    }

    /// Set whether we should create a mountpoint before mounting this mount.
    pub fn create_mountpoint(mut self, mountpoint_type: MountpointType) -> Mount {
        self.create_mountpoint = Some(mountpoint_type);
        self
    }

    pub fn target(&self) -> &CStr {
        &self.target
    }

    pub fn execute(&self) -> Result<(), ActionFailure<'_>> {
        if let Some(mountpoint_type) = self.create_mountpoint {
            create_mountpoint(&self.source, &self.target, mountpoint_type)?;
        }

        let 0 = (unsafe {
            libc::mount(
                self.source.as_ptr(),
                self.target.as_ptr(),
                self.fstype.as_ptr(),
                self.flags,
                match &self.data {
                    Some(data) => data.as_ptr().cast(),
                    None => ptr::null(),
                },
            )
        }) else {
            fail!("mount", target = &self.target);
        };
        Ok(())
    }
}

/// Create the mountpoint `target`, as a directory or as an empty file.
///
/// There is a TOCTOU race between reading the filetype of the source and creating the
/// mountpoint, which only matters if the source changes between a file and a directory.
pub(crate) fn create_mountpoint<'a>(
    source: &'a CStr,
    target: &'a CStr,
    mountpoint_type: MountpointType,
) -> Result<(), ActionFailure<'a>> {
    let mountpoint_type = match mountpoint_type {
        MountpointType::DetermineFromSource => {
            let source_stat = stat(source.as_ptr())
                .map_err(|e| ActionFailure::from_error("mount-stat", e).source(source))?;
            if source_stat.st_mode & libc::S_IFMT == libc::S_IFDIR {
                MountpointType::Dir
            } else {
                MountpointType::File
            }
        }
        other => other,
    };

    match mountpoint_type {
        MountpointType::Dir => mkdirp(target.as_ptr()),
        MountpointType::File => mkdirp_parent(target.as_ptr()).and_then(|()| touch(target.as_ptr())),
        MountpointType::DetermineFromSource => {
            unreachable!("type should have been resolved earlier in the function")
        }
    }
    .map_err(|e| ActionFailure::from_error("mount-mkdir", e).target(target))
}

/// A single `umount2(2)` call.
#[derive(Debug, Clone)]
pub struct Unmount {
    target: CString,
    flags: c_int,
}

impl Unmount {
    pub fn new(target: impl Into<CString>, flags: c_int) -> Unmount {
        Unmount {
            target: target.into(),
            flags,
        }
    }

    /// Detach the mount: existing references stay valid, new lookups no longer see it.
    pub fn detach(target: impl Into<CString>) -> Unmount {
        Unmount::new(target, libc::MNT_DETACH)
    }

    pub fn execute(&self) -> Result<(), ActionFailure<'_>> {
        let 0 = (unsafe { libc::umount2(self.target.as_ptr(), self.flags) }) else {
            fail!("umount", target = &self.target);
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::c_path;

    #[test]
    fn bind_is_recursive_and_creates_mountpoint_from_source() {
        let mount = Mount::bind(c_str!("/usr"), c_str!("/new/usr"));
        assert_eq!(mount.flags, libc::MS_BIND | libc::MS_REC);
        assert_eq!(
            mount.create_mountpoint,
            Some(MountpointType::DetermineFromSource)
        );
        assert_eq!(mount.target(), c_str!("/new/usr"));
    }

    #[test]
    fn tmpfs_carries_data() {
        let mount = Mount::tmpfs(c_str!("/scratch")).data(c_str!("size=1m"));
        assert_eq!(mount.fstype.as_c_str(), c_str!("tmpfs"));
        assert_eq!(mount.data.as_deref(), Some(c_str!("size=1m")));
    }

    #[test]
    fn mount_onto_missing_target_reports_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = c_path(dir.path().join("missing"), "target").unwrap();
        let mount = Mount::new(c_str!("tmpfs"), target.clone(), c_str!("tmpfs"), 0);

        let failure = mount.execute().unwrap_err();
        assert_eq!(failure.label, "mount");
        assert_eq!(failure.target, Some(target.as_c_str()));
        // The target is looked up first, but a kernel may refuse unprivileged callers earlier.
        assert!(failure.errno == libc::ENOENT || failure.errno == libc::EPERM);
    }

    #[test]
    fn mountpoint_type_follows_source() {
        let dir = tempfile::tempdir().unwrap();
        let file_source = dir.path().join("file");
        std::fs::write(&file_source, "x").unwrap();

        let dir_target = c_path(dir.path().join("dir/target"), "target").unwrap();
        let dir_source = c_path(dir.path(), "source").unwrap();
        create_mountpoint(&dir_source, &dir_target, MountpointType::DetermineFromSource).unwrap();
        assert!(dir.path().join("dir/target").is_dir());

        let file_target = c_path(dir.path().join("file_target"), "target").unwrap();
        let file_source = c_path(&file_source, "source").unwrap();
        create_mountpoint(&file_source, &file_target, MountpointType::DetermineFromSource)
            .unwrap();
        assert!(dir.path().join("file_target").is_file());
    }

    #[test]
    fn missing_source_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let source = c_path(dir.path().join("nope"), "source").unwrap();
        let target = c_path(dir.path().join("target"), "target").unwrap();
        let failure =
            create_mountpoint(&source, &target, MountpointType::DetermineFromSource).unwrap_err();
        assert_eq!(failure.label, "mount-stat");
        assert_eq!(failure.errno, libc::ENOENT);
    }

    #[test]
    fn unmount_of_non_mountpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = c_path(dir.path(), "target").unwrap();
        let unmount = Unmount::detach(target);
        let failure = unmount.execute().unwrap_err();
        assert_eq!(failure.label, "umount");
        assert!(failure.errno == libc::EINVAL || failure.errno == libc::EPERM);
    }
}
