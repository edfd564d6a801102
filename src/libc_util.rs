use alloc_counter::no_alloc;
use std::ffi::{c_char, c_int, c_long};
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr;

use crate::error::{bail, bail_errno, Error, Result};

/// `CLONE_PIDFD`, from `linux/sched.h`.
const CLONE_PIDFD: u64 = 0x0000_1000;

/// `P_PIDFD`, from `linux/wait.h`. Needs Linux 5.4.
const P_PIDFD: libc::idtype_t = 3;

/// Log a message (given in format_args! style) by writing it to an optional file descriptor.
///
/// This cannot allocate---buffer messages to a fixed-length, stack-allocated 2048-byte buffer.
/// The calling module must import `std::io::Write`.
///
/// ```ignore
/// log_fd!(Some(fd), "msg {param}", param = 42)
/// ```
macro_rules! log_fd {
    ($fd:expr, $($arg:tt)*) => {
        if let Some(fd) = $fd {
            let mut buffer = [0u8; 2048];
            let mut cursor = std::io::Cursor::new(&mut buffer[..]);
            let _ = writeln!(cursor, $($arg)*);
            let _ = unsafe {
                libc::write(
                    fd,
                    cursor.get_ref().as_ptr() as *const std::ffi::c_void,
                    cursor.position() as usize,
                )
            };
        }
    };
}
pub(crate) use log_fd;

/// Arguments to `clone3(2)`.
///
/// This is the first, 64-byte version of `struct clone_args`. The kernel versions the struct by
/// its size, so this works on every kernel with `clone3(2)`.
#[repr(C)]
#[derive(Debug, Default)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
}

/// Which side of a `clone3(2)` call we're running on.
#[derive(Debug)]
pub enum CloneResult {
    /// We are the new child process.
    Child,

    /// We are the parent; the new child has this pid and pidfd.
    Parent { pid: c_int, pidfd: OwnedFd },
}

/// Create a new process with `clone3(2)`, in the namespaces named by `flags`.
///
/// No stack is passed, so the child runs on a copy-on-write copy of our stack, just like
/// `fork(2)`. The pidfd is written by the same call that creates the process. `SIGCHLD` is
/// requested as the exit signal so the child can always be reaped with `wait(2)`, even if it
/// exits before anyone starts watching its pidfd.
///
/// There is deliberately no fallback to `clone(2)` or `fork(2)` + `setns(2)`.
///
/// # Safety
///
/// Until it calls `execve(2)` or `_exit(2)`, the child may only perform async-signal-safe
/// operations. In particular, it must not allocate.
pub unsafe fn clone3(flags: u64) -> Result<CloneResult> {
    let mut pidfd: c_int = -1;
    let mut args = CloneArgs {
        flags: flags | CLONE_PIDFD,
        pidfd: &mut pidfd as *mut c_int as u64,
        exit_signal: libc::SIGCHLD as u64,
        ..CloneArgs::default()
    };

    let result: c_long = libc::syscall(
        libc::SYS_clone3,
        &mut args as *mut CloneArgs,
        mem::size_of::<CloneArgs>(),
    );

    match result {
        ..=-1 => {
            bail_errno!("clone3(2) failed");
        }
        0 => Ok(CloneResult::Child),
        pid => Ok(CloneResult::Parent {
            pid: pid as c_int,
            pidfd: OwnedFd::from_raw_fd(pidfd),
        }),
    }
}

/// Send a signal to the process named by a pidfd.
pub fn pidfd_send_signal(pidfd: BorrowedFd<'_>, signal: c_int) -> Result<()> {
    let 0 = (unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            pidfd.as_raw_fd(),
            signal,
            ptr::null::<libc::siginfo_t>(),
            0,
        )
    }) else {
        bail_errno!("pidfd_send_signal(2) failed");
    };
    Ok(())
}

/// Create a Unix stream socket pair. Both ends are close-on-exec.
pub fn socket_pair() -> Result<(OwnedFd, OwnedFd)> {
    let mut socket_fds = [0; 2];
    let 0.. = (unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            socket_fds.as_mut_ptr(),
        )
    }) else {
        bail_errno!("failed to create socketpair");
    };
    let [a, b] = socket_fds;
    Ok(unsafe { (OwnedFd::from_raw_fd(a), OwnedFd::from_raw_fd(b)) })
}

/// Create a pipe, returning `(read_end, write_end)`. Both ends are close-on-exec.
pub fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut pipe_fds = [0; 2];
    let 0 = (unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC) }) else {
        bail_errno!("failed to create pipe");
    };
    let [read, write] = pipe_fds;
    Ok(unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) })
}

/// Duplicate a descriptor onto the lowest free number at or above `min`. The copy is
/// close-on-exec.
pub fn dup_at_least(fd: BorrowedFd<'_>, min: c_int) -> Result<OwnedFd> {
    let new_fd @ 0.. = (unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, min) }) else {
        bail_errno!("fcntl(F_DUPFD_CLOEXEC) failed");
    };
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

/// Put a file descriptor into non-blocking mode.
pub fn set_nonblocking(fd: BorrowedFd<'_>) -> Result<()> {
    let flags @ 0.. = (unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) }) else {
        bail_errno!("fcntl(F_GETFL) failed");
    };
    let 0.. = (unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) })
    else {
        bail_errno!("fcntl(F_SETFL) failed");
    };
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(c_int),
    Signal(c_int),
}

impl ExitStatus {
    pub fn from_wait_status(wait_status: c_int) -> Result<ExitStatus> {
        if libc::WIFEXITED(wait_status) {
            return Ok(ExitStatus::Code(libc::WEXITSTATUS(wait_status)));
        }
        if libc::WIFSIGNALED(wait_status) {
            return Ok(ExitStatus::Signal(libc::WTERMSIG(wait_status)));
        }

        bail!("invalid wait status")
    }

    /// Decode the `siginfo_t` filled in by `waitid(2)`.
    pub fn from_siginfo(info: &libc::siginfo_t) -> Result<ExitStatus> {
        let status = unsafe { info.si_status() };
        match info.si_code {
            libc::CLD_EXITED => Ok(ExitStatus::Code(status)),
            libc::CLD_KILLED | libc::CLD_DUMPED => Ok(ExitStatus::Signal(status)),
            _ => bail!("unexpected si_code from waitid"),
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

#[cfg_attr(debug_assertions, no_alloc)]
pub unsafe fn waitpid(pid: c_int) -> Result<ExitStatus> {
    let mut status: c_int = 0;
    let 0.. = (unsafe { libc::waitpid(pid, &mut status as *mut c_int, 0) }) else {
        bail_errno!("waitpid failed");
    };
    ExitStatus::from_wait_status(status)
}

/// Wait for the process named by a pidfd to exit, and reap it.
///
/// With `block` unset, returns `Ok(None)` if the process is still running.
pub fn waitid_pidfd(pidfd: BorrowedFd<'_>, block: bool) -> Result<Option<ExitStatus>> {
    let mut options = libc::WEXITED;
    if !block {
        options |= libc::WNOHANG;
    }

    let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
    loop {
        let result =
            unsafe { libc::waitid(P_PIDFD, pidfd.as_raw_fd() as libc::id_t, &mut info, options) };
        if result == 0 {
            break;
        }
        let err = Error::last_os_error();
        if err.errno != libc::EINTR {
            return Err(err.cause("waitid(P_PIDFD) failed"));
        }
    }

    // With WNOHANG, a zero si_pid means nothing has exited yet.
    if unsafe { info.si_pid() } == 0 {
        return Ok(None);
    }
    ExitStatus::from_siginfo(&info).map(Some)
}

/// Write a single line to a file, in a single `write(2)` call.
///
/// Files like `/proc/PID/uid_map` must be written in one call, so a short write is an error.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn put_line(path: *const c_char, line: &[u8]) -> Result<()> {
    let fd @ 0.. = (unsafe {
        libc::open(
            path,
            libc::O_WRONLY | libc::O_CLOEXEC | libc::O_CREAT | libc::O_TRUNC,
            0o644,
        )
    }) else {
        bail_errno!("failed to open file for writing");
    };
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let written = unsafe { libc::write(fd.as_raw_fd(), line.as_ptr().cast(), line.len()) };
    if written < 0 {
        bail_errno!("failed to write to file");
    }
    if written as usize != line.len() {
        return Err(Error {
            errno: libc::EIO,
            cause: Some("short write to file"),
            context: None,
        });
    }

    Ok(())
}

#[cfg_attr(debug_assertions, no_alloc)]
pub fn stat(path: *const c_char) -> Result<libc::stat> {
    let mut stat_buf = mem::MaybeUninit::<libc::stat>::uninit();
    let 0.. = (unsafe { libc::stat(path, stat_buf.as_mut_ptr()) }) else {
        bail_errno!("failed to stat file");
    };
    Ok(unsafe { stat_buf.assume_init() })
}

/// Create an empty file at `path` if nothing exists there yet.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn touch(path: *const c_char) -> Result<()> {
    let fd @ 0.. = (unsafe {
        libc::open(path, libc::O_WRONLY | libc::O_CREAT | libc::O_CLOEXEC, 0o644)
    }) else {
        bail_errno!("failed to create file");
    };
    let _ = unsafe { libc::close(fd) };
    Ok(())
}

/// Create every missing ancestor directory of `path`, but not `path` itself.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn mkdirp_parent(path: *const c_char) -> Result<()> {
    let path_len = unsafe { libc::strlen(path) };
    if path_len > libc::PATH_MAX as usize {
        bail!("mkdirp_parent() path is longer than PATH_MAX");
    }
    let mut buf = [b'\0'; libc::PATH_MAX as usize + 1];
    buf[..path_len].copy_from_slice(unsafe { std::slice::from_raw_parts(path.cast(), path_len) });

    match buf[..path_len].iter().rposition(|&c| c == b'/') {
        None | Some(0) => Ok(()),
        Some(last_slash) => {
            buf[last_slash] = b'\0';
            mkdirp(buf.as_ptr().cast())
        }
    }
}

/// A NUL-terminated path assembled in a fixed-size buffer, for code that must not allocate.
pub struct StackPath {
    buf: [u8; libc::PATH_MAX as usize + 1],
    len: usize,
}

impl StackPath {
    /// Start a path with `base`, which may be relative.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn new(base: &[u8]) -> Result<StackPath> {
        let mut path = StackPath {
            buf: [b'\0'; libc::PATH_MAX as usize + 1],
            len: 0,
        };
        path.extend(base)?;
        Ok(path)
    }

    /// Append a component, with exactly one `/` before it.
    pub fn push(&mut self, component: &[u8]) -> Result<()> {
        let mut component = component;
        while let Some(rest) = component.strip_prefix(b"/") {
            component = rest;
        }
        if self.len == 0 || self.buf[self.len - 1] != b'/' {
            self.extend(b"/")?;
        }
        self.extend(component)
    }

    fn extend(&mut self, bytes: &[u8]) -> Result<()> {
        if self.len + bytes.len() > libc::PATH_MAX as usize {
            return Err(Error {
                errno: libc::ENAMETOOLONG,
                cause: Some("path is longer than PATH_MAX"),
                context: None,
            });
        }
        if bytes.contains(&b'\0') {
            return Err(Error {
                errno: libc::EINVAL,
                cause: Some("path contains an interior NUL"),
                context: None,
            });
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        self.buf[self.len] = b'\0';
        Ok(())
    }

    pub fn as_ptr(&self) -> *const c_char {
        self.buf.as_ptr().cast()
    }

    /// The path, without the trailing NUL.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Fill `buf` with random lowercase hex digits, using `getrandom(2)`.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn random_hex(buf: &mut [u8]) -> Result<()> {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";

    let mut filled = 0;
    while filled < buf.len() {
        let result =
            unsafe { libc::getrandom(buf[filled..].as_mut_ptr().cast(), buf.len() - filled, 0) };
        if result < 0 {
            let err = Error::last_os_error();
            if err.errno == libc::EINTR {
                continue;
            }
            return Err(err.cause("getrandom(2) failed"));
        }
        filled += result as usize;
    }

    for byte in buf.iter_mut() {
        *byte = DIGITS[(*byte & 0xf) as usize];
    }
    Ok(())
}

/// Create a directory for all non-existent path components of `path`.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn mkdirp(path: *const c_char) -> Result<()> {
    let mkdir_ignoring_eexist = |path: *const c_char| -> Result<()> {
        let mkdir_result = unsafe { libc::mkdir(path, 0o755) };
        if mkdir_result == -1 {
            let err = Error::last_os_error();
            if err.errno != libc::EEXIST {
                return Err(err.cause("failed to create directory"));
            }
        };
        Ok(())
    };

    // Error if the path is longer than PATH_MAX.
    let path_len = unsafe { libc::strlen(path) };
    if path_len > libc::PATH_MAX as usize {
        bail!("mkdirp() path is longer than PATH_MAX");
    }
    // Copy the path to a local buffer.
    let mut buf = [b'\0'; libc::PATH_MAX as usize + 1];
    buf[..path_len + 1]
        .copy_from_slice(unsafe { std::slice::from_raw_parts(path.cast(), path_len + 1) });

    // Loop through indices of `/` characters in the buffer to create ancestors.
    for i in 1..buf.len() {
        if buf[i] == b'\0' {
            break;
        }
        if buf[i] != b'/' {
            continue;
        }

        // Replace the `/` with a null byte.
        buf[i] = b'\0';

        // Create the directory, ignoring EEXIST.
        mkdir_ignoring_eexist(buf.as_ptr().cast())?;

        // Put the `/` back.
        buf[i] = b'/';
    }

    // Create the final directory.
    mkdir_ignoring_eexist(buf.as_ptr().cast())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::io::Read;
    use std::os::fd::AsFd;
    use std::os::unix::ffi::OsStrExt;

    fn c_path(path: &std::path::Path) -> CString {
        CString::new(path.as_os_str().as_bytes()).unwrap()
    }

    #[test]
    fn mkdirp_creates_ancestors_and_tolerates_existing() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        let path = c_path(&nested);

        mkdirp(path.as_ptr()).unwrap();
        assert!(nested.is_dir());

        // A second call is a no-op.
        mkdirp(path.as_ptr()).unwrap();
    }

    #[test]
    fn put_line_writes_exact_contents() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("uid_map");
        put_line(c_path(&file).as_ptr(), b"0 1000 1\n").unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "0 1000 1\n");
    }

    #[test]
    fn put_line_reports_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("missing/uid_map");
        let err = put_line(c_path(&file).as_ptr(), b"deny\n").unwrap_err();
        assert_eq!(err.errno, libc::ENOENT);
    }

    #[test]
    fn touch_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mountpoint");
        touch(c_path(&file).as_ptr()).unwrap();
        assert_eq!(std::fs::metadata(&file).unwrap().len(), 0);
    }

    #[test]
    fn mkdirp_parent_leaves_the_last_component() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("etc/ssl/cert.pem");
        mkdirp_parent(c_path(&file).as_ptr()).unwrap();
        assert!(dir.path().join("etc/ssl").is_dir());
        assert!(!file.exists());

        // Nothing to create for a path directly under the root.
        mkdirp_parent(c_str_macro::c_str!("/single").as_ptr()).unwrap();
    }

    #[test]
    fn stack_path_joins_with_single_slashes() {
        let mut path = StackPath::new(b"/srv/root/").unwrap();
        path.push(b".old_root-1234").unwrap();
        assert_eq!(path.as_bytes(), b"/srv/root/.old_root-1234");

        let mut path = StackPath::new(b"/").unwrap();
        path.push(b"//usr/lib").unwrap();
        assert_eq!(path.as_bytes(), b"/usr/lib");

        let path = StackPath::new(b"relative").unwrap();
        let as_c = unsafe { std::ffi::CStr::from_ptr(path.as_ptr()) };
        assert_eq!(as_c.to_bytes(), b"relative");
    }

    #[test]
    fn stack_path_rejects_overlong_paths() {
        let mut path = StackPath::new(b"/").unwrap();
        let long = vec![b'a'; libc::PATH_MAX as usize];
        let err = path.push(&long).unwrap_err();
        assert_eq!(err.errno, libc::ENAMETOOLONG);
        // The path is unchanged apart from the separator.
        assert_eq!(path.as_bytes(), b"/");
    }

    #[test]
    fn random_hex_fills_with_hex_digits() {
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        random_hex(&mut a).unwrap();
        random_hex(&mut b).unwrap();
        assert!(a.iter().all(|c| c.is_ascii_hexdigit()));
        // 32 random bits each; a collision here is not a realistic outcome.
        assert_ne!(a, b);
    }

    #[test]
    fn exit_status_from_wait_status() {
        // Exit code 3: status is `3 << 8`.
        assert_eq!(
            ExitStatus::from_wait_status(3 << 8).unwrap(),
            ExitStatus::Code(3)
        );
        // Killed by SIGKILL: the low bits hold the signal number.
        assert_eq!(
            ExitStatus::from_wait_status(libc::SIGKILL).unwrap(),
            ExitStatus::Signal(libc::SIGKILL)
        );
        assert!(ExitStatus::Code(0).success());
        assert!(!ExitStatus::Signal(libc::SIGTERM).success());
    }

    #[test]
    fn dup_at_least_skips_low_numbers() {
        let (read, _write) = pipe().unwrap();
        let copy = dup_at_least(read.as_fd(), 3).unwrap();
        assert!(copy.as_raw_fd() >= 3);
        assert_ne!(copy.as_raw_fd(), read.as_raw_fd());

        let flags = unsafe { libc::fcntl(copy.as_raw_fd(), libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, libc::FD_CLOEXEC);
    }

    #[test]
    fn pipe_carries_bytes() {
        let (read, write) = pipe().unwrap();
        let written = unsafe { libc::write(write.as_raw_fd(), b"hi".as_ptr().cast(), 2) };
        assert_eq!(written, 2);
        drop(write);

        let mut contents = String::new();
        std::fs::File::from(read)
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "hi");
    }
}
