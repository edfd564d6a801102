//! The one-shot error channel between a spawned child and its parent.
//!
//! The child writes at most one report, in a single `write(2)` of at most [`REPORT_MAX`] bytes,
//! then exits. A report fits in `PIPE_BUF`, so the write is atomic and never blocks on a fresh
//! pipe, whether or not the parent is reading yet. Both ends are close-on-exec: once the child
//! executes its target program, the parent reads EOF with no bytes.
//!
//! Wire format of a report:
//!
//! ```text
//! [label length: u16 LE][label bytes][message length: u16 LE][message bytes]
//! ```

use alloc_counter::no_alloc;
use std::fmt;
use std::io::{Cursor, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use crate::error::{bail_errno, Error, Result};
use crate::libc_util;

/// Maximum size of an encoded report. Must not exceed `PIPE_BUF`.
pub const REPORT_MAX: usize = 4096;

/// Labels longer than this are truncated.
const LABEL_MAX: usize = 256;

const LEN_SIZE: usize = 2;

/// A failure reported by a child, decoded by the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Which action (or step of an action) failed, e.g. `pivot_root-tmpfs`.
    pub label: String,

    /// What went wrong, including the OS error string.
    pub message: String,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.message)
    }
}

/// The child's end of the error channel.
#[derive(Debug)]
pub struct ErrorWriter {
    fd: OwnedFd,
}

/// The parent's end of the error channel.
#[derive(Debug)]
pub struct ErrorReader {
    fd: OwnedFd,
}

/// Create an error channel, returning `(reader, writer)`.
///
/// Pass the writer to [`crate::spawn::spawn`], then drop it before calling
/// [`ErrorReader::read_report`]. Otherwise the read never sees EOF.
pub fn error_channel() -> Result<(ErrorReader, ErrorWriter)> {
    let (read, write) =
        libc_util::pipe().map_err(|e| e.context("failed to create error channel"))?;
    libc_util::set_nonblocking(write.as_fd())
        .map_err(|e| e.context("failed to make error channel non-blocking"))?;
    Ok((ErrorReader { fd: read }, ErrorWriter { fd: write }))
}

impl ErrorWriter {
    /// Write one report to the channel. Never allocates.
    pub fn report(&self, label: &str, message: fmt::Arguments<'_>) -> Result<()> {
        write_report(self.fd.as_raw_fd(), label, message)
    }
}

impl AsFd for ErrorWriter {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl ErrorReader {
    /// Read until every copy of the write end is closed, and decode what was written.
    ///
    /// `Ok(None)` means the child closed the channel without reporting: it either executed its
    /// target program or ran out of actions.
    pub fn read_report(self) -> Result<Option<ErrorReport>> {
        let mut bytes = Vec::new();
        std::fs::File::from(self.fd)
            .read_to_end(&mut bytes)
            .map_err(|e| Error::from(e).cause("failed to read from error channel"))?;
        decode_report(&bytes)
    }
}

impl AsFd for ErrorReader {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg_attr(debug_assertions, no_alloc)]
fn write_report(fd: std::ffi::c_int, label: &str, message: fmt::Arguments<'_>) -> Result<()> {
    let mut buffer = [0u8; REPORT_MAX];
    let len = encode_report(&mut buffer, label, message);

    let written = unsafe { libc::write(fd, buffer.as_ptr().cast(), len) };
    if written < 0 {
        bail_errno!("failed to write to error channel");
    }
    if written as usize != len {
        return Err(Error::new().cause("short write to error channel"));
    }
    Ok(())
}

/// Encode a report into `buffer`, returning the encoded length.
///
/// The label and message are truncated to fit; truncation may split a UTF-8 sequence, which the
/// decoder replaces with U+FFFD.
pub(crate) fn encode_report(
    buffer: &mut [u8; REPORT_MAX],
    label: &str,
    message: fmt::Arguments<'_>,
) -> usize {
    let label = &label.as_bytes()[..label.len().min(LABEL_MAX)];
    buffer[..LEN_SIZE].copy_from_slice(&(label.len() as u16).to_le_bytes());
    buffer[LEN_SIZE..LEN_SIZE + label.len()].copy_from_slice(label);

    let message_start = LEN_SIZE + label.len() + LEN_SIZE;
    let message_len = {
        let mut cursor = Cursor::new(&mut buffer[message_start..]);
        // A full buffer fails the write, after writing what fits.
        let _ = cursor.write_fmt(message);
        cursor.position() as usize
    };
    buffer[message_start - LEN_SIZE..message_start]
        .copy_from_slice(&(message_len as u16).to_le_bytes());

    message_start + message_len
}

/// Decode the bytes read from an error channel.
pub(crate) fn decode_report(bytes: &[u8]) -> Result<Option<ErrorReport>> {
    if bytes.is_empty() {
        return Ok(None);
    }

    let mut rest = bytes;
    let label = take_field(&mut rest)?;
    let message = take_field(&mut rest)?;
    if !rest.is_empty() {
        return Err(Error::new().cause("trailing bytes after error report"));
    }

    Ok(Some(ErrorReport {
        label: String::from_utf8_lossy(label).into_owned(),
        message: String::from_utf8_lossy(message).into_owned(),
    }))
}

fn take_field<'a>(rest: &mut &'a [u8]) -> Result<&'a [u8]> {
    if rest.len() < LEN_SIZE {
        return Err(Error::new().cause("truncated error report length"));
    }
    let len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
    let body = &rest[LEN_SIZE..];
    if body.len() < len {
        return Err(Error::new().cause("truncated error report field"));
    }
    let (field, remaining) = body.split_at(len);
    *rest = remaining;
    Ok(field)
}
