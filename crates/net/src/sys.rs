//! Thin wrappers over the linux syscalls the reactor needs.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use tracing::error;

/// Calls a libc function and turns a `-1` return into `io::Error::last_os_error()`.
macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)? ) ) => {{
        // SAFETY: every call site passes valid descriptors and live pointers for the call's duration.
        let res = unsafe { libc::$fn($($arg),*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use syscall;

/// Logs an unrecoverable reactor failure and aborts the process.
pub(crate) fn fatal(op: &'static str, err: &io::Error) -> ! {
    error!(op, cause = %err, "fatal reactor error, abort");
    std::process::abort()
}

pub(crate) fn epoll_create() -> io::Result<OwnedFd> {
    let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
    // SAFETY: the descriptor was just returned by the kernel and nobody else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn eventfd() -> io::Result<OwnedFd> {
    let fd = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?;
    // SAFETY: the descriptor was just returned by the kernel and nobody else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn timerfd() -> io::Result<OwnedFd> {
    let fd = syscall!(timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC))?;
    // SAFETY: the descriptor was just returned by the kernel and nobody else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Writes a `u64` counter value, the wire format of eventfd.
pub(crate) fn write_u64(fd: &impl AsRawFd, value: u64) -> io::Result<()> {
    let bytes = value.to_ne_bytes();
    let n = syscall!(write(fd.as_raw_fd(), bytes.as_ptr().cast::<libc::c_void>(), bytes.len()))?;
    if n.unsigned_abs() == bytes.len() { Ok(()) } else { Err(io::Error::from(io::ErrorKind::WriteZero)) }
}

/// Reads the `u64` counter of an eventfd or timerfd.
pub(crate) fn read_u64(fd: &impl AsRawFd) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    let n = syscall!(read(fd.as_raw_fd(), bytes.as_mut_ptr().cast::<libc::c_void>(), bytes.len()))?;
    if n.unsigned_abs() == bytes.len() { Ok(u64::from_ne_bytes(bytes)) } else { Err(io::Error::from(io::ErrorKind::UnexpectedEof)) }
}

/// Arms a one-shot timerfd to expire after `after`.
pub(crate) fn timerfd_arm(fd: &impl AsRawFd, after: Duration) -> io::Result<()> {
    // SAFETY: itimerspec is plain old data, all-zero is a disarmed timer.
    let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
    spec.it_value.tv_sec = libc::time_t::try_from(after.as_secs()).unwrap_or(libc::time_t::MAX);
    spec.it_value.tv_nsec = libc::c_long::from(after.subsec_nanos().cast_signed());
    syscall!(timerfd_settime(fd.as_raw_fd(), 0, &raw const spec, std::ptr::null_mut()))?;
    Ok(())
}

/// Pending error of a socket, read and cleared through `SO_ERROR`.
pub(crate) fn socket_error(fd: RawFd) -> io::Error {
    let mut optval: libc::c_int = 0;
    let mut optlen = libc::socklen_t::try_from(size_of::<libc::c_int>()).unwrap_or_default();
    match syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        (&raw mut optval).cast::<libc::c_void>(),
        &raw mut optlen,
    )) {
        Ok(_) => io::Error::from_raw_os_error(optval),
        Err(e) => e,
    }
}

/// Zero-copy transfer from `in_fd` at `offset` to the socket `out_fd`.
///
/// `offset` is advanced by the number of bytes sent.
pub(crate) fn sendfile(out_fd: RawFd, in_fd: RawFd, offset: &mut u64, count: usize) -> io::Result<usize> {
    let mut off = libc::off_t::try_from(*offset).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let n = syscall!(sendfile(out_fd, in_fd, &raw mut off, count))?;
    *offset = off.unsigned_abs();
    Ok(n.unsigned_abs())
}
