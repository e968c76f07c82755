//! Exclusive ownership of a single OS file descriptor.

use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

/// Number of attempts made to close a descriptor before giving up.
const CLOSE_RETRIES: usize = 5;

/// Owner of one open file descriptor, closed exactly once when dropped.
///
/// `Fd` is move-only. A failed `close` is retried up to [CLOSE_RETRIES]
/// times. `EBADF` means the descriptor was already released elsewhere, which
/// is a use-after-release bug: the process is aborted instead of continuing
/// with a descriptor table that can no longer be trusted.
pub struct Fd(RawFd);

impl Fd {
    /// Takes ownership of a raw descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be an open descriptor not owned by anything else.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        debug_assert!(fd >= 0);
        Self(fd)
    }

    /// Returns the raw descriptor number.
    pub fn as_raw(&self) -> RawFd {
        self.0
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.0;
        std::mem::forget(self);
        fd
    }
}

impl fmt::Debug for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fd").field(&self.0).finish()
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        for _ in 0..CLOSE_RETRIES {
            if unsafe { libc::close(self.0) } == 0 {
                return;
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EBADF) => {
                    eprintln!("fatal: closing invalid descriptor {}: {err}", self.0);
                    std::process::abort();
                }
                // Linux releases the descriptor even when interrupted, so a
                // retry could only hit EBADF or someone else's descriptor.
                Some(libc::EINTR) => return,
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Command, Stdio};

    fn pipe() -> (Fd, Fd) {
        let mut fds = [0; 2];
        let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        assert_eq!(res, 0);

        unsafe { (Fd::from_raw(fds[0]), Fd::from_raw(fds[1])) }
    }

    /// Reads from the pipe: 0 means every write end is closed, -1 with
    /// `EAGAIN` means a writer is still open.
    fn read_end(rd: &Fd) -> isize {
        let mut buf = [0u8; 1];
        unsafe { libc::read(rd.as_raw(), buf.as_mut_ptr() as *mut libc::c_void, 1) }
    }

    #[test]
    fn drop_closes_descriptor() {
        let (rd, wr) = pipe();

        assert_eq!(read_end(&rd), -1);
        drop(wr);
        assert_eq!(read_end(&rd), 0);
    }

    #[test]
    fn move_keeps_single_owner() {
        let (rd, wr) = pipe();
        let raw = wr.as_raw();

        let moved = wr;
        assert_eq!(moved.as_raw_fd(), raw);
        assert_eq!(read_end(&rd), -1);

        drop(moved);
        assert_eq!(read_end(&rd), 0);
    }

    #[test]
    fn into_raw_releases_ownership() {
        let (rd, wr) = pipe();
        let raw = wr.into_raw_fd();

        // Nothing closed the write end yet.
        assert_eq!(read_end(&rd), -1);

        drop(unsafe { Fd::from_raw(raw) });
        assert_eq!(read_end(&rd), 0);
    }

    #[test]
    fn closing_released_descriptor_aborts() {
        const CHILD: &str = "NBSOCK_FD_ABORT_CHILD";

        if std::env::var_os(CHILD).is_some() {
            let (_rd, wr) = pipe();
            assert_eq!(unsafe { libc::close(wr.as_raw()) }, 0);
            drop(wr);
            unsafe { libc::_exit(0) };
        }

        let status = Command::new(std::env::current_exe().unwrap())
            .args([
                "net::fd::tests::closing_released_descriptor_aborts",
                "--exact",
                "--nocapture",
                "--test-threads=1",
            ])
            .env(CHILD, "1")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();

        assert_eq!(status.signal(), Some(libc::SIGABRT));
    }
}
