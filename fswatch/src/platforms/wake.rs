use std::{
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    sync::{Mutex, PoisonError},
};

use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    unistd::pipe,
};

use crate::WatchError;

/// Self-connected pipe used purely as a wake source. Nothing is ever written
/// to it: dropping the write end makes the read end report end-of-file, which
/// both epoll and kqueue surface as readiness.
pub(crate) struct WakePipe {
    reader: OwnedFd,
    writer: Mutex<Option<OwnedFd>>,
}

impl WakePipe {
    pub fn new() -> Result<WakePipe, WatchError> {
        let (reader, writer) = pipe().map_err(WatchError::syscall("pipe"))?;

        for fd in [&reader, &writer] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                .map_err(WatchError::syscall("fcntl"))?;
        }

        Ok(WakePipe {
            reader,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn reader(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    /// Identity the kernel reports when the wake source fires.
    pub fn ident(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Returns `false` if the pipe had already been signalled.
    pub fn wake(&self) -> bool {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.take().is_some()
    }
}
