use std::{
    ffi::CString,
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd},
        unix::ffi::OsStrExt,
    },
    path::Path,
    sync::{PoisonError, RwLock, RwLockReadGuard},
};

use nix::{
    errno::Errno,
    sys::{
        epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout},
        inotify::AddWatchFlags,
    },
    unistd,
};

use super::records::RecordIter;
use crate::{
    platforms::{wake::WakePipe, Change, KernelHandle, Record},
    Event, WatchError,
};

pub type Mask = AddWatchFlags;

const INOTIFY_KEY: u64 = 0;
const WAKE_KEY: u64 = 1;

// Room for a few hundred records with full-length names.
const BUFFER_LEN: usize = 64 * 1024;

fn watch_mask() -> AddWatchFlags {
    AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_MODIFY
        | AddWatchFlags::IN_MOVE
        | AddWatchFlags::IN_DELETE_SELF
        | AddWatchFlags::IN_MOVE_SELF
}

struct Descriptors {
    fd: OwnedFd,
    epoll: Epoll,
    wake: WakePipe,
}

/// inotify descriptor multiplexed with the wake pipe through epoll. Closing
/// an inotify descriptor does not interrupt a blocked `read(2)`, so the
/// event loop parks in `epoll_wait` instead and only reads once inotify is
/// ready.
///
/// The waiting thread holds the read side of the lock for the whole wait;
/// `release` takes the write side and is only called from that same thread.
pub struct Inotify {
    fds: RwLock<Option<Descriptors>>,
}

impl Inotify {
    fn descriptors(&self) -> RwLockReadGuard<'_, Option<Descriptors>> {
        self.fds.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KernelHandle for Inotify {
    type Token = i32;
    type Watch = i32;
    type Buffer = Box<[u8]>;

    fn open() -> Result<Self, WatchError> {
        let raw = unsafe { libc::inotify_init1(libc::IN_CLOEXEC | libc::IN_NONBLOCK) };
        if raw == -1 {
            return Err(WatchError::Syscall {
                op: "inotify_init1",
                source: Errno::last(),
            });
        }
        // SAFETY: inotify_init1 just handed us this descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let epoll =
            Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(WatchError::syscall("epoll_create1"))?;
        let wake = WakePipe::new()?;

        epoll
            .add(&fd, EpollEvent::new(EpollFlags::EPOLLIN, INOTIFY_KEY))
            .map_err(WatchError::syscall("epoll_ctl"))?;
        epoll
            .add(wake.reader(), EpollEvent::new(EpollFlags::EPOLLIN, WAKE_KEY))
            .map_err(WatchError::syscall("epoll_ctl"))?;

        Ok(Inotify {
            fds: RwLock::new(Some(Descriptors { fd, epoll, wake })),
        })
    }

    fn buffer() -> Self::Buffer {
        vec![0u8; BUFFER_LEN].into_boxed_slice()
    }

    fn token(watch: &Self::Watch) -> Self::Token {
        *watch
    }

    fn register_interest(&self, path: &Path) -> Result<Self::Watch, WatchError> {
        let fds = self.descriptors();
        let fds = fds.as_ref().ok_or(WatchError::WatcherClosed)?;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| WatchError::os("inotify_add_watch", path, Errno::EINVAL))?;

        let wd = unsafe {
            libc::inotify_add_watch(fds.fd.as_raw_fd(), c_path.as_ptr(), watch_mask().bits())
        };

        if wd == -1 {
            Err(WatchError::os("inotify_add_watch", path, Errno::last()))
        } else {
            Ok(wd)
        }
    }

    fn unregister(&self, watch: Self::Watch, path: &Path) -> Result<(), WatchError> {
        // Closing the inotify descriptor already dropped every watch.
        let fds = self.descriptors();
        let Some(fds) = fds.as_ref() else {
            return Ok(());
        };

        match unsafe { libc::inotify_rm_watch(fds.fd.as_raw_fd(), watch) } {
            -1 => Err(WatchError::os("inotify_rm_watch", path, Errno::last())),
            _ => Ok(()),
        }
    }

    fn wait_for_events(&self, buffer: &mut Self::Buffer) -> Result<usize, WatchError> {
        let fds = self.descriptors();
        let Some(fds) = fds.as_ref() else {
            return Ok(0);
        };
        let mut ready = [EpollEvent::empty(); 2];

        loop {
            let n = match fds.epoll.wait(&mut ready, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(WatchError::Syscall {
                        op: "epoll_wait",
                        source,
                    })
                }
            };

            if ready[..n].iter().any(|event| event.data() == WAKE_KEY) {
                return Ok(0);
            }

            match unistd::read(fds.fd.as_raw_fd(), &mut buffer[..]) {
                Ok(len) => return Ok(len),
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
                Err(source) => return Err(WatchError::Syscall { op: "read", source }),
            }
        }
    }

    fn records<'a>(
        &'a self,
        buffer: &'a Self::Buffer,
        len: usize,
    ) -> impl Iterator<Item = Record<'a, Self::Token>> + 'a {
        RecordIter::new(&buffer[..len]).map(|raw| {
            let mask = AddWatchFlags::from_bits_truncate(raw.mask);
            if mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                Record::Overflow
            } else if mask.contains(AddWatchFlags::IN_IGNORED) {
                Record::Expired(raw.wd)
            } else {
                Record::Change(Change {
                    token: raw.wd,
                    name: raw.name,
                    mask,
                    expires: false,
                })
            }
        })
    }

    fn close(&self) -> Result<(), WatchError> {
        if let Some(fds) = self.descriptors().as_ref() {
            fds.wake.wake();
        }
        Ok(())
    }

    fn release(&self) {
        let mut fds = self.fds.write().unwrap_or_else(PoisonError::into_inner);
        fds.take();
    }
}

impl Event {
    pub fn is_create(&self) -> bool {
        self.mask.contains(AddWatchFlags::IN_CREATE)
    }

    pub fn is_remove(&self) -> bool {
        self.mask
            .intersects(AddWatchFlags::IN_DELETE | AddWatchFlags::IN_DELETE_SELF)
    }

    pub fn is_modify(&self) -> bool {
        self.mask.contains(AddWatchFlags::IN_MODIFY)
    }

    /// Whether the entry the event concerns is a directory. Only inotify
    /// reports entry types, so kqueue builds have no `is_dir`.
    pub fn is_dir(&self) -> bool {
        self.mask.contains(AddWatchFlags::IN_ISDIR)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use nix::errno::Errno;

    use super::Inotify;
    use crate::{
        platforms::{KernelHandle, Record},
        WatchError,
    };

    #[test]
    fn reports_entry_names_for_directory_watches() {
        let dir = tempfile::tempdir().unwrap();
        let inotify = Inotify::open().unwrap();
        let wd = inotify.register_interest(dir.path()).unwrap();

        File::create(dir.path().join("child")).unwrap();

        let mut buffer = Inotify::buffer();
        let len = inotify.wait_for_events(&mut buffer).unwrap();
        assert!(len > 0);

        let first = inotify.records(&buffer, len).next();
        match first {
            Some(Record::Change(change)) => {
                assert_eq!(change.token, wd);
                assert_eq!(change.name.unwrap(), "child");
            }
            _ => panic!("expected a change record"),
        }
    }

    #[test]
    fn file_watch_has_no_entry_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        let mut file = File::create(&path).unwrap();

        let inotify = Inotify::open().unwrap();
        inotify.register_interest(&path).unwrap();
        file.write_all(b"hey hey").unwrap();

        let mut buffer = Inotify::buffer();
        let len = inotify.wait_for_events(&mut buffer).unwrap();
        match inotify.records(&buffer, len).next() {
            Some(Record::Change(change)) => assert!(change.name.is_none()),
            _ => panic!("expected a change record"),
        };
    }

    #[test]
    fn close_unblocks_wait() {
        let inotify = std::sync::Arc::new(Inotify::open().unwrap());
        let waiter = inotify.clone();
        let handle = std::thread::spawn(move || {
            let mut buffer = Inotify::buffer();
            waiter.wait_for_events(&mut buffer)
        });

        inotify.close().unwrap();
        assert_eq!(handle.join().unwrap(), Ok(0));
    }

    #[test]
    fn released_handle_refuses_work() {
        let dir = tempfile::tempdir().unwrap();
        let inotify = Inotify::open().unwrap();
        let wd = inotify.register_interest(dir.path()).unwrap();

        inotify.release();

        assert_eq!(
            inotify.register_interest(dir.path()),
            Err(WatchError::WatcherClosed)
        );
        assert_eq!(inotify.unregister(wd, dir.path()), Ok(()));
        assert_eq!(inotify.wait_for_events(&mut Inotify::buffer()), Ok(0));
        assert_eq!(inotify.close(), Ok(()));
    }

    #[test]
    fn missing_path_is_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let inotify = Inotify::open().unwrap();

        assert_eq!(
            inotify.register_interest(&missing),
            Err(WatchError::Os {
                op: "inotify_add_watch",
                path: missing.clone(),
                source: Errno::ENOENT,
            })
        );
    }
}
