use std::{
    os::fd::{FromRawFd, OwnedFd},
    path::Path,
    sync::{
        atomic::{AtomicIsize, Ordering},
        PoisonError, RwLock, RwLockReadGuard,
    },
};

use nix::{
    errno::Errno,
    fcntl::{self, OFlag},
    sys::{
        event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue as RawKqueue},
        stat::Mode,
    },
};

use crate::{
    platforms::{wake::WakePipe, Change, KernelHandle, Record},
    Event, WatchError,
};

pub type Mask = FilterFlag;

const BATCH: usize = 32;

/// `udata` of the wake pipe's registration. Targets are numbered from 1.
const WAKE_TOKEN: isize = 0;

fn watch_mask() -> FilterFlag {
    FilterFlag::NOTE_DELETE | FilterFlag::NOTE_EXTEND | FilterFlag::NOTE_WRITE
}

fn apply(kq: &RawKqueue, change: KEvent) -> Result<(), Errno> {
    loop {
        match kq.kevent(&[change], &mut [], None) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// An open target. The id travels in the knote's `udata`, so records are
/// matched to the registration rather than to a descriptor number the
/// process may already have reused.
pub struct Registration {
    fd: OwnedFd,
    id: isize,
}

struct Descriptors {
    kq: RawKqueue,
    wake: WakePipe,
}

/// kqueue with one descriptor per watched target. kqueue offers no way to
/// abandon a pending `kevent(2)`, so the read end of a [`WakePipe`] sits in
/// the same queue under the reserved [`WAKE_TOKEN`].
pub struct Kqueue {
    fds: RwLock<Option<Descriptors>>,
    next_id: AtomicIsize,
}

impl Kqueue {
    fn descriptors(&self) -> RwLockReadGuard<'_, Option<Descriptors>> {
        self.fds.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KernelHandle for Kqueue {
    type Token = isize;
    type Watch = Registration;
    type Buffer = Vec<KEvent>;

    fn open() -> Result<Self, WatchError> {
        let kq = RawKqueue::new().map_err(WatchError::syscall("kqueue"))?;
        let wake = WakePipe::new()?;

        apply(
            &kq,
            KEvent::new(
                wake.ident() as usize,
                EventFilter::EVFILT_READ,
                EventFlag::EV_ADD,
                FilterFlag::empty(),
                0,
                WAKE_TOKEN,
            ),
        )
        .map_err(WatchError::syscall("kevent"))?;

        Ok(Kqueue {
            fds: RwLock::new(Some(Descriptors { kq, wake })),
            next_id: AtomicIsize::new(WAKE_TOKEN + 1),
        })
    }

    fn buffer() -> Self::Buffer {
        let blank = KEvent::new(
            0,
            EventFilter::EVFILT_VNODE,
            EventFlag::empty(),
            FilterFlag::empty(),
            0,
            0,
        );
        vec![blank; BATCH]
    }

    fn token(watch: &Self::Watch) -> Self::Token {
        watch.id
    }

    fn register_interest(&self, path: &Path) -> Result<Self::Watch, WatchError> {
        let fds = self.descriptors();
        let fds = fds.as_ref().ok_or(WatchError::WatcherClosed)?;

        let raw = fcntl::open(
            path,
            OFlag::O_RDONLY | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|source| WatchError::os("open", path, source))?;
        // SAFETY: open just handed us this descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        apply(
            &fds.kq,
            KEvent::new(
                raw as usize,
                EventFilter::EVFILT_VNODE,
                EventFlag::EV_ADD | EventFlag::EV_CLEAR,
                watch_mask(),
                0,
                id,
            ),
        )
        .map_err(|source| WatchError::os("kevent", path, source))?;

        Ok(Registration { fd, id })
    }

    fn unregister(&self, watch: Self::Watch, _path: &Path) -> Result<(), WatchError> {
        // Closing the descriptor removes its knote.
        drop(watch.fd);
        Ok(())
    }

    fn wait_for_events(&self, buffer: &mut Self::Buffer) -> Result<usize, WatchError> {
        let fds = self.descriptors();
        let Some(fds) = fds.as_ref() else {
            return Ok(0);
        };

        loop {
            match fds.kq.kevent(&[], buffer, None) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(WatchError::Syscall {
                        op: "kevent",
                        source,
                    })
                }
            }
        }
    }

    fn records<'a>(
        &'a self,
        buffer: &'a Self::Buffer,
        len: usize,
    ) -> impl Iterator<Item = Record<'a, Self::Token>> + 'a {
        buffer[..len].iter().map(|event| {
            if event.udata() == WAKE_TOKEN {
                return Record::Wake;
            }

            let mask = event.fflags();
            Record::Change(Change {
                token: event.udata(),
                name: None,
                mask,
                expires: mask.contains(FilterFlag::NOTE_DELETE),
            })
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
        self.mask.contains(FilterFlag::NOTE_EXTEND)
    }

    pub fn is_remove(&self) -> bool {
        self.mask.contains(FilterFlag::NOTE_DELETE)
    }

    pub fn is_modify(&self) -> bool {
        self.mask.contains(FilterFlag::NOTE_WRITE)
    }
}
