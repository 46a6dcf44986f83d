use std::{ffi::OsStr, fmt::Debug, hash::Hash, path::Path};

use crate::WatchError;

mod wake;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use linux::Inotify as PlatformHandle;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux::Mask;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod bsd;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) use bsd::Kqueue as PlatformHandle;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub use bsd::Mask;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
compile_error!("fswatch needs inotify or kqueue; this target has neither");

/// One decoded kernel record.
pub(crate) enum Record<'a, T> {
    Change(Change<'a, T>),
    /// The kernel dropped the registration on its own.
    Expired(T),
    /// The kernel's queue overflowed and records were lost.
    Overflow,
    /// The reserved wake source fired; the watcher is shutting down.
    Wake,
}

pub(crate) struct Change<'a, T> {
    pub token: T,
    /// Entry name inside a watched directory.
    pub name: Option<&'a OsStr>,
    pub mask: Mask,
    /// The registration is gone once this change is delivered.
    pub expires: bool,
}

/// A kernel notification descriptor.
///
/// Implementations must let `close` be called from any thread while another
/// thread is parked in `wait_for_events`, and the waiting thread must come
/// back with `Ok(0)` or a [`Record::Wake`] rather than hang.
///
/// Once `release` has run every descriptor is closed: registering fails with
/// [`WatchError::WatcherClosed`] and waiting returns `Ok(0)`.
pub(crate) trait KernelHandle: Sized + Send + Sync + 'static {
    /// Identifies a registration in raw kernel records.
    type Token: Copy + Eq + Hash + Debug + Send + Sync;
    /// Whatever has to stay alive for a registration to stay active.
    type Watch: Send + Sync;
    type Buffer;

    fn open() -> Result<Self, WatchError>;

    fn buffer() -> Self::Buffer;

    fn token(watch: &Self::Watch) -> Self::Token;

    fn register_interest(&self, path: &Path) -> Result<Self::Watch, WatchError>;

    fn unregister(&self, watch: Self::Watch, path: &Path) -> Result<(), WatchError>;

    /// Blocks until records are available. `Ok(0)` means the handle was closed.
    fn wait_for_events(&self, buffer: &mut Self::Buffer) -> Result<usize, WatchError>;

    fn records<'a>(
        &'a self,
        buffer: &'a Self::Buffer,
        len: usize,
    ) -> impl Iterator<Item = Record<'a, Self::Token>> + 'a;

    fn close(&self) -> Result<(), WatchError>;

    /// Closes the kernel descriptors. Only called by the event loop after it
    /// has stopped waiting.
    fn release(&self);
}
