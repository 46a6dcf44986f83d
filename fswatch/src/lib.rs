//! Create/remove notifications for files and directories on top of the
//! kernel's own notification facility: inotify on Linux, kqueue on macOS and
//! the BSDs.
//!
//! ```no_run
//! # async fn run() -> Result<(), fswatch::WatchError> {
//! let mut watcher = fswatch::watch("/tmp").await?;
//! while let Some(event) = watcher.events().recv().await {
//!     if event.is_create() {
//!         println!("created {:?}", event.target);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod backend;
mod platforms;
mod watcher;

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use nix::errno::Errno;
use thiserror::Error;

pub use platforms::Mask;
pub use watcher::{watch, Watcher};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("existing watch for path {0:?}")]
    WatchExists(PathBuf),

    #[error("no watch registered for path {0:?}")]
    NotWatched(PathBuf),

    #[error("{op} {path:?}: {source}")]
    Os {
        op: &'static str,
        path: PathBuf,
        source: Errno,
    },

    #[error("{op}: {source}")]
    Syscall { op: &'static str, source: Errno },

    #[error("the watcher was closed")]
    WatcherClosed,

    #[error("io error {0}")]
    Io(String),
}

impl WatchError {
    pub(crate) fn os(op: &'static str, path: &Path, source: Errno) -> WatchError {
        WatchError::Os {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn syscall(op: &'static str) -> impl FnOnce(Errno) -> WatchError {
        move |source| WatchError::Syscall { op, source }
    }
}

impl From<std::io::Error> for WatchError {
    fn from(value: std::io::Error) -> Self {
        WatchError::Io(value.to_string())
    }
}

impl From<Errno> for WatchError {
    fn from(value: Errno) -> Self {
        WatchError::Syscall {
            op: "syscall",
            source: value,
        }
    }
}

/// A single change reported by the kernel for a watched path.
///
/// `mask` holds the platform's native flags; use the predicates rather than
/// inspecting it directly when portability matters. The predicates are
/// defined next to each kernel backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// The watched directory the change was observed through. `None` when
    /// the change concerns the watched object itself.
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    mask: Mask,
}

impl Event {
    pub(crate) fn new(watched: &Path, name: Option<&OsStr>, mask: Mask) -> Event {
        match name {
            Some(name) => Event {
                source: Some(watched.to_path_buf()),
                target: watched.join(name),
                mask,
            },
            None => Event {
                source: None,
                target: watched.to_path_buf(),
                mask,
            },
        }
    }

    pub fn mask(&self) -> Mask {
        self.mask
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherState {
    /// The event loop has not picked up work yet.
    Created,
    Running,
    /// `close()` was issued; the event loop has not observed it yet.
    Closing,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct WatcherOptions {
    /// Capacity of the event channel. When it is full the event loop stops
    /// reading from the kernel until the consumer catches up.
    pub event_capacity: usize,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        WatcherOptions { event_capacity: 1 }
    }
}
