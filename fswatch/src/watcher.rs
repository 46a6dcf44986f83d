use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use async_stream::stream;
use tokio::sync::{mpsc, watch};

use crate::{
    backend::Backend,
    platforms::{KernelHandle, PlatformHandle},
    Event, WatchError, WatcherOptions, WatcherState,
};

/// Watches files and directories for changes.
///
/// Directory watches cover the directory's immediate children only. Events
/// are delivered in the order the kernel reported them; when the consumer
/// falls behind, the event loop stops reading from the kernel rather than
/// dropping events.
pub struct Watcher {
    backend: Arc<Backend<PlatformHandle>>,
    events: mpsc::Receiver<Event>,
    state: watch::Receiver<WatcherState>,
    failure: watch::Receiver<Option<WatchError>>,
}

impl Watcher {
    /// Creates a watcher and starts its event loop on a dedicated thread.
    pub fn new() -> Result<Watcher, WatchError> {
        Watcher::with_options(WatcherOptions::default())
    }

    pub fn with_options(opts: WatcherOptions) -> Result<Watcher, WatchError> {
        let backend = Arc::new(Backend::new(PlatformHandle::open()?));
        let (tx, rx) = mpsc::channel(opts.event_capacity.max(1));

        let state = backend.subscribe_state();
        let failure = backend.subscribe_failure();

        let runner = backend.clone();
        thread::Builder::new()
            .name("fswatch-events".to_owned())
            .spawn(move || runner.run(tx))?;

        Ok(Watcher {
            backend,
            events: rx,
            state,
            failure,
        })
    }

    /// Starts watching `path`. If it is a directory, changes to its direct
    /// descendants are reported as well.
    pub async fn add(&self, path: impl AsRef<Path>) -> Result<(), WatchError> {
        self.backend.add(path.as_ref()).await
    }

    pub async fn remove(&self, path: impl AsRef<Path>) -> Result<(), WatchError> {
        self.backend.remove(path.as_ref()).await
    }

    pub async fn watched_paths(&self) -> Vec<PathBuf> {
        self.backend.watched_paths().await
    }

    /// The event channel. It yields `None` once the event loop has stopped.
    pub fn events(&mut self) -> &mut mpsc::Receiver<Event> {
        &mut self.events
    }

    pub fn events_stream(&mut self) -> impl futures::Stream<Item = Event> + Send + '_ {
        let events = &mut self.events;

        stream! {
            while let Some(event) = events.recv().await {
                yield event;
            }
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// The error that stopped the event loop, if it did not stop because of
    /// `close()`.
    pub fn error(&self) -> Option<WatchError> {
        self.failure.borrow().clone()
    }

    /// Resolves once the event loop has exited.
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == WatcherState::Stopped).await;
    }

    /// Asks the event loop to stop. Does not wait for it; the kernel
    /// descriptors are closed by the time [`Watcher::stopped`] resolves.
    /// Calling it more than once is fine.
    pub fn close(&self) -> Result<(), WatchError> {
        self.backend.close()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        let _ = self.backend.close();
    }
}

/// Creates a watcher for `path`. The watcher is shut down again if `path`
/// cannot be watched.
pub async fn watch(path: impl AsRef<Path>) -> Result<Watcher, WatchError> {
    let watcher = Watcher::new()?;
    if let Err(e) = watcher.add(path).await {
        let _ = watcher.close();
        return Err(e);
    }
    Ok(watcher)
}
