use std::{
    collections::HashMap,
    hash::Hash,
    path::{Path, PathBuf},
};

use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, trace, warn};

use crate::{
    platforms::{KernelHandle, Record},
    Event, WatchError, WatcherState,
};

struct Entry<W> {
    path: PathBuf,
    watch: W,
}

/// Watched paths keyed both ways: by token for the event loop, by path for
/// `add`/`remove`.
pub(crate) struct Registry<T, W> {
    tokens: HashMap<T, Entry<W>>,
    paths: HashMap<PathBuf, T>,
}

impl<T: Copy + Eq + Hash, W> Registry<T, W> {
    pub fn new() -> Self {
        Registry {
            tokens: HashMap::new(),
            paths: HashMap::new(),
        }
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.paths.contains_key(path)
    }

    pub fn path_for(&self, token: T) -> Option<&Path> {
        self.tokens.get(&token).map(|entry| entry.path.as_path())
    }

    pub fn insert(&mut self, token: T, path: PathBuf, watch: W) {
        self.paths.insert(path.clone(), token);
        self.tokens.insert(token, Entry { path, watch });
    }

    pub fn remove_path(&mut self, path: &Path) -> Option<(PathBuf, W)> {
        let token = self.paths.remove(path)?;
        self.tokens
            .remove(&token)
            .map(|entry| (entry.path, entry.watch))
    }

    pub fn remove_token(&mut self, token: T) -> Option<(PathBuf, W)> {
        let entry = self.tokens.remove(&token)?;
        self.paths.remove(&entry.path);
        Some((entry.path, entry.watch))
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.keys().cloned().collect()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.tokens.len();
        self.paths.clear();
        self.tokens.clear();
        n
    }
}

pub(crate) struct Backend<K: KernelHandle> {
    handle: K,
    registry: RwLock<Registry<K::Token, K::Watch>>,
    state: watch::Sender<WatcherState>,
    failure: watch::Sender<Option<WatchError>>,
}

impl<K: KernelHandle> Backend<K> {
    pub fn new(handle: K) -> Backend<K> {
        let (state, _) = watch::channel(WatcherState::Created);
        let (failure, _) = watch::channel(None);

        Backend {
            handle,
            registry: RwLock::new(Registry::new()),
            state,
            failure,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    pub fn subscribe_failure(&self) -> watch::Receiver<Option<WatchError>> {
        self.failure.subscribe()
    }

    fn ensure_open(&self) -> Result<(), WatchError> {
        match *self.state.borrow() {
            WatcherState::Created | WatcherState::Running => Ok(()),
            WatcherState::Closing | WatcherState::Stopped => Err(WatchError::WatcherClosed),
        }
    }

    pub async fn add(&self, path: &Path) -> Result<(), WatchError> {
        self.ensure_open()?;

        // Held across the registration so two racing adds of one path cannot
        // both reach the kernel. `close` may have landed while we waited.
        let mut registry = self.registry.write().await;
        self.ensure_open()?;
        if registry.contains_path(path) {
            return Err(WatchError::WatchExists(path.to_path_buf()));
        }

        let watch = self.handle.register_interest(path)?;
        let token = K::token(&watch);

        // inotify hands back the existing descriptor when the same inode is
        // reached through a second path.
        if let Some(existing) = registry.path_for(token) {
            debug!(path = %path.display(), existing = %existing.display(), "path aliases an existing watch");
            return Err(WatchError::WatchExists(existing.to_path_buf()));
        }

        debug!(path = %path.display(), ?token, "watching path");
        registry.insert(token, path.to_path_buf(), watch);
        Ok(())
    }

    pub async fn remove(&self, path: &Path) -> Result<(), WatchError> {
        self.ensure_open()?;

        let mut registry = self.registry.write().await;
        self.ensure_open()?;
        let (path, watch) = registry
            .remove_path(path)
            .ok_or_else(|| WatchError::NotWatched(path.to_path_buf()))?;

        debug!(path = %path.display(), "removing watch");
        self.handle.unregister(watch, &path)
    }

    pub async fn watched_paths(&self) -> Vec<PathBuf> {
        self.registry.read().await.paths()
    }

    /// Event loop body. Must run on a thread outside the async runtime: it
    /// parks in the kernel and uses blocking channel sends.
    ///
    /// On exit every registration is dropped and the kernel descriptors are
    /// closed before the state reaches `Stopped`.
    pub fn run(&self, events: mpsc::Sender<Event>) {
        self.state.send_if_modified(|state| {
            if *state == WatcherState::Created {
                *state = WatcherState::Running;
                true
            } else {
                false
            }
        });
        debug!("event loop started");

        if let Err(e) = self.pump(&events) {
            warn!(error = %e, "event loop failed");
            self.failure.send_replace(Some(e));
        }

        // Holding the write lock keeps any pending `add` from registering
        // against a released handle; it sees `Stopped` once it gets in.
        let mut registry = self.registry.blocking_write();
        let dropped = registry.clear();
        self.handle.release();
        self.state.send_replace(WatcherState::Stopped);
        drop(registry);

        debug!(dropped, "event loop stopped");
    }

    fn pump(&self, events: &mpsc::Sender<Event>) -> Result<(), WatchError> {
        let mut buffer = K::buffer();
        let mut batch = Vec::new();
        let mut expired = Vec::new();

        loop {
            let len = self.handle.wait_for_events(&mut buffer)?;
            if len == 0 {
                return Ok(());
            }

            let mut stop = false;
            {
                // Copy out under the read lock; delivery below may block on a
                // slow consumer and must not hold up `add`.
                let registry = self.registry.blocking_read();
                for record in self.handle.records(&buffer, len) {
                    match record {
                        Record::Wake => {
                            stop = true;
                            break;
                        }
                        Record::Overflow => warn!("kernel event queue overflowed, events were lost"),
                        Record::Expired(token) => expired.push(token),
                        Record::Change(change) => {
                            let Some(path) = registry.path_for(change.token) else {
                                trace!(token = ?change.token, "record for a watch that is gone");
                                continue;
                            };
                            batch.push(Event::new(path, change.name, change.mask));
                            if change.expires {
                                expired.push(change.token);
                            }
                        }
                    }
                }
            }

            if !expired.is_empty() {
                let mut registry = self.registry.blocking_write();
                for token in expired.drain(..) {
                    if let Some((path, _)) = registry.remove_token(token) {
                        debug!(path = %path.display(), "watch retired by the kernel");
                    }
                }
            }

            for event in batch.drain(..) {
                if events.blocking_send(event).is_err() {
                    debug!("event receiver dropped");
                    return Ok(());
                }
            }

            if stop {
                return Ok(());
            }
        }
    }

    /// Signals the event loop to stop. Returns immediately; the loop exits
    /// once it observes the wake source.
    pub fn close(&self) -> Result<(), WatchError> {
        let live = self.state.send_if_modified(|state| match *state {
            WatcherState::Created | WatcherState::Running => {
                *state = WatcherState::Closing;
                true
            }
            WatcherState::Closing | WatcherState::Stopped => false,
        });

        if !live {
            return Ok(());
        }

        debug!("closing watcher");
        self.handle.close()
    }
}
