mod inotify;
mod records;

pub use inotify::{Inotify, Mask};
