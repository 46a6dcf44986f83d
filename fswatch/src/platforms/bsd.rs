mod kqueue;

pub use kqueue::{Kqueue, Mask};
