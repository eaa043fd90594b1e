//! Inotify-driven immutability enforcement for a protected directory tree.

pub mod admin;
pub mod engine;
pub mod event_loop;
pub mod logging;
pub mod watch;
