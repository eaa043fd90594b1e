//! Policy, credential and attribute primitives shared by the lockdown service.

#[cfg(not(target_os = "linux"))]
compile_error!("lockdown relies on inotify and ext-style file attributes and only builds on Linux");

pub mod attributes;
pub mod credential;
pub mod error;
pub mod event_log;
pub mod paths;
pub mod policy;
