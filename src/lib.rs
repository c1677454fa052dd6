//! Native helper daemon for a child-process management library.
//!
//! A managed process cannot safely `fork`/`exec` on its own because its own runtime installs
//! signal handlers that would interfere with unmanaged children. This crate is the helper
//! process started on its behalf: it owns `SIGCHLD`, spawns and reaps children, forwards
//! signals, and relays exit notifications back over a Unix socket (see [`service::Service`] for
//! the main loop and [`subchannel::Subchannel`] for the fork/exec algorithm).

#![cfg(unix)]

pub mod ancillary_socket;
pub mod child;
pub mod codec;
pub mod config;
pub mod error;
pub mod notify;
pub mod protocol;
pub mod resource;
pub mod service;
pub mod signal;
pub mod subchannel;
pub mod subchannel_collection;
pub mod write_buffer;
