//! Core library for the sockbridge relay.
//!
//! Exposes a container-engine Unix domain socket running inside a Linux VM
//! (typically a WSL distribution) to a Windows host, and a Windows named
//! pipe to Linux clients, by tunneling opaque byte streams over SSH
//! channels of type `direct-streamlocal@openssh.com`.
//!
//! The building blocks:
//! - `server`: the in-VM SSH server that accepts channels and splices them
//!   onto local Unix sockets.
//! - `forward`: the host-side listener that turns accepted connections into
//!   SSH channels through a managed bastion session.
//! - `relay`: the splice engine, per-operation deadlines, and the generic
//!   Unix/TCP duplex relay.
//! - `pool`, `health`, `metrics`: admission control and observability.
//! - `supervisor` and `watcher`: lifecycle, signals, and parent-process
//!   liveness supervision.

pub mod config;
pub mod endpoint;
pub mod forward;
pub mod health;
pub mod keys;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod relay;
#[cfg(unix)]
pub mod server;
pub mod supervisor;
pub mod watcher;
