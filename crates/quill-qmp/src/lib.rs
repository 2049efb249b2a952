//! # quill-qmp
//!
//! QMP control channel for a running QEMU instance.
//!
//! The hypervisor exposes an out-of-band control socket speaking
//! newline-delimited JSON. This crate owns that socket for the lifetime
//! of the VM process:
//!
//! - [`Monitor`] — connects, performs the capability handshake, and runs
//!   one background read loop that correlates replies to concurrent
//!   requests by id and fans unsolicited events out to subscribers.
//! - Command wrappers — typed helpers (`query_status`, `system_powerdown`,
//!   balloon and vCPU queries, ...) over [`Monitor::execute`].
//! - [`EventStream`] — a per-subscriber view of the event broadcast.
//!
//! Faults are fatal to the connection by design: a monitor that observed
//! a malformed frame or a dead socket reports [`Error::Disconnected`]
//! everywhere and a fresh monitor must be connected. Retry policy belongs
//! to the caller.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod commands;
pub mod error;
mod frame;
mod monitor;

pub use error::{Error, Result};
pub use frame::{Event, Timestamp};
pub use monitor::{EventStream, Monitor};
