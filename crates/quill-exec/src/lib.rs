//! # quill-exec
//!
//! Interactive command sessions inside the guest.
//!
//! A command is launched and pumped by the transport layer (the guest
//! agent link); this crate wraps the resulting operation into an
//! [`ExecSession`] exposing the host-side contract:
//!
//! - [`ExecSession::signal`] / [`ExecSession::window_resize`] — control
//!   requests multiplexed next to the command's data stream, each
//!   synchronously acknowledged.
//! - [`ExecSession::wait`] — exit-code retrieval with shell-convention
//!   translation (127/126), an output-drain barrier, and a distinct
//!   "session disconnected" outcome when the guest link dies mid-command.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
mod session;

pub use error::{ExecError, Result};
pub use session::{ControlMessage, ControlRequest, ExecSession, GuestOperation};
