//! One session per command running inside the guest.
//!
//! The command itself is launched and pumped by the transport layer; the
//! session wraps the resulting operation with signal delivery, terminal
//! resize, and exit semantics. Control requests travel out-of-band next
//! to the command's data stream and are individually acknowledged.

use std::io;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{ExecError, Result};

/// Shell convention exit code for a command that was not found.
const EXIT_CODE_NOT_FOUND: i64 = 127;
/// Shell convention exit code for a command that is not executable.
const EXIT_CODE_NOT_EXECUTABLE: i64 = 126;

/// The running guest command an exec session wraps.
///
/// Implemented by the transport that carries the command's I/O (the guest
/// agent link); the session only consumes its completion.
#[async_trait]
pub trait GuestOperation: Send + Sync {
    /// Blocks until the guest command finishes and yields its raw exit
    /// status.
    ///
    /// An `Err` means the link to the guest failed before an exit status
    /// was seen, not that the command exited non-zero.
    async fn wait(&self) -> io::Result<i64>;
}

/// Out-of-band request sent alongside a running command's data stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlRequest {
    /// Deliver a signal to the guest process.
    Signal {
        /// Signal number, as the guest kernel numbers them.
        signal: i32,
    },
    /// Resize the command's terminal.
    WindowResize {
        /// New width in columns.
        width: u32,
        /// New height in rows.
        height: u32,
    },
}

/// A control request paired with its acknowledgement slot.
///
/// The transport pump consumes these, puts the request on the wire, and
/// resolves `ack` exactly once with the peer's answer.
#[derive(Debug)]
pub struct ControlMessage {
    /// The request to deliver.
    pub request: ControlRequest,
    /// Resolved once the peer acknowledges or the delivery fails.
    pub ack: oneshot::Sender<io::Result<()>>,
}

/// One command running inside the guest.
///
/// Construction wires the session to a launched command. [`wait`] is the
/// terminal operation: after it returns, the control channel is closed
/// and the configured cleanup has run.
///
/// [`wait`]: ExecSession::wait
pub struct ExecSession<O> {
    op: O,
    guest_pid: Option<i32>,
    /// Taken when `wait` returns so the pump shuts down with the command.
    control: Mutex<Option<mpsc::Sender<ControlMessage>>>,
    /// Flips to `true` (or closes) once all buffered output reached the
    /// caller.
    drained: watch::Receiver<bool>,
    cleanup: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl<O: GuestOperation> ExecSession<O> {
    /// Creates a session around a launched guest command.
    ///
    /// `control` feeds the transport pump that owns the out-of-band
    /// channel; `drained` is flipped (or dropped) by the output pump once
    /// the last buffered byte has been delivered.
    #[must_use]
    pub fn new(
        op: O,
        control: mpsc::Sender<ControlMessage>,
        drained: watch::Receiver<bool>,
    ) -> Self {
        Self {
            op,
            guest_pid: None,
            control: Mutex::new(Some(control)),
            drained,
            cleanup: Mutex::new(None),
        }
    }

    /// Records the guest process id reported by the transport.
    #[must_use]
    pub fn with_pid(mut self, pid: i32) -> Self {
        self.guest_pid = Some(pid);
        self
    }

    /// Registers a cleanup that runs exactly once after [`wait`] returns,
    /// regardless of outcome.
    ///
    /// [`wait`]: ExecSession::wait
    #[must_use]
    pub fn with_cleanup(self, cleanup: impl FnOnce() + Send + 'static) -> Self {
        *self.cleanup.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
            Some(Box::new(cleanup));
        self
    }

    /// Best-effort guest process id; `None` when the transport could not
    /// report one.
    #[must_use]
    pub const fn pid(&self) -> Option<i32> {
        self.guest_pid
    }

    /// Sends a signal to the guest process.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::NoSuchProcess`] once the command has
    /// completed, without touching the control channel;
    /// [`ExecError::Control`] when the guest side rejects the request.
    pub async fn signal(&self, signal: i32) -> Result<()> {
        self.send_control(ControlRequest::Signal { signal }).await
    }

    /// Resizes the command's terminal.
    ///
    /// # Errors
    ///
    /// Same conditions as [`ExecSession::signal`].
    pub async fn window_resize(&self, width: u32, height: u32) -> Result<()> {
        self.send_control(ControlRequest::WindowResize { width, height })
            .await
    }

    /// Waits for the command to finish and returns its exit code.
    ///
    /// Blocks until the underlying operation completes and, on success,
    /// until all buffered output has been delivered. Exit codes 127 and
    /// 126 come back as [`ExecError::CommandNotFound`] and
    /// [`ExecError::CommandNotExecutable`]; a guest link that died
    /// mid-session comes back as [`ExecError::SessionDisconnected`] so it
    /// can never be mistaken for a command failure.
    ///
    /// # Errors
    ///
    /// See above; the numeric exit code, where known, rides on the error
    /// via [`ExecError::exit_code`].
    pub async fn wait(&self) -> Result<i64> {
        let result = self.wait_inner().await;

        // The command is over: later control requests must fail fast and
        // the pump must not outlive the session.
        self.control
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        let cleanup = self
            .cleanup
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }

        result
    }

    async fn wait_inner(&self) -> Result<i64> {
        let code = match self.op.wait().await {
            Ok(code) => code,
            Err(e) if is_link_failure(&e) => {
                tracing::debug!(error = %e, "guest link dropped mid-session");
                return Err(ExecError::SessionDisconnected { code: -1 });
            }
            Err(e) => return Err(ExecError::Operation(e)),
        };

        // All buffered output must reach the caller before the exit code.
        let mut drained = self.drained.clone();
        let _ = drained.wait_for(|done| *done).await;

        match code {
            EXIT_CODE_NOT_FOUND => Err(ExecError::CommandNotFound { code }),
            EXIT_CODE_NOT_EXECUTABLE => Err(ExecError::CommandNotExecutable { code }),
            _ => Ok(code),
        }
    }

    /// Whether the command's output has been fully drained, which is the
    /// session's notion of "the process is gone".
    fn completed(&self) -> bool {
        *self.drained.borrow() || self.drained.has_changed().is_err()
    }

    async fn send_control(&self, request: ControlRequest) -> Result<()> {
        if self.completed() {
            return Err(ExecError::NoSuchProcess);
        }
        let sender = self
            .control
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            return Err(ExecError::NoSuchProcess);
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if sender
            .send(ControlMessage {
                request,
                ack: ack_tx,
            })
            .await
            .is_err()
        {
            // The pump is gone; so is the process.
            return Err(ExecError::NoSuchProcess);
        }

        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ExecError::Control(e)),
            Err(_) => Err(ExecError::Control(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "control channel closed before acknowledgement",
            ))),
        }
    }
}

/// Whether an operation error means the guest link died rather than the
/// command misbehaving.
fn is_link_failure(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    ) || {
        // Some transports only surface the closure in the message text.
        let text = err.to_string();
        text.contains("stream closed") || text.contains("connection closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scripted operation returning a canned wait outcome.
    struct ScriptedOperation {
        outcome: Mutex<Option<io::Result<i64>>>,
    }

    impl ScriptedOperation {
        fn exits_with(code: i64) -> Self {
            Self {
                outcome: Mutex::new(Some(Ok(code))),
            }
        }

        fn fails_with(err: io::Error) -> Self {
            Self {
                outcome: Mutex::new(Some(Err(err))),
            }
        }
    }

    #[async_trait]
    impl GuestOperation for ScriptedOperation {
        async fn wait(&self) -> io::Result<i64> {
            self.outcome
                .lock()
                .unwrap()
                .take()
                .expect("wait called twice")
        }
    }

    /// Session plumbing with the drain signal already fired.
    fn drained_session(op: ScriptedOperation) -> ExecSession<ScriptedOperation> {
        let (control_tx, _control_rx) = mpsc::channel(1);
        let (drain_tx, drain_rx) = watch::channel(true);
        // Keep the sender alive semantics out of the test's way.
        drop(drain_tx);
        ExecSession::new(op, control_tx, drain_rx)
    }

    /// Session plumbing with a live pump and an unfired drain signal.
    fn live_session(
        op: ScriptedOperation,
    ) -> (
        ExecSession<ScriptedOperation>,
        mpsc::Receiver<ControlMessage>,
        watch::Sender<bool>,
    ) {
        let (control_tx, control_rx) = mpsc::channel(1);
        let (drain_tx, drain_rx) = watch::channel(false);
        (ExecSession::new(op, control_tx, drain_rx), control_rx, drain_tx)
    }

    #[test]
    fn control_requests_serialize_to_the_wire_shape() {
        assert_eq!(
            serde_json::to_value(ControlRequest::Signal { signal: 15 }).unwrap(),
            serde_json::json!({ "command": "signal", "signal": 15 })
        );
        assert_eq!(
            serde_json::to_value(ControlRequest::WindowResize {
                width: 80,
                height: 24
            })
            .unwrap(),
            serde_json::json!({ "command": "window-resize", "width": 80, "height": 24 })
        );
    }

    #[tokio::test]
    async fn wait_returns_the_exit_code_after_the_drain() {
        let (session, _control_rx, drain_tx) = live_session(ScriptedOperation::exits_with(0));

        let drain = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            drain_tx.send(true).unwrap();
        });

        assert_eq!(session.wait().await.unwrap(), 0);
        drain.await.unwrap();
    }

    #[tokio::test]
    async fn wait_treats_a_dropped_drain_sender_as_drained() {
        let (session, _control_rx, drain_tx) = live_session(ScriptedOperation::exits_with(3));
        drop(drain_tx);

        assert_eq!(session.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn wait_translates_shell_convention_exit_codes() {
        let session = drained_session(ScriptedOperation::exits_with(127));
        match session.wait().await {
            Err(ExecError::CommandNotFound { code }) => assert_eq!(code, 127),
            other => panic!("unexpected result: {other:?}"),
        }

        let session = drained_session(ScriptedOperation::exits_with(126));
        let err = session.wait().await.unwrap_err();
        assert!(matches!(err, ExecError::CommandNotExecutable { .. }));
        assert_eq!(err.exit_code(), Some(126));
    }

    #[tokio::test]
    async fn wait_reports_a_dead_guest_link_distinctly() {
        let session = drained_session(ScriptedOperation::fails_with(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset by peer",
        )));
        match session.wait().await {
            Err(ExecError::SessionDisconnected { code }) => assert_eq!(code, -1),
            other => panic!("unexpected result: {other:?}"),
        }

        // Message-text-only closures count too.
        let session = drained_session(ScriptedOperation::fails_with(io::Error::other(
            "websocket: stream closed unexpectedly",
        )));
        assert!(matches!(
            session.wait().await,
            Err(ExecError::SessionDisconnected { .. })
        ));

        // Any other failure passes through untranslated.
        let session = drained_session(ScriptedOperation::fails_with(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "denied",
        )));
        assert!(matches!(
            session.wait().await,
            Err(ExecError::Operation(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_runs_exactly_once_regardless_of_outcome() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let session = drained_session(ScriptedOperation::exits_with(0))
            .with_cleanup(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        session.wait().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&calls);
        let session = drained_session(ScriptedOperation::fails_with(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "eof",
        )))
        .with_cleanup(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        session.wait().await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn signal_is_acknowledged_by_the_pump() {
        let (session, mut control_rx, _drain_tx) =
            live_session(ScriptedOperation::exits_with(0));

        let pump = tokio::spawn(async move {
            let message = control_rx.recv().await.unwrap();
            assert_eq!(message.request, ControlRequest::Signal { signal: 15 });
            message.ack.send(Ok(())).unwrap();
        });

        session.signal(15).await.unwrap();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn window_resize_propagates_an_acknowledgement_error() {
        let (session, mut control_rx, _drain_tx) =
            live_session(ScriptedOperation::exits_with(0));

        let pump = tokio::spawn(async move {
            let message = control_rx.recv().await.unwrap();
            assert_eq!(
                message.request,
                ControlRequest::WindowResize {
                    width: 120,
                    height: 40
                }
            );
            message
                .ack
                .send(Err(io::Error::other("resize refused")))
                .unwrap();
        });

        assert!(matches!(
            session.window_resize(120, 40).await,
            Err(ExecError::Control(_))
        ));
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn signal_after_completion_never_touches_the_channel() {
        let (session, mut control_rx, drain_tx) = live_session(ScriptedOperation::exits_with(0));
        drain_tx.send(true).unwrap();

        assert!(matches!(
            session.signal(9).await,
            Err(ExecError::NoSuchProcess)
        ));
        // Nothing was written to the control channel.
        assert!(control_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wait_closes_the_control_channel() {
        let (session, mut control_rx, drain_tx) = live_session(ScriptedOperation::exits_with(0));
        drain_tx.send(true).unwrap();

        session.wait().await.unwrap();
        assert!(matches!(
            session.signal(9).await,
            Err(ExecError::NoSuchProcess)
        ));
        // The pump observes the closed channel and shuts down.
        assert!(control_rx.recv().await.is_none());
    }
}
