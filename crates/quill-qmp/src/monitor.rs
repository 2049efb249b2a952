//! Monitor connection handling: handshake, request/reply correlation, and
//! event fan-out.
//!
//! One background read loop per connection demultiplexes the incoming
//! stream. Replies are routed to their waiting caller through a per-id
//! oneshot slot; events go to every live subscriber through its own
//! unbounded sink, so a slow consumer can never stall the loop. Any stream
//! fault tears the whole connection down: pending callers observe
//! [`Error::Disconnected`] and event streams end.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::error::{Error, Result};
use crate::frame::{Event, Frame, Greeting, Incoming, Request};

/// Handle to the QMP control channel of one running hypervisor process.
///
/// Cheap to clone; all clones share the socket, so every caller issuing
/// commands or consuming events against one instance uses the same
/// monitor. A disconnected monitor is finished: reconnecting means
/// creating a fresh one with [`Monitor::connect`].
#[derive(Clone)]
pub struct Monitor {
    shared: Arc<Shared>,
}

struct Shared {
    /// Write half of the socket; taken on disconnect.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Reply slots keyed by request id. A slot is registered before its
    /// request is written and removed on delivery, cancellation, or
    /// teardown.
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    /// Per-subscriber event sinks.
    sinks: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
    /// Live subscriber count; gates whether the read loop delivers events
    /// at all.
    listeners: AtomicUsize,
    /// Monotonic request id counter.
    next_id: AtomicU64,
    /// Set once the connection is torn down, by either side.
    disconnected: AtomicBool,
    /// Wakes the read loop so an explicit disconnect does not wait for
    /// the peer to produce input.
    shutdown: Notify,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value>>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sinks(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<Event>>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tears the connection state down: marks the monitor disconnected,
    /// unblocks every pending caller, and ends all event streams.
    /// Idempotent; the socket halves are dropped by their owners.
    fn teardown(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }

        // Dropping the senders resolves every waiter with `Disconnected`
        // and every subscriber with end-of-stream.
        self.pending().clear();
        self.sinks().clear();

        // Close our write half if nobody is mid-write; a concurrent
        // writer drops it on its own once it observes the flag.
        if let Ok(mut writer) = self.writer.try_lock() {
            *writer = None;
        }
    }

    /// Teardown triggered from the caller side; also stops the read loop.
    fn fault(&self) {
        self.teardown();
        self.shutdown.notify_one();
    }
}

/// Guard that deregisters a reply slot when its caller goes away.
///
/// Dropping the `execute` future (cancellation, deadline) must not leak
/// the registration; the read loop then discards the late reply.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending().remove(&self.id);
    }
}

impl Monitor {
    /// Connects to the QMP socket at `path`.
    ///
    /// Reads and validates the server greeting, spawns the read loop, and
    /// completes the capability negotiation the server requires before it
    /// accepts commands. On any failure no background task is left
    /// running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the socket cannot be dialed,
    /// [`Error::Protocol`] if the greeting is missing or malformed or the
    /// negotiation is rejected.
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // The server speaks first: one greeting line announcing itself.
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::Protocol(
                "connection closed before greeting".to_string(),
            ));
        }
        let greeting: Greeting = serde_json::from_str(&line)
            .map_err(|e| Error::Protocol(format!("malformed greeting: {e}")))?;
        tracing::debug!(
            capabilities = greeting.qmp.capabilities.len(),
            version = %greeting.qmp.version,
            "greeting received"
        );

        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(Some(write_half)),
            pending: Mutex::new(HashMap::new()),
            sinks: Mutex::new(Vec::new()),
            listeners: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            disconnected: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        tokio::spawn(read_loop(Arc::clone(&shared), reader));

        let monitor = Self { shared };

        // Commands are refused until the capability negotiation completes;
        // run it through the regular request path so the reply is
        // correlated like any other.
        if let Err(e) = monitor.execute("qmp_capabilities", None).await {
            monitor.disconnect().await;
            return Err(match e {
                Error::Qmp { class, desc } => Error::Protocol(format!(
                    "capability negotiation rejected: {class}: {desc}"
                )),
                other => other,
            });
        }

        tracing::debug!(path = %path.display(), "qmp monitor connected");
        Ok(monitor)
    }

    /// Whether the monitor still holds a live connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.shared.disconnected.load(Ordering::SeqCst)
    }

    /// Runs a command and waits for its correlated reply.
    ///
    /// Safe to call from any number of tasks concurrently; each call gets
    /// exactly the reply carrying its request id regardless of arrival
    /// order. Dropping the returned future cancels the call locally: the
    /// reply slot is released and a late reply is discarded, without
    /// affecting the connection or other callers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Qmp`] when the command fails,
    /// [`Error::Disconnected`] when the connection is or becomes dead.
    pub async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let shared = &*self.shared;
        if shared.disconnected.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }

        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        // Register before writing so a reply can never arrive unclaimed.
        shared.pending().insert(id, tx);
        let _guard = PendingGuard { shared, id };

        // A teardown racing the registration above would miss our slot;
        // re-checking after the insert closes the window.
        if shared.disconnected.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }

        let line = serde_json::to_string(&Request {
            execute: command,
            arguments,
            id,
        })?;

        {
            let mut writer = shared.writer.lock().await;
            let Some(w) = writer.as_mut() else {
                return Err(Error::Disconnected);
            };
            if let Err(e) = write_line(w, &line).await {
                tracing::debug!(error = %e, "monitor write failed");
                *writer = None;
                drop(writer);
                shared.fault();
                return Err(Error::Disconnected);
            }
        }
        tracing::debug!(id, command, "request sent");

        match rx.await {
            Ok(result) => result,
            // The slot was dropped by teardown before a reply arrived.
            Err(_) => Err(Error::Disconnected),
        }
    }

    /// [`Monitor::execute`] with a deadline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the deadline fires first; the
    /// connection and other in-flight calls are unaffected.
    pub async fn execute_with_timeout(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        match tokio::time::timeout(timeout, self.execute(command, arguments)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Subscribes to the hypervisor's event broadcast.
    ///
    /// Events are delivered in wire order to every live subscription.
    /// Events arriving while nobody subscribes are dropped. The stream
    /// ends when the monitor disconnects or the stream faults; it cannot
    /// be restarted on the same monitor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the monitor is already gone.
    pub fn events(&self) -> Result<EventStream> {
        let shared = &self.shared;
        if shared.disconnected.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        shared.sinks().push(tx);
        shared.listeners.fetch_add(1, Ordering::SeqCst);

        // Same race window as in `execute`: a teardown between the
        // registration and here would strand the sink.
        if shared.disconnected.load(Ordering::SeqCst) {
            shared.sinks().clear();
        }

        Ok(EventStream {
            rx,
            shared: Arc::clone(shared),
        })
    }

    /// Closes the connection.
    ///
    /// Every pending [`Monitor::execute`] fails with
    /// [`Error::Disconnected`], all event streams end, and the read loop
    /// stops. Idempotent.
    pub async fn disconnect(&self) {
        self.shared.fault();
        // Deterministically drop our half of the socket even when a
        // writer held the lock during teardown.
        let mut writer = self.shared.writer.lock().await;
        *writer = None;
        tracing::debug!("qmp monitor disconnected");
    }
}

/// Live view of the monitor's event broadcast.
///
/// Dropping the stream ends the subscription without touching other
/// subscribers or the connection.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
    shared: Arc<Shared>,
}

impl EventStream {
    /// Waits for the next event; `None` once the monitor is gone.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.shared.listeners.fetch_sub(1, Ordering::SeqCst);
        // The dead sink is pruned by the read loop on its next delivery.
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Background read loop: one per connection.
///
/// Runs until the peer closes the stream, a frame cannot be handled, or
/// an explicit disconnect wakes it. Always ends in [`Shared::teardown`].
async fn read_loop(shared: Arc<Shared>, mut reader: BufReader<OwnedReadHalf>) {
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            read = reader.read_line(&mut line) => read,
            () = shared.shutdown.notified() => break,
        };

        match read {
            Ok(0) => {
                tracing::debug!("qmp stream closed by peer");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "qmp read failed");
                break;
            }
        }

        let frame: Frame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                // A stream we cannot parse is a stream we cannot trust.
                tracing::warn!(error = %e, "malformed qmp frame, dropping connection");
                break;
            }
        };

        match frame.classify() {
            Some(Incoming::Event(event)) => {
                if shared.listeners.load(Ordering::SeqCst) == 0 {
                    continue;
                }
                tracing::debug!(event = %event.name, "event received");
                shared.sinks().retain(|tx| tx.send(event.clone()).is_ok());
            }
            Some(Incoming::Reply { id, result }) => {
                let waiter = shared.pending().remove(&id);
                match waiter {
                    Some(tx) => {
                        let result = result.map_err(|e| Error::Qmp {
                            class: e.class,
                            desc: e.desc,
                        });
                        // A caller cancelled between removal and delivery
                        // drops the reply, same as an unknown id.
                        let _ = tx.send(result);
                    }
                    None => tracing::debug!(id, "discarding reply for unknown request id"),
                }
            }
            None => {
                tracing::warn!("unclassifiable qmp frame, dropping connection");
                break;
            }
        }
    }

    shared.teardown();
}
