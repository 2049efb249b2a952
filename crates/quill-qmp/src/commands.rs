//! Typed command wrappers over the raw monitor channel.
//!
//! Instance lifecycle and monitoring code talks to these rather than to
//! [`Monitor::execute`] directly; each wrapper shapes one command's
//! arguments and decodes its return payload.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};
use crate::monitor::Monitor;

/// Bytes to drain from the agent serial ring buffer per probe.
const AGENT_RINGBUF_SIZE: usize = 16;

#[derive(Debug, Deserialize)]
struct StatusInfo {
    status: String,
}

#[derive(Debug, Deserialize)]
struct CpuInfo {
    thread_id: i64,
}

#[derive(Debug, Deserialize)]
struct ChardevInfo {
    label: String,
    filename: String,
}

#[derive(Debug, Deserialize)]
struct MemorySummary {
    #[serde(rename = "base-memory")]
    base_memory: i64,
}

#[derive(Debug, Deserialize)]
struct BalloonInfo {
    actual: i64,
}

impl Monitor {
    /// Current VM run state (`running`, `paused`, ...).
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadReturn`] when the reply payload is not status
    /// shaped.
    pub async fn query_status(&self) -> Result<String> {
        let ret = self.execute("query-status", None).await?;
        let info: StatusInfo = serde_json::from_value(ret).map_err(|_| Error::BadReturn)?;
        Ok(info.status)
    }

    /// Asks the guest to shut down cooperatively.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be delivered.
    pub async fn system_powerdown(&self) -> Result<()> {
        self.execute("system_powerdown", None).await?;
        Ok(())
    }

    /// Resumes emulation.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be delivered.
    pub async fn cont(&self) -> Result<()> {
        self.execute("cont", None).await?;
        Ok(())
    }

    /// Pauses emulation.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be delivered.
    pub async fn stop(&self) -> Result<()> {
        self.execute("stop", None).await?;
        Ok(())
    }

    /// Tells the hypervisor process to exit immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be delivered.
    pub async fn quit(&self) -> Result<()> {
        self.execute("quit", None).await?;
        Ok(())
    }

    /// Host thread ids backing each vCPU, in CPU order, for pinning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadReturn`] when the reply payload is not CPU
    /// shaped.
    pub async fn query_cpus(&self) -> Result<Vec<i64>> {
        let ret = self.execute("query-cpus", None).await?;
        let cpus: Vec<CpuInfo> = serde_json::from_value(ret).map_err(|_| Error::BadReturn)?;
        Ok(cpus.into_iter().map(|cpu| cpu.thread_id).collect())
    }

    /// Resolves a character-device label to the pty path backing it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadConsole`] when no chardev carries the label or
    /// the matching one is not pty backed.
    pub async fn query_chardev_path(&self, label: &str) -> Result<PathBuf> {
        let ret = self.execute("query-chardev", None).await?;
        let devices: Vec<ChardevInfo> =
            serde_json::from_value(ret).map_err(|_| Error::BadReturn)?;
        devices
            .into_iter()
            .find(|device| device.label == label)
            .and_then(|device| device.filename.strip_prefix("pty:").map(PathBuf::from))
            .ok_or(Error::BadConsole)
    }

    /// Base memory size in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadReturn`] when the reply payload is not memory
    /// shaped.
    pub async fn query_memory_size(&self) -> Result<i64> {
        let ret = self.execute("query-memory-size-summary", None).await?;
        let summary: MemorySummary =
            serde_json::from_value(ret).map_err(|_| Error::BadReturn)?;
        Ok(summary.base_memory)
    }

    /// Effective memory size in bytes under the current balloon.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadReturn`] when the reply payload is not balloon
    /// shaped.
    pub async fn query_balloon(&self) -> Result<i64> {
        let ret = self.execute("query-balloon", None).await?;
        let info: BalloonInfo = serde_json::from_value(ret).map_err(|_| Error::BadReturn)?;
        Ok(info.actual)
    }

    /// Resizes the memory balloon to `size_bytes`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be delivered.
    pub async fn balloon(&self, size_bytes: i64) -> Result<()> {
        self.execute("balloon", Some(json!({ "value": size_bytes })))
            .await?;
        Ok(())
    }

    /// Drains up to `size` bytes from a ring-buffer character device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadReturn`] when the reply is not a string.
    pub async fn ringbuf_read(&self, device: &str, size: usize) -> Result<String> {
        let ret = self
            .execute(
                "ringbuf-read",
                Some(json!({ "device": device, "size": size, "format": "utf8" })),
            )
            .await?;
        serde_json::from_value(ret).map_err(|_| Error::BadReturn)
    }

    /// Probes the guest agent's serial status channel.
    ///
    /// The agent writes a `STARTED` or `STOPPED` marker line into its
    /// ring buffer on every state change. Returns `Some(true)` when the
    /// last complete marker says the agent is up, `Some(false)` when it
    /// announced shutdown, and `None` when the buffer holds no marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the ring buffer cannot be read.
    pub async fn agent_status(&self, device: &str) -> Result<Option<bool>> {
        let buffer = self.ringbuf_read(device, AGENT_RINGBUF_SIZE).await?;
        Ok(parse_agent_status(&buffer))
    }
}

/// Interprets the last complete marker line in an agent ring buffer.
fn parse_agent_status(buffer: &str) -> Option<bool> {
    let lines: Vec<&str> = buffer.split('\n').collect();
    if lines.len() < 2 {
        return None;
    }
    match lines[lines.len() - 2] {
        "STARTED" => Some(true),
        "STOPPED" => Some(false),
        _ => None,
    }
}
