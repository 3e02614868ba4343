//! Shared write half of the coordinator connection.
//!
//! The heartbeat task and every task session write frames upstream; a
//! mutex serializes them so frames never interleave mid-write. The read
//! half stays with the daemon's assignment loop.

use std::io;

use marathon_proto::Message;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

/// Serialized writer for upstream frames.
#[derive(Debug)]
pub struct Upstream<W> {
    /// Write half of the coordinator connection.
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> Upstream<W> {
    /// Wraps a write half.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Sends one unsolicited frame to the coordinator.
    pub async fn send(&self, msg: &Message) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        marathon_proto::send(&mut *writer, 0, msg).await
    }
}
