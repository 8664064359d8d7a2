//! JSONL-backed session recorder.
//!
//! Entries are pushed over an unbounded channel to a background appender
//! task, so the engine's loop never waits on disk. One line per entry, in
//! notification order.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::domain::{ExecutionResult, ExecutionStatus};
use crate::error::Result;
use crate::session::SessionRecorder;

/// One line of the session history file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEntry {
    History {
        entry: String,
        recorded_at: i64,
    },
    ToolCall {
        name: String,
        duration_ms: u64,
        success: bool,
        recorded_at: i64,
    },
    SessionComplete {
        status: ExecutionStatus,
        iterations: usize,
        recorded_at: i64,
    },
}

/// Recorder appending session entries to `history.jsonl` in a session
/// directory.
pub struct JsonlSessionRecorder {
    tx: mpsc::UnboundedSender<SessionEntry>,
    path: PathBuf,
    writer: JoinHandle<()>,
}

impl JsonlSessionRecorder {
    /// Create the session directory and start the background appender.
    pub fn new(session_dir: impl AsRef<Path>) -> Result<Self> {
        let session_dir = session_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&session_dir)?;
        let path = session_dir.join("history.jsonl");

        let (tx, mut rx) = mpsc::unbounded_channel::<SessionEntry>();
        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(err) = append_entry(&writer_path, &entry).await {
                    warn!(path = %writer_path.display(), error = %err, "failed to append session entry");
                }
            }
        });

        Ok(Self { tx, path, writer })
    }

    /// Path of the history file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting entries and wait for the appender to drain.
    pub async fn finish(self) {
        let Self { tx, writer, .. } = self;
        drop(tx);
        let _ = writer.await;
    }

    fn push(&self, entry: SessionEntry) {
        // A closed channel means the writer is gone; history is best-effort.
        if self.tx.send(entry).is_err() {
            warn!("session writer gone, dropping entry");
        }
    }
}

async fn append_entry(path: &Path, entry: &SessionEntry) -> Result<()> {
    let line = serde_json::to_string(entry)?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

impl SessionRecorder for JsonlSessionRecorder {
    fn add_history_entry(&self, entry: &str) {
        self.push(SessionEntry::History {
            entry: entry.to_string(),
            recorded_at: chrono::Utc::now().timestamp_millis(),
        });
    }

    fn record_tool_call(&self, name: &str, duration_ms: u64, success: bool) {
        self.push(SessionEntry::ToolCall {
            name: name.to_string(),
            duration_ms,
            success,
            recorded_at: chrono::Utc::now().timestamp_millis(),
        });
    }

    fn complete_session(&self, result: &ExecutionResult) {
        self.push(SessionEntry::SessionComplete {
            status: result.status,
            iterations: result.iterations.len(),
            recorded_at: chrono::Utc::now().timestamp_millis(),
        });
    }
}
