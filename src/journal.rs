//! Snapshot lifecycle journal
//!
//! Appends JSON lines to `<base_dir>/logs/events.log`, one per lifecycle
//! event (allocation, phase changes, publish, prune, gc).

use crate::config::SiteConfig;
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Append-only event journal
pub struct EventJournal {
    enabled: bool,
    path: PathBuf,
}

impl EventJournal {
    pub fn new(config: &SiteConfig) -> Self {
        Self {
            enabled: config.general.event_log,
            path: config.storage.event_log_path(),
        }
    }

    /// Record an event.
    ///
    /// IO failures are logged and dropped; the journal never fails a run.
    pub async fn record(&self, event: &str, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "pid": std::process::id(),
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize journal event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write event journal: {}", e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // One write per line keeps concurrent appenders from interleaving
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
