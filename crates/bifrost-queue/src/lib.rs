// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Durable FIFO of inbound prompts, one JSON file per message.
//!
//! Messages are persisted the moment they arrive and removed only after the
//! agent turn for them has terminated, so a restart replays anything that was
//! still pending.  The queue never merges or deduplicates; ordering within a
//! channel follows the `queuedAt` timestamp.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One unit of pending work, exactly as persisted on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub channel_id: String,
    /// Informational only; the gateway is single-tenant.
    pub user_id: String,
    pub text: String,
    /// Platform message identifier, unique per channel.
    pub ts: String,
    /// Thread root to reply into.
    pub thread_ts: String,
    /// Sort key for per-channel FIFO ordering.
    pub queued_at: DateTime<Utc>,
    /// Local paths of downloaded image attachments, in attachment order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_paths: Vec<PathBuf>,
}

/// On-disk message queue rooted at a single directory.
#[derive(Debug, Clone)]
pub struct MessageQueue {
    dir: PathBuf,
}

impl MessageQueue {
    /// Open (creating if necessary) a queue directory.
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating queue directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// File that stores the record for `(channel_id, ts)`.
    ///
    /// Slack timestamps contain a dot (`1700000000.000100`); dots are mapped
    /// to dashes so the name stays unambiguous on every filesystem.  The same
    /// key always maps to the same file, so a collision overwrites — which is
    /// the same logical message, since the platform never reuses a ts.
    fn file_for(&self, channel_id: &str, ts: &str) -> PathBuf {
        let channel: String = channel_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        self.dir
            .join(format!("{}_{}.json", channel, ts.replace('.', "-")))
    }

    /// Persist a message.  Write failures propagate to the caller so the
    /// user can be told their message was not accepted.
    pub async fn enqueue(&self, msg: &QueuedMessage) -> anyhow::Result<()> {
        let path = self.file_for(&msg.channel_id, &msg.ts);
        let body = serde_json::to_vec_pretty(msg).context("serializing queued message")?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Remove the record for `(channel_id, ts)`; returns whether one existed.
    pub async fn dequeue(&self, channel_id: &str, ts: &str) -> bool {
        let path = self.file_for(channel_id, ts);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %path.display(), "dequeue failed: {e}");
                false
            }
        }
    }

    /// All pending records across channels, oldest first.
    /// Unreadable records are skipped, not fatal.
    pub async fn get_pending(&self) -> Vec<QueuedMessage> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) => {
                warn!(dir = %self.dir.display(), "cannot read queue directory: {e}");
                return out;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path).await {
                Ok(msg) => out.push(msg),
                Err(e) => warn!(path = %path.display(), "skipping unreadable record: {e}"),
            }
        }
        out.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        out
    }

    /// Pending records for one channel, oldest first.
    pub async fn get_pending_for_channel(&self, channel_id: &str) -> Vec<QueuedMessage> {
        let mut all = self.get_pending().await;
        all.retain(|m| m.channel_id == channel_id);
        all
    }

    /// Replace the text of a still-queued message (the user edited it before
    /// processing started).  Returns false when the record no longer exists.
    pub async fn update_queued_text(&self, channel_id: &str, ts: &str, new_text: &str) -> bool {
        let path = self.file_for(channel_id, ts);
        let mut msg = match read_record(&path).await {
            Ok(m) => m,
            Err(_) => return false,
        };
        msg.text = new_text.to_string();
        match serde_json::to_vec_pretty(&msg) {
            Ok(body) => tokio::fs::write(&path, body).await.is_ok(),
            Err(_) => false,
        }
    }
}

async fn read_record(path: &Path) -> anyhow::Result<QueuedMessage> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
