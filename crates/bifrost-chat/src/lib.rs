// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Chat platform surface.
//!
//! The gateway talks to the chat workspace through the [`ChatClient`] trait;
//! [`SlackClient`] is the production implementation over the Slack Web API,
//! and [`MockChatClient`] records calls for tests.  Inbound traffic arrives
//! through a Socket Mode task that translates Slack's event envelopes into
//! the [`ChatEvent`] enum.

mod mock;
mod slack;

pub use mock::{MockCall, MockChatClient};
pub use slack::{run_socket_mode, SlackClient};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat API error: {0}")]
    Api(String),
    #[error("unexpected chat API response: {0}")]
    Shape(String),
}

/// Outbound operations against the chat platform.
///
/// All methods are best understood as thin RPC wrappers; retry and
/// best-effort policies live with the callers, which know whether a failure
/// is user-visible.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Post a message, optionally threaded; returns the new message's ts.
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> Result<String, ChatError>;

    async fn update_message(&self, channel: &str, ts: &str, text: &str) -> Result<(), ChatError>;

    async fn delete_message(&self, channel: &str, ts: &str) -> Result<(), ChatError>;

    async fn reaction_add(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatError>;

    async fn reaction_remove(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatError>;

    /// Upload text content as a file attachment into a thread.
    async fn file_upload(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        content: &str,
        filename: &str,
        title: &str,
    ) -> Result<(), ChatError>;

    /// Open a native streaming message; `buffer_size` is a surfacing hint
    /// (1 = show text as soon as it arrives).
    async fn chat_stream(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        buffer_size: u32,
    ) -> Result<Box<dyn ChatStreamer>, ChatError>;

    /// Authenticated download of a platform-hosted file (image attachments).
    async fn download_file(&self, url: &str) -> Result<Vec<u8>, ChatError>;
}

/// Handle to one native streaming message.
#[async_trait]
pub trait ChatStreamer: Send + Sync {
    async fn append(&self, markdown: &str) -> Result<(), ChatError>;
    async fn stop(&self) -> Result<(), ChatError>;
}

// ── Inbound events ────────────────────────────────────────────────────────────

/// A file attached to an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatFile {
    pub id: String,
    pub name: String,
    pub mimetype: String,
    pub size: u64,
    pub url_private_download: Option<String>,
}

/// A new message posted in a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub channel: String,
    pub user: String,
    pub text: String,
    pub ts: String,
    pub thread_ts: Option<String>,
    pub files: Vec<ChatFile>,
    /// Set for messages authored by bots (including this gateway itself).
    pub from_bot: bool,
}

/// Inbound chat traffic relevant to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Message(InboundMessage),
    /// A message was edited; `ts` identifies the original message.
    MessageChanged {
        channel: String,
        ts: String,
        new_text: String,
    },
    MessageDeleted {
        channel: String,
        deleted_ts: String,
    },
}
