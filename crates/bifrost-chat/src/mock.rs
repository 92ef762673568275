// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Recording chat client for tests.  Every call is appended to an in-memory
//! log the test can inspect; message timestamps are synthesized from a
//! counter so posted/updated/deleted identities line up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{ChatClient, ChatError, ChatStreamer};

/// One recorded chat client call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Post {
        channel: String,
        thread_ts: Option<String>,
        text: String,
        ts: String,
    },
    Update {
        channel: String,
        ts: String,
        text: String,
    },
    Delete {
        channel: String,
        ts: String,
    },
    ReactionAdd {
        channel: String,
        ts: String,
        name: String,
    },
    ReactionRemove {
        channel: String,
        ts: String,
        name: String,
    },
    FileUpload {
        channel: String,
        thread_ts: Option<String>,
        filename: String,
        title: String,
        len: usize,
    },
    StreamStart {
        channel: String,
        thread_ts: Option<String>,
    },
    StreamAppend {
        text: String,
    },
    StreamStop,
    Download {
        url: String,
    },
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    next_ts: u64,
    fail_posts: bool,
    files: HashMap<String, Vec<u8>>,
}

/// Chat client that records everything and talks to nobody.
#[derive(Default)]
pub struct MockChatClient {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> std::sync::MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded calls in order.
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state).calls.clone()
    }

    /// Texts of all posted messages, in post order.
    pub fn posted_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Post { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Reaction names added, in order.
    pub fn reactions_added(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::ReactionAdd { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Make every subsequent post_message fail (delivery-failure paths).
    pub fn set_fail_posts(&self, fail: bool) {
        lock(&self.state).fail_posts = fail;
    }

    /// Register bytes served for a `download_file` URL.
    pub fn set_file(&self, url: impl Into<String>, bytes: Vec<u8>) {
        lock(&self.state).files.insert(url.into(), bytes);
    }

    fn record(&self, call: MockCall) {
        lock(&self.state).calls.push(call);
    }

    fn mint_ts(&self) -> String {
        let mut st = lock(&self.state);
        st.next_ts += 1;
        format!("100.{:06}", st.next_ts)
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> Result<String, ChatError> {
        if lock(&self.state).fail_posts {
            return Err(ChatError::Api("chat.postMessage: mock_failure".into()));
        }
        let ts = self.mint_ts();
        self.record(MockCall::Post {
            channel: channel.to_string(),
            thread_ts: thread_ts.map(str::to_string),
            text: text.to_string(),
            ts: ts.clone(),
        });
        Ok(ts)
    }

    async fn update_message(&self, channel: &str, ts: &str, text: &str) -> Result<(), ChatError> {
        self.record(MockCall::Update {
            channel: channel.to_string(),
            ts: ts.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete_message(&self, channel: &str, ts: &str) -> Result<(), ChatError> {
        self.record(MockCall::Delete {
            channel: channel.to_string(),
            ts: ts.to_string(),
        });
        Ok(())
    }

    async fn reaction_add(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatError> {
        self.record(MockCall::ReactionAdd {
            channel: channel.to_string(),
            ts: ts.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn reaction_remove(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatError> {
        self.record(MockCall::ReactionRemove {
            channel: channel.to_string(),
            ts: ts.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn file_upload(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        content: &str,
        filename: &str,
        title: &str,
    ) -> Result<(), ChatError> {
        self.record(MockCall::FileUpload {
            channel: channel.to_string(),
            thread_ts: thread_ts.map(str::to_string),
            filename: filename.to_string(),
            title: title.to_string(),
            len: content.len(),
        });
        Ok(())
    }

    async fn chat_stream(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        _buffer_size: u32,
    ) -> Result<Box<dyn ChatStreamer>, ChatError> {
        self.record(MockCall::StreamStart {
            channel: channel.to_string(),
            thread_ts: thread_ts.map(str::to_string),
        });
        Ok(Box::new(MockStreamer {
            state: self.state.clone(),
        }))
    }

    async fn download_file(&self, url: &str) -> Result<Vec<u8>, ChatError> {
        self.record(MockCall::Download {
            url: url.to_string(),
        });
        let st = lock(&self.state);
        match st.files.get(url) {
            Some(bytes) => Ok(bytes.clone()),
            None => Err(ChatError::Api(format!("download: no mock bytes for {url}"))),
        }
    }
}

struct MockStreamer {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl ChatStreamer for MockStreamer {
    async fn append(&self, markdown: &str) -> Result<(), ChatError> {
        lock(&self.state).calls.push(MockCall::StreamAppend {
            text: markdown.to_string(),
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChatError> {
        lock(&self.state).calls.push(MockCall::StreamStop);
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
