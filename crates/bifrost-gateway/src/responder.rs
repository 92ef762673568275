// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Response pipeline: three delivery strategies behind one trait.
//!
//! * batch — everything at once when the turn completes
//! * stream-update — one message edited in place on a throttle
//! * stream-native — the platform's native streaming message surface
//!
//! A responder holds no reference to the supervisor; the scheduler forwards
//! deltas into it and calls `finish` (or `abort`) exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use bifrost_chat::{ChatClient, ChatError, ChatStreamer};
use bifrost_config::ResponseMode;
use bifrost_markup::{markdown_to_mrkdwn, split_message};

use crate::{FILE_THRESHOLD, MAX_MESSAGE_LENGTH, STREAM_UPDATE_INTERVAL};

/// Suffix shown on a streamed message that had to be truncated mid-turn.
const TRUNCATION_SUFFIX: &str = "\n_[streaming...]_";

/// Indicator appended while a streamed message is still growing.
const WRITING_INDICATOR: &str = " :writing_hand:";

const UPLOAD_FILENAME: &str = "response.md";
const UPLOAD_TITLE: &str = "Response";

const PLACEHOLDER_TEXT: &str = ":thinking_face: _thinking..._";

/// Where a responder delivers: one channel, one thread.
#[derive(Clone)]
pub struct ResponderContext {
    pub client: Arc<dyn ChatClient>,
    pub channel: String,
    pub thread_ts: String,
}

#[async_trait]
pub trait Responder: Send + Sync {
    /// Called once before the agent is dispatched.
    async fn begin(&self) {}

    /// One streamed text chunk, in stdout order.
    async fn on_text_delta(&self, delta: &str);

    /// Deliver the final text.  A failure here means the user got nothing,
    /// so the caller escalates it.
    async fn finish(&self, final_text: &str) -> Result<(), ChatError>;

    /// Best-effort teardown on the error path (stop tickers/streams).
    async fn abort(&self);
}

/// Build the responder for a channel's configured delivery mode.
pub fn make_responder(mode: ResponseMode, ctx: ResponderContext) -> Arc<dyn Responder> {
    match mode {
        ResponseMode::Batch => Arc::new(BatchResponder { ctx }),
        ResponseMode::StreamUpdate => Arc::new(EditThrottledResponder::new(ctx)),
        ResponseMode::StreamNative => Arc::new(NativeStreamResponder::new(ctx)),
    }
}

/// Post `mrkdwn` as one or more threaded chunks, or upload the raw markdown
/// as a file when it is too large for messages at all.
async fn deliver_batch(
    ctx: &ResponderContext,
    raw_text: &str,
    mrkdwn: &str,
) -> Result<(), ChatError> {
    if mrkdwn.len() > FILE_THRESHOLD {
        return ctx
            .client
            .file_upload(
                &ctx.channel,
                Some(&ctx.thread_ts),
                raw_text,
                UPLOAD_FILENAME,
                UPLOAD_TITLE,
            )
            .await;
    }
    for chunk in split_message(mrkdwn, MAX_MESSAGE_LENGTH) {
        ctx.client
            .post_message(&ctx.channel, Some(&ctx.thread_ts), &chunk)
            .await?;
    }
    Ok(())
}

// ── Batch ─────────────────────────────────────────────────────────────────────

struct BatchResponder {
    ctx: ResponderContext,
}

#[async_trait]
impl Responder for BatchResponder {
    async fn on_text_delta(&self, _delta: &str) {
        // Batch mode delivers once, at the end.
    }

    async fn finish(&self, final_text: &str) -> Result<(), ChatError> {
        let mrkdwn = markdown_to_mrkdwn(final_text);
        deliver_batch(&self.ctx, final_text, &mrkdwn).await
    }

    async fn abort(&self) {}
}

// ── Edit-throttled streaming ──────────────────────────────────────────────────

struct StreamState {
    full_text: String,
    message_ts: Option<String>,
    last_flushed: usize,
    finished: bool,
}

struct EditThrottledResponder {
    ctx: ResponderContext,
    state: Arc<Mutex<StreamState>>,
    ticker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EditThrottledResponder {
    fn new(ctx: ResponderContext) -> Self {
        Self {
            ctx,
            state: Arc::new(Mutex::new(StreamState {
                full_text: String::new(),
                message_ts: None,
                last_flushed: 0,
                finished: false,
            })),
            ticker: std::sync::Mutex::new(None),
        }
    }

    /// Translate and shape the streamed text for an in-place edit.
    fn render(text: &str, still_streaming: bool) -> String {
        let mut body = markdown_to_mrkdwn(text);
        if body.len() > MAX_MESSAGE_LENGTH {
            let mut end = MAX_MESSAGE_LENGTH - TRUNCATION_SUFFIX.len() - WRITING_INDICATOR.len();
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
            body.push_str(TRUNCATION_SUFFIX);
        }
        if still_streaming {
            body.push_str(WRITING_INDICATOR);
        }
        body
    }

    fn start_ticker(&self) {
        let mut guard = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }
        let ctx = self.ctx.clone();
        let state = self.state.clone();
        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(STREAM_UPDATE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let mut st = state.lock().await;
                if st.finished {
                    break;
                }
                if st.full_text.len() == st.last_flushed {
                    continue;
                }
                let Some(ts) = st.message_ts.clone() else { continue };
                let body = Self::render(&st.full_text, true);
                st.last_flushed = st.full_text.len();
                // Hold the lock across the update so flushes stay ordered.
                if let Err(e) = ctx.client.update_message(&ctx.channel, &ts, &body).await {
                    debug!("streaming update failed: {e}");
                }
            }
        }));
    }

    fn stop_ticker(&self) {
        if let Some(handle) = self
            .ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

#[async_trait]
impl Responder for EditThrottledResponder {
    async fn on_text_delta(&self, delta: &str) {
        let mut st = self.state.lock().await;
        st.full_text.push_str(delta);
        if st.message_ts.is_none() {
            let body = Self::render(&st.full_text, true);
            match self
                .ctx
                .client
                .post_message(&self.ctx.channel, Some(&self.ctx.thread_ts), &body)
                .await
            {
                Ok(ts) => {
                    st.message_ts = Some(ts);
                    st.last_flushed = st.full_text.len();
                    self.start_ticker();
                }
                Err(e) => warn!("initial streaming post failed: {e}"),
            }
        }
    }

    async fn finish(&self, final_text: &str) -> Result<(), ChatError> {
        self.stop_ticker();
        let mut st = self.state.lock().await;
        st.finished = true;

        let text = if final_text.is_empty() {
            st.full_text.clone()
        } else {
            final_text.to_string()
        };
        let mrkdwn = markdown_to_mrkdwn(&text);

        let Some(ts) = st.message_ts.clone() else {
            // No delta ever arrived; fall back to plain batch delivery.
            return deliver_batch(&self.ctx, &text, &mrkdwn).await;
        };

        // Final flush, without the writing indicator.
        self.ctx
            .client
            .update_message(&self.ctx.channel, &ts, &Self::render(&text, false))
            .await?;

        if mrkdwn.len() > FILE_THRESHOLD {
            // The full text does not fit in messages: replace the streamed
            // message with a file upload.  The delete is cosmetic.
            if let Err(e) = self.ctx.client.delete_message(&self.ctx.channel, &ts).await {
                debug!("could not delete streamed message: {e}");
            }
            self.ctx
                .client
                .file_upload(
                    &self.ctx.channel,
                    Some(&self.ctx.thread_ts),
                    &text,
                    UPLOAD_FILENAME,
                    UPLOAD_TITLE,
                )
                .await?;
        } else if mrkdwn.len() > MAX_MESSAGE_LENGTH {
            let chunks = split_message(&mrkdwn, MAX_MESSAGE_LENGTH);
            let mut iter = chunks.into_iter();
            if let Some(first) = iter.next() {
                self.ctx
                    .client
                    .update_message(&self.ctx.channel, &ts, &first)
                    .await?;
            }
            for chunk in iter {
                self.ctx
                    .client
                    .post_message(&self.ctx.channel, Some(&self.ctx.thread_ts), &chunk)
                    .await?;
            }
        }
        Ok(())
    }

    async fn abort(&self) {
        self.stop_ticker();
        self.state.lock().await.finished = true;
    }
}

// ── Native streaming ──────────────────────────────────────────────────────────

struct NativeState {
    placeholder_ts: Option<String>,
    streamer: Option<Box<dyn ChatStreamer>>,
}

struct NativeStreamResponder {
    ctx: ResponderContext,
    state: Mutex<NativeState>,
}

impl NativeStreamResponder {
    fn new(ctx: ResponderContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(NativeState {
                placeholder_ts: None,
                streamer: None,
            }),
        }
    }

    async fn delete_placeholder(&self, st: &mut NativeState) {
        if let Some(ts) = st.placeholder_ts.take() {
            if let Err(e) = self.ctx.client.delete_message(&self.ctx.channel, &ts).await {
                debug!("could not delete placeholder: {e}");
            }
        }
    }
}

#[async_trait]
impl Responder for NativeStreamResponder {
    async fn begin(&self) {
        // Visible feedback before the agent produces anything.
        match self
            .ctx
            .client
            .post_message(&self.ctx.channel, Some(&self.ctx.thread_ts), PLACEHOLDER_TEXT)
            .await
        {
            Ok(ts) => self.state.lock().await.placeholder_ts = Some(ts),
            Err(e) => warn!("placeholder post failed: {e}"),
        }
    }

    async fn on_text_delta(&self, delta: &str) {
        let mut st = self.state.lock().await;
        if st.streamer.is_none() {
            // Buffer size 1 so the stream surfaces instantly.
            match self
                .ctx
                .client
                .chat_stream(&self.ctx.channel, Some(&self.ctx.thread_ts), 1)
                .await
            {
                Ok(streamer) => {
                    self.delete_placeholder(&mut st).await;
                    st.streamer = Some(streamer);
                }
                Err(e) => {
                    warn!("could not open native stream: {e}");
                    return;
                }
            }
        }
        if let Some(streamer) = st.streamer.as_ref() {
            if let Err(e) = streamer.append(delta).await {
                debug!("stream append failed: {e}");
            }
        }
    }

    async fn finish(&self, final_text: &str) -> Result<(), ChatError> {
        let mut st = self.state.lock().await;
        let mrkdwn = markdown_to_mrkdwn(final_text);

        if let Some(streamer) = st.streamer.take() {
            streamer.stop().await?;
        } else {
            // No delta ever arrived: clean up the placeholder and deliver
            // whatever final text the turn produced as a plain message.
            self.delete_placeholder(&mut st).await;
            if !final_text.is_empty() && mrkdwn.len() <= FILE_THRESHOLD {
                for chunk in split_message(&mrkdwn, MAX_MESSAGE_LENGTH) {
                    self.ctx
                        .client
                        .post_message(&self.ctx.channel, Some(&self.ctx.thread_ts), &chunk)
                        .await?;
                }
            }
        }

        if mrkdwn.len() > FILE_THRESHOLD {
            self.ctx
                .client
                .file_upload(
                    &self.ctx.channel,
                    Some(&self.ctx.thread_ts),
                    final_text,
                    UPLOAD_FILENAME,
                    UPLOAD_TITLE,
                )
                .await?;
        }
        Ok(())
    }

    async fn abort(&self) {
        let mut st = self.state.lock().await;
        if let Some(streamer) = st.streamer.take() {
            if let Err(e) = streamer.stop().await {
                debug!("stream stop failed during abort: {e}");
            }
        }
        self.delete_placeholder(&mut st).await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bifrost_chat::{MockCall, MockChatClient};

    fn ctx(client: &Arc<MockChatClient>) -> ResponderContext {
        ResponderContext {
            client: client.clone() as Arc<dyn ChatClient>,
            channel: "C1".into(),
            thread_ts: "1.0".into(),
        }
    }

    // ── Batch ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn batch_posts_single_translated_message() {
        let client = Arc::new(MockChatClient::new());
        let r = make_responder(ResponseMode::Batch, ctx(&client));
        r.on_text_delta("ignored").await;
        r.finish("**bold** reply").await.unwrap();

        assert_eq!(client.posted_texts(), vec!["*bold* reply"]);
    }

    #[tokio::test]
    async fn batch_splits_long_response_into_chunks() {
        let client = Arc::new(MockChatClient::new());
        let r = make_responder(ResponseMode::Batch, ctx(&client));
        let text = "line\n".repeat(1500); // 7500 chars, under the file limit
        r.finish(&text).await.unwrap();

        let posts = client.posted_texts();
        assert!(posts.len() >= 2);
        for p in &posts {
            assert!(p.len() <= MAX_MESSAGE_LENGTH);
        }
    }

    #[tokio::test]
    async fn batch_uploads_file_when_over_threshold() {
        let client = Arc::new(MockChatClient::new());
        let r = make_responder(ResponseMode::Batch, ctx(&client));
        let text = "x".repeat(FILE_THRESHOLD + 1);
        r.finish(&text).await.unwrap();

        assert!(client.posted_texts().is_empty());
        assert!(matches!(
            client.calls()[0],
            MockCall::FileUpload { ref filename, len, .. }
            if filename == "response.md" && len == FILE_THRESHOLD + 1
        ));
    }

    // ── Edit-throttled ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stream_update_posts_initial_message_on_first_delta() {
        let client = Arc::new(MockChatClient::new());
        let r = make_responder(ResponseMode::StreamUpdate, ctx(&client));
        r.on_text_delta("Hello").await;

        let calls = client.calls();
        assert!(matches!(
            calls[0],
            MockCall::Post { ref text, .. } if text.starts_with("Hello") && text.ends_with(":writing_hand:")
        ));
        r.abort().await;
    }

    #[tokio::test]
    async fn stream_update_finish_flushes_without_indicator() {
        let client = Arc::new(MockChatClient::new());
        let r = make_responder(ResponseMode::StreamUpdate, ctx(&client));
        r.on_text_delta("partial").await;
        r.finish("final answer").await.unwrap();

        let last_update = client
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Update { text, .. } => Some(text),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(last_update, "final answer");
    }

    #[tokio::test]
    async fn stream_update_overflow_deletes_and_uploads() {
        let client = Arc::new(MockChatClient::new());
        let r = make_responder(ResponseMode::StreamUpdate, ctx(&client));
        r.on_text_delta("start").await;
        let big = "y".repeat(FILE_THRESHOLD + 500);
        r.finish(&big).await.unwrap();

        let calls = client.calls();
        assert!(calls.iter().any(|c| matches!(c, MockCall::Delete { .. })));
        assert!(calls
            .iter()
            .any(|c| matches!(c, MockCall::FileUpload { len, .. } if *len == big.len())));
    }

    #[tokio::test]
    async fn stream_update_medium_overflow_chunks_into_followups() {
        let client = Arc::new(MockChatClient::new());
        let r = make_responder(ResponseMode::StreamUpdate, ctx(&client));
        r.on_text_delta("start").await;
        let medium = "line\n".repeat(1200); // 6000 chars: > MAX, < FILE_THRESHOLD
        r.finish(&medium).await.unwrap();

        let calls = client.calls();
        // chunk 1 replaces the streamed message, the rest are follow-ups
        assert!(calls.iter().any(|c| matches!(c, MockCall::Update { .. })));
        let followups = calls
            .iter()
            .filter(|c| matches!(c, MockCall::Post { text, .. } if !text.contains("writing_hand")))
            .count();
        assert!(followups >= 1);
        assert!(!calls.iter().any(|c| matches!(c, MockCall::FileUpload { .. })));
    }

    #[tokio::test]
    async fn stream_update_without_deltas_falls_back_to_batch() {
        let client = Arc::new(MockChatClient::new());
        let r = make_responder(ResponseMode::StreamUpdate, ctx(&client));
        r.finish("straight to the end").await.unwrap();

        assert_eq!(client.posted_texts(), vec!["straight to the end"]);
    }

    // ── Native stream ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn native_posts_placeholder_then_streams() {
        let client = Arc::new(MockChatClient::new());
        let r = make_responder(ResponseMode::StreamNative, ctx(&client));
        r.begin().await;
        r.on_text_delta("Hel").await;
        r.on_text_delta("lo").await;
        r.finish("Hello").await.unwrap();

        let calls = client.calls();
        assert!(matches!(
            calls[0],
            MockCall::Post { ref text, .. } if text.contains("thinking")
        ));
        // Stream opens, placeholder goes away, deltas append, stream stops.
        let idx_start = calls
            .iter()
            .position(|c| matches!(c, MockCall::StreamStart { .. }))
            .unwrap();
        let idx_delete = calls
            .iter()
            .position(|c| matches!(c, MockCall::Delete { .. }))
            .unwrap();
        assert!(idx_start < idx_delete);
        let appended: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                MockCall::StreamAppend { text } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(appended, vec!["Hel", "lo"]);
        assert!(calls.iter().any(|c| matches!(c, MockCall::StreamStop)));
    }

    #[tokio::test]
    async fn native_without_deltas_deletes_placeholder_and_posts_final() {
        let client = Arc::new(MockChatClient::new());
        let r = make_responder(ResponseMode::StreamNative, ctx(&client));
        r.begin().await;
        r.finish("quiet result").await.unwrap();

        let calls = client.calls();
        assert!(calls.iter().any(|c| matches!(c, MockCall::Delete { .. })));
        assert!(client.posted_texts().contains(&"quiet result".to_string()));
        assert!(!calls.iter().any(|c| matches!(c, MockCall::StreamStop)));
    }

    #[tokio::test]
    async fn native_oversize_also_uploads_file() {
        let client = Arc::new(MockChatClient::new());
        let r = make_responder(ResponseMode::StreamNative, ctx(&client));
        r.begin().await;
        r.on_text_delta("chunk").await;
        let big = "z".repeat(FILE_THRESHOLD + 1);
        r.finish(&big).await.unwrap();

        assert!(client
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::FileUpload { .. })));
    }
}
