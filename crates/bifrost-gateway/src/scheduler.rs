// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-channel scheduler.
//!
//! Inbound chat events are filtered, persisted to the durable queue, and
//! drained one channel at a time: a channel drains serially (per-channel
//! FIFO by enqueue time) while distinct channels drain concurrently up to a
//! global cap of agent processes.  All registries are logical state guarded
//! by locks; the only cross-task handoff is the busy-set and the semaphore.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use bifrost_agent::{OneshotRequest, PersistentRequest, ProcessSupervisor, SupervisorError};
use bifrost_chat::{ChatClient, ChatEvent, InboundMessage};
use bifrost_config::{Config, ProcessMode, ResolvedChannelConfig, ResponseMode};
use bifrost_queue::{MessageQueue, QueuedMessage};

use crate::commands::{self, CommandContext};
use crate::images;
use crate::responder::{make_responder, ResponderContext};
use crate::MAX_CONCURRENT_PROCESSES;

/// Substitute prompt for image-only messages.
const IMAGE_ONLY_PROMPT: &str = "What is in this image?";

pub struct Scheduler {
    client: Arc<dyn ChatClient>,
    supervisor: Arc<ProcessSupervisor>,
    queue: MessageQueue,
    config_path: PathBuf,
    image_dir: PathBuf,
    /// Channels with a drain task running.
    channel_busy: Mutex<HashSet<String>>,
    /// `(channel, ts)` pairs past the queued stage; edits no longer apply.
    processing: std::sync::Mutex<HashSet<(String, String)>>,
    /// Global agent process cap; waiters resume in FIFO order.
    slots: Arc<Semaphore>,
}

fn lock_processing(
    set: &std::sync::Mutex<HashSet<(String, String)>>,
) -> std::sync::MutexGuard<'_, HashSet<(String, String)>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

impl Scheduler {
    pub fn new(
        client: Arc<dyn ChatClient>,
        supervisor: Arc<ProcessSupervisor>,
        queue: MessageQueue,
        config_path: PathBuf,
        image_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            supervisor,
            queue,
            config_path,
            image_dir,
            channel_busy: Mutex::new(HashSet::new()),
            processing: std::sync::Mutex::new(HashSet::new()),
            slots: Arc::new(Semaphore::new(MAX_CONCURRENT_PROCESSES)),
        })
    }

    /// Consume inbound events until the sender side closes.
    pub async fn run(self: Arc<Self>, mut events_rx: mpsc::Receiver<ChatEvent>) {
        // Anything left over from a previous run is picked up immediately.
        self.resume_pending().await;
        while let Some(event) = events_rx.recv().await {
            self.handle_event(event).await;
        }
        info!("scheduler stopped: ingress closed");
    }

    /// Relaunch drains for channels that still have persisted messages
    /// (crash/restart recovery — the queue is durable, the busy set is not).
    async fn resume_pending(self: &Arc<Self>) {
        let pending = self.queue.get_pending().await;
        let channels: HashSet<String> = pending.into_iter().map(|m| m.channel_id).collect();
        for channel in channels {
            info!(channel = %channel, "resuming pending queue");
            self.launch_drain_if_idle(channel).await;
        }
    }

    pub async fn handle_event(self: &Arc<Self>, event: ChatEvent) {
        match event {
            ChatEvent::MessageDeleted {
                channel,
                deleted_ts,
            } => {
                // A queued message vanishes with its chat message; one that
                // is already processing is out of reach (that's `!kill`).
                if self.queue.dequeue(&channel, &deleted_ts).await {
                    debug!(channel = %channel, ts = %deleted_ts, "queued message deleted");
                }
            }
            ChatEvent::MessageChanged {
                channel,
                ts,
                new_text,
            } => {
                let in_flight =
                    lock_processing(&self.processing).contains(&(channel.clone(), ts.clone()));
                if !in_flight && self.queue.update_queued_text(&channel, &ts, &new_text).await {
                    debug!(channel = %channel, ts = %ts, "queued message edited");
                }
            }
            ChatEvent::Message(msg) => self.handle_message(msg).await,
        }
    }

    async fn handle_message(self: &Arc<Self>, msg: InboundMessage) {
        if msg.from_bot {
            return;
        }
        let text = msg.text.trim().to_string();

        // Magic commands bypass the queue entirely.
        if let Some(cmd) = commands::parse_command(&text) {
            let config = match bifrost_config::load(&self.config_path) {
                Ok(c) => c,
                Err(e) => {
                    warn!("config load failed for command: {e:#}");
                    return;
                }
            };
            let thread = msg.thread_ts.clone().unwrap_or_else(|| msg.ts.clone());
            commands::handle_command(
                cmd,
                CommandContext {
                    client: &*self.client,
                    supervisor: &*self.supervisor,
                    queue: &self.queue,
                    config: &config,
                    origin_channel: &msg.channel,
                    origin_thread: &thread,
                },
            )
            .await;
            return;
        }

        // Only routed channels are listened to.
        let Some(_cfg) = self.resolve_channel(&msg.channel) else {
            return;
        };

        let eligible = images::eligible_images(&msg.files);
        if text.is_empty() && eligible.is_empty() {
            return;
        }
        let image_paths = images::download_images(&*self.client, &msg.files, &self.image_dir).await;
        let text = if text.is_empty() {
            IMAGE_ONLY_PROMPT.to_string()
        } else {
            text
        };

        let queued = QueuedMessage {
            channel_id: msg.channel.clone(),
            user_id: msg.user.clone(),
            text,
            ts: msg.ts.clone(),
            thread_ts: msg.thread_ts.clone().unwrap_or_else(|| msg.ts.clone()),
            queued_at: Utc::now(),
            image_paths,
        };
        if let Err(e) = self.queue.enqueue(&queued).await {
            error!("enqueue failed: {e:#}");
            let _ = self
                .client
                .post_message(
                    &msg.channel,
                    Some(&queued.thread_ts),
                    &format!(":warning: Error: could not queue message: {e}"),
                )
                .await;
            return;
        }
        if let Err(e) = self
            .client
            .reaction_add(&msg.channel, &msg.ts, "inbox_tray")
            .await
        {
            debug!("inbox reaction failed: {e}");
        }

        self.launch_drain_if_idle(msg.channel).await;
    }

    async fn launch_drain_if_idle(self: &Arc<Self>, channel: String) {
        {
            let mut busy = self.channel_busy.lock().await;
            if busy.contains(&channel) {
                return;
            }
            busy.insert(channel.clone());
        }
        let this = self.clone();
        tokio::spawn(async move { this.drain_channel(channel).await });
    }

    /// Serial worker for one channel: process the queue head until empty.
    async fn drain_channel(self: Arc<Self>, channel: String) {
        loop {
            let pending = self.queue.get_pending_for_channel(&channel).await;
            let Some(msg) = pending.into_iter().next() else {
                let mut busy = self.channel_busy.lock().await;
                // An enqueue may have landed after the read above; re-check
                // under the busy lock so no message is stranded.
                if self.queue.get_pending_for_channel(&channel).await.is_empty() {
                    busy.remove(&channel);
                    return;
                }
                continue;
            };

            lock_processing(&self.processing).insert((channel.clone(), msg.ts.clone()));
            self.process_message(&msg).await;
            self.queue.dequeue(&channel, &msg.ts).await;
            lock_processing(&self.processing).remove(&(channel.clone(), msg.ts.clone()));
            images::cleanup_images(&msg.image_paths).await;
        }
    }

    /// One full turn: reactions, slot, dispatch, delivery, error surfacing.
    async fn process_message(self: &Arc<Self>, msg: &QueuedMessage) {
        self.transition_reaction(msg, "hourglass_flowing_sand", "inbox_tray")
            .await;

        // Global cap: suspends here when eight agents are already running.
        let permit = match self.slots.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return, // semaphore closed: shutting down
        };

        // Config is re-read every message: the agent may have edited it.
        let Some(cfg) = self.resolve_channel(&msg.channel_id) else {
            warn!(channel = %msg.channel_id, "channel no longer configured; dropping message");
            let _ = self
                .client
                .reaction_remove(&msg.channel_id, &msg.ts, "hourglass_flowing_sand")
                .await;
            return;
        };

        let responder = make_responder(
            cfg.response_mode,
            ResponderContext {
                client: self.client.clone(),
                channel: msg.channel_id.clone(),
                thread_ts: msg.thread_ts.clone(),
            },
        );
        responder.begin().await;

        let (delta_tx, mut delta_rx) = mpsc::unbounded_channel::<String>();
        let forwarder = tokio::spawn({
            let responder = responder.clone();
            async move {
                while let Some(delta) = delta_rx.recv().await {
                    responder.on_text_delta(&delta).await;
                }
            }
        });

        let outcome: Result<String, SupervisorError> = match cfg.process_mode {
            ProcessMode::Oneshot => self
                .supervisor
                .run_oneshot(
                    OneshotRequest {
                        channel_id: msg.channel_id.clone(),
                        config: cfg.clone(),
                        prompt: msg.text.clone(),
                        image_paths: msg.image_paths.clone(),
                        streaming: cfg.response_mode != ResponseMode::Batch,
                    },
                    delta_tx,
                )
                .await
                .map(|r| r.text),
            ProcessMode::Persistent => {
                self.supervisor
                    .run_persistent_turn(
                        PersistentRequest {
                            channel_id: msg.channel_id.clone(),
                            config: cfg.clone(),
                            prompt: msg.text.clone(),
                        },
                        delta_tx,
                    )
                    .await
            }
        };
        // The delta sender is dropped once the turn settles; wait for the
        // forwarder so every delta reaches the responder before finish().
        let _ = forwarder.await;

        match outcome {
            Ok(final_text) => match responder.finish(&final_text).await {
                Ok(()) => {
                    self.transition_reaction(msg, "white_check_mark", "hourglass_flowing_sand")
                        .await;
                }
                Err(e) => {
                    self.surface_failure(msg, &format!("delivery failed: {e}"))
                        .await;
                }
            },
            Err(e) => {
                responder.abort().await;
                self.surface_failure(msg, &e.to_string()).await;
            }
        }
        drop(permit);
    }

    /// Add-before-remove so the message never shows a reaction gap.
    async fn transition_reaction(&self, msg: &QueuedMessage, add: &str, remove: &str) {
        if let Err(e) = self.client.reaction_add(&msg.channel_id, &msg.ts, add).await {
            debug!("reaction add failed: {e}");
        }
        if let Err(e) = self
            .client
            .reaction_remove(&msg.channel_id, &msg.ts, remove)
            .await
        {
            debug!("reaction remove failed: {e}");
        }
    }

    /// Failure path: the user must never be left without feedback.
    async fn surface_failure(&self, msg: &QueuedMessage, cause: &str) {
        warn!(channel = %msg.channel_id, "turn failed: {cause}");
        self.transition_reaction(msg, "x", "hourglass_flowing_sand").await;
        if let Err(e) = self
            .client
            .post_message(
                &msg.channel_id,
                Some(&msg.thread_ts),
                &format!(":warning: Error: {cause}"),
            )
            .await
        {
            warn!("failure notice could not be posted: {e}");
        }
    }

    fn resolve_channel(&self, channel_id: &str) -> Option<ResolvedChannelConfig> {
        let config: Config = match bifrost_config::load(&self.config_path) {
            Ok(c) => c,
            Err(e) => {
                warn!("config load failed: {e:#}");
                return None;
            }
        };
        config.resolve_channel(channel_id, &self.config_path)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
