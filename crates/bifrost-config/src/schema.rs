// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Hard fallbacks used when neither the channel nor the workspace defaults
/// provide a value.
const FALLBACK_MODEL: &str = "sonnet";
const FALLBACK_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Inbound routing table: Slack channel id → channel settings.
    /// A message in a channel that is not listed here is ignored.
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
    /// Fallback values applied to every channel that does not override them.
    #[serde(default)]
    pub defaults: Defaults,
    /// Optional channel for startup/shutdown notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_channel: Option<String>,
    /// Slack credentials.  Environment variables take over when unset.
    #[serde(default)]
    pub slack: SlackAuth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    /// Display label, also how `!kill <ref>` targets this channel.
    pub name: String,
    /// Agent working directory for this channel.
    pub folder: String,
    /// Model selector passed to the agent (`--model`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Extra system prompt appended to the agent's own.  The literal token
    /// `CONFIG_PATH` expands to the absolute config file path, which lets the
    /// prompt teach the agent where to edit its own configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Idle timeout in milliseconds: the agent is terminated after this long
    /// with no output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mode: Option<ResponseMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_mode: Option<ProcessMode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Defaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mode: Option<ResponseMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_mode: Option<ProcessMode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackAuth {
    /// Bot User OAuth token (`xoxb-…`).  Falls back to `SLACK_BOT_TOKEN`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    /// App-level token (`xapp-…`) for Socket Mode.  Falls back to
    /// `SLACK_APP_TOKEN`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_token: Option<String>,
}

impl SlackAuth {
    pub fn resolve_bot_token(&self) -> Option<String> {
        self.bot_token
            .clone()
            .or_else(|| std::env::var("SLACK_BOT_TOKEN").ok())
    }

    pub fn resolve_app_token(&self) -> Option<String> {
        self.app_token
            .clone()
            .or_else(|| std::env::var("SLACK_APP_TOKEN").ok())
    }
}

/// How agent output is delivered back into the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseMode {
    /// One (or a few chunked) messages after the turn completes.
    Batch,
    /// A single message edited in place on a throttle while text streams.
    StreamUpdate,
    /// The platform's native streaming message surface.
    StreamNative,
}

impl std::fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseMode::Batch => write!(f, "batch"),
            ResponseMode::StreamUpdate => write!(f, "stream-update"),
            ResponseMode::StreamNative => write!(f, "stream-native"),
        }
    }
}

/// Whether each message spawns a fresh agent or feeds a long-lived one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessMode {
    Oneshot,
    Persistent,
}

impl std::fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessMode::Oneshot => write!(f, "oneshot"),
            ProcessMode::Persistent => write!(f, "persistent"),
        }
    }
}

/// Effective runtime parameters for one channel: overrides overlaid on
/// defaults overlaid on hard fallbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedChannelConfig {
    pub channel_id: String,
    pub name: String,
    pub folder: String,
    pub model: String,
    pub system_prompt: String,
    pub timeout_ms: u64,
    pub response_mode: ResponseMode,
    pub process_mode: ProcessMode,
}

impl Config {
    /// Resolve the effective settings for `channel_id`, or `None` when the
    /// channel is not routed.  `config_path` feeds the `CONFIG_PATH` token
    /// expansion in the system prompt.
    pub fn resolve_channel(
        &self,
        channel_id: &str,
        config_path: &Path,
    ) -> Option<ResolvedChannelConfig> {
        let ch = self.channels.get(channel_id)?;
        let d = &self.defaults;

        let system_prompt = ch
            .system_prompt
            .clone()
            .or_else(|| d.system_prompt.clone())
            .unwrap_or_default()
            .replace("CONFIG_PATH", &config_path.display().to_string());

        Some(ResolvedChannelConfig {
            channel_id: channel_id.to_string(),
            name: ch.name.clone(),
            folder: ch.folder.clone(),
            model: ch
                .model
                .clone()
                .or_else(|| d.model.clone())
                .unwrap_or_else(|| FALLBACK_MODEL.to_string()),
            system_prompt,
            timeout_ms: ch.timeout_ms.or(d.timeout_ms).unwrap_or(FALLBACK_TIMEOUT_MS),
            response_mode: ch
                .response_mode
                .or(d.response_mode)
                .unwrap_or(ResponseMode::Batch),
            process_mode: ch
                .process_mode
                .or(d.process_mode)
                .unwrap_or(ProcessMode::Oneshot),
        })
    }

    /// Find a channel id by its configured display name.
    pub fn channel_by_name(&self, name: &str) -> Option<&str> {
        self.channels
            .iter()
            .find(|(_, c)| c.name == name)
            .map(|(id, _)| id.as_str())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
