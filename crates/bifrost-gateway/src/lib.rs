// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Dispatch core of the gateway: inbound events are filtered and persisted,
//! drained per channel under a global concurrency cap, run through the agent
//! supervisor, and delivered back by a response-mode-specific responder.

mod commands;
mod images;
mod responder;
mod scheduler;

pub use commands::{parse_command, MagicCommand};
pub use responder::{make_responder, Responder, ResponderContext};
pub use scheduler::Scheduler;

use std::time::Duration;

/// Longest single chat message the gateway will post.
pub const MAX_MESSAGE_LENGTH: usize = 3900;

/// Responses longer than this (after translation) become file uploads.
pub const FILE_THRESHOLD: usize = 12_000;

/// Largest image attachment the gateway will download.
pub const IMAGE_SIZE_LIMIT: u64 = 5 * 1024 * 1024;

/// Minimum spacing between in-place edits of a streaming message.
pub const STREAM_UPDATE_INTERVAL: Duration = Duration::from_millis(500);

/// Global cap on concurrently running agent processes.
pub const MAX_CONCURRENT_PROCESSES: usize = 8;
