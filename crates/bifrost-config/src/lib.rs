// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod schema;

pub use loader::{find_config_path, load, save_atomic};
pub use schema::{
    ChannelConfig, Config, Defaults, ProcessMode, ResolvedChannelConfig, ResponseMode, SlackAuth,
};
