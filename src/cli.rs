// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "bifrost",
    version,
    about = "Single-tenant Slack gateway for a locally installed AI coding agent",
    long_about = "Bridges Slack channels to a local AI coding agent: each routed channel \
                  binds to a working directory, inbound messages become agent prompts, and \
                  the agent's output streams back into the originating thread."
)]
pub struct Cli {
    /// Path to config.yaml / config.json (default: search the working directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway daemon (the default when no subcommand is given)
    Start,
    /// Print the parsed configuration as YAML and exit
    ShowConfig,
    /// Check that the configuration parses and summarize the routing table
    ValidateConfig,
}
