// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Locate the config file when no explicit `--config` path was given:
/// `config.yaml` is preferred over `config.json`, both relative to `dir`.
pub fn find_config_path(dir: &Path) -> Option<PathBuf> {
    for name in ["config.yaml", "config.yml", "config.json"] {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Load a config file, choosing the parser by extension.
///
/// This is called once at startup and then again for every dispatched
/// message: the agent can edit the file through its own filesystem tools, so
/// the gateway must observe such edits on the next turn.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    debug!(path = %path.display(), "loading config");
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse(path, &text)
}

fn parse(path: &Path, text: &str) -> anyhow::Result<Config> {
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    if is_json {
        serde_json::from_str(text).with_context(|| format!("parsing {}", path.display()))
    } else {
        serde_yaml::from_str(text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Save the config atomically: serialize to `<path>.tmp`, parse the temp
/// file back as a validity check, then rename over the original.  A crash at
/// any point leaves either the old file or the new file, never a torn one.
pub fn save_atomic(config: &Config, path: &Path) -> anyhow::Result<()> {
    let tmp = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.tmp"),
        None => "tmp".to_string(),
    });

    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    let body = if is_json {
        serde_json::to_string_pretty(config).context("serializing config")?
    } else {
        serde_yaml::to_string(config).context("serializing config")?
    };

    std::fs::write(&tmp, &body).with_context(|| format!("writing {}", tmp.display()))?;

    // Validate the bytes we actually wrote before they replace the original.
    let written = std::fs::read_to_string(&tmp)
        .with_context(|| format!("re-reading {}", tmp.display()))?;
    parse(path, &written).context("validating saved config")?;

    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} over {}", tmp.display(), path.display()))?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
