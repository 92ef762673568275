// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Image attachment intake: authenticated download into a shared temp
//! directory, namespaced by the platform's unique file id so two users
//! uploading `screenshot.png` never collide.

use std::path::{Path, PathBuf};

use tracing::warn;

use bifrost_chat::{ChatClient, ChatFile};

use crate::IMAGE_SIZE_LIMIT;

const SUPPORTED_MIMETYPES: [&str; 4] =
    ["image/png", "image/jpeg", "image/gif", "image/webp"];

pub fn is_supported_image(mimetype: &str) -> bool {
    SUPPORTED_MIMETYPES.contains(&mimetype)
}

/// Files the gateway is willing to download: supported format, within the
/// size limit, and actually downloadable.
pub fn eligible_images(files: &[ChatFile]) -> Vec<&ChatFile> {
    files
        .iter()
        .filter(|f| {
            is_supported_image(&f.mimetype)
                && f.size <= IMAGE_SIZE_LIMIT
                && f.url_private_download.is_some()
        })
        .collect()
}

/// Download eligible attachments into `dir`, returning the local paths in
/// attachment order.  Individual failures are logged and skipped — a missing
/// image degrades the prompt, it does not fail the message.
pub async fn download_images(
    client: &dyn ChatClient,
    files: &[ChatFile],
    dir: &Path,
) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        warn!(dir = %dir.display(), "cannot create image directory: {e}");
        return paths;
    }
    for file in eligible_images(files) {
        let Some(url) = file.url_private_download.as_deref() else {
            continue;
        };
        let bytes = match client.download_file(url).await {
            Ok(b) => b,
            Err(e) => {
                warn!(file = %file.id, "image download failed: {e}");
                continue;
            }
        };
        let path = dir.join(format!("{}_{}", file.id, sanitize_filename(&file.name)));
        match tokio::fs::write(&path, &bytes).await {
            Ok(()) => paths.push(path),
            Err(e) => warn!(path = %path.display(), "cannot write image: {e}"),
        }
    }
    paths
}

/// Remove downloaded temp files after the turn, success or error.
pub async fn cleanup_images(paths: &[PathBuf]) {
    for path in paths {
        let _ = tokio::fs::remove_file(path).await;
    }
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
