// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

/// Fixed namespace for session identity (`6ba7b810-9dad-11d1-80b4-00c04fd430c8`).
/// Changing this would orphan every user's on-disk agent session, so it is
/// deliberately not configurable.
pub const SESSION_NAMESPACE: Uuid = Uuid::from_u128(0x6ba7b810_9dad_11d1_80b4_00c04fd430c8);

/// Deterministic session id for a `(channel, folder)` binding.
///
/// UUIDv5 over `"<channelId>:<folder>"`: the same channel bound to the same
/// folder yields the same id on every run and every host, which is what lets
/// the agent resume its on-disk session across gateway restarts.
pub fn derive_session_id(channel_id: &str, folder: &str) -> Uuid {
    Uuid::new_v5(
        &SESSION_NAMESPACE,
        format!("{channel_id}:{folder}").as_bytes(),
    )
}

/// The agent's on-disk state for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionArtifacts {
    /// Conversation log; its existence decides `--resume` vs `--session-id`.
    pub log_file: PathBuf,
    pub working_dir: PathBuf,
    pub todo_file: PathBuf,
}

/// Artifact paths under the real home directory.
pub fn session_artifact_paths(session_id: &Uuid, folder: &str) -> SessionArtifacts {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
    session_artifact_paths_in(&home, session_id, folder)
}

/// Artifact paths under an explicit home directory (tests, custom homes).
pub fn session_artifact_paths_in(home: &Path, session_id: &Uuid, folder: &str) -> SessionArtifacts {
    let encoded = encode_folder(folder);
    let project_dir = home.join(".claude").join("projects").join(&encoded);
    SessionArtifacts {
        log_file: project_dir.join(format!("{session_id}.jsonl")),
        working_dir: project_dir.join(session_id.to_string()),
        todo_file: home
            .join(".claude")
            .join("todos")
            .join(format!("{session_id}-agent-{session_id}.json")),
    }
}

/// The agent's project-directory naming scheme: every path separator becomes
/// a dash, so an absolute folder gets a leading dash.  Must match the agent
/// exactly or resume and artifact clearing silently miss.
fn encode_folder(folder: &str) -> String {
    folder.replace(['/', '\\'], "-")
}

/// Remove all three artifacts for a session.
///
/// Used to recover from "session already in use" spawn failures; missing or
/// locked paths are ignored because a partial clear is still a valid state
/// for a fresh `--session-id` run.
pub async fn clear_session_artifacts(home: &Path, session_id: &Uuid, folder: &str) {
    let artifacts = session_artifact_paths_in(home, session_id, folder);
    debug!(session = %session_id, "clearing session artifacts");
    let _ = tokio::fs::remove_file(&artifacts.log_file).await;
    let _ = tokio::fs::remove_dir_all(&artifacts.working_dir).await;
    let _ = tokio::fs::remove_file(&artifacts.todo_file).await;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Identity ──────────────────────────────────────────────────────────────

    #[test]
    fn namespace_constant_is_the_documented_literal() {
        assert_eq!(
            SESSION_NAMESPACE.to_string(),
            "6ba7b810-9dad-11d1-80b4-00c04fd430c8"
        );
    }

    #[test]
    fn session_id_matches_known_derivation() {
        // Pinned vector: changing the namespace or the name format breaks
        // resume for every deployed binding.
        let id = derive_session_id("C0AHAGEQY8Y", "/Users/tamas/dev/ktamas77/claudeway");
        assert_eq!(id.to_string(), "808dcec8-994d-5b57-8aa6-c6beeaf1fd39");
    }

    #[test]
    fn session_id_is_stable_across_calls() {
        let a = derive_session_id("C1", "/p");
        let b = derive_session_id("C1", "/p");
        assert_eq!(a, b);
    }

    #[test]
    fn different_channel_or_folder_changes_id() {
        let base = derive_session_id("C1", "/p");
        assert_ne!(base, derive_session_id("C2", "/p"));
        assert_ne!(base, derive_session_id("C1", "/q"));
    }

    // ── Folder encoding ───────────────────────────────────────────────────────

    #[test]
    fn absolute_folder_gets_leading_dash() {
        assert_eq!(encode_folder("/srv/proj"), "-srv-proj");
    }

    #[test]
    fn every_separator_is_replaced() {
        assert_eq!(encode_folder("/a/b/c"), "-a-b-c");
    }

    // ── Artifact paths ────────────────────────────────────────────────────────

    #[test]
    fn artifact_paths_follow_agent_layout() {
        let id = derive_session_id("C1", "/srv/proj");
        let a = session_artifact_paths_in(Path::new("/home/u"), &id, "/srv/proj");
        assert_eq!(
            a.log_file,
            PathBuf::from(format!("/home/u/.claude/projects/-srv-proj/{id}.jsonl"))
        );
        assert_eq!(
            a.working_dir,
            PathBuf::from(format!("/home/u/.claude/projects/-srv-proj/{id}"))
        );
        assert_eq!(
            a.todo_file,
            PathBuf::from(format!("/home/u/.claude/todos/{id}-agent-{id}.json"))
        );
    }

    #[test]
    fn default_home_wrapper_matches_explicit_home() {
        let id = derive_session_id("C1", "/srv/proj");
        let got = session_artifact_paths(&id, "/srv/proj");
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        assert_eq!(got, session_artifact_paths_in(&home, &id, "/srv/proj"));
    }

    // ── Clearing ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn clear_removes_existing_artifacts() {
        let home = tempfile::tempdir().unwrap();
        let id = derive_session_id("C1", "/p");
        let a = session_artifact_paths_in(home.path(), &id, "/p");

        std::fs::create_dir_all(a.log_file.parent().unwrap()).unwrap();
        std::fs::create_dir_all(&a.working_dir).unwrap();
        std::fs::create_dir_all(a.todo_file.parent().unwrap()).unwrap();
        std::fs::write(&a.log_file, "{}").unwrap();
        std::fs::write(a.working_dir.join("scratch"), "x").unwrap();
        std::fs::write(&a.todo_file, "[]").unwrap();

        clear_session_artifacts(home.path(), &id, "/p").await;

        assert!(!a.log_file.exists());
        assert!(!a.working_dir.exists());
        assert!(!a.todo_file.exists());
    }

    #[tokio::test]
    async fn clear_is_idempotent_on_missing_artifacts() {
        let home = tempfile::tempdir().unwrap();
        let id = derive_session_id("C1", "/p");
        // Nothing exists; must not error or panic.
        clear_session_artifacts(home.path(), &id, "/p").await;
        clear_session_artifacts(home.path(), &id, "/p").await;
    }
}
