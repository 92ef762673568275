// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Agent-side core of the gateway: parsing the agent's newline-delimited
//! JSON stream, deriving deterministic session identities, and supervising
//! agent child processes in oneshot and persistent modes.

mod events;
mod session;
mod supervisor;

pub use events::{parse_stream_line, AgentResult, StreamEvent};
pub use session::{
    clear_session_artifacts, derive_session_id, session_artifact_paths,
    session_artifact_paths_in, SessionArtifacts, SESSION_NAMESPACE,
};
pub use supervisor::{
    ActiveProcess, OneshotRequest, PersistentRequest, ProcessSupervisor, SupervisorError,
    ABSOLUTE_TIMEOUT,
};
