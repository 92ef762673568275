// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Magic commands: a handful of `!`-prefixed messages that bypass the queue
//! and drive the supervisor directly.  Everything else in a routed channel
//! is a prompt; these are the operator's escape hatch.

use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use tracing::warn;

use bifrost_agent::ProcessSupervisor;
use bifrost_chat::ChatClient;
use bifrost_config::Config;
use bifrost_queue::MessageQueue;

use crate::MAX_CONCURRENT_PROCESSES;

#[derive(Debug, Clone, PartialEq)]
pub enum MagicCommand {
    /// `!ps` — active process + queue summary.
    Ps,
    /// `!kill` / `!kill <ref>` — SIGTERM the channel's agent.
    Kill(Option<String>),
    /// `!killall` — SIGTERM every agent.
    KillAll,
    /// `!nudge` / `!nudge <ref>` — SIGINT: ask the agent to wrap up.
    Nudge(Option<String>),
}

fn kill_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^!kill\s+(\S+)$").unwrap())
}

fn nudge_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^!nudge\s+(\S+)$").unwrap())
}

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^<#([A-Z0-9]+)(?:\|[^>]*)?>$").unwrap())
}

/// Recognize a magic command.  Only an exact match (after trim) counts —
/// `!ps and more words` is a prompt, not a command.
pub fn parse_command(text: &str) -> Option<MagicCommand> {
    let t = text.trim();
    match t {
        "!ps" => return Some(MagicCommand::Ps),
        "!kill" => return Some(MagicCommand::Kill(None)),
        "!killall" => return Some(MagicCommand::KillAll),
        "!nudge" => return Some(MagicCommand::Nudge(None)),
        _ => {}
    }
    if let Some(c) = kill_re().captures(t) {
        return Some(MagicCommand::Kill(Some(c[1].to_string())));
    }
    if let Some(c) = nudge_re().captures(t) {
        return Some(MagicCommand::Nudge(Some(c[1].to_string())));
    }
    None
}

/// Everything a command handler needs; borrowed from the scheduler.
pub(crate) struct CommandContext<'a> {
    pub client: &'a dyn ChatClient,
    pub supervisor: &'a ProcessSupervisor,
    pub queue: &'a MessageQueue,
    pub config: &'a Config,
    pub origin_channel: &'a str,
    pub origin_thread: &'a str,
}

impl CommandContext<'_> {
    async fn reply(&self, text: &str) {
        if let Err(e) = self
            .client
            .post_message(self.origin_channel, Some(self.origin_thread), text)
            .await
        {
            warn!("command reply failed: {e}");
        }
    }

    fn display_name(&self, channel_id: &str) -> String {
        self.config
            .channels
            .get(channel_id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| channel_id.to_string())
    }

    /// Resolve a `!kill`/`!nudge` target: absent → the origin channel,
    /// otherwise a `<#ID|name>` mention, `#name`, a bare name, or a raw id.
    fn resolve_target(&self, target: Option<&str>) -> Result<String, String> {
        let Some(raw) = target else {
            return Ok(self.origin_channel.to_string());
        };
        if let Some(c) = mention_re().captures(raw) {
            return Ok(c[1].to_string());
        }
        let name = raw.strip_prefix('#').unwrap_or(raw);
        if let Some(id) = self.config.channel_by_name(name) {
            return Ok(id.to_string());
        }
        if self.config.channels.contains_key(raw) {
            return Ok(raw.to_string());
        }
        Err(format!(":warning: Unknown channel `{raw}`"))
    }
}

pub(crate) async fn handle_command(cmd: MagicCommand, ctx: CommandContext<'_>) {
    match cmd {
        MagicCommand::Ps => {
            let report = format_ps(&ctx).await;
            ctx.reply(&report).await;
        }
        MagicCommand::Kill(target) => signal_target(&ctx, target, false).await,
        MagicCommand::Nudge(target) => signal_target(&ctx, target, true).await,
        MagicCommand::KillAll => {
            let killed = ctx.supervisor.kill_all_processes();
            if killed.is_empty() {
                ctx.reply("No active processes to kill.").await;
            } else {
                let names: Vec<String> = killed
                    .iter()
                    .map(|id| format!("#{}", ctx.display_name(id)))
                    .collect();
                ctx.reply(&format!(
                    ":stop_sign: Killed {} process(es): {}",
                    killed.len(),
                    names.join(", ")
                ))
                .await;
            }
        }
    }
}

async fn signal_target(ctx: &CommandContext<'_>, target: Option<String>, nudge: bool) {
    let channel_id = match ctx.resolve_target(target.as_deref()) {
        Ok(id) => id,
        Err(warning) => {
            ctx.reply(&warning).await;
            return;
        }
    };
    let name = ctx.display_name(&channel_id);

    // Snapshot before signalling: the close handler wipes the entry.
    let running_for = ctx
        .supervisor
        .get_active_processes()
        .into_iter()
        .find(|p| p.channel_id == channel_id)
        .map(|p| (Utc::now() - p.started_at).num_seconds().max(0));

    let found = if nudge {
        ctx.supervisor.nudge_process(&channel_id)
    } else {
        ctx.supervisor.kill_process(&channel_id)
    };

    if !found {
        ctx.reply(&format!(":warning: No active process in #{name}"))
            .await;
        return;
    }
    if nudge {
        ctx.reply(&format!(":point_right: Nudged process in #{name}"))
            .await;
    } else {
        let dur = running_for.map(format_duration).unwrap_or_default();
        ctx.reply(&format!(
            ":stop_sign: Killed process in #{name} (was running {dur})"
        ))
        .await;
    }
}

/// `!ps` report: process lines then queued counts.
async fn format_ps(ctx: &CommandContext<'_>) -> String {
    let processes = ctx.supervisor.get_active_processes();
    let mut out = format!(
        "*Processes ({}/{}):*",
        processes.len(),
        MAX_CONCURRENT_PROCESSES
    );
    if processes.is_empty() {
        out.push_str("\n_(none)_");
    }
    for p in &processes {
        let name = ctx.display_name(&p.channel_id);
        let dur = format_duration((Utc::now() - p.started_at).num_seconds().max(0));
        let turns = if p.message_count == 1 { "turn" } else { "turns" };
        // Token totals are only known after a result event; fall back to the
        // cost figure for runs that have not produced one yet.
        let usage = if p.total_tokens > 0 {
            format!("{} tokens", p.total_tokens)
        } else {
            format!("${:.4}", p.total_cost)
        };
        let activity = if p.is_active {
            ":hourglass_flowing_sand:".to_string()
        } else {
            "(idle)".to_string()
        };
        out.push_str(&format!(
            "\n\u{2022} #{name} \u{2014} {dur} \u{2014} {} {turns} \u{2014} {usage} {activity}",
            p.message_count
        ));
    }

    let pending = ctx.queue.get_pending().await;
    if !pending.is_empty() {
        out.push_str("\n*Queued:*");
        let mut counts: Vec<(String, usize)> = Vec::new();
        for m in &pending {
            match counts.iter_mut().find(|(c, _)| *c == m.channel_id) {
                Some((_, n)) => *n += 1,
                None => counts.push((m.channel_id.clone(), 1)),
            }
        }
        for (channel, n) in counts {
            out.push_str(&format!("\n\u{2022} #{}: {n}", ctx.display_name(&channel)));
        }
    }
    out
}

/// `1h 2m 3s` / `1m 42s` / `42s`.
fn format_duration(secs: i64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Parsing ───────────────────────────────────────────────────────────────

    #[test]
    fn exact_commands_parse() {
        assert_eq!(parse_command("!ps"), Some(MagicCommand::Ps));
        assert_eq!(parse_command("!kill"), Some(MagicCommand::Kill(None)));
        assert_eq!(parse_command("!killall"), Some(MagicCommand::KillAll));
        assert_eq!(parse_command("!nudge"), Some(MagicCommand::Nudge(None)));
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        assert_eq!(parse_command("  !ps  "), Some(MagicCommand::Ps));
    }

    #[test]
    fn kill_and_nudge_take_a_channel_ref() {
        assert_eq!(
            parse_command("!kill #project-two"),
            Some(MagicCommand::Kill(Some("#project-two".into())))
        );
        assert_eq!(
            parse_command("!nudge <#C002|project-two>"),
            Some(MagicCommand::Nudge(Some("<#C002|project-two>".into())))
        );
    }

    #[test]
    fn prompts_are_not_commands() {
        assert_eq!(parse_command("!ps and then some"), None);
        assert_eq!(parse_command("please !kill this"), None);
        assert_eq!(parse_command("!pstest"), None);
        assert_eq!(parse_command("ordinary prompt"), None);
    }

    // ── Duration formatting ───────────────────────────────────────────────────

    #[test]
    fn duration_formats_by_magnitude() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(102), "1m 42s");
        assert_eq!(format_duration(3723), "1h 2m 3s");
        assert_eq!(format_duration(0), "0s");
    }

    // ── Target resolution ─────────────────────────────────────────────────────

    fn sample_config() -> Config {
        serde_yaml::from_str(
            r#"
channels:
  C001:
    name: project-one
    folder: /one
  C002:
    name: project-two
    folder: /two
"#,
        )
        .unwrap()
    }

    fn ctx<'a>(
        client: &'a bifrost_chat::MockChatClient,
        supervisor: &'a ProcessSupervisor,
        queue: &'a MessageQueue,
        config: &'a Config,
    ) -> CommandContext<'a> {
        CommandContext {
            client,
            supervisor,
            queue,
            config,
            origin_channel: "C001",
            origin_thread: "1.0",
        }
    }

    #[test]
    fn resolve_target_variants() {
        let client = bifrost_chat::MockChatClient::new();
        let supervisor = ProcessSupervisor::new();
        let dir = tempfile::tempdir().unwrap();
        let queue = MessageQueue::new(dir.path()).unwrap();
        let config = sample_config();
        let ctx = ctx(&client, &supervisor, &queue, &config);

        assert_eq!(ctx.resolve_target(None).unwrap(), "C001");
        assert_eq!(ctx.resolve_target(Some("project-two")).unwrap(), "C002");
        assert_eq!(ctx.resolve_target(Some("#project-two")).unwrap(), "C002");
        assert_eq!(
            ctx.resolve_target(Some("<#C002|project-two>")).unwrap(),
            "C002"
        );
        assert_eq!(ctx.resolve_target(Some("C002")).unwrap(), "C002");
        assert!(ctx.resolve_target(Some("nope")).is_err());
    }

    // ── End-to-end command handling against empty registries ─────────────────

    #[tokio::test]
    async fn kill_with_no_process_posts_warning() {
        let client = bifrost_chat::MockChatClient::new();
        let supervisor = ProcessSupervisor::new();
        let dir = tempfile::tempdir().unwrap();
        let queue = MessageQueue::new(dir.path()).unwrap();
        let config = sample_config();

        handle_command(
            MagicCommand::Kill(Some("#project-two".into())),
            ctx(&client, &supervisor, &queue, &config),
        )
        .await;

        let posts = client.posted_texts();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].contains(":warning:"));
        assert!(posts[0].contains("project-two"));
    }

    #[tokio::test]
    async fn kill_with_unknown_ref_posts_warning_without_acting() {
        let client = bifrost_chat::MockChatClient::new();
        let supervisor = ProcessSupervisor::new();
        let dir = tempfile::tempdir().unwrap();
        let queue = MessageQueue::new(dir.path()).unwrap();
        let config = sample_config();

        handle_command(
            MagicCommand::Kill(Some("mystery".into())),
            ctx(&client, &supervisor, &queue, &config),
        )
        .await;

        let posts = client.posted_texts();
        assert!(posts[0].contains("Unknown channel"));
    }

    #[tokio::test]
    async fn ps_reports_empty_registry_and_queue_counts() {
        let client = bifrost_chat::MockChatClient::new();
        let supervisor = ProcessSupervisor::new();
        let dir = tempfile::tempdir().unwrap();
        let queue = MessageQueue::new(dir.path()).unwrap();
        let config = sample_config();

        queue
            .enqueue(&bifrost_queue::QueuedMessage {
                channel_id: "C002".into(),
                user_id: "U1".into(),
                text: "pending".into(),
                ts: "5.0".into(),
                thread_ts: "5.0".into(),
                queued_at: Utc::now(),
                image_paths: vec![],
            })
            .await
            .unwrap();

        handle_command(MagicCommand::Ps, ctx(&client, &supervisor, &queue, &config)).await;

        let posts = client.posted_texts();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].contains("*Processes (0/8):*"), "{}", posts[0]);
        assert!(posts[0].contains("#project-two: 1"), "{}", posts[0]);
    }

    #[tokio::test]
    async fn killall_with_nothing_running_reports_so() {
        let client = bifrost_chat::MockChatClient::new();
        let supervisor = ProcessSupervisor::new();
        let dir = tempfile::tempdir().unwrap();
        let queue = MessageQueue::new(dir.path()).unwrap();
        let config = sample_config();

        handle_command(MagicCommand::KillAll, ctx(&client, &supervisor, &queue, &config)).await;
        assert_eq!(client.posted_texts(), vec!["No active processes to kill."]);
    }
}
