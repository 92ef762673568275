// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end gateway tests: ingress event → durable queue → drain →
//! fake agent process → responder delivery, with a recording chat client.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use bifrost_agent::ProcessSupervisor;
use bifrost_chat::{ChatEvent, InboundMessage, MockCall, MockChatClient};
use bifrost_gateway::Scheduler;
use bifrost_queue::MessageQueue;

struct Gateway {
    _dir: tempfile::TempDir,
    client: Arc<MockChatClient>,
    scheduler: Arc<Scheduler>,
    queue: MessageQueue,
}

/// Build a gateway whose agent is a shell script and whose chat client
/// records everything.
fn gateway(agent_body: &str, channel_yaml_extra: &str) -> Gateway {
    let dir = tempfile::tempdir().unwrap();

    let script = dir.path().join("fake-agent.sh");
    std::fs::write(&script, format!("#!/usr/bin/env bash\n{agent_body}")).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config_path = dir.path().join("config.yaml");
    std::fs::write(
        &config_path,
        format!(
            "channels:\n  C001:\n    name: project-one\n    folder: {}\n{channel_yaml_extra}",
            dir.path().display()
        ),
    )
    .unwrap();

    let client = Arc::new(MockChatClient::new());
    let queue = MessageQueue::new(dir.path().join("queue")).unwrap();
    let scheduler = Scheduler::new(
        client.clone(),
        ProcessSupervisor::with_options(
            script.display().to_string(),
            Some(dir.path().to_path_buf()),
        ),
        queue.clone(),
        config_path,
        dir.path().join("images"),
    );
    Gateway {
        _dir: dir,
        client,
        scheduler,
        queue,
    }
}

fn user_message(ts: &str, text: &str) -> ChatEvent {
    ChatEvent::Message(InboundMessage {
        channel: "C001".into(),
        user: "U1".into(),
        text: text.into(),
        ts: ts.into(),
        thread_ts: None,
        files: vec![],
        from_bot: false,
    })
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

async fn wait_for_empty_queue(queue: &MessageQueue) {
    for _ in 0..500 {
        if queue.get_pending().await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue did not drain within 5s");
}

#[tokio::test]
async fn batch_happy_path_delivers_and_cleans_up() {
    // Batch mode runs the agent with --output-format json: one document.
    let gw = gateway(
        "printf '%s' '{\"type\":\"result\",\"result\":\"hi\",\"session_id\":\"s\",\"cost_usd\":0.01}'\n",
        "",
    );

    gw.scheduler.handle_event(user_message("10.0", "hello")).await;
    wait_for_empty_queue(&gw.queue).await;
    let client = gw.client.clone();
    wait_until(move || client.posted_texts().iter().any(|t| t == "hi")).await;

    assert_eq!(
        gw.client.reactions_added(),
        vec!["inbox_tray", "hourglass_flowing_sand", "white_check_mark"]
    );
    // All reactions that were added before the final one got removed again.
    let removed: Vec<String> = gw
        .client
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            MockCall::ReactionRemove { name, .. } => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(removed, vec!["inbox_tray", "hourglass_flowing_sand"]);
    assert_eq!(gw.client.posted_texts(), vec!["hi"]);
}

#[tokio::test]
async fn two_messages_in_one_channel_run_serially_in_order() {
    // Each run appends its prompt (the last argv entry) to a log file.
    let gw = gateway(
        "echo \"${@: -1}\" >> run-order.log\nprintf '%s' '{\"type\":\"result\",\"result\":\"ok\"}'\n",
        "",
    );

    gw.scheduler.handle_event(user_message("10.0", "first")).await;
    gw.scheduler.handle_event(user_message("11.0", "second")).await;
    wait_for_empty_queue(&gw.queue).await;
    let client = gw.client.clone();
    wait_until(move || client.posted_texts().len() >= 2).await;

    let log = std::fs::read_to_string(gw._dir.path().join("run-order.log")).unwrap();
    let prompts: Vec<&str> = log.lines().collect();
    assert_eq!(prompts, vec!["first", "second"], "per-channel FIFO");
}

#[tokio::test]
async fn stream_update_mode_streams_then_finalizes() {
    let delta = r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"partial"}}}"#;
    let result = r#"{"type":"result","result":"final text","cost_usd":0.01}"#;
    let gw = gateway(
        &format!("printf '%s\\n' '{delta}'\nsleep 0.1\nprintf '%s\\n' '{result}'\n"),
        "    responseMode: stream-update\n",
    );

    gw.scheduler.handle_event(user_message("10.0", "go")).await;
    wait_for_empty_queue(&gw.queue).await;
    let client = gw.client.clone();
    wait_until(move || {
        client
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::Update { text, .. } if text == "final text"))
    })
    .await;

    // The first visible message is the streamed partial, not the final text.
    let first_post = gw.client.posted_texts().into_iter().next().unwrap();
    assert!(first_post.starts_with("partial"), "{first_post}");
    assert!(gw
        .client
        .reactions_added()
        .contains(&"white_check_mark".to_string()));
}

#[tokio::test]
async fn kill_command_from_another_channel_stops_the_run() {
    // The agent hangs; a !kill referencing the busy channel terminates it
    // and the user in that channel gets the failure notice.
    let gw = gateway("exec sleep 30\n", "");

    gw.scheduler.handle_event(user_message("10.0", "hang")).await;
    // Wait until the run is registered (past the semaphore).
    let client = gw.client.clone();
    wait_until(move || {
        client
            .reactions_added()
            .contains(&"hourglass_flowing_sand".to_string())
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    gw.scheduler
        .handle_event(ChatEvent::Message(InboundMessage {
            channel: "C900".into(), // unrouted channel still may issue commands
            user: "U2".into(),
            text: "!kill #project-one".into(),
            ts: "50.0".into(),
            thread_ts: None,
            files: vec![],
            from_bot: false,
        }))
        .await;

    wait_for_empty_queue(&gw.queue).await;
    let client = gw.client.clone();
    wait_until(move || client.posted_texts().iter().any(|t| t.contains(":warning: Error:"))).await;

    let posts = gw.client.posted_texts();
    assert!(
        posts.iter().any(|t| t.contains(":stop_sign: Killed process in #project-one")),
        "{posts:?}"
    );
    assert!(gw.client.reactions_added().contains(&"x".to_string()));
}

#[tokio::test]
async fn queued_edit_before_processing_reaches_the_agent() {
    // First message hangs until killed; the second is edited while queued,
    // and the agent must receive the edited text.
    let gw = gateway(
        "last=\"${@: -1}\"\nif [ \"$last\" = hang ]; then exec sleep 30; fi\necho \"$last\" >> prompts.log\nprintf '%s' '{\"type\":\"result\",\"result\":\"ok\"}'\n",
        "",
    );

    gw.scheduler.handle_event(user_message("10.0", "hang")).await;
    gw.scheduler.handle_event(user_message("11.0", "original")).await;

    let client = gw.client.clone();
    wait_until(move || {
        client
            .reactions_added()
            .contains(&"hourglass_flowing_sand".to_string())
    })
    .await;

    // Edit the still-queued second message, then release the first.
    gw.scheduler
        .handle_event(ChatEvent::MessageChanged {
            channel: "C001".into(),
            ts: "11.0".into(),
            new_text: "edited".into(),
        })
        .await;
    gw.scheduler
        .handle_event(ChatEvent::Message(InboundMessage {
            channel: "C001".into(),
            user: "U1".into(),
            text: "!kill".into(),
            ts: "12.0".into(),
            thread_ts: None,
            files: vec![],
            from_bot: false,
        }))
        .await;

    wait_for_empty_queue(&gw.queue).await;
    wait_until({
        let dir = gw._dir.path().to_path_buf();
        move || {
            std::fs::read_to_string(dir.join("prompts.log"))
                .map(|s| s.contains("edited"))
                .unwrap_or(false)
        }
    })
    .await;

    let log = std::fs::read_to_string(gw._dir.path().join("prompts.log")).unwrap();
    assert_eq!(log.lines().collect::<Vec<_>>(), vec!["edited"]);
}

#[tokio::test]
async fn agent_failure_posts_error_in_thread() {
    let gw = gateway("echo 'exploded' >&2\nexit 7\n", "");

    gw.scheduler.handle_event(user_message("10.0", "boom")).await;
    wait_for_empty_queue(&gw.queue).await;
    let client = gw.client.clone();
    wait_until(move || !client.posted_texts().is_empty()).await;

    let posts = gw.client.posted_texts();
    assert_eq!(posts.len(), 1);
    assert!(
        posts[0].contains("Claude exited with code 7: exploded"),
        "{}",
        posts[0]
    );
    assert_eq!(
        gw.client.reactions_added(),
        vec!["inbox_tray", "hourglass_flowing_sand", "x"]
    );
}
