// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Markdown → Slack mrkdwn translation.
//!
//! The agent produces standard Markdown; Slack renders its own lightweight
//! mrkdwn dialect (no headings, no list syntax, single-asterisk bold).  The
//! translator rewrites the former into the latter while leaving the interior
//! of fenced code blocks byte-identical — only the language tag on the
//! opening fence is stripped.
//!
//! `markdown_to_mrkdwn` is called on partial streaming buffers as well as on
//! final texts, so it must behave sensibly on input that ends mid-fence.

use std::sync::OnceLock;

use regex::Regex;

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").unwrap())
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^#{1,6} (.+)$").unwrap())
}

fn bold_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap())
}

fn strike_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"~~([^~]+)~~").unwrap())
}

fn rule_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^(?:-{3,}|\*{3,}|_{3,})$").unwrap())
}

fn bullet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[-*] ").unwrap())
}

/// Translate standard Markdown into Slack mrkdwn.
///
/// Fenced code blocks are preserved verbatim; the only change inside a fence
/// region is that the language tag on the opening ``` line is dropped.  An
/// unterminated fence (possible on a streaming partial buffer) treats the
/// rest of the input as fence interior.
pub fn markdown_to_mrkdwn(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_fence = false;
    let mut first = true;

    // split('\n') keeps a final empty piece for trailing newlines, so joining
    // the translated lines back with '\n' reproduces the original line
    // structure exactly.
    for line in text.split('\n') {
        if !first {
            out.push('\n');
        }
        first = false;

        if line.trim_start().starts_with("```") {
            if in_fence {
                out.push_str(line);
            } else {
                // Opening fence: strip the language tag, keep indentation.
                let indent_len = line.len() - line.trim_start().len();
                out.push_str(&line[..indent_len]);
                out.push_str("```");
            }
            in_fence = !in_fence;
            continue;
        }

        if in_fence {
            out.push_str(line);
        } else {
            out.push_str(&translate_line(line));
        }
    }
    out
}

/// Apply the mrkdwn rules to a single line outside any code fence.
fn translate_line(line: &str) -> String {
    // Escaping must run first: every later rule may introduce literal '<'
    // (link tokens) that must survive.
    let mut s = line.replace('&', "&amp;").replace('<', "&lt;");
    s = link_re().replace_all(&s, "<$2|$1>").into_owned();
    s = heading_re().replace_all(&s, "*$1*").into_owned();
    // ** must go before any single-asterisk handling or the pair would be
    // half-consumed.
    s = bold_re().replace_all(&s, "*$1*").into_owned();
    s = strike_re().replace_all(&s, "~$1~").into_owned();
    s = rule_re().replace_all(&s, "\u{2014}\u{2014}\u{2014}").into_owned();
    s = bullet_re().replace_all(&s, "\u{2022} ").into_owned();
    s
}

/// Split `text` into chunks of at most `max` bytes.
///
/// Each split prefers the last newline within the first `max` bytes; when
/// there is none, or it sits in the first half of the window, the chunk is
/// cut hard at `max`.  The remainder after a split is left-trimmed.
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    assert!(max > 0);
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.len() > max {
        // Back off to a char boundary so a hard cut never splits a code point.
        let mut window_end = max;
        while !rest.is_char_boundary(window_end) {
            window_end -= 1;
        }
        let split = match rest[..window_end].rfind('\n') {
            Some(i) if i >= max / 2 => i,
            _ => window_end,
        };
        chunks.push(rest[..split].to_string());
        rest = rest[split..].trim_start();
    }
    chunks.push(rest.to_string());
    chunks
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Escaping ──────────────────────────────────────────────────────────────

    #[test]
    fn ampersand_and_angle_are_escaped() {
        assert_eq!(markdown_to_mrkdwn("a & b < c"), "a &amp; b &lt; c");
    }

    #[test]
    fn escaping_runs_before_link_rewriting() {
        // The '<' introduced by the link rule must not itself get escaped.
        let out = markdown_to_mrkdwn("[a & b](https://x.y)");
        assert_eq!(out, "<https://x.y|a &amp; b>");
    }

    // ── Links ─────────────────────────────────────────────────────────────────

    #[test]
    fn link_becomes_slack_token() {
        assert_eq!(
            markdown_to_mrkdwn("see [docs](https://example.com/d)"),
            "see <https://example.com/d|docs>"
        );
    }

    #[test]
    fn multiple_links_on_one_line() {
        let out = markdown_to_mrkdwn("[a](u1) and [b](u2)");
        assert_eq!(out, "<u1|a> and <u2|b>");
    }

    // ── Headings ──────────────────────────────────────────────────────────────

    #[test]
    fn heading_levels_become_bold() {
        assert_eq!(markdown_to_mrkdwn("# Title"), "*Title*");
        assert_eq!(markdown_to_mrkdwn("###### Deep"), "*Deep*");
    }

    #[test]
    fn seven_hashes_is_not_a_heading() {
        assert_eq!(markdown_to_mrkdwn("####### nope"), "####### nope");
    }

    #[test]
    fn hash_without_space_is_untouched() {
        assert_eq!(markdown_to_mrkdwn("#hashtag"), "#hashtag");
    }

    // ── Emphasis ──────────────────────────────────────────────────────────────

    #[test]
    fn double_asterisk_becomes_single() {
        assert_eq!(markdown_to_mrkdwn("a **bold** word"), "a *bold* word");
    }

    #[test]
    fn strikethrough_tildes_halved() {
        assert_eq!(markdown_to_mrkdwn("~~gone~~"), "~gone~");
    }

    // ── Rules and bullets ─────────────────────────────────────────────────────

    #[test]
    fn horizontal_rule_variants() {
        assert_eq!(markdown_to_mrkdwn("---"), "———");
        assert_eq!(markdown_to_mrkdwn("*****"), "———");
        assert_eq!(markdown_to_mrkdwn("___"), "———");
    }

    #[test]
    fn two_dashes_is_not_a_rule() {
        assert_eq!(markdown_to_mrkdwn("--"), "--");
    }

    #[test]
    fn dash_and_star_bullets_become_dots() {
        assert_eq!(markdown_to_mrkdwn("- item"), "• item");
        assert_eq!(markdown_to_mrkdwn("* item"), "• item");
    }

    #[test]
    fn bullet_conversion_only_at_line_start() {
        assert_eq!(markdown_to_mrkdwn("2 - 1 = 1"), "2 - 1 = 1");
    }

    // ── Code fences ───────────────────────────────────────────────────────────

    #[test]
    fn fence_interior_is_untouched() {
        let src = "before\n```rust\nlet x = a & b; // **not bold**\n- not a list\n```\nafter **b**";
        let out = markdown_to_mrkdwn(src);
        assert_eq!(
            out,
            "before\n```\nlet x = a & b; // **not bold**\n- not a list\n```\nafter *b*"
        );
    }

    #[test]
    fn language_tag_is_stripped_from_opening_fence() {
        assert_eq!(markdown_to_mrkdwn("```python\nprint(1)\n```"), "```\nprint(1)\n```");
    }

    #[test]
    fn unterminated_fence_treats_rest_as_code() {
        // Streaming buffers may end mid-fence.
        let out = markdown_to_mrkdwn("```sh\necho **hi**");
        assert_eq!(out, "```\necho **hi**");
    }

    #[test]
    fn second_fence_block_independent_of_first() {
        let src = "```a\nx\n```\n**mid**\n```b\ny\n```";
        let out = markdown_to_mrkdwn(src);
        assert_eq!(out, "```\nx\n```\n*mid*\n```\ny\n```");
    }

    // ── Idempotence ───────────────────────────────────────────────────────────

    #[test]
    fn plain_text_is_unchanged() {
        let s = "just a sentence with no markup";
        assert_eq!(markdown_to_mrkdwn(s), s);
    }

    #[test]
    fn idempotent_on_token_free_output() {
        let once = markdown_to_mrkdwn("plain words, nothing special");
        let twice = markdown_to_mrkdwn(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn trailing_newline_preserved() {
        assert_eq!(markdown_to_mrkdwn("line\n"), "line\n");
    }

    // ── split_message ─────────────────────────────────────────────────────────

    #[test]
    fn short_text_is_single_chunk() {
        assert_eq!(split_message("hello", 100), vec!["hello"]);
    }

    #[test]
    fn splits_at_last_newline_in_window() {
        let text = "aaaa\nbbbb\ncccc";
        let chunks = split_message(text, 12);
        assert_eq!(chunks, vec!["aaaa\nbbbb", "cccc"]);
    }

    #[test]
    fn newline_in_first_half_forces_hard_cut() {
        // Only newline is at index 1, below max/2 → hard cut at max.
        let text = "a\nbcdefghij";
        let chunks = split_message(text, 8);
        assert_eq!(chunks[0].len(), 8);
        assert_eq!(chunks.join(""), text);
    }

    #[test]
    fn no_newline_forces_hard_cut() {
        let chunks = split_message(&"x".repeat(25), 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[1].len(), 10);
        assert_eq!(chunks[2].len(), 5);
    }

    #[test]
    fn every_chunk_respects_max() {
        let text = "word ".repeat(500);
        for chunk in split_message(&text, 64) {
            assert!(chunk.len() <= 64);
        }
    }

    #[test]
    fn non_whitespace_content_is_preserved() {
        let text = "alpha\nbeta\ngamma\ndelta\nepsilon";
        let chunks = split_message(text, 12);
        let joined: String = chunks.join("");
        let strip = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
        assert_eq!(strip(&joined), strip(text));
    }

    #[test]
    fn multibyte_text_never_splits_a_char() {
        let text = "éééééééééééééééééééé"; // 2 bytes per char
        for chunk in split_message(text, 7) {
            assert!(chunk.chars().all(|c| c == 'é'));
        }
    }
}
