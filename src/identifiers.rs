//! Deterministic identifier derivation.
//!
//! Every identifier the orchestrator hands to the chat server or the
//! sandbox CLI is derived from the lobby event that triggered it, so that
//! re-processing the same event (a crash-and-restart replay, for example)
//! always produces the same task id, room name, and sandbox name.

use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};

const SLUG_FALLBACK: &str = "task";
const SLUG_MAX_LEN: usize = 24;
const SANDBOX_NAME_MAX_LEN: usize = 63;

/// Inputs to [`build_task_identifiers`].
pub struct TaskIdentifierInputs<'a> {
    pub project_key: &'a str,
    pub prompt: &'a str,
    pub lobby_event_id: &'a str,
    pub now: DateTime<Utc>,
}

/// Identifiers derived for a single accepted lobby message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskIdentifiers {
    pub task_id: String,
    pub sandbox_name: String,
    pub room_label: String,
}

/// Derive the full set of identifiers for a task spawned from one lobby
/// message. Deterministic in every input: the same `TaskIdentifierInputs`
/// always yields the same `TaskIdentifiers`, which is what lets the C6
/// scheduler replay an event without creating a duplicate task.
pub fn build_task_identifiers(inputs: TaskIdentifierInputs<'_>) -> TaskIdentifiers {
    let timestamp = inputs.now.format("%Y%m%d%H%M%S").to_string();
    let hash = short_hash(&format!("{}:{}", inputs.project_key, inputs.lobby_event_id));
    let slug = slugify(inputs.prompt, SLUG_FALLBACK, SLUG_MAX_LEN);

    let task_id = format!("{}-{timestamp}-{hash}", inputs.project_key);
    let sandbox_name = truncate(&format!("task-{timestamp}-{slug}-{hash}"), SANDBOX_NAME_MAX_LEN);
    let room_label = format!("{slug}-{hash}");

    TaskIdentifiers {
        task_id,
        sandbox_name,
        room_label,
    }
}

/// First 6 hex characters of the SHA-1 digest of `input`.
fn short_hash(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex_encode(&digest)[..6].to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String cannot fail");
    }
    out
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        s[..max_len].to_string()
    }
}

/// Lowercase, replace every run of non-`[a-z0-9]` characters with a single
/// `-`, collapse runs, trim leading/trailing `-`, truncate to `max_len` and
/// re-trim, falling back to `fallback` if nothing survives.
pub fn slugify(input: &str, fallback: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_dash = false;
    for ch in input.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() {
            out.push(lower);
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    let truncated = truncate(trimmed, max_len);
    let retrimmed = truncated.trim_matches('-');
    if retrimmed.is_empty() {
        fallback.to_string()
    } else {
        retrimmed.to_string()
    }
}
