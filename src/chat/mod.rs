//! Chat Client: a thin HTTP client against the
//! federated chat protocol's client endpoints.

mod http;

#[cfg(test)]
pub mod fake;

pub use http::HttpChatClient;

use crate::error::Result;
use std::future::Future;

/// One message event returned from a sync batch, already filtered down to
/// the fields the scheduler needs.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub room_id: String,
    pub event_id: String,
    pub sender: String,
    pub event_type: String,
    pub body: Option<String>,
}

/// Result of a long-poll `sync` call, already flattened across rooms.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub next_batch: String,
    pub events: Vec<RoomEvent>,
}

/// Optional thread metadata for a sent message.
#[derive(Debug, Clone, Default)]
pub struct ThreadContext {
    pub thread_root_event_id: Option<String>,
}

/// Message type for a sent chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Notice,
}

/// Static trait for chat transports. Use this for type-safe, statically
/// dispatched call sites (the reconciler and scheduler are generic over
/// `C: ChatApi`).
pub trait ChatApi: Send + Sync + 'static {
    /// The access token currently in effect (resolved once at startup for
    /// password auth). Needed verbatim by the task pipeline's bridge env.
    fn access_token(&self) -> &str;

    /// The bot's own mxid, used by the scheduler's lobby message filter to
    /// ignore the bot's own notices.
    fn bot_user_id(&self) -> &str;

    /// Unauthenticated version probe + authenticated whoami; fails unless
    /// the homeserver returns the bot's own identity.
    fn verify_connection(&self) -> impl Future<Output = Result<()>> + Send;

    /// No-op if already joined; else issues a join.
    fn ensure_joined_room(&self, room_id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Creates a space-flagged room. Returns the opaque room ID.
    fn create_space(
        &self,
        name: &str,
        topic: Option<&str>,
        invites: &[String],
    ) -> impl Future<Output = Result<String>> + Send;

    /// Creates a plain room. Returns the opaque room ID.
    fn create_room(
        &self,
        name: &str,
        topic: Option<&str>,
        invites: &[String],
    ) -> impl Future<Output = Result<String>> + Send;

    /// Sets parent->child and child->parent hierarchy state events.
    fn link_room_under_space(
        &self,
        parent_id: &str,
        child_id: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Invites only the mxids neither joined nor already invited.
    fn ensure_invites(
        &self,
        room_id: &str,
        mxids: &[String],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Long poll returning the next batch token and any message events in
    /// the requested rooms.
    fn sync(
        &self,
        since: Option<&str>,
        timeout_ms: u64,
        room_ids: &[String],
    ) -> impl Future<Output = Result<SyncResult>> + Send;

    /// Sends a message (`m.room.message` with `msgtype: m.text`).
    fn send_message(
        &self,
        room_id: &str,
        text: &str,
        thread: ThreadContext,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Sends a notice (`msgtype: m.notice`).
    fn send_notice(
        &self,
        room_id: &str,
        text: &str,
        thread: ThreadContext,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Best-effort leave + forget; both calls are allowed to fail silently.
    fn leave_and_forget(&self, room_id: &str) -> impl Future<Output = ()> + Send;
}

/// Message body is truncated to this many characters before sending.
pub const MAX_MESSAGE_BODY_LEN: usize = 30_000;

pub(crate) fn truncate_body(body: &str) -> String {
    if body.chars().count() <= MAX_MESSAGE_BODY_LEN {
        body.to_string()
    } else {
        body.chars().take(MAX_MESSAGE_BODY_LEN).collect()
    }
}
