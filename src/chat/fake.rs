//! In-memory `ChatApi` test double used by reconciler/scheduler/pipeline
//! tests.

use super::{ChatApi, RoomEvent, SyncResult, ThreadContext};
use crate::error::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub room_id: String,
    pub text: String,
    pub notice: bool,
}

#[derive(Default)]
struct Inner {
    next_room_id: u64,
    rooms: HashMap<String, RoomState>,
    sent: Vec<SentMessage>,
    sync_queue: Vec<SyncResult>,
    create_room_calls: u32,
    create_space_calls: u32,
    fail_ensure_joined_room: HashSet<String>,
}

#[derive(Default, Clone)]
struct RoomState {
    joined: HashSet<String>,
    invited: HashSet<String>,
}

/// A scriptable fake of the chat homeserver: rooms are created in memory
/// with predictable sequential IDs, and a queue of canned `sync` results
/// can be pushed to simulate inbound lobby messages.
pub struct FakeChatClient {
    inner: Mutex<Inner>,
    bot_user_id: String,
}

impl FakeChatClient {
    pub fn new(bot_user_id: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            bot_user_id: bot_user_id.into(),
        }
    }

    /// Queue a sync result to be returned on the next call to `sync`.
    pub fn push_sync_result(&self, result: SyncResult) {
        self.inner.lock().unwrap().sync_queue.push(result);
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn create_room_call_count(&self) -> u32 {
        self.inner.lock().unwrap().create_room_calls
    }

    pub fn create_space_call_count(&self) -> u32 {
        self.inner.lock().unwrap().create_space_calls
    }

    /// Force the next `ensure_joined_room(room_id)` call to fail, exercising
    /// the reconciler's clear-and-recreate path.
    pub fn fail_ensure_joined_room_once(&self, room_id: impl Into<String>) {
        self.inner
            .lock()
            .unwrap()
            .fail_ensure_joined_room
            .insert(room_id.into());
    }

    pub fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }
}

impl ChatApi for FakeChatClient {
    fn access_token(&self) -> &str {
        "fake-access-token"
    }

    fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    async fn verify_connection(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_joined_room(&self, room_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_ensure_joined_room.remove(room_id) {
            return Err(crate::error::ChatError::Http {
                endpoint: "ensure_joined_room".to_string(),
                status: 404,
                body: "room not found".to_string(),
            }
            .into());
        }
        inner.rooms.entry(room_id.to_string()).or_default();
        Ok(())
    }

    async fn create_space(&self, _name: &str, _topic: Option<&str>, invites: &[String]) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.create_space_calls += 1;
        let id = format!("!space{}", inner.next_room_id);
        inner.next_room_id += 1;
        inner.rooms.insert(
            id.clone(),
            RoomState {
                joined: HashSet::new(),
                invited: invites.iter().cloned().collect(),
            },
        );
        Ok(id)
    }

    async fn create_room(&self, _name: &str, _topic: Option<&str>, invites: &[String]) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.create_room_calls += 1;
        let id = format!("!room{}", inner.next_room_id);
        inner.next_room_id += 1;
        inner.rooms.insert(
            id.clone(),
            RoomState {
                joined: HashSet::new(),
                invited: invites.iter().cloned().collect(),
            },
        );
        Ok(id)
    }

    async fn link_room_under_space(&self, _parent_id: &str, _child_id: &str) -> Result<()> {
        Ok(())
    }

    async fn ensure_invites(&self, room_id: &str, mxids: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let room = inner.rooms.entry(room_id.to_string()).or_default();
        for mxid in mxids {
            room.invited.insert(mxid.clone());
        }
        Ok(())
    }

    async fn sync(&self, _since: Option<&str>, _timeout_ms: u64, _room_ids: &[String]) -> Result<SyncResult> {
        let mut inner = self.inner.lock().unwrap();
        if inner.sync_queue.is_empty() {
            return Ok(SyncResult {
                next_batch: "s0".to_string(),
                events: Vec::new(),
            });
        }
        Ok(inner.sync_queue.remove(0))
    }

    async fn send_message(&self, room_id: &str, text: &str, _thread: ThreadContext) -> Result<()> {
        self.inner.lock().unwrap().sent.push(SentMessage {
            room_id: room_id.to_string(),
            text: text.to_string(),
            notice: false,
        });
        Ok(())
    }

    async fn send_notice(&self, room_id: &str, text: &str, _thread: ThreadContext) -> Result<()> {
        self.inner.lock().unwrap().sent.push(SentMessage {
            room_id: room_id.to_string(),
            text: text.to_string(),
            notice: true,
        });
        Ok(())
    }

    async fn leave_and_forget(&self, room_id: &str) {
        self.inner.lock().unwrap().rooms.remove(room_id);
    }
}

/// Build a canned `m.room.message` sync event for tests.
pub fn fake_message_event(room_id: &str, event_id: &str, sender: &str, body: &str) -> RoomEvent {
    RoomEvent {
        room_id: room_id.to_string(),
        event_id: event_id.to_string(),
        sender: sender.to_string(),
        event_type: "m.room.message".to_string(),
        body: Some(body.to_string()),
    }
}
