//! Production `ChatApi` implementation backed by `reqwest`.

use super::{truncate_body, ChatApi, MessageKind, RoomEvent, SyncResult, ThreadContext};
use crate::config::{AuthMode, Config};
use crate::error::{ChatError, Result};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const MAX_RETRY_ATTEMPTS: u32 = 5;
const MIN_RATE_LIMIT_BACKOFF_MS: u64 = 250;
const MAX_DEFAULT_BACKOFF_MS: u64 = 8_000;

/// Thin HTTP client against one federated chat homeserver.
pub struct HttpChatClient {
    http: reqwest::Client,
    base_url: String,
    bot_user_id: String,
    access_token: String,
    txn_prefix: String,
    txn_counter: AtomicU64,
}

impl HttpChatClient {
    /// Build a client, performing the password login exchange if
    /// `config.auth` selects that mode.
    pub async fn connect(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .build()
            .map_err(|source| ChatError::Transport {
                endpoint: "client construction".to_string(),
                source,
            })?;

        let mut client = Self {
            http,
            base_url: config.homeserver_url.clone(),
            bot_user_id: config.bot_user_id.clone(),
            access_token: String::new(),
            txn_prefix: uuid::Uuid::new_v4().to_string(),
            txn_counter: AtomicU64::new(0),
        };

        client.access_token = match &config.auth {
            AuthMode::AccessToken(token) => token.clone(),
            AuthMode::Password(password) => client.login_with_password(password).await?,
        };

        Ok(client)
    }

    async fn login_with_password(&self, password: &str) -> Result<String> {
        let body = json!({
            "type": "m.login.password",
            "identifier": {"type": "m.id.user", "user": self.bot_user_id},
            "password": password,
        });
        let response = self
            .request_with_retry(reqwest::Method::POST, "/_matrix/client/v3/login", Some(body))
            .await?;

        let access_token = response
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or(ChatError::LoginResponseMissingField("access_token"))?
            .to_string();
        response
            .get("user_id")
            .and_then(Value::as_str)
            .ok_or(ChatError::LoginResponseMissingField("user_id"))?;
        Ok(access_token)
    }

    fn next_txn_id(&self) -> String {
        let counter = self.txn_counter.fetch_add(1, Ordering::SeqCst);
        let wallclock = chrono::Utc::now().timestamp_millis();
        format!("{}-{wallclock}-{counter}", self.txn_prefix)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Run one HTTP call under the mandatory retry policy:
    /// up to 5 attempts, sleeping on HTTP 429 per `retry_after_ms` (or a
    /// linear backoff if absent), any other non-2xx is fatal.
    async fn request_with_retry(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let url = self.url(path);
        let mut last_error = None;

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.access_token);
            if let Some(body) = &body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(source) => {
                    last_error = Some(ChatError::Transport {
                        endpoint: path.to_string(),
                        source,
                    });
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let bytes = response.bytes().await.map_err(|source| ChatError::Transport {
                    endpoint: path.to_string(),
                    source,
                })?;
                if bytes.is_empty() {
                    return Ok(Value::Null);
                }
                return serde_json::from_slice(&bytes).map_err(|err| {
                    ChatError::Decode {
                        endpoint: path.to_string(),
                        message: err.to_string(),
                    }
                    .into()
                });
            }

            if status.as_u16() == 429 {
                let body_text = response.text().await.unwrap_or_default();
                let retry_after_ms = serde_json::from_str::<Value>(&body_text)
                    .ok()
                    .and_then(|v| v.get("retry_after_ms").and_then(Value::as_u64));
                let delay_ms = match retry_after_ms {
                    Some(ms) => ms.max(MIN_RATE_LIMIT_BACKOFF_MS),
                    None => (500 * attempt as u64).min(MAX_DEFAULT_BACKOFF_MS),
                };
                tracing::warn!(endpoint = %path, attempt, delay_ms, "rate limited, retrying");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                last_error = Some(ChatError::Http {
                    endpoint: path.to_string(),
                    status: status.as_u16(),
                    body: body_text,
                });
                continue;
            }

            let body_text = response.text().await.unwrap_or_default();
            return Err(ChatError::Http {
                endpoint: path.to_string(),
                status: status.as_u16(),
                body: body_text,
            }
            .into());
        }

        Err(last_error
            .unwrap_or(ChatError::Decode {
                endpoint: path.to_string(),
                message: "retries exhausted with no recorded error".to_string(),
            })
            .into())
    }

    async fn send(&self, room_id: &str, text: &str, kind: MessageKind, thread: ThreadContext) -> Result<()> {
        let truncated = truncate_body(text);
        let msgtype = match kind {
            MessageKind::Text => "m.text",
            MessageKind::Notice => "m.notice",
        };
        let mut body = json!({"msgtype": msgtype, "body": truncated});
        if let Some(root) = thread.thread_root_event_id {
            body["m.relates_to"] = json!({
                "rel_type": "m.thread",
                "event_id": root,
                "is_falling_back": true,
                "m.in_reply_to": {"event_id": root},
            });
        }

        let txn_id = self.next_txn_id();
        let path = format!(
            "/_matrix/client/v3/rooms/{}/send/m.room.message/{}",
            urlencode(room_id),
            urlencode(&txn_id)
        );
        self.request_with_retry(reqwest::Method::PUT, &path, Some(body))
            .await?;
        Ok(())
    }

    /// Derive the `via` server list for hierarchy state events from the
    /// bot's homeserver / user ID suffix.
    fn via_servers(&self) -> Vec<String> {
        let server = self
            .bot_user_id
            .rsplit_once(':')
            .map(|(_, server)| server.to_string())
            .unwrap_or_else(|| self.base_url.clone());
        vec![server]
    }
}

impl ChatApi for HttpChatClient {
    fn access_token(&self) -> &str {
        &self.access_token
    }

    fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    async fn verify_connection(&self) -> Result<()> {
        self.request_with_retry(reqwest::Method::GET, "/_matrix/client/versions", None)
            .await?;

        let whoami = self
            .request_with_retry(reqwest::Method::GET, "/_matrix/client/v3/account/whoami", None)
            .await?;
        let user_id = whoami.get("user_id").and_then(Value::as_str);
        if user_id != Some(self.bot_user_id.as_str()) {
            return Err(ChatError::IdentityMismatch.into());
        }
        Ok(())
    }

    async fn ensure_joined_room(&self, room_id: &str) -> Result<()> {
        let joined = self
            .request_with_retry(reqwest::Method::GET, "/_matrix/client/v3/joined_rooms", None)
            .await?;
        let already_joined = joined
            .get("joined_rooms")
            .and_then(Value::as_array)
            .map(|rooms| rooms.iter().any(|r| r.as_str() == Some(room_id)))
            .unwrap_or(false);
        if already_joined {
            return Ok(());
        }

        let path = format!("/_matrix/client/v3/join/{}", urlencode(room_id));
        self.request_with_retry(reqwest::Method::POST, &path, Some(json!({})))
            .await?;
        Ok(())
    }

    async fn create_space(&self, name: &str, topic: Option<&str>, invites: &[String]) -> Result<String> {
        self.create_room_internal(name, topic, invites, true).await
    }

    async fn create_room(&self, name: &str, topic: Option<&str>, invites: &[String]) -> Result<String> {
        self.create_room_internal(name, topic, invites, false).await
    }

    async fn link_room_under_space(&self, parent_id: &str, child_id: &str) -> Result<()> {
        let via = self.via_servers();

        let child_path = format!(
            "/_matrix/client/v3/rooms/{}/state/m.space.child/{}",
            urlencode(parent_id),
            urlencode(child_id)
        );
        self.request_with_retry(
            reqwest::Method::PUT,
            &child_path,
            Some(json!({"via": via})),
        )
        .await?;

        let parent_path = format!(
            "/_matrix/client/v3/rooms/{}/state/m.space.parent/{}",
            urlencode(child_id),
            urlencode(parent_id)
        );
        self.request_with_retry(
            reqwest::Method::PUT,
            &parent_path,
            Some(json!({"via": via, "canonical": true})),
        )
        .await?;
        Ok(())
    }

    async fn ensure_invites(&self, room_id: &str, mxids: &[String]) -> Result<()> {
        let path = format!("/_matrix/client/v3/rooms/{}/members", urlencode(room_id));
        let members = self.request_with_retry(reqwest::Method::GET, &path, None).await?;

        let mut already_in: HashSet<String> = HashSet::new();
        if let Some(chunk) = members.get("chunk").and_then(Value::as_array) {
            for event in chunk {
                let membership = event
                    .get("content")
                    .and_then(|c| c.get("membership"))
                    .and_then(Value::as_str);
                if matches!(membership, Some("join") | Some("invite")) {
                    if let Some(mxid) = event.get("state_key").and_then(Value::as_str) {
                        already_in.insert(mxid.to_string());
                    }
                }
            }
        }

        for mxid in mxids {
            if already_in.contains(mxid) {
                continue;
            }
            let invite_path = format!("/_matrix/client/v3/rooms/{}/invite", urlencode(room_id));
            self.request_with_retry(
                reqwest::Method::POST,
                &invite_path,
                Some(json!({"user_id": mxid})),
            )
            .await?;
        }
        Ok(())
    }

    async fn sync(&self, since: Option<&str>, timeout_ms: u64, room_ids: &[String]) -> Result<SyncResult> {
        let filter = json!({
            "room": {
                "rooms": room_ids,
                "timeline": {"types": ["m.room.message"]},
            },
        });
        let mut path = format!(
            "/_matrix/client/v3/sync?timeout={timeout_ms}&filter={}",
            urlencode(&filter.to_string())
        );
        if let Some(since) = since {
            path.push_str(&format!("&since={}", urlencode(since)));
        }

        let response = self.request_with_retry(reqwest::Method::GET, &path, None).await?;
        let next_batch = response
            .get("next_batch")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut events = Vec::new();
        if let Some(join) = response
            .get("rooms")
            .and_then(|r| r.get("join"))
            .and_then(Value::as_object)
        {
            for (room_id, room) in join {
                if !room_ids.iter().any(|r| r == room_id) {
                    continue;
                }
                if let Some(timeline_events) = room
                    .get("timeline")
                    .and_then(|t| t.get("events"))
                    .and_then(Value::as_array)
                {
                    for event in timeline_events {
                        events.push(RoomEvent {
                            room_id: room_id.clone(),
                            event_id: event
                                .get("event_id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            sender: event
                                .get("sender")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            event_type: event
                                .get("type")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            body: event
                                .get("content")
                                .and_then(|c| c.get("body"))
                                .and_then(Value::as_str)
                                .map(str::to_string),
                        });
                    }
                }
            }
        }

        Ok(SyncResult { next_batch, events })
    }

    async fn send_message(&self, room_id: &str, text: &str, thread: ThreadContext) -> Result<()> {
        self.send(room_id, text, MessageKind::Text, thread).await
    }

    async fn send_notice(&self, room_id: &str, text: &str, thread: ThreadContext) -> Result<()> {
        self.send(room_id, text, MessageKind::Notice, thread).await
    }

    async fn leave_and_forget(&self, room_id: &str) {
        let leave_path = format!("/_matrix/client/v3/rooms/{}/leave", urlencode(room_id));
        if let Err(error) = self
            .request_with_retry(reqwest::Method::POST, &leave_path, Some(json!({})))
            .await
        {
            tracing::debug!(%error, room_id, "best-effort leave failed");
        }

        let forget_path = format!("/_matrix/client/v3/rooms/{}/forget", urlencode(room_id));
        if let Err(error) = self
            .request_with_retry(reqwest::Method::POST, &forget_path, Some(json!({})))
            .await
        {
            tracing::debug!(%error, room_id, "best-effort forget failed");
        }
    }
}

impl HttpChatClient {
    async fn create_room_internal(
        &self,
        name: &str,
        topic: Option<&str>,
        invites: &[String],
        is_space: bool,
    ) -> Result<String> {
        let mut body = json!({
            "name": name,
            "invite": invites,
            "preset": "private_chat",
        });
        if let Some(topic) = topic {
            body["topic"] = json!(topic);
        }
        if is_space {
            body["creation_content"] = json!({"type": "m.space"});
        }

        let response = self
            .request_with_retry(reqwest::Method::POST, "/_matrix/client/v3/createRoom", Some(body))
            .await?;
        response
            .get("room_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ChatError::Decode {
                    endpoint: "/_matrix/client/v3/createRoom".to_string(),
                    message: "response missing room_id".to_string(),
                }
                .into()
            })
    }
}

/// Percent-encode a path segment or query value. Matrix room/event IDs
/// contain characters (`!`, `:`, `$`) that are not valid unescaped in a
/// URL path, so every caller-supplied identifier goes through this first.
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(*byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
