//! Task Scheduler: the single-writer event loop. Syncs
//! the chat transport for lobby room messages, dedupes them against durable
//! and in-flight state, and drives the Task Pipeline for each one.

use crate::chat::{ChatApi, RoomEvent};
use crate::config::{Config, ProjectConfig};
use crate::dedupe_key;
use crate::error::Result;
use crate::pipeline::{mark_failed_event, spawn_task};
use crate::sandbox::SandboxApi;
use crate::state::StateStore;
use std::collections::HashSet;
use std::time::Duration;

/// Sleep applied after a failed `sync` attempt before retrying.
const SYNC_ERROR_BACKOFF: Duration = Duration::from_millis(1_500);

pub struct TaskScheduler<'a, C: ChatApi, S: SandboxApi> {
    chat: &'a C,
    sandbox: &'a S,
    state: StateStore,
    config: &'a Config,
    since_token: Option<String>,
    in_flight: HashSet<String>,
}

impl<'a, C: ChatApi, S: SandboxApi> TaskScheduler<'a, C, S> {
    pub fn new(chat: &'a C, sandbox: &'a S, state: StateStore, config: &'a Config) -> Self {
        Self {
            chat,
            sandbox,
            state,
            config,
            since_token: None,
            in_flight: HashSet::new(),
        }
    }

    /// `verifyConnection` + `verifyAvailability`, reconcile, then a
    /// zero-timeout sync to seed `sinceToken` without processing any
    /// events already sitting in the lobby rooms.
    pub async fn initialize(&mut self) -> Result<()> {
        self.chat.verify_connection().await?;
        self.sandbox.verify_availability().await?;

        crate::reconciler::reconcile_workspace_and_projects(self.chat, self.sandbox, &mut self.state, self.config)
            .await?;

        let lobby_room_ids = self.lobby_room_ids();
        let seed = self.chat.sync(None, 0, &lobby_room_ids).await?;
        self.since_token = Some(seed.next_batch);
        Ok(())
    }

    fn lobby_room_ids(&self) -> Vec<String> {
        self.state
            .get()
            .projects
            .values()
            .filter_map(|p| p.lobby_room_id.clone())
            .collect()
    }

    fn project_for_lobby_room(&self, room_id: &str) -> Option<&ProjectConfig> {
        let key = self
            .state
            .get()
            .projects
            .iter()
            .find(|(_, record)| record.lobby_room_id.as_deref() == Some(room_id))
            .map(|(key, _)| key.clone())?;
        self.config.projects.iter().find(|p| p.key == key)
    }

    /// Run until `should_continue` returns false. Honors the no-drop
    /// guarantee: `since_token` only advances after `handle_sync` returns.
    pub async fn run_loop(&mut self, mut should_continue: impl FnMut() -> bool) -> Result<()> {
        while should_continue() {
            let lobby_room_ids = self.lobby_room_ids();
            match self
                .chat
                .sync(self.since_token.as_deref(), self.config.runtime.sync_timeout_ms, &lobby_room_ids)
                .await
            {
                Ok(sync) => {
                    let next_batch = sync.next_batch.clone();
                    self.handle_sync(sync).await;
                    self.since_token = Some(next_batch);
                }
                Err(error) => {
                    tracing::warn!(%error, "sync failed, retrying after backoff");
                    tokio::time::sleep(SYNC_ERROR_BACKOFF).await;
                }
            }
        }
        Ok(())
    }

    async fn handle_sync(&mut self, sync: crate::chat::SyncResult) {
        for event in sync.events {
            if qualifies_as_lobby_message(&event, self.chat.bot_user_id()) {
                self.handle_lobby_message(event).await;
            }
        }
    }

    /// Per-event processing.
    async fn handle_lobby_message(&mut self, event: RoomEvent) {
        let dedupe = dedupe_key(&event.room_id, &event.event_id);

        if self.state.has_processed_event(&dedupe) {
            return;
        }
        if self.in_flight.contains(&dedupe) {
            return;
        }
        self.in_flight.insert(dedupe.clone());

        let Some(project) = self.project_for_lobby_room(&event.room_id).cloned() else {
            tracing::warn!(room_id = %event.room_id, "lobby message from an unmapped room, ignoring");
            self.in_flight.remove(&dedupe);
            return;
        };
        let body = event.body.clone().unwrap_or_default();

        let result = spawn_task(
            self.chat,
            self.sandbox,
            &mut self.state,
            self.config,
            &project,
            &event.room_id,
            &event.event_id,
            &body,
        )
        .await;

        if let Err(failure) = result {
            mark_failed_event(self.chat, &mut self.state, self.config.runtime.keep_error_rooms, failure).await;
        }

        self.in_flight.remove(&dedupe);
    }
}

/// The lobby message filter.
fn qualifies_as_lobby_message(event: &RoomEvent, bot_user_id: &str) -> bool {
    if event.event_type != "m.room.message" {
        return false;
    }
    if event.event_id.is_empty() || event.sender.is_empty() {
        return false;
    }
    if event.sender == bot_user_id {
        return false;
    }
    let Some(body) = event.body.as_deref() else {
        return false;
    };
    let trimmed = body.trim();
    !trimmed.is_empty() && !trimmed.starts_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::fake::{fake_message_event, FakeChatClient};
    use crate::chat::SyncResult;
    use crate::config::*;
    use crate::sandbox::fake::FakeSandboxClient;

    fn sample_config() -> Config {
        Config {
            homeserver_url: "https://matrix.example.org".to_string(),
            bot_user_id: "@bot:example.org".to_string(),
            auth: AuthMode::AccessToken("token".to_string()),
            workspace: WorkspaceConfig {
                name: "acme".to_string(),
                topic: None,
                team_members: vec![],
            },
            runtime: RuntimeOptions {
                bridge_entrypoint: "/usr/local/bin/bridge".to_string(),
                bridge_workdir: "/work".to_string(),
                ..RuntimeOptions::default()
            },
            projects: vec![ProjectConfig {
                key: "rc".to_string(),
                display_name: "Release Candidate".to_string(),
                repo: "git@example.org:rc.git".to_string(),
                default_branch: "main".to_string(),
                matrix: ProjectMatrixConfig {
                    lobby_room_name: "rc-lobby".to_string(),
                    task_room_prefix: "rc-task".to_string(),
                },
                spark: SparkConfig {
                    project: "rc".to_string(),
                    base: "ubuntu:22.04".to_string(),
                    main_spark: "rc-main".to_string(),
                    fork_mode: "spark_fork".to_string(),
                    work: WorkVolumeConfig {
                        volume: "rc-vol".to_string(),
                        mount_path: "/work".to_string(),
                    },
                    bootstrap: BootstrapConfig::default(),
                },
            }],
        }
    }

    #[test]
    fn filter_rejects_slash_prefixed_and_bot_and_empty() {
        let bot = "@bot:example.org";
        let from_bot = fake_message_event("!lobby1", "$1", bot, "hello");
        assert!(!qualifies_as_lobby_message(&from_bot, bot));

        let slash = fake_message_event("!lobby1", "$2", "@alice:example.org", "/status");
        assert!(!qualifies_as_lobby_message(&slash, bot));

        let empty = fake_message_event("!lobby1", "$3", "@alice:example.org", "   ");
        assert!(!qualifies_as_lobby_message(&empty, bot));

        let ok = fake_message_event("!lobby1", "$4", "@alice:example.org", "do the thing");
        assert!(qualifies_as_lobby_message(&ok, bot));
    }

    #[tokio::test]
    async fn single_message_spawns_one_task_and_replay_is_a_no_op() {
        let chat = FakeChatClient::new("@bot:example.org");
        let sandbox = FakeSandboxClient::new();
        let dir = tempfile::tempdir().unwrap();
        let state = StateStore::load(dir.path().join("state.json")).unwrap();
        let config = sample_config();

        let mut scheduler = TaskScheduler::new(&chat, &sandbox, state, &config);
        scheduler.initialize().await.unwrap();

        let event = fake_message_event("!room0", "$1", "@alice:example.org", "implement thing");
        chat.push_sync_result(SyncResult {
            next_batch: "s1".to_string(),
            events: vec![event.clone()],
        });
        chat.push_sync_result(SyncResult {
            next_batch: "s2".to_string(),
            events: vec![event],
        });

        let mut calls = 0;
        scheduler
            .run_loop(|| {
                calls += 1;
                calls <= 2
            })
            .await
            .unwrap();

        assert_eq!(sandbox.create_task_sandbox_fork_calls(), 1);
        assert_eq!(scheduler.state.get().tasks.len(), 1);
    }
}
