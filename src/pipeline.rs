//! Task Pipeline: the ordered, failure-aware multi-step
//! spawn of a single task, plus the shared failure path invoked by the
//! scheduler when any step of the spawn fails.

use crate::chat::{ChatApi, ThreadContext};
use crate::config::{Config, ProjectConfig};
use crate::identifiers::{build_task_identifiers, TaskIdentifierInputs};
use crate::sandbox::{ForkSpec, LaunchBridgeSpec, SandboxApi};
use crate::state::StateStore;
use crate::{dedupe_key, BridgeInfo, TaskRecord, TaskStatus};
use std::collections::BTreeMap;

/// Env var keys always copied verbatim from the orchestrator's own process
/// environment into the bridge's environment, if set.
const PASSTHROUGH_ENV_KEYS: &[&str] = &["OPENAI_API_KEY", "LOG_LEVEL"];
const PASSTHROUGH_ENV_PREFIX: &str = "CODEX_";

const MAX_PROMPT_NOTICE_LEN: usize = 4_000;

/// Carries enough context from a failed spawn step for `mark_failed_event`
/// to post a notice and index the event without retrying it.
#[derive(Debug)]
pub struct SpawnFailure {
    pub dedupe_key: String,
    pub task_id: Option<String>,
    pub lobby_room_id: String,
    pub task_room_id: Option<String>,
    pub message: String,
}

/// Run the full spawn pipeline for one qualifying lobby message. Returns
/// the new task ID on success, or a `SpawnFailure` carrying everything
/// `mark_failed_event` needs to finish the failure path.
pub async fn spawn_task<C: ChatApi, S: SandboxApi>(
    chat: &C,
    sandbox: &S,
    state: &mut StateStore,
    config: &Config,
    project: &ProjectConfig,
    lobby_room_id: &str,
    lobby_event_id: &str,
    prompt: &str,
) -> Result<String, SpawnFailure> {
    let dedupe = dedupe_key(lobby_room_id, lobby_event_id);

    let identifiers = build_task_identifiers(TaskIdentifierInputs {
        project_key: &project.key,
        prompt,
        lobby_event_id,
        now: chrono::Utc::now(),
    });
    let task_id = identifiers.task_id.clone();

    let fail = |message: String, task_room_id: Option<String>| SpawnFailure {
        dedupe_key: dedupe.clone(),
        task_id: Some(task_id.clone()),
        lobby_room_id: lobby_room_id.to_string(),
        task_room_id,
        message,
    };

    // Step 2: insert a `waiting` task, index the event, persist immediately.
    // This is the invariant-preserving step — the event is marked processed
    // even if every subsequent step fails, so retries never double-create.
    let now = now_iso8601();
    let task = TaskRecord {
        id: task_id.clone(),
        project_key: project.key.clone(),
        lobby_room_id: lobby_room_id.to_string(),
        lobby_event_id: lobby_event_id.to_string(),
        task_room_id: None,
        task_room_name: None,
        sandbox_project: None,
        sandbox_name: None,
        status: TaskStatus::Waiting,
        status_reason: None,
        bridge: BridgeInfo::default(),
        initial_prompt: prompt.to_string(),
        created_at: now.clone(),
        updated_at: now,
    };
    state
        .update(|s| {
            s.tasks.insert(task_id.clone(), task);
            s.event_index.insert(dedupe.clone(), task_id.clone());
        })
        .map_err(|err| fail(err.to_string(), None))?;

    // Step 3: create the task room and link it under the project space.
    let task_room_name = format!("{}-{}", project.matrix.task_room_prefix, identifiers.room_label);
    let project_space_id = state
        .get()
        .projects
        .get(&project.key)
        .and_then(|p| p.project_space_id.clone())
        .ok_or_else(|| fail("project has no provisioned space to link the task room under".to_string(), None))?;

    let task_room_id = chat
        .create_room(&task_room_name, Some(prompt), &config.workspace.team_members)
        .await
        .map_err(|err| fail(err.to_string(), None))?;
    chat.link_room_under_space(&project_space_id, &task_room_id)
        .await
        .map_err(|err| fail(err.to_string(), Some(task_room_id.clone())))?;

    // Step 4: two notices — status metadata, then the truncated prompt.
    chat.send_notice(
        &task_room_id,
        &format!("status: waiting\ntask_id: {task_id}"),
        ThreadContext::default(),
    )
    .await
    .map_err(|err| fail(err.to_string(), Some(task_room_id.clone())))?;
    chat.send_message(
        &task_room_id,
        &truncate(prompt, MAX_PROMPT_NOTICE_LEN),
        ThreadContext::default(),
    )
    .await
    .map_err(|err| fail(err.to_string(), Some(task_room_id.clone())))?;

    // Step 5: fork the task sandbox from the project's main sandbox.
    let sandbox_project = project.spark.project.clone();
    let mut tags = BTreeMap::new();
    tags.insert("matrix_room_id".to_string(), task_room_id.clone());
    tags.insert("matrix_project".to_string(), project.key.clone());
    tags.insert("matrix_lobby_room_id".to_string(), lobby_room_id.to_string());
    tags.insert("matrix_lobby_event_id".to_string(), lobby_event_id.to_string());

    sandbox
        .create_task_sandbox_fork(&ForkSpec {
            project: sandbox_project.clone(),
            task_sandbox: identifiers.sandbox_name.clone(),
            main_sandbox: project.spark.main_spark.clone(),
            tags,
        })
        .await
        .map_err(|err| fail(err.to_string(), Some(task_room_id.clone())))?;

    // Step 6 is folded into the identifiers/state already captured above.
    let sandbox_name = identifiers.sandbox_name.clone();

    // Step 7: build the bridge environment.
    let env = build_bridge_env(
        chat.access_token(),
        &config.homeserver_url,
        &config.bot_user_id,
        &task_room_id,
        &project.key,
        &sandbox_project,
        &sandbox_name,
        prompt,
    );

    // Step 8: launch the bridge, record pid/process_id, transition active.
    let launch = sandbox
        .launch_bridge_in_sandbox(&LaunchBridgeSpec {
            project: sandbox_project.clone(),
            sandbox_name: sandbox_name.clone(),
            bridge_entrypoint: config.runtime.bridge_entrypoint.clone(),
            bridge_workdir: config.runtime.bridge_workdir.clone(),
            env,
        })
        .await
        .map_err(|err| fail(err.to_string(), Some(task_room_id.clone())))?;

    let updated_at = now_iso8601();
    state
        .update(|s| {
            if let Some(task) = s.tasks.get_mut(&task_id) {
                task.task_room_id = Some(task_room_id.clone());
                task.task_room_name = Some(task_room_name.clone());
                task.sandbox_project = Some(sandbox_project.clone());
                task.sandbox_name = Some(sandbox_name.clone());
                task.status = TaskStatus::Active;
                task.bridge = BridgeInfo {
                    pid: launch.pid,
                    process_id: launch.process_id.clone(),
                    raw_output: Some(launch.raw_output.clone()),
                };
                task.updated_at = updated_at.clone();
            }
        })
        .map_err(|err| fail(err.to_string(), Some(task_room_id.clone())))?;

    // Step 9: notify the originating lobby room.
    let notice = format!(
        "Task created: {task_id}\nRoom: {task_room_id}\nSandbox: {sandbox_project}:{sandbox_name}"
    );
    if let Err(error) = chat
        .send_notice(lobby_room_id, &notice, ThreadContext::default())
        .await
    {
        tracing::warn!(%error, task_id, "failed to post task-created notice to lobby");
    }

    Ok(task_id)
}

/// Failure path. Logs the error, transitions
/// any already-created task record to `error`, best-effort leaves the task
/// room unless `keep_error_rooms` is set, posts a failure notice to the
/// lobby, and permanently indexes the event so it is never retried.
pub async fn mark_failed_event<C: ChatApi>(chat: &C, state: &mut StateStore, keep_error_rooms: bool, failure: SpawnFailure) {
    tracing::error!(
        dedupe_key = %failure.dedupe_key,
        task_id = ?failure.task_id,
        message = %failure.message,
        "task spawn failed"
    );

    let had_task = failure
        .task_id
        .as_ref()
        .is_some_and(|id| state.get().tasks.contains_key(id));

    if let Some(task_id) = &failure.task_id {
        let task_id = task_id.clone();
        let reason = failure.message.clone();
        let updated_at = now_iso8601();
        let _ = state.update(|s| {
            if let Some(task) = s.tasks.get_mut(&task_id) {
                task.status = TaskStatus::Error;
                task.status_reason = Some(reason);
                task.updated_at = updated_at;
            }
        });
    }

    if !had_task {
        let sentinel = format!("failed-{}", chrono::Utc::now().timestamp_millis());
        let dedupe = failure.dedupe_key.clone();
        let _ = state.update(|s| {
            s.event_index.insert(dedupe, sentinel);
        });
    }

    if !keep_error_rooms {
        if let Some(task_room_id) = &failure.task_room_id {
            chat.leave_and_forget(task_room_id).await;
        }
    }

    let notice = format!("Task creation failed. {}", truncate(&failure.message, 1_000));
    if let Err(error) = chat
        .send_notice(&failure.lobby_room_id, &notice, ThreadContext::default())
        .await
    {
        tracing::warn!(%error, "failed to post failure notice to lobby");
    }
}

#[allow(clippy::too_many_arguments)]
fn build_bridge_env(
    access_token: &str,
    homeserver_url: &str,
    bot_user_id: &str,
    task_room_id: &str,
    project_key: &str,
    sandbox_project: &str,
    sandbox_name: &str,
    prompt: &str,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    for key in PASSTHROUGH_ENV_KEYS {
        if let Ok(value) = std::env::var(key) {
            env.insert((*key).to_string(), value);
        }
    }
    for (key, value) in std::env::vars() {
        if key.starts_with(PASSTHROUGH_ENV_PREFIX) {
            env.insert(key, value);
        }
    }

    env.insert("MATRIX_HOMESERVER_URL".to_string(), homeserver_url.to_string());
    env.insert("MATRIX_ACCESS_TOKEN".to_string(), access_token.to_string());
    env.insert("MATRIX_BOT_USER".to_string(), bot_user_id.to_string());
    env.insert("MATRIX_ROOM_ID".to_string(), task_room_id.to_string());
    env.insert("PROJECT_KEY".to_string(), project_key.to_string());
    env.insert("SPARK_PROJECT".to_string(), sandbox_project.to_string());
    env.insert("SPARK_NAME".to_string(), sandbox_name.to_string());
    env.insert("INITIAL_PROMPT".to_string(), prompt.to_string());

    env
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        s.chars().take(max_len).collect()
    }
}

fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::fake::FakeChatClient;
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
            projects: vec![sample_project()],
        }
    }

    fn sample_project() -> ProjectConfig {
        ProjectConfig {
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
        }
    }

    async fn seeded_state(dir: &std::path::Path) -> StateStore {
        let mut state = StateStore::load(dir.join("state.json")).unwrap();
        state
            .update(|s| {
                s.projects.insert(
                    "rc".to_string(),
                    crate::ProjectRecord {
                        display_name: "Release Candidate".to_string(),
                        project_space_id: Some("!space1".to_string()),
                        lobby_room_id: Some("!lobby1".to_string()),
                        lobby_room_name: Some("rc-lobby".to_string()),
                        spark: None,
                        updated_at: now_iso8601(),
                    },
                );
            })
            .unwrap();
        state
    }

    #[tokio::test]
    async fn successful_spawn_creates_one_active_task() {
        let chat = FakeChatClient::new("@bot:example.org");
        let sandbox = FakeSandboxClient::new();
        let dir = tempfile::tempdir().unwrap();
        let mut state = seeded_state(dir.path()).await;
        let config = sample_config();

        let task_id = spawn_task(
            &chat,
            &sandbox,
            &mut state,
            &config,
            &config.projects[0],
            "!lobby1",
            "$event1",
            "implement oauth migration",
        )
        .await
        .unwrap();

        let task = state.get().tasks.get(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(task.bridge.pid, Some(1234));
        assert_eq!(sandbox.create_task_sandbox_fork_calls(), 1);
        assert_eq!(sandbox.launch_bridge_in_sandbox_calls(), 1);

        let env = sandbox.last_launch_env().unwrap();
        assert_eq!(env.get("INITIAL_PROMPT").unwrap(), "implement oauth migration");
        assert_eq!(env.get("PROJECT_KEY").unwrap(), "rc");
    }

    #[tokio::test]
    async fn fork_failure_yields_error_task_and_is_indexed() {
        let chat = FakeChatClient::new("@bot:example.org");
        let sandbox = FakeSandboxClient::new();
        sandbox.fail_next_fork();
        let dir = tempfile::tempdir().unwrap();
        let mut state = seeded_state(dir.path()).await;
        let config = sample_config();

        let result = spawn_task(
            &chat,
            &sandbox,
            &mut state,
            &config,
            &config.projects[0],
            "!lobby1",
            "$event1",
            "trigger failure",
        )
        .await;

        let failure = result.unwrap_err();
        assert!(state.get().tasks.contains_key(failure.task_id.as_ref().unwrap()));

        mark_failed_event(&chat, &mut state, false, failure).await;

        let task = state.get().tasks.values().next().unwrap();
        assert_eq!(task.status, TaskStatus::Error);

        let sent = chat.sent_messages();
        assert!(sent.iter().any(|m| m.notice && m.text.contains("Task creation failed")));
        assert_eq!(state.get().event_index.len(), 1);
    }
}
