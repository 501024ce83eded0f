//! Reconciler: converges declared projects to observed
//! chat and sandbox resources. Idempotent; safe to run on every boot.

use crate::chat::ChatApi;
use crate::config::{Config, ProjectConfig};
use crate::error::Result;
use crate::sandbox::{MainSandboxSpec, RepoSyncSpec, SandboxApi};
use crate::state::StateStore;
use crate::{ProjectRecord, SandboxShape, Workspace};

/// Entry point: `reconcileWorkspaceAndProjects()`.
///
/// All external calls happen before the single persist at the end — each helper below resolves/creates remote resources and
/// returns the record to write, rather than writing to the store itself.
pub async fn reconcile_workspace_and_projects<C: ChatApi, S: SandboxApi>(
    chat: &C,
    sandbox: &S,
    state: &mut StateStore,
    config: &Config,
) -> Result<()> {
    let existing_workspace_space_id = state.get().workspace.space_id.clone();
    let (workspace_space_id, _) = resolve_or_create_room(
        chat,
        existing_workspace_space_id.as_deref(),
        true,
        &config.workspace.name,
        config.workspace.topic.as_deref(),
        &config.workspace.team_members,
    )
    .await?;
    chat.ensure_invites(&workspace_space_id, &config.workspace.team_members)
        .await?;

    let mut project_records = Vec::with_capacity(config.projects.len());
    for project in &config.projects {
        let record = reconcile_project(chat, sandbox, state, config, project, &workspace_space_id).await?;
        project_records.push((project.key.clone(), record));
    }

    let workspace = Workspace {
        name: Some(config.workspace.name.clone()),
        topic: config.workspace.topic.clone(),
        space_id: Some(workspace_space_id),
        updated_at: Some(now_iso8601()),
    };

    state.update(|s| {
        s.workspace = workspace;
        for (key, record) in project_records {
            s.projects.insert(key, record);
        }
    })
}

async fn reconcile_project<C: ChatApi, S: SandboxApi>(
    chat: &C,
    sandbox: &S,
    state: &StateStore,
    config: &Config,
    project: &ProjectConfig,
    workspace_space_id: &str,
) -> Result<ProjectRecord> {
    let existing_project_space_id = state
        .get()
        .projects
        .get(&project.key)
        .and_then(|p| p.project_space_id.clone());

    let (project_space_id, _) = resolve_or_create_room(
        chat,
        existing_project_space_id.as_deref(),
        true,
        &project.display_name,
        None,
        &config.workspace.team_members,
    )
    .await?;

    chat.link_room_under_space(workspace_space_id, &project_space_id).await?;
    chat.ensure_invites(&project_space_id, &config.workspace.team_members)
        .await?;

    let existing_lobby_room_id = state
        .get()
        .projects
        .get(&project.key)
        .and_then(|p| p.lobby_room_id.clone());

    let (lobby_room_id, _) = resolve_or_create_room(
        chat,
        existing_lobby_room_id.as_deref(),
        false,
        &project.matrix.lobby_room_name,
        None,
        &config.workspace.team_members,
    )
    .await?;

    chat.link_room_under_space(&project_space_id, &lobby_room_id).await?;
    chat.ensure_invites(&lobby_room_id, &config.workspace.team_members)
        .await?;

    // Sandbox side, synchronous and in order.
    sandbox
        .ensure_work_volume(&project.spark.project, &project.spark.work.volume)
        .await?;
    sandbox
        .ensure_main_sandbox(&MainSandboxSpec {
            project: project.spark.project.clone(),
            base: project.spark.base.clone(),
            main_sandbox: project.spark.main_spark.clone(),
            work_volume: project.spark.work.volume.clone(),
            work_mount_path: project.spark.work.mount_path.clone(),
        })
        .await?;
    sandbox
        .ensure_repo_in_main_sandbox(&RepoSyncSpec {
            project: project.spark.project.clone(),
            sandbox_name: project.spark.main_spark.clone(),
            repo: project.repo.clone(),
            branch: project.default_branch.clone(),
            workdir: project.spark.work.mount_path.clone(),
        })
        .await?;
    if let Some(script_path) = &project.spark.bootstrap.script_if_exists {
        sandbox
            .run_bootstrap(&crate::sandbox::BootstrapSpec {
                project: project.spark.project.clone(),
                sandbox_name: project.spark.main_spark.clone(),
                workdir: project.spark.work.mount_path.clone(),
                script_path: script_path.clone(),
                timeout_sec: project.spark.bootstrap.timeout_sec,
                retries: project.spark.bootstrap.retries,
            })
            .await?;
    }

    Ok(ProjectRecord {
        display_name: project.display_name.clone(),
        project_space_id: Some(project_space_id),
        lobby_room_id: Some(lobby_room_id),
        lobby_room_name: Some(project.matrix.lobby_room_name.clone()),
        spark: Some(SandboxShape {
            project: project.spark.project.clone(),
            base: project.spark.base.clone(),
            main_sandbox: project.spark.main_spark.clone(),
            work_volume: project.spark.work.volume.clone(),
            work_mount_path: project.spark.work.mount_path.clone(),
        }),
        updated_at: now_iso8601(),
    })
}

/// Resolve an existing room by ID (confirming membership), or create a new
/// one on a missing/stale ID. On `ensureJoinedRoom` failure the caller is
/// treated as if no ID had been stored: a create is attempted, and a
/// failure there propagates (new-resource creation is never swallowed).
async fn resolve_or_create_room<C: ChatApi>(
    chat: &C,
    existing: Option<&str>,
    is_space: bool,
    name: &str,
    topic: Option<&str>,
    invites: &[String],
) -> Result<(String, bool)> {
    if let Some(id) = existing {
        match chat.ensure_joined_room(id).await {
            Ok(()) => return Ok((id.to_string(), false)),
            Err(error) => {
                tracing::warn!(room_id = id, %error, "stored room unreachable, re-creating");
            }
        }
    }

    let id = if is_space {
        chat.create_space(name, topic, invites).await?
    } else {
        chat.create_room(name, topic, invites).await?
    };
    Ok((id, true))
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
                team_members: vec!["@alice:example.org".to_string()],
            },
            runtime: RuntimeOptions::default(),
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
                    bootstrap: BootstrapConfig {
                        script_if_exists: Some("bootstrap.sh".to_string()),
                        timeout_sec: 1800,
                        retries: 1,
                    },
                },
            }],
        }
    }

    #[tokio::test]
    async fn first_boot_creates_workspace_and_project_resources() {
        let chat = FakeChatClient::new("@bot:example.org");
        let sandbox = FakeSandboxClient::new();
        let dir = tempfile::tempdir().unwrap();
        let mut state = StateStore::load(dir.path().join("state.json")).unwrap();
        let config = sample_config();

        reconcile_workspace_and_projects(&chat, &sandbox, &mut state, &config)
            .await
            .unwrap();

        assert_eq!(state.get().workspace.space_id.as_deref(), Some("!space0"));
        let project = state.get().projects.get("rc").unwrap();
        assert_eq!(project.project_space_id.as_deref(), Some("!space1"));
        assert_eq!(project.lobby_room_id.as_deref(), Some("!room0"));
        assert_eq!(sandbox.ensure_work_volume_calls(), 1);
        assert_eq!(sandbox.ensure_main_sandbox_calls(), 1);
        assert_eq!(sandbox.ensure_repo_in_main_sandbox_calls(), 1);
        assert_eq!(sandbox.run_bootstrap_calls(), 1);
    }

    #[tokio::test]
    async fn second_reconcile_does_not_create_new_resources() {
        let chat = FakeChatClient::new("@bot:example.org");
        let sandbox = FakeSandboxClient::new();
        let dir = tempfile::tempdir().unwrap();
        let mut state = StateStore::load(dir.path().join("state.json")).unwrap();
        let config = sample_config();

        reconcile_workspace_and_projects(&chat, &sandbox, &mut state, &config)
            .await
            .unwrap();
        let first_space = state.get().workspace.space_id.clone();

        reconcile_workspace_and_projects(&chat, &sandbox, &mut state, &config)
            .await
            .unwrap();

        assert_eq!(state.get().workspace.space_id, first_space);
        assert_eq!(chat.create_space_call_count(), 1);
        assert_eq!(chat.create_room_call_count(), 1);
    }

    #[tokio::test]
    async fn stale_workspace_space_is_cleared_and_recreated() {
        let chat = FakeChatClient::new("@bot:example.org");
        let sandbox = FakeSandboxClient::new();
        let dir = tempfile::tempdir().unwrap();
        let mut state = StateStore::load(dir.path().join("state.json")).unwrap();
        let config = sample_config();

        reconcile_workspace_and_projects(&chat, &sandbox, &mut state, &config)
            .await
            .unwrap();
        let first_space = state.get().workspace.space_id.clone().unwrap();

        chat.fail_ensure_joined_room_once(&first_space);
        reconcile_workspace_and_projects(&chat, &sandbox, &mut state, &config)
            .await
            .unwrap();

        assert_ne!(state.get().workspace.space_id.clone().unwrap(), first_space);
        assert_eq!(chat.create_space_call_count(), 2);
    }
}
