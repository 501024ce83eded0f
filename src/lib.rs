//! matrix-orchestrator: turns Matrix lobby messages into isolated sandbox
//! coding-agent workloads.

pub mod chat;
pub mod config;
pub mod error;
pub mod identifiers;
pub mod pipeline;
pub mod reconciler;
pub mod sandbox;
pub mod scheduler;
pub mod state;
pub mod telemetry;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Singleton workspace record — the root of the chat hierarchy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workspace {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub space_id: Option<String>,
    pub updated_at: Option<String>,
}

/// The sandbox shape declared for a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxShape {
    pub project: String,
    pub base: String,
    pub main_sandbox: String,
    pub work_volume: String,
    pub work_mount_path: String,
}

/// Per-project persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub display_name: String,
    #[serde(default)]
    pub project_space_id: Option<String>,
    #[serde(default)]
    pub lobby_room_id: Option<String>,
    #[serde(default)]
    pub lobby_room_name: Option<String>,
    #[serde(default)]
    pub spark: Option<SandboxShape>,
    pub updated_at: String,
}

/// Lifecycle status of a Task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Active,
    NeedsInput,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Active => "active",
            TaskStatus::NeedsInput => "needs_input",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        }
    }
}

/// State of the bridge process launched inside a task's sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeInfo {
    #[serde(default)]
    pub pid: Option<u64>,
    #[serde(default)]
    pub process_id: Option<String>,
    #[serde(default)]
    pub raw_output: Option<String>,
}

/// One record per accepted lobby message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub project_key: String,
    pub lobby_room_id: String,
    pub lobby_event_id: String,
    #[serde(default)]
    pub task_room_id: Option<String>,
    #[serde(default)]
    pub task_room_name: Option<String>,
    #[serde(default)]
    pub sandbox_project: Option<String>,
    #[serde(default)]
    pub sandbox_name: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub bridge: BridgeInfo,
    pub initial_prompt: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Full durable snapshot persisted by the State Store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorState {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub workspace: Workspace,
    #[serde(default)]
    pub projects: HashMap<String, ProjectRecord>,
    #[serde(default)]
    pub tasks: HashMap<String, TaskRecord>,
    /// `"<roomId>:<eventId>" -> taskId | "failed-<wallclock>"`
    #[serde(default)]
    pub event_index: HashMap<String, String>,
}

fn default_version() -> u32 {
    1
}

/// Build the dedupe key used as an EventIndex key.
pub fn dedupe_key(room_id: &str, event_id: &str) -> String {
    format!("{room_id}:{event_id}")
}
