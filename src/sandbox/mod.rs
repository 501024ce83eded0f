//! Sandbox Client: a thin subprocess driver for the
//! `spark` sandbox CLI.

mod cli;

#[cfg(test)]
pub mod fake;

pub use cli::SparkCliClient;

use crate::error::Result;
use std::collections::BTreeMap;
use std::future::Future;

/// Shape of the main sandbox declared for a project.
#[derive(Debug, Clone)]
pub struct MainSandboxSpec {
    pub project: String,
    pub base: String,
    pub main_sandbox: String,
    pub work_volume: String,
    pub work_mount_path: String,
}

/// Inputs to `ensureRepoInMainSandbox`.
#[derive(Debug, Clone)]
pub struct RepoSyncSpec {
    pub project: String,
    pub sandbox_name: String,
    pub repo: String,
    pub branch: String,
    pub workdir: String,
}

/// Inputs to `runBootstrap`.
#[derive(Debug, Clone)]
pub struct BootstrapSpec {
    pub project: String,
    pub sandbox_name: String,
    pub workdir: String,
    pub script_path: String,
    pub timeout_sec: u64,
    pub retries: u32,
}

/// Inputs to `createTaskSandboxFork`.
#[derive(Debug, Clone)]
pub struct ForkSpec {
    pub project: String,
    pub task_sandbox: String,
    pub main_sandbox: String,
    pub tags: BTreeMap<String, String>,
}

/// Inputs to `launchBridgeInSandbox`.
#[derive(Debug, Clone)]
pub struct LaunchBridgeSpec {
    pub project: String,
    pub sandbox_name: String,
    pub bridge_entrypoint: String,
    pub bridge_workdir: String,
    pub env: BTreeMap<String, String>,
}

/// Result of launching the bridge process.
#[derive(Debug, Clone, Default)]
pub struct BridgeLaunchResult {
    pub pid: Option<u64>,
    pub process_id: Option<String>,
    pub raw_output: String,
}

/// Static trait for the sandbox CLI driver. The reconciler and task
/// pipeline are generic over `S: SandboxApi`.
pub trait SandboxApi: Send + Sync + 'static {
    fn verify_availability(&self) -> impl Future<Output = Result<()>> + Send;

    fn ensure_work_volume(
        &self,
        project: &str,
        volume: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn ensure_main_sandbox(
        &self,
        spec: &MainSandboxSpec,
    ) -> impl Future<Output = Result<()>> + Send;

    fn ensure_repo_in_main_sandbox(
        &self,
        spec: &RepoSyncSpec,
    ) -> impl Future<Output = Result<()>> + Send;

    fn run_bootstrap(&self, spec: &BootstrapSpec) -> impl Future<Output = Result<()>> + Send;

    fn create_task_sandbox_fork(
        &self,
        spec: &ForkSpec,
    ) -> impl Future<Output = Result<()>> + Send;

    fn launch_bridge_in_sandbox(
        &self,
        spec: &LaunchBridgeSpec,
    ) -> impl Future<Output = Result<BridgeLaunchResult>> + Send;
}

/// Single-quote `value` for safe interpolation into a shell script,
/// escaping embedded single quotes via `'` -> `'"'"'`.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

/// Build the `export KEY='value';` env prelude for a shell script, in
/// sorted key order for determinism.
pub(crate) fn env_prelude(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(key, value)| format!("export {key}={};", shell_quote(value)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// True if `haystack` contains `needle` case-insensitively — used to treat
/// "already exists" CLI output as success.
pub(crate) fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
