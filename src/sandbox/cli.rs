//! Production `SandboxApi` implementation: drives the `spark` CLI as a
//! subprocess.

use super::{
    contains_ignore_case, env_prelude, shell_quote, BootstrapSpec, BridgeLaunchResult, ForkSpec,
    LaunchBridgeSpec, MainSandboxSpec, RepoSyncSpec, SandboxApi,
};
use crate::error::{Result, SandboxError};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const VERSION_TIMEOUT_SECS: u64 = 15;
const VOLUME_TIMEOUT_SECS: u64 = 60;
const MAIN_SANDBOX_TIMEOUT_SECS: u64 = 300;
const REPO_SYNC_TIMEOUT_SECS: u64 = 300;
const FORK_TIMEOUT_SECS: u64 = 120;
const LAUNCH_TIMEOUT_SECS: u64 = 60;

/// Drives one `spark` binary found on `PATH`.
pub struct SparkCliClient {
    binary: String,
}

impl Default for SparkCliClient {
    fn default() -> Self {
        Self {
            binary: "spark".to_string(),
        }
    }
}

impl SparkCliClient {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run `spark <args>` with a timeout, returning the combined
    /// stdout+stderr output. `allow_already_exists` is checked against the
    /// output before a non-zero exit is turned into an error.
    async fn run(
        &self,
        args: &[&str],
        timeout: Duration,
        allow_already_exists: bool,
    ) -> Result<String> {
        let command_label = format!("{} {}", self.binary, args.join(" "));

        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| SandboxError::Spawn {
            command: command_label.clone(),
            source,
        })?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| SandboxError::Timeout {
                command: command_label.clone(),
                timeout_secs: timeout.as_secs(),
            })?
            .map_err(|source| SandboxError::Spawn {
                command: command_label.clone(),
                source,
            })?;

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        if output.status.success() {
            return Ok(combined);
        }
        if allow_already_exists && contains_ignore_case(&combined, "already exists") {
            return Ok(combined);
        }

        Err(SandboxError::NonZeroExit {
            command: command_label,
            exit_code: output.status.code(),
            output: truncate(&combined, 4_000),
        }
        .into())
    }

    async fn exec_script(
        &self,
        project: &str,
        sandbox_name: &str,
        script: &str,
        env: Option<&str>,
        background: bool,
        timeout: Duration,
    ) -> Result<String> {
        let target = format!("{project}:{sandbox_name}");
        let body = match env {
            Some(prelude) => format!("{prelude} {script}"),
            None => script.to_string(),
        };
        let owned_args: Vec<String> = if background {
            vec![
                "exec".to_string(),
                target,
                "--bg".to_string(),
                "--".to_string(),
                "bash".to_string(),
                "-lc".to_string(),
                body,
            ]
        } else {
            vec![
                "exec".to_string(),
                target,
                "--".to_string(),
                "bash".to_string(),
                "-lc".to_string(),
                body,
            ]
        };
        let args: Vec<&str> = owned_args.iter().map(String::as_str).collect();
        self.run(&args, timeout, false).await
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let boundary = s
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= max_len)
            .last()
            .unwrap_or(0);
        format!("{}...(truncated)", &s[..boundary])
    }
}

impl SandboxApi for SparkCliClient {
    async fn verify_availability(&self) -> Result<()> {
        self.run(
            &["--version"],
            Duration::from_secs(VERSION_TIMEOUT_SECS),
            false,
        )
        .await?;
        Ok(())
    }

    async fn ensure_work_volume(&self, project: &str, volume: &str) -> Result<()> {
        self.run(
            &["volume", "create", project, volume],
            Duration::from_secs(VOLUME_TIMEOUT_SECS),
            true,
        )
        .await?;
        Ok(())
    }

    async fn ensure_main_sandbox(&self, spec: &MainSandboxSpec) -> Result<()> {
        let target = format!("{}:{}", spec.project, spec.main_sandbox);
        let volume_mount = format!("{}:{}", spec.work_volume, spec.work_mount_path);
        self.run(
            &[
                "sandbox",
                "create",
                &target,
                "--base",
                &spec.base,
                "--volume",
                &volume_mount,
            ],
            Duration::from_secs(MAIN_SANDBOX_TIMEOUT_SECS),
            true,
        )
        .await?;
        Ok(())
    }

    async fn ensure_repo_in_main_sandbox(&self, spec: &RepoSyncSpec) -> Result<()> {
        let script = format!(
            "set -e; mkdir -p {workdir}; cd {workdir}; if [ -d .git ]; then \
             git fetch origin {branch}; git checkout {branch}; git reset --hard origin/{branch}; \
             else git clone {repo} .; git checkout {branch}; fi",
            workdir = shell_quote(&spec.workdir),
            repo = shell_quote(&spec.repo),
            branch = shell_quote(&spec.branch),
        );
        self.exec_script(
            &spec.project,
            &spec.sandbox_name,
            &script,
            None,
            false,
            Duration::from_secs(REPO_SYNC_TIMEOUT_SECS),
        )
        .await?;
        Ok(())
    }

    async fn run_bootstrap(&self, spec: &BootstrapSpec) -> Result<()> {
        let script = format!(
            "cd {workdir}; if [ -f {script_path} ]; then bash {script_path}; fi",
            workdir = shell_quote(&spec.workdir),
            script_path = shell_quote(&spec.script_path),
        );

        let mut attempt = 0;
        loop {
            let result = self
                .exec_script(
                    &spec.project,
                    &spec.sandbox_name,
                    &script,
                    None,
                    false,
                    Duration::from_secs(spec.timeout_sec),
                )
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(error) if attempt < spec.retries => {
                    attempt += 1;
                    tracing::warn!(%error, attempt, "bootstrap script failed, retrying");
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn create_task_sandbox_fork(&self, spec: &ForkSpec) -> Result<()> {
        let main_target = format!("{}:{}", spec.project, spec.main_sandbox);
        let task_target = format!("{}:{}", spec.project, spec.task_sandbox);

        let mut owned_args = vec!["sandbox".to_string(), "fork".to_string(), main_target, task_target];
        for (key, value) in &spec.tags {
            owned_args.push("-t".to_string());
            owned_args.push(format!("{key}={value}"));
        }
        let args: Vec<&str> = owned_args.iter().map(String::as_str).collect();

        self.run(&args, Duration::from_secs(FORK_TIMEOUT_SECS), false)
            .await?;
        Ok(())
    }

    async fn launch_bridge_in_sandbox(&self, spec: &LaunchBridgeSpec) -> Result<BridgeLaunchResult> {
        let prelude = env_prelude(&spec.env);
        let script = format!("cd {}; {}", shell_quote(&spec.bridge_workdir), spec.bridge_entrypoint);

        let output = self
            .exec_script(
                &spec.project,
                &spec.sandbox_name,
                &script,
                Some(&prelude),
                true,
                Duration::from_secs(LAUNCH_TIMEOUT_SECS),
            )
            .await?;

        Ok(BridgeLaunchResult {
            pid: parse_pid(&output),
            process_id: parse_process_id(&output),
            raw_output: output,
        })
    }
}

/// Parse a decimal PID following a `pid[:=]` token, tolerating absence.
fn parse_pid(output: &str) -> Option<u64> {
    find_token_value(output, &["pid:", "pid="])?.parse().ok()
}

/// Parse a process identifier token following `process[_id][:=]`,
/// tolerating absence.
fn parse_process_id(output: &str) -> Option<String> {
    find_token_value(
        output,
        &["process_id:", "process_id=", "process:", "process="],
    )
    .map(str::to_string)
}

fn find_token_value<'a>(haystack: &'a str, markers: &[&str]) -> Option<&'a str> {
    let lower = haystack.to_lowercase();
    for marker in markers {
        if let Some(idx) = lower.find(marker) {
            let start = idx + marker.len();
            let rest = haystack[start..].trim_start();
            let end = rest
                .find(|c: char| c.is_whitespace())
                .unwrap_or(rest.len());
            if end > 0 {
                return Some(&rest[..end]);
            }
        }
    }
    None
}
