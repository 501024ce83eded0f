//! In-memory `SandboxApi` test double.

use super::{
    BootstrapSpec, BridgeLaunchResult, ForkSpec, LaunchBridgeSpec, MainSandboxSpec, RepoSyncSpec,
    SandboxApi,
};
use crate::error::{Result, SandboxError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct Calls {
    ensure_work_volume: u32,
    ensure_main_sandbox: u32,
    ensure_repo_in_main_sandbox: u32,
    run_bootstrap: u32,
    create_task_sandbox_fork: u32,
    launch_bridge_in_sandbox: u32,
}

/// A scriptable fake of the `spark` CLI: every call succeeds by default and
/// is counted, with an optional one-shot failure injection for exercising
/// the task pipeline's failure path.
#[derive(Default)]
pub struct FakeSandboxClient {
    calls: Mutex<Calls>,
    fork_failures_remaining: AtomicU32,
    last_launch_env: Mutex<Option<std::collections::BTreeMap<String, String>>>,
}

impl FakeSandboxClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_fork(&self) {
        self.fork_failures_remaining.store(1, Ordering::SeqCst);
    }

    pub fn ensure_work_volume_calls(&self) -> u32 {
        self.calls.lock().unwrap().ensure_work_volume
    }

    pub fn ensure_main_sandbox_calls(&self) -> u32 {
        self.calls.lock().unwrap().ensure_main_sandbox
    }

    pub fn ensure_repo_in_main_sandbox_calls(&self) -> u32 {
        self.calls.lock().unwrap().ensure_repo_in_main_sandbox
    }

    pub fn run_bootstrap_calls(&self) -> u32 {
        self.calls.lock().unwrap().run_bootstrap
    }

    pub fn create_task_sandbox_fork_calls(&self) -> u32 {
        self.calls.lock().unwrap().create_task_sandbox_fork
    }

    pub fn launch_bridge_in_sandbox_calls(&self) -> u32 {
        self.calls.lock().unwrap().launch_bridge_in_sandbox
    }

    pub fn last_launch_env(&self) -> Option<std::collections::BTreeMap<String, String>> {
        self.last_launch_env.lock().unwrap().clone()
    }
}

impl SandboxApi for FakeSandboxClient {
    async fn verify_availability(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_work_volume(&self, _project: &str, _volume: &str) -> Result<()> {
        self.calls.lock().unwrap().ensure_work_volume += 1;
        Ok(())
    }

    async fn ensure_main_sandbox(&self, _spec: &MainSandboxSpec) -> Result<()> {
        self.calls.lock().unwrap().ensure_main_sandbox += 1;
        Ok(())
    }

    async fn ensure_repo_in_main_sandbox(&self, _spec: &RepoSyncSpec) -> Result<()> {
        self.calls.lock().unwrap().ensure_repo_in_main_sandbox += 1;
        Ok(())
    }

    async fn run_bootstrap(&self, _spec: &BootstrapSpec) -> Result<()> {
        self.calls.lock().unwrap().run_bootstrap += 1;
        Ok(())
    }

    async fn create_task_sandbox_fork(&self, spec: &ForkSpec) -> Result<()> {
        self.calls.lock().unwrap().create_task_sandbox_fork += 1;
        if self
            .fork_failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SandboxError::NonZeroExit {
                command: format!("spark sandbox fork {}", spec.task_sandbox),
                exit_code: Some(1),
                output: "simulated fork failure".to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn launch_bridge_in_sandbox(&self, spec: &LaunchBridgeSpec) -> Result<BridgeLaunchResult> {
        self.calls.lock().unwrap().launch_bridge_in_sandbox += 1;
        *self.last_launch_env.lock().unwrap() = Some(spec.env.clone());
        Ok(BridgeLaunchResult {
            pid: Some(1234),
            process_id: Some("fake-process".to_string()),
            raw_output: "pid: 1234 process_id=fake-process".to_string(),
        })
    }
}
