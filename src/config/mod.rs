//! Configuration loading and validation.

mod yaml;

use crate::error::{ConfigError, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use yaml::Value;

/// Authentication mode for the Matrix bot user.
#[derive(Debug, Clone)]
pub enum AuthMode {
    AccessToken(String),
    Password(String),
}

/// Top-level workspace declaration.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceConfig {
    pub name: String,
    pub topic: Option<String>,
    pub team_members: Vec<String>,
}

/// `runtime.*` options.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub state_file: PathBuf,
    pub bridge_entrypoint: String,
    pub bridge_workdir: String,
    pub sync_timeout_ms: u64,
    pub keep_error_rooms: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("data/orchestrator-state.json"),
            bridge_entrypoint: String::new(),
            bridge_workdir: String::new(),
            sync_timeout_ms: 30_000,
            keep_error_rooms: false,
        }
    }
}

/// `projects[].matrix.*`
#[derive(Debug, Clone, Default)]
pub struct ProjectMatrixConfig {
    pub lobby_room_name: String,
    pub task_room_prefix: String,
}

/// `projects[].spark.work.*`
#[derive(Debug, Clone)]
pub struct WorkVolumeConfig {
    pub volume: String,
    pub mount_path: String,
}

impl Default for WorkVolumeConfig {
    fn default() -> Self {
        Self {
            volume: String::new(),
            mount_path: "/work".into(),
        }
    }
}

/// `projects[].spark.bootstrap.*`
#[derive(Debug, Clone, Default)]
pub struct BootstrapConfig {
    pub script_if_exists: Option<String>,
    pub timeout_sec: u64,
    pub retries: u32,
}

/// `projects[].spark.*`
#[derive(Debug, Clone, Default)]
pub struct SparkConfig {
    pub project: String,
    pub base: String,
    pub main_spark: String,
    pub fork_mode: String,
    pub work: WorkVolumeConfig,
    pub bootstrap: BootstrapConfig,
}

/// One `projects[]` entry.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub key: String,
    pub display_name: String,
    pub repo: String,
    pub default_branch: String,
    pub matrix: ProjectMatrixConfig,
    pub spark: SparkConfig,
}

/// Fully loaded and validated orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub homeserver_url: String,
    pub bot_user_id: String,
    pub auth: AuthMode,
    pub workspace: WorkspaceConfig,
    pub runtime: RuntimeOptions,
    pub projects: Vec<ProjectConfig>,
}

/// Resolve the config file path: `--config` flag, then
/// `MATRIX_ORCHESTRATOR_CONFIG` env var, then `./orchestrator.yaml`.
pub fn resolve_config_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os("MATRIX_ORCHESTRATOR_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("orchestrator.yaml"))
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw, path)
    }

    fn parse(raw: &str, path: &Path) -> Result<Self> {
        let doc = yaml::parse(raw).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;

        let homeserver_url = require_str(&doc, "homeserver_url")?;
        let homeserver_url = normalize_homeserver_url(&homeserver_url);
        let bot_user_id = require_str(&doc, "bot_user_id")?;

        let access_token = doc.get("bot_access_token").and_then(Value::as_str);
        let password = doc.get("bot_password").and_then(Value::as_str);
        let auth = match (access_token, password) {
            (Some(token), None) => AuthMode::AccessToken(token.to_string()),
            (None, Some(pass)) => AuthMode::Password(pass.to_string()),
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(
                    "exactly one of bot_access_token or bot_password must be set, not both".into(),
                )
                .into());
            }
            (None, None) => {
                return Err(ConfigError::Invalid(
                    "one of bot_access_token or bot_password is required".into(),
                )
                .into());
            }
        };

        let workspace = parse_workspace(&doc)?;
        let runtime = parse_runtime(&doc);
        let projects = parse_projects(&doc)?;

        Ok(Config {
            homeserver_url,
            bot_user_id,
            auth,
            workspace,
            runtime,
            projects,
        })
    }
}

fn require_str(doc: &Value, key: &str) -> Result<String> {
    doc.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingKey(key.to_string()).into())
}

fn parse_workspace(doc: &Value) -> Result<WorkspaceConfig> {
    let Some(workspace) = doc.get("workspace") else {
        return Err(ConfigError::MissingKey("workspace".into()).into());
    };
    let name = workspace
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ConfigError::MissingKey("workspace.name".into()))?;
    let topic = workspace
        .get("topic")
        .and_then(Value::as_str)
        .map(str::to_string);
    let team_members = workspace
        .get("team_members")
        .and_then(Value::as_sequence)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(WorkspaceConfig {
        name,
        topic,
        team_members,
    })
}

fn parse_runtime(doc: &Value) -> RuntimeOptions {
    let defaults = RuntimeOptions::default();
    let Some(runtime) = doc.get("runtime") else {
        return defaults;
    };

    RuntimeOptions {
        state_file: runtime
            .get("state_file")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or(defaults.state_file),
        bridge_entrypoint: runtime
            .get("bridge_entrypoint")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(defaults.bridge_entrypoint),
        bridge_workdir: runtime
            .get("bridge_workdir")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(defaults.bridge_workdir),
        sync_timeout_ms: runtime
            .get("sync_timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(defaults.sync_timeout_ms),
        keep_error_rooms: runtime
            .get("keep_error_rooms")
            .and_then(Value::as_bool)
            .unwrap_or(defaults.keep_error_rooms),
    }
}

fn parse_projects(doc: &Value) -> Result<Vec<ProjectConfig>> {
    let Some(projects) = doc.get("projects").and_then(Value::as_sequence) else {
        return Ok(Vec::new());
    };

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(projects.len());
    for entry in projects {
        let key = entry
            .get("key")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ConfigError::MissingKey("projects[].key".into()))?;

        if !seen.insert(key.clone()) {
            return Err(ConfigError::DuplicateProjectKey(key).into());
        }

        let display_name = entry
            .get("display_name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| key.clone());
        let repo = entry
            .get("repo")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default();
        let default_branch = entry
            .get("default_branch")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| "main".to_string());

        let matrix = entry
            .get("matrix")
            .map(|m| ProjectMatrixConfig {
                lobby_room_name: m
                    .get("lobby_room_name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{key}-lobby")),
                task_room_prefix: m
                    .get("task_room_prefix")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{key}-task")),
            })
            .unwrap_or_else(|| ProjectMatrixConfig {
                lobby_room_name: format!("{key}-lobby"),
                task_room_prefix: format!("{key}-task"),
            });

        let spark = parse_spark(&key, entry)?;

        if let Some(services) = entry.get("services").and_then(Value::as_mapping) {
            let enabled: Vec<String> = services
                .iter()
                .filter(|(_, v)| v.get("enabled").and_then(Value::as_bool).unwrap_or(false))
                .map(|(name, _)| name.clone())
                .collect();
            if !enabled.is_empty() {
                return Err(ConfigError::UnsupportedServices {
                    project: key,
                    services: enabled,
                }
                .into());
            }
        }

        out.push(ProjectConfig {
            key,
            display_name,
            repo,
            default_branch,
            matrix,
            spark,
        });
    }

    Ok(out)
}

fn parse_spark(key: &str, entry: &Value) -> Result<SparkConfig> {
    let Some(spark) = entry.get("spark") else {
        return Err(ConfigError::MissingKey(format!("projects[{key}].spark")).into());
    };

    let fork_mode = spark
        .get("fork_mode")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "spark_fork".to_string());
    if fork_mode != "spark_fork" {
        return Err(ConfigError::UnsupportedForkMode(fork_mode).into());
    }

    let work = spark
        .get("work")
        .map(|w| WorkVolumeConfig {
            volume: w
                .get("volume")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default(),
            mount_path: w
                .get("mount_path")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| "/work".to_string()),
        })
        .unwrap_or_default();

    let bootstrap = spark
        .get("bootstrap")
        .map(|b| BootstrapConfig {
            script_if_exists: b
                .get("script_if_exists")
                .and_then(Value::as_str)
                .map(str::to_string),
            timeout_sec: b.get("timeout_sec").and_then(Value::as_u64).unwrap_or(1800),
            retries: b
                .get("retries")
                .and_then(Value::as_u64)
                .unwrap_or(1) as u32,
        })
        .unwrap_or(BootstrapConfig {
            script_if_exists: None,
            timeout_sec: 1800,
            retries: 1,
        });

    Ok(SparkConfig {
        project: spark
            .get("project")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| key.to_string()),
        base: spark
            .get("base")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default(),
        main_spark: spark
            .get("main_spark")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{key}-main")),
        fork_mode,
        work,
        bootstrap,
    })
}

/// Strip trailing slashes/query/fragment and any trailing well-known path
/// suffix (`static`, `client`, or `client/vN`).
fn normalize_homeserver_url(raw: &str) -> String {
    let mut url = raw.trim();
    if let Some(idx) = url.find(['?', '#']) {
        url = &url[..idx];
    }
    let mut url = url.trim_end_matches('/').to_string();

    loop {
        let trimmed = url.trim_end_matches('/');
        let stripped = if let Some(rest) = trimmed.strip_suffix("/_matrix/static") {
            Some(rest)
        } else if let Some(rest) = trimmed.strip_suffix("/_matrix/client") {
            Some(rest)
        } else {
            strip_versioned_client_suffix(trimmed)
        };

        match stripped {
            Some(rest) => url = rest.to_string(),
            None => break,
        }
    }

    url.trim_end_matches('/').to_string()
}

fn strip_versioned_client_suffix(url: &str) -> Option<&str> {
    let rest = url.strip_suffix_after_client_v()?;
    Some(rest)
}

trait StripClientVersion {
    fn strip_suffix_after_client_v(&self) -> Option<&str>;
}

impl StripClientVersion for str {
    fn strip_suffix_after_client_v(&self) -> Option<&str> {
        let idx = self.rfind("/_matrix/client/v")?;
        let suffix = &self[idx + "/_matrix/client/v".len()..];
        if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
            Some(&self[..idx])
        } else {
            None
        }
    }
}

/// Env vars read directly by the orchestrator.
pub fn log_level_from_env() -> String {
    std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_doc() -> String {
        r#"
homeserver_url: "https://matrix.example.org/"
bot_user_id: "@bot:example.org"
bot_access_token: "secret-token"
workspace:
  name: acme
  team_members:
    - "@alice:example.org"
projects:
  - key: rc
    display_name: "Release Candidate"
    repo: git@example.org:rc.git
    matrix:
      lobby_room_name: rc-lobby
    spark:
      project: rc
      base: ubuntu:22.04
      main_spark: rc-main
      work:
        volume: rc-vol
"#
        .to_string()
    }

    #[test]
    fn loads_minimal_config() {
        let config = Config::parse(&minimal_doc(), Path::new("test.yaml")).unwrap();
        assert_eq!(config.homeserver_url, "https://matrix.example.org");
        assert_eq!(config.projects.len(), 1);
        assert_eq!(config.projects[0].key, "rc");
        assert_eq!(config.projects[0].spark.work.mount_path, "/work");
        assert!(matches!(config.auth, AuthMode::AccessToken(ref t) if t == "secret-token"));
    }

    #[test]
    fn rejects_both_auth_modes() {
        let mut doc = minimal_doc();
        doc.push_str("bot_password: \"hunter2\"\n");
        let err = Config::parse(&doc, Path::new("test.yaml")).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn rejects_duplicate_project_keys() {
        let mut doc = minimal_doc();
        doc.push_str(
            "  - key: rc\n    spark:\n      project: rc\n      base: x\n      main_spark: y\n",
        );
        let err = Config::parse(&doc, Path::new("test.yaml")).unwrap_err();
        assert!(err.to_string().contains("duplicate project key"));
    }

    #[test]
    fn rejects_unsupported_fork_mode() {
        let mut doc = minimal_doc();
        doc = doc.replace(
            "spark:\n      project: rc",
            "spark:\n      fork_mode: snapshot\n      project: rc",
        );
        let err = Config::parse(&doc, Path::new("test.yaml")).unwrap_err();
        assert!(err.to_string().contains("unsupported fork_mode"));
    }

    #[test]
    fn normalizes_homeserver_url_suffixes() {
        assert_eq!(
            normalize_homeserver_url("https://matrix.example.org/_matrix/client/v3/"),
            "https://matrix.example.org"
        );
        assert_eq!(
            normalize_homeserver_url("https://matrix.example.org/_matrix/client?x=1"),
            "https://matrix.example.org"
        );
        assert_eq!(
            normalize_homeserver_url("https://matrix.example.org///"),
            "https://matrix.example.org"
        );
    }
}
