//! Configuration file management for actprobe.
//!
//! Provides a TOML-based config file at `~/.config/actprobe/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use actprobe_core::readiness::{ProbePolicy, ReadinessPolicy};
use actprobe_core::session::SessionConfig;
use actprobe_core::supervisor::LaunchSpec;
use actprobe_core::workflow::{ConflictClassifier, WorkflowParams};

/// Env var overriding the target command line.
pub const ENV_TARGET_COMMAND: &str = "ACTPROBE_TARGET_COMMAND";
/// Env var overriding the database URL handed to the target.
pub const ENV_DATABASE_URL: &str = "ACTPROBE_DATABASE_URL";
/// Env var overriding the master key handed to the target.
pub const ENV_MASTER_KEY: &str = "ACTPROBE_MASTER_KEY";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub target: TargetSection,
    pub workflow: WorkflowSection,
    pub timing: TimingSection,
    pub conflicts: ConflictClassifier,
}

/// How to launch the action service and what to hand it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSection {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Ambient variables the target may inherit from the harness.
    pub inherit_env: Vec<String>,
    pub database_url: String,
    /// Hex-encoded master key (64 hex chars = 32 bytes).
    pub master_key: Option<String>,
    pub log_level: String,
    pub database_url_var: String,
    pub master_key_var: String,
    pub log_level_var: String,
    /// Extra variables set on the target verbatim.
    pub env: BTreeMap<String, String>,
}

impl Default for TargetSection {
    fn default() -> Self {
        Self {
            command: "cargo".to_string(),
            args: ["run", "-q", "-p", "openact-stdio"]
                .into_iter()
                .map(String::from)
                .collect(),
            working_dir: None,
            inherit_env: ["PATH", "HOME", "CARGO_HOME", "RUSTUP_HOME"]
                .into_iter()
                .map(String::from)
                .collect(),
            database_url: "sqlite:./data/openact.db".to_string(),
            master_key: None,
            log_level: "info".to_string(),
            database_url_var: "OPENACT_DATABASE_URL".to_string(),
            master_key_var: "OPENACT_MASTER_KEY".to_string(),
            log_level_var: "RUST_LOG".to_string(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    pub tenant: String,
    pub provider: String,
    pub action_name: String,
    pub config_path: String,
    pub user_id: String,
    pub access_token: String,
    pub execution_limit: u32,
    pub execution_offset: u32,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        let p = WorkflowParams::default();
        Self {
            tenant: p.tenant,
            provider: p.provider,
            action_name: p.action_name,
            config_path: p.config_path,
            user_id: p.user_id,
            access_token: p.access_token,
            execution_limit: p.execution_limit,
            execution_offset: p.execution_offset,
        }
    }
}

impl From<WorkflowSection> for WorkflowParams {
    fn from(w: WorkflowSection) -> Self {
        Self {
            tenant: w.tenant,
            provider: w.provider,
            action_name: w.action_name,
            config_path: w.config_path,
            user_id: w.user_id,
            access_token: w.access_token,
            reset_action: false,
            execution_limit: w.execution_limit,
            execution_offset: w.execution_offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessMode {
    /// Sleep for `startup_delay_ms`, then start the workflow.
    Fixed,
    /// Probe with `health` until the target answers.
    #[default]
    Probe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub readiness: ReadinessMode,
    pub startup_delay_ms: u64,
    pub probe_attempt_timeout_ms: u64,
    pub probe_initial_backoff_ms: u64,
    pub probe_max_backoff_ms: u64,
    pub probe_deadline_secs: u64,
    /// Per-call receive timeout; 0 waits forever.
    pub call_timeout_secs: u64,
    pub stop_grace_secs: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        let probe = ProbePolicy::default();
        Self {
            readiness: ReadinessMode::Probe,
            startup_delay_ms: 2000,
            probe_attempt_timeout_ms: probe.attempt_timeout.as_millis() as u64,
            probe_initial_backoff_ms: probe.initial_backoff.as_millis() as u64,
            probe_max_backoff_ms: probe.max_backoff.as_millis() as u64,
            probe_deadline_secs: probe.deadline.as_secs(),
            call_timeout_secs: 30,
            stop_grace_secs: 5,
        }
    }
}

impl TimingSection {
    fn readiness_policy(&self) -> ReadinessPolicy {
        match self.readiness {
            ReadinessMode::Fixed => {
                ReadinessPolicy::FixedDelay(Duration::from_millis(self.startup_delay_ms))
            }
            ReadinessMode::Probe => ReadinessPolicy::Probe(ProbePolicy {
                attempt_timeout: Duration::from_millis(self.probe_attempt_timeout_ms),
                initial_backoff: Duration::from_millis(self.probe_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.probe_max_backoff_ms),
                deadline: Duration::from_secs(self.probe_deadline_secs),
                ..ProbePolicy::default()
            }),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the actprobe config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/actprobe` or
/// `~/.config/actprobe`, never the platform-specific `dirs::config_dir()`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("actprobe");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("actprobe")
}

/// Return the default path to the actprobe config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file at `path`.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    // The file holds the master key.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Master key generation
// -----------------------------------------------------------------------

/// Generate a random master key: 32 random bytes, hex-encoded (64 chars).
pub fn generate_master_key() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line, highest precedence.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub target: Option<String>,
    pub database_url: Option<String>,
}

/// Fully resolved configuration, ready for a session.
#[derive(Debug)]
pub struct ProbeConfig {
    pub session: SessionConfig,
    pub params: WorkflowParams,
    pub classifier: ConflictClassifier,
}

impl ProbeConfig {
    /// Resolve from the config file at `path` (if present) and the process
    /// environment.
    pub fn resolve(path: &Path, cli: &CliOverrides) -> Result<Self> {
        let file = if path.exists() {
            Some(load_config(path)?)
        } else {
            None
        };
        Self::resolve_with(file, cli, |name| std::env::var(name).ok())
    }

    /// Resolve using the chain: CLI flag > env var > config file > default.
    ///
    /// - Target: `cli.target` > `ACTPROBE_TARGET_COMMAND` > `target.command` + `target.args`
    /// - DB URL: `cli.database_url` > `ACTPROBE_DATABASE_URL` > `target.database_url`
    /// - Master key: `ACTPROBE_MASTER_KEY` > `target.master_key` > error
    pub fn resolve_with<F>(file: Option<ConfigFile>, cli: &CliOverrides, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let have_file = file.is_some();
        let ConfigFile {
            target,
            workflow,
            timing,
            conflicts,
        } = file.unwrap_or_default();

        let (program, args) = match cli.target.clone().or_else(|| env(ENV_TARGET_COMMAND)) {
            Some(line) => split_command(&line)?,
            None => (target.command.clone(), target.args.clone()),
        };
        if program.trim().is_empty() {
            bail!("target command is empty");
        }

        let database_url = cli
            .database_url
            .clone()
            .or_else(|| env(ENV_DATABASE_URL))
            .unwrap_or_else(|| target.database_url.clone());

        let Some(master_key) = env(ENV_MASTER_KEY).or_else(|| target.master_key.clone()) else {
            if have_file {
                bail!("master key not found; set {ENV_MASTER_KEY} or add target.master_key to the config file");
            }
            bail!(
                "master key not found; set {ENV_MASTER_KEY} or run `actprobe init` to create a config file"
            );
        };

        let mut launch = LaunchSpec::new(program)
            .args(args)
            .inherit_env(target.inherit_env.iter().cloned());
        for (key, value) in &target.env {
            launch = launch.env(key.as_str(), value.as_str());
        }
        launch = launch
            .env(target.database_url_var.as_str(), database_url)
            .env(target.master_key_var.as_str(), master_key)
            .env(target.log_level_var.as_str(), target.log_level.as_str());
        if let Some(dir) = &target.working_dir {
            launch = launch.working_dir(dir);
        }

        let session = SessionConfig {
            readiness: timing.readiness_policy(),
            call_timeout: (timing.call_timeout_secs > 0)
                .then(|| Duration::from_secs(timing.call_timeout_secs)),
            stop_grace: Duration::from_secs(timing.stop_grace_secs),
            ..SessionConfig::new(launch)
        };

        Ok(Self {
            session,
            params: workflow.into(),
            classifier: conflicts,
        })
    }
}

/// Split a whitespace-separated command line into program and arguments.
fn split_command(line: &str) -> Result<(String, Vec<String>)> {
    let mut words = line.split_whitespace().map(String::from);
    let Some(program) = words.next() else {
        bail!("target command is empty");
    };
    Ok((program, words.collect()))
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55";

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn file_with_key() -> ConfigFile {
        let mut cfg = ConfigFile::default();
        cfg.target.master_key = Some(KEY.to_string());
        cfg
    }

    #[test]
    fn generate_master_key_is_64_hex_chars() {
        let key = generate_master_key();
        assert_eq!(key.len(), 64);
        assert!(
            key.chars().all(|c| c.is_ascii_hexdigit()),
            "expected all hex digits, got: {key}"
        );
    }

    #[test]
    fn generate_master_key_is_random() {
        assert_ne!(generate_master_key(), generate_master_key());
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("actprobe").join("config.toml");

        let mut original = file_with_key();
        original.target.env.insert("EXTRA".into(), "1".into());
        original.workflow.tenant = "acme".into();
        original.timing.readiness = ReadinessMode::Fixed;
        original.conflicts.codes = vec![-32010];
        save_config(&original, &path).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.target.master_key.as_deref(), Some(KEY));
        assert_eq!(loaded.target.env.get("EXTRA").map(String::as_str), Some("1"));
        assert_eq!(loaded.workflow.tenant, "acme");
        assert_eq!(loaded.timing.readiness, ReadinessMode::Fixed);
        assert_eq!(loaded.conflicts, original.conflicts);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        save_config(&file_with_key(), &path).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let cfg: ConfigFile = toml::from_str(
            r#"
            [target]
            master_key = "abc"

            [workflow]
            tenant = "acme"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.target.command, "cargo");
        assert_eq!(cfg.workflow.tenant, "acme");
        assert_eq!(cfg.workflow.provider, "github");
        assert_eq!(cfg.timing.call_timeout_secs, 30);
        assert_eq!(cfg.conflicts, ConflictClassifier::default());
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let env = env_from(&[
            (ENV_TARGET_COMMAND, "/env/target --env"),
            (ENV_DATABASE_URL, "sqlite:env.db"),
        ]);
        let cli = CliOverrides {
            target: Some("/cli/target --serve stdio".into()),
            database_url: Some("sqlite:cli.db".into()),
        };

        let resolved = ProbeConfig::resolve_with(Some(file_with_key()), &cli, env).unwrap();
        let launch = &resolved.session.launch;
        assert_eq!(launch.program, "/cli/target");
        assert_eq!(launch.args, ["--serve", "stdio"]);
        assert_eq!(launch.env["OPENACT_DATABASE_URL"], "sqlite:cli.db");
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let env = env_from(&[
            (ENV_TARGET_COMMAND, "/env/target"),
            (ENV_DATABASE_URL, "sqlite:env.db"),
            (ENV_MASTER_KEY, "from-env"),
        ]);

        let resolved =
            ProbeConfig::resolve_with(Some(file_with_key()), &CliOverrides::default(), env)
                .unwrap();
        let launch = &resolved.session.launch;
        assert_eq!(launch.program, "/env/target");
        assert!(launch.args.is_empty());
        assert_eq!(launch.env["OPENACT_DATABASE_URL"], "sqlite:env.db");
        assert_eq!(launch.env["OPENACT_MASTER_KEY"], "from-env");
    }

    #[test]
    fn resolve_uses_file_and_defaults_when_nothing_else_is_set() {
        let resolved =
            ProbeConfig::resolve_with(Some(file_with_key()), &CliOverrides::default(), env_from(&[]))
                .unwrap();
        let launch = &resolved.session.launch;
        assert_eq!(launch.program, "cargo");
        assert_eq!(launch.args, ["run", "-q", "-p", "openact-stdio"]);
        assert_eq!(launch.env["OPENACT_DATABASE_URL"], "sqlite:./data/openact.db");
        assert_eq!(launch.env["OPENACT_MASTER_KEY"], KEY);
        assert_eq!(launch.env["RUST_LOG"], "info");
        assert!(launch.inherit_env.iter().any(|v| v == "PATH"));
        assert_eq!(resolved.params, WorkflowParams::default());
        assert_eq!(resolved.session.call_timeout, Some(Duration::from_secs(30)));
        assert!(matches!(resolved.session.readiness, ReadinessPolicy::Probe(_)));
    }

    #[test]
    fn resolve_honors_timing_and_custom_env_names() {
        let mut cfg = file_with_key();
        cfg.timing.readiness = ReadinessMode::Fixed;
        cfg.timing.startup_delay_ms = 1500;
        cfg.timing.call_timeout_secs = 0;
        cfg.target.master_key_var = "SERVICE_KEY".into();

        let resolved =
            ProbeConfig::resolve_with(Some(cfg), &CliOverrides::default(), env_from(&[])).unwrap();
        assert_eq!(
            resolved.session.readiness,
            ReadinessPolicy::FixedDelay(Duration::from_millis(1500))
        );
        assert_eq!(resolved.session.call_timeout, None);
        assert_eq!(resolved.session.launch.env["SERVICE_KEY"], KEY);
        assert!(!resolved.session.launch.env.contains_key("OPENACT_MASTER_KEY"));
    }

    #[test]
    fn resolve_errors_when_no_master_key() {
        let err = ProbeConfig::resolve_with(None, &CliOverrides::default(), env_from(&[]))
            .unwrap_err()
            .to_string();
        assert!(err.contains("master key not found"), "unexpected error: {err}");
        assert!(err.contains("actprobe init"), "unexpected error: {err}");
    }

    #[test]
    fn resolve_rejects_blank_target_override() {
        let cli = CliOverrides {
            target: Some("   ".into()),
            ..CliOverrides::default()
        };
        let err = ProbeConfig::resolve_with(Some(file_with_key()), &cli, env_from(&[]))
            .unwrap_err()
            .to_string();
        assert!(err.contains("target command is empty"));
    }

    #[test]
    fn config_path_honors_xdg_config_home() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };

        let path = config_path();

        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }
        assert_eq!(path, tmp.path().join("actprobe").join("config.toml"));
    }
}
