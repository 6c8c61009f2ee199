use anyhow::{bail, Context, Result};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use codebot_core::naming::DEFAULT_BRANCH_PREFIX;

pub const DEFAULT_BOT_LOGIN: &str = "codebot-007[bot]";

/// Which intent classifier the workers use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierKind {
    /// Ask the external agent command for a JSON classification.
    Command,
    /// Deterministic keyword rules.
    Keyword,
}

impl FromStr for ClassifierKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" | "command" => Ok(ClassifierKind::Command),
            "keyword" => Ok(ClassifierKind::Keyword),
            other => bail!(
                "CODEBOT_CLASSIFIER must be 'claude' or 'keyword', got '{}'",
                other
            ),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub github_app_id: u64,
    pub github_private_key: String,
    pub github_installation_id: u64,
    /// When unset the webhook endpoint answers 500 for every delivery.
    pub github_webhook_secret: Option<String>,
    pub bot_login: String,
    pub branch_prefix: String,
    pub workspace_root: PathBuf,
    /// Directory for persistent state (SQLite database).
    pub state_dir: PathBuf,
    pub port: u16,
    pub max_workers: usize,
    pub max_queue_size: usize,
    pub poll_interval: Duration,
    pub enable_polling: bool,
    pub reset_poll_times: bool,
    pub processed_retention: Duration,
    pub classifier: ClassifierKind,
    pub agent_command: String,
    /// Run queued automation tasks in this process.
    pub enable_task_runner: bool,
    pub task_interval: Duration,
}

// Secrets are redacted so a config can be logged or shown in a failed test.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("github_app_id", &self.github_app_id)
            .field("github_private_key", &"<redacted>")
            .field("github_installation_id", &self.github_installation_id)
            .field(
                "github_webhook_secret",
                &self.github_webhook_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("bot_login", &self.bot_login)
            .field("branch_prefix", &self.branch_prefix)
            .field("workspace_root", &self.workspace_root)
            .field("state_dir", &self.state_dir)
            .field("port", &self.port)
            .field("max_workers", &self.max_workers)
            .field("max_queue_size", &self.max_queue_size)
            .field("poll_interval", &self.poll_interval)
            .field("enable_polling", &self.enable_polling)
            .field("reset_poll_times", &self.reset_poll_times)
            .field("processed_retention", &self.processed_retention)
            .field("classifier", &self.classifier)
            .field("agent_command", &self.agent_command)
            .field("enable_task_runner", &self.enable_task_runner)
            .field("task_interval", &self.task_interval)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let github_app_id = lookup("GITHUB_APP_ID")
            .context("GITHUB_APP_ID environment variable is required")?
            .parse::<u64>()
            .context("GITHUB_APP_ID must be a valid number")?;

        let github_private_key = lookup("GITHUB_PRIVATE_KEY")
            .context("GITHUB_PRIVATE_KEY environment variable is required")?
            .replace("\\n", "\n");

        let github_installation_id = lookup("GITHUB_APP_INSTALLATION_ID")
            .context("GITHUB_APP_INSTALLATION_ID environment variable is required")?
            .parse::<u64>()
            .context("GITHUB_APP_INSTALLATION_ID must be a valid number")?;

        let github_webhook_secret = parse_optional_secret(lookup("GITHUB_WEBHOOK_SECRET"));

        let bot_login = lookup("CODEBOT_BOT_LOGIN")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BOT_LOGIN.to_string());

        let branch_prefix = lookup("CODEBOT_BRANCH_PREFIX")
            .map(|s| s.trim_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_BRANCH_PREFIX.to_string());

        let workspace_root = lookup("CODEBOT_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./workspaces"));

        let state_dir = lookup("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let max_workers = lookup("CODEBOT_MAX_WORKERS")
            .unwrap_or_else(|| "1".to_string())
            .parse::<usize>()
            .context("CODEBOT_MAX_WORKERS must be a valid number")?;
        if max_workers == 0 {
            bail!("CODEBOT_MAX_WORKERS must be at least 1");
        }

        let max_queue_size = lookup("CODEBOT_MAX_QUEUE_SIZE")
            .unwrap_or_else(|| "100".to_string())
            .parse::<usize>()
            .context("CODEBOT_MAX_QUEUE_SIZE must be a valid number")?;
        if max_queue_size == 0 {
            bail!("CODEBOT_MAX_QUEUE_SIZE must be at least 1");
        }

        let poll_interval_secs = lookup("CODEBOT_POLL_INTERVAL")
            .unwrap_or_else(|| "300".to_string())
            .parse::<u64>()
            .context("CODEBOT_POLL_INTERVAL must be a valid number")?;
        if poll_interval_secs == 0 {
            bail!("CODEBOT_POLL_INTERVAL must be at least 1");
        }

        let enable_polling = parse_flag(lookup("CODEBOT_ENABLE_POLLING"), true);
        let reset_poll_times = parse_flag(lookup("CODEBOT_RESET_POLL_TIMES"), false);

        let retention_secs = lookup("CODEBOT_PROCESSED_RETENTION")
            .unwrap_or_else(|| "604800".to_string())
            .parse::<u64>()
            .context("CODEBOT_PROCESSED_RETENTION must be a valid number")?;

        let classifier = lookup("CODEBOT_CLASSIFIER")
            .unwrap_or_else(|| "claude".to_string())
            .parse::<ClassifierKind>()?;

        let agent_command = lookup("CODEBOT_AGENT_COMMAND")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "claude".to_string());

        let enable_task_runner = parse_flag(lookup("CODEBOT_ENABLE_TASK_RUNNER"), true);

        let task_interval_secs = lookup("CODEBOT_TASK_INTERVAL")
            .unwrap_or_else(|| "30".to_string())
            .parse::<u64>()
            .context("CODEBOT_TASK_INTERVAL must be a valid number")?;
        if task_interval_secs == 0 {
            bail!("CODEBOT_TASK_INTERVAL must be at least 1");
        }

        Ok(Config {
            github_app_id,
            github_private_key,
            github_installation_id,
            github_webhook_secret,
            bot_login,
            branch_prefix,
            workspace_root,
            state_dir,
            port,
            max_workers,
            max_queue_size,
            poll_interval: Duration::from_secs(poll_interval_secs),
            enable_polling,
            reset_poll_times,
            processed_retention: Duration::from_secs(retention_secs),
            classifier,
            agent_command,
            enable_task_runner,
            task_interval: Duration::from_secs(task_interval_secs),
        })
    }
}

/// An empty or whitespace-only secret counts as unset, so it can never
/// validate a signature.
pub fn parse_optional_secret(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Accepts the usual truthy spellings; anything else falls back to `default`.
fn parse_flag(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn required() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("GITHUB_APP_ID", "12"),
            ("GITHUB_PRIVATE_KEY", "-----BEGIN KEY-----\\nabc\\n-----END KEY-----"),
            ("GITHUB_APP_INSTALLATION_ID", "34"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<Config> {
        Config::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults() {
        let config = load(&required()).unwrap();
        assert_eq!(config.github_app_id, 12);
        assert_eq!(config.github_installation_id, 34);
        assert!(config.github_private_key.contains("\nabc\n"));
        assert_eq!(config.github_webhook_secret, None);
        assert_eq!(config.bot_login, "codebot-007[bot]");
        assert_eq!(config.branch_prefix, "u/codebot");
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_workers, 1);
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.poll_interval, Duration::from_secs(300));
        assert!(config.enable_polling);
        assert!(!config.reset_poll_times);
        assert_eq!(config.processed_retention, Duration::from_secs(604_800));
        assert_eq!(config.classifier, ClassifierKind::Command);
        assert_eq!(config.agent_command, "claude");
        assert!(config.enable_task_runner);
        assert_eq!(config.task_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut vars = required();
        vars.insert("GITHUB_WEBHOOK_SECRET", "s3cret");
        let rendered = format!("{:?}", load(&vars).unwrap());

        assert!(rendered.contains("github_app_id: 12"));
        assert!(!rendered.contains("s3cret"));
        assert!(!rendered.contains("BEGIN KEY"));
    }

    #[test]
    fn test_missing_required_variable() {
        let mut vars = required();
        vars.remove("GITHUB_APP_INSTALLATION_ID");
        let err = load(&vars).unwrap_err();
        assert!(err
            .to_string()
            .contains("GITHUB_APP_INSTALLATION_ID environment variable is required"));
    }

    #[test]
    fn test_invalid_number() {
        let mut vars = required();
        vars.insert("PORT", "eighty");
        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("PORT must be a valid number"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut vars = required();
        vars.insert("CODEBOT_MAX_WORKERS", "0");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_overrides() {
        let mut vars = required();
        vars.insert("GITHUB_WEBHOOK_SECRET", "s3cret");
        vars.insert("CODEBOT_BRANCH_PREFIX", "/bots/helper/");
        vars.insert("CODEBOT_ENABLE_POLLING", "false");
        vars.insert("CODEBOT_RESET_POLL_TIMES", "yes");
        vars.insert("CODEBOT_CLASSIFIER", "keyword");
        vars.insert("CODEBOT_MAX_WORKERS", "4");
        vars.insert("CODEBOT_ENABLE_TASK_RUNNER", "off");
        vars.insert("CODEBOT_TASK_INTERVAL", "5");

        let config = load(&vars).unwrap();
        assert_eq!(config.github_webhook_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.branch_prefix, "bots/helper");
        assert!(!config.enable_polling);
        assert!(config.reset_poll_times);
        assert_eq!(config.classifier, ClassifierKind::Keyword);
        assert_eq!(config.max_workers, 4);
        assert!(!config.enable_task_runner);
        assert_eq!(config.task_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_parse_optional_secret() {
        assert_eq!(parse_optional_secret(None), None);
        assert_eq!(parse_optional_secret(Some("".to_string())), None);
        assert_eq!(parse_optional_secret(Some("  \t".to_string())), None);
        assert_eq!(
            parse_optional_secret(Some("  token  ".to_string())),
            Some("  token  ".to_string())
        );
    }

    #[test]
    fn test_unknown_classifier_rejected() {
        let mut vars = required();
        vars.insert("CODEBOT_CLASSIFIER", "oracle");
        assert!(load(&vars).is_err());
    }
}
