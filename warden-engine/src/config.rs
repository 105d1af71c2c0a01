//! Engine configuration
//!
//! Defines where the engine keeps its state, where projects live, and the
//! timing knobs for cancellation and event delivery.

use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration
///
/// Built once at startup; the security policy it points to is loaded
/// separately and never reloaded.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// sqlx connection URL for the job store
    pub database_url: String,

    /// Directory holding one working tree per project
    pub projects_dir: PathBuf,

    /// Target directory for the built-in deploy commands
    pub deploy_root: PathBuf,

    /// YAML security policy file
    pub policy_path: PathBuf,

    /// Device notifier endpoint; notifications are disabled when unset
    pub notify_url: Option<String>,

    /// File holding the notifier's shared key
    pub notify_key_path: PathBuf,

    /// How long a canceled process gets between the graceful signal and the kill
    pub kill_grace: Duration,

    /// Page size for job listings
    pub list_limit: u32,

    /// Capacity of each job's live event channel
    pub event_buffer: usize,
}

impl EngineConfig {
    /// Creates a configuration with defaults rooted at `projects_dir`
    pub fn new(database_url: String, projects_dir: PathBuf) -> Self {
        Self {
            database_url,
            projects_dir,
            deploy_root: PathBuf::from("/var/www/apps"),
            policy_path: PathBuf::from("/etc/warden/job_policy.yaml"),
            notify_url: None,
            notify_key_path: PathBuf::from("/srv/secrets/origin.key"),
            kill_grace: Duration::from_secs(5),
            list_limit: 50,
            event_buffer: 256,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Every variable is optional:
    /// - WARDEN_DB_URL (default: sqlite://warden.db?mode=rwc)
    /// - WARDEN_PROJECTS_DIR (default: /srv/projects)
    /// - WARDEN_DEPLOY_ROOT (default: /var/www/apps)
    /// - WARDEN_POLICY_PATH (default: /etc/warden/job_policy.yaml)
    /// - WARDEN_NOTIFY_URL (default: unset)
    /// - WARDEN_NOTIFY_KEY_PATH (default: /srv/secrets/origin.key)
    /// - WARDEN_KILL_GRACE_SECS (default: 5)
    /// - WARDEN_LIST_LIMIT (default: 50)
    /// - WARDEN_EVENT_BUFFER (default: 256)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("WARDEN_DB_URL") {
            config.database_url = url;
        }
        if let Ok(dir) = std::env::var("WARDEN_PROJECTS_DIR") {
            config.projects_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("WARDEN_DEPLOY_ROOT") {
            config.deploy_root = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("WARDEN_POLICY_PATH") {
            config.policy_path = PathBuf::from(path);
        }
        config.notify_url = std::env::var("WARDEN_NOTIFY_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());
        if let Ok(path) = std::env::var("WARDEN_NOTIFY_KEY_PATH") {
            config.notify_key_path = PathBuf::from(path);
        }

        config.kill_grace = std::env::var("WARDEN_KILL_GRACE_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(config.kill_grace);

        config.list_limit = std::env::var("WARDEN_LIST_LIMIT")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(config.list_limit);

        config.event_buffer = std::env::var("WARDEN_EVENT_BUFFER")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(config.event_buffer);

        config
    }

    /// Sets the notifier endpoint
    pub fn with_notify_url(mut self, url: impl Into<String>) -> Self {
        self.notify_url = Some(url.into());
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.is_empty() {
            anyhow::bail!("database_url cannot be empty");
        }

        if !self.database_url.starts_with("sqlite:") {
            anyhow::bail!("database_url must be a sqlite: URL");
        }

        if self.projects_dir.as_os_str().is_empty() {
            anyhow::bail!("projects_dir cannot be empty");
        }

        if let Some(url) = &self.notify_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("notify_url must start with http:// or https://");
            }
        }

        if self.list_limit == 0 {
            anyhow::bail!("list_limit must be greater than 0");
        }

        if self.event_buffer == 0 {
            anyhow::bail!("event_buffer must be greater than 0");
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(
            "sqlite://warden.db?mode=rwc".to_string(),
            PathBuf::from("/srv/projects"),
        )
    }
}
