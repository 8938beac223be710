use std::path::PathBuf;
use std::time::Duration;

use autosave_core::AutoSaveConfig;
use autosave_local::LocalFileStore;
use clap::{Parser, Subcommand, ValueEnum};

/// Configuration for the autosave command-line session.
#[derive(Parser, Debug, Clone)]
#[command(name = "autosave-cli")]
#[command(about = "Autosave JSON records to a remote store with local crash recovery")]
pub struct Config {
    /// Base URL of the remote record store
    #[arg(long, default_value = "http://localhost:8080", env = "AUTOSAVE_REMOTE_URL")]
    pub remote_url: String,

    /// Bearer token sent to the remote store
    #[arg(long, env = "AUTOSAVE_API_TOKEN")]
    pub api_token: Option<String>,

    /// Storage key of the record being edited
    #[arg(long, env = "AUTOSAVE_KEY")]
    pub key: String,

    /// Directory for recovery snapshots and the offline queue
    /// (defaults to the platform data directory)
    #[arg(long, env = "AUTOSAVE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Quiet period after the last edit before saving
    #[arg(long, default_value = "1000", env = "AUTOSAVE_DEBOUNCE_MS")]
    pub debounce_ms: u64,

    /// Attempts per save before it is queued
    #[arg(long, default_value = "3", env = "AUTOSAVE_MAX_RETRIES")]
    pub max_retries: u32,

    /// Delay before the first retry, doubled for each further one
    #[arg(long, default_value = "1000", env = "AUTOSAVE_RETRY_DELAY_MS")]
    pub retry_delay_ms: u64,

    /// Upper bound for the retry delay
    #[arg(long, default_value = "30000", env = "AUTOSAVE_MAX_RETRY_DELAY_MS")]
    pub max_retry_delay_ms: u64,

    /// Do not keep a local recovery snapshot
    #[arg(long, env = "AUTOSAVE_NO_LOCAL_BACKUP")]
    pub no_local_backup: bool,

    /// Save without If-Match version checks
    #[arg(long, env = "AUTOSAVE_NO_CONFLICT_DETECTION")]
    pub no_conflict_detection: bool,

    /// Timeout for one HTTP request
    #[arg(long, default_value = "30", env = "AUTOSAVE_HTTP_TIMEOUT_SECS")]
    pub http_timeout_secs: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read JSON records from stdin, one per line, and autosave them.
    ///
    /// Lines `:save`, `:status`, `:offline` and `:online` control the session.
    Edit {
        /// How to merge when the remote copy changed underneath
        #[arg(long, value_enum, default_value_t = MergeStrategy::Manual)]
        merge: MergeStrategy,
    },
    /// Print the recovery snapshot and queued saves left by an earlier session
    Recover,
    /// Replay queued saves to the remote store
    Replay,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Stop and report the conflict
    Manual,
    /// Top-level fields of the local record win over the remote ones
    Shallow,
    /// Keep the local record as is
    Local,
}

impl Config {
    pub fn autosave_config(&self) -> AutoSaveConfig {
        AutoSaveConfig::default()
            .with_debounce(Duration::from_millis(self.debounce_ms))
            .with_max_retries(self.max_retries)
            .with_retry_delay(
                Duration::from_millis(self.retry_delay_ms),
                Duration::from_millis(self.max_retry_delay_ms),
            )
            .with_local_backup(!self.no_local_backup)
            .with_conflict_detection(!self.no_conflict_detection)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(LocalFileStore::default_root)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_library_defaults() {
        let config = Config::try_parse_from(["autosave-cli", "--key", "doc-1", "replay"]).unwrap();

        assert_eq!(config.autosave_config(), AutoSaveConfig::default());
        assert_eq!(config.command, Command::Replay);
        assert_eq!(config.http_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = Config::try_parse_from([
            "autosave-cli",
            "--key",
            "doc-1",
            "--debounce-ms",
            "250",
            "--max-retries",
            "5",
            "--no-local-backup",
            "--data-dir",
            "/tmp/autosave-test",
            "edit",
            "--merge",
            "shallow",
        ])
        .unwrap();

        let autosave = config.autosave_config();
        assert_eq!(autosave.debounce, Duration::from_millis(250));
        assert_eq!(autosave.max_retries, 5);
        assert!(!autosave.enable_local_backup);
        assert!(autosave.enable_conflict_detection);
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/autosave-test"));
        assert_eq!(
            config.command,
            Command::Edit {
                merge: MergeStrategy::Shallow
            }
        );
    }

    #[test]
    fn test_key_required() {
        assert!(Config::try_parse_from(["autosave-cli", "recover"]).is_err());
    }
}
