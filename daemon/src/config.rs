use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use overture_events::AgentKind;

/// Overture daemon - per-project AI CLI orchestration and event streaming
#[derive(Parser, Debug)]
#[command(name = "overture-daemon")]
pub struct Args {
    /// Bind address
    #[arg(long, default_value = "127.0.0.1:4870")]
    pub listen: String,

    /// Auth token checked at WebSocket join (or set OVERTURE_DAEMON_TOKEN)
    #[arg(long, env = "OVERTURE_DAEMON_TOKEN")]
    pub token: Option<String>,

    /// Data directory (projects manifest, transcripts)
    #[arg(long, env = "OVERTURE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Directory holding system prompt markdown files
    #[arg(long, env = "OVERTURE_PROMPTS_DIR")]
    pub prompts_dir: Option<PathBuf>,

    /// Disable auth (dev only)
    #[arg(long)]
    pub insecure_no_auth: bool,

    /// Default total run wall time in seconds
    #[arg(long, env = "OVERTURE_RUN_DEADLINE_SECONDS", default_value_t = 600)]
    pub run_deadline_seconds: u64,

    /// Max silence between run events before timeout, in seconds
    #[arg(long, env = "OVERTURE_STALL_SECONDS", default_value_t = 90)]
    pub stall_seconds: u64,

    /// Events buffered per subscriber before it is disconnected
    #[arg(long, env = "OVERTURE_SUBSCRIBER_QUEUE", default_value_t = 512)]
    pub subscriber_queue_capacity: usize,

    /// Teardown delay after the last subscriber leaves, in seconds
    #[arg(long, env = "OVERTURE_IDLE_LINGER_SECONDS", default_value_t = 30)]
    pub idle_linger_seconds: u64,

    /// Cache duration for CLI availability probes, in seconds
    #[arg(long, env = "OVERTURE_AVAILABILITY_CACHE_SECONDS", default_value_t = 60)]
    pub availability_cache_seconds: u64,

    /// Events replayed on subscribe without an explicit from_seq
    #[arg(long, env = "OVERTURE_HISTORY_REPLAY", default_value_t = 200)]
    pub history_replay: usize,

    /// Agent used by the fallback policy
    #[arg(long, env = "OVERTURE_FALLBACK_AGENT", default_value = "claude")]
    pub fallback_agent: String,

    /// Soft-interrupt to hard-kill window, in seconds
    #[arg(long, env = "OVERTURE_CANCEL_GRACE_SECONDS", default_value_t = 2)]
    pub cancel_grace_seconds: u64,
}

impl Args {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| dirs_data_dir().join("overture"))
    }

    pub fn require_auth(&self) -> bool {
        !self.insecure_no_auth
    }

    pub fn config(&self) -> Result<Config, crate::DaemonError> {
        let fallback_agent: AgentKind = self
            .fallback_agent
            .parse()
            .map_err(|e| crate::DaemonError::Config(format!("--fallback-agent: {e}")))?;
        Ok(Config {
            default_run_deadline: Duration::from_secs(self.run_deadline_seconds),
            default_stall: Duration::from_secs(self.stall_seconds),
            subscriber_queue_capacity: self.subscriber_queue_capacity,
            idle_linger: Duration::from_secs(self.idle_linger_seconds),
            availability_cache: Duration::from_secs(self.availability_cache_seconds),
            history_replay: self.history_replay,
            fallback_agent,
            cancel_grace: Duration::from_secs(self.cancel_grace_seconds),
        })
    }
}

fn dirs_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(".local/share"))
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Process-scoped knobs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub default_run_deadline: Duration,
    pub default_stall: Duration,
    pub subscriber_queue_capacity: usize,
    pub idle_linger: Duration,
    pub availability_cache: Duration,
    pub history_replay: usize,
    pub fallback_agent: AgentKind,
    pub cancel_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_run_deadline: Duration::from_secs(600),
            default_stall: Duration::from_secs(90),
            subscriber_queue_capacity: 512,
            idle_linger: Duration::from_secs(30),
            availability_cache: Duration::from_secs(60),
            history_replay: 200,
            fallback_agent: AgentKind::Claude,
            cancel_grace: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_defaults_match_config_defaults() {
        let args = Args::parse_from(["overture-daemon"]);
        let config = args.config().expect("config should build");
        let defaults = Config::default();
        assert_eq!(config.default_run_deadline, defaults.default_run_deadline);
        assert_eq!(config.default_stall, defaults.default_stall);
        assert_eq!(
            config.subscriber_queue_capacity,
            defaults.subscriber_queue_capacity
        );
        assert_eq!(config.idle_linger, defaults.idle_linger);
        assert_eq!(config.availability_cache, defaults.availability_cache);
        assert_eq!(config.history_replay, defaults.history_replay);
        assert_eq!(config.fallback_agent, AgentKind::Claude);
        assert_eq!(config.cancel_grace, defaults.cancel_grace);
    }

    #[test]
    fn fallback_agent_parses_from_flag() {
        let args = Args::parse_from(["overture-daemon", "--fallback-agent", "codex"]);
        assert_eq!(
            args.config().expect("config should build").fallback_agent,
            AgentKind::Codex
        );
    }

    #[test]
    fn unknown_fallback_agent_is_rejected() {
        let args = Args::parse_from(["overture-daemon", "--fallback-agent", "copilot"]);
        assert!(args.config().is_err());
    }
}
