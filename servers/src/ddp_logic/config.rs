use clap::Parser;
use lib_ddp::error::ConfigError;
use lib_ddp::{ConnectionConfig, PermanentDisconnectPolicy, StartMode, SubscriptionSpec, TriggerConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "server_ddp.conf";

/// A subscription given on the command line (`name` or `name=<JSON array>`)
/// or in the config file (a bare name or `{"name": .., "params": [..]}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubscriptionArg {
    Name(String),
    Spec(SubscriptionSpec),
}

impl FromStr for SubscriptionArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((name, params)) = s.split_once('=') else {
            return Ok(SubscriptionArg::Name(s.trim().to_string()));
        };
        let params: Vec<Value> = serde_json::from_str(params)
            .map_err(|e| format!("params of subscription '{}' must be a JSON array: {}", name, e))?;
        Ok(SubscriptionArg::Spec(SubscriptionSpec { name: name.trim().to_string(), params }))
    }
}

impl From<SubscriptionArg> for SubscriptionSpec {
    fn from(arg: SubscriptionArg) -> Self {
        match arg {
            SubscriptionArg::Name(name) => SubscriptionSpec::new(name),
            SubscriptionArg::Spec(spec) => spec,
        }
    }
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "DDP (Meteor) trigger: streams collection changes as JSON lines", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "DDP_URL", help = "Meteor server URL (http, https, ws or wss).")]
    pub url: Option<String>,

    #[clap(
        long = "subscription",
        env = "DDP_SUBSCRIPTIONS",
        value_delimiter = ';',
        help = "Publication to subscribe to, as name or name=<JSON params>. Repeatable."
    )]
    pub subscriptions: Option<Vec<SubscriptionArg>>,

    #[clap(
        long = "collection",
        env = "DDP_COLLECTIONS",
        value_delimiter = ',',
        help = "Collection to emit changes and snapshots for. Repeatable."
    )]
    pub collections: Option<Vec<String>>,

    #[clap(long, env = "DDP_RECONNECT", help = "Reconnect automatically after a lost connection (true/false).")]
    pub reconnect: Option<bool>,

    #[clap(long, env = "DDP_RECONNECT_DELAY_MS", help = "Flat delay in milliseconds between reconnect attempts.")]
    pub reconnect_delay_ms: Option<u64>,

    #[clap(long, env = "DDP_CONNECT_TIMEOUT_MS", help = "Bound in milliseconds on the initial connect.")]
    pub connect_timeout_ms: Option<u64>,

    #[clap(
        long,
        env = "DDP_ON_PERMANENT_DISCONNECT",
        help = "What a pending fetch does once the connection is lost for good (fail or hang)."
    )]
    pub on_permanent_disconnect: Option<PermanentDisconnectPolicy>,

    #[clap(long, env = "DDP_WAIT_CONNECTED", help = "Wait for the first connection before reading commands (true/false).")]
    pub wait_connected: Option<bool>,

    #[clap(long, env = "DDP_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "DDP_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "DDP_LOG_LEVEL", help = "Logging level or filter directive (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,
}

impl Config {
    // 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            url: other.url.or(self.url),
            subscriptions: other.subscriptions.or(self.subscriptions),
            collections: other.collections.or(self.collections),
            reconnect: other.reconnect.or(self.reconnect),
            reconnect_delay_ms: other.reconnect_delay_ms.or(self.reconnect_delay_ms),
            connect_timeout_ms: other.connect_timeout_ms.or(self.connect_timeout_ms),
            on_permanent_disconnect: other.on_permanent_disconnect.or(self.on_permanent_disconnect),
            wait_connected: other.wait_connected.or(self.wait_connected),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
        }
    }

    fn defaults() -> Config {
        Config {
            reconnect: Some(true),
            reconnect_delay_ms: Some(5_000),
            connect_timeout_ms: Some(300_000),
            on_permanent_disconnect: Some(PermanentDisconnectPolicy::Fail),
            wait_connected: Some(false),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            ..Default::default()
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// Validates the merged settings into the client configuration.
    pub fn trigger_config(&self) -> Result<TriggerConfig, ConfigError> {
        let url = self.url.as_deref().unwrap_or_default();
        let defaults = ConnectionConfig::new(url)?;
        let connection = defaults
            .clone()
            .with_reconnect(
                self.reconnect.unwrap_or(defaults.reconnect_enabled),
                self.reconnect_delay_ms.map(Duration::from_millis).unwrap_or(defaults.reconnect_delay),
            )
            .with_connect_timeout(self.connect_timeout_ms.map(Duration::from_millis).unwrap_or(defaults.connect_timeout))
            .with_permanent_disconnect(self.on_permanent_disconnect.unwrap_or_default());

        let mut config = TriggerConfig::new(connection);
        for sub in self.subscriptions.iter().flatten() {
            config = config.subscribe(sub.clone().into());
        }
        for name in self.collections.iter().flatten() {
            config = config.collection(name.as_str());
        }
        if self.wait_connected.unwrap_or(false) {
            config = config.with_start_mode(StartMode::WaitConnected);
        }
        Ok(config)
    }
}

/// Reads a JSON config file.
fn read_config_file(path: &Path) -> Result<Config, ConfigError> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// # Load Config
///
/// ## Workflow:
/// 1. Built-in defaults.
/// 2. The JSON config file (`--config-path`, default `server_ddp.conf`) if it exists.
/// 3. Environment variables and command-line flags.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(Config::parse())
}

/// [`load_config`] with already parsed command-line input.
pub fn load_config_from(cli: Config) -> Result<Config, ConfigError> {
    let config_file_path = cli.config_path.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current = Config::defaults();
    if config_file_path.exists() {
        current = current.merge(read_config_file(&config_file_path)?);
    } else if cli.config_path.is_some() {
        // An explicitly named file must exist.
        return Err(ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("config file not found: {}", config_file_path.display()),
        )));
    }

    Ok(current.merge(cli))
}
