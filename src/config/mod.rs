//! Configuration management module
//!
//! Handles loading, validation, and management of application configuration.

use anyhow::{Context, Result};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;

/// Longest text the chat service accepts in one message
pub const MAX_MESSAGE_CHARS_LIMIT: usize = 4096;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Logging level
    pub log_level: String,

    /// File-based logging configuration
    pub log: LogConfig,

    /// Interpreter launched for every chat
    pub interpreter: InterpreterConfig,

    /// Session lifecycle timings
    pub session: SessionConfig,

    /// Telegram Bot API configuration
    pub telegram: TelegramConfig,

    /// Input filtering configuration
    pub sanitizer: SanitizerConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Executable name or path
    pub program: String,

    /// Arguments passed to the interpreter
    pub args: Vec<String>,

    /// Extra environment variables for the interpreter
    pub env: BTreeMap<String, String>,

    /// Appended to forwarded code that does not already end with it
    pub statement_terminator: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which a session is reaped
    pub inactivity_timeout_secs: u64,

    /// Time between reaper sweeps
    pub reap_interval_secs: u64,

    /// Time between output flushes
    pub flush_interval_ms: u64,

    /// Wait between SIGTERM and SIGKILL
    pub terminate_grace_ms: u64,

    /// Upper bound on waiting for a session's tasks while closing
    pub close_wait_ms: u64,

    /// Give up on writing to an interpreter that stopped reading input
    pub write_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Bot API base URL
    pub api_url: String,

    /// Bot token issued by BotFather
    pub token: String,

    /// Server-side long poll duration
    pub poll_timeout_secs: u64,

    /// HTTP request timeout, must exceed the poll duration
    pub request_timeout_secs: u64,

    /// Longest outbound message before splitting
    pub max_message_chars: usize,

    /// First retry delay for failed requests
    pub retry_initial_interval_ms: u64,

    /// Retry delay ceiling
    pub retry_max_interval_ms: u64,

    /// Give up on an outbound message after this long
    pub send_max_elapsed_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SanitizerConfig {
    /// Command that carries code to the interpreter
    pub code_prefix: String,

    /// Ignore plain text instead of forwarding it
    pub require_code_prefix: bool,

    /// Regular expressions that reject a command when they match
    pub denylist: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log file path. Logs go to stderr when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log: LogConfig::default(),
            interpreter: InterpreterConfig::default(),
            session: SessionConfig::default(),
            telegram: TelegramConfig::default(),
            sanitizer: SanitizerConfig::default(),
        }
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            program: "ocaml".to_string(),
            args: vec!["-noprompt".to_string(), "-nopromptcont".to_string()],
            env: BTreeMap::from([("TERM".to_string(), "console".to_string())]),
            statement_terminator: ";;".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 24 * 60 * 60,
            reap_interval_secs: 30 * 60,
            flush_interval_ms: 1000,
            terminate_grace_ms: 2000,
            close_wait_ms: 5000,
            write_timeout_ms: 5000,
        }
    }
}

impl SessionConfig {
    /// Override the inactivity timeout, pulling the reap interval under it
    /// when the old interval would no longer fit. An explicit interval
    /// applied afterwards still wins.
    pub fn set_inactivity_timeout(&mut self, secs: u64) {
        self.inactivity_timeout_secs = secs;
        self.reap_interval_secs = self.reap_interval_secs.min((secs / 2).max(1));
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.telegram.org".to_string(),
            token: String::new(),
            poll_timeout_secs: 120,
            request_timeout_secs: 200,
            max_message_chars: MAX_MESSAGE_CHARS_LIMIT,
            retry_initial_interval_ms: 500,
            retry_max_interval_ms: 30_000,
            send_max_elapsed_secs: 120,
        }
    }
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            code_prefix: "/ml".to_string(),
            require_code_prefix: false,
            denylist: default_denylist(),
        }
    }
}

/// Identifiers and toplevel directives that reach outside the sandbox
pub fn default_denylist() -> Vec<String> {
    [
        r"[Ss]ys",
        r"[Uu]nix",
        r"[Ss]tream",
        r"fork",
        r"exec",
        r"#\s*cd",
        r"#\s*directory",
        r"#\s*install_printer",
        r"fprintf",
        r"input_file",
        r"output_file",
        r"open_in",
        r"open_out",
        r"#\s*use",
        r"#\s*load",
        r"#\s*mod_use",
    ]
    .iter()
    .map(|pattern| pattern.to_string())
    .collect()
}

impl Config {
    /// Load configuration from file with environment variable overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        // Apply environment variable overrides
        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    /// Apply `REPLBOT_*` overrides looked up through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // REPLBOT_LOG_LEVEL - logging level
        if let Some(log_level) = lookup("REPLBOT_LOG_LEVEL") {
            self.log_level = log_level;
        }

        // REPLBOT_LOG_FILE_PATH - logging destination file
        if let Some(file_path) = lookup("REPLBOT_LOG_FILE_PATH") {
            if !file_path.trim().is_empty() {
                self.log.file_path = Some(file_path);
            }
        }

        // REPLBOT_INTERPRETER_PROGRAM - interpreter executable
        if let Some(program) = lookup("REPLBOT_INTERPRETER_PROGRAM") {
            self.interpreter.program = program;
        }

        // REPLBOT_INTERPRETER_ARGS - whitespace-separated arguments
        if let Some(args) = lookup("REPLBOT_INTERPRETER_ARGS") {
            self.interpreter.args = args.split_whitespace().map(str::to_string).collect();
        }

        // Session timings
        if let Some(value) = parse_override(&lookup, "REPLBOT_SESSION_INACTIVITY_TIMEOUT_SECS") {
            self.session.set_inactivity_timeout(value);
        }
        if let Some(value) = parse_override(&lookup, "REPLBOT_SESSION_REAP_INTERVAL_SECS") {
            self.session.reap_interval_secs = value;
        }
        if let Some(value) = parse_override(&lookup, "REPLBOT_SESSION_FLUSH_INTERVAL_MS") {
            self.session.flush_interval_ms = value;
        }
        if let Some(value) = parse_override(&lookup, "REPLBOT_SESSION_WRITE_TIMEOUT_MS") {
            self.session.write_timeout_ms = value;
        }

        // Telegram-specific environment variables
        // REPLBOT_TELEGRAM_TOKEN - bot token
        if let Some(token) = lookup("REPLBOT_TELEGRAM_TOKEN") {
            self.telegram.token = token.trim().to_string();
        }

        // REPLBOT_TELEGRAM_API_URL - Bot API base URL
        if let Some(api_url) = lookup("REPLBOT_TELEGRAM_API_URL") {
            self.telegram.api_url = api_url;
        }

        if let Some(value) = parse_override(&lookup, "REPLBOT_TELEGRAM_POLL_TIMEOUT_SECS") {
            self.telegram.poll_timeout_secs = value;
        }

        // REPLBOT_SANITIZER_REQUIRE_CODE_PREFIX - ignore plain text
        if let Some(require) = parse_override(&lookup, "REPLBOT_SANITIZER_REQUIRE_CODE_PREFIX") {
            self.sanitizer.require_code_prefix = require;
        }
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Load configuration with fallback to default
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        if !path.as_ref().exists() {
            tracing::info!(
                "Config file {} not found, using defaults",
                path.as_ref().display()
            );
            let mut config = Self::default();
            config.apply_env_overrides();
            return config;
        }

        Self::load_from_file(path).unwrap_or_else(|err| {
            tracing::warn!("Failed to load config: {:#}, using defaults", err);
            let mut config = Self::default();
            config.apply_env_overrides();
            config
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.interpreter.program.trim().is_empty() {
            anyhow::bail!("interpreter.program must not be empty");
        }

        if self.session.inactivity_timeout_secs == 0 {
            anyhow::bail!("session.inactivity_timeout_secs must be greater than 0");
        }

        if self.session.reap_interval_secs == 0 {
            anyhow::bail!("session.reap_interval_secs must be greater than 0");
        }

        if self.session.reap_interval_secs >= self.session.inactivity_timeout_secs {
            anyhow::bail!(
                "session.reap_interval_secs ({}) must be shorter than session.inactivity_timeout_secs ({})",
                self.session.reap_interval_secs,
                self.session.inactivity_timeout_secs
            );
        }

        if self.session.flush_interval_ms == 0 {
            anyhow::bail!("session.flush_interval_ms must be greater than 0");
        }

        if self.session.write_timeout_ms == 0 {
            anyhow::bail!("session.write_timeout_ms must be greater than 0");
        }

        if self.telegram.max_message_chars == 0
            || self.telegram.max_message_chars > MAX_MESSAGE_CHARS_LIMIT
        {
            anyhow::bail!(
                "telegram.max_message_chars must be between 1 and {}",
                MAX_MESSAGE_CHARS_LIMIT
            );
        }

        if self.telegram.request_timeout_secs <= self.telegram.poll_timeout_secs {
            anyhow::bail!("telegram.request_timeout_secs must exceed telegram.poll_timeout_secs");
        }

        if !self.sanitizer.code_prefix.starts_with('/') {
            anyhow::bail!("sanitizer.code_prefix must start with '/'");
        }

        Ok(())
    }

    /// Validate everything needed to actually run the bot
    pub fn validate_for_run(&self) -> Result<()> {
        self.validate()?;
        if self.telegram.token.trim().is_empty() {
            anyhow::bail!(
                "No bot token configured; set telegram.token, REPLBOT_TELEGRAM_TOKEN or --token"
            );
        }
        Ok(())
    }

    /// Display formatted configuration
    pub fn display(&self) -> Result<()> {
        let mut shown = self.clone();
        shown.telegram.token = mask_token(&self.telegram.token);
        let content = toml::to_string_pretty(&shown).context("Failed to serialize configuration")?;

        println!("{}", "Current configuration:".bold());
        println!("{}", content);
        Ok(())
    }

    /// Display configuration management help
    pub fn display_help() -> Result<()> {
        println!("{}", "Configuration management commands:".bold());
        println!("  replbot config show    - Show current configuration");
        println!("  replbot config reset   - Write the default configuration");
        Ok(())
    }

    /// Handle configuration command
    pub fn handle_command(
        action: &Option<crate::cli::ConfigAction>,
        config: &Config,
        config_file: &str,
    ) -> Result<()> {
        match action {
            Some(crate::cli::ConfigAction::Show) => {
                config.display()?;
            }
            Some(crate::cli::ConfigAction::Reset) => {
                let default_config = Config::default();
                default_config.save_to_file(config_file)?;
                println!(
                    "{} {}",
                    "Default configuration written to".green(),
                    config_file
                );
            }
            None => {
                Config::display_help()?;
            }
        }
        Ok(())
    }
}

fn parse_override<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

/// Hide all but the bot id part of a token
pub fn mask_token(token: &str) -> String {
    if token.is_empty() {
        return "<unset>".to_string();
    }
    match token.split_once(':') {
        Some((bot_id, _)) => format!("{}:****", bot_id),
        None => "****".to_string(),
    }
}
