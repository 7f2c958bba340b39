//! Command Line Interface module
//!
//! Implements the CLI commands and argument parsing for replbot.

use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser, Debug, Clone)]
#[command(name = "replbot")]
#[command(about = "Chat bot that runs an interactive interpreter per chat")]
#[command(
    long_about = "Keeps one interpreter subprocess per chat, forwards filtered commands to it and relays its output back to the chat"
)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file path
    #[arg(long, default_value = "config.toml")]
    pub config_file: String,

    /// Bot token (overrides the config file and REPLBOT_TELEGRAM_TOKEN)
    #[arg(long)]
    pub token: Option<String>,

    /// Inactivity timeout in seconds before a session is reaped
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone, Default, PartialEq)]
pub enum Commands {
    /// Run the bot
    #[default]
    Run,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Reset configuration to defaults
    Reset,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the actual command, using default if none provided
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or_default()
    }

    /// Adjust log level based on verbose flag
    pub fn effective_log_level(&self, config: &Config) -> String {
        if self.verbose {
            "debug".to_string()
        } else {
            self.log_level
                .clone()
                .unwrap_or_else(|| config.log_level.clone())
        }
    }

    /// Apply command line overrides, which win over file and environment
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(token) = &self.token {
            config.telegram.token = token.trim().to_string();
        }
        if let Some(timeout) = self.timeout {
            config.session.set_inactivity_timeout(timeout);
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(path) = &self.log_file {
            config.log.file_path = Some(path.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_run() {
        let cli = Cli::parse_from(["replbot"]);
        assert_eq!(cli.command(), Commands::Run);
        assert_eq!(cli.config_file, "config.toml");
    }

    #[test]
    fn test_config_subcommand() {
        let cli = Cli::parse_from(["replbot", "config", "show"]);
        assert_eq!(
            cli.command(),
            Commands::Config {
                action: Some(ConfigAction::Show)
            }
        );
    }

    #[test]
    fn test_overrides_apply() {
        let cli = Cli::parse_from([
            "replbot",
            "--token",
            "99:xyz",
            "--timeout",
            "600",
            "--log-file",
            "bot.log",
        ]);
        let mut config = Config::default();
        cli.apply_to(&mut config);

        assert_eq!(config.telegram.token, "99:xyz");
        assert_eq!(config.session.inactivity_timeout_secs, 600);
        assert_eq!(config.log.file_path.as_deref(), Some("bot.log"));
    }

    #[test]
    fn test_short_timeout_still_validates() {
        let cli = Cli::parse_from(["replbot", "--token", "1:x", "--timeout", "600"]);
        let mut config = Config::default();
        cli.apply_to(&mut config);

        assert_eq!(config.session.reap_interval_secs, 300);
        assert!(config.validate_for_run().is_ok());

        let cli = Cli::parse_from(["replbot", "--timeout", "7200"]);
        let mut config = Config::default();
        cli.apply_to(&mut config);
        assert_eq!(config.session.reap_interval_secs, 1800);
    }

    #[test]
    fn test_verbose_wins() {
        let cli = Cli::parse_from(["replbot", "-v", "--log-level", "warn"]);
        assert_eq!(cli.effective_log_level(&Config::default()), "debug");

        let cli = Cli::parse_from(["replbot"]);
        assert_eq!(cli.effective_log_level(&Config::default()), "info");
    }
}
