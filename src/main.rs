use colored::Colorize;
use replbot::{
    AppResult,
    bot::Bot,
    cli::{Cli, Commands},
    config::Config,
    init_logging,
};

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse_args();

    // Load configuration, then let command line flags win
    let mut config = Config::load_or_default(&cli.config_file);
    cli.apply_to(&mut config);

    // Initialize logging
    let _log_guard = init_logging(
        &cli.effective_log_level(&config),
        config.log.file_path.as_deref(),
    )?;

    tracing::debug!("CLI arguments: {:?}", cli);

    match cli.command() {
        Commands::Config { action } => {
            Config::handle_command(&action, &config, &cli.config_file)?;
        }
        Commands::Run => {
            tracing::info!("ReplBot starting...");
            let bot = match Bot::new(config) {
                Ok(bot) => bot,
                Err(e) => {
                    eprintln!("{} {:#}", "Error:".red().bold(), e);
                    std::process::exit(1);
                }
            };
            bot.run().await?;
        }
    }

    Ok(())
}
